use pretty_assertions::assert_eq;

use super::*;

/// Every opcode is classified by all three tables.
#[test]
fn classification_is_total() {
    for &op in Opcode::ALL {
        for n in 0..4 {
            let _ = memory_effects_of(op, n);
        }
        let _ = has_arbitrary_execution(op);
        let _ = deopt_reason(op);
    }
}

#[test]
fn arbitrary_execution_may_store_anything_and_may_deopt() {
    for &op in Opcode::ALL.iter().filter(|&&op| has_arbitrary_execution(op)) {
        assert_eq!(memory_effects_of(op, 2).may_store, AliasClass::ANY, "{}", op.name());
        assert!(deopt_reason(op).is_some(), "{} runs user code but cannot deopt", op.name());
    }
}

#[test]
fn only_arbitrary_execution_may_store_anything() {
    for &op in Opcode::ALL {
        let anything = memory_effects_of(op, 2).may_store == AliasClass::ANY;
        assert_eq!(anything, has_arbitrary_execution(op), "{}", op.name());
    }
    for op in [Opcode::StoreGlobal, Opcode::StoreAttr, Opcode::CompareBool, Opcode::IsTruthy] {
        assert_eq!(memory_effects_of(op, 2).output, OutputEffect::None, "{}", op.name());
    }
    assert_eq!(memory_effects_of(Opcode::VectorCall, 3).output, OutputEffect::Owned);
}

/// A stolen reference is gone before any deopt could need it; only `Raise`
/// hands its operand to the runtime and then deopts.
#[test]
fn stealing_instructions_do_not_deopt_with_the_stolen_value() {
    for &op in Opcode::ALL {
        let effects = memory_effects_of(op, 3);
        if !effects.stolen.is_empty() && op != Opcode::Raise {
            assert_eq!(deopt_reason(op), None, "{}", op.name());
        }
    }
}

#[test]
fn variadic_steals_depend_on_operand_count() {
    let three = memory_effects_of(Opcode::MakeList, 3);
    assert!(three.stolen.contains(0));
    assert!(three.stolen.contains(2));
    assert!(!three.stolen.contains(3));
    assert!(memory_effects_of(Opcode::MakeTuple, 0).stolen.is_empty());
}

#[test]
fn loads_with_support_are_borrowed() {
    assert_eq!(
        memory_effects_of(Opcode::LoadGlobalCached, 0).output,
        OutputEffect::Borrowed(AliasClass::GLOBAL)
    );
    assert_eq!(
        memory_effects_of(Opcode::LoadConst, 0).output,
        OutputEffect::Borrowed(AliasClass::EMPTY)
    );
    assert_eq!(memory_effects_of(Opcode::VectorCall, 2).output, OutputEffect::Owned);
    assert_eq!(memory_effects_of(Opcode::StoreField, 2).stolen, StolenMask::single(1));
}

#[test]
fn terminators_are_classified_as_terminators() {
    let terms: Vec<_> = Opcode::ALL.iter().filter(|op| op.is_terminator()).collect();
    assert_eq!(terms.len(), 6);
    assert!(Opcode::ALL.iter().all(|op| !op.is_passthrough() || !op.is_terminator()));
}
