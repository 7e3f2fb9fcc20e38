//! Memory effects of HIR instructions.
//!
//! Effects are a pure function of an instruction's [`Opcode`] and operand
//! count, so every pass sees the same answer and new opcodes cannot be
//! added without classifying them: the matches here are exhaustive.
//!
//! - **Output**: none, a new owned reference, or a reference borrowed from
//!   some memory region (its *support*). Borrowed values with empty support
//!   are kept alive by something outside the function for its whole
//!   execution.
//! - **Stolen operands**: references whose ownership moves into the
//!   instruction.
//! - **May store**: regions whose contents the instruction may change.

use std::fmt;

use bitflags::bitflags;

use crate::instr::{DeoptReason, Instr, Opcode};

bitflags! {
    /// Disjoint memory regions.
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
    pub struct AliasClass: u8 {
        const GLOBAL = 1 << 0;
        const OBJECT_FIELDS = 1 << 1;
        const TYPE_ATTR_CACHE = 1 << 2;
        const CELLS = 1 << 3;
        const FUNC_ATTRS = 1 << 4;
        /// Shadow frames and reference counts.
        const OTHER = 1 << 5;
    }
}

impl AliasClass {
    pub const EMPTY: AliasClass = AliasClass::empty();
    pub const ANY: AliasClass = AliasClass::all();
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OutputEffect {
    None,
    Owned,
    Borrowed(AliasClass),
}

/// Bitset over operand positions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct StolenMask(u64);

impl StolenMask {
    pub const NONE: StolenMask = StolenMask(0);

    pub fn single(operand: usize) -> Self {
        StolenMask(1 << operand)
    }

    /// The first `n` operands.
    pub fn all(n: usize) -> Self {
        if n >= 64 {
            StolenMask(u64::MAX)
        } else {
            StolenMask((1u64 << n) - 1)
        }
    }

    pub fn contains(self, operand: usize) -> bool {
        operand < 64 && self.0 & (1 << operand) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for StolenMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StolenMask({:#b})", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MemoryEffects {
    pub output: OutputEffect,
    pub stolen: StolenMask,
    pub may_store: AliasClass,
}

impl MemoryEffects {
    const fn new(output: OutputEffect, stolen: StolenMask, may_store: AliasClass) -> Self {
        MemoryEffects {
            output,
            stolen,
            may_store,
        }
    }

    const fn pure(output: OutputEffect) -> Self {
        Self::new(output, StolenMask::NONE, AliasClass::EMPTY)
    }
}

/// Effects of an instruction with `num_operands` operands.
pub fn memory_effects_of(op: Opcode, num_operands: usize) -> MemoryEffects {
    use OutputEffect::{Borrowed, None as NoOutput, Owned};

    match op {
        Opcode::LoadArg | Opcode::LoadConst | Opcode::LoadCurrentFunc => {
            MemoryEffects::pure(Borrowed(AliasClass::EMPTY))
        }
        // Passthroughs borrow from whatever their source does; refcount
        // insertion resolves them to the source register.
        Opcode::Assign
        | Opcode::GuardType
        | Opcode::GuardIs
        | Opcode::CheckVar
        | Opcode::CheckFreevar
        | Opcode::CheckField => MemoryEffects::pure(Borrowed(AliasClass::EMPTY)),
        Opcode::Phi => MemoryEffects::pure(Owned),

        Opcode::CheckSequenceBounds
        | Opcode::CheckTypeAttrCache
        | Opcode::IntBinaryOp
        | Opcode::PrimitiveCompare
        | Opcode::PrimitiveNot
        | Opcode::PrimitiveUnbox => MemoryEffects::pure(NoOutput),

        Opcode::LoadGlobalCached => MemoryEffects::pure(Borrowed(AliasClass::GLOBAL)),
        Opcode::LoadField => MemoryEffects::pure(Borrowed(AliasClass::OBJECT_FIELDS)),
        Opcode::StoreField => MemoryEffects::new(
            NoOutput,
            StolenMask::single(1),
            AliasClass::OBJECT_FIELDS.union(AliasClass::OTHER),
        ),
        Opcode::LoadTypeAttrCacheItem => {
            MemoryEffects::pure(Borrowed(AliasClass::TYPE_ATTR_CACHE))
        }
        Opcode::LoadTupleItem => MemoryEffects::pure(Borrowed(AliasClass::OBJECT_FIELDS)),
        Opcode::LoadFreevar => MemoryEffects::pure(Borrowed(AliasClass::CELLS)),
        Opcode::StoreFreevar => MemoryEffects::new(
            NoOutput,
            StolenMask::single(0),
            AliasClass::CELLS.union(AliasClass::OTHER),
        ),
        Opcode::LoadFunctionCode => MemoryEffects::pure(Borrowed(AliasClass::FUNC_ATTRS)),

        Opcode::LongBinaryOp | Opcode::PrimitiveBox => MemoryEffects::pure(Owned),

        Opcode::MakeTuple | Opcode::MakeList => {
            MemoryEffects::new(Owned, StolenMask::all(num_operands), AliasClass::EMPTY)
        }

        Opcode::DeoptPatchpoint => MemoryEffects::pure(NoOutput),
        Opcode::BeginInlinedFunction
        | Opcode::EndInlinedFunction
        | Opcode::UpdatePrevInstr
        | Opcode::Incref
        | Opcode::Decref
        | Opcode::XDecref => MemoryEffects::new(NoOutput, StolenMask::NONE, AliasClass::OTHER),

        Opcode::Branch | Opcode::CondBranch | Opcode::Deopt | Opcode::Unreachable => {
            MemoryEffects::pure(NoOutput)
        }
        Opcode::Return | Opcode::Raise => {
            MemoryEffects::new(NoOutput, StolenMask::single(0), AliasClass::EMPTY)
        }

        // Anything may run: every location may be written.
        Opcode::StoreGlobal | Opcode::StoreAttr | Opcode::CompareBool | Opcode::IsTruthy => {
            MemoryEffects::new(NoOutput, StolenMask::NONE, AliasClass::ANY)
        }
        Opcode::LoadGlobal
        | Opcode::LoadAttr
        | Opcode::FillTypeAttrCache
        | Opcode::LoadMethod
        | Opcode::CallMethod
        | Opcode::CallStatic
        | Opcode::VectorCall
        | Opcode::InvokeStaticFunction
        | Opcode::BinaryOp
        | Opcode::UnaryNegative
        | Opcode::Compare
        | Opcode::BinarySubscr => MemoryEffects::new(Owned, StolenMask::NONE, AliasClass::ANY),
    }
}

pub fn memory_effects(instr: &Instr) -> MemoryEffects {
    memory_effects_of(instr.opcode(), instr.kind.num_operands())
}

/// May run user code, and therefore read or write anything.
pub fn has_arbitrary_execution(op: Opcode) -> bool {
    match op {
        Opcode::LoadGlobal
        | Opcode::StoreGlobal
        | Opcode::LoadAttr
        | Opcode::StoreAttr
        | Opcode::FillTypeAttrCache
        | Opcode::LoadMethod
        | Opcode::CallMethod
        | Opcode::CallStatic
        | Opcode::VectorCall
        | Opcode::InvokeStaticFunction
        | Opcode::BinaryOp
        | Opcode::UnaryNegative
        | Opcode::Compare
        | Opcode::CompareBool
        | Opcode::IsTruthy
        | Opcode::BinarySubscr => true,
        Opcode::LoadArg
        | Opcode::LoadConst
        | Opcode::LoadCurrentFunc
        | Opcode::Assign
        | Opcode::Phi
        | Opcode::GuardType
        | Opcode::GuardIs
        | Opcode::CheckVar
        | Opcode::CheckFreevar
        | Opcode::CheckField
        | Opcode::CheckSequenceBounds
        | Opcode::LoadGlobalCached
        | Opcode::LoadField
        | Opcode::StoreField
        | Opcode::LoadTypeAttrCacheItem
        | Opcode::CheckTypeAttrCache
        | Opcode::LongBinaryOp
        | Opcode::IntBinaryOp
        | Opcode::PrimitiveCompare
        | Opcode::PrimitiveNot
        | Opcode::PrimitiveBox
        | Opcode::PrimitiveUnbox
        | Opcode::MakeTuple
        | Opcode::MakeList
        | Opcode::LoadTupleItem
        | Opcode::LoadFreevar
        | Opcode::StoreFreevar
        | Opcode::LoadFunctionCode
        | Opcode::DeoptPatchpoint
        | Opcode::BeginInlinedFunction
        | Opcode::EndInlinedFunction
        | Opcode::UpdatePrevInstr
        | Opcode::Incref
        | Opcode::Decref
        | Opcode::XDecref
        | Opcode::Branch
        | Opcode::CondBranch
        | Opcode::Return
        | Opcode::Raise
        | Opcode::Deopt
        | Opcode::Unreachable => false,
    }
}

/// Why an instruction of this kind deopts, or `None` if it never does.
pub fn deopt_reason(op: Opcode) -> Option<DeoptReason> {
    match op {
        Opcode::GuardType
        | Opcode::GuardIs
        | Opcode::CheckSequenceBounds
        | Opcode::IntBinaryOp
        | Opcode::DeoptPatchpoint
        | Opcode::Deopt => Some(DeoptReason::GuardFailure),
        Opcode::CheckVar => Some(DeoptReason::UnboundLocal),
        Opcode::CheckFreevar => Some(DeoptReason::UnboundFreevar),
        Opcode::CheckField => Some(DeoptReason::UnhandledNullField),
        Opcode::Raise => Some(DeoptReason::Raise),
        Opcode::LongBinaryOp
        | Opcode::LoadGlobal
        | Opcode::StoreGlobal
        | Opcode::LoadAttr
        | Opcode::StoreAttr
        | Opcode::FillTypeAttrCache
        | Opcode::LoadMethod
        | Opcode::CallMethod
        | Opcode::CallStatic
        | Opcode::VectorCall
        | Opcode::InvokeStaticFunction
        | Opcode::BinaryOp
        | Opcode::UnaryNegative
        | Opcode::Compare
        | Opcode::CompareBool
        | Opcode::IsTruthy
        | Opcode::BinarySubscr => Some(DeoptReason::UnhandledException),
        Opcode::LoadArg
        | Opcode::LoadConst
        | Opcode::LoadCurrentFunc
        | Opcode::Assign
        | Opcode::Phi
        | Opcode::LoadGlobalCached
        | Opcode::LoadField
        | Opcode::StoreField
        | Opcode::LoadTypeAttrCacheItem
        | Opcode::CheckTypeAttrCache
        | Opcode::PrimitiveCompare
        | Opcode::PrimitiveNot
        | Opcode::PrimitiveBox
        | Opcode::PrimitiveUnbox
        | Opcode::MakeTuple
        | Opcode::MakeList
        | Opcode::LoadTupleItem
        | Opcode::LoadFreevar
        | Opcode::StoreFreevar
        | Opcode::LoadFunctionCode
        | Opcode::BeginInlinedFunction
        | Opcode::EndInlinedFunction
        | Opcode::UpdatePrevInstr
        | Opcode::Incref
        | Opcode::Decref
        | Opcode::XDecref
        | Opcode::Branch
        | Opcode::CondBranch
        | Opcode::Return
        | Opcode::Unreachable => None,
    }
}

#[cfg(test)]
mod tests;
