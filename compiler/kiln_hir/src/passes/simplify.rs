//! Local type-driven rewriting.
//!
//! Each instruction is rewritten in isolation using its operands' types
//! and, for a few patterns, the instruction defining an operand. Rewrites
//! either forward the output to an existing register, replace the
//! instruction with a cheaper sequence, or prove the instruction always
//! fails and end the block in a `Deopt`.
//!
//! # Algorithm
//!
//! Blocks are visited in reverse postorder, so operands are usually
//! rewritten before their uses. One sweep is followed by unreachable-block
//! removal and type refinement; sweeps repeat until nothing changes or the
//! iteration limit is hit. Rewritten sequences reuse the original output
//! register (narrowing its type), so uses outside the block stay valid.
//!
//! The only rewrite that adds blocks is the type-attribute cache split for
//! attribute loads on type objects; it is skipped once the function has
//! grown by `simplify_new_block_limit` blocks.

use kiln_rt::{
    int_arith, ArgAnnotation, BinOp, CmpOp, CodeFlags, ConstValue, Name, Num, ObjRef, WatchKey,
};
use rustc_hash::FxHashMap;

use super::{refine_types, remove_unreachable_blocks, PassContext};
use crate::function::Function;
use crate::graph::rpo;
use crate::instr::{BlockId, HirConst, Instr, InstrKind, PrimKind, Reg};
use crate::types::{Type, TypeSpec};

/// Rewrite `func` to a fixed point of the local simplification rules.
pub fn simplify(func: &mut Function, cx: &PassContext<'_>) {
    let mut s = Simplifier {
        func,
        cx,
        subst: FxHashMap::default(),
        boxes: FxHashMap::default(),
        consts: FxHashMap::default(),
        new_blocks: 0,
    };
    let limit = cx.config.simplify_iteration_limit.max(1);
    let mut iterations = 0;
    while iterations < limit {
        iterations += 1;
        if !s.sweep() {
            break;
        }
    }
    tracing::debug!(
        function = %s.func.name,
        iterations,
        new_blocks = s.new_blocks,
        "simplified"
    );
}

enum Rewrite {
    Keep,
    /// The output is always equal to this register.
    Forward(Reg),
    Replace(Vec<Instr>),
    /// The instruction can never succeed.
    Deopt,
    SplitTypeAttrCache,
}

struct Simplifier<'f, 'p> {
    func: &'f mut Function,
    cx: &'f PassContext<'p>,
    subst: FxHashMap<Reg, Reg>,
    /// `PrimitiveBox` definitions: output -> (kind, source).
    boxes: FxHashMap<Reg, (PrimKind, Reg)>,
    /// `LoadConst` of object constants: output -> constant index.
    consts: FxHashMap<Reg, u32>,
    new_blocks: usize,
}

impl Simplifier<'_, '_> {
    fn sweep(&mut self) -> bool {
        self.subst.clear();
        self.index_defs();
        let mut changed = false;
        for b in rpo(self.func) {
            let mut next = Some(b);
            while let Some(blk) = next {
                let (c, cont) = self.simplify_block(blk);
                changed |= c;
                next = cont;
            }
        }
        self.func.replace_uses(&self.subst);
        changed |= remove_unreachable_blocks(self.func);
        changed |= refine_types(self.func);
        changed
    }

    fn index_defs(&mut self) {
        self.boxes.clear();
        self.consts.clear();
        let defs: Vec<InstrKind> = self
            .func
            .blocks()
            .flat_map(|b| b.instrs.iter())
            .filter(|i| matches!(i.kind, InstrKind::PrimitiveBox { .. } | InstrKind::LoadConst { .. }))
            .map(|i| i.kind.clone())
            .collect();
        for kind in &defs {
            self.note_def(kind);
        }
    }

    fn note_def(&mut self, kind: &InstrKind) {
        match *kind {
            InstrKind::PrimitiveBox { dst, src, kind } => {
                self.boxes.insert(dst, (kind, src));
            }
            InstrKind::LoadConst {
                dst,
                value: HirConst::Object(i),
            } => {
                self.consts.insert(dst, i);
            }
            _ => {}
        }
    }

    fn resolve(&self, mut r: Reg) -> Reg {
        while let Some(&next) = self.subst.get(&r) {
            r = next;
        }
        r
    }

    fn ty(&self, r: Reg) -> Type {
        self.func.reg_type(r)
    }

    fn tmp(&mut self, ty: Type) -> Reg {
        self.func.new_reg(ty)
    }

    /// Narrow `r` to `ty` without ever widening it.
    fn narrow(&mut self, r: Reg, ty: Type) {
        let old = self.func.reg_type(r);
        self.func.set_reg_type(r, old & ty);
    }

    fn simplify_block(&mut self, b: BlockId) -> (bool, Option<BlockId>) {
        let instrs = std::mem::take(&mut self.func.block_mut(b).instrs);
        let mut out = Vec::with_capacity(instrs.len());
        let mut changed = false;
        let mut rest = instrs.into_iter();
        while let Some(mut instr) = rest.next() {
            instr.map_uses(|r| *r = self.resolve(*r));
            match self.simplify_instr(&instr) {
                Rewrite::Keep => {
                    self.note_def(&instr.kind);
                    out.push(instr);
                }
                Rewrite::Forward(r) => {
                    changed = true;
                    if let Some(dst) = instr.output() {
                        self.subst.insert(dst, r);
                    }
                }
                Rewrite::Replace(seq) => {
                    changed = true;
                    for i in &seq {
                        self.note_def(&i.kind);
                    }
                    out.extend(seq);
                }
                Rewrite::Deopt => {
                    let deopt = Instr {
                        kind: InstrKind::Deopt,
                        bc_offset: instr.bc_offset,
                        deopt: instr.deopt,
                    };
                    let block = self.func.block_mut(b);
                    block.instrs = out;
                    let old = std::mem::replace(&mut block.term, deopt);
                    for succ in old.kind.successors() {
                        self.func.remove_phi_inputs(succ, b);
                    }
                    return (true, None);
                }
                Rewrite::SplitTypeAttrCache => {
                    let join = self.split_type_attr_cache(b, out, instr, rest.collect());
                    return (true, Some(join));
                }
            }
        }
        self.func.block_mut(b).instrs = out;
        changed |= self.simplify_term(b);
        (changed, None)
    }

    fn simplify_term(&mut self, b: BlockId) -> bool {
        let mut term = std::mem::replace(
            &mut self.func.block_mut(b).term,
            Instr::new(InstrKind::Unreachable),
        );
        term.map_uses(|r| *r = self.resolve(*r));
        let mut changed = false;
        if let InstrKind::CondBranch {
            cond,
            if_true,
            if_false,
        } = term.kind
        {
            let taken = if if_true == if_false {
                Some(if_true)
            } else {
                self.ty(cond)
                    .is_subtype(Type::CBOOL)
                    .then(|| self.ty(cond).bool_value())
                    .flatten()
                    .map(|v| if v { if_true } else { if_false })
            };
            if let Some(target) = taken {
                if if_true != if_false {
                    let dropped = if target == if_true { if_false } else { if_true };
                    self.func.remove_phi_inputs(dropped, b);
                }
                term.kind = InstrKind::Branch { target };
                term.deopt = None;
                changed = true;
            }
        }
        self.func.block_mut(b).term = term;
        changed
    }

    // ── Rules ──────────────────────────────────────────────────────

    fn simplify_instr(&mut self, instr: &Instr) -> Rewrite {
        match instr.kind {
            InstrKind::CheckVar { src, .. }
            | InstrKind::CheckFreevar { src, .. }
            | InstrKind::CheckField { src, .. } => {
                if self.ty(src).maybe_null() {
                    Rewrite::Keep
                } else {
                    Rewrite::Forward(src)
                }
            }
            InstrKind::GuardType { src, ty, .. } => {
                let actual = self.ty(src);
                if actual.is_subtype(ty) {
                    Rewrite::Forward(src)
                } else if !actual.could_be(ty) && instr.deopt.is_some() {
                    Rewrite::Deopt
                } else {
                    Rewrite::Keep
                }
            }
            InstrKind::GuardIs { src, target, .. } => match self.ty(src).object_spec() {
                Some(known) if known == target => Rewrite::Forward(src),
                Some(_) if instr.deopt.is_some() => Rewrite::Deopt,
                _ => Rewrite::Keep,
            },
            InstrKind::IsTruthy { dst, src } => self.simplify_truthy(dst, src),
            InstrKind::PrimitiveNot { dst, src } => match self.ty(src).bool_value() {
                Some(v) if self.ty(src).is_subtype(Type::CBOOL) => self.load_bool(dst, !v),
                _ => Rewrite::Keep,
            },
            InstrKind::BinaryOp {
                dst,
                op,
                left,
                right,
            } => self.simplify_binary(instr, dst, op, left, right),
            InstrKind::IntBinaryOp {
                dst,
                op,
                left,
                right,
            } => match (self.ty(left).int_const(), self.ty(right).int_const()) {
                (Some(a), Some(b)) => match int_arith(op, a, b) {
                    Ok(Num::Int(v)) => {
                        self.narrow(dst, Type::cint64_const(v));
                        Rewrite::Replace(vec![at(
                            instr,
                            InstrKind::LoadConst {
                                dst,
                                value: HirConst::Int64(v),
                            },
                        )])
                    }
                    _ => Rewrite::Keep,
                },
                _ => Rewrite::Keep,
            },
            InstrKind::PrimitiveUnbox { dst, src, kind } => self.simplify_unbox(instr, dst, src, kind),
            InstrKind::Compare {
                dst,
                op,
                left,
                right,
            } => self.simplify_compare(instr, dst, op, left, right),
            InstrKind::BinarySubscr {
                dst,
                container,
                index,
            } => self.simplify_subscr(instr, dst, container, index),
            InstrKind::LoadAttr { dst, obj, name } => {
                let obj_ty = self.ty(obj);
                if let Some((class, index)) = self.slot_of(obj_ty, name) {
                    let field = self.tmp(Type::OPT_OBJECT);
                    return Rewrite::Replace(vec![
                        with_deopt(instr, InstrKind::DeoptPatchpoint { key: WatchKey::Type(class) }),
                        at(instr, InstrKind::LoadField { dst: field, obj, index, name }),
                        with_deopt(instr, InstrKind::CheckField { dst, src: field, name }),
                    ]);
                }
                if obj_ty.is_subtype(Type::TYPE_OBJ)
                    && instr.deopt.is_some()
                    && self.new_blocks + 3 <= self.cx.config.simplify_new_block_limit
                {
                    return Rewrite::SplitTypeAttrCache;
                }
                Rewrite::Keep
            }
            InstrKind::StoreAttr { obj, value, name } => {
                match self.slot_of(self.ty(obj), name) {
                    Some((class, index)) => {
                        Rewrite::Replace(vec![
                            with_deopt(instr, InstrKind::DeoptPatchpoint { key: WatchKey::Type(class) }),
                            at(instr, InstrKind::StoreField { obj, value, index, name }),
                        ])
                    }
                    None => Rewrite::Keep,
                }
            }
            InstrKind::VectorCall { dst, func, ref args } => {
                self.simplify_static_call(instr, dst, func, args)
            }
            _ => Rewrite::Keep,
        }
    }

    fn load_bool(&mut self, dst: Reg, v: bool) -> Rewrite {
        self.narrow(dst, Type::cbool_const(v));
        Rewrite::Replace(vec![Instr::new(InstrKind::LoadConst {
            dst,
            value: HirConst::Bool(v),
        })])
    }

    /// Load an object constant into `dst`.
    fn load_object(&mut self, instr: &Instr, dst: Reg, value: ConstValue) -> Rewrite {
        self.narrow(dst, Type::of_const(&value));
        let idx = self.func.add_const(value);
        Rewrite::Replace(vec![at(
            instr,
            InstrKind::LoadConst {
                dst,
                value: HirConst::Object(idx),
            },
        )])
    }

    fn simplify_truthy(&mut self, dst: Reg, src: Reg) -> Rewrite {
        let ty = self.ty(src);
        if ty.is_subtype(Type::NONE_TYPE) && !ty.is_bottom() {
            return self.load_bool(dst, false);
        }
        if ty.is_subtype(Type::BOOL) {
            if let Some(v) = ty.bool_value() {
                return self.load_bool(dst, v);
            }
        }
        if ty.is_subtype(Type::LONG) {
            if let Some(v) = ty.int_const() {
                return self.load_bool(dst, v != 0);
            }
        }
        if let Some(&(PrimKind::Bool, raw)) = self.boxes.get(&src) {
            return Rewrite::Forward(raw);
        }
        if ty.is_subtype(Type::BOOL) && !ty.is_bottom() {
            return Rewrite::Replace(vec![Instr::new(InstrKind::PrimitiveUnbox {
                dst,
                src,
                kind: PrimKind::Bool,
            })]);
        }
        Rewrite::Keep
    }

    fn simplify_unbox(&mut self, instr: &Instr, dst: Reg, src: Reg, kind: PrimKind) -> Rewrite {
        if let Some(&(boxed_kind, raw)) = self.boxes.get(&src) {
            if boxed_kind == kind {
                return Rewrite::Forward(raw);
            }
        }
        let ty = self.ty(src);
        let value = match (kind, ty.spec) {
            (PrimKind::Int64, TypeSpec::Int(v)) if ty.is_subtype(Type::LONG) => {
                self.narrow(dst, Type::cint64_const(v));
                HirConst::Int64(v)
            }
            (PrimKind::Bool, TypeSpec::Bool(v)) if ty.is_subtype(Type::BOOL) => {
                self.narrow(dst, Type::cbool_const(v));
                HirConst::Bool(v)
            }
            _ => return Rewrite::Keep,
        };
        Rewrite::Replace(vec![at(instr, InstrKind::LoadConst { dst, value })])
    }

    fn simplify_binary(&mut self, instr: &Instr, dst: Reg, op: BinOp, left: Reg, right: Reg) -> Rewrite {
        let (lt, rt) = (self.ty(left), self.ty(right));
        if !lt.is_subtype(Type::LONG) || !rt.is_subtype(Type::LONG) || lt.is_bottom() || rt.is_bottom() {
            return Rewrite::Keep;
        }
        if let (Some(a), Some(b)) = (lt.int_const(), rt.int_const()) {
            return match int_arith(op, a, b) {
                Ok(Num::Int(v)) => self.load_object(instr, dst, ConstValue::Int(v)),
                Ok(Num::Float(v)) => self.load_object(instr, dst, ConstValue::Float(v)),
                // Leave the raise to run time.
                Err(_) => Rewrite::Keep,
            };
        }
        if op == BinOp::TrueDiv {
            self.narrow(dst, Type::FLOAT);
            return Rewrite::Replace(vec![Instr {
                kind: InstrKind::LongBinaryOp {
                    dst,
                    op,
                    left,
                    right,
                },
                bc_offset: instr.bc_offset,
                deopt: instr.deopt.clone(),
            }]);
        }
        let (ul, ur) = (self.tmp(Type::CINT64), self.tmp(Type::CINT64));
        let result = self.tmp(Type::CINT64);
        self.narrow(dst, Type::LONG);
        Rewrite::Replace(vec![
            at(instr, InstrKind::PrimitiveUnbox { dst: ul, src: left, kind: PrimKind::Int64 }),
            at(instr, InstrKind::PrimitiveUnbox { dst: ur, src: right, kind: PrimKind::Int64 }),
            with_deopt(
                instr,
                InstrKind::IntBinaryOp {
                    dst: result,
                    op,
                    left: ul,
                    right: ur,
                },
            ),
            at(instr, InstrKind::PrimitiveBox { dst, src: result, kind: PrimKind::Int64 }),
        ])
    }

    fn simplify_compare(&mut self, instr: &Instr, dst: Reg, op: CmpOp, left: Reg, right: Reg) -> Rewrite {
        if matches!(op, CmpOp::Is | CmpOp::IsNot) {
            return Rewrite::Keep;
        }
        let (lt, rt) = (self.ty(left), self.ty(right));
        if !lt.is_subtype(Type::LONG) || !rt.is_subtype(Type::LONG) || lt.is_bottom() || rt.is_bottom() {
            return Rewrite::Keep;
        }
        if let (Some(a), Some(b)) = (lt.int_const(), rt.int_const()) {
            return self.load_object(instr, dst, ConstValue::Bool(op.eval_ord(a.cmp(&b))));
        }
        let (ul, ur) = (self.tmp(Type::CINT64), self.tmp(Type::CINT64));
        let result = self.tmp(Type::CBOOL);
        self.narrow(dst, Type::BOOL);
        Rewrite::Replace(vec![
            at(instr, InstrKind::PrimitiveUnbox { dst: ul, src: left, kind: PrimKind::Int64 }),
            at(instr, InstrKind::PrimitiveUnbox { dst: ur, src: right, kind: PrimKind::Int64 }),
            at(
                instr,
                InstrKind::PrimitiveCompare {
                    dst: result,
                    op,
                    left: ul,
                    right: ur,
                },
            ),
            at(instr, InstrKind::PrimitiveBox { dst, src: result, kind: PrimKind::Bool }),
        ])
    }

    fn simplify_subscr(&mut self, instr: &Instr, dst: Reg, container: Reg, index: Reg) -> Rewrite {
        let (ct, it) = (self.ty(container), self.ty(index));
        if !ct.is_subtype(Type::TUPLE) || !it.is_subtype(Type::LONG) || ct.is_bottom() || it.is_bottom() {
            return Rewrite::Keep;
        }
        if let (Some(&c), Some(i)) = (self.consts.get(&container), it.int_const()) {
            if let Some(ConstValue::Tuple(items)) = self.func.consts.get(c as usize) {
                let len = items.len() as i64;
                let norm = if i < 0 { i + len } else { i };
                if (0..len).contains(&norm) {
                    let item = items[norm as usize].clone();
                    return self.load_object(instr, dst, item);
                }
            }
        }
        let raw = self.tmp(Type::CINT64);
        let checked = self.tmp(Type::CINT64);
        Rewrite::Replace(vec![
            at(instr, InstrKind::PrimitiveUnbox { dst: raw, src: index, kind: PrimKind::Int64 }),
            with_deopt(
                instr,
                InstrKind::CheckSequenceBounds {
                    dst: checked,
                    seq: container,
                    index: raw,
                },
            ),
            at(
                instr,
                InstrKind::LoadTupleItem {
                    dst,
                    tuple: container,
                    index: checked,
                },
            ),
        ])
    }

    /// Class and slot index of `name` on an exact user-class instance type.
    fn slot_of(&self, ty: Type, name: Name) -> Option<(ObjRef, u32)> {
        let class = ty.exact_class()?;
        if !ty.is_subtype(Type::exact_instance(class)) {
            return None;
        }
        let index = self.cx.pre.class_info(class)?.slot_index(name)?;
        Some((class, index))
    }

    /// The type a static callee expects for an annotation.
    fn static_param_type(&self, ann: ArgAnnotation) -> Option<Type> {
        match ann {
            ArgAnnotation::Class(name) => {
                let g = self.cx.pre.global(name)?;
                self.cx.pre.class_info(g.value)?;
                Some(Type::exact_instance(g.value))
            }
            other => Some(Type::from_annotation(other, None)),
        }
    }

    fn simplify_static_call(&mut self, instr: &Instr, dst: Reg, callee: Reg, args: &[Reg]) -> Rewrite {
        let Some(target) = self.ty(callee).object_spec() else {
            return Rewrite::Keep;
        };
        let Some(code) = self.cx.pre.function_code(target).cloned() else {
            return Rewrite::Keep;
        };
        if !code.is_static() || code.flags.contains(CodeFlags::VARARGS) || code.argcount != args.len() {
            return Rewrite::Keep;
        }
        let mut want = Vec::with_capacity(args.len());
        for i in 0..args.len() {
            let ann = code.arg_types.get(i).copied().unwrap_or_default();
            let Some(ty) = self.static_param_type(ann) else {
                return Rewrite::Keep;
            };
            want.push(ty);
        }
        let Some(ret) = self.static_param_type(code.return_type) else {
            return Rewrite::Keep;
        };

        let mut seq = Vec::new();
        let mut passed = Vec::with_capacity(args.len());
        for (&arg, &ty) in args.iter().zip(&want) {
            passed.push(self.coerce_arg(instr, arg, ty, &mut seq));
        }
        let call = |dst| Instr {
            kind: InstrKind::InvokeStaticFunction {
                dst,
                target,
                args: passed.clone(),
                ret,
            },
            bc_offset: instr.bc_offset,
            deopt: instr.deopt.clone(),
        };
        match PrimKind::of(ret) {
            Some(kind) => {
                let raw = self.tmp(ret);
                seq.push(call(raw));
                self.narrow(dst, kind.boxed_type());
                seq.push(at(instr, InstrKind::PrimitiveBox { dst, src: raw, kind }));
            }
            None => {
                self.narrow(dst, ret);
                seq.push(call(dst));
            }
        }
        Rewrite::Replace(seq)
    }

    /// Convert `arg` to what a static parameter of type `want` receives.
    fn coerce_arg(&mut self, call: &Instr, arg: Reg, want: Type, seq: &mut Vec<Instr>) -> Reg {
        let guard = |this: &mut Self, seq: &mut Vec<Instr>, ty: Type| {
            if this.ty(arg).is_subtype(ty) {
                return arg;
            }
            let g = this.tmp(ty);
            let mut instr = with_deopt(call, InstrKind::GuardType { dst: g, src: arg, ty });
            if let Some(d) = &mut instr.deopt {
                d.guilty = Some(arg);
            }
            seq.push(instr);
            g
        };
        match PrimKind::of(want) {
            Some(kind) => {
                let boxed = guard(self, seq, kind.boxed_type());
                let raw = self.tmp(kind.unboxed_type());
                seq.push(at(call, InstrKind::PrimitiveUnbox { dst: raw, src: boxed, kind }));
                raw
            }
            None if want == Type::OBJECT => arg,
            None => guard(self, seq, want),
        }
    }

    // ── Type attribute caches ──────────────────────────────────────

    /// Replace `LoadAttr` on a type object with an inline cache probe:
    ///
    /// ```text
    /// b:    hit = CheckTypeAttrCache obj     fast: x = LoadTypeAttrCacheItem
    ///       CondBranch hit, fast, slow       slow: y = FillTypeAttrCache obj
    /// join: dst = Phi (fast, x), (slow, y); <rest of b>
    /// ```
    fn split_type_attr_cache(&mut self, b: BlockId, head: Vec<Instr>, load: Instr, tail: Vec<Instr>) -> BlockId {
        let InstrKind::LoadAttr { dst, obj, name } = load.kind else {
            unreachable!("split requested for a non-LoadAttr");
        };
        let cache = self.func.num_attr_caches;
        self.func.num_attr_caches += 1;
        self.new_blocks += 3;

        let fast = self.func.new_block();
        let slow = self.func.new_block();
        let join = self.func.new_block();
        let old_term = std::mem::replace(&mut self.func.block_mut(b).term, Instr::new(InstrKind::Unreachable));
        for succ in old_term.kind.successors() {
            self.func.retarget_phis(succ, b, join);
        }

        let hit = self.tmp(Type::CBOOL);
        let mut head = head;
        head.push(Instr::at(
            InstrKind::CheckTypeAttrCache {
                dst: hit,
                receiver: obj,
                cache,
            },
            load.bc_offset,
        ));
        let block = self.func.block_mut(b);
        block.instrs = head;
        block.term = Instr::at(
            InstrKind::CondBranch {
                cond: hit,
                if_true: fast,
                if_false: slow,
            },
            load.bc_offset,
        );

        let cached = self.tmp(Type::OBJECT);
        self.func.push(
            fast,
            Instr::at(InstrKind::LoadTypeAttrCacheItem { dst: cached, cache }, load.bc_offset),
        );
        self.func
            .set_term(fast, Instr::at(InstrKind::Branch { target: join }, load.bc_offset));

        let filled = self.tmp(Type::OBJECT);
        self.func.push(
            slow,
            Instr {
                kind: InstrKind::FillTypeAttrCache {
                    dst: filled,
                    receiver: obj,
                    name,
                    cache,
                },
                bc_offset: load.bc_offset,
                deopt: load.deopt,
            },
        );
        self.func
            .set_term(slow, Instr::at(InstrKind::Branch { target: join }, load.bc_offset));

        let block = self.func.block_mut(join);
        block.instrs = std::iter::once(Instr::new(InstrKind::Phi {
            dst,
            inputs: vec![(fast, cached), (slow, filled)],
        }))
        .chain(tail)
        .collect();
        block.term = old_term;
        join
    }
}

/// A new instruction at `like`'s bytecode offset.
fn at(like: &Instr, kind: InstrKind) -> Instr {
    Instr::at(kind, like.bc_offset)
}

/// A new instruction sharing `like`'s deopt metadata.
fn with_deopt(like: &Instr, kind: InstrKind) -> Instr {
    Instr {
        kind,
        bc_offset: like.bc_offset,
        deopt: like.deopt.clone(),
    }
}

#[cfg(test)]
mod tests;
