//! Bytecode to HIR translation.
//!
//! The builder symbolically executes each reachable bytecode block with an
//! operand stack of registers. Its output is *not* in SSA form: every
//! local and every operand-stack slot live across a block boundary is a
//! fixed "variable register" that may be assigned many times. SSAify runs
//! next and renames them.
//!
//! Every instruction that can deopt receives a frame state describing the
//! interpreter frame *before* the bytecode instruction it came from, so the
//! interpreter resumes by re-executing that instruction.

use std::sync::Arc;

use kiln_rt::{ArgAnnotation, CodeFlags, CodeUnit, ConstValue, Name, Op, WatchKey};
use rustc_hash::FxHashMap;

use crate::error::BuildError;
use crate::function::Function;
use crate::instr::{BlockId, FrameState, HirConst, Instr, InstrKind, PrimKind, Reg};
use crate::preload::Preloader;
use crate::types::Type;

/// Build the HIR of the preloaded function.
///
/// # Errors
///
/// Returns a [`BuildError`] when the code unit uses features compiled code
/// does not support (generators, cells, closures being created).
pub fn build_hir(pre: &Preloader) -> Result<Function, BuildError> {
    let code = Arc::clone(&pre.code);
    check_supported(&code)?;
    let mut b = Builder::new(pre, code);
    b.build()?;
    tracing::debug!(
        function = %b.func.name,
        blocks = b.func.num_blocks(),
        regs = b.func.num_regs(),
        "built HIR"
    );
    Ok(b.func)
}

fn check_supported(code: &CodeUnit) -> Result<(), BuildError> {
    if code.flags.contains(CodeFlags::GENERATOR) {
        return Err(BuildError::Generator(code.name));
    }
    if code.flags.contains(CodeFlags::VARARGS) {
        return Err(BuildError::Varargs(code.name));
    }
    if !code.cellvars.is_empty() {
        return Err(BuildError::CellVars(code.name));
    }
    for (offset, &op) in code.ops.iter().enumerate() {
        if matches!(op, Op::LoadClosure(_) | Op::MakeFunction | Op::YieldValue) {
            return Err(BuildError::UnsupportedOp { op, offset });
        }
    }
    Ok(())
}

/// Offsets that start a basic block.
fn block_starts(code: &CodeUnit) -> Vec<usize> {
    let mut starts = vec![false; code.ops.len() + 1];
    starts[0] = true;
    for (offset, &op) in code.ops.iter().enumerate() {
        if let Some(target) = op.jump_target() {
            starts[target] = true;
            starts[offset + 1] = true;
        } else if op.is_terminal() {
            starts[offset + 1] = true;
        }
    }
    starts
        .iter()
        .enumerate()
        .filter(|&(i, &s)| s && i < code.ops.len())
        .map(|(i, _)| i)
        .collect()
}

struct Builder<'a> {
    pre: &'a Preloader,
    code: Arc<CodeUnit>,
    func: Function,
    locals: Vec<Reg>,
    stack_vars: Vec<Reg>,
    starts: Vec<usize>,
    blocks: FxHashMap<usize, BlockId>,
    entry_depth: FxHashMap<usize, usize>,
}

impl<'a> Builder<'a> {
    fn new(pre: &'a Preloader, code: Arc<CodeUnit>) -> Self {
        let mut func = Function::new(Arc::clone(&code), pre.func);
        func.arg_types = pre
            .arg_types
            .iter()
            .map(|&t| if t.is_primitive() { t } else { Type::OBJECT })
            .collect();
        func.return_type = if pre.return_type.is_primitive() {
            pre.return_type
        } else {
            Type::OBJECT
        };
        let locals = (0..code.nlocals())
            .map(|_| func.new_reg(Type::OPT_OBJECT))
            .collect();
        let starts = block_starts(&code);
        Builder {
            pre,
            code,
            func,
            locals,
            stack_vars: Vec::new(),
            starts,
            blocks: FxHashMap::default(),
            entry_depth: FxHashMap::default(),
        }
    }

    fn build(&mut self) -> Result<(), BuildError> {
        let entry = self.func.entry;
        self.emit_prologue(entry);
        let first = self.block_at(0);
        self.func.set_term(entry, Instr::new(InstrKind::Branch { target: first }));
        self.entry_depth.insert(0, 0);

        let mut worklist = vec![0usize];
        let mut done = rustc_hash::FxHashSet::default();
        while let Some(start) = worklist.pop() {
            if !done.insert(start) {
                continue;
            }
            let succs = self.translate_block(start)?;
            worklist.extend(succs);
        }
        Ok(())
    }

    fn block_at(&mut self, offset: usize) -> BlockId {
        if let Some(&b) = self.blocks.get(&offset) {
            return b;
        }
        let b = self.func.new_block();
        self.blocks.insert(offset, b);
        b
    }

    fn stack_var(&mut self, depth: usize) -> Reg {
        while self.stack_vars.len() <= depth {
            let r = self.func.new_reg(Type::OPT_OBJECT);
            self.stack_vars.push(r);
        }
        self.stack_vars[depth]
    }

    // ── Prologue ───────────────────────────────────────────────────

    fn emit_prologue(&mut self, entry: BlockId) {
        let argcount = self.code.argcount;
        let mut args = Vec::with_capacity(argcount);
        for i in 0..argcount {
            let arg_ty = self.func.arg_types.get(i).copied().unwrap_or(Type::OBJECT);
            let a = self.func.new_reg(arg_ty);
            self.func.push(entry, Instr::new(InstrKind::LoadArg { dst: a, idx: i as u32 }));
            let value = match PrimKind::of(arg_ty) {
                Some(kind) => {
                    let boxed = self.func.new_reg(kind.boxed_type());
                    self.func.push(
                        entry,
                        Instr::new(InstrKind::PrimitiveBox { dst: boxed, src: a, kind }),
                    );
                    boxed
                }
                None => a,
            };
            args.push(value);
        }

        let mut entry_frame = FrameState::new(Arc::clone(&self.code), None);
        for (slot, &a) in entry_frame.locals.iter_mut().zip(&args) {
            *slot = Some(a);
        }
        for (i, a) in args.iter_mut().enumerate() {
            let ann = self.code.arg_types.get(i).copied().unwrap_or_default();
            if !matches!(ann, ArgAnnotation::Kind(_) | ArgAnnotation::Class(_)) {
                continue;
            }
            let ty = self.pre.arg_types.get(i).copied().unwrap_or(Type::OBJECT);
            let g = self.func.new_reg(ty);
            let mut guard = Instr::new(InstrKind::GuardType { dst: g, src: *a, ty })
                .with_deopt(entry_frame.clone());
            if let Some(d) = &mut guard.deopt {
                d.guilty = Some(*a);
            }
            self.func.push(entry, guard);
            *a = g;
        }

        // Every local starts as a copy, so all writes to a variable are
        // `Assign`s and SSAify can treat exactly those as variables.
        for i in 0..self.locals.len() {
            let src = match args.get(i) {
                Some(&a) => a,
                None => {
                    let null = self.func.new_reg(Type::NULLPTR);
                    self.func.push(
                        entry,
                        Instr::new(InstrKind::LoadConst {
                            dst: null,
                            value: HirConst::Nullptr,
                        }),
                    );
                    null
                }
            };
            let dst = self.locals[i];
            self.func.push(entry, Instr::new(InstrKind::Assign { dst, src }));
        }
    }

    // ── Blocks ─────────────────────────────────────────────────────

    fn frame_state(&self, offset: usize, stack: &[Reg]) -> FrameState {
        let mut fs = FrameState::new(Arc::clone(&self.code), None);
        fs.next_offset = offset as u32;
        for (slot, &r) in fs.locals.iter_mut().zip(&self.locals) {
            *slot = Some(r);
        }
        fs.stack = stack.to_vec();
        fs
    }

    /// Translate the bytecode block at `start`; returns successor offsets.
    fn translate_block(&mut self, start: usize) -> Result<Vec<usize>, BuildError> {
        let block = self.block_at(start);
        let depth = self.entry_depth.get(&start).copied().unwrap_or(0);
        let mut stack: Vec<Reg> = (0..depth).map(|i| self.stack_var(i)).collect();

        let mut offset = start;
        loop {
            let Some(&op) = self.code.ops.get(offset) else {
                return Err(BuildError::FallsOffEnd);
            };
            let (pops, _) = op.stack_effect();
            if stack.len() < pops {
                return Err(BuildError::StackUnderflow(offset));
            }
            let frame = self.frame_state(offset, &stack);
            let at = offset as u32;

            match op {
                Op::JumpAbsolute(t) => {
                    let target = t as usize;
                    self.flow_to(block, &stack, target)?;
                    let tb = self.block_at(target);
                    self.func
                        .set_term(block, Instr::at(InstrKind::Branch { target: tb }, at));
                    return Ok(vec![target]);
                }
                Op::PopJumpIfFalse(t) | Op::PopJumpIfTrue(t) => {
                    let v = pop(&mut stack, offset)?;
                    let cond = self.emit(block, InstrKind::IsTruthy { dst: Reg::new(0), src: v }, Type::CBOOL, at, Some(frame));
                    let target = t as usize;
                    let next = offset + 1;
                    self.flow_to(block, &stack, target)?;
                    self.flow_to(block, &stack, next)?;
                    let tb = self.block_at(target);
                    let nb = self.block_at(next);
                    let term = if tb == nb {
                        InstrKind::Branch { target: tb }
                    } else if matches!(op, Op::PopJumpIfFalse(_)) {
                        InstrKind::CondBranch { cond, if_true: nb, if_false: tb }
                    } else {
                        InstrKind::CondBranch { cond, if_true: tb, if_false: nb }
                    };
                    self.func.set_term(block, Instr::at(term, at));
                    return Ok(vec![target, next]);
                }
                Op::ReturnValue => {
                    let v = pop(&mut stack, offset)?;
                    let value = match PrimKind::of(self.func.return_type) {
                        Some(kind) => {
                            let g = self.emit(
                                block,
                                InstrKind::GuardType { dst: Reg::new(0), src: v, ty: kind.boxed_type() },
                                kind.boxed_type(),
                                at,
                                Some(frame),
                            );
                            self.emit(
                                block,
                                InstrKind::PrimitiveUnbox { dst: Reg::new(0), src: g, kind },
                                kind.unboxed_type(),
                                at,
                                None,
                            )
                        }
                        None => v,
                    };
                    self.func
                        .set_term(block, Instr::at(InstrKind::Return { value }, at));
                    return Ok(Vec::new());
                }
                Op::RaiseVarargs => {
                    let exc = pop(&mut stack, offset)?;
                    self.func.set_term(
                        block,
                        Instr::at(InstrKind::Raise { exc }, at).with_deopt(frame),
                    );
                    return Ok(Vec::new());
                }
                _ => self.translate_op(block, op, offset, &mut stack, frame)?,
            }

            offset += 1;
            if self.starts.binary_search(&offset).is_ok() {
                self.flow_to(block, &stack, offset)?;
                let nb = self.block_at(offset);
                self.func
                    .set_term(block, Instr::at(InstrKind::Branch { target: nb }, at));
                return Ok(vec![offset]);
            }
        }
    }

    /// Move the live stack into stack variables for the edge to `target`.
    fn flow_to(&mut self, block: BlockId, stack: &[Reg], target: usize) -> Result<(), BuildError> {
        match self.entry_depth.get(&target) {
            Some(&d) if d != stack.len() => return Err(BuildError::StackMismatch(target)),
            Some(_) => {}
            None => {
                self.entry_depth.insert(target, stack.len());
            }
        }
        for (i, &r) in stack.iter().enumerate() {
            let var = self.stack_var(i);
            if var != r {
                self.func
                    .push(block, Instr::new(InstrKind::Assign { dst: var, src: r }));
            }
        }
        Ok(())
    }

    /// Append an instruction whose output is a fresh register of type `ty`.
    fn emit(
        &mut self,
        block: BlockId,
        mut kind: InstrKind,
        ty: Type,
        at: u32,
        frame: Option<FrameState>,
    ) -> Reg {
        let dst = self.func.new_reg(ty);
        if let Some(out) = kind.output_mut() {
            *out = dst;
        }
        let mut instr = Instr::at(kind, at);
        if let Some(frame) = frame {
            instr = instr.with_deopt(frame);
        }
        self.func.push(block, instr);
        dst
    }

    fn emit_void(&mut self, block: BlockId, kind: InstrKind, at: u32, frame: Option<FrameState>) {
        let mut instr = Instr::at(kind, at);
        if let Some(frame) = frame {
            instr = instr.with_deopt(frame);
        }
        self.func.push(block, instr);
    }

    fn translate_op(
        &mut self,
        block: BlockId,
        op: Op,
        offset: usize,
        stack: &mut Vec<Reg>,
        frame: FrameState,
    ) -> Result<(), BuildError> {
        const D: Reg = Reg::new(0);
        let at = offset as u32;
        match op {
            Op::Nop => {}
            Op::PopTop => {
                pop(stack, offset)?;
            }
            Op::DupTop => {
                let top = *stack.last().ok_or(BuildError::StackUnderflow(offset))?;
                stack.push(top);
            }
            Op::RotTwo => {
                let n = stack.len();
                stack.swap(n - 1, n - 2);
            }
            Op::LoadConst(i) => {
                let value = self.code.consts[i as usize].clone();
                let r = self.load_const(block, value, at);
                stack.push(r);
            }
            Op::LoadFast(i) => {
                let src = self.locals[i as usize];
                let name = self.code.local_names[i as usize];
                let r = self.emit(block, InstrKind::CheckVar { dst: D, src, name }, Type::OBJECT, at, Some(frame));
                stack.push(r);
            }
            Op::StoreFast(i) => {
                let v = pop(stack, offset)?;
                let dst = self.locals[i as usize];
                self.func.push(block, Instr::at(InstrKind::Assign { dst, src: v }, at));
            }
            Op::LoadDeref(i) => {
                let idx = i - self.code.cellvars.len() as u32;
                let name = self.code.freevars[idx as usize];
                let cell = self.emit(block, InstrKind::LoadFreevar { dst: D, idx }, Type::OPT_OBJECT, at, None);
                let r = self.emit(block, InstrKind::CheckFreevar { dst: D, src: cell, name }, Type::OBJECT, at, Some(frame));
                stack.push(r);
            }
            Op::StoreDeref(i) => {
                let idx = i - self.code.cellvars.len() as u32;
                let value = pop(stack, offset)?;
                self.emit_void(block, InstrKind::StoreFreevar { value, idx }, at, None);
            }
            Op::LoadGlobal(i) => {
                let name = self.name(i);
                let r = self.load_global(block, name, at, frame);
                stack.push(r);
            }
            Op::StoreGlobal(i) => {
                let name = self.name(i);
                let value = pop(stack, offset)?;
                self.emit_void(block, InstrKind::StoreGlobal { value, name }, at, Some(frame));
            }
            Op::LoadAttr(i) => {
                let obj = pop(stack, offset)?;
                let name = self.name(i);
                let r = self.emit(block, InstrKind::LoadAttr { dst: D, obj, name }, Type::OBJECT, at, Some(frame));
                stack.push(r);
            }
            Op::StoreAttr(i) => {
                let obj = pop(stack, offset)?;
                let value = pop(stack, offset)?;
                let name = self.name(i);
                self.emit_void(block, InstrKind::StoreAttr { obj, value, name }, at, Some(frame));
            }
            Op::LoadMethod(i) => {
                let receiver = pop(stack, offset)?;
                let name = self.name(i);
                let m = self.emit(block, InstrKind::LoadMethod { dst: D, receiver, name }, Type::OBJECT, at, Some(frame));
                let null = self.emit(block, InstrKind::LoadConst { dst: D, value: HirConst::Nullptr }, Type::NULLPTR, at, None);
                stack.push(m);
                stack.push(null);
            }
            Op::CallMethod(n) => {
                let args = pop_n(stack, n as usize, offset)?;
                let self_or_null = pop(stack, offset)?;
                let callable = pop(stack, offset)?;
                let r = self.emit(
                    block,
                    InstrKind::CallMethod { dst: D, callable, self_or_null, args },
                    Type::OBJECT,
                    at,
                    Some(frame),
                );
                stack.push(r);
            }
            Op::CallFunction(n) => {
                let args = pop_n(stack, n as usize, offset)?;
                let func = pop(stack, offset)?;
                let r = self.emit(block, InstrKind::VectorCall { dst: D, func, args }, Type::OBJECT, at, Some(frame));
                stack.push(r);
            }
            Op::BinaryOp(bop) => {
                let right = pop(stack, offset)?;
                let left = pop(stack, offset)?;
                let r = self.emit(block, InstrKind::BinaryOp { dst: D, op: bop, left, right }, Type::OBJECT, at, Some(frame));
                stack.push(r);
            }
            Op::CompareOp(cop) => {
                let right = pop(stack, offset)?;
                let left = pop(stack, offset)?;
                let r = self.emit(block, InstrKind::Compare { dst: D, op: cop, left, right }, Type::OBJECT, at, Some(frame));
                stack.push(r);
            }
            Op::UnaryNot => {
                let v = pop(stack, offset)?;
                let t = self.emit(block, InstrKind::IsTruthy { dst: D, src: v }, Type::CBOOL, at, Some(frame));
                let n = self.emit(block, InstrKind::PrimitiveNot { dst: D, src: t }, Type::CBOOL, at, None);
                let b = self.emit(block, InstrKind::PrimitiveBox { dst: D, src: n, kind: PrimKind::Bool }, Type::BOOL, at, None);
                stack.push(b);
            }
            Op::UnaryNegative => {
                let src = pop(stack, offset)?;
                let r = self.emit(block, InstrKind::UnaryNegative { dst: D, src }, Type::OBJECT, at, Some(frame));
                stack.push(r);
            }
            Op::BinarySubscr => {
                let index = pop(stack, offset)?;
                let container = pop(stack, offset)?;
                let r = self.emit(block, InstrKind::BinarySubscr { dst: D, container, index }, Type::OBJECT, at, Some(frame));
                stack.push(r);
            }
            Op::BuildTuple(n) => {
                let items = pop_n(stack, n as usize, offset)?;
                let r = self.emit(block, InstrKind::MakeTuple { dst: D, items }, Type::TUPLE, at, None);
                stack.push(r);
            }
            Op::BuildList(n) => {
                let items = pop_n(stack, n as usize, offset)?;
                let r = self.emit(block, InstrKind::MakeList { dst: D, items }, Type::LIST, at, None);
                stack.push(r);
            }
            Op::LoadClosure(_)
            | Op::MakeFunction
            | Op::YieldValue
            | Op::JumpAbsolute(_)
            | Op::PopJumpIfFalse(_)
            | Op::PopJumpIfTrue(_)
            | Op::ReturnValue
            | Op::RaiseVarargs => return Err(BuildError::UnsupportedOp { op, offset }),
        }
        Ok(())
    }

    fn name(&self, i: u32) -> Name {
        self.code.names[i as usize]
    }

    fn load_const(&mut self, block: BlockId, value: ConstValue, at: u32) -> Reg {
        let ty = Type::of_const(&value);
        let idx = self.func.add_const(value);
        self.emit(
            block,
            InstrKind::LoadConst { dst: Reg::new(0), value: HirConst::Object(idx) },
            ty,
            at,
            None,
        )
    }

    fn load_global(&mut self, block: BlockId, name: Name, at: u32, frame: FrameState) -> Reg {
        let Some(g) = self.pre.global(name).copied() else {
            return self.emit(block, InstrKind::LoadGlobal { dst: Reg::new(0), name }, Type::OBJECT, at, Some(frame));
        };
        if g.from_builtins {
            // A new global binding would shadow the builtin.
            self.emit_void(
                block,
                InstrKind::DeoptPatchpoint { key: WatchKey::Namespace(self.pre.globals) },
                at,
                Some(frame.clone()),
            );
        }
        let slot = self.emit(
            block,
            InstrKind::LoadGlobalCached { dst: Reg::new(0), namespace: g.namespace, slot: g.index, name },
            Type::OPT_OBJECT,
            at,
            None,
        );
        let r = self.emit(
            block,
            InstrKind::GuardIs { dst: Reg::new(0), src: slot, target: g.value },
            Type::object_const(g.value, g.kind),
            at,
            Some(frame),
        );
        if let Some(d) = self.func.block_mut(block).instrs.last_mut().and_then(|i| i.deopt.as_mut()) {
            d.guilty = Some(slot);
        }
        r
    }
}

fn pop(stack: &mut Vec<Reg>, offset: usize) -> Result<Reg, BuildError> {
    stack.pop().ok_or(BuildError::StackUnderflow(offset))
}

fn pop_n(stack: &mut Vec<Reg>, n: usize, offset: usize) -> Result<Vec<Reg>, BuildError> {
    if stack.len() < n {
        return Err(BuildError::StackUnderflow(offset));
    }
    Ok(stack.split_off(stack.len() - n))
}

#[cfg(test)]
mod tests;
