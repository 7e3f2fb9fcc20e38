//! HIR to LIR lowering.
//!
//! # Algorithm
//!
//! 1. Lay blocks out in reverse postorder; unreachable blocks are dropped.
//! 2. Lower each instruction in place. HIR register `vN` becomes LIR
//!    vreg `%N`; temporaries are numbered after them.
//! 3. Phis become copies at the end of each predecessor, staged through
//!    fresh temporaries so a phi may read another phi's output. A
//!    conditional edge into a block with phis is split first.
//! 4. Deopt metadata is converted frame by frame, outermost first, so the
//!    emitter can describe every frame without walking parent chains.
//!
//! Anything that may run user code becomes a helper `Call` whose failure
//! deopts with a pending exception.

use std::sync::Arc;

use kiln_hir::effects::deopt_reason;
use kiln_hir::{
    BlockId, DeoptReason, FrameState, Function, HirConst, Instr, InstrKind, Reg, Type, TypeBits, TypeSpec,
};
use kiln_rt::{CodeId, CodeUnit, Name, ObjRef, WatchKey};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};

use crate::error::CodegenError;
use crate::frame::entry_inline_depths;
use crate::isa::{AluOp, Cond, Helper};
use crate::lir::{
    DeoptId, LirBlock, LirBlockId, LirDeopt, LirFrame, LirFunction, LirInstr, LirTerm, Operand, VReg, ValueKind,
};

fn vreg(r: Reg) -> VReg {
    VReg::new(r.raw())
}

fn regs(rs: &[Reg]) -> impl Iterator<Item = Operand> + '_ {
    rs.iter().map(|&r| Operand::Reg(vreg(r)))
}

pub fn lower(func: &Function) -> Result<LirFunction, CodegenError> {
    let order = kiln_hir::graph::rpo(func);
    let block_map: FxHashMap<BlockId, LirBlockId> = order
        .iter()
        .enumerate()
        .map(|(i, &b)| (b, LirBlockId(i as u32)))
        .collect();
    let (depths, max_depth) = entry_inline_depths(func);

    let mut lowerer = Lowerer {
        hir: func,
        lir: LirFunction {
            name: func.name,
            code: Arc::clone(&func.code),
            blocks: Vec::with_capacity(order.len()),
            kinds: (0..func.num_regs())
                .map(|i| ValueKind::of(func.reg_type(Reg::new(i as u32))))
                .collect(),
            deopts: Vec::new(),
            arg_kinds: func.arg_types.iter().map(|&t| kiln_hir::PrimKind::of(t)).collect(),
            return_kind: kiln_hir::PrimKind::of(func.return_type),
            is_static: func.code.is_static(),
            references: Vec::new(),
            consts: func.consts.clone(),
            names: Vec::new(),
            inlined_codes: Vec::new(),
            num_attr_caches: func.num_attr_caches,
            inline_depth: max_depth,
        },
        block_map,
        next_block: order.len() as u32,
        split_blocks: Vec::new(),
        names: FxHashMap::default(),
        seen_refs: FxHashSet::default(),
        codes: FxHashMap::default(),
        depth: 0,
        out: Vec::new(),
    };

    for &b in &order {
        lowerer.depth = depths.get(&b).copied().unwrap_or(0);
        let id = lowerer.block_map[&b];
        let block = func.block(b);
        for instr in block.instrs.iter().filter(|i| !i.is_phi()) {
            lowerer.lower_instr(instr)?;
        }
        let term = lowerer.lower_term(b, &block.term)?;
        let instrs = std::mem::take(&mut lowerer.out);
        lowerer.lir.blocks.push(LirBlock { id, instrs, term });
    }
    let splits = std::mem::take(&mut lowerer.split_blocks);
    lowerer.lir.blocks.extend(splits);

    tracing::debug!(
        function = %func.name,
        blocks = lowerer.lir.blocks.len(),
        instrs = lowerer.lir.instr_count(),
        deopts = lowerer.lir.deopts.len(),
        "lowered to LIR"
    );
    Ok(lowerer.lir)
}

struct Lowerer<'a> {
    hir: &'a Function,
    lir: LirFunction,
    block_map: FxHashMap<BlockId, LirBlockId>,
    next_block: u32,
    split_blocks: Vec<LirBlock>,
    names: FxHashMap<Name, u32>,
    seen_refs: FxHashSet<ObjRef>,
    codes: FxHashMap<CodeId, u32>,
    /// Inlined frames open at the current instruction.
    depth: u32,
    out: Vec<LirInstr>,
}

impl Lowerer<'_> {
    // ── Tables ─────────────────────────────────────────────────────

    fn name(&mut self, name: Name) -> u32 {
        let names = &mut self.lir.names;
        *self.names.entry(name).or_insert_with(|| {
            names.push(name);
            names.len() as u32 - 1
        })
    }

    fn reference(&mut self, obj: ObjRef) -> Operand {
        if !obj.is_null() && self.seen_refs.insert(obj) {
            self.lir.references.push(obj);
        }
        Operand::Imm(obj.to_word() as i64)
    }

    fn code_index(&mut self, code: &Arc<CodeUnit>) -> u32 {
        let codes = &mut self.lir.inlined_codes;
        *self.codes.entry(code.id).or_insert_with(|| {
            codes.push(Arc::clone(code));
            codes.len() as u32 - 1
        })
    }

    fn temp(&mut self, kind: ValueKind) -> VReg {
        self.lir.new_vreg(kind)
    }

    fn emit(&mut self, instr: LirInstr) {
        self.out.push(instr);
    }

    fn call(&mut self, dst: Option<Reg>, helper: Helper, args: SmallVec<[Operand; 4]>, deopt: Option<DeoptId>) {
        self.emit(LirInstr::Call {
            dst: dst.map(vreg),
            helper,
            args,
            deopt,
        });
    }

    // ── Deopt metadata ─────────────────────────────────────────────

    fn deopt_site(&mut self, instr: &Instr) -> Result<DeoptId, CodegenError> {
        let op = instr.opcode();
        let info = instr.deopt.as_deref().ok_or(CodegenError::MissingDeopt(op))?;
        let mut frames = Vec::with_capacity(info.frame.depth());
        let mut cur: Option<&FrameState> = Some(&info.frame);
        while let Some(frame) = cur {
            frames.push(LirFrame {
                code: Arc::clone(&frame.code),
                func: frame.func,
                next_offset: frame.next_offset,
                locals: frame.locals.iter().map(|l| l.map(vreg)).collect(),
                stack: frame.stack.iter().map(|&r| vreg(r)).collect(),
            });
            cur = frame.parent.as_deref();
        }
        frames.reverse();
        for f in &frames {
            if let Some(func) = f.func {
                self.reference(func);
            }
        }
        let name = match &instr.kind {
            InstrKind::CheckVar { name, .. }
            | InstrKind::CheckFreevar { name, .. }
            | InstrKind::CheckField { name, .. } => Some(*name),
            _ => None,
        };
        let id = DeoptId(self.lir.deopts.len() as u32);
        self.lir.deopts.push(LirDeopt {
            reason: deopt_reason(op).unwrap_or(DeoptReason::GuardFailure),
            frames,
            live: info.live.iter().map(|l| (vreg(l.reg), l.kind)).collect(),
            guilty: info.guilty.map(vreg),
            name,
            bc_offset: instr.bc_offset,
        });
        Ok(id)
    }

    /// Function whose globals a lookup at `instr` uses: the innermost
    /// inlined callee, or the compiled function.
    fn globals_owner(&mut self, instr: &Instr) -> Operand {
        match instr.deopt.as_ref().and_then(|d| d.frame.func) {
            Some(f) => self.reference(f),
            None => {
                let t = self.temp(ValueKind::Object);
                self.emit(LirInstr::LoadFunc { dst: t });
                Operand::Reg(t)
            }
        }
    }

    // ── Instructions ───────────────────────────────────────────────

    fn lower_instr(&mut self, instr: &Instr) -> Result<(), CodegenError> {
        match &instr.kind {
            InstrKind::LoadArg { dst, idx } => self.emit(LirInstr::LoadArg {
                dst: vreg(*dst),
                index: *idx,
            }),
            InstrKind::LoadConst { dst, value } => {
                let dst = vreg(*dst);
                let instr = match *value {
                    HirConst::Object(index) => LirInstr::ConstObj { dst, index },
                    HirConst::Ref(obj) => {
                        self.reference(obj);
                        LirInstr::Const {
                            dst,
                            value: obj.to_word() as i64,
                        }
                    }
                    HirConst::Int64(v) => LirInstr::Const { dst, value: v },
                    HirConst::Double(v) => LirInstr::Const {
                        dst,
                        value: v.to_bits() as i64,
                    },
                    HirConst::Bool(b) => LirInstr::Const {
                        dst,
                        value: i64::from(b),
                    },
                    HirConst::Nullptr => LirInstr::Const { dst, value: 0 },
                };
                self.emit(instr);
            }
            InstrKind::LoadCurrentFunc { dst } => self.emit(LirInstr::LoadFunc { dst: vreg(*dst) }),
            InstrKind::Assign { dst, src } => self.copy(*dst, *src),
            InstrKind::Phi { .. } => {}

            InstrKind::GuardType { dst, src, ty } => {
                let deopt = self.deopt_site(instr)?;
                self.guard_type(vreg(*src), *ty, deopt);
                self.copy(*dst, *src);
            }
            InstrKind::GuardIs { dst, src, target } => {
                let deopt = self.deopt_site(instr)?;
                let b = self.reference(*target);
                self.emit(LirInstr::Guard {
                    cond: Cond::Ne,
                    a: vreg(*src),
                    b,
                    deopt,
                });
                self.copy(*dst, *src);
            }
            InstrKind::CheckVar { dst, src, .. }
            | InstrKind::CheckFreevar { dst, src, .. }
            | InstrKind::CheckField { dst, src, .. } => {
                let deopt = self.deopt_site(instr)?;
                self.emit(LirInstr::Guard {
                    cond: Cond::Eq,
                    a: vreg(*src),
                    b: Operand::Imm(0),
                    deopt,
                });
                self.copy(*dst, *src);
            }
            InstrKind::CheckSequenceBounds { dst, seq, index } => {
                // n = index + (len if index < 0); deopt unless 0 <= n < len.
                let deopt = self.deopt_site(instr)?;
                let index = vreg(*index);
                let len = self.temp(ValueKind::Int64);
                let sign = self.temp(ValueKind::Int64);
                let adjust = self.temp(ValueKind::Int64);
                self.emit(LirInstr::SeqLen { dst: len, obj: vreg(*seq) });
                self.emit(LirInstr::Alu {
                    op: AluOp::Sar,
                    dst: sign,
                    a: index,
                    b: Operand::Imm(63),
                });
                self.emit(LirInstr::Alu {
                    op: AluOp::And,
                    dst: adjust,
                    a: sign,
                    b: Operand::Reg(len),
                });
                self.emit(LirInstr::Alu {
                    op: AluOp::Add,
                    dst: vreg(*dst),
                    a: index,
                    b: Operand::Reg(adjust),
                });
                self.emit(LirInstr::Guard {
                    cond: Cond::AboveEq,
                    a: vreg(*dst),
                    b: Operand::Reg(len),
                    deopt,
                });
            }

            InstrKind::LoadGlobalCached {
                dst, namespace, slot, ..
            } => {
                self.reference(*namespace);
                self.emit(LirInstr::LoadGlobal {
                    dst: vreg(*dst),
                    namespace: *namespace,
                    slot: *slot,
                });
            }
            InstrKind::LoadGlobal { dst, name } => {
                let owner = self.globals_owner(instr);
                let deopt = self.deopt_site(instr)?;
                let name = self.name(*name);
                self.call(Some(*dst), Helper::LoadGlobal { name }, smallvec![owner], Some(deopt));
            }
            InstrKind::StoreGlobal { value, name } => {
                let owner = self.globals_owner(instr);
                let deopt = self.deopt_site(instr)?;
                let name = self.name(*name);
                self.call(
                    None,
                    Helper::StoreGlobal { name },
                    smallvec![owner, Operand::Reg(vreg(*value))],
                    Some(deopt),
                );
            }
            InstrKind::LoadAttr { dst, obj, name } | InstrKind::LoadMethod {
                dst,
                receiver: obj,
                name,
            } => {
                let deopt = self.deopt_site(instr)?;
                let name = self.name(*name);
                self.call(Some(*dst), Helper::GetAttr { name }, smallvec![Operand::Reg(vreg(*obj))], Some(deopt));
            }
            InstrKind::StoreAttr { obj, value, name } => {
                let deopt = self.deopt_site(instr)?;
                let name = self.name(*name);
                self.call(
                    None,
                    Helper::SetAttr { name },
                    smallvec![Operand::Reg(vreg(*obj)), Operand::Reg(vreg(*value))],
                    Some(deopt),
                );
            }
            InstrKind::LoadField { dst, obj, index, .. } => self.emit(LirInstr::LoadField {
                dst: vreg(*dst),
                obj: vreg(*obj),
                index: *index,
            }),
            InstrKind::StoreField { obj, value, index, .. } => self.emit(LirInstr::StoreField {
                obj: vreg(*obj),
                src: vreg(*value),
                index: *index,
            }),

            InstrKind::LoadTypeAttrCacheItem { dst, cache } => self.emit(LirInstr::CacheLoad {
                dst: vreg(*dst),
                cache: *cache,
            }),
            InstrKind::CheckTypeAttrCache { dst, receiver, cache } => self.emit(LirInstr::CacheCheck {
                dst: vreg(*dst),
                obj: vreg(*receiver),
                cache: *cache,
            }),
            InstrKind::FillTypeAttrCache {
                dst,
                receiver,
                name,
                cache,
            } => {
                let deopt = self.deopt_site(instr)?;
                let name = self.name(*name);
                self.call(
                    Some(*dst),
                    Helper::FillTypeAttrCache { name, cache: *cache },
                    smallvec![Operand::Reg(vreg(*receiver))],
                    Some(deopt),
                );
            }

            InstrKind::CallMethod {
                dst,
                callable,
                self_or_null,
                args,
            } => {
                let deopt = self.deopt_site(instr)?;
                let mut ops: SmallVec<[Operand; 4]> =
                    smallvec![Operand::Reg(vreg(*callable)), Operand::Reg(vreg(*self_or_null))];
                ops.extend(regs(args));
                self.call(Some(*dst), Helper::CallMethod, ops, Some(deopt));
            }
            InstrKind::CallStatic { dst, method, args } => {
                let deopt = self.deopt_site(instr)?;
                self.call(
                    Some(*dst),
                    Helper::CallBuiltinMethod { method: method.0 },
                    regs(args).collect(),
                    Some(deopt),
                );
            }
            InstrKind::VectorCall { dst, func, args } => {
                let deopt = self.deopt_site(instr)?;
                let mut ops: SmallVec<[Operand; 4]> = smallvec![Operand::Reg(vreg(*func))];
                ops.extend(regs(args));
                self.call(Some(*dst), Helper::VectorCall, ops, Some(deopt));
            }
            InstrKind::InvokeStaticFunction { dst, target, args, .. } => {
                let deopt = self.deopt_site(instr)?;
                let target = self.reference(*target);
                let mut ops: SmallVec<[Operand; 4]> = smallvec![target];
                ops.extend(regs(args));
                self.call(Some(*dst), Helper::InvokeStatic, ops, Some(deopt));
            }

            InstrKind::BinaryOp { dst, op, left, right } | InstrKind::LongBinaryOp { dst, op, left, right } => {
                let deopt = self.deopt_site(instr)?;
                self.call(
                    Some(*dst),
                    Helper::BinaryOp { op: *op },
                    smallvec![Operand::Reg(vreg(*left)), Operand::Reg(vreg(*right))],
                    Some(deopt),
                );
            }
            InstrKind::IntBinaryOp { dst, op, left, right } => {
                let deopt = self.deopt_site(instr)?;
                self.emit(LirInstr::CheckedArith {
                    op: *op,
                    dst: vreg(*dst),
                    a: vreg(*left),
                    b: vreg(*right),
                    deopt,
                });
            }
            InstrKind::UnaryNegative { dst, src } => {
                let deopt = self.deopt_site(instr)?;
                self.call(Some(*dst), Helper::UnaryNegative, smallvec![Operand::Reg(vreg(*src))], Some(deopt));
            }
            InstrKind::Compare { dst, op, left, right } => {
                let deopt = self.deopt_site(instr)?;
                self.call(
                    Some(*dst),
                    Helper::Compare { op: *op },
                    smallvec![Operand::Reg(vreg(*left)), Operand::Reg(vreg(*right))],
                    Some(deopt),
                );
            }
            InstrKind::CompareBool { dst, op, left, right } => {
                let deopt = self.deopt_site(instr)?;
                self.call(
                    Some(*dst),
                    Helper::CompareBool { op: *op },
                    smallvec![Operand::Reg(vreg(*left)), Operand::Reg(vreg(*right))],
                    Some(deopt),
                );
            }
            InstrKind::PrimitiveCompare { dst, op, left, right } => self.emit(LirInstr::SetCmp {
                cond: Cond::from_cmp(*op),
                dst: vreg(*dst),
                a: vreg(*left),
                b: Operand::Reg(vreg(*right)),
            }),
            InstrKind::IsTruthy { dst, src } => {
                let deopt = self.deopt_site(instr)?;
                self.call(Some(*dst), Helper::IsTruthy, smallvec![Operand::Reg(vreg(*src))], Some(deopt));
            }
            InstrKind::PrimitiveNot { dst, src } => self.emit(LirInstr::Alu {
                op: AluOp::Xor,
                dst: vreg(*dst),
                a: vreg(*src),
                b: Operand::Imm(1),
            }),
            InstrKind::PrimitiveBox { dst, src, kind } => {
                self.call(Some(*dst), Helper::Box { kind: *kind }, smallvec![Operand::Reg(vreg(*src))], None);
            }
            InstrKind::PrimitiveUnbox { dst, src, kind } => self.emit(LirInstr::Unbox {
                kind: *kind,
                dst: vreg(*dst),
                obj: vreg(*src),
            }),

            InstrKind::MakeTuple { dst, items } => {
                self.call(Some(*dst), Helper::MakeTuple, regs(items).collect(), None);
            }
            InstrKind::MakeList { dst, items } => {
                self.call(Some(*dst), Helper::MakeList, regs(items).collect(), None);
            }
            InstrKind::BinarySubscr { dst, container, index } => {
                let deopt = self.deopt_site(instr)?;
                self.call(
                    Some(*dst),
                    Helper::Subscript,
                    smallvec![Operand::Reg(vreg(*container)), Operand::Reg(vreg(*index))],
                    Some(deopt),
                );
            }
            InstrKind::LoadTupleItem { dst, tuple, index } => self.emit(LirInstr::SeqItem {
                dst: vreg(*dst),
                obj: vreg(*tuple),
                index: vreg(*index),
            }),

            InstrKind::LoadFreevar { dst, idx } => {
                let f = self.temp(ValueKind::Object);
                self.emit(LirInstr::LoadFunc { dst: f });
                self.emit(LirInstr::LoadCell {
                    dst: vreg(*dst),
                    func: f,
                    index: *idx,
                });
            }
            InstrKind::StoreFreevar { value, idx } => {
                let f = self.temp(ValueKind::Object);
                self.emit(LirInstr::LoadFunc { dst: f });
                self.emit(LirInstr::StoreCell {
                    func: f,
                    src: vreg(*value),
                    index: *idx,
                });
            }
            InstrKind::LoadFunctionCode { dst, func } => self.emit(LirInstr::LoadCode {
                dst: vreg(*dst),
                func: vreg(*func),
            }),

            InstrKind::DeoptPatchpoint { key } => {
                let deopt = self.deopt_site(instr)?;
                match key {
                    WatchKey::Type(o) | WatchKey::Namespace(o) => {
                        self.reference(*o);
                    }
                }
                self.emit(LirInstr::Patchpoint { deopt, key: *key });
            }
            InstrKind::BeginInlinedFunction { func, code } => {
                self.depth += 1;
                self.reference(*func);
                let code = self.code_index(code);
                self.emit(LirInstr::StoreInlineFrame {
                    depth: self.depth,
                    func: *func,
                });
                self.call(None, Helper::PushShadow { code }, SmallVec::new(), None);
            }
            InstrKind::EndInlinedFunction { .. } => {
                self.depth = self.depth.saturating_sub(1);
                self.call(None, Helper::PopShadow, SmallVec::new(), None);
            }
            InstrKind::UpdatePrevInstr { offset } => self.emit(LirInstr::SetOffset { offset: *offset }),

            InstrKind::Incref { src } => self.emit(LirInstr::Incref { src: vreg(*src) }),
            InstrKind::Decref { src } => self.emit(LirInstr::Decref { src: vreg(*src) }),
            InstrKind::XDecref { src } => self.emit(LirInstr::XDecref { src: vreg(*src) }),

            InstrKind::Branch { .. }
            | InstrKind::CondBranch { .. }
            | InstrKind::Return { .. }
            | InstrKind::Raise { .. }
            | InstrKind::Deopt
            | InstrKind::Unreachable => return Err(CodegenError::Unsupported(instr.opcode())),
        }
        Ok(())
    }

    fn copy(&mut self, dst: Reg, src: Reg) {
        self.emit(LirInstr::Copy {
            dst: vreg(dst),
            src: vreg(src),
        });
    }

    /// Deopt unless `src` has type `ty`.
    fn guard_type(&mut self, src: VReg, ty: Type, deopt: DeoptId) {
        let tracked = TypeBits::OBJECT | TypeBits::NULLPTR;
        let mask = ty.bits & tracked;
        if !mask.is_empty() && mask != tracked {
            let kind = self.temp(ValueKind::Int64);
            let hit = self.temp(ValueKind::Int64);
            self.emit(LirInstr::LoadKind { dst: kind, obj: src });
            self.emit(LirInstr::Alu {
                op: AluOp::And,
                dst: hit,
                a: kind,
                b: Operand::Imm(i64::from(mask.bits())),
            });
            self.emit(LirInstr::Guard {
                cond: Cond::Eq,
                a: hit,
                b: Operand::Imm(0),
                deopt,
            });
        }

        let boxed = !mask.is_empty();
        let expect_value = |this: &mut Self, kind: kiln_hir::PrimKind, value: i64| {
            let raw = if boxed {
                let raw = this.temp(ValueKind::Int64);
                this.emit(LirInstr::Unbox { kind, dst: raw, obj: src });
                raw
            } else {
                src
            };
            this.emit(LirInstr::Guard {
                cond: Cond::Ne,
                a: raw,
                b: Operand::Imm(value),
                deopt,
            });
        };
        match ty.spec {
            TypeSpec::Top => {}
            TypeSpec::Object(obj) => {
                let b = self.reference(obj);
                self.emit(LirInstr::Guard {
                    cond: Cond::Ne,
                    a: src,
                    b,
                    deopt,
                });
            }
            TypeSpec::ExactClass(class) => {
                let b = self.reference(class);
                let cls = self.temp(ValueKind::Object);
                self.emit(LirInstr::LoadClass { dst: cls, obj: src });
                self.emit(LirInstr::Guard {
                    cond: Cond::Ne,
                    a: cls,
                    b,
                    deopt,
                });
            }
            TypeSpec::Int(v) => expect_value(self, kiln_hir::PrimKind::Int64, v),
            TypeSpec::Double(v) => expect_value(self, kiln_hir::PrimKind::Double, v.to_bits() as i64),
            TypeSpec::Bool(v) => expect_value(self, kiln_hir::PrimKind::Bool, i64::from(v)),
        }
    }

    // ── Terminators ────────────────────────────────────────────────

    /// Copies implementing the phis of `succ` along the edge from `pred`.
    fn phi_copies(&mut self, pred: BlockId, succ: BlockId) -> Vec<LirInstr> {
        let moves: Vec<(VReg, VReg)> = self
            .hir
            .block(succ)
            .phis()
            .filter_map(|phi| match &phi.kind {
                InstrKind::Phi { dst, inputs } => inputs
                    .iter()
                    .find(|(b, _)| *b == pred)
                    .map(|&(_, src)| (vreg(*dst), vreg(src))),
                _ => None,
            })
            .filter(|(dst, src)| dst != src)
            .collect();
        match moves.as_slice() {
            [] => Vec::new(),
            [(dst, src)] => vec![LirInstr::Copy { dst: *dst, src: *src }],
            _ => {
                let temps: Vec<VReg> = moves.iter().map(|(dst, _)| self.temp(self.lir.kind(*dst))).collect();
                let staged = moves
                    .iter()
                    .zip(&temps)
                    .map(|(&(_, src), &t)| LirInstr::Copy { dst: t, src });
                let finals = moves
                    .iter()
                    .zip(&temps)
                    .map(|(&(dst, _), &t)| LirInstr::Copy { dst, src: t });
                staged.chain(finals).collect()
            }
        }
    }

    fn edge(&mut self, pred: BlockId, succ: BlockId) -> LirBlockId {
        let target = self.block_map[&succ];
        let copies = self.phi_copies(pred, succ);
        if copies.is_empty() {
            return target;
        }
        let id = LirBlockId(self.next_block);
        self.next_block += 1;
        self.split_blocks.push(LirBlock {
            id,
            instrs: copies,
            term: LirTerm::Jump(target),
        });
        id
    }

    fn lower_term(&mut self, b: BlockId, term: &Instr) -> Result<LirTerm, CodegenError> {
        Ok(match &term.kind {
            InstrKind::Branch { target } => {
                let copies = self.phi_copies(b, *target);
                self.out.extend(copies);
                LirTerm::Jump(self.block_map[target])
            }
            InstrKind::CondBranch {
                cond,
                if_true,
                if_false,
            } => LirTerm::Branch {
                cond: vreg(*cond),
                if_true: self.edge(b, *if_true),
                if_false: self.edge(b, *if_false),
            },
            InstrKind::Return { value } => LirTerm::Return(vreg(*value)),
            InstrKind::Raise { exc } => {
                let deopt = self.deopt_site(term)?;
                self.call(None, Helper::Raise, smallvec![Operand::Reg(vreg(*exc))], Some(deopt));
                LirTerm::Deopt(deopt)
            }
            InstrKind::Deopt => LirTerm::Deopt(self.deopt_site(term)?),
            InstrKind::Unreachable => LirTerm::Trap,
            _ => return Err(CodegenError::Unsupported(term.opcode())),
        })
    }
}
