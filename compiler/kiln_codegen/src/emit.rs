//! KX code emission.
//!
//! Every function starts with three fixed entry slots:
//!
//! ```text
//! GENERIC_ENTRY_OFFSET  jmp generic   boxed args; checks the count first
//! REENTRY_OFFSET        jmp bound     boxed args, already checked
//! STATIC_ENTRY_OFFSET   jmp static    raw args for static functions
//! ```
//!
//! For a static function `bound` checks and unboxes the boxed arguments,
//! calls the body, and boxes a primitive result; otherwise `bound` is the
//! body itself. An argument the generic path cannot accept goes to
//! `entry_fail`, which hands the call to the interpreter.
//!
//! After the body come one stub per deopt site (`pushi index; jmp
//! trampoline`) and the shared trampoline (`saveregs; deoptexit`).
//! Patchpoints are `nop`s registered with the code buffer and later
//! rewritten to jump to their stub.

use std::collections::BTreeMap;

use kiln_hir::{PrimKind, RefKind};
use kiln_rt::{ObjKind, WatchKey};

use crate::deopt::{DeoptEntry, DeoptMetadata, FrameMeta, LiveValue, Location};
use crate::error::CodegenError;
use crate::frame::FrameLayout;
use crate::isa::{
    AluOp, Cond, Gp, Helper, Inst, ARG_COUNT, ARG_FUNC, ARG_PTR, INSTR_SIZE, NUM_GPS, RET, SCRATCH0, SCRATCH1, WORD,
};
use crate::lir::{DeoptId, LirFunction, LirInstr, LirTerm, Operand, VReg};
use crate::regalloc::{Allocation, Assignment};

pub const GENERIC_ENTRY_OFFSET: usize = 0;
pub const REENTRY_OFFSET: usize = INSTR_SIZE;
pub const STATIC_ENTRY_OFFSET: usize = 2 * INSTR_SIZE;

/// Stack a deopt exit needs: the stub's index word plus `saveregs`.
pub const DEOPT_SAVE_AREA: u32 = (NUM_GPS as u32 + 1) * WORD as u32;

/// A rewritable jump slot, relative to the start of the function's code.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PatchSite {
    pub offset: usize,
    pub key: WatchKey,
    /// Deopt stub the slot jumps to once patched.
    pub target: usize,
}

impl PatchSite {
    /// The jump that replaces the `nop`.
    pub fn jump(&self) -> Inst {
        Inst::Jmp {
            rel: (self.target as i64 - (self.offset + INSTR_SIZE) as i64) as i32,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EmittedCode {
    pub bytes: Vec<u8>,
    pub patch_sites: Vec<PatchSite>,
    pub deopt: DeoptMetadata,
    /// Deepest machine stack use of one invocation, in bytes.
    pub stack_size: u32,
    pub spill_size: u32,
    pub opcode_counts: BTreeMap<&'static str, u32>,
}

impl EmittedCode {
    pub fn code_size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct Label(usize);

struct Emitter<'a> {
    func: &'a LirFunction,
    alloc: &'a Allocation,
    layout: FrameLayout,
    insts: Vec<Inst>,
    /// Instruction index of each bound label.
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
    block_labels: Vec<Label>,
    deopt_labels: Vec<Label>,
    patch_points: Vec<(usize, WatchKey, Label)>,
}

pub fn emit(func: &LirFunction, alloc: &Allocation) -> Result<EmittedCode, CodegenError> {
    let outgoing = func
        .blocks
        .iter()
        .flat_map(|b| &b.instrs)
        .filter_map(|i| match i {
            LirInstr::Call { args, .. } => Some(args.len() as u32),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    let layout = FrameLayout::new(
        alloc.used_callee_saved.clone(),
        func.inline_depth,
        alloc.spill_slots,
        outgoing,
    );
    let mut e = Emitter {
        func,
        alloc,
        layout,
        insts: Vec::new(),
        labels: Vec::new(),
        fixups: Vec::new(),
        block_labels: Vec::new(),
        deopt_labels: Vec::new(),
        patch_points: Vec::new(),
    };
    e.block_labels = func.blocks.iter().map(|_| e.new_label()).collect();
    e.deopt_labels = func.deopts.iter().map(|_| e.new_label()).collect();
    e.emit_function()
}

impl Emitter<'_> {
    // ── Labels ─────────────────────────────────────────────────────

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.insts.len());
    }

    fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    fn jmp(&mut self, target: Label) {
        self.fixups.push((self.insts.len(), target));
        self.push(Inst::Jmp { rel: 0 });
    }

    fn jcc(&mut self, cond: Cond, target: Label) {
        self.fixups.push((self.insts.len(), target));
        self.push(Inst::Jcc { cond, rel: 0 });
    }

    fn call_local(&mut self, target: Label) {
        self.fixups.push((self.insts.len(), target));
        self.push(Inst::CallLocal { rel: 0 });
    }

    fn block_label(&self, id: crate::lir::LirBlockId) -> Label {
        self.block_labels[self.block_index(id)]
    }

    fn block_index(&self, id: crate::lir::LirBlockId) -> usize {
        self.func.blocks.iter().position(|b| b.id == id).unwrap_or(0)
    }

    fn label_offset(&self, label: Label) -> Result<usize, CodegenError> {
        self.labels[label.0]
            .map(|i| i * INSTR_SIZE)
            .ok_or(CodegenError::BadJump(-1))
    }

    // ── Operands ───────────────────────────────────────────────────

    fn location(&self, r: VReg) -> Result<Assignment, CodegenError> {
        self.alloc
            .location(r)
            .ok_or_else(|| CodegenError::UndefinedValue(r.to_string()))
    }

    /// A register holding `r`, loading spilled values into `scratch`.
    fn load(&mut self, r: VReg, scratch: Gp) -> Result<Gp, CodegenError> {
        Ok(match self.location(r)? {
            Assignment::Reg(g) => g,
            Assignment::Spill(slot) => {
                let offset = self.layout.spill_offset(slot);
                self.push(Inst::Load {
                    dst: scratch,
                    base: Gp::FP,
                    offset,
                });
                scratch
            }
        })
    }

    fn operand(&mut self, op: Operand, scratch: Gp) -> Result<Gp, CodegenError> {
        match op {
            Operand::Reg(r) => self.load(r, scratch),
            Operand::Imm(imm) => {
                self.push(Inst::MovImm { dst: scratch, imm });
                Ok(scratch)
            }
        }
    }

    /// Register to compute `dst` into; spilled values go through `SCRATCH0`.
    fn def_reg(&self, dst: VReg) -> Result<Gp, CodegenError> {
        Ok(match self.location(dst)? {
            Assignment::Reg(g) => g,
            Assignment::Spill(_) => SCRATCH0,
        })
    }

    /// Move a value computed in `src` to `dst`'s home.
    fn store(&mut self, dst: VReg, src: Gp) -> Result<(), CodegenError> {
        match self.location(dst)? {
            Assignment::Reg(g) if g == src => {}
            Assignment::Reg(g) => self.push(Inst::Mov { dst: g, src }),
            Assignment::Spill(slot) => {
                let offset = self.layout.spill_offset(slot);
                self.push(Inst::Store {
                    src,
                    base: Gp::FP,
                    offset,
                });
            }
        }
        Ok(())
    }

    fn live_value(&self, r: VReg) -> Result<LiveValue, CodegenError> {
        let location = match self.location(r)? {
            Assignment::Reg(g) => Location::Reg(g),
            Assignment::Spill(slot) => Location::Stack(self.layout.spill_offset(slot)),
        };
        Ok(LiveValue {
            location,
            kind: self.func.kind(r),
        })
    }

    // ── Function ───────────────────────────────────────────────────

    fn emit_function(mut self) -> Result<EmittedCode, CodegenError> {
        let generic = self.new_label();
        let bound = self.new_label();
        let body = self.new_label();
        let entry_fail = self.new_label();
        let trampoline = self.new_label();
        let is_static = self.func.is_static;

        self.jmp(generic);
        self.jmp(bound);
        self.jmp(if is_static { body } else { bound });

        self.bind(generic);
        self.push(Inst::CmpImm {
            a: ARG_COUNT,
            imm: self.func.nargs() as i64,
        });
        self.jcc(Cond::Ne, entry_fail);

        self.bind(bound);
        let mut wrapper_size = 0;
        if is_static {
            wrapper_size = self.emit_static_wrapper(body, entry_fail);
        }

        self.bind(body);
        self.emit_prologue();
        for i in 0..self.func.blocks.len() {
            self.emit_block(i)?;
        }

        let mut deopt = DeoptMetadata::new();
        for (i, site) in self.func.deopts.iter().enumerate() {
            let label = self.deopt_labels[i];
            self.bind(label);
            let index = deopt.push(self.deopt_entry(site)?);
            self.push(Inst::PushImm { imm: i64::from(index) });
            self.jmp(trampoline);
        }
        self.bind(trampoline);
        self.push(Inst::SaveRegs);
        self.push(Inst::DeoptExit);

        self.bind(entry_fail);
        self.emit_entry_fail();

        for &(at, label) in &self.fixups {
            let target = self.label_offset(label)?;
            let rel = (target as i64 - ((at + 1) * INSTR_SIZE) as i64) as i32;
            self.insts[at] = match self.insts[at] {
                Inst::Jmp { .. } => Inst::Jmp { rel },
                Inst::Jcc { cond, .. } => Inst::Jcc { cond, rel },
                Inst::CallLocal { .. } => Inst::CallLocal { rel },
                other => other,
            };
        }

        let mut patch_sites = Vec::with_capacity(self.patch_points.len());
        for &(at, key, label) in &self.patch_points {
            patch_sites.push(PatchSite {
                offset: at * INSTR_SIZE,
                key,
                target: self.label_offset(label)?,
            });
        }

        let mut opcode_counts = BTreeMap::new();
        for inst in &self.insts {
            *opcode_counts.entry(inst.mnemonic()).or_insert(0u32) += 1;
        }
        let bytes: Vec<u8> = self.insts.iter().flat_map(|i| i.encode()).collect();
        // Return address and saved fp, for the body and the wrapper; the
        // entry_fail frame holds three words on top of those. A deopt exit
        // pushes its index and every register below the deepest frame.
        let body_size = self.layout.frame_size() as u32 + 2 * WORD as u32 + wrapper_size;
        let stack_size = body_size.max(5 * WORD as u32) + DEOPT_SAVE_AREA;
        deopt.freeze();

        tracing::debug!(
            function = %self.func.name,
            code_size = bytes.len(),
            stack_size,
            deopts = deopt.len(),
            patch_sites = patch_sites.len(),
            "emitted KX code"
        );
        Ok(EmittedCode {
            bytes,
            patch_sites,
            deopt,
            stack_size,
            spill_size: self.layout.spill_size(),
            opcode_counts,
        })
    }

    fn emit_frame_setup(&mut self, size: i32) {
        self.push(Inst::Push { src: Gp::FP });
        self.push(Inst::Mov { dst: Gp::FP, src: Gp::SP });
        if size > 0 {
            self.push(Inst::AluImm {
                op: AluOp::Sub,
                dst: Gp::SP,
                a: Gp::SP,
                imm: i64::from(size),
            });
        }
    }

    fn emit_frame_teardown(&mut self) {
        self.push(Inst::Mov { dst: Gp::SP, src: Gp::FP });
        self.push(Inst::Pop { dst: Gp::FP });
    }

    fn emit_prologue(&mut self) {
        self.emit_frame_setup(self.layout.frame_size());
        for (i, &reg) in self.layout.callee_saved.clone().iter().enumerate() {
            let offset = self.layout.callee_save_offset(i);
            self.push(Inst::Store {
                src: reg,
                base: Gp::FP,
                offset,
            });
        }
        let (args, func) = (self.layout.args_offset(), self.layout.func_offset());
        self.push(Inst::Store {
            src: ARG_PTR,
            base: Gp::FP,
            offset: args,
        });
        self.push(Inst::Store {
            src: ARG_FUNC,
            base: Gp::FP,
            offset: func,
        });
    }

    fn emit_epilogue(&mut self) {
        for (i, &reg) in self.layout.callee_saved.clone().iter().enumerate() {
            let offset = self.layout.callee_save_offset(i);
            self.push(Inst::Load {
                dst: reg,
                base: Gp::FP,
                offset,
            });
        }
        self.emit_frame_teardown();
        self.push(Inst::Ret);
    }

    /// Check and unbox boxed arguments, run the body, box the result.
    /// Returns the wrapper's stack use in bytes.
    fn emit_static_wrapper(&mut self, body: Label, entry_fail: Label) -> u32 {
        let nargs = self.func.nargs();
        let area = WORD * nargs.max(1) as i32;
        let fail = self.new_label();
        self.emit_frame_setup(area);
        for i in (0..nargs).rev() {
            let offset = WORD * i as i32;
            self.push(Inst::Load {
                dst: SCRATCH0,
                base: ARG_PTR,
                offset,
            });
            if let Some(kind) = self.func.arg_kinds[i] {
                let boxed = match kind {
                    PrimKind::Int64 => ObjKind::Int,
                    PrimKind::Double => ObjKind::Float,
                    PrimKind::Bool => ObjKind::Bool,
                };
                self.push(Inst::LoadKind {
                    dst: SCRATCH1,
                    obj: SCRATCH0,
                });
                self.push(Inst::CmpImm {
                    a: SCRATCH1,
                    imm: i64::from(boxed.bit()),
                });
                self.jcc(Cond::Ne, fail);
                self.push(Inst::Unbox {
                    kind,
                    dst: SCRATCH0,
                    obj: SCRATCH0,
                });
            }
            self.push(Inst::Store {
                src: SCRATCH0,
                base: Gp::SP,
                offset,
            });
        }
        self.push(Inst::Mov { dst: ARG_PTR, src: Gp::SP });
        self.call_local(body);
        if let Some(kind) = self.func.return_kind {
            self.push(Inst::Store {
                src: RET,
                base: Gp::SP,
                offset: 0,
            });
            self.push(Inst::Call {
                helper: Helper::Box { kind },
                nargs: 1,
            });
        }
        self.emit_frame_teardown();
        self.push(Inst::Ret);

        self.bind(fail);
        self.emit_frame_teardown();
        self.push(Inst::MovImm {
            dst: ARG_COUNT,
            imm: nargs as i64,
        });
        self.jmp(entry_fail);
        area as u32 + 2 * WORD as u32
    }

    fn emit_entry_fail(&mut self) {
        self.emit_frame_setup(3 * WORD);
        for (i, reg) in [ARG_FUNC, ARG_PTR, ARG_COUNT].into_iter().enumerate() {
            self.push(Inst::Store {
                src: reg,
                base: Gp::SP,
                offset: WORD * i as i32,
            });
        }
        self.push(Inst::Call {
            helper: Helper::EntryCheckFailed,
            nargs: 3,
        });
        self.emit_frame_teardown();
        self.push(Inst::Ret);
    }

    fn deopt_entry(&self, site: &crate::lir::LirDeopt) -> Result<DeoptEntry, CodegenError> {
        let mut frames = Vec::with_capacity(site.frames.len());
        for f in &site.frames {
            let locals = f
                .locals
                .iter()
                .map(|l| l.map(|r| self.live_value(r)).transpose())
                .collect::<Result<Vec<_>, _>>()?;
            let stack = f
                .stack
                .iter()
                .map(|&r| self.live_value(r))
                .collect::<Result<Vec<_>, _>>()?;
            frames.push(FrameMeta {
                code: f.code.clone(),
                func: f.func,
                next_offset: f.next_offset,
                locals,
                stack,
            });
        }
        let owned = site
            .live
            .iter()
            .filter(|(_, kind)| *kind == RefKind::Owned)
            .map(|&(r, _)| self.live_value(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DeoptEntry {
            reason: site.reason,
            frames,
            owned,
            guilty: site.guilty.map(|g| self.live_value(g)).transpose()?,
            name: site.name,
            bc_offset: site.bc_offset,
        })
    }

    // ── Blocks ─────────────────────────────────────────────────────

    fn emit_block(&mut self, index: usize) -> Result<(), CodegenError> {
        let func = self.func;
        let block = &func.blocks[index];
        self.bind(self.block_labels[index]);
        for instr in &block.instrs {
            self.emit_instr(instr)?;
        }
        let next = func.blocks.get(index + 1).map(|b| b.id);
        match &block.term {
            LirTerm::Jump(t) => {
                if next != Some(*t) {
                    let label = self.block_label(*t);
                    self.jmp(label);
                }
            }
            LirTerm::Branch {
                cond,
                if_true,
                if_false,
            } => {
                let c = self.load(*cond, SCRATCH0)?;
                self.push(Inst::CmpImm { a: c, imm: 0 });
                let t = self.block_label(*if_true);
                self.jcc(Cond::Ne, t);
                if next != Some(*if_false) {
                    let f = self.block_label(*if_false);
                    self.jmp(f);
                }
            }
            LirTerm::Return(v) => {
                let r = self.load(*v, SCRATCH0)?;
                if r != RET {
                    self.push(Inst::Mov { dst: RET, src: r });
                }
                self.emit_epilogue();
            }
            LirTerm::Deopt(d) => self.jmp(self.deopt_labels[d.index()]),
            LirTerm::Trap => self.push(Inst::Trap),
        }
        Ok(())
    }

    fn deopt_if(&mut self, cond: Cond, deopt: DeoptId) {
        self.jcc(cond, self.deopt_labels[deopt.index()]);
    }

    fn emit_instr(&mut self, instr: &LirInstr) -> Result<(), CodegenError> {
        match instr {
            LirInstr::Const { dst, value } => {
                let d = self.def_reg(*dst)?;
                self.push(Inst::MovImm { dst: d, imm: *value });
                self.store(*dst, d)?;
            }
            LirInstr::ConstObj { dst, index } => {
                let d = self.def_reg(*dst)?;
                self.push(Inst::LoadConstObj { dst: d, index: *index });
                self.store(*dst, d)?;
            }
            LirInstr::Copy { dst, src } => {
                let s = self.load(*src, SCRATCH0)?;
                self.store(*dst, s)?;
            }
            LirInstr::LoadArg { dst, index } => {
                let offset = self.layout.args_offset();
                self.push(Inst::Load {
                    dst: SCRATCH1,
                    base: Gp::FP,
                    offset,
                });
                let d = self.def_reg(*dst)?;
                self.push(Inst::Load {
                    dst: d,
                    base: SCRATCH1,
                    offset: WORD * *index as i32,
                });
                self.store(*dst, d)?;
            }
            LirInstr::LoadFunc { dst } => {
                let offset = self.layout.func_offset();
                let d = self.def_reg(*dst)?;
                self.push(Inst::Load {
                    dst: d,
                    base: Gp::FP,
                    offset,
                });
                self.store(*dst, d)?;
            }
            LirInstr::Alu { op, dst, a, b } => {
                let ra = self.load(*a, SCRATCH0)?;
                let d = self.def_reg(*dst)?;
                match *b {
                    Operand::Imm(imm) => self.push(Inst::AluImm { op: *op, dst: d, a: ra, imm }),
                    Operand::Reg(r) => {
                        let rb = self.load(r, SCRATCH1)?;
                        self.push(Inst::Alu { op: *op, dst: d, a: ra, b: rb });
                    }
                }
                self.store(*dst, d)?;
            }
            LirInstr::CheckedArith { op, dst, a, b, deopt } => {
                let ra = self.load(*a, SCRATCH0)?;
                let rb = self.load(*b, SCRATCH1)?;
                let d = self.def_reg(*dst)?;
                self.push(Inst::CheckedArith { op: *op, dst: d, a: ra, b: rb });
                self.deopt_if(Cond::Fault, *deopt);
                self.store(*dst, d)?;
            }
            LirInstr::SetCmp { cond, dst, a, b } => {
                self.compare(*a, *b)?;
                let d = self.def_reg(*dst)?;
                self.push(Inst::SetCc { cond: *cond, dst: d });
                self.store(*dst, d)?;
            }
            LirInstr::Guard { cond, a, b, deopt } => {
                self.compare(*a, *b)?;
                self.deopt_if(*cond, *deopt);
            }
            LirInstr::LoadKind { dst, obj } => self.unary(*dst, *obj, |d, o| Inst::LoadKind { dst: d, obj: o })?,
            LirInstr::LoadClass { dst, obj } => self.unary(*dst, *obj, |d, o| Inst::LoadClass { dst: d, obj: o })?,
            LirInstr::Unbox { kind, dst, obj } => {
                let kind = *kind;
                self.unary(*dst, *obj, |d, o| Inst::Unbox { kind, dst: d, obj: o })?;
            }
            LirInstr::LoadField { dst, obj, index } => {
                let index = *index;
                self.unary(*dst, *obj, |d, o| Inst::LoadField { dst: d, obj: o, index })?;
            }
            LirInstr::StoreField { obj, src, index } => {
                let o = self.load(*obj, SCRATCH0)?;
                let s = self.load(*src, SCRATCH1)?;
                self.push(Inst::StoreField {
                    obj: o,
                    src: s,
                    index: *index,
                });
            }
            LirInstr::SeqLen { dst, obj } => self.unary(*dst, *obj, |d, o| Inst::SeqLen { dst: d, obj: o })?,
            LirInstr::SeqItem { dst, obj, index } => {
                let o = self.load(*obj, SCRATCH0)?;
                let i = self.load(*index, SCRATCH1)?;
                let d = self.def_reg(*dst)?;
                self.push(Inst::SeqItem { dst: d, obj: o, index: i });
                self.store(*dst, d)?;
            }
            LirInstr::LoadGlobal { dst, namespace, slot } => {
                let d = self.def_reg(*dst)?;
                self.push(Inst::LoadGlobal {
                    dst: d,
                    slot: *slot,
                    namespace: namespace.to_word(),
                });
                self.store(*dst, d)?;
            }
            LirInstr::LoadCell { dst, func, index } => {
                let index = *index;
                self.unary(*dst, *func, |d, f| Inst::LoadCell { dst: d, func: f, index })?;
            }
            LirInstr::StoreCell { func, src, index } => {
                let f = self.load(*func, SCRATCH0)?;
                let s = self.load(*src, SCRATCH1)?;
                self.push(Inst::StoreCell {
                    func: f,
                    src: s,
                    index: *index,
                });
            }
            LirInstr::LoadCode { dst, func } => self.unary(*dst, *func, |d, f| Inst::LoadCode { dst: d, func: f })?,
            LirInstr::CacheCheck { dst, obj, cache } => {
                let cache = *cache;
                self.unary(*dst, *obj, |d, o| Inst::CacheCheck { dst: d, obj: o, cache })?;
            }
            LirInstr::CacheLoad { dst, cache } => {
                let d = self.def_reg(*dst)?;
                self.push(Inst::CacheLoad { dst: d, cache: *cache });
                self.store(*dst, d)?;
            }
            LirInstr::Incref { src } => {
                let s = self.load(*src, SCRATCH0)?;
                self.push(Inst::Incref { src: s });
            }
            LirInstr::Decref { src } => {
                let s = self.load(*src, SCRATCH0)?;
                self.push(Inst::Decref { src: s });
            }
            LirInstr::XDecref { src } => {
                let s = self.load(*src, SCRATCH0)?;
                self.push(Inst::XDecref { src: s });
            }
            LirInstr::Call {
                dst,
                helper,
                args,
                deopt,
            } => {
                for (i, &arg) in args.iter().enumerate() {
                    let r = self.operand(arg, SCRATCH0)?;
                    self.push(Inst::Store {
                        src: r,
                        base: Gp::SP,
                        offset: WORD * i as i32,
                    });
                }
                self.push(Inst::Call {
                    helper: *helper,
                    nargs: args.len() as u8,
                });
                if let Some(d) = deopt {
                    self.deopt_if(Cond::Fault, *d);
                }
                if let Some(dst) = dst {
                    self.store(*dst, RET)?;
                }
            }
            LirInstr::Patchpoint { deopt, key } => {
                self.patch_points
                    .push((self.insts.len(), *key, self.deopt_labels[deopt.index()]));
                self.push(Inst::Nop);
            }
            LirInstr::StoreInlineFrame { depth, func } => {
                let offset = self.layout.inline_frame_offset(*depth);
                self.push(Inst::MovImm {
                    dst: SCRATCH0,
                    imm: func.to_word() as i64,
                });
                self.push(Inst::Store {
                    src: SCRATCH0,
                    base: Gp::FP,
                    offset,
                });
            }
            LirInstr::SetOffset { offset } => self.push(Inst::SetOffset { offset: *offset }),
        }
        Ok(())
    }

    fn compare(&mut self, a: VReg, b: Operand) -> Result<(), CodegenError> {
        let ra = self.load(a, SCRATCH0)?;
        match b {
            Operand::Imm(imm) => self.push(Inst::CmpImm { a: ra, imm }),
            Operand::Reg(r) => {
                let rb = self.load(r, SCRATCH1)?;
                self.push(Inst::Cmp { a: ra, b: rb });
            }
        }
        Ok(())
    }

    fn unary(&mut self, dst: VReg, src: VReg, make: impl FnOnce(Gp, Gp) -> Inst) -> Result<(), CodegenError> {
        let s = self.load(src, SCRATCH1)?;
        let d = self.def_reg(dst)?;
        self.push(make(d, s));
        self.store(dst, d)
    }
}
