//! Low-level IR.
//!
//! LIR is close to KX: values are word-sized virtual registers, object
//! operations are explicit, and everything that can run user code is a
//! `Call` to a runtime [`Helper`]. Guards become a compare plus a
//! conditional deopt. Phis are gone; lowering turns them into copies at the
//! end of each predecessor, so a vreg may have several definitions.
//!
//! Blocks are stored in emission order, which starts with the entry block.

use std::fmt::{self, Write};
use std::sync::Arc;

use kiln_hir::{DeoptReason, PrimKind, RefKind, Type};
use kiln_rt::{BinOp, CodeUnit, ConstValue, Name, ObjRef, WatchKey};
use smallvec::SmallVec;

use crate::isa::{AluOp, Cond, Helper};

// ── IDs ────────────────────────────────────────────────────────────

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VReg(u32);

impl VReg {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        VReg(raw)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct LirBlockId(pub u32);

impl LirBlockId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LirBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Index into [`LirFunction::deopts`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct DeoptId(pub u32);

impl DeoptId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a machine word held in a vreg means.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ValueKind {
    /// An object reference, possibly `NULL`.
    Object,
    Int64,
    /// IEEE bits.
    Double,
    /// `0` or `1`.
    Bool,
}

impl ValueKind {
    pub fn of(ty: Type) -> ValueKind {
        match PrimKind::of(ty) {
            Some(PrimKind::Int64) => ValueKind::Int64,
            Some(PrimKind::Double) => ValueKind::Double,
            Some(PrimKind::Bool) => ValueKind::Bool,
            None => ValueKind::Object,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Operand {
    Reg(VReg),
    Imm(i64),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(v) => write!(f, "${v}"),
        }
    }
}

impl From<VReg> for Operand {
    fn from(r: VReg) -> Self {
        Operand::Reg(r)
    }
}

// ── Deopt sites ────────────────────────────────────────────────────

/// One logical frame at a deopt site.
#[derive(Clone, Debug, PartialEq)]
pub struct LirFrame {
    pub code: Arc<CodeUnit>,
    /// `None` for the compiled function itself.
    pub func: Option<ObjRef>,
    pub next_offset: u32,
    pub locals: Vec<Option<VReg>>,
    pub stack: Vec<VReg>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LirDeopt {
    pub reason: DeoptReason,
    /// Outermost first.
    pub frames: Vec<LirFrame>,
    /// References compiled code owns at this point, with how.
    pub live: Vec<(VReg, RefKind)>,
    pub guilty: Option<VReg>,
    /// Variable or attribute named by an unbound-value check.
    pub name: Option<Name>,
    pub bc_offset: u32,
}

impl LirDeopt {
    pub fn visit_regs(&self, mut f: impl FnMut(VReg)) {
        for frame in &self.frames {
            frame.locals.iter().flatten().for_each(|&r| f(r));
            frame.stack.iter().for_each(|&r| f(r));
        }
        for &(r, _) in &self.live {
            f(r);
        }
        if let Some(g) = self.guilty {
            f(g);
        }
    }
}

// ── Instructions ───────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum LirInstr {
    Const { dst: VReg, value: i64 },
    /// A constant materialized when the code is installed.
    ConstObj { dst: VReg, index: u32 },
    Copy { dst: VReg, src: VReg },
    LoadArg { dst: VReg, index: u32 },
    /// The function object the code runs for.
    LoadFunc { dst: VReg },
    Alu { op: AluOp, dst: VReg, a: VReg, b: Operand },
    CheckedArith { op: BinOp, dst: VReg, a: VReg, b: VReg, deopt: DeoptId },
    SetCmp { cond: Cond, dst: VReg, a: VReg, b: Operand },
    /// Deopt when `a cond b` holds.
    Guard { cond: Cond, a: VReg, b: Operand, deopt: DeoptId },

    LoadKind { dst: VReg, obj: VReg },
    LoadClass { dst: VReg, obj: VReg },
    Unbox { kind: PrimKind, dst: VReg, obj: VReg },
    LoadField { dst: VReg, obj: VReg, index: u32 },
    StoreField { obj: VReg, src: VReg, index: u32 },
    SeqLen { dst: VReg, obj: VReg },
    SeqItem { dst: VReg, obj: VReg, index: VReg },
    LoadGlobal { dst: VReg, namespace: ObjRef, slot: u32 },
    LoadCell { dst: VReg, func: VReg, index: u32 },
    StoreCell { func: VReg, src: VReg, index: u32 },
    LoadCode { dst: VReg, func: VReg },
    CacheCheck { dst: VReg, obj: VReg, cache: u32 },
    CacheLoad { dst: VReg, cache: u32 },
    Incref { src: VReg },
    Decref { src: VReg },
    XDecref { src: VReg },

    /// Marshal `args` into the outgoing area and call `helper`. With a
    /// deopt, a failed call deopts right after returning.
    Call {
        dst: Option<VReg>,
        helper: Helper,
        args: SmallVec<[Operand; 4]>,
        deopt: Option<DeoptId>,
    },
    /// Falls through until `key` changes; then jumps to the deopt.
    Patchpoint { deopt: DeoptId, key: WatchKey },
    /// Record the function of an inlined frame in its native frame slot.
    StoreInlineFrame { depth: u32, func: ObjRef },
    SetOffset { offset: u32 },
}

impl LirInstr {
    pub fn output(&self) -> Option<VReg> {
        match self {
            LirInstr::Const { dst, .. }
            | LirInstr::ConstObj { dst, .. }
            | LirInstr::Copy { dst, .. }
            | LirInstr::LoadArg { dst, .. }
            | LirInstr::LoadFunc { dst }
            | LirInstr::Alu { dst, .. }
            | LirInstr::CheckedArith { dst, .. }
            | LirInstr::SetCmp { dst, .. }
            | LirInstr::LoadKind { dst, .. }
            | LirInstr::LoadClass { dst, .. }
            | LirInstr::Unbox { dst, .. }
            | LirInstr::LoadField { dst, .. }
            | LirInstr::SeqLen { dst, .. }
            | LirInstr::SeqItem { dst, .. }
            | LirInstr::LoadGlobal { dst, .. }
            | LirInstr::LoadCell { dst, .. }
            | LirInstr::LoadCode { dst, .. }
            | LirInstr::CacheCheck { dst, .. }
            | LirInstr::CacheLoad { dst, .. } => Some(*dst),
            LirInstr::Call { dst, .. } => *dst,
            LirInstr::Guard { .. }
            | LirInstr::StoreField { .. }
            | LirInstr::StoreCell { .. }
            | LirInstr::Incref { .. }
            | LirInstr::Decref { .. }
            | LirInstr::XDecref { .. }
            | LirInstr::Patchpoint { .. }
            | LirInstr::StoreInlineFrame { .. }
            | LirInstr::SetOffset { .. } => None,
        }
    }

    /// Register operands, not counting deopt metadata.
    pub fn visit_operands(&self, mut f: impl FnMut(VReg)) {
        let mut op = |o: &Operand| {
            if let Operand::Reg(r) = o {
                f(*r);
            }
        };
        match self {
            LirInstr::Const { .. }
            | LirInstr::ConstObj { .. }
            | LirInstr::LoadArg { .. }
            | LirInstr::LoadFunc { .. }
            | LirInstr::LoadGlobal { .. }
            | LirInstr::CacheLoad { .. }
            | LirInstr::Patchpoint { .. }
            | LirInstr::StoreInlineFrame { .. }
            | LirInstr::SetOffset { .. } => {}
            LirInstr::Copy { src, .. }
            | LirInstr::Incref { src }
            | LirInstr::Decref { src }
            | LirInstr::XDecref { src } => op(&Operand::Reg(*src)),
            LirInstr::LoadKind { obj, .. }
            | LirInstr::LoadClass { obj, .. }
            | LirInstr::Unbox { obj, .. }
            | LirInstr::LoadField { obj, .. }
            | LirInstr::SeqLen { obj, .. }
            | LirInstr::CacheCheck { obj, .. } => op(&Operand::Reg(*obj)),
            LirInstr::LoadCell { func, .. } | LirInstr::LoadCode { func, .. } => op(&Operand::Reg(*func)),
            LirInstr::Alu { a, b, .. } | LirInstr::SetCmp { a, b, .. } | LirInstr::Guard { a, b, .. } => {
                op(&Operand::Reg(*a));
                op(b);
            }
            LirInstr::CheckedArith { a, b, .. } => {
                op(&Operand::Reg(*a));
                op(&Operand::Reg(*b));
            }
            LirInstr::StoreField { obj, src, .. } => {
                op(&Operand::Reg(*obj));
                op(&Operand::Reg(*src));
            }
            LirInstr::SeqItem { obj, index, .. } => {
                op(&Operand::Reg(*obj));
                op(&Operand::Reg(*index));
            }
            LirInstr::StoreCell { func, src, .. } => {
                op(&Operand::Reg(*func));
                op(&Operand::Reg(*src));
            }
            LirInstr::Call { args, .. } => args.iter().for_each(op),
        }
    }

    pub fn deopt(&self) -> Option<DeoptId> {
        match self {
            LirInstr::CheckedArith { deopt, .. }
            | LirInstr::Guard { deopt, .. }
            | LirInstr::Patchpoint { deopt, .. } => Some(*deopt),
            LirInstr::Call { deopt, .. } => *deopt,
            _ => None,
        }
    }

    /// Clobbers every caller-saved register.
    pub fn is_call(&self) -> bool {
        matches!(self, LirInstr::Call { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LirTerm {
    Jump(LirBlockId),
    /// Taken when `cond` is non-zero.
    Branch {
        cond: VReg,
        if_true: LirBlockId,
        if_false: LirBlockId,
    },
    Return(VReg),
    Deopt(DeoptId),
    Trap,
}

impl LirTerm {
    pub fn successors(&self) -> SmallVec<[LirBlockId; 2]> {
        match self {
            LirTerm::Jump(t) => smallvec::smallvec![*t],
            LirTerm::Branch {
                if_true, if_false, ..
            } => smallvec::smallvec![*if_true, *if_false],
            LirTerm::Return(_) | LirTerm::Deopt(_) | LirTerm::Trap => SmallVec::new(),
        }
    }

    pub fn visit_operands(&self, mut f: impl FnMut(VReg)) {
        match self {
            LirTerm::Branch { cond, .. } => f(*cond),
            LirTerm::Return(v) => f(*v),
            LirTerm::Jump(_) | LirTerm::Deopt(_) | LirTerm::Trap => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LirBlock {
    pub id: LirBlockId,
    pub instrs: Vec<LirInstr>,
    pub term: LirTerm,
}

// ── Functions ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct LirFunction {
    pub name: Name,
    pub code: Arc<CodeUnit>,
    pub blocks: Vec<LirBlock>,
    /// Per vreg.
    pub kinds: Vec<ValueKind>,
    pub deopts: Vec<LirDeopt>,
    pub arg_kinds: Vec<Option<PrimKind>>,
    pub return_kind: Option<PrimKind>,
    /// Has a statically-typed entry point taking raw primitives.
    pub is_static: bool,
    /// Objects the code embeds and must keep alive.
    pub references: Vec<ObjRef>,
    pub consts: Vec<ConstValue>,
    pub names: Vec<Name>,
    pub inlined_codes: Vec<Arc<CodeUnit>>,
    pub num_attr_caches: u32,
    /// Deepest nesting of inlined frames.
    pub inline_depth: u32,
}

impl LirFunction {
    pub fn num_vregs(&self) -> usize {
        self.kinds.len()
    }

    pub fn new_vreg(&mut self, kind: ValueKind) -> VReg {
        let r = VReg::new(self.kinds.len() as u32);
        self.kinds.push(kind);
        r
    }

    pub fn kind(&self, r: VReg) -> ValueKind {
        self.kinds.get(r.index()).copied().unwrap_or(ValueKind::Object)
    }

    pub fn deopt(&self, id: DeoptId) -> &LirDeopt {
        &self.deopts[id.index()]
    }

    pub fn nargs(&self) -> usize {
        self.arg_kinds.len()
    }

    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len() + 1).sum()
    }
}

// ── Printing ───────────────────────────────────────────────────────

impl fmt::Display for LirInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirInstr::Const { dst, value } => write!(f, "{dst} = Const {value}"),
            LirInstr::ConstObj { dst, index } => write!(f, "{dst} = ConstObj #{index}"),
            LirInstr::Copy { dst, src } => write!(f, "{dst} = Copy {src}"),
            LirInstr::LoadArg { dst, index } => write!(f, "{dst} = LoadArg {index}"),
            LirInstr::LoadFunc { dst } => write!(f, "{dst} = LoadFunc"),
            LirInstr::Alu { op, dst, a, b } => write!(f, "{dst} = {op:?} {a}, {b}"),
            LirInstr::CheckedArith { op, dst, a, b, deopt } => {
                write!(f, "{dst} = Checked{op:?} {a}, {b} deopt#{}", deopt.0)
            }
            LirInstr::SetCmp { cond, dst, a, b } => write!(f, "{dst} = Set{cond:?} {a}, {b}"),
            LirInstr::Guard { cond, a, b, deopt } => {
                write!(f, "DeoptIf{cond:?} {a}, {b} deopt#{}", deopt.0)
            }
            LirInstr::LoadKind { dst, obj } => write!(f, "{dst} = LoadKind {obj}"),
            LirInstr::LoadClass { dst, obj } => write!(f, "{dst} = LoadClass {obj}"),
            LirInstr::Unbox { kind, dst, obj } => write!(f, "{dst} = Unbox{kind:?} {obj}"),
            LirInstr::LoadField { dst, obj, index } => write!(f, "{dst} = LoadField {obj}.{index}"),
            LirInstr::StoreField { obj, src, index } => write!(f, "StoreField {obj}.{index}, {src}"),
            LirInstr::SeqLen { dst, obj } => write!(f, "{dst} = SeqLen {obj}"),
            LirInstr::SeqItem { dst, obj, index } => write!(f, "{dst} = SeqItem {obj}[{index}]"),
            LirInstr::LoadGlobal { dst, namespace, slot } => {
                write!(f, "{dst} = LoadGlobal {namespace:?}[{slot}]")
            }
            LirInstr::LoadCell { dst, func, index } => write!(f, "{dst} = LoadCell {func}.{index}"),
            LirInstr::StoreCell { func, src, index } => write!(f, "StoreCell {func}.{index}, {src}"),
            LirInstr::LoadCode { dst, func } => write!(f, "{dst} = LoadCode {func}"),
            LirInstr::CacheCheck { dst, obj, cache } => write!(f, "{dst} = CacheCheck {obj}, #{cache}"),
            LirInstr::CacheLoad { dst, cache } => write!(f, "{dst} = CacheLoad #{cache}"),
            LirInstr::Incref { src } => write!(f, "Incref {src}"),
            LirInstr::Decref { src } => write!(f, "Decref {src}"),
            LirInstr::XDecref { src } => write!(f, "XDecref {src}"),
            LirInstr::Call {
                dst,
                helper,
                args,
                deopt,
            } => {
                if let Some(d) = dst {
                    write!(f, "{d} = ")?;
                }
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                write!(f, "Call {}({})", helper.name(), args.join(", "))?;
                if let Some(d) = deopt {
                    write!(f, " deopt#{}", d.0)?;
                }
                Ok(())
            }
            LirInstr::Patchpoint { deopt, key } => write!(f, "Patchpoint {key:?} deopt#{}", deopt.0),
            LirInstr::StoreInlineFrame { depth, func } => write!(f, "StoreInlineFrame {depth}, {func:?}"),
            LirInstr::SetOffset { offset } => write!(f, "SetOffset {offset}"),
        }
    }
}

impl fmt::Display for LirTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LirTerm::Jump(t) => write!(f, "Jump {t}"),
            LirTerm::Branch {
                cond,
                if_true,
                if_false,
            } => write!(f, "Branch {cond} -> {if_true}, {if_false}"),
            LirTerm::Return(v) => write!(f, "Return {v}"),
            LirTerm::Deopt(d) => write!(f, "Deopt deopt#{}", d.0),
            LirTerm::Trap => f.write_str("Trap"),
        }
    }
}

pub fn print_lir(func: &LirFunction) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "lir {} {{", func.name);
    for block in &func.blocks {
        let _ = writeln!(out, "  {}:", block.id);
        for instr in &block.instrs {
            let _ = writeln!(out, "    {instr}");
        }
        let _ = writeln!(out, "    {}", block.term);
    }
    out.push('}');
    out
}
