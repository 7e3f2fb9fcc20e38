//! HIR instructions.
//!
//! Every instruction kind belongs to a closed [`Opcode`] set. Operand order
//! is fixed per kind (see [`Instr::visit_operands`]); stolen-operand masks
//! in [`crate::effects`] index into it.
//!
//! Instructions that may deoptimize carry a [`DeoptInfo`] whose
//! [`FrameState`] describes the interpreter frame (and, for inlined code,
//! its callers) to rebuild.

use std::fmt;
use std::sync::Arc;

use kiln_rt::{BinOp, BuiltinMethodId, CmpOp, CodeUnit, Name, ObjRef, WatchKey};
use smallvec::SmallVec;

use crate::types::Type;

// ── IDs ────────────────────────────────────────────────────────────

/// Virtual register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Reg(u32);

impl Reg {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Reg(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BlockId(u32);

impl BlockId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        BlockId(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

// ── Operand payloads ───────────────────────────────────────────────

/// Constant operand of `LoadConst`.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum HirConst {
    /// Index into [`crate::Function::consts`].
    Object(u32),
    /// A live runtime object held alive by the compiled code.
    Ref(ObjRef),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Nullptr,
}

/// Unboxed representation used by box and unbox instructions.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PrimKind {
    Int64,
    Double,
    Bool,
}

impl PrimKind {
    pub fn boxed_type(self) -> Type {
        match self {
            PrimKind::Int64 => Type::LONG,
            PrimKind::Double => Type::FLOAT,
            PrimKind::Bool => Type::BOOL,
        }
    }

    pub fn unboxed_type(self) -> Type {
        match self {
            PrimKind::Int64 => Type::CINT64,
            PrimKind::Double => Type::CDOUBLE,
            PrimKind::Bool => Type::CBOOL,
        }
    }

    pub fn of(ty: Type) -> Option<PrimKind> {
        if ty.is_subtype(Type::CINT64) {
            Some(PrimKind::Int64)
        } else if ty.is_subtype(Type::CDOUBLE) {
            Some(PrimKind::Double)
        } else if ty.is_subtype(Type::CBOOL) {
            Some(PrimKind::Bool)
        } else {
            None
        }
    }
}

/// Why compiled code hands a frame back to the interpreter.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DeoptReason {
    GuardFailure,
    UnhandledException,
    Raise,
    UnboundLocal,
    UnboundFreevar,
    UnhandledNullField,
}

impl DeoptReason {
    pub const ALL: [DeoptReason; 6] = [
        DeoptReason::GuardFailure,
        DeoptReason::UnhandledException,
        DeoptReason::Raise,
        DeoptReason::UnboundLocal,
        DeoptReason::UnboundFreevar,
        DeoptReason::UnhandledNullField,
    ];

    /// Whether the runtime already holds a pending exception when the
    /// deopt is taken.
    pub fn has_pending_exception(self) -> bool {
        matches!(self, DeoptReason::UnhandledException | DeoptReason::Raise)
    }
}

// ── Frame state ────────────────────────────────────────────────────

/// Interpreter state at a deopt point: enough to rebuild a frame.
#[derive(Clone, PartialEq, Debug)]
pub struct FrameState {
    pub code: Arc<CodeUnit>,
    /// The function owning this frame, or `None` for the compiled function.
    pub func: Option<ObjRef>,
    /// Bytecode offset the interpreter resumes at.
    pub next_offset: u32,
    pub locals: Vec<Option<Reg>>,
    pub stack: Vec<Reg>,
    /// Caller frame for inlined code.
    pub parent: Option<Box<FrameState>>,
}

impl FrameState {
    pub fn new(code: Arc<CodeUnit>, func: Option<ObjRef>) -> Self {
        let nlocals = code.nlocals();
        FrameState {
            code,
            func,
            next_offset: 0,
            locals: vec![None; nlocals],
            stack: Vec::new(),
            parent: None,
        }
    }

    /// Number of frames in the chain.
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    pub fn visit_regs(&self, f: &mut impl FnMut(Reg)) {
        for r in self.locals.iter().flatten() {
            f(*r);
        }
        for &r in &self.stack {
            f(r);
        }
        if let Some(parent) = &self.parent {
            parent.visit_regs(f);
        }
    }

    pub fn map_regs(&mut self, f: &mut impl FnMut(&mut Reg)) {
        for r in self.locals.iter_mut().flatten() {
            f(r);
        }
        for r in &mut self.stack {
            f(r);
        }
        if let Some(parent) = &mut self.parent {
            parent.map_regs(f);
        }
    }

    /// Append `outer` at the root of this chain.
    pub fn set_outermost_parent(&mut self, outer: FrameState) {
        match &mut self.parent {
            Some(p) => p.set_outermost_parent(outer),
            None => self.parent = Some(Box::new(outer)),
        }
    }
}

/// Reference-count state of a live value at a deopt point.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RefKind {
    /// Not a counted reference (primitive, immortal, or null).
    Uncounted,
    /// Compiled code owns one reference the rebuilt frame takes over.
    Owned,
    /// Compiled code borrows; the rebuilt frame needs a new reference.
    Borrowed,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LiveRef {
    pub reg: Reg,
    pub kind: RefKind,
}

#[derive(Clone, PartialEq, Debug)]
pub struct DeoptInfo {
    pub frame: FrameState,
    /// The value whose type check failed, for profiling.
    pub guilty: Option<Reg>,
    /// Filled by refcount insertion.
    pub live: Vec<LiveRef>,
}

impl DeoptInfo {
    pub fn new(frame: FrameState) -> Self {
        DeoptInfo {
            frame,
            guilty: None,
            live: Vec::new(),
        }
    }

    pub fn visit_regs(&self, f: &mut impl FnMut(Reg)) {
        self.frame.visit_regs(f);
        if let Some(g) = self.guilty {
            f(g);
        }
        for live in &self.live {
            f(live.reg);
        }
    }

    pub fn map_regs(&mut self, f: &mut impl FnMut(&mut Reg)) {
        self.frame.map_regs(f);
        if let Some(g) = &mut self.guilty {
            f(g);
        }
        for live in &mut self.live {
            f(&mut live.reg);
        }
    }
}

// ── Instructions ───────────────────────────────────────────────────

#[derive(Clone, PartialEq, Debug)]
pub enum InstrKind {
    LoadArg { dst: Reg, idx: u32 },
    LoadConst { dst: Reg, value: HirConst },
    LoadCurrentFunc { dst: Reg },
    Assign { dst: Reg, src: Reg },
    Phi { dst: Reg, inputs: Vec<(BlockId, Reg)> },

    GuardType { dst: Reg, src: Reg, ty: Type },
    GuardIs { dst: Reg, src: Reg, target: ObjRef },
    CheckVar { dst: Reg, src: Reg, name: Name },
    CheckFreevar { dst: Reg, src: Reg, name: Name },
    CheckField { dst: Reg, src: Reg, name: Name },
    /// Normalized index into a tuple or list, deopting when out of range.
    CheckSequenceBounds { dst: Reg, seq: Reg, index: Reg },

    /// Read a namespace slot recorded by the preloader.
    LoadGlobalCached { dst: Reg, namespace: ObjRef, slot: u32, name: Name },
    LoadGlobal { dst: Reg, name: Name },
    StoreGlobal { value: Reg, name: Name },
    LoadAttr { dst: Reg, obj: Reg, name: Name },
    StoreAttr { obj: Reg, value: Reg, name: Name },
    LoadField { dst: Reg, obj: Reg, index: u32, name: Name },
    /// Steals `value`.
    StoreField { obj: Reg, value: Reg, index: u32, name: Name },

    LoadTypeAttrCacheItem { dst: Reg, cache: u32 },
    /// `CBool`: the cache entry matches the receiver's type and version.
    CheckTypeAttrCache { dst: Reg, receiver: Reg, cache: u32 },
    FillTypeAttrCache { dst: Reg, receiver: Reg, name: Name, cache: u32 },

    /// Attribute lookup for a call site; the self slot is passed separately.
    LoadMethod { dst: Reg, receiver: Reg, name: Name },
    CallMethod { dst: Reg, callable: Reg, self_or_null: Reg, args: Vec<Reg> },
    CallStatic { dst: Reg, method: BuiltinMethodId, args: Vec<Reg> },
    VectorCall { dst: Reg, func: Reg, args: Vec<Reg> },
    InvokeStaticFunction { dst: Reg, target: ObjRef, args: Vec<Reg>, ret: Type },

    BinaryOp { dst: Reg, op: BinOp, left: Reg, right: Reg },
    LongBinaryOp { dst: Reg, op: BinOp, left: Reg, right: Reg },
    /// Checked `CInt64` arithmetic; deopts on overflow or a zero divisor.
    IntBinaryOp { dst: Reg, op: BinOp, left: Reg, right: Reg },
    UnaryNegative { dst: Reg, src: Reg },
    Compare { dst: Reg, op: CmpOp, left: Reg, right: Reg },
    PrimitiveCompare { dst: Reg, op: CmpOp, left: Reg, right: Reg },
    CompareBool { dst: Reg, op: CmpOp, left: Reg, right: Reg },
    IsTruthy { dst: Reg, src: Reg },
    PrimitiveNot { dst: Reg, src: Reg },
    PrimitiveBox { dst: Reg, src: Reg, kind: PrimKind },
    PrimitiveUnbox { dst: Reg, src: Reg, kind: PrimKind },

    /// Steals every item.
    MakeTuple { dst: Reg, items: Vec<Reg> },
    /// Steals every item.
    MakeList { dst: Reg, items: Vec<Reg> },
    BinarySubscr { dst: Reg, container: Reg, index: Reg },
    LoadTupleItem { dst: Reg, tuple: Reg, index: Reg },

    LoadFreevar { dst: Reg, idx: u32 },
    /// Steals `value`.
    StoreFreevar { value: Reg, idx: u32 },
    LoadFunctionCode { dst: Reg, func: Reg },

    /// Jump slot rewritten to a deopt when `key` changes.
    DeoptPatchpoint { key: WatchKey },
    BeginInlinedFunction { func: ObjRef, code: Arc<CodeUnit> },
    EndInlinedFunction { func: ObjRef },
    UpdatePrevInstr { offset: u32 },

    Incref { src: Reg },
    Decref { src: Reg },
    /// Decref tolerating `NULL`.
    XDecref { src: Reg },

    // Terminators.
    Branch { target: BlockId },
    CondBranch { cond: Reg, if_true: BlockId, if_false: BlockId },
    /// Steals `value`.
    Return { value: Reg },
    /// Steals `exc`.
    Raise { exc: Reg },
    Deopt,
    Unreachable,
}

macro_rules! opcodes {
    ($($name:ident),* $(,)?) => {
        /// Closed set of instruction kinds.
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
        pub enum Opcode {
            $($name),*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }
        }

        impl InstrKind {
            pub fn opcode(&self) -> Opcode {
                match self {
                    $(InstrKind::$name { .. } => Opcode::$name),*
                }
            }
        }
    };
}

opcodes! {
    LoadArg, LoadConst, LoadCurrentFunc, Assign, Phi,
    GuardType, GuardIs, CheckVar, CheckFreevar, CheckField, CheckSequenceBounds,
    LoadGlobalCached, LoadGlobal, StoreGlobal, LoadAttr, StoreAttr, LoadField, StoreField,
    LoadTypeAttrCacheItem, CheckTypeAttrCache, FillTypeAttrCache,
    LoadMethod, CallMethod, CallStatic, VectorCall, InvokeStaticFunction,
    BinaryOp, LongBinaryOp, IntBinaryOp, UnaryNegative, Compare, PrimitiveCompare,
    CompareBool, IsTruthy, PrimitiveNot, PrimitiveBox, PrimitiveUnbox,
    MakeTuple, MakeList, BinarySubscr, LoadTupleItem,
    LoadFreevar, StoreFreevar, LoadFunctionCode,
    DeoptPatchpoint, BeginInlinedFunction, EndInlinedFunction, UpdatePrevInstr,
    Incref, Decref, XDecref,
    Branch, CondBranch, Return, Raise, Deopt, Unreachable,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Branch
                | Opcode::CondBranch
                | Opcode::Return
                | Opcode::Raise
                | Opcode::Deopt
                | Opcode::Unreachable
        )
    }

    /// Instructions whose output is their first operand, possibly refined.
    pub fn is_passthrough(self) -> bool {
        matches!(
            self,
            Opcode::Assign
                | Opcode::GuardType
                | Opcode::GuardIs
                | Opcode::CheckVar
                | Opcode::CheckFreevar
                | Opcode::CheckField
        )
    }
}

/// Visit operands in their canonical order. Binding mode follows `$kind`.
macro_rules! each_operand {
    ($kind:expr, $f:ident, $iter:ident) => {
        match $kind {
            InstrKind::LoadArg { .. }
            | InstrKind::LoadConst { .. }
            | InstrKind::LoadCurrentFunc { .. }
            | InstrKind::LoadGlobalCached { .. }
            | InstrKind::LoadGlobal { .. }
            | InstrKind::LoadTypeAttrCacheItem { .. }
            | InstrKind::LoadFreevar { .. }
            | InstrKind::DeoptPatchpoint { .. }
            | InstrKind::BeginInlinedFunction { .. }
            | InstrKind::EndInlinedFunction { .. }
            | InstrKind::UpdatePrevInstr { .. }
            | InstrKind::Branch { .. }
            | InstrKind::Deopt
            | InstrKind::Unreachable => {}
            InstrKind::Assign { src, .. }
            | InstrKind::GuardType { src, .. }
            | InstrKind::GuardIs { src, .. }
            | InstrKind::CheckVar { src, .. }
            | InstrKind::CheckFreevar { src, .. }
            | InstrKind::CheckField { src, .. }
            | InstrKind::UnaryNegative { src, .. }
            | InstrKind::IsTruthy { src, .. }
            | InstrKind::PrimitiveNot { src, .. }
            | InstrKind::PrimitiveBox { src, .. }
            | InstrKind::PrimitiveUnbox { src, .. }
            | InstrKind::Incref { src }
            | InstrKind::Decref { src }
            | InstrKind::XDecref { src } => $f(src),
            InstrKind::StoreGlobal { value, .. }
            | InstrKind::StoreFreevar { value, .. }
            | InstrKind::Return { value } => $f(value),
            InstrKind::LoadAttr { obj, .. } | InstrKind::LoadField { obj, .. } => $f(obj),
            InstrKind::LoadMethod { receiver, .. }
            | InstrKind::CheckTypeAttrCache { receiver, .. }
            | InstrKind::FillTypeAttrCache { receiver, .. } => $f(receiver),
            InstrKind::LoadFunctionCode { func, .. } => $f(func),
            InstrKind::CondBranch { cond, .. } => $f(cond),
            InstrKind::Raise { exc } => $f(exc),
            InstrKind::Phi { inputs, .. } => {
                for (_, r) in inputs.$iter() {
                    $f(r);
                }
            }
            InstrKind::CheckSequenceBounds { seq, index, .. } => {
                $f(seq);
                $f(index);
            }
            InstrKind::StoreAttr { obj, value, .. } | InstrKind::StoreField { obj, value, .. } => {
                $f(obj);
                $f(value);
            }
            InstrKind::BinaryOp { left, right, .. }
            | InstrKind::LongBinaryOp { left, right, .. }
            | InstrKind::IntBinaryOp { left, right, .. }
            | InstrKind::Compare { left, right, .. }
            | InstrKind::PrimitiveCompare { left, right, .. }
            | InstrKind::CompareBool { left, right, .. } => {
                $f(left);
                $f(right);
            }
            InstrKind::BinarySubscr { container, index, .. } => {
                $f(container);
                $f(index);
            }
            InstrKind::LoadTupleItem { tuple, index, .. } => {
                $f(tuple);
                $f(index);
            }
            InstrKind::CallMethod { callable, self_or_null, args, .. } => {
                $f(callable);
                $f(self_or_null);
                for a in args.$iter() {
                    $f(a);
                }
            }
            InstrKind::VectorCall { func, args, .. } => {
                $f(func);
                for a in args.$iter() {
                    $f(a);
                }
            }
            InstrKind::CallStatic { args, .. }
            | InstrKind::InvokeStaticFunction { args, .. }
            | InstrKind::MakeTuple { items: args, .. }
            | InstrKind::MakeList { items: args, .. } => {
                for a in args.$iter() {
                    $f(a);
                }
            }
        }
    };
}

macro_rules! output_of {
    ($kind:expr) => {
        match $kind {
            InstrKind::LoadArg { dst, .. }
            | InstrKind::LoadConst { dst, .. }
            | InstrKind::LoadCurrentFunc { dst }
            | InstrKind::Assign { dst, .. }
            | InstrKind::Phi { dst, .. }
            | InstrKind::GuardType { dst, .. }
            | InstrKind::GuardIs { dst, .. }
            | InstrKind::CheckVar { dst, .. }
            | InstrKind::CheckFreevar { dst, .. }
            | InstrKind::CheckField { dst, .. }
            | InstrKind::CheckSequenceBounds { dst, .. }
            | InstrKind::LoadGlobalCached { dst, .. }
            | InstrKind::LoadGlobal { dst, .. }
            | InstrKind::LoadAttr { dst, .. }
            | InstrKind::LoadField { dst, .. }
            | InstrKind::LoadTypeAttrCacheItem { dst, .. }
            | InstrKind::CheckTypeAttrCache { dst, .. }
            | InstrKind::FillTypeAttrCache { dst, .. }
            | InstrKind::LoadMethod { dst, .. }
            | InstrKind::CallMethod { dst, .. }
            | InstrKind::CallStatic { dst, .. }
            | InstrKind::VectorCall { dst, .. }
            | InstrKind::InvokeStaticFunction { dst, .. }
            | InstrKind::BinaryOp { dst, .. }
            | InstrKind::LongBinaryOp { dst, .. }
            | InstrKind::IntBinaryOp { dst, .. }
            | InstrKind::UnaryNegative { dst, .. }
            | InstrKind::Compare { dst, .. }
            | InstrKind::PrimitiveCompare { dst, .. }
            | InstrKind::CompareBool { dst, .. }
            | InstrKind::IsTruthy { dst, .. }
            | InstrKind::PrimitiveNot { dst, .. }
            | InstrKind::PrimitiveBox { dst, .. }
            | InstrKind::PrimitiveUnbox { dst, .. }
            | InstrKind::MakeTuple { dst, .. }
            | InstrKind::MakeList { dst, .. }
            | InstrKind::BinarySubscr { dst, .. }
            | InstrKind::LoadTupleItem { dst, .. }
            | InstrKind::LoadFreevar { dst, .. }
            | InstrKind::LoadFunctionCode { dst, .. } => Some(dst),
            InstrKind::StoreGlobal { .. }
            | InstrKind::StoreAttr { .. }
            | InstrKind::StoreField { .. }
            | InstrKind::StoreFreevar { .. }
            | InstrKind::DeoptPatchpoint { .. }
            | InstrKind::BeginInlinedFunction { .. }
            | InstrKind::EndInlinedFunction { .. }
            | InstrKind::UpdatePrevInstr { .. }
            | InstrKind::Incref { .. }
            | InstrKind::Decref { .. }
            | InstrKind::XDecref { .. }
            | InstrKind::Branch { .. }
            | InstrKind::CondBranch { .. }
            | InstrKind::Return { .. }
            | InstrKind::Raise { .. }
            | InstrKind::Deopt
            | InstrKind::Unreachable => None,
        }
    };
}

impl InstrKind {
    pub fn output(&self) -> Option<Reg> {
        output_of!(self).copied()
    }

    pub fn output_mut(&mut self) -> Option<&mut Reg> {
        output_of!(self)
    }

    pub fn visit_operands(&self, mut f: impl FnMut(Reg)) {
        let mut g = |r: &Reg| f(*r);
        each_operand!(self, g, iter);
    }

    pub fn map_operands(&mut self, mut f: impl FnMut(&mut Reg)) {
        each_operand!(self, f, iter_mut);
    }

    pub fn operands(&self) -> SmallVec<[Reg; 4]> {
        let mut out = SmallVec::new();
        self.visit_operands(|r| out.push(r));
        out
    }

    pub fn num_operands(&self) -> usize {
        let mut n = 0;
        self.visit_operands(|_| n += 1);
        n
    }

    /// Source operand of a passthrough instruction.
    pub fn passthrough_source(&self) -> Option<Reg> {
        match self {
            InstrKind::Assign { src, .. }
            | InstrKind::GuardType { src, .. }
            | InstrKind::GuardIs { src, .. }
            | InstrKind::CheckVar { src, .. }
            | InstrKind::CheckFreevar { src, .. }
            | InstrKind::CheckField { src, .. } => Some(*src),
            _ => None,
        }
    }

    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            InstrKind::Branch { target } => smallvec::smallvec![*target],
            InstrKind::CondBranch {
                if_true, if_false, ..
            } => smallvec::smallvec![*if_true, *if_false],
            _ => SmallVec::new(),
        }
    }

    pub fn map_successors(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            InstrKind::Branch { target } => f(target),
            InstrKind::CondBranch {
                if_true, if_false, ..
            } => {
                f(if_true);
                f(if_false);
            }
            _ => {}
        }
    }
}

/// An instruction with its bytecode position and optional deopt metadata.
#[derive(Clone, PartialEq, Debug)]
pub struct Instr {
    pub kind: InstrKind,
    /// Offset in the code unit this instruction was built from.
    pub bc_offset: u32,
    pub deopt: Option<Box<DeoptInfo>>,
}

impl Instr {
    pub fn new(kind: InstrKind) -> Self {
        Instr {
            kind,
            bc_offset: 0,
            deopt: None,
        }
    }

    pub fn at(kind: InstrKind, bc_offset: u32) -> Self {
        Instr {
            kind,
            bc_offset,
            deopt: None,
        }
    }

    pub fn with_deopt(mut self, frame: FrameState) -> Self {
        self.deopt = Some(Box::new(DeoptInfo::new(frame)));
        self
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.kind.opcode()
    }

    #[inline]
    pub fn output(&self) -> Option<Reg> {
        self.kind.output()
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstrKind::Phi { .. })
    }

    /// Operands plus every register named by deopt metadata.
    pub fn visit_uses(&self, mut f: impl FnMut(Reg)) {
        self.kind.visit_operands(&mut f);
        if let Some(d) = &self.deopt {
            d.visit_regs(&mut f);
        }
    }

    /// Rewrite operands and deopt metadata.
    pub fn map_uses(&mut self, mut f: impl FnMut(&mut Reg)) {
        self.kind.map_operands(&mut f);
        if let Some(d) = &mut self.deopt {
            d.map_regs(&mut f);
        }
    }
}
