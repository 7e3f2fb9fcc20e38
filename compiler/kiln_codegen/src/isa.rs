//! The KX instruction set.
//!
//! KX is a 64-bit register machine with sixteen general-purpose registers
//! and a fixed 16-byte encoding:
//!
//! ```text
//! byte  0      1     2     3       4..8        8..16
//!       tag    ra    rb    sub     aux (u32)   imm (i64)
//! ```
//!
//! `sub` holds an operator, condition, or primitive kind; `aux` holds a
//! field, slot, or helper selector; `imm` holds immediates and relative
//! jump displacements (measured from the end of the jump).
//!
//! Object operations (`LoadKind`, `LoadField`, `Incref`, ...) are single
//! instructions that act on the host heap. Everything that may run user
//! code goes through `Call` to a runtime helper, which sets the fault flag
//! on failure.
//!
//! # Calling convention
//!
//! - Entry: `r0` = argument count, `r1` = address of the argument words,
//!   `r2` = the function object. Result in `r0`.
//! - `r0`..`r8` are caller-saved; helpers clobber all of them. `r7` and `r8`
//!   are reserved as emitter scratch registers.
//! - `r9`..`r13` are callee-saved; `r14` is the frame pointer and `r15` the
//!   stack pointer.
//! - Helper arguments are passed in the outgoing area at `[sp + 8 * i]`.

use std::fmt;

use kiln_hir::PrimKind;
use kiln_rt::{BinOp, CmpOp};

use crate::error::CodegenError;

pub const INSTR_SIZE: usize = 16;
pub const WORD: i32 = 8;

// ── Registers ──────────────────────────────────────────────────────

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Gp(u8);

impl Gp {
    pub const R0: Gp = Gp(0);
    pub const R1: Gp = Gp(1);
    pub const R2: Gp = Gp(2);
    pub const R3: Gp = Gp(3);
    pub const R4: Gp = Gp(4);
    pub const R5: Gp = Gp(5);
    pub const R6: Gp = Gp(6);
    pub const R7: Gp = Gp(7);
    pub const R8: Gp = Gp(8);
    pub const R9: Gp = Gp(9);
    pub const R10: Gp = Gp(10);
    pub const R11: Gp = Gp(11);
    pub const R12: Gp = Gp(12);
    pub const R13: Gp = Gp(13);
    pub const FP: Gp = Gp(14);
    pub const SP: Gp = Gp(15);

    pub const fn new(raw: u8) -> Option<Gp> {
        if raw < NUM_GPS as u8 {
            Some(Gp(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_callee_saved(self) -> bool {
        CALLEE_SAVED.contains(&self)
    }
}

impl fmt::Debug for Gp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Gp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Gp::FP => f.write_str("fp"),
            Gp::SP => f.write_str("sp"),
            Gp(n) => write!(f, "r{n}"),
        }
    }
}

pub const NUM_GPS: usize = 16;

pub const RET: Gp = Gp::R0;
pub const ARG_COUNT: Gp = Gp::R0;
pub const ARG_PTR: Gp = Gp::R1;
pub const ARG_FUNC: Gp = Gp::R2;

pub const SCRATCH0: Gp = Gp::R7;
pub const SCRATCH1: Gp = Gp::R8;

/// Clobbered by every helper call.
pub const CALLER_SAVED: [Gp; 9] = [
    Gp::R0,
    Gp::R1,
    Gp::R2,
    Gp::R3,
    Gp::R4,
    Gp::R5,
    Gp::R6,
    Gp::R7,
    Gp::R8,
];

/// Caller-saved registers the allocator may hand out.
pub const ALLOCATABLE_CALLER_SAVED: [Gp; 7] =
    [Gp::R0, Gp::R1, Gp::R2, Gp::R3, Gp::R4, Gp::R5, Gp::R6];

pub const CALLEE_SAVED: [Gp; 5] = [Gp::R9, Gp::R10, Gp::R11, Gp::R12, Gp::R13];

// ── Operand payloads ───────────────────────────────────────────────

/// Branch conditions over the last comparison or the fault flag.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned less-than.
    Below,
    /// Unsigned greater-or-equal.
    AboveEq,
    /// The last checked operation or helper call failed.
    Fault,
}

impl Cond {
    const ALL: [Cond; 9] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Lt,
        Cond::Le,
        Cond::Gt,
        Cond::Ge,
        Cond::Below,
        Cond::AboveEq,
        Cond::Fault,
    ];

    fn from_u8(raw: u8) -> Option<Cond> {
        Cond::ALL.get(usize::from(raw)).copied()
    }

    /// The condition for an integer comparison operator.
    pub fn from_cmp(op: CmpOp) -> Cond {
        match op {
            CmpOp::Lt => Cond::Lt,
            CmpOp::Le => Cond::Le,
            CmpOp::Eq | CmpOp::Is => Cond::Eq,
            CmpOp::Ne | CmpOp::IsNot => Cond::Ne,
            CmpOp::Gt => Cond::Gt,
            CmpOp::Ge => Cond::Ge,
        }
    }

    /// Evaluate against compared operands `a` and `b`.
    pub fn holds(self, a: u64, b: u64, fault: bool) -> bool {
        let (sa, sb) = (a as i64, b as i64);
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => sa < sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ge => sa >= sb,
            Cond::Below => a < b,
            Cond::AboveEq => a >= b,
            Cond::Fault => fault,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Sar,
}

impl AluOp {
    const ALL: [AluOp; 8] = [
        AluOp::Add,
        AluOp::Sub,
        AluOp::Mul,
        AluOp::And,
        AluOp::Or,
        AluOp::Xor,
        AluOp::Shl,
        AluOp::Sar,
    ];

    fn from_u8(raw: u8) -> Option<AluOp> {
        AluOp::ALL.get(usize::from(raw)).copied()
    }

    /// Wrapping evaluation.
    pub fn eval(self, a: u64, b: u64) -> u64 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Shl => a.wrapping_shl(b as u32),
            AluOp::Sar => ((a as i64).wrapping_shr(b as u32)) as u64,
        }
    }
}

const PRIM_KINDS: [PrimKind; 3] = [PrimKind::Int64, PrimKind::Double, PrimKind::Bool];

fn prim_to_u8(kind: PrimKind) -> u8 {
    match kind {
        PrimKind::Int64 => 0,
        PrimKind::Double => 1,
        PrimKind::Bool => 2,
    }
}

// ── Runtime helpers ────────────────────────────────────────────────

/// A runtime entry point reached through `Call`. Arguments are described
/// per helper; object arguments are borrowed unless noted.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Helper {
    /// `(func) -> owned`: look `name` up in the function's globals, then
    /// builtins.
    LoadGlobal { name: u32 },
    /// `(func, value)`.
    StoreGlobal { name: u32 },
    /// `(obj) -> owned`.
    GetAttr { name: u32 },
    /// `(obj, value)`.
    SetAttr { name: u32 },
    /// `(type) -> owned`: look the attribute up and fill the cache.
    FillTypeAttrCache { name: u32, cache: u32 },
    /// `(callable, self_or_null, args...) -> owned`.
    CallMethod,
    /// `(args...) -> owned`.
    CallBuiltinMethod { method: u16 },
    /// `(callable, args...) -> owned`.
    VectorCall,
    /// `(func, raw args...) -> raw`: enter through the static entry.
    InvokeStatic,
    /// `(a, b) -> owned`.
    BinaryOp { op: BinOp },
    UnaryNegative,
    Compare { op: CmpOp },
    /// `(a, b) -> 0 | 1`.
    CompareBool { op: CmpOp },
    /// `(obj) -> 0 | 1`.
    IsTruthy,
    /// `(raw) -> owned`.
    Box { kind: PrimKind },
    /// `(items...) -> owned`, stealing every item.
    MakeTuple,
    MakeList,
    /// `(container, index) -> owned`.
    Subscript,
    /// `(exc)`, stealing it. Always faults.
    Raise,
    /// Push a shadow frame for an inlined code unit.
    PushShadow { code: u32 },
    PopShadow,
    /// `(func, args pointer, nargs)`: the generic entry rejected the
    /// arguments; raise what the interpreter would.
    EntryCheckFailed,
}

impl Helper {
    fn tag(self) -> u8 {
        match self {
            Helper::LoadGlobal { .. } => 0,
            Helper::StoreGlobal { .. } => 1,
            Helper::GetAttr { .. } => 2,
            Helper::SetAttr { .. } => 3,
            Helper::FillTypeAttrCache { .. } => 4,
            Helper::CallMethod => 5,
            Helper::CallBuiltinMethod { .. } => 6,
            Helper::VectorCall => 7,
            Helper::InvokeStatic => 8,
            Helper::BinaryOp { .. } => 9,
            Helper::UnaryNegative => 10,
            Helper::Compare { .. } => 11,
            Helper::CompareBool { .. } => 12,
            Helper::IsTruthy => 13,
            Helper::Box { .. } => 14,
            Helper::MakeTuple => 15,
            Helper::MakeList => 16,
            Helper::Subscript => 17,
            Helper::Raise => 18,
            Helper::PushShadow { .. } => 19,
            Helper::PopShadow => 20,
            Helper::EntryCheckFailed => 21,
        }
    }

    /// `(aux, imm)`: tag in the top byte of `aux`, payload below it.
    fn encode(self) -> (u32, i64) {
        let (a, b): (u32, i64) = match self {
            Helper::LoadGlobal { name }
            | Helper::StoreGlobal { name }
            | Helper::GetAttr { name }
            | Helper::SetAttr { name } => (name, 0),
            Helper::FillTypeAttrCache { name, cache } => (name, i64::from(cache)),
            Helper::CallBuiltinMethod { method } => (u32::from(method), 0),
            Helper::BinaryOp { op } => (op as u32, 0),
            Helper::Compare { op } | Helper::CompareBool { op } => (op as u32, 0),
            Helper::Box { kind } => (u32::from(prim_to_u8(kind)), 0),
            Helper::PushShadow { code } => (code, 0),
            Helper::CallMethod
            | Helper::VectorCall
            | Helper::InvokeStatic
            | Helper::UnaryNegative
            | Helper::IsTruthy
            | Helper::MakeTuple
            | Helper::MakeList
            | Helper::Subscript
            | Helper::Raise
            | Helper::PopShadow
            | Helper::EntryCheckFailed => (0, 0),
        };
        ((u32::from(self.tag()) << 24) | (a & 0x00FF_FFFF), b)
    }

    fn decode(aux: u32, imm: i64) -> Option<Helper> {
        let a = aux & 0x00FF_FFFF;
        let byte = (a & 0xFF) as u8;
        Some(match (aux >> 24) as u8 {
            0 => Helper::LoadGlobal { name: a },
            1 => Helper::StoreGlobal { name: a },
            2 => Helper::GetAttr { name: a },
            3 => Helper::SetAttr { name: a },
            4 => Helper::FillTypeAttrCache {
                name: a,
                cache: u32::try_from(imm).ok()?,
            },
            5 => Helper::CallMethod,
            6 => Helper::CallBuiltinMethod {
                method: u16::try_from(a).ok()?,
            },
            7 => Helper::VectorCall,
            8 => Helper::InvokeStatic,
            9 => Helper::BinaryOp {
                op: BinOp::from_u8(byte)?,
            },
            10 => Helper::UnaryNegative,
            11 => Helper::Compare {
                op: CmpOp::from_u8(byte)?,
            },
            12 => Helper::CompareBool {
                op: CmpOp::from_u8(byte)?,
            },
            13 => Helper::IsTruthy,
            14 => Helper::Box {
                kind: *PRIM_KINDS.get(usize::from(byte))?,
            },
            15 => Helper::MakeTuple,
            16 => Helper::MakeList,
            17 => Helper::Subscript,
            18 => Helper::Raise,
            19 => Helper::PushShadow { code: a },
            20 => Helper::PopShadow,
            21 => Helper::EntryCheckFailed,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Helper::LoadGlobal { .. } => "load_global",
            Helper::StoreGlobal { .. } => "store_global",
            Helper::GetAttr { .. } => "get_attr",
            Helper::SetAttr { .. } => "set_attr",
            Helper::FillTypeAttrCache { .. } => "fill_type_attr_cache",
            Helper::CallMethod => "call_method",
            Helper::CallBuiltinMethod { .. } => "call_builtin_method",
            Helper::VectorCall => "vector_call",
            Helper::InvokeStatic => "invoke_static",
            Helper::BinaryOp { .. } => "binary_op",
            Helper::UnaryNegative => "unary_negative",
            Helper::Compare { .. } => "compare",
            Helper::CompareBool { .. } => "compare_bool",
            Helper::IsTruthy => "is_truthy",
            Helper::Box { .. } => "box",
            Helper::MakeTuple => "make_tuple",
            Helper::MakeList => "make_list",
            Helper::Subscript => "subscript",
            Helper::Raise => "raise",
            Helper::PushShadow { .. } => "push_shadow",
            Helper::PopShadow => "pop_shadow",
            Helper::EntryCheckFailed => "entry_check_failed",
        }
    }
}

// ── Instructions ───────────────────────────────────────────────────

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Inst {
    Nop,
    Trap,
    MovImm { dst: Gp, imm: i64 },
    Mov { dst: Gp, src: Gp },
    Load { dst: Gp, base: Gp, offset: i32 },
    Store { src: Gp, base: Gp, offset: i32 },
    Alu { op: AluOp, dst: Gp, a: Gp, b: Gp },
    AluImm { op: AluOp, dst: Gp, a: Gp, imm: i64 },
    /// Integer arithmetic with overflow and zero-divisor checks; sets the
    /// fault flag instead of producing a result when either fires.
    CheckedArith { op: BinOp, dst: Gp, a: Gp, b: Gp },
    Cmp { a: Gp, b: Gp },
    CmpImm { a: Gp, imm: i64 },
    SetCc { cond: Cond, dst: Gp },
    Jmp { rel: i32 },
    Jcc { cond: Cond, rel: i32 },
    CallLocal { rel: i32 },
    Ret,
    Push { src: Gp },
    PushImm { imm: i64 },
    Pop { dst: Gp },

    /// Kind bit of the object in `obj`; the null-pointer bit for `NULL`.
    LoadKind { dst: Gp, obj: Gp },
    /// Class of a user instance, `0` for anything else.
    LoadClass { dst: Gp, obj: Gp },
    Unbox { kind: PrimKind, dst: Gp, obj: Gp },
    /// Borrowed instance field, possibly `NULL`.
    LoadField { dst: Gp, obj: Gp, index: u32 },
    /// Steals `src` into the field and releases the previous value.
    StoreField { obj: Gp, src: Gp, index: u32 },
    SeqLen { dst: Gp, obj: Gp },
    /// Borrowed item at an already-normalized index.
    SeqItem { dst: Gp, obj: Gp, index: Gp },
    /// Borrowed value of a namespace slot.
    LoadGlobal { dst: Gp, slot: u32, namespace: u64 },
    /// Borrowed contents of the function's free-variable cell.
    LoadCell { dst: Gp, func: Gp, index: u32 },
    /// Steals `src` into the cell and releases the previous contents.
    StoreCell { func: Gp, src: Gp, index: u32 },
    /// The function's code object (borrowed).
    LoadCode { dst: Gp, func: Gp },
    /// A materialized constant (borrowed).
    LoadConstObj { dst: Gp, index: u32 },
    /// `1` when the type-attribute cache holds `obj` at its current version.
    CacheCheck { dst: Gp, obj: Gp, cache: u32 },
    CacheLoad { dst: Gp, cache: u32 },
    Incref { src: Gp },
    Decref { src: Gp },
    XDecref { src: Gp },
    /// Record the current bytecode offset in the innermost shadow frame.
    SetOffset { offset: u32 },
    Call { helper: Helper, nargs: u8 },

    /// Push every register, `r0` first.
    SaveRegs,
    /// Leave the machine through the deopt path. The metadata index sits
    /// above the register save area.
    DeoptExit,
}

mod tag {
    pub const NOP: u8 = 0x00;
    pub const TRAP: u8 = 0x01;
    pub const MOV_IMM: u8 = 0x02;
    pub const MOV: u8 = 0x03;
    pub const LOAD: u8 = 0x04;
    pub const STORE: u8 = 0x05;
    pub const ALU: u8 = 0x06;
    pub const ALU_IMM: u8 = 0x07;
    pub const CHECKED_ARITH: u8 = 0x08;
    pub const CMP: u8 = 0x09;
    pub const CMP_IMM: u8 = 0x0A;
    pub const SET_CC: u8 = 0x0B;
    pub const JMP: u8 = 0x10;
    pub const JCC: u8 = 0x11;
    pub const CALL_LOCAL: u8 = 0x12;
    pub const RETURN: u8 = 0x13;
    pub const PUSH: u8 = 0x14;
    pub const PUSH_IMM: u8 = 0x15;
    pub const POP: u8 = 0x16;
    pub const LOAD_KIND: u8 = 0x20;
    pub const LOAD_CLASS: u8 = 0x21;
    pub const UNBOX: u8 = 0x22;
    pub const LOAD_FIELD: u8 = 0x23;
    pub const STORE_FIELD: u8 = 0x24;
    pub const SEQ_LEN: u8 = 0x25;
    pub const SEQ_ITEM: u8 = 0x26;
    pub const LOAD_GLOBAL: u8 = 0x27;
    pub const LOAD_CELL: u8 = 0x28;
    pub const STORE_CELL: u8 = 0x29;
    pub const LOAD_CODE: u8 = 0x2A;
    pub const LOAD_CONST_OBJ: u8 = 0x2B;
    pub const CACHE_CHECK: u8 = 0x2C;
    pub const CACHE_LOAD: u8 = 0x2D;
    pub const INCREF: u8 = 0x30;
    pub const DECREF: u8 = 0x31;
    pub const XDECREF: u8 = 0x32;
    pub const SET_OFFSET: u8 = 0x33;
    pub const CALL: u8 = 0x34;
    pub const SAVE_REGS: u8 = 0x40;
    pub const DEOPT_EXIT: u8 = 0x41;
}

/// Raw fields of one encoded instruction.
#[derive(Default)]
struct Fields {
    tag: u8,
    ra: u8,
    rb: u8,
    sub: u8,
    aux: u32,
    imm: i64,
}

impl Fields {
    fn new(tag: u8) -> Self {
        Fields {
            tag,
            ..Fields::default()
        }
    }

    fn ra(mut self, r: Gp) -> Self {
        self.ra = r.raw();
        self
    }

    fn rb(mut self, r: Gp) -> Self {
        self.rb = r.raw();
        self
    }

    fn sub(mut self, s: u8) -> Self {
        self.sub = s;
        self
    }

    fn aux(mut self, aux: u32) -> Self {
        self.aux = aux;
        self
    }

    fn imm(mut self, imm: i64) -> Self {
        self.imm = imm;
        self
    }
}

impl Inst {
    pub fn encode(self) -> [u8; INSTR_SIZE] {
        use tag::*;
        let f = match self {
            Inst::Nop => Fields::new(NOP),
            Inst::Trap => Fields::new(TRAP),
            Inst::MovImm { dst, imm } => Fields::new(MOV_IMM).ra(dst).imm(imm),
            Inst::Mov { dst, src } => Fields::new(MOV).ra(dst).rb(src),
            Inst::Load { dst, base, offset } => Fields::new(LOAD).ra(dst).rb(base).imm(i64::from(offset)),
            Inst::Store { src, base, offset } => Fields::new(STORE).ra(src).rb(base).imm(i64::from(offset)),
            Inst::Alu { op, dst, a, b } => Fields::new(ALU).ra(dst).rb(a).sub(op as u8).aux(u32::from(b.raw())),
            Inst::AluImm { op, dst, a, imm } => Fields::new(ALU_IMM).ra(dst).rb(a).sub(op as u8).imm(imm),
            Inst::CheckedArith { op, dst, a, b } => {
                Fields::new(CHECKED_ARITH).ra(dst).rb(a).sub(op as u8).aux(u32::from(b.raw()))
            }
            Inst::Cmp { a, b } => Fields::new(CMP).ra(a).rb(b),
            Inst::CmpImm { a, imm } => Fields::new(CMP_IMM).ra(a).imm(imm),
            Inst::SetCc { cond, dst } => Fields::new(SET_CC).ra(dst).sub(cond as u8),
            Inst::Jmp { rel } => Fields::new(JMP).imm(i64::from(rel)),
            Inst::Jcc { cond, rel } => Fields::new(JCC).sub(cond as u8).imm(i64::from(rel)),
            Inst::CallLocal { rel } => Fields::new(CALL_LOCAL).imm(i64::from(rel)),
            Inst::Ret => Fields::new(RETURN),
            Inst::Push { src } => Fields::new(PUSH).ra(src),
            Inst::PushImm { imm } => Fields::new(PUSH_IMM).imm(imm),
            Inst::Pop { dst } => Fields::new(POP).ra(dst),
            Inst::LoadKind { dst, obj } => Fields::new(LOAD_KIND).ra(dst).rb(obj),
            Inst::LoadClass { dst, obj } => Fields::new(LOAD_CLASS).ra(dst).rb(obj),
            Inst::Unbox { kind, dst, obj } => Fields::new(UNBOX).ra(dst).rb(obj).sub(prim_to_u8(kind)),
            Inst::LoadField { dst, obj, index } => Fields::new(LOAD_FIELD).ra(dst).rb(obj).aux(index),
            Inst::StoreField { obj, src, index } => Fields::new(STORE_FIELD).ra(obj).rb(src).aux(index),
            Inst::SeqLen { dst, obj } => Fields::new(SEQ_LEN).ra(dst).rb(obj),
            Inst::SeqItem { dst, obj, index } => Fields::new(SEQ_ITEM).ra(dst).rb(obj).sub(index.raw()),
            Inst::LoadGlobal { dst, slot, namespace } => {
                Fields::new(LOAD_GLOBAL).ra(dst).aux(slot).imm(namespace as i64)
            }
            Inst::LoadCell { dst, func, index } => Fields::new(LOAD_CELL).ra(dst).rb(func).aux(index),
            Inst::StoreCell { func, src, index } => Fields::new(STORE_CELL).ra(func).rb(src).aux(index),
            Inst::LoadCode { dst, func } => Fields::new(LOAD_CODE).ra(dst).rb(func),
            Inst::LoadConstObj { dst, index } => Fields::new(LOAD_CONST_OBJ).ra(dst).aux(index),
            Inst::CacheCheck { dst, obj, cache } => Fields::new(CACHE_CHECK).ra(dst).rb(obj).aux(cache),
            Inst::CacheLoad { dst, cache } => Fields::new(CACHE_LOAD).ra(dst).aux(cache),
            Inst::Incref { src } => Fields::new(INCREF).ra(src),
            Inst::Decref { src } => Fields::new(DECREF).ra(src),
            Inst::XDecref { src } => Fields::new(XDECREF).ra(src),
            Inst::SetOffset { offset } => Fields::new(SET_OFFSET).aux(offset),
            Inst::Call { helper, nargs } => {
                let (aux, imm) = helper.encode();
                Fields::new(CALL).sub(nargs).aux(aux).imm(imm)
            }
            Inst::SaveRegs => Fields::new(SAVE_REGS),
            Inst::DeoptExit => Fields::new(DEOPT_EXIT),
        };
        let mut out = [0u8; INSTR_SIZE];
        out[0] = f.tag;
        out[1] = f.ra;
        out[2] = f.rb;
        out[3] = f.sub;
        out[4..8].copy_from_slice(&f.aux.to_le_bytes());
        out[8..16].copy_from_slice(&f.imm.to_le_bytes());
        out
    }

    /// Decode the instruction at `offset` (for error reporting) from `bytes`.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Inst, CodegenError> {
        let bad = |tag| CodegenError::BadEncoding { offset, tag };
        let Some(raw) = bytes.get(..INSTR_SIZE) else {
            return Err(bad(0xFF));
        };
        let t = raw[0];
        let reg = |b: u8| Gp::new(b).ok_or(bad(t));
        let (ra, rb, sub) = (raw[1], raw[2], raw[3]);
        let mut aux_bytes = [0u8; 4];
        aux_bytes.copy_from_slice(&raw[4..8]);
        let aux = u32::from_le_bytes(aux_bytes);
        let mut imm_bytes = [0u8; 8];
        imm_bytes.copy_from_slice(&raw[8..16]);
        let imm = i64::from_le_bytes(imm_bytes);
        let rel = || i32::try_from(imm).map_err(|_| bad(t));
        let offset32 = || i32::try_from(imm).map_err(|_| bad(t));
        let alu = || AluOp::from_u8(sub).ok_or(bad(t));
        let cond = || Cond::from_u8(sub).ok_or(bad(t));
        let kind = || PRIM_KINDS.get(usize::from(sub)).copied().ok_or(bad(t));

        use tag::*;
        Ok(match t {
            NOP => Inst::Nop,
            TRAP => Inst::Trap,
            MOV_IMM => Inst::MovImm { dst: reg(ra)?, imm },
            MOV => Inst::Mov { dst: reg(ra)?, src: reg(rb)? },
            LOAD => Inst::Load { dst: reg(ra)?, base: reg(rb)?, offset: offset32()? },
            STORE => Inst::Store { src: reg(ra)?, base: reg(rb)?, offset: offset32()? },
            ALU => Inst::Alu { op: alu()?, dst: reg(ra)?, a: reg(rb)?, b: reg(aux as u8)? },
            ALU_IMM => Inst::AluImm { op: alu()?, dst: reg(ra)?, a: reg(rb)?, imm },
            CHECKED_ARITH => Inst::CheckedArith {
                op: BinOp::from_u8(sub).ok_or(bad(t))?,
                dst: reg(ra)?,
                a: reg(rb)?,
                b: reg(aux as u8)?,
            },
            CMP => Inst::Cmp { a: reg(ra)?, b: reg(rb)? },
            CMP_IMM => Inst::CmpImm { a: reg(ra)?, imm },
            SET_CC => Inst::SetCc { cond: cond()?, dst: reg(ra)? },
            JMP => Inst::Jmp { rel: rel()? },
            JCC => Inst::Jcc { cond: cond()?, rel: rel()? },
            CALL_LOCAL => Inst::CallLocal { rel: rel()? },
            RETURN => Inst::Ret,
            PUSH => Inst::Push { src: reg(ra)? },
            PUSH_IMM => Inst::PushImm { imm },
            POP => Inst::Pop { dst: reg(ra)? },
            LOAD_KIND => Inst::LoadKind { dst: reg(ra)?, obj: reg(rb)? },
            LOAD_CLASS => Inst::LoadClass { dst: reg(ra)?, obj: reg(rb)? },
            UNBOX => Inst::Unbox { kind: kind()?, dst: reg(ra)?, obj: reg(rb)? },
            LOAD_FIELD => Inst::LoadField { dst: reg(ra)?, obj: reg(rb)?, index: aux },
            STORE_FIELD => Inst::StoreField { obj: reg(ra)?, src: reg(rb)?, index: aux },
            SEQ_LEN => Inst::SeqLen { dst: reg(ra)?, obj: reg(rb)? },
            SEQ_ITEM => Inst::SeqItem { dst: reg(ra)?, obj: reg(rb)?, index: reg(sub)? },
            LOAD_GLOBAL => Inst::LoadGlobal { dst: reg(ra)?, slot: aux, namespace: imm as u64 },
            LOAD_CELL => Inst::LoadCell { dst: reg(ra)?, func: reg(rb)?, index: aux },
            STORE_CELL => Inst::StoreCell { func: reg(ra)?, src: reg(rb)?, index: aux },
            LOAD_CODE => Inst::LoadCode { dst: reg(ra)?, func: reg(rb)? },
            LOAD_CONST_OBJ => Inst::LoadConstObj { dst: reg(ra)?, index: aux },
            CACHE_CHECK => Inst::CacheCheck { dst: reg(ra)?, obj: reg(rb)?, cache: aux },
            CACHE_LOAD => Inst::CacheLoad { dst: reg(ra)?, cache: aux },
            INCREF => Inst::Incref { src: reg(ra)? },
            DECREF => Inst::Decref { src: reg(ra)? },
            XDECREF => Inst::XDecref { src: reg(ra)? },
            SET_OFFSET => Inst::SetOffset { offset: aux },
            CALL => Inst::Call {
                helper: Helper::decode(aux, imm).ok_or(bad(t))?,
                nargs: sub,
            },
            SAVE_REGS => Inst::SaveRegs,
            DEOPT_EXIT => Inst::DeoptExit,
            _ => return Err(bad(t)),
        })
    }

    /// Short name, used for per-opcode statistics.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Inst::Nop => "nop",
            Inst::Trap => "trap",
            Inst::MovImm { .. } => "movi",
            Inst::Mov { .. } => "mov",
            Inst::Load { .. } => "load",
            Inst::Store { .. } => "store",
            Inst::Alu { .. } => "alu",
            Inst::AluImm { .. } => "alui",
            Inst::CheckedArith { .. } => "carith",
            Inst::Cmp { .. } => "cmp",
            Inst::CmpImm { .. } => "cmpi",
            Inst::SetCc { .. } => "setcc",
            Inst::Jmp { .. } => "jmp",
            Inst::Jcc { .. } => "jcc",
            Inst::CallLocal { .. } => "calll",
            Inst::Ret => "ret",
            Inst::Push { .. } => "push",
            Inst::PushImm { .. } => "pushi",
            Inst::Pop { .. } => "pop",
            Inst::LoadKind { .. } => "ldkind",
            Inst::LoadClass { .. } => "ldclass",
            Inst::Unbox { .. } => "unbox",
            Inst::LoadField { .. } => "ldfield",
            Inst::StoreField { .. } => "stfield",
            Inst::SeqLen { .. } => "seqlen",
            Inst::SeqItem { .. } => "seqitem",
            Inst::LoadGlobal { .. } => "ldglobal",
            Inst::LoadCell { .. } => "ldcell",
            Inst::StoreCell { .. } => "stcell",
            Inst::LoadCode { .. } => "ldcode",
            Inst::LoadConstObj { .. } => "ldconst",
            Inst::CacheCheck { .. } => "cachechk",
            Inst::CacheLoad { .. } => "cacheld",
            Inst::Incref { .. } => "incref",
            Inst::Decref { .. } => "decref",
            Inst::XDecref { .. } => "xdecref",
            Inst::SetOffset { .. } => "setoff",
            Inst::Call { .. } => "call",
            Inst::SaveRegs => "saveregs",
            Inst::DeoptExit => "deoptexit",
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.mnemonic();
        match *self {
            Inst::Nop
            | Inst::Trap
            | Inst::Ret
            | Inst::SaveRegs
            | Inst::DeoptExit => f.write_str(m),
            Inst::MovImm { dst, imm } => write!(f, "{m} {dst}, {imm}"),
            Inst::Mov { dst, src } => write!(f, "{m} {dst}, {src}"),
            Inst::Load { dst, base, offset } => write!(f, "{m} {dst}, [{base}{offset:+}]"),
            Inst::Store { src, base, offset } => write!(f, "{m} [{base}{offset:+}], {src}"),
            Inst::Alu { op, dst, a, b } => write!(f, "{op:?} {dst}, {a}, {b}"),
            Inst::AluImm { op, dst, a, imm } => write!(f, "{op:?} {dst}, {a}, {imm}"),
            Inst::CheckedArith { op, dst, a, b } => write!(f, "{m}.{op:?} {dst}, {a}, {b}"),
            Inst::Cmp { a, b } => write!(f, "{m} {a}, {b}"),
            Inst::CmpImm { a, imm } => write!(f, "{m} {a}, {imm}"),
            Inst::SetCc { cond, dst } => write!(f, "set.{cond:?} {dst}"),
            Inst::Jmp { rel } | Inst::CallLocal { rel } => write!(f, "{m} {rel:+}"),
            Inst::Jcc { cond, rel } => write!(f, "j.{cond:?} {rel:+}"),
            Inst::Push { src } => write!(f, "{m} {src}"),
            Inst::PushImm { imm } => write!(f, "{m} {imm}"),
            Inst::Pop { dst } => write!(f, "{m} {dst}"),
            Inst::LoadKind { dst, obj }
            | Inst::LoadClass { dst, obj }
            | Inst::SeqLen { dst, obj }
            | Inst::LoadCode { dst, func: obj } => write!(f, "{m} {dst}, {obj}"),
            Inst::Unbox { kind, dst, obj } => write!(f, "{m}.{kind:?} {dst}, {obj}"),
            Inst::LoadField { dst, obj, index } => write!(f, "{m} {dst}, {obj}.{index}"),
            Inst::StoreField { obj, src, index } => write!(f, "{m} {obj}.{index}, {src}"),
            Inst::SeqItem { dst, obj, index } => write!(f, "{m} {dst}, {obj}[{index}]"),
            Inst::LoadGlobal { dst, slot, namespace } => write!(f, "{m} {dst}, ns@{namespace}[{slot}]"),
            Inst::LoadCell { dst, func, index } => write!(f, "{m} {dst}, {func}.cell{index}"),
            Inst::StoreCell { func, src, index } => write!(f, "{m} {func}.cell{index}, {src}"),
            Inst::LoadConstObj { dst, index } => write!(f, "{m} {dst}, const{index}"),
            Inst::CacheCheck { dst, obj, cache } => write!(f, "{m} {dst}, {obj}, cache{cache}"),
            Inst::CacheLoad { dst, cache } => write!(f, "{m} {dst}, cache{cache}"),
            Inst::Incref { src } | Inst::Decref { src } | Inst::XDecref { src } => {
                write!(f, "{m} {src}")
            }
            Inst::SetOffset { offset } => write!(f, "{m} {offset}"),
            Inst::Call { helper, nargs } => write!(f, "{m} {}/{nargs}", helper.name()),
        }
    }
}
