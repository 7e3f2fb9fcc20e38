//! Code units: bytecode, constant pools, and frame layout.
//!
//! A [`CodeUnit`] is immutable once built and is shared between the
//! interpreter and compile workers as `Arc<CodeUnit>`. Bytecode offsets are
//! instruction indices into [`CodeUnit::ops`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use rustc_hash::FxHasher;

use crate::intern::Name;
use crate::object::ObjKind;

/// Unique identity of a code unit for the lifetime of the process.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct CodeId(u64);

impl CodeId {
    fn fresh() -> CodeId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Binary operators shared by bytecode and IR.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Mod,
    TrueDiv,
}

impl BinOp {
    pub const ALL: [BinOp; 6] = [
        BinOp::Add,
        BinOp::Sub,
        BinOp::Mul,
        BinOp::FloorDiv,
        BinOp::Mod,
        BinOp::TrueDiv,
    ];

    /// Name of the user-class hook method implementing this operator.
    pub fn dunder(self) -> &'static str {
        match self {
            BinOp::Add => "__add__",
            BinOp::Sub => "__sub__",
            BinOp::Mul => "__mul__",
            BinOp::FloorDiv => "__floordiv__",
            BinOp::Mod => "__mod__",
            BinOp::TrueDiv => "__truediv__",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::TrueDiv => "/",
        }
    }

    pub fn from_u8(raw: u8) -> Option<BinOp> {
        BinOp::ALL.get(usize::from(raw)).copied()
    }
}

/// Comparison operators shared by bytecode and IR.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    Is,
    IsNot,
}

impl CmpOp {
    pub const ALL: [CmpOp; 8] = [
        CmpOp::Lt,
        CmpOp::Le,
        CmpOp::Eq,
        CmpOp::Ne,
        CmpOp::Gt,
        CmpOp::Ge,
        CmpOp::Is,
        CmpOp::IsNot,
    ];

    pub fn dunder(self) -> Option<&'static str> {
        match self {
            CmpOp::Lt => Some("__lt__"),
            CmpOp::Le => Some("__le__"),
            CmpOp::Eq => Some("__eq__"),
            CmpOp::Ne => Some("__ne__"),
            CmpOp::Gt => Some("__gt__"),
            CmpOp::Ge => Some("__ge__"),
            CmpOp::Is | CmpOp::IsNot => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
        }
    }

    /// Evaluate on an ordering. Identity operators are not ordering-based.
    pub fn eval_ord(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            CmpOp::Lt => ord == Less,
            CmpOp::Le => ord != Greater,
            CmpOp::Eq | CmpOp::Is => ord == Equal,
            CmpOp::Ne | CmpOp::IsNot => ord != Equal,
            CmpOp::Gt => ord == Greater,
            CmpOp::Ge => ord != Less,
        }
    }

    pub fn from_u8(raw: u8) -> Option<CmpOp> {
        CmpOp::ALL.get(usize::from(raw)).copied()
    }
}

/// A bytecode instruction. Jump targets are absolute instruction offsets.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Op {
    Nop,
    PopTop,
    DupTop,
    RotTwo,
    LoadConst(u32),
    LoadFast(u32),
    StoreFast(u32),
    /// Index into `cellvars ++ freevars`.
    LoadDeref(u32),
    StoreDeref(u32),
    /// Push the cell object itself (closure construction).
    LoadClosure(u32),
    LoadGlobal(u32),
    StoreGlobal(u32),
    LoadAttr(u32),
    StoreAttr(u32),
    /// Pushes `[callable, self_or_null]`.
    LoadMethod(u32),
    CallMethod(u32),
    CallFunction(u32),
    BinaryOp(BinOp),
    CompareOp(CmpOp),
    UnaryNot,
    UnaryNegative,
    BinarySubscr,
    BuildTuple(u32),
    BuildList(u32),
    /// Pops a code constant and a closure tuple.
    MakeFunction,
    JumpAbsolute(u32),
    PopJumpIfFalse(u32),
    PopJumpIfTrue(u32),
    ReturnValue,
    RaiseVarargs,
    YieldValue,
}

impl Op {
    /// Net stack effect and number of values popped.
    pub fn stack_effect(self) -> (usize, usize) {
        // (pops, pushes)
        match self {
            Op::Nop | Op::JumpAbsolute(_) => (0, 0),
            Op::PopTop | Op::StoreFast(_) | Op::StoreDeref(_) | Op::StoreGlobal(_) => (1, 0),
            Op::DupTop => (1, 2),
            Op::RotTwo => (2, 2),
            Op::LoadConst(_)
            | Op::LoadFast(_)
            | Op::LoadDeref(_)
            | Op::LoadClosure(_)
            | Op::LoadGlobal(_) => (0, 1),
            Op::LoadAttr(_) | Op::UnaryNot | Op::UnaryNegative => (1, 1),
            Op::StoreAttr(_) => (2, 0),
            Op::LoadMethod(_) => (1, 2),
            Op::CallMethod(n) => (n as usize + 2, 1),
            Op::CallFunction(n) => (n as usize + 1, 1),
            Op::BinaryOp(_) | Op::CompareOp(_) | Op::BinarySubscr | Op::MakeFunction => (2, 1),
            Op::BuildTuple(n) | Op::BuildList(n) => (n as usize, 1),
            Op::PopJumpIfFalse(_) | Op::PopJumpIfTrue(_) | Op::ReturnValue | Op::RaiseVarargs => {
                (1, 0)
            }
            Op::YieldValue => (1, 1),
        }
    }

    /// Branch target, if any.
    pub fn jump_target(self) -> Option<usize> {
        match self {
            Op::JumpAbsolute(t) | Op::PopJumpIfFalse(t) | Op::PopJumpIfTrue(t) => Some(t as usize),
            _ => None,
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminal(self) -> bool {
        matches!(self, Op::JumpAbsolute(_) | Op::ReturnValue | Op::RaiseVarargs)
    }
}

/// Compile-time constants of a code unit.
#[derive(Clone, PartialEq, Debug)]
pub enum ConstValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Vec<ConstValue>),
    Code(Arc<CodeUnit>),
}

impl ConstValue {
    pub fn kind(&self) -> ObjKind {
        match self {
            ConstValue::None => ObjKind::None,
            ConstValue::Bool(_) => ObjKind::Bool,
            ConstValue::Int(_) => ObjKind::Int,
            ConstValue::Float(_) => ObjKind::Float,
            ConstValue::Str(_) => ObjKind::Str,
            ConstValue::Tuple(_) => ObjKind::Tuple,
            ConstValue::Code(_) => ObjKind::Code,
        }
    }

    fn hash_into(&self, h: &mut FxHasher) {
        std::mem::discriminant(self).hash(h);
        match self {
            ConstValue::None => {}
            ConstValue::Bool(b) => b.hash(h),
            ConstValue::Int(i) => i.hash(h),
            ConstValue::Float(f) => f.to_bits().hash(h),
            ConstValue::Str(s) => s.hash(h),
            ConstValue::Tuple(items) => {
                items.len().hash(h);
                for item in items {
                    item.hash_into(h);
                }
            }
            ConstValue::Code(code) => code.content_hash().hash(h),
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::None => f.write_str("None"),
            ConstValue::Bool(true) => f.write_str("True"),
            ConstValue::Bool(false) => f.write_str("False"),
            ConstValue::Int(i) => write!(f, "{i}"),
            ConstValue::Float(x) => write!(f, "{x:?}"),
            ConstValue::Str(s) => write!(f, "{s:?}"),
            ConstValue::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            ConstValue::Code(code) => write!(f, "<code {}>", code.name),
        }
    }
}

/// Declared type of an argument or return value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum ArgAnnotation {
    #[default]
    Object,
    /// Unboxed 64-bit integer (static function).
    Int64,
    /// Unboxed double (static function).
    Float64,
    /// Exact builtin kind, e.g. `int` or `str`.
    Kind(ObjKind),
    /// Instance of the user class bound to this global name.
    Class(Name),
}

impl ArgAnnotation {
    pub fn is_primitive(self) -> bool {
        matches!(self, ArgAnnotation::Int64 | ArgAnnotation::Float64)
    }
}

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
    pub struct CodeFlags: u8 {
        const GENERATOR = 1 << 0;
        const VARARGS = 1 << 1;
        /// At least one primitive-typed argument or return.
        const STATIC = 1 << 2;
    }
}

/// An immutable unit of bytecode.
#[derive(Debug)]
pub struct CodeUnit {
    pub id: CodeId,
    pub name: Name,
    pub filename: Arc<str>,
    pub first_line: u32,
    pub argcount: usize,
    /// Arguments first, then other locals.
    pub local_names: Vec<Name>,
    pub cellvars: Vec<Name>,
    pub freevars: Vec<Name>,
    pub consts: Vec<ConstValue>,
    pub names: Vec<Name>,
    pub ops: Vec<Op>,
    pub lines: Vec<u32>,
    pub flags: CodeFlags,
    pub arg_types: Vec<ArgAnnotation>,
    pub return_type: ArgAnnotation,
}

impl PartialEq for CodeUnit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl CodeUnit {
    pub fn nlocals(&self) -> usize {
        self.local_names.len()
    }

    pub fn ncells(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(CodeFlags::STATIC)
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(self.first_line)
    }

    /// Stable hash of the bytecode and constants, independent of identity.
    pub fn content_hash(&self) -> u64 {
        let mut h = FxHasher::default();
        self.ops.hash(&mut h);
        self.names.hash(&mut h);
        self.arg_types.hash(&mut h);
        self.return_type.hash(&mut h);
        for c in &self.consts {
            c.hash_into(&mut h);
        }
        h.finish()
    }

    /// Largest stack depth reached by any path.
    pub fn max_stack_depth(&self) -> usize {
        let mut depth_at: Vec<Option<usize>> = vec![None; self.ops.len() + 1];
        let mut work = vec![(0usize, 0usize)];
        let mut max = 0;
        while let Some((pc, depth)) = work.pop() {
            if pc >= self.ops.len() || depth_at[pc].is_some() {
                continue;
            }
            depth_at[pc] = Some(depth);
            let op = self.ops[pc];
            let (pops, pushes) = op.stack_effect();
            let after = depth.saturating_sub(pops) + pushes;
            max = max.max(after).max(depth);
            if let Some(target) = op.jump_target() {
                work.push((target, after));
            }
            if !op.is_terminal() {
                work.push((pc + 1, after));
            }
        }
        max
    }
}

/// A forward-referenceable jump target used by [`CodeBuilder`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Label(usize);

/// Assembler for code units.
///
/// ```
/// use kiln_rt::{BinOp, CodeBuilder, ConstValue};
/// let code = CodeBuilder::new("inc")
///     .arg("x")
///     .load_fast("x")
///     .load_const(ConstValue::Int(1))
///     .binary(BinOp::Add)
///     .ret()
///     .build();
/// assert_eq!(code.argcount, 1);
/// ```
pub struct CodeBuilder {
    name: Name,
    filename: Arc<str>,
    first_line: u32,
    argcount: usize,
    local_names: Vec<Name>,
    cellvars: Vec<Name>,
    freevars: Vec<Name>,
    consts: Vec<ConstValue>,
    names: Vec<Name>,
    ops: Vec<Op>,
    lines: Vec<u32>,
    line: u32,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    flags: CodeFlags,
    arg_types: Vec<ArgAnnotation>,
    return_type: ArgAnnotation,
}

impl CodeBuilder {
    pub fn new(name: &str) -> Self {
        CodeBuilder {
            name: Name::new(name),
            filename: Arc::from("<kiln>"),
            first_line: 1,
            argcount: 0,
            local_names: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            ops: Vec::new(),
            lines: Vec::new(),
            line: 1,
            labels: Vec::new(),
            fixups: Vec::new(),
            flags: CodeFlags::empty(),
            arg_types: Vec::new(),
            return_type: ArgAnnotation::Object,
        }
    }

    #[must_use]
    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = Arc::from(filename);
        self
    }

    /// Add an untyped positional argument. Arguments precede locals.
    #[must_use]
    pub fn arg(self, name: &str) -> Self {
        self.typed_arg(name, ArgAnnotation::Object)
    }

    #[must_use]
    pub fn typed_arg(mut self, name: &str, ann: ArgAnnotation) -> Self {
        assert_eq!(
            self.argcount,
            self.local_names.len(),
            "arguments must be declared before locals"
        );
        self.local_names.push(Name::new(name));
        self.arg_types.push(ann);
        self.argcount += 1;
        if ann.is_primitive() {
            self.flags |= CodeFlags::STATIC;
        }
        self
    }

    #[must_use]
    pub fn returns(mut self, ann: ArgAnnotation) -> Self {
        self.return_type = ann;
        if ann.is_primitive() {
            self.flags |= CodeFlags::STATIC;
        }
        self
    }

    #[must_use]
    pub fn local(mut self, name: &str) -> Self {
        self.local_index(name);
        self
    }

    #[must_use]
    pub fn cellvar(mut self, name: &str) -> Self {
        self.cellvars.push(Name::new(name));
        self
    }

    #[must_use]
    pub fn freevar(mut self, name: &str) -> Self {
        self.freevars.push(Name::new(name));
        self
    }

    #[must_use]
    pub fn generator(mut self) -> Self {
        self.flags |= CodeFlags::GENERATOR;
        self
    }

    /// Set the source line for subsequently emitted instructions.
    #[must_use]
    pub fn line(mut self, line: u32) -> Self {
        if self.ops.is_empty() {
            self.first_line = line;
        }
        self.line = line;
        self
    }

    fn local_index(&mut self, name: &str) -> u32 {
        let name = Name::new(name);
        let idx = match self.local_names.iter().position(|&n| n == name) {
            Some(i) => i,
            None => {
                self.local_names.push(name);
                self.local_names.len() - 1
            }
        };
        idx as u32
    }

    fn name_index(&mut self, name: &str) -> u32 {
        let name = Name::new(name);
        let idx = match self.names.iter().position(|&n| n == name) {
            Some(i) => i,
            None => {
                self.names.push(name);
                self.names.len() - 1
            }
        };
        idx as u32
    }

    fn deref_index(&self, name: &str) -> u32 {
        let name = Name::new(name);
        self.cellvars
            .iter()
            .chain(self.freevars.iter())
            .position(|&n| n == name)
            .unwrap_or_else(|| panic!("{name} is not a cell or free variable")) as u32
    }

    fn emit(mut self, op: Op) -> Self {
        self.ops.push(op);
        self.lines.push(self.line);
        self
    }

    #[must_use]
    pub fn op(self, op: Op) -> Self {
        self.emit(op)
    }

    #[must_use]
    pub fn load_const(mut self, value: ConstValue) -> Self {
        let idx = match self.consts.iter().position(|c| *c == value) {
            Some(i) => i,
            None => {
                self.consts.push(value);
                self.consts.len() - 1
            }
        };
        self.emit(Op::LoadConst(idx as u32))
    }

    #[must_use]
    pub fn load_int(self, value: i64) -> Self {
        self.load_const(ConstValue::Int(value))
    }

    #[must_use]
    pub fn load_none(self) -> Self {
        self.load_const(ConstValue::None)
    }

    #[must_use]
    pub fn load_fast(mut self, name: &str) -> Self {
        let idx = self.local_index(name);
        self.emit(Op::LoadFast(idx))
    }

    #[must_use]
    pub fn store_fast(mut self, name: &str) -> Self {
        let idx = self.local_index(name);
        self.emit(Op::StoreFast(idx))
    }

    #[must_use]
    pub fn load_deref(self, name: &str) -> Self {
        let idx = self.deref_index(name);
        self.emit(Op::LoadDeref(idx))
    }

    #[must_use]
    pub fn store_deref(self, name: &str) -> Self {
        let idx = self.deref_index(name);
        self.emit(Op::StoreDeref(idx))
    }

    #[must_use]
    pub fn load_closure(self, name: &str) -> Self {
        let idx = self.deref_index(name);
        self.emit(Op::LoadClosure(idx))
    }

    #[must_use]
    pub fn load_global(mut self, name: &str) -> Self {
        let idx = self.name_index(name);
        self.emit(Op::LoadGlobal(idx))
    }

    #[must_use]
    pub fn store_global(mut self, name: &str) -> Self {
        let idx = self.name_index(name);
        self.emit(Op::StoreGlobal(idx))
    }

    #[must_use]
    pub fn load_attr(mut self, name: &str) -> Self {
        let idx = self.name_index(name);
        self.emit(Op::LoadAttr(idx))
    }

    #[must_use]
    pub fn store_attr(mut self, name: &str) -> Self {
        let idx = self.name_index(name);
        self.emit(Op::StoreAttr(idx))
    }

    #[must_use]
    pub fn load_method(mut self, name: &str) -> Self {
        let idx = self.name_index(name);
        self.emit(Op::LoadMethod(idx))
    }

    #[must_use]
    pub fn call_method(self, argc: u32) -> Self {
        self.emit(Op::CallMethod(argc))
    }

    #[must_use]
    pub fn call_function(self, argc: u32) -> Self {
        self.emit(Op::CallFunction(argc))
    }

    #[must_use]
    pub fn binary(self, op: BinOp) -> Self {
        self.emit(Op::BinaryOp(op))
    }

    #[must_use]
    pub fn compare(self, op: CmpOp) -> Self {
        self.emit(Op::CompareOp(op))
    }

    #[must_use]
    pub fn not(self) -> Self {
        self.emit(Op::UnaryNot)
    }

    #[must_use]
    pub fn neg(self) -> Self {
        self.emit(Op::UnaryNegative)
    }

    #[must_use]
    pub fn subscr(self) -> Self {
        self.emit(Op::BinarySubscr)
    }

    #[must_use]
    pub fn build_tuple(self, n: u32) -> Self {
        self.emit(Op::BuildTuple(n))
    }

    #[must_use]
    pub fn build_list(self, n: u32) -> Self {
        self.emit(Op::BuildList(n))
    }

    #[must_use]
    pub fn make_function(self) -> Self {
        self.emit(Op::MakeFunction)
    }

    #[must_use]
    pub fn pop(self) -> Self {
        self.emit(Op::PopTop)
    }

    #[must_use]
    pub fn dup(self) -> Self {
        self.emit(Op::DupTop)
    }

    #[must_use]
    pub fn rot_two(self) -> Self {
        self.emit(Op::RotTwo)
    }

    /// Allocate an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction.
    #[must_use]
    pub fn bind(mut self, label: Label) -> Self {
        self.labels[label.0] = Some(self.ops.len() as u32);
        self
    }

    fn emit_jump(mut self, op: fn(u32) -> Op, label: Label) -> Self {
        self.fixups.push((self.ops.len(), label));
        self.emit(op(u32::MAX))
    }

    #[must_use]
    pub fn jump(self, label: Label) -> Self {
        self.emit_jump(Op::JumpAbsolute, label)
    }

    #[must_use]
    pub fn pop_jump_if_false(self, label: Label) -> Self {
        self.emit_jump(Op::PopJumpIfFalse, label)
    }

    #[must_use]
    pub fn pop_jump_if_true(self, label: Label) -> Self {
        self.emit_jump(Op::PopJumpIfTrue, label)
    }

    #[must_use]
    pub fn ret(self) -> Self {
        self.emit(Op::ReturnValue)
    }

    #[must_use]
    pub fn raise(self) -> Self {
        self.emit(Op::RaiseVarargs)
    }

    /// Finish the unit, resolving all labels.
    ///
    /// # Panics
    /// Panics if a referenced label was never bound.
    pub fn build(mut self) -> Arc<CodeUnit> {
        for &(at, label) in &self.fixups {
            let target = self.labels[label.0]
                .unwrap_or_else(|| panic!("label {} referenced but never bound", label.0));
            self.ops[at] = match self.ops[at] {
                Op::JumpAbsolute(_) => Op::JumpAbsolute(target),
                Op::PopJumpIfFalse(_) => Op::PopJumpIfFalse(target),
                Op::PopJumpIfTrue(_) => Op::PopJumpIfTrue(target),
                other => other,
            };
        }
        Arc::new(CodeUnit {
            id: CodeId::fresh(),
            name: self.name,
            filename: self.filename,
            first_line: self.first_line,
            argcount: self.argcount,
            local_names: self.local_names,
            cellvars: self.cellvars,
            freevars: self.freevars,
            consts: self.consts,
            names: self.names,
            ops: self.ops,
            lines: self.lines,
            flags: self.flags,
            arg_types: self.arg_types,
            return_type: self.return_type,
        })
    }
}
