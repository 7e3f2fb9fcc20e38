//! Heap objects with explicit reference counts.
//!
//! Every object lives in a [`Heap`] slot addressed by an [`ObjRef`]. Slot 0
//! is never allocated, so `ObjRef::NULL` doubles as the "no value" marker
//! used for unbound locals, empty cells, and failed helper calls in
//! generated code. The singletons `None`, `True`, and `False` are immortal:
//! reference count operations on them are no-ops.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::builtins::{BuiltinFnId, BuiltinMethodId};
use crate::code::CodeUnit;
use crate::exception::ExcKind;
use crate::hook::JitState;
use crate::intern::Name;
use crate::namespace::Namespace;

// ── Object references ──────────────────────────────────────────────

/// Index of a heap slot. `NULL` (0) is never a live object.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct ObjRef(u32);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        ObjRef(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Machine-word encoding used by generated code.
    #[inline]
    pub fn to_word(self) -> u64 {
        u64::from(self.0)
    }

    #[inline]
    pub fn from_word(word: u64) -> Self {
        ObjRef(word as u32)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "obj#{}", self.0)
        }
    }
}

// ── Object kinds ───────────────────────────────────────────────────

/// Coarse classification of every heap object.
///
/// The discriminant doubles as a bit position in the JIT's type lattice,
/// which is what lets generated code test an object's kind against a mask.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum ObjKind {
    None = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Str = 4,
    Tuple = 5,
    List = 6,
    Function = 7,
    Code = 8,
    Type = 9,
    Builtin = 10,
    BoundMethod = 11,
    Exception = 12,
    Cell = 13,
    Instance = 14,
    Other = 15,
}

impl ObjKind {
    pub const COUNT: usize = 16;

    pub const ALL: [ObjKind; ObjKind::COUNT] = [
        ObjKind::None,
        ObjKind::Bool,
        ObjKind::Int,
        ObjKind::Float,
        ObjKind::Str,
        ObjKind::Tuple,
        ObjKind::List,
        ObjKind::Function,
        ObjKind::Code,
        ObjKind::Type,
        ObjKind::Builtin,
        ObjKind::BoundMethod,
        ObjKind::Exception,
        ObjKind::Cell,
        ObjKind::Instance,
        ObjKind::Other,
    ];

    #[inline]
    pub const fn bit(self) -> u32 {
        1 << (self as u8)
    }

    /// Name of the corresponding builtin type object.
    pub fn type_name(self) -> &'static str {
        match self {
            ObjKind::None => "NoneType",
            ObjKind::Bool => "bool",
            ObjKind::Int => "int",
            ObjKind::Float => "float",
            ObjKind::Str => "str",
            ObjKind::Tuple => "tuple",
            ObjKind::List => "list",
            ObjKind::Function => "function",
            ObjKind::Code => "code",
            ObjKind::Type => "type",
            ObjKind::Builtin => "builtin_function_or_method",
            ObjKind::BoundMethod => "method",
            ObjKind::Exception => "BaseException",
            ObjKind::Cell => "cell",
            ObjKind::Instance => "object",
            ObjKind::Other => "internal",
        }
    }
}

// ── Object payloads ────────────────────────────────────────────────

/// A function: code bound to globals, builtins, defaults, and closure.
#[derive(Debug)]
pub struct FunctionObj {
    pub name: Name,
    /// A `Code` object.
    pub code: ObjRef,
    pub globals: ObjRef,
    pub builtins: ObjRef,
    pub defaults: Vec<ObjRef>,
    /// `Cell` objects, one per free variable.
    pub closure: Vec<ObjRef>,
    pub jit: JitState,
    /// Interpreted calls since creation; drives hot-function compilation.
    pub calls: u32,
}

/// A type object. Builtin types have `builtin` set and are immutable.
#[derive(Debug)]
pub struct TypeObj {
    pub name: Name,
    pub builtin: Option<ObjKind>,
    /// Instance field layout for user classes.
    pub slots: Vec<Name>,
    /// Class namespace. Values are owned references.
    pub attrs: Vec<(Name, ObjRef)>,
    /// Bumped on every mutation of `attrs`.
    pub version: u64,
}

impl TypeObj {
    pub fn attr(&self, name: Name) -> Option<ObjRef> {
        self.attrs.iter().find(|(n, _)| *n == name).map(|&(_, v)| v)
    }

    pub fn slot_index(&self, name: Name) -> Option<usize> {
        self.slots.iter().position(|&n| n == name)
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin.is_some()
    }
}

/// An instance of a user class. Fields follow the class's slot layout;
/// `NULL` marks an unset field.
#[derive(Debug)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Vec<ObjRef>,
}

#[derive(Debug, Clone)]
pub struct ExceptionObj {
    pub kind: ExcKind,
    pub message: String,
}

/// Every heap object.
#[derive(Debug)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Vec<ObjRef>),
    List(Vec<ObjRef>),
    Function(FunctionObj),
    Code(Arc<CodeUnit>),
    Type(TypeObj),
    Instance(InstanceObj),
    BuiltinFunction(BuiltinFnId),
    BuiltinMethod(BuiltinMethodId),
    BoundMethod { func: ObjRef, receiver: ObjRef },
    Exception(ExceptionObj),
    /// Contents may be `NULL` (unbound).
    Cell(ObjRef),
    Namespace(Namespace),
    /// A global whose value is computed by calling `thunk` on first load.
    LazyValue { thunk: ObjRef },
}

impl Object {
    pub fn kind(&self) -> ObjKind {
        match self {
            Object::None => ObjKind::None,
            Object::Bool(_) => ObjKind::Bool,
            Object::Int(_) => ObjKind::Int,
            Object::Float(_) => ObjKind::Float,
            Object::Str(_) => ObjKind::Str,
            Object::Tuple(_) => ObjKind::Tuple,
            Object::List(_) => ObjKind::List,
            Object::Function(_) => ObjKind::Function,
            Object::Code(_) => ObjKind::Code,
            Object::Type(_) => ObjKind::Type,
            Object::Instance(_) => ObjKind::Instance,
            Object::BuiltinFunction(_) | Object::BuiltinMethod(_) => ObjKind::Builtin,
            Object::BoundMethod { .. } => ObjKind::BoundMethod,
            Object::Exception(_) => ObjKind::Exception,
            Object::Cell(_) => ObjKind::Cell,
            Object::Namespace(_) | Object::LazyValue { .. } => ObjKind::Other,
        }
    }

    /// Owned references held by this object.
    fn children(&self, out: &mut SmallVec<[ObjRef; 8]>) {
        match self {
            Object::None
            | Object::Bool(_)
            | Object::Int(_)
            | Object::Float(_)
            | Object::Str(_)
            | Object::Code(_)
            | Object::BuiltinFunction(_)
            | Object::BuiltinMethod(_)
            | Object::Exception(_) => {}
            Object::Tuple(items) | Object::List(items) => out.extend(items.iter().copied()),
            Object::Function(f) => {
                out.push(f.code);
                out.push(f.globals);
                out.push(f.builtins);
                out.extend(f.defaults.iter().copied());
                out.extend(f.closure.iter().copied());
            }
            Object::Type(t) => out.extend(t.attrs.iter().map(|&(_, v)| v)),
            Object::Instance(inst) => {
                out.push(inst.class);
                out.extend(inst.fields.iter().copied());
            }
            Object::BoundMethod { func, receiver } => {
                out.push(*func);
                out.push(*receiver);
            }
            Object::Cell(v) => out.push(*v),
            Object::Namespace(ns) => out.extend(ns.values()),
            Object::LazyValue { thunk } => out.push(*thunk),
        }
    }
}

// ── Heap ───────────────────────────────────────────────────────────

struct Slot {
    refcount: u32,
    immortal: bool,
    object: Object,
}

/// Slot arena with explicit reference counting.
///
/// Freeing is iterative: releasing a container pushes its children onto a
/// worklist rather than recursing.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live: usize,
    freed_functions: Vec<ObjRef>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: vec![None],
            free: Vec::new(),
            live: 0,
            freed_functions: Vec::new(),
        }
    }

    fn insert(&mut self, slot: Slot) -> ObjRef {
        self.live += 1;
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(slot);
            return ObjRef(idx);
        }
        let idx = u32::try_from(self.slots.len())
            .unwrap_or_else(|_| panic!("heap exhausted: {} slots", self.slots.len()));
        self.slots.push(Some(slot));
        ObjRef(idx)
    }

    /// Allocate `object` with a reference count of one.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.insert(Slot {
            refcount: 1,
            immortal: false,
            object,
        })
    }

    /// Allocate an object that is never freed.
    pub fn alloc_immortal(&mut self, object: Object) -> ObjRef {
        self.insert(Slot {
            refcount: 1,
            immortal: true,
            object,
        })
    }

    #[track_caller]
    fn slot(&self, r: ObjRef) -> &Slot {
        match self.slots.get(r.0 as usize) {
            Some(Some(slot)) => slot,
            _ => panic!("dangling object reference {r:?}"),
        }
    }

    #[track_caller]
    fn slot_mut(&mut self, r: ObjRef) -> &mut Slot {
        match self.slots.get_mut(r.0 as usize) {
            Some(Some(slot)) => slot,
            _ => panic!("dangling object reference {r:?}"),
        }
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        !r.is_null() && matches!(self.slots.get(r.0 as usize), Some(Some(_)))
    }

    #[track_caller]
    pub fn get(&self, r: ObjRef) -> &Object {
        &self.slot(r).object
    }

    #[track_caller]
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        &mut self.slot_mut(r).object
    }

    pub fn kind(&self, r: ObjRef) -> ObjKind {
        self.get(r).kind()
    }

    pub fn refcount(&self, r: ObjRef) -> u32 {
        self.slot(r).refcount
    }

    pub fn is_immortal(&self, r: ObjRef) -> bool {
        self.slot(r).immortal
    }

    /// Number of live (allocated, not freed) objects.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Add a reference. `NULL` is ignored.
    #[track_caller]
    pub fn incref(&mut self, r: ObjRef) {
        if r.is_null() {
            return;
        }
        let slot = self.slot_mut(r);
        if !slot.immortal {
            slot.refcount += 1;
        }
    }

    /// Drop a reference, freeing the object (and transitively its
    /// children) when the count reaches zero. `NULL` is ignored.
    #[track_caller]
    pub fn decref(&mut self, r: ObjRef) {
        let mut work: SmallVec<[ObjRef; 8]> = SmallVec::new();
        work.push(r);
        while let Some(r) = work.pop() {
            if r.is_null() {
                continue;
            }
            let slot = self.slot_mut(r);
            if slot.immortal {
                continue;
            }
            debug_assert!(slot.refcount > 0, "refcount underflow on {r:?}");
            slot.refcount -= 1;
            if slot.refcount > 0 {
                continue;
            }
            let Some(dead) = self.slots[r.0 as usize].take() else {
                continue;
            };
            if matches!(dead.object, Object::Function(_)) {
                self.freed_functions.push(r);
            }
            dead.object.children(&mut work);
            self.free.push(r.0);
            self.live -= 1;
        }
    }

    /// Functions freed since the last call.
    pub fn take_freed_functions(&mut self) -> Vec<ObjRef> {
        std::mem::take(&mut self.freed_functions)
    }
}

#[cfg(test)]
mod tests;
