//! The runtime: heap, singletons, builtin types, pending exception, and the
//! installed JIT hook.

use std::sync::Arc;

use crate::builtins::{self, BuiltinFnId, BuiltinMethodId};
use crate::code::CodeUnit;
use crate::exception::{ExcKind, Raised};
use crate::hook::{JitHook, JitState, WatchKey};
use crate::intern::Name;
use crate::namespace::Namespace;
use crate::object::{ExceptionObj, FunctionObj, Heap, InstanceObj, ObjKind, ObjRef, Object, TypeObj};

/// Nesting limit for calls (interpreted and compiled combined).
pub const MAX_CALL_DEPTH: usize = 200;

/// Execution position of one logical frame, visible to introspection.
#[derive(Clone, Debug)]
pub struct ShadowFrame {
    pub code: Arc<CodeUnit>,
    pub offset: usize,
}

pub struct Runtime {
    pub heap: Heap,
    none: ObjRef,
    true_obj: ObjRef,
    false_obj: ObjRef,
    type_objects: Vec<ObjRef>,
    method_objects: Vec<ObjRef>,
    builtins: ObjRef,
    pending: Option<ObjRef>,
    hook: Option<Arc<dyn JitHook>>,
    shadow: Vec<ShadowFrame>,
    destroy_observers: Vec<Vec<ObjRef>>,
    pub(crate) depth: usize,
    /// Lines written by `print`.
    pub output: Vec<String>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let none = heap.alloc_immortal(Object::None);
        let true_obj = heap.alloc_immortal(Object::Bool(true));
        let false_obj = heap.alloc_immortal(Object::Bool(false));

        let type_objects: Vec<ObjRef> = ObjKind::ALL
            .iter()
            .map(|&kind| {
                heap.alloc_immortal(Object::Type(TypeObj {
                    name: Name::new(kind.type_name()),
                    builtin: Some(kind),
                    slots: Vec::new(),
                    attrs: Vec::new(),
                    version: 0,
                }))
            })
            .collect();

        let method_objects: Vec<ObjRef> = (0..builtins::METHODS.len())
            .map(|i| heap.alloc_immortal(Object::BuiltinMethod(BuiltinMethodId(i as u16))))
            .collect();

        let mut ns = Namespace::new(Name::new("builtins"));
        for (i, def) in builtins::FUNCTIONS.iter().enumerate() {
            let f = heap.alloc_immortal(Object::BuiltinFunction(BuiltinFnId(i as u16)));
            ns.store(Name::new(def.name), f);
        }
        for kind in [
            ObjKind::Bool,
            ObjKind::Int,
            ObjKind::Float,
            ObjKind::Str,
            ObjKind::Tuple,
            ObjKind::List,
            ObjKind::Type,
        ] {
            ns.store(Name::new(kind.type_name()), type_objects[kind as usize]);
        }
        let builtins = heap.alloc_immortal(Object::Namespace(ns));

        Runtime {
            heap,
            none,
            true_obj,
            false_obj,
            type_objects,
            method_objects,
            builtins,
            pending: None,
            hook: None,
            shadow: Vec::new(),
            destroy_observers: Vec::new(),
            depth: 0,
            output: Vec::new(),
        }
    }

    // ── Reference counting ─────────────────────────────────────────

    #[inline]
    pub fn incref(&mut self, r: ObjRef) {
        self.heap.incref(r);
    }

    pub fn decref(&mut self, r: ObjRef) {
        self.heap.decref(r);
        let freed = self.heap.take_freed_functions();
        if let Some(recorder) = self.destroy_observers.last_mut() {
            recorder.extend(freed);
        }
    }

    pub fn decref_all(&mut self, refs: impl IntoIterator<Item = ObjRef>) {
        for r in refs {
            self.decref(r);
        }
    }

    /// Run `f`, returning the functions destroyed while it ran.
    ///
    /// Observers nest; each scope only sees destructions inside it.
    pub fn observe_destroyed_functions<T>(
        &mut self,
        f: impl FnOnce(&mut Runtime) -> T,
    ) -> (T, Vec<ObjRef>) {
        self.destroy_observers.push(Vec::new());
        let result = f(self);
        let destroyed = self.destroy_observers.pop().unwrap_or_default();
        if let Some(outer) = self.destroy_observers.last_mut() {
            outer.extend(destroyed.iter().copied());
        }
        (result, destroyed)
    }

    // ── Singletons and constructors ───────────────────────────────

    #[inline]
    pub fn none(&self) -> ObjRef {
        self.none
    }

    #[inline]
    pub fn bool_obj(&self, b: bool) -> ObjRef {
        if b {
            self.true_obj
        } else {
            self.false_obj
        }
    }

    pub fn new_int(&mut self, value: i64) -> ObjRef {
        self.heap.alloc(Object::Int(value))
    }

    pub fn new_float(&mut self, value: f64) -> ObjRef {
        self.heap.alloc(Object::Float(value))
    }

    pub fn new_str(&mut self, value: &str) -> ObjRef {
        self.heap.alloc(Object::Str(Arc::from(value)))
    }

    /// Build a tuple, taking ownership of `items`.
    pub fn new_tuple(&mut self, items: Vec<ObjRef>) -> ObjRef {
        self.heap.alloc(Object::Tuple(items))
    }

    /// Build a list, taking ownership of `items`.
    pub fn new_list(&mut self, items: Vec<ObjRef>) -> ObjRef {
        self.heap.alloc(Object::List(items))
    }

    pub fn new_exception(&mut self, kind: ExcKind, message: impl Into<String>) -> ObjRef {
        self.heap.alloc(Object::Exception(ExceptionObj {
            kind,
            message: message.into(),
        }))
    }

    pub fn new_namespace(&mut self, name: &str) -> ObjRef {
        self.heap.alloc(Object::Namespace(Namespace::new(Name::new(name))))
    }

    /// A cell holding `value` (borrowed; may be `NULL`).
    pub fn new_cell(&mut self, value: ObjRef) -> ObjRef {
        self.incref(value);
        self.heap.alloc(Object::Cell(value))
    }

    /// A lazily-computed global whose value is `thunk()`.
    pub fn new_lazy(&mut self, thunk: ObjRef) -> ObjRef {
        self.incref(thunk);
        self.heap.alloc(Object::LazyValue { thunk })
    }

    pub fn new_code_object(&mut self, code: Arc<CodeUnit>) -> ObjRef {
        self.heap.alloc(Object::Code(code))
    }

    /// A function over `code` with the given globals and no defaults.
    pub fn new_function(&mut self, code: Arc<CodeUnit>, globals: ObjRef) -> ObjRef {
        self.new_function_with(code, globals, Vec::new(), Vec::new())
    }

    /// A function taking ownership of `defaults` and `closure` cells.
    pub fn new_function_with(
        &mut self,
        code: Arc<CodeUnit>,
        globals: ObjRef,
        defaults: Vec<ObjRef>,
        closure: Vec<ObjRef>,
    ) -> ObjRef {
        let name = code.name;
        let code_obj = self.new_code_object(code);
        self.incref(globals);
        let builtins = self.builtins;
        self.incref(builtins);
        self.heap.alloc(Object::Function(FunctionObj {
            name,
            code: code_obj,
            globals,
            builtins,
            defaults,
            closure,
            jit: JitState::NotCompiled,
            calls: 0,
        }))
    }

    /// A user class with the given instance field layout.
    pub fn new_class(&mut self, name: &str, slots: &[&str]) -> ObjRef {
        self.heap.alloc(Object::Type(TypeObj {
            name: Name::new(name),
            builtin: None,
            slots: slots.iter().map(|s| Name::new(s)).collect(),
            attrs: Vec::new(),
            version: 1,
        }))
    }

    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        let nslots = match self.heap.get(class) {
            Object::Type(t) => t.slots.len(),
            _ => 0,
        };
        self.incref(class);
        self.heap.alloc(Object::Instance(InstanceObj {
            class,
            fields: vec![ObjRef::NULL; nslots],
        }))
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn builtins(&self) -> ObjRef {
        self.builtins
    }

    pub fn kind_of(&self, obj: ObjRef) -> ObjKind {
        self.heap.kind(obj)
    }

    pub fn type_object(&self, kind: ObjKind) -> ObjRef {
        self.type_objects[kind as usize]
    }

    /// The class of an instance, or the builtin type object otherwise.
    pub fn type_of(&self, obj: ObjRef) -> ObjRef {
        match self.heap.get(obj) {
            Object::Instance(inst) => inst.class,
            other => self.type_objects[other.kind() as usize],
        }
    }

    pub fn type_obj(&self, ty: ObjRef) -> Option<&TypeObj> {
        match self.heap.get(ty) {
            Object::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn type_name_of(&self, obj: ObjRef) -> Name {
        self.type_obj(self.type_of(obj))
            .map_or(Name::EMPTY, |t| t.name)
    }

    pub fn method_object(&self, id: BuiltinMethodId) -> ObjRef {
        self.method_objects[id.0 as usize]
    }

    pub fn function(&self, func: ObjRef) -> Option<&FunctionObj> {
        match self.heap.get(func) {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn function_mut(&mut self, func: ObjRef) -> Option<&mut FunctionObj> {
        match self.heap.get_mut(func) {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    /// The code unit of a function object.
    pub fn func_code(&self, func: ObjRef) -> Option<Arc<CodeUnit>> {
        let f = self.function(func)?;
        self.code_unit(f.code)
    }

    pub fn code_unit(&self, code_obj: ObjRef) -> Option<Arc<CodeUnit>> {
        match self.heap.get(code_obj) {
            Object::Code(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    /// Replace a function's code, as assigning `__code__` would.
    pub fn set_function_code(&mut self, func: ObjRef, code: Arc<CodeUnit>) {
        let code_obj = self.new_code_object(code);
        let old = match self.function_mut(func) {
            Some(f) => std::mem::replace(&mut f.code, code_obj),
            None => code_obj,
        };
        self.decref(old);
    }

    pub fn jit_state(&self, func: ObjRef) -> JitState {
        self.function(func).map_or(JitState::NotCompiled, |f| f.jit)
    }

    pub fn set_jit_state(&mut self, func: ObjRef, state: JitState) {
        if let Some(f) = self.function_mut(func) {
            f.jit = state;
        }
    }

    pub fn namespace(&self, ns: ObjRef) -> Option<&Namespace> {
        match self.heap.get(ns) {
            Object::Namespace(n) => Some(n),
            _ => None,
        }
    }

    fn namespace_mut(&mut self, ns: ObjRef) -> Option<&mut Namespace> {
        match self.heap.get_mut(ns) {
            Object::Namespace(n) => Some(n),
            _ => None,
        }
    }

    /// Mark a namespace as watched so key-set changes reach the hook.
    pub fn watch_namespace(&mut self, ns: ObjRef) {
        if let Some(n) = self.namespace_mut(ns) {
            n.watched = true;
        }
    }

    /// Bind `name` in `ns` to `value` (borrowed).
    pub fn set_global(&mut self, ns: ObjRef, name: &str, value: ObjRef) {
        self.incref(value);
        self.store_global_owned(ns, Name::new(name), value);
    }

    /// Bind `name`, taking ownership of `value`.
    pub fn store_global_owned(&mut self, ns: ObjRef, name: Name, value: ObjRef) {
        let Some(n) = self.namespace_mut(ns) else {
            self.decref(value);
            return;
        };
        let outcome = n.store(name, value);
        let watched = n.watched;
        self.decref(outcome.old);
        if watched && outcome.new_key {
            self.notify_watch(WatchKey::Namespace(ns));
        }
    }

    /// Unbind `name`; its slot index stays reserved.
    pub fn delete_global(&mut self, ns: ObjRef, name: &str) {
        let name = Name::new(name);
        let Some(n) = self.namespace_mut(ns) else {
            return;
        };
        if n.slot_of(name).is_none() {
            return;
        }
        let outcome = n.store(name, ObjRef::NULL);
        let watched = n.watched;
        self.decref(outcome.old);
        if watched {
            self.notify_watch(WatchKey::Namespace(ns));
        }
    }

    /// Value bound to `name` in `ns` (borrowed).
    pub fn get_global(&self, ns: ObjRef, name: &str) -> Option<ObjRef> {
        self.namespace(ns)?.get(Name::new(name))
    }

    /// Set a class attribute (borrowed `value`), bumping the type version.
    pub fn set_class_attr(&mut self, class: ObjRef, name: &str, value: ObjRef) -> Result<(), Raised> {
        self.incref(value);
        self.store_class_attr(class, Name::new(name), value)
    }

    pub(crate) fn store_class_attr(
        &mut self,
        class: ObjRef,
        name: Name,
        value: ObjRef,
    ) -> Result<(), Raised> {
        let old = match self.heap.get_mut(class) {
            Object::Type(t) if t.builtin.is_none() => {
                t.version += 1;
                match t.attrs.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => std::mem::replace(&mut entry.1, value),
                    None => {
                        t.attrs.push((name, value));
                        ObjRef::NULL
                    }
                }
            }
            Object::Type(t) => {
                let tname = t.name;
                self.decref(value);
                return Err(self.raise(
                    ExcKind::TypeError,
                    format!("cannot set '{name}' attribute of immutable type '{tname}'"),
                ));
            }
            _ => {
                self.decref(value);
                return Err(self.raise(ExcKind::TypeError, "not a type"));
            }
        };
        self.decref(old);
        self.notify_watch(WatchKey::Type(class));
        Ok(())
    }

    pub fn type_version(&self, ty: ObjRef) -> u64 {
        self.type_obj(ty).map_or(0, |t| t.version)
    }

    // ── Exceptions ─────────────────────────────────────────────────

    /// Set a new pending exception of `kind`.
    pub fn raise(&mut self, kind: ExcKind, message: impl Into<String>) -> Raised {
        let exc = self.new_exception(kind, message);
        self.raise_object(exc)
    }

    /// Set `exc` (owned) as the pending exception.
    pub fn raise_object(&mut self, exc: ObjRef) -> Raised {
        if let Some(old) = self.pending.replace(exc) {
            self.decref(old);
        }
        Raised
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take ownership of the pending exception.
    pub fn take_pending(&mut self) -> Option<ObjRef> {
        self.pending.take()
    }

    /// Kind and message of the pending exception.
    pub fn pending_exception(&self) -> Option<(ExcKind, String)> {
        let exc = self.pending?;
        match self.heap.get(exc) {
            Object::Exception(e) => Some((e.kind, e.message.clone())),
            _ => None,
        }
    }

    /// Drop the pending exception, if any.
    pub fn clear_pending(&mut self) {
        if let Some(exc) = self.pending.take() {
            self.decref(exc);
        }
    }

    // ── JIT hook ───────────────────────────────────────────────────

    pub fn set_hook(&mut self, hook: Arc<dyn JitHook>) {
        self.hook = Some(hook);
    }

    pub fn clear_hook(&mut self) {
        self.hook = None;
    }

    pub fn hook(&self) -> Option<Arc<dyn JitHook>> {
        self.hook.clone()
    }

    pub fn notify_watch(&mut self, key: WatchKey) {
        if let Some(hook) = self.hook.clone() {
            tracing::debug!(?key, "watch event");
            hook.watch_event(self, key);
        }
    }

    // ── Shadow frames ──────────────────────────────────────────────

    pub fn push_shadow(&mut self, code: Arc<CodeUnit>, offset: usize) {
        self.shadow.push(ShadowFrame { code, offset });
    }

    pub fn pop_shadow(&mut self) {
        self.shadow.pop();
    }

    pub fn set_shadow_offset(&mut self, offset: usize) {
        if let Some(top) = self.shadow.last_mut() {
            top.offset = offset;
        }
    }

    /// Drop shadow frames above `len`, e.g. those of inlined callees a
    /// deoptimizing function pushed.
    pub fn truncate_shadow(&mut self, len: usize) {
        self.shadow.truncate(len);
    }

    pub fn shadow_frames(&self) -> &[ShadowFrame] {
        &self.shadow
    }

    /// Source line of the innermost logical frame.
    pub fn current_line(&self) -> Option<u32> {
        self.shadow.last().map(|f| f.code.line_at(f.offset))
    }

    pub fn call_depth(&self) -> usize {
        self.depth
    }
}
