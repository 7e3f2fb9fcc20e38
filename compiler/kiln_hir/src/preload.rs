//! Preloading: everything compilation needs from the live runtime.
//!
//! Resolution runs with exclusive access to the runtime because it can
//! execute user code: forcing a lazy global calls its thunk. After
//! [`Preloader::resolve`] returns, compilation never touches the runtime
//! again, which is what lets compile workers run without it.
//!
//! Every object a preloader refers to is retained until
//! [`Preloader::release`], so user code running in a later preload cannot
//! free it.

use std::sync::Arc;

use kiln_rt::builtins::METHODS;
use kiln_rt::{
    ArgAnnotation, BuiltinMethodId, CodeUnit, ExcKind, Name, ObjKind, ObjRef, Object, Op, Raised,
    Runtime,
};
use rustc_hash::FxHashMap;

use crate::types::Type;

/// Where a global name resolved.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GlobalSlot {
    pub namespace: ObjRef,
    pub index: u32,
    pub value: ObjRef,
    pub kind: ObjKind,
    /// Found in builtins; a later global binding of the name would shadow it.
    pub from_builtins: bool,
}

/// A resolved call target.
#[derive(Clone, Debug)]
pub enum CallTarget {
    Function {
        func: ObjRef,
        code: Arc<CodeUnit>,
    },
    Builtin(ObjRef),
    /// Unresolved, or resolved to something that is not directly callable.
    Ambiguous,
}

/// Layout of a user class at preload time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    pub class: ObjRef,
    pub name: Name,
    pub slots: Vec<Name>,
    pub version: u64,
}

impl ClassInfo {
    pub fn slot_index(&self, name: Name) -> Option<u32> {
        self.slots.iter().position(|&n| n == name).map(|i| i as u32)
    }
}

#[derive(Debug)]
pub struct Preloader {
    pub func: ObjRef,
    pub code: Arc<CodeUnit>,
    pub globals: ObjRef,
    pub builtins: ObjRef,
    pub arg_types: Vec<Type>,
    pub return_type: Type,
    globals_map: FxHashMap<Name, GlobalSlot>,
    classes: FxHashMap<ObjRef, ClassInfo>,
    function_codes: FxHashMap<ObjRef, (Arc<CodeUnit>, ObjRef)>,
    /// Per `BuiltinMethodId`.
    builtin_methods: Vec<ObjRef>,
    /// Per `ObjKind`.
    type_objects: Vec<ObjRef>,
    retained: Vec<ObjRef>,
    /// Functions destroyed while this preloader was resolving.
    pub destroyed: Vec<ObjRef>,
}

impl Preloader {
    /// Resolve `func` against the live runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Raised`] with the exception left pending when resolution
    /// raises, or when `func` is not a function.
    pub fn resolve(rt: &mut Runtime, func: ObjRef) -> Result<Preloader, Raised> {
        let (result, destroyed) = rt.observe_destroyed_functions(|rt| Self::resolve_inner(rt, func));
        let mut preloader = result?;
        if !destroyed.is_empty() {
            tracing::debug!(
                function = %preloader.code.name,
                destroyed = destroyed.len(),
                "functions destroyed during preload"
            );
        }
        preloader.destroyed = destroyed;
        Ok(preloader)
    }

    fn resolve_inner(rt: &mut Runtime, func: ObjRef) -> Result<Preloader, Raised> {
        let Some(f) = rt.function(func) else {
            return Err(rt.raise(ExcKind::TypeError, "preload target is not a function"));
        };
        let (globals, builtins) = (f.globals, f.builtins);
        let Some(code) = rt.func_code(func) else {
            return Err(rt.raise(ExcKind::TypeError, "function has no code"));
        };

        let mut p = Preloader {
            func,
            code: Arc::clone(&code),
            globals,
            builtins,
            arg_types: Vec::new(),
            return_type: Type::OBJECT,
            globals_map: FxHashMap::default(),
            classes: FxHashMap::default(),
            function_codes: FxHashMap::default(),
            builtin_methods: (0..METHODS.len())
                .map(|i| rt.method_object(BuiltinMethodId(i as u16)))
                .collect(),
            type_objects: ObjKind::ALL.iter().map(|&k| rt.type_object(k)).collect(),
            retained: Vec::new(),
            destroyed: Vec::new(),
        };
        p.retain(rt, func);

        for op in &code.ops {
            if let Op::LoadGlobal(i) = *op {
                let name = code.names[i as usize];
                if let Err(e) = p.resolve_global(rt, name) {
                    p.release(rt);
                    return Err(e);
                }
            }
        }

        for ann in code.arg_types.iter().chain(std::iter::once(&code.return_type)) {
            if let ArgAnnotation::Class(name) = *ann {
                if let Err(e) = p.resolve_global(rt, name) {
                    p.release(rt);
                    return Err(e);
                }
            }
        }
        p.arg_types = code.arg_types.iter().map(|&a| p.annotation_type(a)).collect();
        p.return_type = p.annotation_type(code.return_type);

        tracing::debug!(
            function = %code.name,
            globals = p.globals_map.len(),
            classes = p.classes.len(),
            "preloaded"
        );
        Ok(p)
    }

    fn retain(&mut self, rt: &mut Runtime, obj: ObjRef) {
        rt.incref(obj);
        self.retained.push(obj);
    }

    fn resolve_global(&mut self, rt: &mut Runtime, name: Name) -> Result<(), Raised> {
        if self.globals_map.contains_key(&name) {
            return Ok(());
        }
        let mut found = None;
        for (ns, from_builtins) in [(self.globals, false), (self.builtins, true)] {
            let Some(n) = rt.namespace(ns) else { continue };
            if let (Some(slot), Some(value)) = (n.slot_of(name), n.get(name)) {
                found = Some((ns, slot, value, from_builtins));
                break;
            }
        }
        let Some((ns, slot, mut value, from_builtins)) = found else {
            return Ok(());
        };
        if let Object::LazyValue { thunk } = rt.heap.get(value) {
            let thunk = *thunk;
            let forced = rt.force_lazy(ns, name, thunk)?;
            rt.decref(forced);
            value = forced;
        }
        let kind = rt.kind_of(value);
        self.retain(rt, value);
        if kind == ObjKind::Function {
            let code_obj = rt.function(value).map(|f| f.code);
            if let (Some(code), Some(code_obj)) = (rt.func_code(value), code_obj) {
                self.retain(rt, code_obj);
                self.function_codes.insert(value, (code, code_obj));
            }
        }
        if kind == ObjKind::Type {
            if let Some(t) = rt.type_obj(value).filter(|t| !t.is_builtin()) {
                let info = ClassInfo {
                    class: value,
                    name: t.name,
                    slots: t.slots.clone(),
                    version: t.version,
                };
                self.classes.insert(value, info);
            }
        }
        self.globals_map.insert(
            name,
            GlobalSlot {
                namespace: ns,
                index: slot as u32,
                value,
                kind,
                from_builtins,
            },
        );
        Ok(())
    }

    fn annotation_type(&self, ann: ArgAnnotation) -> Type {
        let class = match ann {
            ArgAnnotation::Class(name) => self
                .globals_map
                .get(&name)
                .filter(|g| self.classes.contains_key(&g.value))
                .map(|g| g.value),
            _ => None,
        };
        Type::from_annotation(ann, class)
    }

    /// Drop every retained reference. The preloader must not be used for
    /// compilation afterwards.
    pub fn release(&self, rt: &mut Runtime) {
        for &obj in &self.retained {
            rt.decref(obj);
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn global(&self, name: Name) -> Option<&GlobalSlot> {
        self.globals_map.get(&name)
    }

    pub fn globals(&self) -> impl Iterator<Item = (Name, &GlobalSlot)> {
        self.globals_map.iter().map(|(&n, g)| (n, g))
    }

    /// What calling the global `name` would invoke, as far as preload can
    /// tell.
    pub fn call_target(&self, name: Name) -> CallTarget {
        match self.globals_map.get(&name) {
            Some(g) if g.kind == ObjKind::Function => match self.function_codes.get(&g.value) {
                Some((code, _)) => CallTarget::Function {
                    func: g.value,
                    code: Arc::clone(code),
                },
                None => CallTarget::Ambiguous,
            },
            Some(g) if g.kind == ObjKind::Builtin => CallTarget::Builtin(g.value),
            _ => CallTarget::Ambiguous,
        }
    }

    /// Function objects referenced as globals, in first-reference order.
    pub fn referenced_functions(&self) -> Vec<ObjRef> {
        let mut out = Vec::new();
        for op in &self.code.ops {
            if let Op::LoadGlobal(i) = *op {
                if let Some(g) = self.globals_map.get(&self.code.names[i as usize]) {
                    if g.kind == ObjKind::Function && g.value != self.func && !out.contains(&g.value) {
                        out.push(g.value);
                    }
                }
            }
        }
        out
    }

    /// Code of a function referenced as a global.
    pub fn function_code(&self, func: ObjRef) -> Option<&Arc<CodeUnit>> {
        self.function_codes.get(&func).map(|(code, _)| code)
    }

    /// The code object a referenced function held at preload time.
    pub fn function_code_object(&self, func: ObjRef) -> Option<ObjRef> {
        self.function_codes.get(&func).map(|&(_, obj)| obj)
    }

    pub fn class_info(&self, class: ObjRef) -> Option<&ClassInfo> {
        self.classes.get(&class)
    }

    pub fn builtin_method(&self, id: BuiltinMethodId) -> Option<ObjRef> {
        self.builtin_methods.get(id.0 as usize).copied().filter(|r| !r.is_null())
    }

    pub fn type_object(&self, kind: ObjKind) -> Option<ObjRef> {
        self.type_objects.get(kind as usize).copied().filter(|r| !r.is_null())
    }

    pub fn num_retained(&self) -> usize {
        self.retained.len()
    }
}

/// Preloaders of callees, keyed by function object.
pub type PreloaderMap = FxHashMap<ObjRef, Arc<Preloader>>;
