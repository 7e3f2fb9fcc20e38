//! Per-function runtime data referenced by compiled code.
//!
//! Compiled instructions name constants, attribute names, inlined code
//! units, and type-attribute caches by index; this table resolves them.
//! It also owns one reference to every object the machine code embeds,
//! so those objects outlive the code.

use std::sync::Arc;

use kiln_rt::{CodeUnit, ConstValue, Name, ObjRef, Runtime};
use parking_lot::Mutex;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct AttrCacheEntry {
    ty: ObjRef,
    version: u64,
    value: ObjRef,
}

#[derive(Debug)]
pub struct CodeRuntime {
    consts: Vec<ObjRef>,
    references: Vec<ObjRef>,
    names: Vec<Name>,
    inlined_codes: Vec<Arc<CodeUnit>>,
    attr_caches: Mutex<Vec<Option<AttrCacheEntry>>>,
}

impl CodeRuntime {
    /// Box `consts` and take a reference to each of `references`.
    pub fn materialize(
        rt: &mut Runtime,
        consts: &[ConstValue],
        references: Vec<ObjRef>,
        names: Vec<Name>,
        inlined_codes: Vec<Arc<CodeUnit>>,
        num_attr_caches: u32,
    ) -> Self {
        let consts = consts.iter().map(|c| rt.box_const(c)).collect();
        for &r in &references {
            rt.incref(r);
        }
        CodeRuntime {
            consts,
            references,
            names,
            inlined_codes,
            attr_caches: Mutex::new(vec![None; num_attr_caches as usize]),
        }
    }

    /// Drop every reference this table holds. The code must never run
    /// again afterwards.
    pub fn release(&self, rt: &mut Runtime) {
        rt.decref_all(self.consts.iter().copied());
        rt.decref_all(self.references.iter().copied());
        let entries: Vec<AttrCacheEntry> = self.attr_caches.lock().iter_mut().filter_map(Option::take).collect();
        for e in entries {
            rt.decref(e.ty);
            rt.decref(e.value);
        }
    }

    pub fn const_object(&self, index: u32) -> Option<ObjRef> {
        self.consts.get(index as usize).copied()
    }

    pub fn name(&self, index: u32) -> Option<Name> {
        self.names.get(index as usize).copied()
    }

    pub fn inlined_code(&self, index: u32) -> Option<&Arc<CodeUnit>> {
        self.inlined_codes.get(index as usize)
    }

    pub fn references(&self) -> &[ObjRef] {
        &self.references
    }

    // ── Type-attribute caches ──────────────────────────────────────

    /// The cache holds `ty` at its current version.
    pub fn cache_hit(&self, rt: &Runtime, cache: u32, ty: ObjRef) -> bool {
        let caches = self.attr_caches.lock();
        caches
            .get(cache as usize)
            .copied()
            .flatten()
            .is_some_and(|e| e.ty == ty && e.version == rt.type_version(ty))
    }

    /// Borrowed cached value, `NULL` when empty.
    pub fn cache_value(&self, cache: u32) -> ObjRef {
        let caches = self.attr_caches.lock();
        caches
            .get(cache as usize)
            .copied()
            .flatten()
            .map_or(ObjRef::NULL, |e| e.value)
    }

    /// Record `value` (borrowed) as `ty`'s attribute at its current version.
    pub fn cache_fill(&self, rt: &mut Runtime, cache: u32, ty: ObjRef, value: ObjRef) {
        let entry = AttrCacheEntry {
            ty,
            version: rt.type_version(ty),
            value,
        };
        let old = {
            let mut caches = self.attr_caches.lock();
            let Some(slot) = caches.get_mut(cache as usize) else {
                return;
            };
            slot.replace(entry)
        };
        rt.incref(ty);
        rt.incref(value);
        if let Some(old) = old {
            rt.decref(old.ty);
            rt.decref(old.value);
        }
    }
}
