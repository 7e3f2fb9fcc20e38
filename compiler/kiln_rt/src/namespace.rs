//! Globals and builtins namespaces with stable slot indices.
//!
//! A slot index, once assigned to a name, never changes: deleting a name
//! leaves a `NULL` value in its slot. Compiled code relies on this to load
//! globals by index.

use rustc_hash::FxHashMap;

use crate::intern::Name;
use crate::object::ObjRef;

#[derive(Debug, Default)]
pub struct Namespace {
    pub name: Name,
    slots: Vec<(Name, ObjRef)>,
    index: FxHashMap<Name, usize>,
    /// Set once a compiled function depends on this namespace's key set.
    pub watched: bool,
}

/// What a store did to a namespace.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct StoreOutcome {
    pub slot: usize,
    pub old: ObjRef,
    pub new_key: bool,
}

impl Namespace {
    pub fn new(name: Name) -> Self {
        Namespace {
            name,
            ..Namespace::default()
        }
    }

    pub fn slot_of(&self, name: Name) -> Option<usize> {
        self.index.get(&name).copied()
    }

    /// Value of `name`, if bound.
    pub fn get(&self, name: Name) -> Option<ObjRef> {
        self.slot_of(name)
            .map(|i| self.slots[i].1)
            .filter(|v| !v.is_null())
    }

    pub fn slot_value(&self, slot: usize) -> ObjRef {
        self.slots.get(slot).map_or(ObjRef::NULL, |&(_, v)| v)
    }

    pub fn slot_name(&self, slot: usize) -> Option<Name> {
        self.slots.get(slot).map(|&(n, _)| n)
    }

    /// Store `value` (ownership transferred in). The caller releases `old`.
    pub fn store(&mut self, name: Name, value: ObjRef) -> StoreOutcome {
        if let Some(slot) = self.slot_of(name) {
            let old = std::mem::replace(&mut self.slots[slot].1, value);
            return StoreOutcome {
                slot,
                old,
                new_key: old.is_null(),
            };
        }
        let slot = self.slots.len();
        self.slots.push((name, value));
        self.index.insert(name, slot);
        StoreOutcome {
            slot,
            old: ObjRef::NULL,
            new_key: true,
        }
    }

    /// Owned values of all bound slots.
    pub fn values(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.slots.iter().map(|&(_, v)| v).filter(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
