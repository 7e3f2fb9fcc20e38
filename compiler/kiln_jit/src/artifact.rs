//! Compiled artifacts.
//!
//! An artifact is one function's code in the shared buffer plus everything
//! needed to run it and to leave it: the deopt table, the runtime tables
//! (materialized on first install, because boxing constants needs the
//! runtime), and introspection data.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kiln_codegen::{
    CodeRuntime, DeoptMetadata, EmittedCode, Generated, LirFunction, GENERIC_ENTRY_OFFSET, REENTRY_OFFSET,
    STATIC_ENTRY_OFFSET,
};
use kiln_hir::{DeoptReason, InlineStats};
use parking_lot::Mutex;
use kiln_rt::{CodeUnit, JitEntry, Name, Runtime};

use crate::context::CompilationKey;

/// Deopt exits taken, by reason.
#[derive(Debug, Default)]
pub struct DeoptStats {
    counts: [AtomicU64; DeoptReason::ALL.len()],
}

impl DeoptStats {
    pub fn record(&self, reason: DeoptReason) {
        self.counts[reason_index(reason)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, reason: DeoptReason) -> u64 {
        self.counts[reason_index(reason)].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Non-zero counts.
    pub fn snapshot(&self) -> Vec<(DeoptReason, u64)> {
        DeoptReason::ALL
            .iter()
            .map(|&r| (r, self.count(r)))
            .filter(|&(_, n)| n > 0)
            .collect()
    }
}

fn reason_index(reason: DeoptReason) -> usize {
    DeoptReason::ALL.iter().position(|&r| r == reason).unwrap_or(0)
}

#[derive(Debug)]
pub struct CompiledArtifact {
    id: u64,
    pub key: CompilationKey,
    pub name: Name,
    pub code: Arc<CodeUnit>,
    /// Absolute offset of the generic entry in the shared buffer.
    pub base: usize,
    lir: LirFunction,
    emitted: EmittedCode,
    inline_stats: InlineStats,
    /// `None` before the first install and again after release.
    runtime: Mutex<Option<Arc<CodeRuntime>>>,
    stats: DeoptStats,
}

impl CompiledArtifact {
    pub(crate) fn new(id: u64, key: CompilationKey, generated: Generated, base: usize, inline_stats: InlineStats) -> Self {
        let Generated { lir, code } = generated;
        CompiledArtifact {
            id,
            key,
            name: lir.name,
            code: Arc::clone(&lir.code),
            base,
            lir,
            emitted: code,
            inline_stats,
            runtime: Mutex::new(None),
            stats: DeoptStats::default(),
        }
    }

    /// The handle functions running this code are bound to.
    pub fn entry(&self) -> JitEntry {
        JitEntry(self.id)
    }

    pub fn generic_entry(&self) -> usize {
        self.base + GENERIC_ENTRY_OFFSET
    }

    pub fn reentry(&self) -> usize {
        self.base + REENTRY_OFFSET
    }

    pub fn static_entry(&self) -> usize {
        self.base + STATIC_ENTRY_OFFSET
    }

    pub fn is_static(&self) -> bool {
        self.lir.is_static
    }

    pub fn lir(&self) -> &LirFunction {
        &self.lir
    }

    pub fn deopt_metadata(&self) -> &DeoptMetadata {
        &self.emitted.deopt
    }

    pub fn patch_sites(&self) -> &[kiln_codegen::PatchSite] {
        &self.emitted.patch_sites
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn code_size(&self) -> usize {
        self.emitted.code_size()
    }

    pub fn stack_size(&self) -> u32 {
        self.emitted.stack_size
    }

    pub fn spill_size(&self) -> u32 {
        self.emitted.spill_size
    }

    pub fn opcode_counts(&self) -> &BTreeMap<&'static str, u32> {
        &self.emitted.opcode_counts
    }

    pub fn inline_stats(&self) -> &InlineStats {
        &self.inline_stats
    }

    pub fn deopt_stats(&self) -> &DeoptStats {
        &self.stats
    }

    // ── Runtime tables ─────────────────────────────────────────────

    /// Tables compiled code reads, while installed.
    pub fn runtime(&self) -> Option<Arc<CodeRuntime>> {
        self.runtime.lock().clone()
    }

    /// Materialize the runtime tables if this is the first install.
    pub(crate) fn materialize(&self, rt: &mut Runtime) -> Arc<CodeRuntime> {
        let mut slot = self.runtime.lock();
        let tables = slot.get_or_insert_with(|| {
            let lir = &self.lir;
            Arc::new(CodeRuntime::materialize(
                rt,
                &lir.consts,
                lir.references.clone(),
                lir.names.clone(),
                lir.inlined_codes.clone(),
                lir.num_attr_caches,
            ))
        });
        Arc::clone(tables)
    }

    /// Drop the runtime tables and the references they hold. The code must
    /// not run afterwards; a later call finds no tables.
    pub(crate) fn release(&self, rt: &mut Runtime) {
        let tables = self.runtime.lock().take();
        if let Some(tables) = tables {
            tables.release(rt);
        }
    }
}
