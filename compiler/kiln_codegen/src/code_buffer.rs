//! The shared, append-only code buffer.
//!
//! Every compiled function's machine code lives in one buffer at a stable
//! offset for the life of the process. Bytes are never removed; evicted
//! artifacts keep their range. The only mutation after append is
//! patching an instruction at an offset registered as a patch point.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::error::CodegenError;
use crate::isa::{Inst, INSTR_SIZE};

pub type SharedCodeBuffer = Arc<Mutex<CodeBuffer>>;

#[derive(Debug)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    patch_points: FxHashSet<usize>,
}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Self {
        CodeBuffer {
            bytes: Vec::new(),
            capacity,
            patch_points: FxHashSet::default(),
        }
    }

    pub fn shared(capacity: usize) -> SharedCodeBuffer {
        Arc::new(Mutex::new(CodeBuffer::new(capacity)))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.bytes.len())
    }

    /// Append `code` and register `patch_points` (relative to the start of
    /// `code`). Returns the absolute offset of the first byte.
    pub fn append(&mut self, code: &[u8], patch_points: &[usize]) -> Result<usize, CodegenError> {
        if code.len() > self.available() {
            return Err(CodegenError::NoMemory {
                requested: code.len(),
                available: self.available(),
            });
        }
        let base = self.bytes.len();
        self.bytes.extend_from_slice(code);
        self.patch_points.extend(patch_points.iter().map(|&p| base + p));
        Ok(base)
    }

    pub fn fetch(&self, offset: usize) -> Result<Inst, CodegenError> {
        let bytes = self
            .bytes
            .get(offset..offset + INSTR_SIZE)
            .ok_or(CodegenError::BadJump(offset as i64))?;
        Inst::decode(bytes, offset)
    }

    pub fn is_patch_point(&self, offset: usize) -> bool {
        self.patch_points.contains(&offset)
    }

    /// Overwrite the instruction at a registered patch point.
    pub fn patch(&mut self, offset: usize, inst: Inst) -> Result<(), CodegenError> {
        if !self.patch_points.contains(&offset) {
            return Err(CodegenError::NotPatchable(offset));
        }
        self.bytes[offset..offset + INSTR_SIZE].copy_from_slice(&inst.encode());
        Ok(())
    }

    pub fn bytes(&self, start: usize, len: usize) -> &[u8] {
        let end = (start + len).min(self.bytes.len());
        &self.bytes[start.min(end)..end]
    }
}

#[cfg(test)]
mod tests;
