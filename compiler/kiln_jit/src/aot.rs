//! Notes describing compiled functions for ahead-of-time images.
//!
//! An image loader finds a function's code by name and checks that it was
//! compiled from the same bytecode before trusting its entry points. The
//! static entry must sit at the fixed offset from the normal one that
//! every compiled function uses.

use kiln_codegen::{GENERIC_ENTRY_OFFSET, STATIC_ENTRY_OFFSET};
use serde::{Deserialize, Serialize};

use crate::artifact::CompiledArtifact;
use crate::error::JitError;

/// Format version written ahead of the notes.
pub const AOT_NOTE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AotNote {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub content_hash: u64,
    pub code_size: u64,
    pub normal_entry: u64,
    pub static_entry: u64,
}

#[derive(Serialize, Deserialize)]
struct NoteSection {
    version: u32,
    notes: Vec<AotNote>,
}

impl AotNote {
    pub fn from_artifact(artifact: &CompiledArtifact) -> Self {
        let code = &artifact.code;
        AotNote {
            function: code.name.as_str().to_string(),
            file: code.filename.to_string(),
            line: code.first_line,
            content_hash: code.content_hash(),
            code_size: artifact.code_size() as u64,
            normal_entry: artifact.generic_entry() as u64,
            static_entry: artifact.static_entry() as u64,
        }
    }

    /// Check that this note describes `artifact`'s bytecode and honors the
    /// entry-point layout.
    pub fn validate_against(&self, artifact: &CompiledArtifact) -> Result<(), JitError> {
        let mismatch = |reason: String| JitError::AotMismatch {
            function: self.function.clone(),
            reason,
        };
        let code = &artifact.code;
        if self.function != code.name.as_str() {
            return Err(mismatch(format!("note is for {}", code.name)));
        }
        let hash = code.content_hash();
        if self.content_hash != hash {
            return Err(mismatch(format!(
                "content hash {:#x}, bytecode hashes to {hash:#x}",
                self.content_hash
            )));
        }
        let static_offset = (STATIC_ENTRY_OFFSET - GENERIC_ENTRY_OFFSET) as u64;
        if self.static_entry.checked_sub(self.normal_entry) != Some(static_offset) {
            return Err(mismatch(format!(
                "static entry {:#x} is not {static_offset} bytes after {:#x}",
                self.static_entry, self.normal_entry
            )));
        }
        if self.code_size != artifact.code_size() as u64 {
            return Err(mismatch(format!(
                "code size {} differs from compiled size {}",
                self.code_size,
                artifact.code_size()
            )));
        }
        Ok(())
    }
}

pub fn encode_notes(notes: &[AotNote]) -> Result<Vec<u8>, JitError> {
    let section = NoteSection {
        version: AOT_NOTE_VERSION,
        notes: notes.to_vec(),
    };
    bincode::serialize(&section).map_err(|e| JitError::AotEncoding(format!("failed to serialize notes: {e}")))
}

pub fn decode_notes(bytes: &[u8]) -> Result<Vec<AotNote>, JitError> {
    let section: NoteSection = bincode::deserialize(bytes)
        .map_err(|e| JitError::AotEncoding(format!("failed to deserialize notes: {e}")))?;
    if section.version != AOT_NOTE_VERSION {
        return Err(JitError::AotEncoding(format!(
            "note version {} is not {AOT_NOTE_VERSION}",
            section.version
        )));
    }
    Ok(section.notes)
}
