//! Shader byte-stream loader.
//!
//! Shader binaries are consumed as opaque byte streams, length-prefixed by
//! the file size. SPIR-V consumers require a `u32`-aligned code array, so the
//! stream is zero-padded up to a multiple of 4 bytes. No magic-number or
//! version validation happens here.

use std::fs;
use std::path::Path;

use crate::error::BackendError;

/// Reads a shader binary and packs it into little-endian `u32` words,
/// zero-padding the tail.
pub fn load_shader_words(path: &Path) -> Result<Vec<u32>, BackendError> {
    let bytes = fs::read(path).map_err(|err| BackendError::ShaderLoad {
        path: path.to_path_buf(),
        kind: err.kind(),
    })?;

    let words = bytes
        .chunks(4)
        .map(|chunk| {
            let mut le = [0u8; 4];
            le[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(le)
        })
        .collect::<Vec<u32>>();

    tracing::debug!(
        path = %path.display(),
        bytes = bytes.len(),
        padded = words.len() * 4,
        "loaded shader"
    );

    Ok(words)
}
