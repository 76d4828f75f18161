//! State persistence – a self-contained binary container for [`MemoryState`].
//!
//! A state file never depends on the model, the tokenizer or any auxiliary
//! file.  Floats are stored bit-for-bit, so `load(save(s)) == s` exactly.
//!
//! # File layout
//!
//! | offset | size          | field                                           |
//! |--------|---------------|-------------------------------------------------|
//! | 0      | 4             | magic `b"LMEM"`                                 |
//! | 4      | 2             | schema version (u16 LE)                         |
//! | 6      | 1             | flags (bit 0: `consolidated` present)           |
//! | 7      | 1             | reserved, zero                                  |
//! | 8      | 4             | width (u32 LE)                                  |
//! | 12     | 8             | trace count (u64 LE)                            |
//! | 20     | 4 × W × N     | traces, little-endian f32, oldest first         |
//! | …      | 4 × W         | consolidated vector (only when flag bit 0 set)  |
//! | end−4  | 4             | CRC-32 of every preceding byte (u32 LE)         |
//!
//! # Example
//!
//! ```rust
//! use livemem_memory::persist;
//! use livemem_memory::state::{MemoryState, Trace};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("memory.lmem");
//!
//! let mut state = MemoryState::new(2);
//! state.push_trace(Trace::new(vec![0.25, -1.5])).unwrap();
//! persist::save(&state, &path).unwrap();
//!
//! let loaded = persist::load(&path, 2).unwrap();
//! assert_eq!(loaded, state);
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use livemem_types::{LiveMemError, STATE_SCHEMA_VERSION};
use thiserror::Error;
use tracing::{debug, info};

use crate::state::{MemoryState, StateError, Trace};

const MAGIC: &[u8; 4] = b"LMEM";
const HEADER_LEN: usize = 20;
const CRC_LEN: usize = 4;
const FLAG_CONSOLIDATED: u8 = 0b0000_0001;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise while saving or loading a memory state.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("memory state file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt memory state: {reason}")]
    Corrupt { reason: String },
    #[error("unsupported memory state version {0} (this build reads version {current})", current = STATE_SCHEMA_VERSION)]
    UnsupportedVersion(u16),
    #[error("memory state width {found} does not match configured model width {expected}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("invalid memory state: {0}")]
    State(#[from] StateError),
}

impl PersistError {
    fn corrupt(reason: impl Into<String>) -> Self {
        PersistError::Corrupt { reason: reason.into() }
    }
}

impl From<PersistError> for LiveMemError {
    fn from(e: PersistError) -> Self {
        match e {
            PersistError::NotFound(path) => LiveMemError::StateNotFound(path.display().to_string()),
            PersistError::Io { .. } => LiveMemError::Io(e.to_string()),
            PersistError::Corrupt { .. } | PersistError::UnsupportedVersion(_) => {
                LiveMemError::CorruptState(e.to_string())
            }
            PersistError::WidthMismatch { .. } => LiveMemError::ConfigMismatch(e.to_string()),
            PersistError::State(inner) => inner.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

fn put_floats(buf: &mut Vec<u8>, values: &[f32]) {
    buf.extend(values.iter().flat_map(|f| f.to_le_bytes()));
}

fn read_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Serialize `state` into the container format.
///
/// The state is validated first; a malformed state is never written.
pub fn to_bytes(state: &MemoryState) -> Result<Vec<u8>, PersistError> {
    state.validate()?;
    let width = u32::try_from(state.width())
        .map_err(|_| PersistError::corrupt(format!("width {} exceeds u32", state.width())))?;

    let payload_floats = state.width() * (state.len() + usize::from(state.consolidated().is_some()));
    let mut buf = Vec::with_capacity(HEADER_LEN + 4 * payload_floats + CRC_LEN);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&state.schema_version().to_le_bytes());
    buf.push(if state.consolidated().is_some() { FLAG_CONSOLIDATED } else { 0 });
    buf.push(0);
    buf.extend_from_slice(&width.to_le_bytes());
    buf.extend_from_slice(&(state.len() as u64).to_le_bytes());
    for trace in state.traces() {
        put_floats(&mut buf, trace.as_slice());
    }
    if let Some(summary) = state.consolidated() {
        put_floats(&mut buf, summary);
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decode a container produced by [`to_bytes`] without any width check.
pub fn from_bytes(bytes: &[u8]) -> Result<MemoryState, PersistError> {
    if bytes.len() < HEADER_LEN + CRC_LEN {
        return Err(PersistError::corrupt(format!(
            "file is {} bytes, shorter than the {}-byte header",
            bytes.len(),
            HEADER_LEN + CRC_LEN
        )));
    }
    if &bytes[..4] != MAGIC {
        return Err(PersistError::corrupt("missing LMEM magic"));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - CRC_LEN);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(PersistError::corrupt(format!(
            "checksum mismatch (stored {stored_crc:#010x}, computed {computed_crc:#010x})"
        )));
    }

    let version = u16::from_le_bytes([body[4], body[5]]);
    if version != STATE_SCHEMA_VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }
    let flags = body[6];
    let width = u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;
    let count = u64::from_le_bytes([
        body[12], body[13], body[14], body[15], body[16], body[17], body[18], body[19],
    ]);
    if width == 0 {
        return Err(PersistError::corrupt("width is zero"));
    }
    let count = usize::try_from(count)
        .map_err(|_| PersistError::corrupt(format!("trace count {count} does not fit in memory")))?;
    let has_consolidated = flags & FLAG_CONSOLIDATED != 0;

    let expected_bytes = count
        .checked_add(usize::from(has_consolidated))
        .and_then(|v| v.checked_mul(width))
        .and_then(|f| f.checked_mul(4))
        .ok_or_else(|| PersistError::corrupt("payload size overflows"))?;
    let payload = &body[HEADER_LEN..];
    if payload.len() != expected_bytes {
        return Err(PersistError::corrupt(format!(
            "payload is {} bytes, header declares {expected_bytes}",
            payload.len()
        )));
    }

    let row = 4 * width;
    let traces = payload[..count * row]
        .chunks_exact(row)
        .map(|chunk| Trace::new(read_floats(chunk)))
        .collect();
    let consolidated = has_consolidated.then(|| read_floats(&payload[count * row..]));

    let state = MemoryState::from_parts(width, traces, consolidated);
    state.validate().map_err(|e| PersistError::corrupt(e.to_string()))?;
    Ok(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Files
// ─────────────────────────────────────────────────────────────────────────────

/// Write `state` to `path`, replacing any existing file.
///
/// The container is written to a sibling temporary file first and renamed
/// into place, so a crash never leaves a half-written state behind.
pub fn save(state: &MemoryState, path: &Path) -> Result<(), PersistError> {
    let bytes = to_bytes(state)?;
    let io_err = |source: io::Error| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, &bytes).map_err(io_err)?;
    if let Err(source) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(source));
    }

    info!(
        path = %path.display(),
        traces = state.len(),
        consolidated = state.consolidated().is_some(),
        bytes = bytes.len(),
        "memory state saved"
    );
    Ok(())
}

/// Read the state stored at `path` without checking it against a model.
pub fn inspect(path: &Path) -> Result<MemoryState, PersistError> {
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            PersistError::NotFound(path.to_path_buf())
        } else {
            PersistError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    debug!(path = %path.display(), bytes = bytes.len(), "read memory state file");
    from_bytes(&bytes)
}

/// Read the state stored at `path` and check that its traces have the
/// configured model width.
///
/// A missing file is reported as [`PersistError::NotFound`]; it never turns
/// into an empty state.
pub fn load(path: &Path, expected_width: usize) -> Result<MemoryState, PersistError> {
    let state = inspect(path)?;
    if state.width() != expected_width {
        return Err(PersistError::WidthMismatch {
            expected: expected_width,
            found: state.width(),
        });
    }
    info!(
        path = %path.display(),
        traces = state.len(),
        consolidated = state.consolidated().is_some(),
        "memory state loaded"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> MemoryState {
        MemoryState::from_parts(
            3,
            vec![
                Trace::new(vec![1.5, -0.25, 0.0]),
                Trace::new(vec![f32::MIN_POSITIVE, 42.0, -0.0]),
                Trace::new(vec![1e-30, 3.4e38, 0.1]),
            ],
            Some(vec![0.3, 0.2, 0.1]),
        )
    }

    #[test]
    fn bytes_roundtrip_is_bit_exact() {
        let state = sample_state();
        let back = from_bytes(&to_bytes(&state).unwrap()).unwrap();
        assert_eq!(back.len(), state.len());
        for (a, b) in state.traces().iter().zip(back.traces()) {
            let a_bits: Vec<u32> = a.as_slice().iter().map(|v| v.to_bits()).collect();
            let b_bits: Vec<u32> = b.as_slice().iter().map(|v| v.to_bits()).collect();
            assert_eq!(a_bits, b_bits);
        }
        assert_eq!(back.consolidated(), state.consolidated());
    }

    #[test]
    fn empty_state_roundtrips_without_consolidated() {
        let state = MemoryState::new(64);
        let back = from_bytes(&to_bytes(&state).unwrap()).unwrap();
        assert_eq!(back, state);
        assert!(back.consolidated().is_none());
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.lmem");
        let state = sample_state();
        save(&state, &path).unwrap();
        assert_eq!(load(&path, 3).unwrap(), state);
        assert!(!dir.path().join("nested").join("state.lmem.tmp").exists());
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.lmem"), 3).unwrap_err();
        assert!(matches!(err, PersistError::NotFound(_)));
        assert!(matches!(LiveMemError::from(err), LiveMemError::StateNotFound(_)));
    }

    #[test]
    fn load_rejects_width_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lmem");
        save(&sample_state(), &path).unwrap();
        let err = load(&path, 64).unwrap_err();
        assert!(matches!(err, PersistError::WidthMismatch { expected: 64, found: 3 }));
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut bytes = to_bytes(&sample_state()).unwrap();
        bytes[HEADER_LEN + 2] ^= 0xFF;
        let err = from_bytes(&bytes).unwrap_err();
        match err {
            PersistError::Corrupt { reason } => assert!(reason.contains("checksum")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let bytes = to_bytes(&sample_state()).unwrap();
        assert!(matches!(from_bytes(&bytes[..10]), Err(PersistError::Corrupt { .. })));
        assert!(matches!(
            from_bytes(&bytes[..bytes.len() - 8]),
            Err(PersistError::Corrupt { .. })
        ));
    }

    #[test]
    fn foreign_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lmem");
        fs::write(&path, b"this is definitely not a memory state").unwrap();
        assert!(matches!(load(&path, 3), Err(PersistError::Corrupt { .. })));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = to_bytes(&sample_state()).unwrap();
        bytes[4] = 9;
        let body_len = bytes.len() - CRC_LEN;
        let crc = crc32fast::hash(&bytes[..body_len]);
        bytes[body_len..].copy_from_slice(&crc.to_le_bytes());
        let err = from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, PersistError::UnsupportedVersion(9)));
        let message = err.to_string();
        assert!(message.contains("version 9"), "{message}");
        assert!(message.contains(&format!("reads version {STATE_SCHEMA_VERSION}")), "{message}");
    }

    #[test]
    fn failed_rename_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lmem");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupant"), b"x").unwrap();

        let err = save(&sample_state(), &path).unwrap_err();
        assert!(matches!(err, PersistError::Io { .. }));
        assert!(!dir.path().join("state.lmem.tmp").exists());
        assert!(path.join("occupant").exists());
    }

    #[test]
    fn save_refuses_malformed_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lmem");
        let state = MemoryState::from_parts(2, vec![Trace::new(vec![1.0])], None);
        let err = save(&state, &path).unwrap_err();
        assert!(matches!(err, PersistError::State(StateError::Malformed { .. })));
        assert!(!path.exists());
    }
}
