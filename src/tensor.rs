//! Ledger-tracked numeric buffers.
//!
//! Every feature vector produced by the extractor is registered with a
//! [`TensorLedger`], so tests and diagnostics can verify that buffers are
//! released when their owning record, gather session or tick goes away.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts live feature buffers.
#[derive(Clone, Debug, Default)]
pub struct TensorLedger {
    live: Arc<AtomicUsize>,
}

impl TensorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Register `values` as a tracked buffer.
    pub fn track(&self, values: Vec<f32>) -> FeatureVector {
        self.live.fetch_add(1, Ordering::AcqRel);
        FeatureVector(Arc::new(TrackedBuffer {
            values: values.into_boxed_slice(),
            live: Arc::clone(&self.live),
        }))
    }

    /// Open a scope whose allocations are released when it drops.
    pub fn scope(&self) -> TensorScope {
        TensorScope {
            ledger: self.clone(),
            owned: Vec::new(),
        }
    }
}

struct TrackedBuffer {
    values: Box<[f32]>,
    live: Arc<AtomicUsize>,
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared, immutable feature vector. Cloning shares the buffer.
#[derive(Clone)]
pub struct FeatureVector(Arc<TrackedBuffer>);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0.values
    }

    /// Little-endian `f32` encoding used for durable storage.
    pub fn to_le_blob(&self) -> Vec<u8> {
        encode_f32_le_blob(self.as_slice())
    }
}

impl Deref for FeatureVector {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.as_slice()
    }
}

impl PartialEq for FeatureVector {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for FeatureVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureVector")
            .field("len", &self.len())
            .finish()
    }
}

/// Owns the buffers allocated during one unit of work, usually a tick.
///
/// Allocations are handed out by reference; a value that must outlive the
/// scope has to be cloned out explicitly.
pub struct TensorScope {
    ledger: TensorLedger,
    owned: Vec<FeatureVector>,
}

impl TensorScope {
    pub fn alloc(&mut self, values: Vec<f32>) -> &FeatureVector {
        let index = self.owned.len();
        self.owned.push(self.ledger.track(values));
        &self.owned[index]
    }

    pub fn len(&self) -> usize {
        self.owned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }
}

impl fmt::Debug for TensorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorScope")
            .field("owned", &self.owned.len())
            .finish()
    }
}

/// Encode `f32` values into a little-endian byte blob.
pub fn encode_f32_le_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().saturating_mul(4));
    for &v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a little-endian `f32` blob into a `Vec<f32>`.
pub fn decode_f32_le_blob(blob: &[u8]) -> Result<Vec<f32>, String> {
    if blob.len() % 4 != 0 {
        return Err(format!(
            "Feature blob length {} is not a multiple of 4 bytes",
            blob.len()
        ));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
