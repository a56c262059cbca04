use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A type-erased, thread-safe container.
///
/// Every value that flows through the task graph (literals, data tasks and task
/// outputs) is stored in this form. Typed access is recovered by downcasting at
/// the edges, in [`Param::extract`](crate::Param::extract) and
/// [`Lazy::compute`](crate::Lazy::compute).
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// Process-wide sequence used for keys that can't be derived from content.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// In `lazygraph`, this serves two purposes:
/// 1. It fingerprints literal arguments and callable identities, so that two
///    identical invocations end up under the same task key.
/// 2. It provides the hexadecimal token embedded in every derived task key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// A token that is never produced twice within this process.
    pub(crate) fn unique() -> Self {
        let n = SEQUENCE.fetch_add(1, Ordering::Relaxed);

        blake3::Hasher::new()
            .update(b"lazygraph:unique:")
            .update(&n.to_le_bytes())
            .finalize()
            .into()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Adapter which lets any [`std::hash::Hash`] value be fed into BLAKE3.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}
