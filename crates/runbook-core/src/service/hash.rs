//! ContentHasher trait for runbook digests.
//!
//! A session stores the digest of its root runbook so a resume can tell when
//! the file changed underneath it. The `Sha256ContentHasher` adapter lives in
//! runbook-infra.

/// Abstraction over content hashing.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}
