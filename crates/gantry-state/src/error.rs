//! Error types for the Gantry state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A route write carried a stale revision token.
    #[error("concurrent modification of route '{route}': expected revision {expected}, found {actual}")]
    ConcurrentModification {
        route: String,
        expected: u64,
        actual: u64,
    },

    /// An active version with the same artifact fingerprint already exists.
    #[error("duplicate artifact: fingerprint {fingerprint} already registered as version {existing}")]
    DuplicateArtifact { fingerprint: String, existing: u64 },

    /// The named entity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Route names must be non-empty and free of `:`, which delimits
    /// the history composite keys.
    #[error("invalid route name '{0}': must be non-empty and must not contain ':'")]
    InvalidRouteName(String),

    /// The referenced version is not in `Active` status.
    #[error("version {0} is not active")]
    VersionNotActive(u64),

    /// A promote was attempted on a route with no candidate.
    #[error("route '{0}' has no candidate to promote")]
    NoCandidate(String),

    /// A candidate weight outside [0, 100].
    #[error("invalid candidate weight {0}, must be in [0, 100]")]
    InvalidWeight(u8),

    /// The version is still referenced and cannot be purged.
    #[error("version {0} is still referenced: {1}")]
    StillReferenced(u64, String),
}
