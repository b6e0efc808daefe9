//! The `Generator` and `ProfileStore` traits -- the adapter interfaces for
//! the external collaborators the orchestrator drives.
//!
//! The generator is slow (30 s to several minutes), non-deterministic, and
//! reports no intermediate progress. Both traits are intentionally
//! object-safe so they can be stored as `Arc<dyn ...>` in the orchestrator.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use planforge_db::models::GenerationKind;

/// A user profile, loaded from the external profile store.
///
/// The orchestration core never interprets the payload; it is handed to the
/// generator as-is.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub payload: Value,
}

/// The request context: what to generate.
///
/// Opaque to the orchestration core beyond its kind and the target day,
/// which together decide whether two requests are "the same work" for the
/// dedup rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationContext {
    /// A work plan, optionally for a specific day of the split.
    Plan { target_day: Option<i32> },
    /// A training split.
    Split,
}

impl GenerationContext {
    /// The operation kind recorded in ledger rows and metrics samples.
    pub fn kind(self) -> GenerationKind {
        match self {
            Self::Plan { .. } => GenerationKind::Plan,
            Self::Split => GenerationKind::Split,
        }
    }

    /// The target day, when the context has one.
    pub fn target_day(self) -> Option<i32> {
        match self {
            Self::Plan { target_day } => target_day,
            Self::Split => None,
        }
    }

    /// Whether an existing ledger row describes the same work as this
    /// context. Same kind and same target day means a second start resumes
    /// the existing request instead of conflicting.
    pub fn matches_request(self, kind: GenerationKind, target_day: Option<i32>) -> bool {
        self.kind() == kind && self.target_day() == target_day
    }
}

/// A successfully generated plan.
#[derive(Debug, Clone)]
pub struct GeneratedPlan {
    /// Identifier of the persisted artifact, returned to the client.
    pub result_ref: String,
    /// Auxiliary payload describing what changed (mirrored into the cache).
    pub insight_changes: Value,
}

/// Loads user profiles from the external data store.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load(&self, user_id: Uuid) -> anyhow::Result<UserProfile>;
}

/// The external generation service.
///
/// A single call may take 30--300 seconds and may fail transiently or
/// permanently; the orchestrator classifies the failure and never retries
/// within the same request.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        profile: &UserProfile,
        context: GenerationContext,
    ) -> Result<GeneratedPlan, GeneratorError>;
}

/// Presumed-recoverable failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    RateLimited,
    SelectionFailed,
    ValidationFailed,
}

/// Classified generator failures.
///
/// The raw message travels in logs only; clients see the short classified
/// string from [`GeneratorError::user_message`].
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    /// Failed in a way presumed recoverable on a fresh request.
    #[error("transient generator failure ({kind:?}): {detail}")]
    Transient { kind: TransientKind, detail: String },
    /// Not worth retrying within this request (e.g. an unusable profile).
    #[error("fatal generator failure: {0}")]
    Fatal(String),
}

impl GeneratorError {
    /// The short, classified message surfaced to clients and written to the
    /// ledger. Raw internal detail is never included.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Transient { kind, .. } => match kind {
                TransientKind::Timeout => "generation timed out",
                TransientKind::RateLimited => "generation service is busy, try again shortly",
                TransientKind::SelectionFailed => "exercise selection failed, try again",
                TransientKind::ValidationFailed => "plan validation failed, try again",
            },
            Self::Fatal(_) => "generation failed for this profile",
        }
    }
}

// Compile-time assertion: both traits must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Generator, _: &dyn ProfileStore) {}
};
