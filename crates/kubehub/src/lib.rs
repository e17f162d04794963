//! Gantry kubehub: the orchestration-platform seam.
//!
//! [`Platform`] is what the applier, ingest and reconciler talk to.
//! [`KubePlatform`] backs it with kube-rs; [`MemPlatform`] keeps objects in
//! memory and is the platform double used throughout the test suites.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use gantry_core::prelude::*;
use gantry_core::markers;

mod kube_platform;
mod mem;

pub use kube_platform::KubePlatform;
pub use mem::{MemPlatform, Op};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Timeout(_) | PlatformError::Unavailable(_) | PlatformError::Conflict(_))
    }
}

impl From<kube::Error> for PlatformError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                404 => PlatformError::NotFound(ae.message),
                409 if ae.reason == "AlreadyExists" => PlatformError::AlreadyExists(ae.message),
                409 => PlatformError::Conflict(ae.message),
                400 | 422 => PlatformError::Invalid(ae.message),
                401 | 403 => PlatformError::Forbidden(ae.message),
                408 | 429 | 500..=599 => PlatformError::Unavailable(format!("{}: {}", ae.code, ae.message)),
                code => PlatformError::Other(format!("{}: {}", code, ae.message)),
            },
            kube::Error::SerdeError(se) => PlatformError::Other(se.to_string()),
            // transport, auth refresh and the like: retry
            other => PlatformError::Unavailable(other.to_string()),
        }
    }
}

/// What a UID-preconditioned delete found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Nothing with that name exists.
    AlreadyGone,
    /// The name now belongs to a different object; ours is gone.
    Replaced,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn get(&self, object: &ObjectRef) -> Result<Option<LiveObject>, PlatformError>;
    /// Create only; fails with `AlreadyExists` when the name is taken.
    async fn create(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError>;
    /// Server-side apply as the gantry field manager. Idempotent.
    async fn apply(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError>;
    async fn delete(&self, object: &ObjectRef, uid: &str) -> Result<DeleteOutcome, PlatformError>;
    /// Objects of `kind` matching a label selector, across namespaces.
    async fn list(&self, kind: ObjectKind, selector: &str) -> Result<Vec<LiveObject>, PlatformError>;
    /// Watch owned objects of `kind`. The stream starts with `Restarted` and
    /// emits it again whenever the watch is re-established.
    fn watch(&self, kind: ObjectKind) -> BoxStream<'static, Result<WatchEvent, PlatformError>>;

    async fn list_owned(&self, kind: ObjectKind) -> Result<Vec<LiveObject>, PlatformError> {
        self.list(kind, &markers::owned_selector()).await
    }

    async fn list_for(&self, kind: ObjectKind, id: DeploymentId) -> Result<Vec<LiveObject>, PlatformError> {
        self.list(kind, &markers::deployment_selector(id)).await
    }
}

/// Per-call deadline from `GANTRY_PLATFORM_TIMEOUT_SECS` (default 10s).
pub fn call_timeout() -> Duration {
    let secs = std::env::var("GANTRY_PLATFORM_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(10);
    Duration::from_secs(secs.max(1))
}

/// Drop fields that only add noise to stored and compared objects.
pub(crate) fn strip_noisy(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Minimal selector matcher (`k=v` terms joined by commas), enough for marker selectors.
pub(crate) fn selector_matches(selector: &str, raw: &serde_json::Value) -> bool {
    let labels = raw.pointer("/metadata/labels");
    selector.split(',').filter(|t| !t.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => labels.and_then(|l| l.get(k.trim())).and_then(|x| x.as_str()) == Some(v.trim()),
        None => labels.and_then(|l| l.get(term.trim())).is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kube_errors_classify() {
        let api = |code: u16, reason: &str| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "m".into(),
                reason: reason.into(),
                code,
            })
        };
        assert!(matches!(PlatformError::from(api(409, "AlreadyExists")), PlatformError::AlreadyExists(_)));
        assert!(matches!(PlatformError::from(api(409, "Conflict")), PlatformError::Conflict(_)));
        assert!(matches!(PlatformError::from(api(404, "NotFound")), PlatformError::NotFound(_)));
        assert!(matches!(PlatformError::from(api(422, "Invalid")), PlatformError::Invalid(_)));
        assert!(PlatformError::from(api(503, "ServiceUnavailable")).is_transient());
        assert!(PlatformError::from(api(429, "TooManyRequests")).is_transient());
        assert!(!PlatformError::from(api(403, "Forbidden")).is_transient());
    }

    #[test]
    fn selectors_match_marker_labels() {
        let id = DeploymentId::new();
        let mut raw = json!({"metadata": {"name": "x"}});
        assert!(!selector_matches(&markers::owned_selector(), &raw));
        markers::stamp_labels(&mut raw, id);
        assert!(selector_matches(&markers::owned_selector(), &raw));
        assert!(selector_matches(&markers::deployment_selector(id), &raw));
        assert!(!selector_matches(&markers::deployment_selector(DeploymentId::new()), &raw));
    }
}
