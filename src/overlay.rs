//! Session overlays
//!
//! Per-connection settings that the server keeps per *session*: masquerade
//! identity, triple-cache size, bulk mode, duplicate suppression and the
//! upload commit period. Until a connection is bound to a dedicated session
//! they are plain client-side values; at bind time the non-default ones are
//! pushed to the session through a fixed pipeline:
//!
//! ```text
//! masquerade → triple cache → bulk mode → duplicate suppression → upload commit period
//! ```
//!
//! Every step is an idempotent set, so a failed pipeline can simply be run
//! again. Returning a session to the pool runs the pipeline with the default
//! overlay and every step forced.

use crate::error::{SessionError, SessionResult};
use crate::session::BackendSession;
use crate::transport::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Commit-time duplicate handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DuplicateSuppression {
    /// Keep duplicates
    #[default]
    #[serde(rename = "false")]
    Off,
    /// Statements with equal subject, predicate and object are duplicates
    #[serde(rename = "spo")]
    Spo,
    /// Statements with equal subject, predicate, object and graph are duplicates
    #[serde(rename = "spog")]
    Spog,
}

impl DuplicateSuppression {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateSuppression::Off => "false",
            DuplicateSuppression::Spo => "spo",
            DuplicateSuppression::Spog => "spog",
        }
    }
}

impl fmt::Display for DuplicateSuppression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicateSuppression {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "false" => Ok(DuplicateSuppression::Off),
            "spo" => Ok(DuplicateSuppression::Spo),
            "spog" => Ok(DuplicateSuppression::Spog),
            other => Err(SessionError::invalid(
                "duplicate suppression policy",
                format!("'{other}' is not one of false, spo, spog"),
            )),
        }
    }
}

/// One stage of the overlay pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayStep {
    Masquerade,
    TripleCache,
    BulkMode,
    DuplicateSuppression,
    UploadCommitPeriod,
}

/// Order in which overlay fields reach a session
pub const APPLY_ORDER: [OverlayStep; 5] = [
    OverlayStep::Masquerade,
    OverlayStep::TripleCache,
    OverlayStep::BulkMode,
    OverlayStep::DuplicateSuppression,
    OverlayStep::UploadCommitPeriod,
];

/// Which steps of the pipeline to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Only fields that differ from the defaults (binding a fresh session)
    NonDefault,
    /// Every field (resetting a session before reuse)
    All,
}

/// Session-scoped settings of one logical connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOverlay {
    masquerade_user: Option<String>,
    triple_cache_size: u64,
    bulk_mode: bool,
    duplicate_suppression: DuplicateSuppression,
    upload_commit_period: u32,
}

impl SessionOverlay {
    pub fn masquerade_user(&self) -> Option<&str> {
        self.masquerade_user.as_deref()
    }

    pub fn triple_cache_size(&self) -> u64 {
        self.triple_cache_size
    }

    pub fn bulk_mode(&self) -> bool {
        self.bulk_mode
    }

    pub fn duplicate_suppression(&self) -> DuplicateSuppression {
        self.duplicate_suppression
    }

    pub fn upload_commit_period(&self) -> u32 {
        self.upload_commit_period
    }

    pub fn set_masquerade_user(&mut self, user: Option<String>) -> SessionResult<()> {
        if let Some(name) = &user {
            if name.trim().is_empty() {
                return Err(SessionError::invalid(
                    "masquerade user",
                    "user name cannot be empty",
                ));
            }
        }
        self.masquerade_user = user;
        Ok(())
    }

    pub fn set_triple_cache_size(&mut self, size: u64) {
        self.triple_cache_size = size;
    }

    pub fn set_bulk_mode(&mut self, on: bool) {
        self.bulk_mode = on;
    }

    pub fn set_duplicate_suppression(&mut self, policy: DuplicateSuppression) {
        self.duplicate_suppression = policy;
    }

    /// Parse and set a policy token; an invalid token leaves the overlay unchanged
    pub fn set_duplicate_suppression_str(&mut self, token: &str) -> SessionResult<()> {
        let policy = token.parse()?;
        self.duplicate_suppression = policy;
        Ok(())
    }

    pub fn set_upload_commit_period(&mut self, period: u32) {
        self.upload_commit_period = period;
    }

    pub fn is_default(&self) -> bool {
        *self == SessionOverlay::default()
    }

    /// Whether this field holds its default value
    pub fn is_default_step(&self, step: OverlayStep) -> bool {
        match step {
            OverlayStep::Masquerade => self.masquerade_user.is_none(),
            OverlayStep::TripleCache => self.triple_cache_size == 0,
            OverlayStep::BulkMode => !self.bulk_mode,
            OverlayStep::DuplicateSuppression => {
                self.duplicate_suppression == DuplicateSuppression::Off
            }
            OverlayStep::UploadCommitPeriod => self.upload_commit_period == 0,
        }
    }

    /// Whether the server only honours this overlay inside a dedicated session.
    ///
    /// The upload commit period travels with each upload request and does
    /// not need one.
    pub fn requires_dedicated_session(&self) -> bool {
        APPLY_ORDER
            .iter()
            .filter(|step| **step != OverlayStep::UploadCommitPeriod)
            .any(|step| !self.is_default_step(*step))
    }

    /// Steps to run for `mode`, in pipeline order
    pub fn steps(&self, mode: ApplyMode) -> Vec<OverlayStep> {
        APPLY_ORDER
            .iter()
            .copied()
            .filter(|step| mode == ApplyMode::All || !self.is_default_step(*step))
            .collect()
    }

    /// Server request for a step; None for client-side steps
    pub(crate) fn operation(&self, step: OverlayStep) -> Option<Operation> {
        match step {
            OverlayStep::Masquerade => Some(Operation::SetMasquerade(self.masquerade_user.clone())),
            OverlayStep::TripleCache => Some(Operation::SetTripleCache(self.triple_cache_size)),
            OverlayStep::BulkMode => Some(Operation::SetBulkMode(self.bulk_mode)),
            OverlayStep::DuplicateSuppression => Some(Operation::SetDuplicateSuppression(
                self.duplicate_suppression,
            )),
            OverlayStep::UploadCommitPeriod => None,
        }
    }

    /// Push this overlay to `session` through the pipeline
    pub fn apply_to(&self, session: &BackendSession, mode: ApplyMode) -> SessionResult<()> {
        for step in self.steps(mode) {
            self.apply_step(session, step)?;
        }
        Ok(())
    }

    /// Push one field to `session`
    pub fn apply_step(&self, session: &BackendSession, step: OverlayStep) -> SessionResult<()> {
        match self.operation(step) {
            Some(op) => {
                session.invoke(&op)?;
            }
            None => session.set_upload_commit_period(self.upload_commit_period),
        }
        tracing::trace!(session = %session.url(), ?step, "overlay_step_applied");
        Ok(())
    }

    /// Reset `session` to the default overlay
    pub fn reset(session: &BackendSession) -> SessionResult<()> {
        SessionOverlay::default().apply_to(session, ApplyMode::All)
    }
}
