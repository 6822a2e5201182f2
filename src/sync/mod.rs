//! Per-domain sync managers
//!
//! Each manager owns one slice of authoritative state, validates client
//! requests against it, and enqueues the resulting wire messages. Managers
//! call each other only after releasing their own lock.

pub mod building;
pub mod combat;
pub mod death;
pub mod player;
pub mod world;

use crate::anticheat::validator::CheatViolation;
use crate::game::state::PeerId;
use crate::game::systems::items::ItemError;

/// Why a client request was not applied
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("unknown {kind} '{id}'")]
    UnknownReference { kind: &'static str, id: String },
    #[error("{0}")]
    NotPermitted(&'static str),
    #[error("cheat violation: {0}")]
    Violation(#[from] CheatViolation),
    #[error(transparent)]
    Item(#[from] ItemError),
}

impl SyncError {
    pub fn unknown(kind: &'static str, id: impl ToString) -> Self {
        SyncError::UnknownReference {
            kind,
            id: id.to_string(),
        }
    }

    /// Reason string sent back in `actionRejected`
    pub fn reason(&self) -> String {
        match self {
            SyncError::Item(e) => e.reason().to_string(),
            SyncError::Violation(_) => "rejected".to_string(),
            other => other.to_string(),
        }
    }
}
