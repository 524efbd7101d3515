//! Error taxonomy for the coordination layer
//!
//! Every public operation of a manager returns `Result<_, NodeError>`.
//! None of these are fatal: callers log and either drop the operation or
//! leave retry to the connection driver.

use crate::transport::LinkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// `begin()` was never called on the manager
    #[error("{manager} manager not initialized, call begin() first")]
    NotInitialized { manager: &'static str },

    /// Lock could not be acquired within the caller's timeout
    #[error("timed out acquiring {manager} lock")]
    LockTimeout { manager: &'static str },

    /// Acquiring `requested` while `held` is held would break the global lock order
    #[error("lock order violation: {requested} requested while holding {held}")]
    LockOrder {
        requested: &'static str,
        held: &'static str,
    },

    #[error("broker connection is disabled")]
    Disabled,

    #[error("broker connection is not established")]
    NotConnected,

    #[error("topic cannot be empty")]
    EmptyTopic,

    #[error("payload cannot be empty")]
    EmptyPayload,

    #[error("transport failure: {0}")]
    Transport(#[from] LinkError),

    /// Trust anchor missing or structurally invalid
    #[error("invalid CA certificate: {0}")]
    Certificate(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("identity discovery failed: {0}")]
    Identity(String),
}

impl NodeError {
    /// Lock failures are expected under contention and only abort the current operation.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            NodeError::LockTimeout { .. } | NodeError::LockOrder { .. } | NodeError::NotInitialized { .. }
        )
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
