//! Failure taxonomy for graph construction and configuration.
//!
//! Everything here is fatal during the build phase and aborts startup.
//! Runtime faults never surface through these types; they travel on the
//! bus as [`BusMessage::Error`](super::bus::BusMessage).

use thiserror::Error;

/// Fatal errors raised while assembling or configuring the pipeline graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// A stage or graph object could not be instantiated
    #[error("failed to create {kind} '{name}': {reason}")]
    CreationFailure {
        kind: String,
        name: String,
        reason: String,
    },

    /// Two stage ports could not be connected
    #[error("failed to link '{upstream}' to '{downstream}': {reason}")]
    LinkFailure {
        upstream: String,
        downstream: String,
        reason: String,
    },

    /// A tracker or dewarp config file could not be parsed
    #[error("error while parsing config file {path}: {reason}")]
    ConfigParse { path: String, reason: String },

    /// A sink-kind/tracking-mode selector outside the topology table
    #[error("invalid mode: {0}")]
    InvalidMode(String),
}

impl GraphError {
    pub(crate) fn creation(kind: &str, name: &str, reason: impl Into<String>) -> Self {
        GraphError::CreationFailure {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn link(upstream: &str, downstream: &str, reason: impl Into<String>) -> Self {
        GraphError::LinkFailure {
            upstream: upstream.to_string(),
            downstream: downstream.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn config(path: impl Into<String>, reason: impl Into<String>) -> Self {
        GraphError::ConfigParse {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
