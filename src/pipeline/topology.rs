//! Sink/tracking mode axes and the downstream chain table
//!
//! The two configuration axes select one of a fixed set of shared
//! downstream chains. The table is literal: each valid combination maps
//! to an exact ordered role sequence, and those sequences are load-
//! bearing observed behavior, including the file-sink tracked chain,
//! which leaves the tracking stage off the linear chain even though the
//! stage itself is created and configured.

use super::error::GraphError;
use super::stage::StageKind;

/// Output sink selector, argument 1|2|3 on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Encode to a file
    File,
    /// Discard everything (throughput measurements)
    Discard,
    /// Render on screen
    Display,
}

impl SinkKind {
    /// Map the positional command-line selector; anything outside the
    /// table is a fatal configuration error.
    pub fn from_arg(value: i64) -> Result<Self, GraphError> {
        match value {
            1 => Ok(SinkKind::File),
            2 => Ok(SinkKind::Discard),
            3 => Ok(SinkKind::Display),
            other => Err(GraphError::InvalidMode(format!(
                "sink selector must be 1 (file), 2 (discard) or 3 (display), got {other}"
            ))),
        }
    }

    /// The stage kind fulfilling the Render role for this sink
    pub fn render_stage(&self) -> StageKind {
        match self {
            SinkKind::File => StageKind::FileSink,
            SinkKind::Discard => StageKind::DiscardSink,
            SinkKind::Display => StageKind::DisplaySink,
        }
    }
}

/// Analytics tracking selector, argument 1|2 on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    Untracked,
    Tracked,
}

impl TrackingMode {
    pub fn from_arg(value: i64) -> Result<Self, GraphError> {
        match value {
            1 => Ok(TrackingMode::Untracked),
            2 => Ok(TrackingMode::Tracked),
            other => Err(GraphError::InvalidMode(format!(
                "tracking option can only be 1 or 2, got {other}"
            ))),
        }
    }
}

/// Roles the shared downstream chain is assembled from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Inference,
    Tracking,
    Tiling,
    Overlay,
    FormatConvert,
    Encode,
    Render,
}

/// The ordered downstream role sequence for a sink/tracking combination.
///
/// File-sink tracked intentionally reproduces the observed chain with no
/// Tracking entry; the tracking stage still exists in the graph, idle.
pub fn downstream_roles(sink: SinkKind, tracking: TrackingMode) -> &'static [StageRole] {
    use StageRole::*;
    match (sink, tracking) {
        (SinkKind::File, TrackingMode::Untracked) => {
            &[Inference, Tiling, Overlay, FormatConvert, Encode, Render]
        }
        (SinkKind::File, TrackingMode::Tracked) => {
            &[Inference, Tiling, FormatConvert, Encode, Render]
        }
        (SinkKind::Discard, _) => &[Inference, Tracking, Tiling, Overlay, Render],
        (SinkKind::Display, TrackingMode::Untracked) => &[Inference, Tiling, Overlay, Render],
        (SinkKind::Display, TrackingMode::Tracked) => {
            &[Inference, Tracking, Overlay, Tiling, Render]
        }
    }
}

/// Resolve a role to the stage kind that fulfills it for the given sink
pub fn role_stage(role: StageRole, sink: SinkKind) -> StageKind {
    match role {
        StageRole::Inference => StageKind::Inference,
        StageRole::Tracking => StageKind::Tracking,
        StageRole::Tiling => StageKind::Tiling,
        StageRole::Overlay => StageKind::Overlay,
        StageRole::FormatConvert => StageKind::Convert,
        StageRole::Encode => StageKind::Encode,
        StageRole::Render => sink.render_stage(),
    }
}
