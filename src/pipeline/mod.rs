//! Media-processing graph assembly and runtime orchestration
//!
//! This module is the heart of warpflow: a runtime-configurable graph
//! that fans a variable number of input sources through per-source
//! decode/transform subgraphs, merges them into a batched stream, and
//! routes the batch through a selectable chain of analytics and output
//! stages.
//!
//! # Architecture
//!
//! - Each stage runs in its own async task and talks to its neighbors
//!   through bounded channels
//! - Stages implement the [`Stage`] trait and are created by the
//!   [`StageRegistry`]; callers swap in real codecs/models by
//!   registering their own factories
//! - Every source owns a [`SourceBinding`] whose output port is created
//!   at build time and bound asynchronously once the decode subgraph
//!   announces a usable format
//! - The [`GraphBuilder`] wires sources into the shared merge stage and
//!   appends the downstream chain selected by the topology table
//! - The [`MetadataProbe`] sits on the render stage's input boundary,
//!   counting and logging detections and feeding the throughput counter
//! - The [`BusMonitor`] consumes lifecycle signals and decides when the
//!   run is over

pub mod builder;
pub mod bus;
pub mod error;
pub mod graph;
pub mod probe;
pub mod registry;
pub mod source;
pub mod stage;
pub mod stages;
pub mod topology;
pub mod types;

pub use builder::GraphBuilder;
pub use bus::{BusMessage, BusMonitor, RunOutcome};
pub use error::GraphError;
pub use graph::{PipelineGraph, PipelineState};
pub use probe::{MetadataProbe, PerfCounter};
pub use registry::StageRegistry;
pub use source::{DecodeBackend, PadBinder, SourceBinding};
pub use stage::{Stage, StageContext, StageKind, StageParams};
pub use topology::{SinkKind, TrackingMode};
pub use types::{FrameMeta, MediaBuffer, MediaKind, ObjectMeta, StreamFormat, Timestamp};
