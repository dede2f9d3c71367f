//! Pipeline stage trait and shared stage plumbing
//!
//! Defines the interface every processing stage implements, the parameter
//! map stages are created with, and the context handed to a stage when it
//! starts running.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bus::BusMessage;
use super::error::GraphError;
use super::probe::BufferProbe;
use super::types::MediaBuffer;

/// Depth of the channel backing a stage link
pub const LINK_CHANNEL_CAPACITY: usize = 8;

/// Role a stage plays in the graph; also the key stage factories are
/// registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    /// Format normalization into the batched part of the graph
    Convert,
    /// Geometric dewarp transform
    Dewarp,
    /// Batch-forming stream merge
    Mux,
    /// Primary inference
    Inference,
    /// Multi-object tracking
    Tracking,
    /// Grid compositing of batched frames
    Tiling,
    /// Detection/tracking annotation drawing
    Overlay,
    /// Video encoding
    Encode,
    /// File-writing render sink
    FileSink,
    /// Null render sink
    DiscardSink,
    /// On-screen render sink
    DisplaySink,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Convert => "convert",
            StageKind::Dewarp => "dewarp",
            StageKind::Mux => "mux",
            StageKind::Inference => "inference",
            StageKind::Tracking => "tracking",
            StageKind::Tiling => "tiling",
            StageKind::Overlay => "overlay",
            StageKind::Encode => "encode",
            StageKind::FileSink => "filesink",
            StageKind::DiscardSink => "discardsink",
            StageKind::DisplaySink => "displaysink",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single stage parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    UInt(u64),
    Bool(bool),
    Str(String),
}

/// Parameter map a stage is constructed with
#[derive(Debug, Clone, Default)]
pub struct StageParams {
    values: BTreeMap<String, ParamValue>,
}

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: ParamValue) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn set_int(self, key: &str, value: i64) -> Self {
        self.set(key, ParamValue::Int(value))
    }

    pub fn set_uint(self, key: &str, value: u64) -> Self {
        self.set(key, ParamValue::UInt(value))
    }

    pub fn set_bool(self, key: &str, value: bool) -> Self {
        self.set(key, ParamValue::Bool(value))
    }

    pub fn set_str(self, key: &str, value: &str) -> Self {
        self.set(key, ParamValue::Str(value.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(ParamValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(ParamValue::Int(v)) => Some(*v),
            Some(ParamValue::UInt(v)) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn get_uint(&self, key: &str) -> Option<u64> {
        match self.values.get(key) {
            Some(ParamValue::UInt(v)) => Some(*v),
            Some(ParamValue::Int(v)) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }
}

/// Context a stage worker runs with: the bus for lifecycle signals and
/// the shared stop token.
#[derive(Clone)]
pub struct StageContext {
    pub bus: mpsc::Sender<BusMessage>,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(bus: mpsc::Sender<BusMessage>, cancel: CancellationToken) -> Self {
        Self { bus, cancel }
    }

    /// Post an error signal for the named stage onto the bus
    pub async fn post_error(&self, source: &str, message: impl Into<String>) {
        let _ = self
            .bus
            .send(BusMessage::Error {
                source: source.to_string(),
                message: message.into(),
            })
            .await;
    }
}

/// Trait for pipeline stages that process media buffers
///
/// Stages are created by the [`StageRegistry`](super::registry::StageRegistry),
/// wired together through mpsc channels during the build phase, and then
/// each runs as its own worker task until its input drains or the
/// pipeline is stopped. A stage that was added to the graph but never
/// linked idles until shutdown instead of failing.
#[async_trait]
pub trait Stage: Send {
    /// Instance name used in logs and diagnostics
    fn name(&self) -> &str;

    /// The role this stage plays
    fn kind(&self) -> StageKind;

    /// Connect the stage's input port. Fails if the port is already
    /// connected or the stage has no input.
    fn set_input(&mut self, rx: mpsc::Receiver<MediaBuffer>) -> Result<(), GraphError>;

    /// Create and hand out the stage's output port. Fails if the port
    /// was already taken or the stage has no output.
    fn take_output(&mut self) -> Result<mpsc::Receiver<MediaBuffer>, GraphError>;

    /// Read back a constructed stage's property, if it exposes one
    fn property(&self, _key: &str) -> Option<ParamValue> {
        None
    }

    /// Set a runtime-configurable property on a constructed stage
    fn set_property(&mut self, key: &str, _value: ParamValue) -> Result<(), GraphError> {
        Err(GraphError::creation(
            self.kind().as_str(),
            self.name(),
            format!("no such property '{key}'"),
        ))
    }

    /// Request a new named input slot and connect it (merge-type stages
    /// only)
    fn request_input(
        &mut self,
        pad_name: &str,
        _rx: mpsc::Receiver<MediaBuffer>,
    ) -> Result<(), GraphError> {
        Err(GraphError::link(
            pad_name,
            self.name(),
            "stage has no request pads",
        ))
    }

    /// Attach a buffer probe to the stage's input side. Only render
    /// stages accept one.
    fn install_probe(&mut self, _probe: Box<dyn BufferProbe>) -> Result<(), GraphError> {
        Err(GraphError::link(
            "probe",
            self.name(),
            "stage does not accept buffer probes",
        ))
    }

    /// Run the stage, processing buffers until the input drains or the
    /// stop token fires
    async fn run(&mut self, ctx: StageContext) -> Result<()>;
}

/// Connect `upstream`'s output to `downstream`'s input
pub fn link(upstream: &mut dyn Stage, downstream: &mut dyn Stage) -> Result<(), GraphError> {
    let rx = upstream.take_output().map_err(|err| {
        GraphError::link(upstream.name(), downstream.name(), err.to_string())
    })?;
    downstream.set_input(rx).map_err(|err| {
        GraphError::link(upstream.name(), downstream.name(), err.to_string())
    })
}

/// Park an unlinked stage until shutdown.
///
/// Mirrors how a playing bin treats an element nobody linked: it sits in
/// the graph without ever seeing data.
pub(crate) async fn idle_unlinked(name: &str, ctx: &StageContext) {
    log::debug!("{name}: not linked into the graph, idling until shutdown");
    ctx.cancel.cancelled().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_typed_access() {
        let params = StageParams::new()
            .set_int("width", 960)
            .set_uint("batch-size", 4)
            .set_bool("sync", false)
            .set_str("location", "out.h264");

        assert_eq!(params.get_int("width"), Some(960));
        assert_eq!(params.get_uint("batch-size"), Some(4));
        assert_eq!(params.get_bool("sync"), Some(false));
        assert_eq!(params.get_str("location"), Some("out.h264"));
        assert!(params.get("missing").is_none());
    }

    #[test]
    fn test_params_int_uint_coercion() {
        let params = StageParams::new().set_int("n", 3);
        assert_eq!(params.get_uint("n"), Some(3));

        let params = StageParams::new().set_int("n", -3);
        assert_eq!(params.get_uint("n"), None);
    }
}
