//! Stage and decoder factories
//!
//! Every stage instance in the graph is created here by kind and
//! parameter map, so creation failures surface uniformly and callers can
//! swap in their own implementations of the heavy stages (real codecs,
//! real detectors) without touching the assembly code.

use std::collections::HashMap;

use super::error::GraphError;
use super::source::{DecodeBackend, TestPatternDecoder};
use super::stage::{Stage, StageKind, StageParams};
use super::stages::convert::ConvertStage;
use super::stages::dewarp::DewarpStage;
use super::stages::encode::EncodeStage;
use super::stages::infer::InferStage;
use super::stages::mux::MuxStage;
use super::stages::overlay::OverlayStage;
use super::stages::sink::{DiscardSinkStage, DisplaySinkStage, FileSinkStage};
use super::stages::tiler::TilerStage;
use super::stages::tracker::TrackerStage;

type StageFactory =
    Box<dyn Fn(&str, &StageParams) -> Result<Box<dyn Stage>, GraphError> + Send + Sync>;
type DecoderFactory =
    Box<dyn Fn(&str, u32) -> Result<Box<dyn DecodeBackend>, GraphError> + Send + Sync>;

/// Creates named stage instances by kind and decode backends by URI
/// scheme
pub struct StageRegistry {
    stages: HashMap<StageKind, StageFactory>,
    decoders: HashMap<String, DecoderFactory>,
}

impl StageRegistry {
    /// Empty registry with no factories
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
            decoders: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in stage set and the synthetic
    /// `test://` decode backend
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(StageKind::Convert, |name, params| {
            Ok(Box::new(ConvertStage::new(name, params)))
        });
        registry.register(StageKind::Dewarp, |name, params| {
            Ok(Box::new(DewarpStage::new(name, params)?))
        });
        registry.register(StageKind::Mux, |name, params| {
            Ok(Box::new(MuxStage::new(name, params)))
        });
        registry.register(StageKind::Inference, |name, params| {
            Ok(Box::new(InferStage::new(name, params)))
        });
        registry.register(StageKind::Tracking, |name, params| {
            Ok(Box::new(TrackerStage::new(name, params)))
        });
        registry.register(StageKind::Tiling, |name, params| {
            Ok(Box::new(TilerStage::new(name, params)))
        });
        registry.register(StageKind::Overlay, |name, params| {
            Ok(Box::new(OverlayStage::new(name, params)))
        });
        registry.register(StageKind::Encode, |name, params| {
            Ok(Box::new(EncodeStage::new(name, params)))
        });
        registry.register(StageKind::FileSink, |name, params| {
            Ok(Box::new(FileSinkStage::new(name, params)))
        });
        registry.register(StageKind::DiscardSink, |name, params| {
            Ok(Box::new(DiscardSinkStage::new(name, params)))
        });
        registry.register(StageKind::DisplaySink, |name, params| {
            Ok(Box::new(DisplaySinkStage::new(name, params)))
        });

        registry.register_decoder("test", |uri, source_id| {
            Ok(Box::new(TestPatternDecoder::from_uri(uri, source_id)?))
        });

        registry
    }

    /// Register (or replace) the factory for a stage kind
    pub fn register<F>(&mut self, kind: StageKind, factory: F)
    where
        F: Fn(&str, &StageParams) -> Result<Box<dyn Stage>, GraphError> + Send + Sync + 'static,
    {
        self.stages.insert(kind, Box::new(factory));
    }

    /// Register (or replace) the decode-backend provider for a URI scheme
    pub fn register_decoder<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str, u32) -> Result<Box<dyn DecodeBackend>, GraphError> + Send + Sync + 'static,
    {
        self.decoders.insert(scheme.to_string(), Box::new(factory));
    }

    /// Create a named stage instance
    pub fn create(
        &self,
        kind: StageKind,
        name: &str,
        params: &StageParams,
    ) -> Result<Box<dyn Stage>, GraphError> {
        let factory = self.stages.get(&kind).ok_or_else(|| {
            GraphError::creation(kind.as_str(), name, "no factory registered for stage kind")
        })?;
        factory(name, params)
    }

    /// Create a decode backend for a source URI
    pub fn create_decoder(
        &self,
        uri: &str,
        source_id: u32,
    ) -> Result<Box<dyn DecodeBackend>, GraphError> {
        let scheme = uri.split_once("://").map(|(s, _)| s).unwrap_or("");
        let factory = self.decoders.get(scheme).ok_or_else(|| {
            GraphError::creation(
                "decoder",
                uri,
                format!("no decode backend registered for scheme '{scheme}'"),
            )
        })?;
        factory(uri, source_id)
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
