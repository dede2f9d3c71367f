//! Render sinks: file, discard and display
//!
//! The sinks terminate the chain. Each accepts the metadata probe on its
//! input side and invokes it synchronously for every buffer before
//! consuming it; each posts the aggregate end-of-stream signal once its
//! input drains. Actual presentation is a capability: the display sink
//! is headless here and only accounts for the frames a real window
//! system would show.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::fs::File;
use std::io::{BufWriter, Write};
use tokio::sync::mpsc;

use crate::pipeline::bus::BusMessage;
use crate::pipeline::error::GraphError;
use crate::pipeline::probe::BufferProbe;
use crate::pipeline::stage::{
    ParamValue, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::MediaBuffer;

/// Default output location for the file sink
pub const DEFAULT_FILE_SINK_LOCATION: &str = "out.h264";

async fn post_eos(ctx: &StageContext) {
    let _ = ctx.bus.send(BusMessage::Eos).await;
}

/// Writes the encoded stream to a file
pub struct FileSinkStage {
    name: String,
    location: String,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    probe: Option<Box<dyn BufferProbe>>,
}

impl FileSinkStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        Self {
            name: name.to_string(),
            location: params
                .get_str("location")
                .unwrap_or(DEFAULT_FILE_SINK_LOCATION)
                .to_string(),
            input_rx: None,
            probe: None,
        }
    }
}

#[async_trait]
impl Stage for FileSinkStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::FileSink
    }

    fn set_input(&mut self, rx: mpsc::Receiver<MediaBuffer>) -> Result<(), GraphError> {
        if self.input_rx.is_some() {
            return Err(GraphError::link("upstream", &self.name, "input already connected"));
        }
        self.input_rx = Some(rx);
        Ok(())
    }

    fn take_output(&mut self) -> Result<mpsc::Receiver<MediaBuffer>, GraphError> {
        Err(GraphError::link(&self.name, "downstream", "render sinks have no output"))
    }

    fn property(&self, key: &str) -> Option<ParamValue> {
        match key {
            "location" => Some(ParamValue::Str(self.location.clone())),
            _ => None,
        }
    }

    fn set_property(&mut self, key: &str, value: ParamValue) -> Result<(), GraphError> {
        match (key, value) {
            ("location", ParamValue::Str(location)) => {
                self.location = location;
                Ok(())
            }
            _ => Err(GraphError::creation(
                StageKind::FileSink.as_str(),
                &self.name,
                format!("no such property '{key}'"),
            )),
        }
    }

    fn install_probe(&mut self, probe: Box<dyn BufferProbe>) -> Result<(), GraphError> {
        if self.probe.is_some() {
            return Err(GraphError::link("probe", &self.name, "probe already installed"));
        }
        self.probe = Some(probe);
        Ok(())
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let Some(mut input) = self.input_rx.take() else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };
        let mut probe = self.probe.take();

        let file = File::create(&self.location)
            .with_context(|| format!("failed to open sink location {}", self.location))?;
        let mut writer = BufWriter::new(file);

        info!("{}: started (writing {})", self.name, self.location);
        let mut bytes_written: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(buffer) => {
                        if let Some(probe) = probe.as_mut() {
                            probe.observe(&buffer);
                        }
                        writer
                            .write_all(&buffer.data)
                            .with_context(|| format!("write to {} failed", self.location))?;
                        bytes_written += buffer.data.len() as u64;
                    }
                    None => {
                        writer.flush().ok();
                        info!("{}: finished ({bytes_written} bytes)", self.name);
                        post_eos(&ctx).await;
                        return Ok(());
                    }
                },
                _ = ctx.cancel.cancelled() => {
                    writer.flush().ok();
                    debug!("{}: cancelled", self.name);
                    return Ok(());
                }
            }
        }
    }
}

/// Swallows the stream; used for throughput measurement runs
pub struct DiscardSinkStage {
    name: String,
    sync: bool,
    async_handling: bool,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    probe: Option<Box<dyn BufferProbe>>,
}

impl DiscardSinkStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        Self {
            name: name.to_string(),
            sync: params.get_bool("sync").unwrap_or(false),
            async_handling: params.get_bool("async").unwrap_or(false),
            input_rx: None,
            probe: None,
        }
    }
}

#[async_trait]
impl Stage for DiscardSinkStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::DiscardSink
    }

    fn set_input(&mut self, rx: mpsc::Receiver<MediaBuffer>) -> Result<(), GraphError> {
        if self.input_rx.is_some() {
            return Err(GraphError::link("upstream", &self.name, "input already connected"));
        }
        self.input_rx = Some(rx);
        Ok(())
    }

    fn take_output(&mut self) -> Result<mpsc::Receiver<MediaBuffer>, GraphError> {
        Err(GraphError::link(&self.name, "downstream", "render sinks have no output"))
    }

    fn property(&self, key: &str) -> Option<ParamValue> {
        match key {
            "sync" => Some(ParamValue::Bool(self.sync)),
            "async" => Some(ParamValue::Bool(self.async_handling)),
            _ => None,
        }
    }

    fn install_probe(&mut self, probe: Box<dyn BufferProbe>) -> Result<(), GraphError> {
        if self.probe.is_some() {
            return Err(GraphError::link("probe", &self.name, "probe already installed"));
        }
        self.probe = Some(probe);
        Ok(())
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let Some(mut input) = self.input_rx.take() else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };
        let mut probe = self.probe.take();

        info!("{}: started", self.name);
        let mut discarded: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(buffer) => {
                        if let Some(probe) = probe.as_mut() {
                            probe.observe(&buffer);
                        }
                        discarded += 1;
                    }
                    None => {
                        info!("{}: finished ({discarded} buffers discarded)", self.name);
                        post_eos(&ctx).await;
                        return Ok(());
                    }
                },
                _ = ctx.cancel.cancelled() => {
                    debug!("{}: cancelled", self.name);
                    return Ok(());
                }
            }
        }
    }
}

/// Capability contract for the window system behind the display sink
pub trait RenderBackend: Send {
    /// Present one batched buffer
    fn present(&mut self, buffer: &MediaBuffer);
}

/// Headless default backend; a real window system plugs in through the
/// stage factory
#[derive(Default)]
struct HeadlessRenderer;

impl RenderBackend for HeadlessRenderer {
    fn present(&mut self, _buffer: &MediaBuffer) {}
}

/// Presents the stream on screen
pub struct DisplaySinkStage {
    name: String,
    /// Route frames through a presentation transform before display,
    /// needed on targets whose renderer cannot consume device memory
    /// directly
    presentation_transform: bool,
    backend: Box<dyn RenderBackend>,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    probe: Option<Box<dyn BufferProbe>>,
}

impl DisplaySinkStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        Self::with_backend(name, params, Box::new(HeadlessRenderer))
    }

    pub fn with_backend(
        name: &str,
        params: &StageParams,
        backend: Box<dyn RenderBackend>,
    ) -> Self {
        Self {
            name: name.to_string(),
            presentation_transform: params
                .get_bool("use-presentation-transform")
                .unwrap_or(false),
            backend,
            input_rx: None,
            probe: None,
        }
    }
}

#[async_trait]
impl Stage for DisplaySinkStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::DisplaySink
    }

    fn set_input(&mut self, rx: mpsc::Receiver<MediaBuffer>) -> Result<(), GraphError> {
        if self.input_rx.is_some() {
            return Err(GraphError::link("upstream", &self.name, "input already connected"));
        }
        self.input_rx = Some(rx);
        Ok(())
    }

    fn take_output(&mut self) -> Result<mpsc::Receiver<MediaBuffer>, GraphError> {
        Err(GraphError::link(&self.name, "downstream", "render sinks have no output"))
    }

    fn property(&self, key: &str) -> Option<ParamValue> {
        match key {
            "use-presentation-transform" => Some(ParamValue::Bool(self.presentation_transform)),
            _ => None,
        }
    }

    fn install_probe(&mut self, probe: Box<dyn BufferProbe>) -> Result<(), GraphError> {
        if self.probe.is_some() {
            return Err(GraphError::link("probe", &self.name, "probe already installed"));
        }
        self.probe = Some(probe);
        Ok(())
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let Some(mut input) = self.input_rx.take() else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };
        let mut probe = self.probe.take();

        info!(
            "{}: started{}",
            self.name,
            if self.presentation_transform {
                " (with presentation transform)"
            } else {
                ""
            }
        );
        let mut presented: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(buffer) => {
                        if let Some(probe) = probe.as_mut() {
                            probe.observe(&buffer);
                        }
                        self.backend.present(&buffer);
                        presented += 1;
                    }
                    None => {
                        info!("{}: finished ({presented} buffers presented)", self.name);
                        post_eos(&ctx).await;
                        return Ok(());
                    }
                },
                _ = ctx.cancel.cancelled() => {
                    debug!("{}: cancelled", self.name);
                    return Ok(());
                }
            }
        }
    }
}
