//! Geometric dewarp transform stage
//!
//! The projection math itself is vendor territory; what matters to the
//! graph is that a dewarp stage is configured per source with a config
//! file and a numeric source id, may legitimately emit more than one
//! output surface per input frame, and exposes that surface count as a
//! readable property the merge stage is sized from.

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info};
use std::path::Path;
use tokio::sync::mpsc;

use crate::pipeline::error::GraphError;
use crate::pipeline::stage::{
    LINK_CHANNEL_CAPACITY, ParamValue, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::MediaBuffer;

/// Upper bound on dewarped surfaces per input frame
pub const MAX_SURFACES_PER_FRAME: u64 = 4;

pub struct DewarpStage {
    name: String,
    config_file: String,
    source_id: u32,
    surfaces_per_frame: u64,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    output_tx: Option<mpsc::Sender<MediaBuffer>>,
}

impl DewarpStage {
    /// Create the stage and parse its dewarp config.
    ///
    /// A missing or malformed config file is fatal to the stage's setup.
    pub fn new(name: &str, params: &StageParams) -> Result<Self, GraphError> {
        let config_file = params
            .get_str("config-file")
            .ok_or_else(|| {
                GraphError::creation("dewarp", name, "missing required 'config-file' parameter")
            })?
            .to_string();
        let source_id = params.get_uint("source-id").unwrap_or(0) as u32;
        let surfaces_per_frame = parse_surface_count(Path::new(&config_file))?;

        Ok(Self {
            name: name.to_string(),
            config_file,
            source_id,
            surfaces_per_frame,
            input_rx: None,
            output_tx: None,
        })
    }
}

/// Read the number of output surfaces from a dewarp config file.
///
/// An explicit `num-batch-buffers` under `[property]` wins; otherwise
/// every `[surface<n>]` section contributes one surface. Projection
/// parameters inside the sections are opaque here and skipped.
fn parse_surface_count(path: &Path) -> Result<u64, GraphError> {
    let display = path.display().to_string();
    let contents = std::fs::read_to_string(path)
        .map_err(|err| GraphError::config(display.as_str(), format!("failed to load config file: {err}")))?;

    let mut section = String::new();
    let mut surface_sections: u64 = 0;
    let mut explicit: Option<u64> = None;

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = header.trim().to_ascii_lowercase();
            if section.starts_with("surface") {
                surface_sections += 1;
            }
            continue;
        }
        if section == "property"
            && let Some((key, value)) = line.split_once('=')
            && key.trim() == "num-batch-buffers"
        {
            let count = value.trim().parse::<u64>().map_err(|_| {
                GraphError::config(display.as_str(), "num-batch-buffers must be an integer")
            })?;
            explicit = Some(count);
        }
    }

    let surfaces = explicit.unwrap_or(surface_sections).max(1);
    if surfaces > MAX_SURFACES_PER_FRAME {
        return Err(GraphError::config(
            display.as_str(),
            format!("at most {MAX_SURFACES_PER_FRAME} surfaces per frame are supported"),
        ));
    }
    Ok(surfaces)
}

#[async_trait]
impl Stage for DewarpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Dewarp
    }

    fn set_input(&mut self, rx: mpsc::Receiver<MediaBuffer>) -> Result<(), GraphError> {
        if self.input_rx.is_some() {
            return Err(GraphError::link("upstream", &self.name, "input already connected"));
        }
        self.input_rx = Some(rx);
        Ok(())
    }

    fn take_output(&mut self) -> Result<mpsc::Receiver<MediaBuffer>, GraphError> {
        if self.output_tx.is_some() {
            return Err(GraphError::link(&self.name, "downstream", "output already taken"));
        }
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        self.output_tx = Some(tx);
        Ok(rx)
    }

    fn property(&self, key: &str) -> Option<ParamValue> {
        match key {
            "num-batch-buffers" => Some(ParamValue::UInt(self.surfaces_per_frame)),
            "source-id" => Some(ParamValue::UInt(self.source_id as u64)),
            "config-file" => Some(ParamValue::Str(self.config_file.clone())),
            _ => None,
        }
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let (Some(mut input), Some(output)) = (self.input_rx.take(), self.output_tx.take()) else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };

        info!(
            "{}: started (source {}, {} surfaces/frame, config {})",
            self.name, self.source_id, self.surfaces_per_frame, self.config_file
        );
        let mut frames_in: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(buffer) => {
                        frames_in += 1;
                        let dewarped = self.project(buffer);
                        if output.send(dewarped).await.is_err() {
                            debug!("{}: output closed", self.name);
                            break;
                        }
                    }
                    None => break,
                },
                _ = ctx.cancel.cancelled() => break,
            }
        }

        info!("{}: finished ({frames_in} frames in)", self.name);
        Ok(())
    }
}

impl DewarpStage {
    /// Expand one input frame into the configured output surfaces. The
    /// frame metadata is stamped with this stage's source id.
    fn project(&self, buffer: MediaBuffer) -> MediaBuffer {
        let surfaces = self.surfaces_per_frame as usize;
        let mut data = BytesMut::with_capacity(buffer.data.len() * surfaces);
        let mut frames = Vec::with_capacity(buffer.frames.len() * surfaces);
        for meta in &buffer.frames {
            for surface_index in 0..surfaces {
                let mut surface = meta.clone();
                surface.source_id = self.source_id;
                surface.surface_index = surface_index as u32;
                frames.push(surface);
                data.extend_from_slice(&buffer.data);
            }
        }
        MediaBuffer {
            data: data.freeze(),
            pts: buffer.pts,
            format: buffer.format,
            frames,
        }
    }
}
