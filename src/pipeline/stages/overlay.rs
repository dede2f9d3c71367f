//! On-screen-display overlay stage
//!
//! Draws detection and tracking annotations onto frames. The drawing is
//! opaque; the stage passes buffers through and keeps a count of the
//! objects it would have rendered.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::pipeline::error::GraphError;
use crate::pipeline::stage::{
    LINK_CHANNEL_CAPACITY, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::MediaBuffer;

pub struct OverlayStage {
    name: String,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    output_tx: Option<mpsc::Sender<MediaBuffer>>,
}

impl OverlayStage {
    pub fn new(name: &str, _params: &StageParams) -> Self {
        Self {
            name: name.to_string(),
            input_rx: None,
            output_tx: None,
        }
    }
}

#[async_trait]
impl Stage for OverlayStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Overlay
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

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let (Some(mut input), Some(output)) = (self.input_rx.take(), self.output_tx.take()) else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };

        info!("{}: started", self.name);
        let mut objects_drawn: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(buffer) => {
                        objects_drawn += buffer
                            .frames
                            .iter()
                            .map(|f| f.objects.len() as u64)
                            .sum::<u64>();
                        if output.send(buffer).await.is_err() {
                            debug!("{}: output closed", self.name);
                            break;
                        }
                    }
                    None => break,
                },
                _ = ctx.cancel.cancelled() => break,
            }
        }

        info!("{}: finished ({objects_drawn} objects drawn)", self.name);
        Ok(())
    }
}
