//! Video encode stage
//!
//! Marks the stream as encoded for the file-writing sink. The codec is a
//! vendor concern; the contract here is the format hand-off: whatever
//! comes in leaves as an H.264 elementary stream descriptor.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::pipeline::error::GraphError;
use crate::pipeline::stage::{
    LINK_CHANNEL_CAPACITY, ParamValue, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::{MediaBuffer, MemoryDomain, StreamFormat};

pub struct EncodeStage {
    name: String,
    codec: String,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    output_tx: Option<mpsc::Sender<MediaBuffer>>,
}

impl EncodeStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        Self {
            name: name.to_string(),
            codec: params.get_str("codec").unwrap_or("H264").to_string(),
            input_rx: None,
            output_tx: None,
        }
    }
}

#[async_trait]
impl Stage for EncodeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Encode
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
            "codec" => Some(ParamValue::Str(self.codec.clone())),
            _ => None,
        }
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let (Some(mut input), Some(output)) = (self.input_rx.take(), self.output_tx.take()) else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };

        info!("{}: started ({})", self.name, self.codec);
        let mut bytes_out: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(mut buffer) => {
                        buffer.format = StreamFormat {
                            kind: buffer.format.kind,
                            memory: MemoryDomain::Device,
                            format: self.codec.clone(),
                        };
                        bytes_out += buffer.data.len() as u64;
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

        info!("{}: finished ({bytes_out} bytes out)", self.name);
        Ok(())
    }
}
