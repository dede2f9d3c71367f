//! Format-normalization stage
//!
//! Stands in for the converter + caps-filter pair in front of the
//! geometric transform and again before the encoder: it rewrites the
//! stream format descriptor to the configured target so downstream
//! stages see a uniform layout.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::pipeline::error::GraphError;
use crate::pipeline::stage::{
    LINK_CHANNEL_CAPACITY, ParamValue, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::{MediaBuffer, MemoryDomain, StreamFormat};

pub struct ConvertStage {
    name: String,
    target_format: String,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    output_tx: Option<mpsc::Sender<MediaBuffer>>,
}

impl ConvertStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        Self {
            name: name.to_string(),
            target_format: params.get_str("format").unwrap_or("RGBA").to_string(),
            input_rx: None,
            output_tx: None,
        }
    }
}

#[async_trait]
impl Stage for ConvertStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Convert
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
            "format" => Some(ParamValue::Str(self.target_format.clone())),
            _ => None,
        }
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let (Some(mut input), Some(output)) = (self.input_rx.take(), self.output_tx.take()) else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };

        info!("{}: started (target format {})", self.name, self.target_format);
        let mut converted: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(mut buffer) => {
                        buffer.format = StreamFormat {
                            kind: buffer.format.kind,
                            memory: MemoryDomain::Device,
                            format: self.target_format.clone(),
                        };
                        converted += 1;
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

        info!("{}: finished ({converted} buffers)", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{FrameMeta, Timestamp};
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_convert_rewrites_format() {
        let params = StageParams::new().set_str("format", "RGBA");
        let mut stage = ConvertStage::new("videoconvert-0", &params);

        let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        stage.set_input(rx).unwrap();
        let mut out = stage.take_output().unwrap();

        let (bus_tx, _bus_rx) = mpsc::channel(8);
        let ctx = StageContext::new(bus_tx, CancellationToken::new());
        let worker = tokio::spawn(async move { stage.run(ctx).await });

        let buffer = MediaBuffer::single(
            Bytes::from_static(b"nv12"),
            StreamFormat::device_video("NV12"),
            FrameMeta::new(0, 0, Timestamp::from_micros(0)),
        );
        tx.send(buffer).await.unwrap();
        drop(tx);

        let converted = out.recv().await.unwrap();
        assert_eq!(converted.format.format, "RGBA");
        worker.await.unwrap().unwrap();
    }

    #[test]
    fn test_double_link_fails() {
        let mut stage = ConvertStage::new("videoconvert-0", &StageParams::new());
        let (_tx, rx) = mpsc::channel(1);
        stage.set_input(rx).unwrap();
        let (_tx2, rx2) = mpsc::channel(1);
        assert!(stage.set_input(rx2).is_err());

        stage.take_output().unwrap();
        assert!(stage.take_output().is_err());
    }
}
