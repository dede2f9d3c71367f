//! Primary inference stage
//!
//! Attaches detector output to every frame in a batch. The network
//! itself is a capability: callers register a [`Detector`] through the
//! stage factory; the built-in default detects nothing, which keeps the
//! graph runnable without a model.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::pipeline::error::GraphError;
use crate::pipeline::stage::{
    LINK_CHANNEL_CAPACITY, ParamValue, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::{FrameMeta, MediaBuffer, ObjectMeta};

/// Capability contract for the detector network behind the inference
/// stage
pub trait Detector: Send {
    /// Detect objects in one frame of the batch
    fn detect(&mut self, frame: &FrameMeta, data: &[u8]) -> Vec<ObjectMeta>;
}

/// Default detector: no model loaded, no detections
#[derive(Default)]
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn detect(&mut self, _frame: &FrameMeta, _data: &[u8]) -> Vec<ObjectMeta> {
        Vec::new()
    }
}

pub struct InferStage {
    name: String,
    config_file_path: Option<String>,
    detector: Box<dyn Detector>,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    output_tx: Option<mpsc::Sender<MediaBuffer>>,
}

impl InferStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        Self::with_detector(name, params, Box::new(NoopDetector))
    }

    /// Inference stage backed by a caller-supplied detector
    pub fn with_detector(name: &str, params: &StageParams, detector: Box<dyn Detector>) -> Self {
        Self {
            name: name.to_string(),
            config_file_path: params.get_str("config-file-path").map(str::to_string),
            detector,
            input_rx: None,
            output_tx: None,
        }
    }
}

#[async_trait]
impl Stage for InferStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Inference
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
            "config-file-path" => self
                .config_file_path
                .as_ref()
                .map(|p| ParamValue::Str(p.clone())),
            _ => None,
        }
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let (Some(mut input), Some(output)) = (self.input_rx.take(), self.output_tx.take()) else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };

        info!(
            "{}: started (model config: {})",
            self.name,
            self.config_file_path.as_deref().unwrap_or("<none>")
        );
        let mut objects_found: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(mut buffer) => {
                        for frame in &mut buffer.frames {
                            let detections = self.detector.detect(frame, &buffer.data);
                            objects_found += detections.len() as u64;
                            frame.objects.extend(detections);
                        }
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

        info!("{}: finished ({objects_found} objects detected)", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{BBox, CLASS_ID_PERSON, StreamFormat, Timestamp};
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    /// Emits one fixed person detection per frame
    struct OnePersonDetector;

    impl Detector for OnePersonDetector {
        fn detect(&mut self, _frame: &FrameMeta, _data: &[u8]) -> Vec<ObjectMeta> {
            vec![ObjectMeta::detection(
                "person",
                CLASS_ID_PERSON,
                BBox::new(1.0, 2.0, 3.0, 4.0),
                0.8,
            )]
        }
    }

    #[tokio::test]
    async fn test_detections_attach_per_frame() {
        let mut stage = InferStage::with_detector(
            "primary-infer",
            &StageParams::new(),
            Box::new(OnePersonDetector),
        );

        let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        stage.set_input(rx).unwrap();
        let mut out = stage.take_output().unwrap();

        let (bus_tx, _bus_rx) = mpsc::channel(8);
        let ctx = StageContext::new(bus_tx, CancellationToken::new());
        let worker = tokio::spawn(async move { stage.run(ctx).await });

        let buffer = MediaBuffer {
            data: Bytes::from_static(b"batch"),
            pts: Timestamp::from_micros(0),
            format: StreamFormat::device_video("RGBA"),
            frames: vec![
                FrameMeta::new(0, 0, Timestamp::from_micros(0)),
                FrameMeta::new(1, 0, Timestamp::from_micros(0)),
            ],
        };
        tx.send(buffer).await.unwrap();
        drop(tx);

        let inferred = out.recv().await.unwrap();
        assert_eq!(inferred.frames[0].objects.len(), 1);
        assert_eq!(inferred.frames[1].objects.len(), 1);
        assert_eq!(inferred.frames[0].objects[0].label, "person");
        worker.await.unwrap().unwrap();
    }
}
