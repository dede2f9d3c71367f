//! Multi-object tracking stage
//!
//! Fills the tracker-side fields of every object: a stable object id,
//! the refined rectangle and the tracker confidence. The real association
//! logic is a capability behind [`TrackerBackend`]; the built-in backend
//! hands out monotonically increasing ids and mirrors the detector
//! rectangle, enough to exercise the tracked data path.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::pipeline::bus::BusMessage;
use crate::pipeline::error::GraphError;
use crate::pipeline::stage::{
    LINK_CHANNEL_CAPACITY, ParamValue, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::{FrameMeta, MediaBuffer};

/// Capability contract for the tracker library behind the tracking stage
pub trait TrackerBackend: Send {
    /// Associate and refine the objects of one batched buffer
    fn track(&mut self, frames: &mut [FrameMeta]);
}

/// Minimal tracker assigning monotonic ids to detections
#[derive(Default)]
pub struct MonotonicTracker {
    next_id: u64,
}

impl TrackerBackend for MonotonicTracker {
    fn track(&mut self, frames: &mut [FrameMeta]) {
        for frame in frames {
            for object in &mut frame.objects {
                object.object_id = self.next_id;
                self.next_id += 1;
                object.tracker_bbox = object.detector_bbox;
                object.tracker_confidence = object.confidence;
            }
        }
    }
}

pub struct TrackerStage {
    name: String,
    params: StageParams,
    backend: Box<dyn TrackerBackend>,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    output_tx: Option<mpsc::Sender<MediaBuffer>>,
}

impl TrackerStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        Self::with_backend(name, params, Box::new(MonotonicTracker::default()))
    }

    pub fn with_backend(
        name: &str,
        params: &StageParams,
        backend: Box<dyn TrackerBackend>,
    ) -> Self {
        Self {
            name: name.to_string(),
            params: params.clone(),
            backend,
            input_rx: None,
            output_tx: None,
        }
    }
}

#[async_trait]
impl Stage for TrackerStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Tracking
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
        self.params.get(key).cloned()
    }

    fn set_property(&mut self, key: &str, value: ParamValue) -> Result<(), GraphError> {
        self.params = std::mem::take(&mut self.params).set(key, value);
        Ok(())
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let (Some(mut input), Some(output)) = (self.input_rx.take(), self.output_tx.take()) else {
            // The tracked file-sink topology creates and configures this
            // stage without putting it on the linear chain.
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };

        if let Some(ParamValue::Str(lib)) = self.params.get("ll-lib-file")
            && !std::path::Path::new(lib).exists()
        {
            let _ = ctx
                .bus
                .send(BusMessage::Warning {
                    source: self.name.clone(),
                    message: format!("tracker library {lib} not found, using built-in association"),
                })
                .await;
        }

        info!("{}: started", self.name);
        let mut tracked: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(mut buffer) => {
                        self.backend.track(&mut buffer.frames);
                        tracked += 1;
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

        info!("{}: finished ({tracked} buffers)", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{BBox, CLASS_ID_PERSON, ObjectMeta};

    #[test]
    fn test_monotonic_ids_and_mirrored_boxes() {
        let mut tracker = MonotonicTracker::default();
        let mut frames = vec![
            {
                let mut meta = FrameMeta::new(0, 0, Default::default());
                meta.objects = vec![
                    ObjectMeta::detection("person", CLASS_ID_PERSON, BBox::new(1.0, 2.0, 3.0, 4.0), 0.9),
                    ObjectMeta::detection("person", CLASS_ID_PERSON, BBox::new(5.0, 6.0, 7.0, 8.0), 0.8),
                ];
                meta
            },
            {
                let mut meta = FrameMeta::new(1, 0, Default::default());
                meta.objects = vec![ObjectMeta::detection(
                    "person",
                    CLASS_ID_PERSON,
                    BBox::new(9.0, 9.0, 9.0, 9.0),
                    0.7,
                )];
                meta
            },
        ];

        tracker.track(&mut frames);
        let ids: Vec<u64> = frames
            .iter()
            .flat_map(|f| f.objects.iter().map(|o| o.object_id))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(frames[0].objects[0].tracker_bbox, BBox::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(frames[0].objects[0].tracker_confidence, 0.9);

        // Ids keep growing across buffers.
        tracker.track(&mut frames);
        assert_eq!(frames[0].objects[0].object_id, 3);
    }
}
