//! Batch-forming stream merge stage
//!
//! Accepts one request pad per source, interleaves their buffers, and
//! pushes a combined batch downstream whenever the configured number of
//! frames has accumulated or the batch-formation timeout expires. Each
//! pad's upstream closing is reported on the bus as a per-stream EOS;
//! the merge itself only ends once every pad has drained.

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::pipeline::bus::BusMessage;
use crate::pipeline::error::GraphError;
use crate::pipeline::stage::{
    LINK_CHANNEL_CAPACITY, ParamValue, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::MediaBuffer;

/// Default batch formation timeout, matching a 30 fps source
pub const DEFAULT_BATCH_TIMEOUT_USEC: i64 = 33_000;

/// Accumulates buffers until a full batch can be pushed.
///
/// Counts frames rather than buffers: an upstream transform may pack
/// several surfaces into one buffer, and the batch target is expressed in
/// surfaces.
struct BatchAssembler {
    target_frames: usize,
    pending: Vec<MediaBuffer>,
    pending_frames: usize,
}

impl BatchAssembler {
    fn new(target_frames: usize) -> Self {
        Self {
            target_frames: target_frames.max(1),
            pending: Vec::new(),
            pending_frames: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Add one buffer; returns the combined batch when it is complete
    fn push(&mut self, buffer: MediaBuffer) -> Option<MediaBuffer> {
        self.pending_frames += buffer.frame_count();
        self.pending.push(buffer);
        if self.pending_frames >= self.target_frames {
            self.flush()
        } else {
            None
        }
    }

    /// Combine whatever is pending into one batch buffer
    fn flush(&mut self) -> Option<MediaBuffer> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending_frames = 0;
        let buffers = std::mem::take(&mut self.pending);

        let pts = buffers.iter().map(|b| b.pts).min().unwrap_or_default();
        let format = buffers[0].format.clone();
        let mut data = BytesMut::new();
        let mut frames = Vec::new();
        for buffer in buffers {
            data.extend_from_slice(&buffer.data);
            frames.extend(buffer.frames);
        }
        Some(MediaBuffer {
            data: data.freeze(),
            pts,
            format,
            frames,
        })
    }
}

/// The shared merge stage; see the module docs.
pub struct MuxStage {
    name: String,
    width: i64,
    height: i64,
    batch_timeout: Duration,
    batch_size: u64,
    surfaces_per_frame: u64,
    inputs: Vec<(String, mpsc::Receiver<MediaBuffer>)>,
    output_tx: Option<mpsc::Sender<MediaBuffer>>,
}

impl MuxStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        let timeout_usec = params
            .get_int("batched-push-timeout")
            .unwrap_or(DEFAULT_BATCH_TIMEOUT_USEC);
        Self {
            name: name.to_string(),
            width: params.get_int("width").unwrap_or(0),
            height: params.get_int("height").unwrap_or(0),
            batch_timeout: Duration::from_micros(timeout_usec.max(0) as u64),
            batch_size: params.get_uint("batch-size").unwrap_or(1),
            surfaces_per_frame: params.get_uint("num-surfaces-per-frame").unwrap_or(1),
            inputs: Vec::new(),
            output_tx: None,
        }
    }
}

#[async_trait]
impl Stage for MuxStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Mux
    }

    fn set_input(&mut self, _rx: mpsc::Receiver<MediaBuffer>) -> Result<(), GraphError> {
        Err(GraphError::link(
            "upstream",
            &self.name,
            "merge stage inputs must be requested by pad name",
        ))
    }

    fn request_input(
        &mut self,
        pad_name: &str,
        rx: mpsc::Receiver<MediaBuffer>,
    ) -> Result<(), GraphError> {
        if self.inputs.iter().any(|(name, _)| name == pad_name) {
            return Err(GraphError::link(
                pad_name,
                &self.name,
                "request pad already connected",
            ));
        }
        self.inputs.push((pad_name.to_string(), rx));
        Ok(())
    }

    fn take_output(&mut self) -> Result<mpsc::Receiver<MediaBuffer>, GraphError> {
        if self.output_tx.is_some() {
            return Err(GraphError::link(
                &self.name,
                "downstream",
                "output already taken",
            ));
        }
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        self.output_tx = Some(tx);
        Ok(rx)
    }

    fn property(&self, key: &str) -> Option<ParamValue> {
        match key {
            "width" => Some(ParamValue::Int(self.width)),
            "height" => Some(ParamValue::Int(self.height)),
            "batched-push-timeout" => {
                Some(ParamValue::Int(self.batch_timeout.as_micros() as i64))
            }
            "batch-size" => Some(ParamValue::UInt(self.batch_size)),
            "num-surfaces-per-frame" => Some(ParamValue::UInt(self.surfaces_per_frame)),
            _ => None,
        }
    }

    fn set_property(&mut self, key: &str, value: ParamValue) -> Result<(), GraphError> {
        let unsupported = || {
            GraphError::creation(
                StageKind::Mux.as_str(),
                &self.name,
                format!("unsupported value for property '{key}'"),
            )
        };
        match (key, value) {
            ("batch-size", ParamValue::UInt(v)) => self.batch_size = v,
            ("num-surfaces-per-frame", ParamValue::UInt(v)) => self.surfaces_per_frame = v,
            ("width", ParamValue::Int(v)) => self.width = v,
            ("height", ParamValue::Int(v)) => self.height = v,
            _ => return Err(unsupported()),
        }
        Ok(())
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let inputs = std::mem::take(&mut self.inputs);
        let (Some(output), false) = (self.output_tx.take(), inputs.is_empty()) else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };

        info!(
            "{}: started ({} pads, batch size {}, {} surfaces/frame, timeout {:?})",
            self.name,
            inputs.len(),
            self.batch_size,
            self.surfaces_per_frame,
            self.batch_timeout
        );

        // One forwarder task per request pad; the pad index doubles as
        // the stream id in per-stream EOS reporting.
        let (ingest_tx, mut ingest_rx) = mpsc::channel::<MediaBuffer>(LINK_CHANNEL_CAPACITY);
        let mut forwarders = Vec::with_capacity(inputs.len());
        for (stream_id, (pad_name, mut rx)) in inputs.into_iter().enumerate() {
            let ingest = ingest_tx.clone();
            let bus = ctx.bus.clone();
            forwarders.push(tokio::spawn(async move {
                while let Some(buffer) = rx.recv().await {
                    if ingest.send(buffer).await.is_err() {
                        return;
                    }
                }
                debug!("mux pad {pad_name} drained");
                let _ = bus
                    .send(BusMessage::StreamEos {
                        stream_id: stream_id as u32,
                    })
                    .await;
            }));
        }
        drop(ingest_tx);

        let mut assembler = BatchAssembler::new(self.batch_size as usize);
        let mut deadline: Option<Instant> = None;
        let mut batches_pushed: u64 = 0;
        let far_future = || Instant::now() + Duration::from_secs(3600);

        'merge: loop {
            tokio::select! {
                buffer = ingest_rx.recv() => match buffer {
                    Some(buffer) => {
                        if assembler.is_empty() {
                            deadline = Some(Instant::now() + self.batch_timeout);
                        }
                        if let Some(batch) = assembler.push(buffer) {
                            deadline = None;
                            batches_pushed += 1;
                            if output.send(batch).await.is_err() {
                                debug!("{}: output closed", self.name);
                                break 'merge;
                            }
                        }
                    }
                    None => {
                        if let Some(batch) = assembler.flush() {
                            batches_pushed += 1;
                            let _ = output.send(batch).await;
                        }
                        break 'merge;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)),
                        if deadline.is_some() => {
                    deadline = None;
                    if let Some(batch) = assembler.flush() {
                        batches_pushed += 1;
                        if output.send(batch).await.is_err() {
                            break 'merge;
                        }
                    }
                }
                _ = ctx.cancel.cancelled() => break 'merge,
            }
        }

        for forwarder in forwarders {
            forwarder.abort();
        }
        info!("{}: finished ({batches_pushed} batches pushed)", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{FrameMeta, StreamFormat, Timestamp};
    use bytes::Bytes;

    fn frame_buffer(source_id: u32, frame_number: u64, surfaces: usize) -> MediaBuffer {
        let frames = (0..surfaces)
            .map(|i| {
                let mut meta = FrameMeta::new(
                    source_id,
                    frame_number,
                    Timestamp::from_micros(frame_number as i64 * 33_000),
                );
                meta.surface_index = i as u32;
                meta
            })
            .collect();
        MediaBuffer {
            data: Bytes::from_static(b"x"),
            pts: Timestamp::from_micros(frame_number as i64 * 33_000),
            format: StreamFormat::device_video("RGBA"),
            frames,
        }
    }

    #[test]
    fn test_assembler_completes_on_target() {
        let mut assembler = BatchAssembler::new(2);
        assert!(assembler.push(frame_buffer(0, 0, 1)).is_none());
        let batch = assembler.push(frame_buffer(1, 0, 1)).unwrap();
        assert_eq!(batch.frame_count(), 2);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_assembler_counts_surfaces_not_buffers() {
        // A dewarp producing 2 surfaces per frame fills a 4-frame batch
        // with only two buffers.
        let mut assembler = BatchAssembler::new(4);
        assert!(assembler.push(frame_buffer(0, 0, 2)).is_none());
        let batch = assembler.push(frame_buffer(1, 0, 2)).unwrap();
        assert_eq!(batch.frame_count(), 4);
    }

    #[test]
    fn test_assembler_flush_merges_partial() {
        let mut assembler = BatchAssembler::new(8);
        assembler.push(frame_buffer(0, 1, 1));
        assembler.push(frame_buffer(1, 2, 1));
        let batch = assembler.flush().unwrap();
        assert_eq!(batch.frame_count(), 2);
        // Earliest pending pts wins.
        assert_eq!(batch.pts.micros, 33_000);
        assert!(assembler.flush().is_none());
    }

    #[tokio::test]
    async fn test_mux_flushes_short_batch_on_timeout() {
        let params = StageParams::new()
            .set_uint("batch-size", 4)
            .set_int("batched-push-timeout", 10_000);
        let mut mux = MuxStage::new("stream-muxer", &params);

        let (pad_tx, pad_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        mux.request_input("sink_0", pad_rx).unwrap();
        let mut out = mux.take_output().unwrap();

        let (bus_tx, _bus_rx) = mpsc::channel(32);
        let ctx = StageContext::new(bus_tx, tokio_util::sync::CancellationToken::new());
        let worker = tokio::spawn(async move { mux.run(ctx).await });

        pad_tx.send(frame_buffer(0, 0, 1)).await.unwrap();
        // Only one of four frames arrived; the timeout must push it out.
        let batch = out.recv().await.unwrap();
        assert_eq!(batch.frame_count(), 1);

        drop(pad_tx);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mux_posts_per_stream_eos() {
        let params = StageParams::new().set_uint("batch-size", 1);
        let mut mux = MuxStage::new("stream-muxer", &params);

        let (pad_tx, pad_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        mux.request_input("sink_0", pad_rx).unwrap();
        let mut out = mux.take_output().unwrap();

        let (bus_tx, mut bus_rx) = mpsc::channel(32);
        let ctx = StageContext::new(bus_tx, tokio_util::sync::CancellationToken::new());
        let worker = tokio::spawn(async move { mux.run(ctx).await });

        pad_tx.send(frame_buffer(0, 0, 1)).await.unwrap();
        drop(pad_tx);

        assert!(out.recv().await.is_some());
        assert!(out.recv().await.is_none());
        assert_eq!(bus_rx.recv().await, Some(BusMessage::StreamEos { stream_id: 0 }));
        worker.await.unwrap().unwrap();
    }

    #[test]
    fn test_duplicate_request_pad_fails() {
        let mut mux = MuxStage::new("stream-muxer", &StageParams::new());
        let (_tx1, rx1) = mpsc::channel(1);
        let (_tx2, rx2) = mpsc::channel(1);
        mux.request_input("sink_0", rx1).unwrap();
        assert!(matches!(
            mux.request_input("sink_0", rx2),
            Err(GraphError::LinkFailure { .. })
        ));
    }
}
