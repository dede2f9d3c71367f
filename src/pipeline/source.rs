//! Per-source decode subgraph and asynchronous output-port binding
//!
//! A [`SourceBinding`] wraps one opaque decode subgraph behind a
//! graph-facing output port that exists from build time but starts
//! unbound. The decode backend announces its negotiated formats at some
//! later point; the first accepted video announcement binds the port,
//! everything else is ignored. A subgraph that never announces leaves the
//! port structurally linked but silent.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::GraphError;
use super::registry::StageRegistry;
use super::stage::{LINK_CHANNEL_CAPACITY, StageContext};
use super::types::{
    FrameMeta, MediaBuffer, MediaKind, MemoryDomain, StreamFormat, Timestamp,
};
use crate::config::SourceConfig;

/// Handle a decode backend uses to announce negotiated output pads.
///
/// Holds the withheld sender half of the binding's ghost port. The first
/// accepted announcement moves the sender into a [`PortWriter`]; as long
/// as nothing is accepted the port stays reserved and carries no data.
pub struct PadBinder {
    binding_name: String,
    tx: Option<mpsc::Sender<MediaBuffer>>,
    bound: Arc<AtomicBool>,
}

impl PadBinder {
    /// Inspect an announced format and bind the graph-facing port when
    /// it is device-memory video. Returns the writer for the port on the
    /// first acceptance, `None` in every other case.
    pub fn announce(&mut self, format: &StreamFormat) -> Option<PortWriter> {
        if format.kind != MediaKind::Video {
            debug!("{}: ignoring non-video pad ({format})", self.binding_name);
            return None;
        }
        if format.memory != MemoryDomain::Device {
            error!(
                "{}: decode subgraph negotiated {format}; only device-memory video \
                 can enter the graph, pad left unlinked",
                self.binding_name
            );
            return None;
        }
        if self.bound.swap(true, Ordering::SeqCst) {
            debug!(
                "{}: output port already bound, ignoring extra pad ({format})",
                self.binding_name
            );
            return None;
        }
        let tx = self.tx.take()?;
        info!("{}: output port bound ({format})", self.binding_name);
        Some(PortWriter { tx })
    }

    /// Whether an announcement has been accepted
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }
}

/// Writer half of a bound source output port
pub struct PortWriter {
    tx: mpsc::Sender<MediaBuffer>,
}

impl PortWriter {
    /// Push one buffer downstream; returns false once the graph is gone
    pub async fn send(&self, buffer: MediaBuffer) -> bool {
        self.tx.send(buffer).await.is_ok()
    }
}

/// Capability contract for the decode subgraph behind a source.
///
/// Implementations announce pads through the binder as formats get
/// negotiated and then deliver buffers through the returned writer. The
/// whole subgraph runs on its own worker task.
#[async_trait]
pub trait DecodeBackend: Send {
    async fn run(&mut self, pads: &mut PadBinder, ctx: StageContext) -> Result<()>;
}

/// One configured input source and its late-bound output port
pub struct SourceBinding {
    name: String,
    source_id: u32,
    ghost_tx: Option<mpsc::Sender<MediaBuffer>>,
    ghost_rx: Option<mpsc::Receiver<MediaBuffer>>,
    bound: Arc<AtomicBool>,
    backend: Option<Box<dyn DecodeBackend>>,
}

impl SourceBinding {
    /// Create the binding for one source: asks the registry for a decode
    /// backend matching the URI and sets up the unbound ghost port.
    pub fn create(
        registry: &StageRegistry,
        index: usize,
        source: &SourceConfig,
    ) -> Result<Self, GraphError> {
        let name = format!("source-bin-{index:02}");
        let backend = registry.create_decoder(&source.uri, source.source_id)?;
        let (ghost_tx, ghost_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        Ok(Self {
            name,
            source_id: source.source_id,
            ghost_tx: Some(ghost_tx),
            ghost_rx: Some(ghost_rx),
            bound: Arc::new(AtomicBool::new(false)),
            backend: Some(backend),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    /// Whether the decode subgraph has bound the output port yet
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    /// Hand out the graph-facing output port. Usable by downstream
    /// stages immediately; carries no data until the backend binds.
    pub fn take_output(&mut self) -> Result<mpsc::Receiver<MediaBuffer>, GraphError> {
        self.ghost_rx.take().ok_or_else(|| {
            GraphError::link(&self.name, "downstream", "source output already taken")
        })
    }

    /// Start the decode subgraph on its own worker task.
    ///
    /// If the backend finishes without ever binding, the task parks and
    /// keeps the port reservation alive until shutdown so the silent
    /// source never looks like end-of-stream to the merge stage.
    pub fn spawn(&mut self, ctx: StageContext) -> Option<JoinHandle<()>> {
        let mut backend = self.backend.take()?;
        let mut binder = PadBinder {
            binding_name: self.name.clone(),
            tx: self.ghost_tx.take(),
            bound: self.bound.clone(),
        };
        let name = self.name.clone();
        Some(tokio::spawn(async move {
            match backend.run(&mut binder, ctx.clone()).await {
                Ok(()) => debug!("{name}: decode subgraph finished"),
                Err(err) => {
                    error!("{name}: decode subgraph failed: {err:#}");
                    ctx.post_error(&name, format!("{err:#}")).await;
                    return;
                }
            }
            if !binder.is_bound() {
                ctx.cancel.cancelled().await;
            }
        }))
    }
}

/// Synthetic test-pattern decode subgraph for `test://` URIs.
///
/// Stands in for a real demux/decode chain: it "negotiates" a format
/// shortly after starting, announces it, and delivers a fixed number of
/// pattern frames at a fixed rate. Query knobs:
/// `frames` (default 30), `fps` (default 30), `memory=system` to force a
/// rejected negotiation, `audio=1` to announce an extra audio pad first.
pub struct TestPatternDecoder {
    source_id: u32,
    frames: u64,
    fps: u32,
    memory: MemoryDomain,
    announce_audio: bool,
}

impl TestPatternDecoder {
    pub fn from_uri(uri: &str, source_id: u32) -> Result<Self, GraphError> {
        let mut decoder = Self {
            source_id,
            frames: 30,
            fps: 30,
            memory: MemoryDomain::Device,
            announce_audio: false,
        };

        let query = uri.split_once('?').map(|(_, q)| q).unwrap_or("");
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "frames" => {
                    decoder.frames = value.parse().map_err(|_| {
                        GraphError::creation("decoder", uri, "frames must be an integer")
                    })?;
                }
                "fps" => {
                    decoder.fps = value.parse().map_err(|_| {
                        GraphError::creation("decoder", uri, "fps must be an integer")
                    })?;
                    if decoder.fps == 0 {
                        return Err(GraphError::creation("decoder", uri, "fps must be nonzero"));
                    }
                }
                "memory" if value == "system" => decoder.memory = MemoryDomain::System,
                "audio" if value == "1" => decoder.announce_audio = true,
                _ => debug!("test decoder: ignoring query knob '{key}'"),
            }
        }
        Ok(decoder)
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps as u64)
    }
}

#[async_trait]
impl DecodeBackend for TestPatternDecoder {
    async fn run(&mut self, pads: &mut PadBinder, ctx: StageContext) -> Result<()> {
        // Small delay before the pads appear, as with a real demuxer.
        tokio::time::sleep(Duration::from_millis(2)).await;

        if self.announce_audio {
            let audio = StreamFormat {
                kind: MediaKind::Audio,
                memory: MemoryDomain::System,
                format: "S16LE".to_string(),
            };
            // Audio pads are not usable by this graph and must be ignored.
            let rejected = pads.announce(&audio);
            debug_assert!(rejected.is_none());
        }

        let format = StreamFormat {
            kind: MediaKind::Video,
            memory: self.memory,
            format: "NV12".to_string(),
        };
        let Some(writer) = pads.announce(&format) else {
            // Rejected negotiation: this source contributes no data.
            return Ok(());
        };

        let interval = self.frame_interval();
        let pattern = Bytes::from(vec![self.source_id as u8; 64]);
        for n in 0..self.frames {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let pts = Timestamp::from_micros(n as i64 * interval.as_micros() as i64);
            let frame = FrameMeta::new(self.source_id, n, pts);
            let buffer = MediaBuffer::single(pattern.clone(), format.clone(), frame);
            if !writer.send(buffer).await {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = ctx.cancel.cancelled() => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::BUS_CHANNEL_CAPACITY;
    use tokio_util::sync::CancellationToken;

    fn binder() -> (PadBinder, mpsc::Receiver<MediaBuffer>) {
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        (
            PadBinder {
                binding_name: "source-bin-00".to_string(),
                tx: Some(tx),
                bound: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    fn ctx() -> StageContext {
        let (bus_tx, _bus_rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
        StageContext::new(bus_tx, CancellationToken::new())
    }

    #[test]
    fn test_audio_announcement_rejected() {
        let (mut pads, _rx) = binder();
        let audio = StreamFormat {
            kind: MediaKind::Audio,
            memory: MemoryDomain::Device,
            format: "S16LE".to_string(),
        };
        assert!(pads.announce(&audio).is_none());
        assert!(!pads.is_bound());
    }

    #[test]
    fn test_system_memory_announcement_rejected() {
        let (mut pads, _rx) = binder();
        let format = StreamFormat {
            kind: MediaKind::Video,
            memory: MemoryDomain::System,
            format: "I420".to_string(),
        };
        assert!(pads.announce(&format).is_none());
        assert!(!pads.is_bound());
    }

    #[test]
    fn test_binds_exactly_once() {
        let (mut pads, _rx) = binder();
        let format = StreamFormat::device_video("NV12");
        assert!(pads.announce(&format).is_some());
        assert!(pads.is_bound());
        // A second usable pad must not re-bind.
        assert!(pads.announce(&format).is_none());
    }

    #[tokio::test]
    async fn test_test_pattern_delivers_frames() {
        let mut decoder =
            TestPatternDecoder::from_uri("test://pattern?frames=3&fps=1000", 7).unwrap();
        let (mut pads, mut rx) = binder();
        decoder.run(&mut pads, ctx()).await.unwrap();

        let mut seen = 0;
        while let Some(buffer) = rx.recv().await {
            assert_eq!(buffer.frames[0].source_id, 7);
            assert_eq!(buffer.frames[0].frame_number, seen);
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_rejected_source_contributes_no_buffers() {
        let mut decoder =
            TestPatternDecoder::from_uri("test://pattern?frames=3&fps=1000&memory=system", 1)
                .unwrap();
        let (mut pads, mut rx) = binder();
        decoder.run(&mut pads, ctx()).await.unwrap();

        assert!(!pads.is_bound());
        // The reservation is still held by the binder, so the channel is
        // open but empty.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_uri_knob_validation() {
        assert!(TestPatternDecoder::from_uri("test://p?frames=abc", 0).is_err());
        assert!(TestPatternDecoder::from_uri("test://p?fps=0", 0).is_err());
        let decoder = TestPatternDecoder::from_uri("test://p?frames=5&fps=10&audio=1", 0).unwrap();
        assert_eq!(decoder.frames, 5);
        assert_eq!(decoder.fps, 10);
        assert!(decoder.announce_audio);
    }
}
