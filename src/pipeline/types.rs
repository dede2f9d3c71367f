//! Core types for the pipeline system

use bytes::Bytes;
use std::time::{Duration, Instant};

/// Object class id emitted by the primary detector for people.
pub const CLASS_ID_PERSON: i32 = 0;
/// Object class id emitted by the primary detector for bags.
pub const CLASS_ID_BAG: i32 = 1;
/// Object class id emitted by the primary detector for faces.
pub const CLASS_ID_FACE: i32 = 2;

/// Timestamp representation for media buffers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Microseconds since pipeline start
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from duration since pipeline start
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Create a timestamp from an instant relative to a base
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        let duration = instant.saturating_duration_since(base);
        Self::from_duration(duration)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Kind of media carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Memory domain a stream's buffers live in.
///
/// Only device-memory video can travel through the batched part of the
/// graph; a decode subgraph that negotiates system memory is rejected at
/// bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryDomain {
    /// Accelerated device-local memory
    Device,
    /// Plain host memory
    System,
}

/// Negotiated format descriptor announced by a decode subgraph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub kind: MediaKind,
    pub memory: MemoryDomain,
    /// Pixel or sample layout, e.g. "NV12", "RGBA", "I420"
    pub format: String,
}

impl StreamFormat {
    /// Device-memory video in the given pixel layout
    pub fn device_video(format: &str) -> Self {
        Self {
            kind: MediaKind::Video,
            memory: MemoryDomain::Device,
            format: format.to_string(),
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let memory = match self.memory {
            MemoryDomain::Device => "device",
            MemoryDomain::System => "system",
        };
        write!(f, "{}/{} ({} memory)", self.kind, self.format, memory)
    }
}

/// Axis-aligned bounding box in pixels, top-left anchored
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Right edge, `left + width`
    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    /// Bottom edge, `top + height`
    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }
}

/// One detected (and possibly tracked) object attached to a frame.
///
/// Both the detector-side and the tracker-side rectangles are always
/// present; the tracker pair stays zeroed until a tracking stage fills it
/// in. Downstream consumers pick the pair they care about.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub label: String,
    pub object_id: u64,
    pub class_id: i32,
    pub detector_bbox: BBox,
    pub confidence: f32,
    pub tracker_bbox: BBox,
    pub tracker_confidence: f32,
}

impl ObjectMeta {
    /// New detector-side object; tracker fields stay zeroed.
    pub fn detection(label: &str, class_id: i32, bbox: BBox, confidence: f32) -> Self {
        Self {
            label: label.to_string(),
            class_id,
            detector_bbox: bbox,
            confidence,
            ..Default::default()
        }
    }
}

/// Per-frame metadata travelling with a buffer
#[derive(Debug, Clone)]
pub struct FrameMeta {
    /// Configured id of the source this frame came from
    pub source_id: u32,
    /// Source-local frame counter
    pub frame_number: u64,
    /// Surface index within a multi-surface transform output
    pub surface_index: u32,
    /// Presentation timestamp
    pub pts: Timestamp,
    /// Objects attached by analytics stages
    pub objects: Vec<ObjectMeta>,
}

impl FrameMeta {
    pub fn new(source_id: u32, frame_number: u64, pts: Timestamp) -> Self {
        Self {
            source_id,
            frame_number,
            surface_index: 0,
            pts,
            objects: Vec::new(),
        }
    }
}

/// Unit of data flowing between stages.
///
/// Upstream of the merge stage a buffer carries exactly one `FrameMeta`;
/// downstream it carries one per batched frame. An empty `frames` list
/// means no metadata is attached, which consumers treat as a no-op.
#[derive(Debug, Clone)]
pub struct MediaBuffer {
    pub data: Bytes,
    pub pts: Timestamp,
    pub format: StreamFormat,
    pub frames: Vec<FrameMeta>,
}

impl MediaBuffer {
    /// Single-frame buffer as produced by a decode subgraph
    pub fn single(data: Bytes, format: StreamFormat, frame: FrameMeta) -> Self {
        Self {
            data,
            pts: frame.pts,
            format,
            frames: vec![frame],
        }
    }

    /// Total number of frames batched into this buffer
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}
