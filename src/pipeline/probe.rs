//! Metadata extraction probe and throughput bookkeeping
//!
//! The probe sits on the input side of the final render stage and is
//! invoked synchronously by the render worker for every batched buffer:
//! it classifies and counts detections, appends one line per detection to
//! an output log, appends a per-buffer summary line, and feeds the
//! running throughput counter. File append is the only I/O on this hot
//! path; the log is opened, appended and closed on every invocation so
//! already-written lines survive a crash.

use log::{error, info};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use super::types::{
    BBox, CLASS_ID_BAG, CLASS_ID_FACE, CLASS_ID_PERSON, MediaBuffer, ObjectMeta,
};

/// Default log destination for the raw-detector probe variant
pub const DEFAULT_DETECTOR_LOG: &str = "metadata_detector.txt";
/// Default log destination for the tracker-refined probe variant
pub const DEFAULT_TRACKER_LOG: &str = "metadata_tracker.txt";

/// Sentinel for "no sample recorded yet"
const TIME_NONE: i64 = i64::MIN;

/// Callback invoked once per buffer crossing a stage boundary
pub trait BufferProbe: Send {
    fn observe(&mut self, buffer: &MediaBuffer);
}

/// Running throughput accumulator.
///
/// The first sample only seeds the previous-timestamp; every later sample
/// adds its interval to the cumulative elapsed time. All fields are
/// atomics so the entry path can read the totals once at shutdown while
/// the probe owns the only update site.
pub struct PerfCounter {
    pre_time: AtomicI64,
    total_time: AtomicI64,
    count: AtomicU64,
}

impl PerfCounter {
    pub fn new() -> Self {
        Self {
            pre_time: AtomicI64::new(TIME_NONE),
            total_time: AtomicI64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one probe invocation at the given monotonic microsecond
    /// reading
    pub fn sample(&self, now_micros: i64) {
        let pre = self.pre_time.load(Ordering::Relaxed);
        if pre == TIME_NONE {
            self.pre_time.store(now_micros, Ordering::Relaxed);
            return;
        }
        self.total_time
            .fetch_add(now_micros - pre, Ordering::Relaxed);
        self.pre_time.store(now_micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of recorded intervals
    pub fn sample_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of recorded intervals in microseconds
    pub fn cumulative_micros(&self) -> i64 {
        self.total_time.load(Ordering::Relaxed)
    }

    /// Average throughput over the run, `(count - 1) * 1e6 / elapsed`
    pub fn average_fps(&self) -> Option<f64> {
        let count = self.sample_count();
        let total = self.cumulative_micros();
        if count == 0 || total <= 0 {
            return None;
        }
        Some((count - 1) as f64 * 1_000_000.0 / total as f64)
    }
}

impl Default for PerfCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Which bounding-box/confidence fields a probe variant reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVariant {
    /// Raw detector output (`detector_bbox`, `confidence`)
    Detector,
    /// Tracker-refined output (`tracker_bbox`, `tracker_confidence`)
    Tracker,
}

/// Per-buffer metadata probe; see the module docs.
pub struct MetadataProbe {
    variant: ProbeVariant,
    log_path: PathBuf,
    /// Global batched-buffer index, owned by this instance
    frame_number: u64,
    perf: Arc<PerfCounter>,
    clock_base: Instant,
}

impl MetadataProbe {
    /// Raw-detector variant writing to `log_path`
    pub fn detector(log_path: impl Into<PathBuf>, perf: Arc<PerfCounter>) -> Self {
        Self::new(ProbeVariant::Detector, log_path, perf)
    }

    /// Tracker-refined variant writing to `log_path`
    pub fn tracker(log_path: impl Into<PathBuf>, perf: Arc<PerfCounter>) -> Self {
        Self::new(ProbeVariant::Tracker, log_path, perf)
    }

    fn new(variant: ProbeVariant, log_path: impl Into<PathBuf>, perf: Arc<PerfCounter>) -> Self {
        Self {
            variant,
            log_path: log_path.into(),
            frame_number: 0,
            perf,
            clock_base: Instant::now(),
        }
    }

    /// Current global buffer index
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Process one buffer with an explicit clock reading
    pub fn observe_at(&mut self, buffer: &MediaBuffer, now_micros: i64) {
        self.perf.sample(now_micros);

        if buffer.frames.is_empty() {
            // No metadata attached; not an error.
            return;
        }

        let mut person_count: u32 = 0;
        let mut bag_count: u32 = 0;
        let mut face_count: u32 = 0;

        let mut lines = String::new();
        for frame in &buffer.frames {
            for object in &frame.objects {
                match object.class_id {
                    CLASS_ID_PERSON => person_count += 1,
                    CLASS_ID_BAG => bag_count += 1,
                    CLASS_ID_FACE => face_count += 1,
                    _ => {}
                }
                lines.push_str(&self.variant.detection_line(object));
                lines.push('\n');
            }
        }

        let summary = format!(
            "Frame Number = {} People Count = {} Bag Count = {} Face Count = {}",
            self.frame_number, person_count, bag_count, face_count
        );
        lines.push_str(&summary);
        lines.push('\n');

        match OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_path)
        {
            Ok(mut file) => {
                if let Err(err) = file.write_all(lines.as_bytes()) {
                    error!("failed to append metadata to {}: {err}", self.log_path.display());
                }
            }
            Err(err) => {
                error!("failed to open {}: {err}", self.log_path.display());
            }
        }

        if self.variant == ProbeVariant::Detector {
            info!("{summary}");
        }

        self.frame_number += 1;
    }
}

impl ProbeVariant {
    fn fields<'a>(&self, object: &'a ObjectMeta) -> (&'a BBox, f32) {
        match self {
            ProbeVariant::Detector => (&object.detector_bbox, object.confidence),
            ProbeVariant::Tracker => (&object.tracker_bbox, object.tracker_confidence),
        }
    }

    /// One KITTI-style log line: corners derived from the top-left
    /// anchored rectangle as `right = left + width`,
    /// `bottom = top + height`.
    fn detection_line(&self, object: &ObjectMeta) -> String {
        let (bbox, confidence) = self.fields(object);
        format!(
            "{} {} 0.0 0 0.0 {:.6} {:.6} {:.6} {:.6} 0.0 0.0 0.0 0.0 0.0 0.0 0.0 {:.6}",
            object.label,
            object.object_id,
            bbox.left,
            bbox.top,
            bbox.right(),
            bbox.bottom(),
            confidence
        )
    }
}

impl BufferProbe for MetadataProbe {
    fn observe(&mut self, buffer: &MediaBuffer) {
        let now = self.clock_base.elapsed().as_micros() as i64;
        self.observe_at(buffer, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{FrameMeta, ObjectMeta, StreamFormat, Timestamp};
    use bytes::Bytes;

    fn temp_log(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "warpflow-probe-{}-{tag}.txt",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn buffer_with_objects(frames: Vec<Vec<ObjectMeta>>) -> MediaBuffer {
        let frames = frames
            .into_iter()
            .enumerate()
            .map(|(i, objects)| {
                let mut meta = FrameMeta::new(i as u32, i as u64, Timestamp::from_micros(0));
                meta.objects = objects;
                meta
            })
            .collect();
        MediaBuffer {
            data: Bytes::from_static(b"batch"),
            pts: Timestamp::from_micros(0),
            format: StreamFormat::device_video("RGBA"),
            frames,
        }
    }

    #[test]
    fn test_perf_counter_seeding_and_intervals() {
        let perf = PerfCounter::new();
        perf.sample(100);
        perf.sample(200);
        perf.sample(350);

        assert_eq!(perf.sample_count(), 2);
        assert_eq!(perf.cumulative_micros(), 250);
        let fps = perf.average_fps().unwrap();
        assert!((fps - 4000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_perf_counter_single_sample_reports_nothing() {
        let perf = PerfCounter::new();
        perf.sample(100);
        assert_eq!(perf.sample_count(), 0);
        assert_eq!(perf.cumulative_micros(), 0);
        assert!(perf.average_fps().is_none());
    }

    #[test]
    fn test_probe_counts_and_lines() {
        let path = temp_log("counts");
        let perf = Arc::new(PerfCounter::new());
        let mut probe = MetadataProbe::detector(&path, perf);

        let person = |left: f32| {
            ObjectMeta::detection("person", CLASS_ID_PERSON, BBox::new(left, 0.0, 10.0, 10.0), 0.9)
        };
        let bag = ObjectMeta::detection("bag", CLASS_ID_BAG, BBox::new(5.0, 5.0, 4.0, 4.0), 0.7);

        let buffer = buffer_with_objects(vec![vec![person(1.0), bag], vec![person(2.0)]]);
        probe.observe_at(&buffer, 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[3],
            "Frame Number = 0 People Count = 2 Bag Count = 1 Face Count = 0"
        );
        assert_eq!(probe.frame_number(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_detection_line_corner_conversion() {
        let object = ObjectMeta::detection(
            "person",
            CLASS_ID_PERSON,
            BBox::new(10.0, 20.0, 5.0, 8.0),
            0.5,
        );
        let line = ProbeVariant::Detector.detection_line(&object);
        assert_eq!(
            line,
            "person 0 0.0 0 0.0 10.000000 20.000000 15.000000 28.000000 \
             0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.500000"
        );
    }

    #[test]
    fn test_tracker_variant_reads_tracker_fields() {
        let path = temp_log("tracker");
        let perf = Arc::new(PerfCounter::new());
        let mut probe = MetadataProbe::tracker(&path, perf);

        let mut object = ObjectMeta::detection(
            "person",
            CLASS_ID_PERSON,
            BBox::new(1.0, 1.0, 1.0, 1.0),
            0.1,
        );
        object.object_id = 42;
        object.tracker_bbox = BBox::new(10.0, 20.0, 5.0, 8.0);
        object.tracker_confidence = 0.75;

        let buffer = buffer_with_objects(vec![vec![object]]);
        probe.observe_at(&buffer, 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(
            "person 42 0.0 0 0.0 10.000000 20.000000 15.000000 28.000000"
        ));
        assert!(contents.contains("0.750000"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_buffer_without_metadata_is_noop() {
        let path = temp_log("empty");
        let perf = Arc::new(PerfCounter::new());
        let mut probe = MetadataProbe::detector(&path, perf.clone());

        let buffer = MediaBuffer {
            data: Bytes::new(),
            pts: Timestamp::from_micros(0),
            format: StreamFormat::device_video("RGBA"),
            frames: Vec::new(),
        };
        probe.observe_at(&buffer, 100);
        probe.observe_at(&buffer, 200);

        // The clock still ticks, the log does not.
        assert_eq!(perf.sample_count(), 1);
        assert_eq!(probe.frame_number(), 0);
        assert!(!path.exists());
    }
}
