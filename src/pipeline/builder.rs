//! Graph assembly
//!
//! Builds the full pipeline from an [`AppConfig`]: one source binding and
//! per-source transform chain each, the shared merge stage sized from the
//! transform read-back, the downstream chain selected by the topology
//! table, and the metadata probe on the render boundary. Any creation or
//! link failure aborts the build immediately; there is no partial-graph
//! retry.

use log::{debug, info};

use crate::config::{AppConfig, TrackerConfig};
use crate::pipeline::error::GraphError;
use crate::pipeline::graph::PipelineGraph;
use crate::pipeline::probe::{
    DEFAULT_DETECTOR_LOG, DEFAULT_TRACKER_LOG, MetadataProbe,
};
use crate::pipeline::registry::StageRegistry;
use crate::pipeline::source::SourceBinding;
use crate::pipeline::stage::{ParamValue, StageKind, StageParams};
use crate::pipeline::stages::mux::DEFAULT_BATCH_TIMEOUT_USEC;
use crate::pipeline::stages::tiler::{
    TILED_OUTPUT_HEIGHT, TILED_OUTPUT_WIDTH, grid_for_sources,
};
use crate::pipeline::topology::{
    SinkKind, StageRole, TrackingMode, downstream_roles, role_stage,
};

/// Merge-stage output resolution; input frames of other sizes are scaled
pub const MUXER_OUTPUT_WIDTH: i64 = 960;
pub const MUXER_OUTPUT_HEIGHT: i64 = 752;

const PIPELINE_NAME: &str = "warpflow-pipeline";
const MUX_NAME: &str = "stream-muxer";

/// Assembles a [`PipelineGraph`] from the runtime configuration
pub struct GraphBuilder<'a> {
    registry: &'a StageRegistry,
    config: &'a AppConfig,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a StageRegistry, config: &'a AppConfig) -> Self {
        Self { registry, config }
    }

    /// Build, wire and seal the graph
    pub fn build(self) -> Result<PipelineGraph, GraphError> {
        let mut graph = PipelineGraph::new(PIPELINE_NAME);
        let num_sources = self.config.sources.len();

        let mux_params = StageParams::new()
            .set_int("width", MUXER_OUTPUT_WIDTH)
            .set_int("height", MUXER_OUTPUT_HEIGHT)
            .set_int("batched-push-timeout", DEFAULT_BATCH_TIMEOUT_USEC);
        graph.add_stage(self.registry.create(StageKind::Mux, MUX_NAME, &mux_params)?)?;

        // Per-source decode subgraph and transform chain, each feeding a
        // freshly requested merge pad.
        let mut surfaces_per_frame: u64 = 1;
        for (index, source) in self.config.sources.iter().enumerate() {
            let binding = SourceBinding::create(self.registry, index, source)?;
            graph.add_binding(binding)?;

            let convert_name = format!("videoconvert-{index}");
            let convert_params = StageParams::new().set_str("format", "RGBA");
            graph.add_stage(self.registry.create(
                StageKind::Convert,
                &convert_name,
                &convert_params,
            )?)?;

            let dewarp_name = format!("dewarper-{index}");
            let dewarp_params = StageParams::new()
                .set_str("config-file", &source.dewarp_config.display().to_string())
                .set_uint("source-id", source.source_id as u64);
            graph.add_stage(self.registry.create(
                StageKind::Dewarp,
                &dewarp_name,
                &dewarp_params,
            )?)?;

            graph.link_source_chain(index, &convert_name)?;
            graph.link(&convert_name, &dewarp_name)?;
            graph.link_request_pad(&dewarp_name, MUX_NAME, &format!("sink_{index}"))?;

            // Surface count read back from the constructed transform; a
            // stage may emit several surfaces per input frame.
            if let Some(ParamValue::UInt(surfaces)) =
                graph.stage_property(&dewarp_name, "num-batch-buffers")
            {
                surfaces_per_frame = surfaces;
            }
        }

        {
            let mux = graph
                .stage_mut(MUX_NAME)
                .ok_or_else(|| GraphError::creation("mux", MUX_NAME, "merge stage missing"))?;
            mux.set_property(
                "batch-size",
                ParamValue::UInt(num_sources as u64 * surfaces_per_frame),
            )?;
            mux.set_property("num-surfaces-per-frame", ParamValue::UInt(surfaces_per_frame))?;
        }
        debug!(
            "merge stage configured: batch size {} ({} sources x {} surfaces)",
            num_sources as u64 * surfaces_per_frame,
            num_sources,
            surfaces_per_frame
        );

        self.add_downstream_stages(&mut graph, num_sources)?;
        self.link_downstream_chain(&mut graph)?;
        self.install_probe(&mut graph)?;

        graph.finish_build()?;
        info!(
            "graph built: {} sources, sink {:?}, tracking {:?}",
            num_sources, self.config.sink, self.config.tracking
        );
        Ok(graph)
    }

    /// Create the shared downstream stages.
    ///
    /// The tracking stage is always created and configured, whether or
    /// not the selected chain links it; the remaining stages are created
    /// only when their role appears in the chain.
    fn add_downstream_stages(
        &self,
        graph: &mut PipelineGraph,
        num_sources: usize,
    ) -> Result<(), GraphError> {
        let tracker_config = TrackerConfig::from_file(&self.config.tracker_config_path)?;
        let tracker_name = instance_name(StageRole::Tracking, self.config.sink);
        graph.add_stage(self.registry.create(
            StageKind::Tracking,
            tracker_name,
            &StageParams::new(),
        )?)?;
        {
            let tracker = graph
                .stage_mut(tracker_name)
                .ok_or_else(|| GraphError::creation("tracking", tracker_name, "stage missing"))?;
            for (key, value) in tracker_config.as_properties() {
                tracker.set_property(&key, value)?;
            }
        }

        for role in downstream_roles(self.config.sink, self.config.tracking) {
            if *role == StageRole::Tracking {
                continue; // Created above.
            }
            let name = instance_name(*role, self.config.sink);
            let params = self.role_params(*role, num_sources);
            graph.add_stage(self.registry.create(
                role_stage(*role, self.config.sink),
                name,
                &params,
            )?)?;
        }
        Ok(())
    }

    /// Construction parameters per downstream role
    fn role_params(&self, role: StageRole, num_sources: usize) -> StageParams {
        match role {
            StageRole::Inference => StageParams::new().set_str(
                "config-file-path",
                &self.config.inference_config_path.display().to_string(),
            ),
            StageRole::Tiling => {
                let (rows, columns) = grid_for_sources(num_sources);
                StageParams::new()
                    .set_uint("rows", rows as u64)
                    .set_uint("columns", columns as u64)
                    .set_int("width", TILED_OUTPUT_WIDTH)
                    .set_int("height", TILED_OUTPUT_HEIGHT)
            }
            StageRole::FormatConvert => StageParams::new().set_str("format", "I420"),
            StageRole::Encode => StageParams::new().set_str("codec", "H264"),
            StageRole::Render => match self.config.sink {
                SinkKind::File => {
                    StageParams::new().set_str("location", &self.config.output_location)
                }
                SinkKind::Discard => StageParams::new()
                    .set_bool("sync", false)
                    .set_bool("async", false),
                SinkKind::Display => StageParams::new()
                    .set_bool("use-presentation-transform", self.config.presentation_transform),
            },
            StageRole::Tracking => StageParams::new(),
            StageRole::Overlay => StageParams::new(),
        }
    }

    /// Link the merge stage through the selected role chain in order
    fn link_downstream_chain(&self, graph: &mut PipelineGraph) -> Result<(), GraphError> {
        let mut upstream = MUX_NAME;
        for role in downstream_roles(self.config.sink, self.config.tracking) {
            let downstream = instance_name(*role, self.config.sink);
            graph.link(upstream, downstream)?;
            upstream = downstream;
        }
        Ok(())
    }

    /// Install the metadata probe on the render stage's input boundary
    fn install_probe(&self, graph: &mut PipelineGraph) -> Result<(), GraphError> {
        let render_name = instance_name(StageRole::Render, self.config.sink);
        let perf = graph.perf_counter();
        let probe = match self.config.tracking {
            TrackingMode::Untracked => MetadataProbe::detector(
                self.config
                    .metadata_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DETECTOR_LOG.into()),
                perf,
            ),
            TrackingMode::Tracked => MetadataProbe::tracker(
                self.config
                    .metadata_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TRACKER_LOG.into()),
                perf,
            ),
        };
        graph.install_probe(render_name, Box::new(probe))
    }
}

/// Stable instance name for each downstream role
fn instance_name(role: StageRole, sink: SinkKind) -> &'static str {
    match role {
        StageRole::Inference => "primary-infer",
        StageRole::Tracking => "object-tracker",
        StageRole::Tiling => "tiler",
        StageRole::Overlay => "osd-overlay",
        StageRole::FormatConvert => "videoconvert-out",
        StageRole::Encode => "h264-encoder",
        StageRole::Render => match sink {
            SinkKind::Discard => "fake-renderer",
            SinkKind::File | SinkKind::Display => "video-renderer",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::pipeline::bus::{BusMonitor, RunOutcome};
    use crate::pipeline::stages::infer::{Detector, InferStage};
    use crate::pipeline::types::{BBox, CLASS_ID_BAG, CLASS_ID_PERSON, FrameMeta, ObjectMeta};
    use std::path::PathBuf;
    use std::time::Duration;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("warpflow-builder-{}-{tag}", std::process::id()))
    }

    fn write_file(tag: &str, contents: &str) -> PathBuf {
        let path = temp_path(tag);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn test_config(tag: &str, sink: SinkKind, tracking: TrackingMode, uris: &[&str]) -> AppConfig {
        let dewarp = write_file(&format!("{tag}-dewarp.txt"), "[surface0]\nprojection-type=1\n");
        let tracker = write_file(&format!("{tag}-tracker.txt"), "[tracker]\ntracker-width=640\n");
        AppConfig {
            sink,
            tracking,
            sources: uris
                .iter()
                .enumerate()
                .map(|(i, uri)| SourceConfig {
                    uri: uri.to_string(),
                    source_id: i as u32,
                    dewarp_config: dewarp.clone(),
                })
                .collect(),
            tracker_config_path: tracker,
            inference_config_path: PathBuf::from("inference_files/config_infer_primary.txt"),
            output_location: temp_path(&format!("{tag}-out.h264")).display().to_string(),
            metadata_path: Some(temp_path(&format!("{tag}-metadata.txt"))),
            presentation_transform: false,
        }
    }

    #[test]
    fn test_batch_size_follows_sources_and_surfaces() {
        let mut config = test_config(
            "batch",
            SinkKind::Discard,
            TrackingMode::Untracked,
            &["test://a", "test://b", "test://c"],
        );
        // Two surfaces per frame from every dewarp stage.
        let dewarp = write_file("batch-dewarp2.txt", "[surface0]\n[surface1]\n");
        for source in &mut config.sources {
            source.dewarp_config = dewarp.clone();
        }

        let registry = StageRegistry::with_defaults();
        let graph = GraphBuilder::new(&registry, &config).build().unwrap();

        assert_eq!(graph.source_count(), 3);
        assert_eq!(
            graph.stage_property(MUX_NAME, "batch-size"),
            Some(ParamValue::UInt(6))
        );
        assert_eq!(
            graph.stage_property(MUX_NAME, "num-surfaces-per-frame"),
            Some(ParamValue::UInt(2))
        );
        assert_eq!(
            graph.stage_property("tiler", "rows"),
            Some(ParamValue::UInt(1))
        );
        assert_eq!(
            graph.stage_property("tiler", "columns"),
            Some(ParamValue::UInt(3))
        );
    }

    #[test]
    fn test_tracker_created_and_configured_even_off_chain() {
        let config = test_config(
            "offchain",
            SinkKind::File,
            TrackingMode::Tracked,
            &["test://a"],
        );
        let registry = StageRegistry::with_defaults();
        let graph = GraphBuilder::new(&registry, &config).build().unwrap();

        // The tracked file chain does not link the tracker, but the
        // stage exists and carries its config.
        assert_eq!(
            graph.stage_property("object-tracker", "tracker-width"),
            Some(ParamValue::Int(640))
        );
        // No overlay on this chain either.
        assert!(graph.stage_property("osd-overlay", "format").is_none());
    }

    #[test]
    fn test_unknown_uri_scheme_aborts_build() {
        let config = test_config(
            "scheme",
            SinkKind::Discard,
            TrackingMode::Untracked,
            &["rtsp://camera.local/axis"],
        );
        let registry = StageRegistry::with_defaults();
        let err = GraphBuilder::new(&registry, &config).build().err().unwrap();
        assert!(matches!(err, GraphError::CreationFailure { .. }));
    }

    #[test]
    fn test_missing_tracker_config_aborts_build() {
        let mut config = test_config(
            "notracker",
            SinkKind::Discard,
            TrackingMode::Tracked,
            &["test://a"],
        );
        config.tracker_config_path = PathBuf::from("/nonexistent/tracker.txt");
        let registry = StageRegistry::with_defaults();
        let err = GraphBuilder::new(&registry, &config).build().err().unwrap();
        assert!(matches!(err, GraphError::ConfigParse { .. }));
    }

    /// Detector emitting one person and one bag per frame, for data-path
    /// tests
    struct SyntheticDetector;

    impl Detector for SyntheticDetector {
        fn detect(&mut self, _frame: &FrameMeta, _data: &[u8]) -> Vec<ObjectMeta> {
            vec![
                ObjectMeta::detection("person", CLASS_ID_PERSON, BBox::new(10.0, 20.0, 5.0, 8.0), 0.9),
                ObjectMeta::detection("bag", CLASS_ID_BAG, BBox::new(1.0, 1.0, 2.0, 2.0), 0.6),
            ]
        }
    }

    #[tokio::test]
    async fn test_end_to_end_run_reaches_probe_and_eos() {
        let config = test_config(
            "e2e",
            SinkKind::Discard,
            TrackingMode::Tracked,
            &["test://a?frames=4&fps=500", "test://b?frames=4&fps=500"],
        );
        let metadata = config.metadata_path.clone().unwrap();
        let _ = std::fs::remove_file(&metadata);

        let mut registry = StageRegistry::with_defaults();
        registry.register(StageKind::Inference, |name, params| {
            Ok(Box::new(InferStage::with_detector(
                name,
                params,
                Box::new(SyntheticDetector),
            )))
        });

        let mut graph = GraphBuilder::new(&registry, &config).build().unwrap();
        let perf = graph.perf_counter();
        let mut monitor = BusMonitor::new(graph.take_bus_receiver().unwrap());
        let stop = graph.cancel_token();

        graph.start().unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), monitor.run(&stop))
            .await
            .expect("run loop should terminate on EOS");
        assert_eq!(outcome, RunOutcome::Completed);
        graph.stop().await;

        // Frames flowed all the way to the probe on the render boundary.
        let contents = std::fs::read_to_string(&metadata).unwrap();
        assert!(contents.contains("People Count = "));
        assert!(contents.contains("person "));
        // Tracker variant logs the tracker-refined rectangles the
        // monotonic tracker mirrored from the detector.
        assert!(contents.contains("15.000000"));
        assert!(perf.sample_count() >= 1);
        let _ = std::fs::remove_file(&metadata);
    }

    #[tokio::test]
    async fn test_never_binding_source_is_not_fatal() {
        let config = test_config(
            "dead",
            SinkKind::Discard,
            TrackingMode::Untracked,
            &["test://a?frames=3&fps=500", "test://dead?memory=system"],
        );

        let registry = StageRegistry::with_defaults();
        let mut graph = GraphBuilder::new(&registry, &config).build().unwrap();
        let mut monitor = BusMonitor::new(graph.take_bus_receiver().unwrap());
        let stop = graph.cancel_token();

        graph.start().unwrap();

        // The healthy source drains, but the dead one keeps its merge
        // pad reserved, so no aggregate EOS can arrive; the run ends via
        // the external stop, not via an error.
        let stop_trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop_trigger.cancel();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(5), monitor.run(&stop))
            .await
            .expect("run loop should end on the stop token");
        assert_eq!(outcome, RunOutcome::Completed);
        graph.stop().await;
    }
}
