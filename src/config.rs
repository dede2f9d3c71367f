//! Runtime configuration: positional CLI contract and tracker config
//!
//! The command line follows the fixed positional form
//! `warpflow <sink 1|2|3> <tracking 1|2> {<uri> <source-id> <dewarp-config>}+`
//! with a few optional overrides layered on top. The tracker config file
//! is a key/value `[tracker]` section parsed into a typed struct: unknown
//! keys become warnings, malformed values for recognized keys are fatal.

use clap::{Arg, ArgAction, Command};
use log::warn;
use std::path::{Path, PathBuf};

use crate::pipeline::error::GraphError;
use crate::pipeline::stage::ParamValue;
use crate::pipeline::topology::{SinkKind, TrackingMode};

/// Default tracker config location, relative to the working directory
pub const DEFAULT_TRACKER_CONFIG: &str = "tracker_files/tracker_config.txt";
/// Default primary-inference model config location
pub const DEFAULT_INFER_CONFIG: &str = "inference_files/config_infer_primary.txt";

const USAGE: &str =
    "warpflow [1:file sink|2:discard sink|3:display sink] [1:no tracking|2:tracking] \
     <uri1> <source-id1> <dewarp-config1> [<uri2> <source-id2> <dewarp-config2>] ...";

/// One configured input source
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub uri: String,
    pub source_id: u32,
    pub dewarp_config: PathBuf,
}

/// Fully parsed application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sink: SinkKind,
    pub tracking: TrackingMode,
    pub sources: Vec<SourceConfig>,
    pub tracker_config_path: PathBuf,
    pub inference_config_path: PathBuf,
    /// File-sink output location
    pub output_location: String,
    /// Override for the metadata log destination; the probe variant
    /// picks its own default when unset
    pub metadata_path: Option<PathBuf>,
    /// Route display output through a presentation transform
    pub presentation_transform: bool,
}

impl AppConfig {
    /// Build a config from the raw positional values
    pub fn from_parts(
        sink_arg: i64,
        tracking_arg: i64,
        source_args: &[String],
    ) -> Result<Self, GraphError> {
        let sink = SinkKind::from_arg(sink_arg)?;
        let tracking = TrackingMode::from_arg(tracking_arg)?;

        if source_args.is_empty() || source_args.len() % 3 != 0 {
            return Err(GraphError::InvalidMode(format!(
                "sources must be given as <uri> <source-id> <dewarp-config> triplets\nUsage: {USAGE}"
            )));
        }

        let mut sources = Vec::with_capacity(source_args.len() / 3);
        for triplet in source_args.chunks_exact(3) {
            let source_id = triplet[1].parse::<u32>().map_err(|_| {
                GraphError::InvalidMode(format!(
                    "source id '{}' must be a non-negative integer",
                    triplet[1]
                ))
            })?;
            sources.push(SourceConfig {
                uri: triplet[0].clone(),
                source_id,
                dewarp_config: PathBuf::from(&triplet[2]),
            });
        }

        Ok(Self {
            sink,
            tracking,
            sources,
            tracker_config_path: PathBuf::from(DEFAULT_TRACKER_CONFIG),
            inference_config_path: PathBuf::from(DEFAULT_INFER_CONFIG),
            output_location: "out.h264".to_string(),
            metadata_path: None,
            presentation_transform: false,
        })
    }

    /// Parse the process command line
    pub fn parse() -> Result<Self, GraphError> {
        let matches = Command::new(env!("CARGO_PKG_NAME"))
            .version(env!("CARGO_PKG_VERSION"))
            .about(env!("CARGO_PKG_DESCRIPTION"))
            .override_usage(USAGE)
            .arg(
                Arg::new("sink")
                    .value_name("SINK")
                    .help("Output sink kind: 1 file, 2 discard, 3 display")
                    .required(true)
                    .allow_hyphen_values(true)
                    .value_parser(clap::value_parser!(i64)),
            )
            .arg(
                Arg::new("tracking")
                    .value_name("TRACKING")
                    .help("Tracking mode: 1 none, 2 tracked")
                    .required(true)
                    .allow_hyphen_values(true)
                    .value_parser(clap::value_parser!(i64)),
            )
            .arg(
                Arg::new("sources")
                    .value_name("URI ID DEWARP-CONFIG")
                    .help("One or more source triplets")
                    .required(true)
                    .num_args(1..),
            )
            .arg(
                Arg::new("tracker-config")
                    .long("tracker-config")
                    .value_name("PATH")
                    .help("Tracker key/value config file"),
            )
            .arg(
                Arg::new("infer-config")
                    .long("infer-config")
                    .value_name("PATH")
                    .help("Primary inference model config file"),
            )
            .arg(
                Arg::new("output")
                    .long("output")
                    .value_name("PATH")
                    .help("File-sink output location"),
            )
            .arg(
                Arg::new("metadata-file")
                    .long("metadata-file")
                    .value_name("PATH")
                    .help("Metadata log destination"),
            )
            .arg(
                Arg::new("presentation-transform")
                    .long("presentation-transform")
                    .action(ArgAction::SetTrue)
                    .help("Route display output through a presentation transform"),
            )
            .get_matches();

        let sink_arg = *matches.get_one::<i64>("sink").expect("required");
        let tracking_arg = *matches.get_one::<i64>("tracking").expect("required");
        let source_args: Vec<String> = matches
            .get_many::<String>("sources")
            .expect("required")
            .cloned()
            .collect();

        let mut config = Self::from_parts(sink_arg, tracking_arg, &source_args)?;
        if let Some(path) = matches.get_one::<String>("tracker-config") {
            config.tracker_config_path = PathBuf::from(path);
        }
        if let Some(path) = matches.get_one::<String>("infer-config") {
            config.inference_config_path = PathBuf::from(path);
        }
        if let Some(path) = matches.get_one::<String>("output") {
            config.output_location = path.clone();
        }
        if let Some(path) = matches.get_one::<String>("metadata-file") {
            config.metadata_path = Some(PathBuf::from(path));
        }
        config.presentation_transform = matches.get_flag("presentation-transform");
        Ok(config)
    }
}

/// Typed view of the `[tracker]` config group
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    pub tracker_width: Option<i64>,
    pub tracker_height: Option<i64>,
    pub gpu_id: Option<i64>,
    pub ll_config_file: Option<PathBuf>,
    pub ll_lib_file: Option<PathBuf>,
    pub enable_batch_process: Option<bool>,
    pub tracking_surface_type: Option<i64>,
    /// Keys in the group this parser does not recognize; logged, ignored
    pub unknown_keys: Vec<String>,
}

impl TrackerConfig {
    /// Load and parse the `[tracker]` group of a key/value config file
    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            GraphError::config(display.as_str(), format!("Failed to load config file: {err}"))
        })?;

        let mut config = TrackerConfig::default();
        let mut in_tracker_group = false;
        let mut seen_tracker_group = false;

        for raw in contents.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_tracker_group = header.trim() == "tracker";
                seen_tracker_group |= in_tracker_group;
                continue;
            }
            if !in_tracker_group {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                GraphError::config(display.as_str(), format!("malformed line '{line}'"))
            })?;
            let (key, value) = (key.trim(), value.trim());

            let int = |field: &str| -> Result<i64, GraphError> {
                value.parse::<i64>().map_err(|_| {
                    GraphError::config(display.as_str(), format!("{field} must be an integer, got '{value}'"))
                })
            };

            match key {
                "tracker-width" => config.tracker_width = Some(int("tracker-width")?),
                "tracker-height" => config.tracker_height = Some(int("tracker-height")?),
                "gpu-id" => config.gpu_id = Some(int("gpu-id")?),
                "ll-config-file" => {
                    config.ll_config_file = Some(resolve_config_relative(path, value));
                }
                "ll-lib-file" => {
                    config.ll_lib_file = Some(resolve_config_relative(path, value));
                }
                "enable-batch-process" => {
                    config.enable_batch_process = Some(int("enable-batch-process")? != 0);
                }
                "tracking-surface-type" => {
                    config.tracking_surface_type = Some(int("tracking-surface-type")?);
                }
                other => {
                    warn!("Unknown key '{other}' for group [tracker]");
                    config.unknown_keys.push(other.to_string());
                }
            }
        }

        if !seen_tracker_group {
            return Err(GraphError::config(display.as_str(), "no [tracker] group found"));
        }
        Ok(config)
    }

    /// Render the recognized keys as stage properties
    pub fn as_properties(&self) -> Vec<(String, ParamValue)> {
        let mut properties = Vec::new();
        if let Some(width) = self.tracker_width {
            properties.push(("tracker-width".to_string(), ParamValue::Int(width)));
        }
        if let Some(height) = self.tracker_height {
            properties.push(("tracker-height".to_string(), ParamValue::Int(height)));
        }
        if let Some(gpu_id) = self.gpu_id {
            properties.push(("gpu-id".to_string(), ParamValue::Int(gpu_id)));
        }
        if let Some(path) = &self.ll_config_file {
            properties.push((
                "ll-config-file".to_string(),
                ParamValue::Str(path.display().to_string()),
            ));
        }
        if let Some(path) = &self.ll_lib_file {
            properties.push((
                "ll-lib-file".to_string(),
                ParamValue::Str(path.display().to_string()),
            ));
        }
        if let Some(enable) = self.enable_batch_process {
            properties.push(("enable-batch-process".to_string(), ParamValue::Bool(enable)));
        }
        if let Some(surface_type) = self.tracking_surface_type {
            properties.push((
                "tracking-surface-type".to_string(),
                ParamValue::Int(surface_type),
            ));
        }
        properties
    }
}

/// Resolve a path from a config file relative to that file's directory,
/// unless it is already absolute
fn resolve_config_relative(config_path: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn write_tracker_config(tag: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "warpflow-tracker-{}-{tag}.txt",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_source_triplets() {
        let config = AppConfig::from_parts(
            2,
            1,
            &args(&[
                "test://a", "0", "dewarp_files/a.txt",
                "test://b", "7", "dewarp_files/b.txt",
            ]),
        )
        .unwrap();
        assert_eq!(config.sink, SinkKind::Discard);
        assert_eq!(config.tracking, TrackingMode::Untracked);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[1].source_id, 7);
        assert_eq!(config.sources[1].uri, "test://b");
    }

    #[test]
    fn test_bad_arity_rejected() {
        let err = AppConfig::from_parts(1, 1, &args(&["test://a", "0"])).unwrap_err();
        assert!(matches!(err, GraphError::InvalidMode(_)));
        let err = AppConfig::from_parts(1, 1, &args(&[])).unwrap_err();
        assert!(matches!(err, GraphError::InvalidMode(_)));
    }

    #[test]
    fn test_bad_selectors_rejected() {
        let sources = args(&["test://a", "0", "d.txt"]);
        assert!(matches!(
            AppConfig::from_parts(4, 1, &sources),
            Err(GraphError::InvalidMode(_))
        ));
        assert!(matches!(
            AppConfig::from_parts(1, 3, &sources),
            Err(GraphError::InvalidMode(_))
        ));
        assert!(matches!(
            AppConfig::from_parts(1, 1, &args(&["test://a", "x", "d.txt"])),
            Err(GraphError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_tracker_config_recognized_keys() {
        let path = write_tracker_config(
            "recognized",
            "[tracker]\n\
             tracker-width=640\n\
             tracker-height=384\n\
             gpu-id=0\n\
             ll-config-file=tracker_config.yml\n\
             ll-lib-file=/opt/tracker/libtracker.so\n\
             enable-batch-process=1\n\
             tracking-surface-type=0\n",
        );
        let config = TrackerConfig::from_file(&path).unwrap();
        assert_eq!(config.tracker_width, Some(640));
        assert_eq!(config.tracker_height, Some(384));
        assert_eq!(config.gpu_id, Some(0));
        assert_eq!(config.enable_batch_process, Some(true));
        assert_eq!(config.tracking_surface_type, Some(0));
        assert!(config.unknown_keys.is_empty());

        // Relative paths resolve against the config file's directory,
        // absolute paths pass through.
        assert_eq!(
            config.ll_config_file.unwrap(),
            path.parent().unwrap().join("tracker_config.yml")
        );
        assert_eq!(
            config.ll_lib_file.unwrap(),
            PathBuf::from("/opt/tracker/libtracker.so")
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_tracker_config_unknown_key_warned_not_fatal() {
        let path = write_tracker_config(
            "unknown",
            "[tracker]\ntracker-width=640\nshiny-new-knob=3\n",
        );
        let config = TrackerConfig::from_file(&path).unwrap();
        assert_eq!(config.unknown_keys, vec!["shiny-new-knob".to_string()]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_tracker_config_malformed_value_fatal() {
        let path = write_tracker_config("malformed", "[tracker]\ntracker-width=wide\n");
        assert!(matches!(
            TrackerConfig::from_file(&path),
            Err(GraphError::ConfigParse { .. })
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_tracker_config_missing_group_fatal() {
        let path = write_tracker_config("nogroup", "[other]\nkey=1\n");
        assert!(matches!(
            TrackerConfig::from_file(&path),
            Err(GraphError::ConfigParse { .. })
        ));
        assert!(matches!(
            TrackerConfig::from_file(Path::new("/nonexistent/tracker.txt")),
            Err(GraphError::ConfigParse { .. })
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_as_properties_covers_set_fields() {
        let config = TrackerConfig {
            tracker_width: Some(640),
            enable_batch_process: Some(false),
            ..Default::default()
        };
        let properties = config.as_properties();
        assert_eq!(properties.len(), 2);
        assert_eq!(properties[0], ("tracker-width".to_string(), ParamValue::Int(640)));
        assert_eq!(
            properties[1],
            ("enable-batch-process".to_string(), ParamValue::Bool(false))
        );
    }
}
