//! Assembled pipeline graph: stage container, lifecycle and dump
//!
//! The graph is mutable only while it is being built; once sealed it can
//! be started exactly once and stopped once. Every stage, every decode
//! subgraph and every merge-pad forwarder becomes its own worker task at
//! start; stop cancels them all and waits for them to drain.

use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::{BUS_CHANNEL_CAPACITY, BusMessage};
use super::error::GraphError;
use super::probe::{BufferProbe, PerfCounter};
use super::source::SourceBinding;
use super::stage::{self, Stage, StageContext};

/// Environment variable naming a directory for graph description dumps
pub const DUMP_DIR_ENV: &str = "WARPFLOW_DUMP_DIR";

/// Pipeline lifecycle state machine
///
/// Transitions are validated so that graph mutation stays confined to
/// the build phase and a stopped graph cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Stages are being created and linked
    Building,
    /// Build finished, ready to start
    Ready,
    /// Workers are processing media
    Running {
        /// When the pipeline started running
        started_at: Instant,
    },
    /// Workers are being cancelled and drained
    Stopping,
    /// Terminal state
    Stopped,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            (Building, Ready) => true,
            (Ready, Running { .. }) => true,
            (Ready, Stopping) => true, // Can abort before starting
            (Running { .. }, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, _) => false,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Building => "Building",
            PipelineState::Ready => "Ready",
            PipelineState::Running { .. } => "Running",
            PipelineState::Stopping => "Stopping",
            PipelineState::Stopped => "Stopped",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Stopping)
    }

    /// How long the pipeline has been running, if it is
    pub fn running_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Running { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Serialize)]
struct StageDescription {
    name: String,
    kind: String,
}

#[derive(Serialize)]
struct GraphDescription<'a> {
    name: &'a str,
    sources: Vec<&'a str>,
    stages: &'a [StageDescription],
    links: &'a [(String, String)],
}

/// The assembled topology; see the module docs.
pub struct PipelineGraph {
    name: String,
    state: PipelineState,
    bindings: Vec<SourceBinding>,
    stages: Vec<Box<dyn Stage>>,
    descriptions: Vec<StageDescription>,
    links: Vec<(String, String)>,
    bus_tx: mpsc::Sender<BusMessage>,
    bus_rx: Option<mpsc::Receiver<BusMessage>>,
    cancel: CancellationToken,
    perf: Arc<PerfCounter>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineGraph {
    pub fn new(name: &str) -> Self {
        let (bus_tx, bus_rx) = mpsc::channel(BUS_CHANNEL_CAPACITY);
        Self {
            name: name.to_string(),
            state: PipelineState::Building,
            bindings: Vec::new(),
            stages: Vec::new(),
            descriptions: Vec::new(),
            links: Vec::new(),
            bus_tx,
            bus_rx: Some(bus_rx),
            cancel: CancellationToken::new(),
            perf: Arc::new(PerfCounter::new()),
            workers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Shared throughput counter, fed by the probe and read at shutdown
    pub fn perf_counter(&self) -> Arc<PerfCounter> {
        self.perf.clone()
    }

    /// Number of source bindings in the graph
    pub fn source_count(&self) -> usize {
        self.bindings.len()
    }

    /// Token that stops every worker in the graph
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The receiving end of the lifecycle bus; can be taken once
    pub fn take_bus_receiver(&mut self) -> Option<mpsc::Receiver<BusMessage>> {
        self.bus_rx.take()
    }

    fn ensure_building(&self, what: &str) -> Result<(), GraphError> {
        if self.state != PipelineState::Building {
            return Err(GraphError::creation(
                "pipeline",
                &self.name,
                format!("{what} is only allowed during the build phase (state: {})", self.state),
            ));
        }
        Ok(())
    }

    /// Add a source binding to the graph
    pub fn add_binding(&mut self, binding: SourceBinding) -> Result<(), GraphError> {
        self.ensure_building("adding sources")?;
        self.descriptions.push(StageDescription {
            name: binding.name().to_string(),
            kind: "source-bin".to_string(),
        });
        self.bindings.push(binding);
        Ok(())
    }

    /// Add a stage to the graph
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) -> Result<(), GraphError> {
        self.ensure_building("adding stages")?;
        if self.stage_index(stage.name()).is_some() {
            return Err(GraphError::creation(
                stage.kind().as_str(),
                stage.name(),
                "a stage with this name already exists",
            ));
        }
        self.descriptions.push(StageDescription {
            name: stage.name().to_string(),
            kind: stage.kind().to_string(),
        });
        self.stages.push(stage);
        Ok(())
    }

    fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    /// Mutable access to a stage during the build phase
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut Box<dyn Stage>> {
        let index = self.stage_index(name)?;
        self.stages.get_mut(index)
    }

    /// Read a property off a stage by name
    pub fn stage_property(&self, name: &str, key: &str) -> Option<super::stage::ParamValue> {
        let index = self.stage_index(name)?;
        self.stages[index].property(key)
    }

    /// Connect two stages by name
    pub fn link(&mut self, upstream: &str, downstream: &str) -> Result<(), GraphError> {
        self.ensure_building("linking")?;
        let up = self
            .stage_index(upstream)
            .ok_or_else(|| GraphError::link(upstream, downstream, "unknown upstream stage"))?;
        let down = self
            .stage_index(downstream)
            .ok_or_else(|| GraphError::link(upstream, downstream, "unknown downstream stage"))?;
        if up == down {
            return Err(GraphError::link(upstream, downstream, "cannot link a stage to itself"));
        }

        let (first, second) = if up < down {
            let (left, right) = self.stages.split_at_mut(down);
            (&mut left[up], &mut right[0])
        } else {
            let (left, right) = self.stages.split_at_mut(up);
            (&mut right[0], &mut left[down])
        };
        stage::link(first.as_mut(), second.as_mut())?;
        self.links.push((upstream.to_string(), downstream.to_string()));
        debug!("linked {upstream} -> {downstream}");
        Ok(())
    }

    /// Connect a source binding's late-bound output to a merge-stage
    /// request pad
    pub fn link_source_chain(
        &mut self,
        binding_index: usize,
        downstream: &str,
    ) -> Result<(), GraphError> {
        self.ensure_building("linking")?;
        let binding_name = self
            .bindings
            .get(binding_index)
            .map(|b| b.name().to_string())
            .ok_or_else(|| GraphError::link("source", downstream, "unknown source binding"))?;
        let rx = self.bindings[binding_index].take_output()?;
        let down = self
            .stage_index(downstream)
            .ok_or_else(|| GraphError::link(&binding_name, downstream, "unknown downstream stage"))?;
        self.stages[down].set_input(rx).map_err(|err| {
            GraphError::link(&binding_name, downstream, err.to_string())
        })?;
        self.links.push((binding_name, downstream.to_string()));
        Ok(())
    }

    /// Route one stage's output into a named request pad on a merge
    /// stage
    pub fn link_request_pad(
        &mut self,
        upstream: &str,
        downstream: &str,
        pad_name: &str,
    ) -> Result<(), GraphError> {
        self.ensure_building("linking")?;
        let up = self
            .stage_index(upstream)
            .ok_or_else(|| GraphError::link(upstream, downstream, "unknown upstream stage"))?;
        let down = self
            .stage_index(downstream)
            .ok_or_else(|| GraphError::link(upstream, downstream, "unknown downstream stage"))?;
        let rx = self.stages[up].take_output()?;
        self.stages[down].request_input(pad_name, rx)?;
        self.links
            .push((upstream.to_string(), format!("{downstream}.{pad_name}")));
        Ok(())
    }

    /// Install the metadata probe on a stage's input boundary
    pub fn install_probe(
        &mut self,
        stage_name: &str,
        probe: Box<dyn BufferProbe>,
    ) -> Result<(), GraphError> {
        self.ensure_building("installing probes")?;
        let index = self
            .stage_index(stage_name)
            .ok_or_else(|| GraphError::link("probe", stage_name, "unknown stage"))?;
        self.stages[index].install_probe(probe)
    }

    /// Seal the graph; no further mutation is allowed
    pub fn finish_build(&mut self) -> Result<(), GraphError> {
        self.ensure_building("sealing")?;
        self.state = PipelineState::Ready;
        Ok(())
    }

    /// Start every worker in the graph
    pub fn start(&mut self) -> Result<(), GraphError> {
        let target = PipelineState::Running {
            started_at: Instant::now(),
        };
        if !self.state.can_transition_to(&target) {
            return Err(GraphError::creation(
                "pipeline",
                &self.name,
                format!("cannot start from state {}", self.state),
            ));
        }

        self.dump_description();

        for binding in &mut self.bindings {
            let ctx = StageContext::new(self.bus_tx.clone(), self.cancel.clone());
            if let Some(worker) = binding.spawn(ctx) {
                self.workers.push(worker);
            }
        }
        for mut stage in self.stages.drain(..) {
            let ctx = StageContext::new(self.bus_tx.clone(), self.cancel.clone());
            self.workers.push(tokio::spawn(async move {
                let name = stage.name().to_string();
                if let Err(err) = stage.run(ctx.clone()).await {
                    error!("{name}: stage failed: {err:#}");
                    ctx.post_error(&name, format!("{err:#}")).await;
                }
            }));
        }

        self.state = target;
        info!("Pipeline {} playing ({} workers)", self.name, self.workers.len());
        Ok(())
    }

    /// Cancel all workers and wait for them to drain
    pub async fn stop(&mut self) {
        if self.state.is_stopped() {
            return;
        }
        let uptime = self.state.running_duration();
        self.state = PipelineState::Stopping;
        self.cancel.cancel();
        let workers = std::mem::take(&mut self.workers);
        join_all(workers).await;
        self.bindings.clear();
        self.state = PipelineState::Stopped;
        match uptime {
            Some(uptime) => info!("Pipeline {} stopped after {uptime:.1?}", self.name),
            None => info!("Pipeline {} stopped", self.name),
        }
    }

    /// Write a JSON description of the assembled graph when
    /// `WARPFLOW_DUMP_DIR` points at a directory
    fn dump_description(&self) {
        let Ok(dir) = std::env::var(DUMP_DIR_ENV) else {
            return;
        };
        let description = GraphDescription {
            name: &self.name,
            sources: self.bindings.iter().map(|b| b.name()).collect(),
            stages: &self.descriptions,
            links: &self.links,
        };
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = std::path::Path::new(&dir).join(format!("{}-{stamp}.json", self.name));
        match serde_json::to_string_pretty(&description) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&path, json) {
                    warn!("failed to write graph dump {}: {err}", path.display());
                } else {
                    info!("graph description dumped to {}", path.display());
                }
            }
            Err(err) => warn!("failed to serialize graph description: {err}"),
        }
    }
}
