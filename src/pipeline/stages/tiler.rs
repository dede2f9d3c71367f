//! Grid compositing stage
//!
//! Composites the frames of a batched buffer into one tiled output
//! image. The pixel work is opaque; the stage's contract is the grid
//! geometry derived from the source count and the untouched pass-through
//! of the attached metadata.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::pipeline::error::GraphError;
use crate::pipeline::stage::{
    LINK_CHANNEL_CAPACITY, ParamValue, Stage, StageContext, StageKind, StageParams, idle_unlinked,
};
use crate::pipeline::types::MediaBuffer;

/// Default tiled output width
pub const TILED_OUTPUT_WIDTH: i64 = 1280;
/// Default tiled output height
pub const TILED_OUTPUT_HEIGHT: i64 = 720;

/// Grid geometry for a given source count:
/// `rows = floor(sqrt(n))`, `columns = ceil(n / rows)`
pub fn grid_for_sources(num_sources: usize) -> (u32, u32) {
    let n = num_sources.max(1) as f64;
    let rows = n.sqrt().floor() as u32;
    let columns = (n / rows as f64).ceil() as u32;
    (rows, columns)
}

pub struct TilerStage {
    name: String,
    rows: u32,
    columns: u32,
    width: i64,
    height: i64,
    input_rx: Option<mpsc::Receiver<MediaBuffer>>,
    output_tx: Option<mpsc::Sender<MediaBuffer>>,
}

impl TilerStage {
    pub fn new(name: &str, params: &StageParams) -> Self {
        Self {
            name: name.to_string(),
            rows: params.get_uint("rows").unwrap_or(1) as u32,
            columns: params.get_uint("columns").unwrap_or(1) as u32,
            width: params.get_int("width").unwrap_or(TILED_OUTPUT_WIDTH),
            height: params.get_int("height").unwrap_or(TILED_OUTPUT_HEIGHT),
            input_rx: None,
            output_tx: None,
        }
    }
}

#[async_trait]
impl Stage for TilerStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Tiling
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
            "rows" => Some(ParamValue::UInt(self.rows as u64)),
            "columns" => Some(ParamValue::UInt(self.columns as u64)),
            "width" => Some(ParamValue::Int(self.width)),
            "height" => Some(ParamValue::Int(self.height)),
            _ => None,
        }
    }

    async fn run(&mut self, ctx: StageContext) -> Result<()> {
        let (Some(mut input), Some(output)) = (self.input_rx.take(), self.output_tx.take()) else {
            idle_unlinked(&self.name, &ctx).await;
            return Ok(());
        };

        info!(
            "{}: started ({}x{} grid, {}x{} output)",
            self.name, self.rows, self.columns, self.width, self.height
        );
        let mut composited: u64 = 0;

        loop {
            tokio::select! {
                buffer = input.recv() => match buffer {
                    Some(buffer) => {
                        // Compositing is opaque; metadata rides along
                        // unchanged so downstream consumers still see the
                        // per-frame object lists.
                        composited += 1;
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

        info!("{}: finished ({composited} batches)", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_geometry() {
        assert_eq!(grid_for_sources(1), (1, 1));
        assert_eq!(grid_for_sources(2), (1, 2));
        assert_eq!(grid_for_sources(3), (1, 3));
        assert_eq!(grid_for_sources(4), (2, 2));
        assert_eq!(grid_for_sources(5), (2, 3));
        assert_eq!(grid_for_sources(9), (3, 3));
        assert_eq!(grid_for_sources(10), (3, 4));
    }

    #[test]
    fn test_params_applied() {
        let params = StageParams::new()
            .set_uint("rows", 2)
            .set_uint("columns", 3)
            .set_int("width", 1920)
            .set_int("height", 1080);
        let stage = TilerStage::new("nvtiler", &params);
        assert_eq!(stage.property("rows"), Some(ParamValue::UInt(2)));
        assert_eq!(stage.property("columns"), Some(ParamValue::UInt(3)));
        assert_eq!(stage.property("width"), Some(ParamValue::Int(1920)));
    }
}
