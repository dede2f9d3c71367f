//! Built-in processing stages
//!
//! Each stage runs as its own worker task and talks to its neighbors
//! through channels. The heavy media work (decoding, projection math,
//! inference, tracking, compositing, encoding, presentation) lives behind
//! capability traits; the built-ins here carry the orchestration
//! semantics (properties, metadata handling, batching) without any
//! vendor algorithm.

pub mod convert;
pub mod dewarp;
pub mod encode;
pub mod infer;
pub mod mux;
pub mod overlay;
pub mod sink;
pub mod tiler;
pub mod tracker;
