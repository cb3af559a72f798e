//! Convenient re-exports for common usage.
//!
//! ```rust,no_run
//! use flowsleuth_core::prelude::*;
//!
//! let (pipeline, _events) = Pipeline::with_defaults();
//! pipeline.flush();
//! ```

// Pipeline
pub use crate::pipeline::{Pipeline, PipelineConfig, PipelineWorkers, RawUnit};

// Events
pub use crate::event::{AnomalyLog, Event};

// Decoding
pub use crate::frame::{Frame, LinkType};
pub use crate::protocol::{ApplicationProtocol, Layer, LayerKind};

// Handlers and sinks
pub use crate::file::{FileSink, MemorySink, NullSink};
pub use crate::handler::{FrameHandler, HandlerRegistry, SessionHandler};

// Error types
pub use crate::error::{Error, Result};
