//! flowsleuth - reconstruct sessions, files and credentials from captures.
//!
//! This crate is the command-line front end of [`flowsleuth_core`]. It
//! reads PCAP/PCAPNG files, feeds their records into a
//! [`Pipeline`](flowsleuth_core::Pipeline), prints the resulting events and
//! writes reconstructed files to a directory.
//!
//! # Example
//!
//! ```no_run
//! use flowsleuth::capture::{replay, CaptureReader, ReplayOptions};
//! use flowsleuth::sink::DirectorySink;
//! use flowsleuth_core::{HandlerRegistry, Pipeline, PipelineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! fn main() -> anyhow::Result<()> {
//!     let sink = DirectorySink::new("recovered")?;
//!     let (pipeline, mut events) =
//!         Pipeline::new(PipelineConfig::default(), HandlerRegistry::with_defaults(), sink);
//!     let mut reader = CaptureReader::open("capture.pcap")?;
//!     let options = ReplayOptions { throttle: None, ..Default::default() };
//!     replay(&mut reader, &pipeline, &options, &CancellationToken::new())?;
//!     pipeline.flush();
//!     while let Ok(event) = events.try_recv() {
//!         println!("{}", event.kind());
//!     }
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod cli;
pub mod error;
pub mod sink;

pub use error::{CaptureError, SinkError};
