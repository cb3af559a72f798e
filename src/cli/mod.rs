//! Command-line interface module.
//!
//! This module handles:
//! - Argument parsing via clap
//! - Event line formatting and the end-of-run summary

mod args;
mod output;

pub use args::{Args, EventKind};
pub use output::{describe, event_kind, format_timestamp, write_summary, EventPrinter};
