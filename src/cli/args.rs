//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use flowsleuth_core::handler::{CleartextHandler, DnsHandler, HttpHandler};
use flowsleuth_core::{HandlerRegistry, PipelineConfig};

use crate::capture::ReplayOptions;

/// Event kinds that can be printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum EventKind {
    /// Every decoded frame
    Frame,
    /// First sighting of a network address
    Host,
    /// New TCP session or datagram conversation
    Session,
    /// Reconstructed file
    File,
    /// Username or password seen in cleartext
    Credential,
    /// DNS answer
    Dns,
    /// Message extracted by a handler
    Message,
    /// Drop, handler failure, MAC change and similar
    Anomaly,
    /// Intake queue fill level
    Buffer,
    /// Dictionary words found in payloads
    Cleartext,
}

impl EventKind {
    /// Kinds printed when `--show` is not given.
    pub const DEFAULT: &'static [EventKind] = &[
        EventKind::Host,
        EventKind::Session,
        EventKind::File,
        EventKind::Credential,
        EventKind::Dns,
        EventKind::Message,
        EventKind::Anomaly,
        EventKind::Cleartext,
    ];
}

/// Reconstruct sessions, files and credentials from a capture file.
#[derive(Parser, Debug)]
#[command(name = "flowsleuth")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// PCAP or PCAPNG file to analyze
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Write reconstructed files under this directory
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Event kinds to print (repeatable)
    #[arg(long = "show", value_enum, value_name = "KIND")]
    pub show: Vec<EventKind>,

    /// Print only the end-of-run summary
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Stop after this many capture records
    #[arg(short = 'c', long = "count", value_name = "N")]
    pub count: Option<u64>,

    /// Intake queue capacity (raw units)
    #[arg(long = "intake-capacity", default_value_t = PipelineConfig::default().intake_capacity)]
    pub intake_capacity: usize,

    /// Concurrent TCP sessions kept before the least recent is evicted
    #[arg(long = "session-capacity", default_value_t = PipelineConfig::default().session_capacity)]
    pub session_capacity: usize,

    /// Concurrent file transfers kept before the least recent is evicted
    #[arg(long = "assembler-capacity", default_value_t = PipelineConfig::default().assembler_capacity)]
    pub assembler_capacity: usize,

    /// Largest file reconstructed, in bytes
    #[arg(long = "max-file-size", default_value_t = PipelineConfig::default().max_file_size)]
    pub max_file_size: u64,

    /// Decode only up to the transport layer
    #[arg(long = "quick-parse")]
    pub quick_parse: bool,

    /// Offer records as fast as they are read and let the pipeline drop
    /// when it falls behind, as a live capture would
    #[arg(long = "no-throttle")]
    pub no_throttle: bool,

    /// Disable the cleartext word scanner
    #[arg(long = "no-cleartext")]
    pub no_cleartext: bool,

    /// Words for the cleartext scanner (repeatable, replaces the built-in list)
    #[arg(long = "word", value_name = "WORD")]
    pub words: Vec<String>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Pipeline configuration from the tuning flags.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            intake_capacity: self.intake_capacity,
            session_capacity: self.session_capacity,
            assembler_capacity: self.assembler_capacity,
            max_file_size: self.max_file_size,
            quick_parse: self.quick_parse,
            emit_frames: self.shows(EventKind::Frame),
            ..PipelineConfig::default()
        }
    }

    /// Handlers in dispatch order.
    pub fn handlers(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_session(HttpHandler::new());
        registry.register_frame(DnsHandler::new());
        if !self.no_cleartext {
            if self.words.is_empty() {
                registry.register_frame(CleartextHandler::default());
            } else {
                registry.register_frame(CleartextHandler::new(self.words.iter().map(String::as_str)));
            }
        }
        registry
    }

    pub fn replay_options(&self) -> ReplayOptions {
        ReplayOptions {
            throttle: (!self.no_throttle).then_some(90),
            limit: self.count,
            ..ReplayOptions::default()
        }
    }

    /// Event kinds to print.
    pub fn shown_kinds(&self) -> Vec<EventKind> {
        if self.quiet {
            Vec::new()
        } else if self.show.is_empty() {
            EventKind::DEFAULT.to_vec()
        } else {
            self.show.clone()
        }
    }

    fn shows(&self, kind: EventKind) -> bool {
        !self.quiet && self.show.contains(&kind)
    }

    /// Default log filter for the `-v` count.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
