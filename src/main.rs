//! flowsleuth CLI entry point.

use std::fs::File;
use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowsleuth::capture::{CaptureReader, Replay};
use flowsleuth::cli::{write_summary, Args, EventPrinter};
use flowsleuth::sink::DirectorySink;
use flowsleuth_core::file::{FileSink, NullSink};
use flowsleuth_core::{Event, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays event lines only
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_filter().into()),
        )
        .with_writer(io::stderr)
        .init();

    let reader = CaptureReader::open(&args.file)
        .with_context(|| format!("Failed to open capture file: {}", args.file.display()))?;

    match &args.output_dir {
        Some(dir) => {
            let sink = DirectorySink::new(dir)
                .with_context(|| format!("Failed to prepare output directory: {}", dir.display()))?;
            analyze(&args, reader, sink).await
        }
        None => analyze(&args, reader, NullSink).await,
    }
}

async fn analyze<S: FileSink + 'static>(
    args: &Args,
    mut reader: CaptureReader<File>,
    sink: S,
) -> Result<()> {
    let handlers = args.handlers();
    info!(handlers = ?handlers.names(), "pipeline ready");
    let (pipeline, events) = Pipeline::new(args.pipeline_config(), handlers, sink);

    let workers = pipeline.spawn();
    let cancel = workers.cancel_token();
    let printer = tokio::spawn(print_events(events, EventPrinter::new(args.shown_kinds())));

    let feeder = pipeline.clone();
    let mut replay = Replay::new(args.replay_options());
    let (replay, replayed) = tokio::task::spawn_blocking(move || {
        let result = replay.run(&mut reader, &feeder, &cancel);
        (replay, result)
    })
    .await
    .context("Capture reader task failed")?;

    // A read error ends the capture early; what was read still gets
    // dispatched and flushed before the error is reported.
    workers.finish().await;
    let flusher = pipeline.clone();
    tokio::task::spawn_blocking(move || flusher.flush())
        .await
        .context("Flush task failed")?;

    let mut hosts = pipeline.hosts().snapshot();
    hosts.sort();
    let anomalies = pipeline.anomalies().len();
    drop(pipeline);

    let printer = printer
        .await
        .context("Event printer task failed")?
        .context("Failed to write events")?;

    let mut stderr = io::stderr().lock();
    write_summary(&mut stderr, &hosts, printer.counts(), &replay.stats())
        .context("Failed to write summary")?;
    if anomalies > 0 {
        writeln!(stderr, "{anomalies} anomalies raised")?;
    }

    replayed
        .map(|_| ())
        .with_context(|| format!("Capture ended early: {}", args.file.display()))
}

/// Print events until every pipeline handle is dropped.
async fn print_events(
    mut events: UnboundedReceiver<Event>,
    mut printer: EventPrinter,
) -> io::Result<EventPrinter> {
    let mut out: Box<dyn Write + Send> = Box::new(io::stdout());
    while let Some(event) = events.recv().await {
        match printer.record(&event, &mut out) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                // keep counting for the summary
                warn!("stdout closed, no more events printed");
                out = Box::new(io::sink());
            }
            Err(err) => return Err(err),
        }
    }
    out.flush()?;
    Ok(printer)
}
