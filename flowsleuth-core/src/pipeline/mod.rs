//! Ingestion and dispatch.
//!
//! A capture source pushes [`RawUnit`]s with [`Pipeline::try_enqueue`].
//! Two stages drain them:
//!
//! 1. the intake stage decodes each unit into a numbered [`Frame`] and
//!    queues it;
//! 2. the frame stage updates hosts and sessions, runs the handlers and
//!    emits [`Event`]s.
//!
//! The stages run either on two blocking workers ([`Pipeline::spawn`]) or
//! inline on the caller's thread ([`Pipeline::drain`]). Do not mix the two
//! on one pipeline.

mod config;
mod dispatch;
mod queue;

pub use config::PipelineConfig;
pub use queue::{BoundedQueue, RawUnit};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use self::dispatch::Dispatcher;
use crate::event::{AnomalyLog, Event, EventSink};
use crate::file::{FileAssemblerList, FileSink, NullSink};
use crate::fragment::FragmentCache;
use crate::frame::{Decoder, Frame};
use crate::handler::HandlerRegistry;
use crate::host::HostRegistry;
use crate::stream::SessionTable;

struct Shared {
    config: PipelineConfig,
    intake: BoundedQueue<RawUnit>,
    frames: BoundedQueue<Arc<Frame>>,
    decoder: Decoder,
    next_frame: AtomicU64,
    /// Accepted units not yet fully processed.
    in_flight: AtomicUsize,
    last_usage: AtomicU8,
    last_timestamp_us: AtomicI64,
    reset_requested: AtomicBool,
    events: EventSink,
    hosts: Arc<HostRegistry>,
    sessions: Arc<SessionTable>,
    assemblers: Arc<FileAssemblerList>,
    fragments: Arc<FragmentCache>,
    /// Taken by the frame stage, and by flush once the queues are empty.
    dispatcher: Mutex<Dispatcher>,
}

impl Shared {
    fn report_usage(&self) {
        let percent = self.intake.usage_percent();
        if self.last_usage.swap(percent, Ordering::Relaxed) != percent {
            self.events.emit(Event::BufferUsageChanged { percent });
        }
    }

    /// Decode one unit. Returns false when there was nothing to do.
    fn intake_step(&self) -> bool {
        if self.frames.is_full() {
            return false;
        }
        let Some(unit) = self.intake.pop() else {
            return false;
        };
        self.report_usage();

        let number = self.next_frame.fetch_add(1, Ordering::Relaxed);
        match self
            .decoder
            .decode(number, unit.timestamp_us, unit.link_type, unit.data)
        {
            Ok(frame) => {
                if let Err(frame) = self.frames.try_push(Arc::new(frame)) {
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    self.events.anomaly(
                        format!("frame {} dropped: frame queue full", frame.number()),
                        frame.timestamp_us(),
                    );
                }
            }
            Err(err) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.events
                    .anomaly(format!("frame {number} not decoded: {err}"), unit.timestamp_us);
            }
        }
        true
    }

    /// Dispatch one frame. Returns false when there was nothing to do.
    fn frame_step(&self) -> bool {
        if self.reset_requested.swap(false, Ordering::AcqRel) {
            self.dispatcher.lock().reset();
        }
        let Some(frame) = self.frames.pop() else {
            return false;
        };
        self.last_timestamp_us
            .store(frame.timestamp_us(), Ordering::Relaxed);
        self.dispatcher.lock().process(frame);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        true
    }
}

/// Handle to a running or inline pipeline. Clones share the same state.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    /// Build a pipeline and the receiver its events arrive on.
    pub fn new(
        config: PipelineConfig,
        handlers: HandlerRegistry,
        sink: impl FileSink + 'static,
    ) -> (Self, UnboundedReceiver<Event>) {
        let (events, receiver) = EventSink::channel();
        let hosts = Arc::new(HostRegistry::new());
        let sessions = Arc::new(SessionTable::new(config.session_capacity));
        let assemblers = Arc::new(FileAssemblerList::new(config.assembler_capacity));
        let fragments = Arc::new(FragmentCache::new(config.fragment_capacity));
        let dispatcher = Dispatcher::new(
            config.clone(),
            Arc::clone(&hosts),
            Arc::clone(&sessions),
            Arc::clone(&assemblers),
            Arc::clone(&fragments),
            handlers,
            Box::new(sink),
            events.clone(),
        );
        let shared = Shared {
            intake: BoundedQueue::new(config.intake_capacity),
            frames: BoundedQueue::new(config.frame_capacity),
            decoder: Decoder::default().quick_parse(config.quick_parse),
            next_frame: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            last_usage: AtomicU8::new(0),
            last_timestamp_us: AtomicI64::new(0),
            reset_requested: AtomicBool::new(false),
            events,
            hosts,
            sessions,
            assemblers,
            fragments,
            dispatcher: Mutex::new(dispatcher),
            config,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            receiver,
        )
    }

    /// Default configuration and handlers; files are discarded.
    pub fn with_defaults() -> (Self, UnboundedReceiver<Event>) {
        Self::new(
            PipelineConfig::default(),
            HandlerRegistry::with_defaults(),
            NullSink,
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Offer a captured unit. Returns false, and raises a "packet dropped"
    /// anomaly, when the intake queue is full.
    pub fn try_enqueue(&self, unit: RawUnit) -> bool {
        let shared = &self.shared;
        let timestamp_us = unit.timestamp_us;
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let accepted = match shared.intake.try_push(unit) {
            Ok(_) => true,
            Err(_) => {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                trace!(timestamp_us, "intake queue full");
                shared.events.anomaly(
                    format!(
                        "packet dropped: intake queue full ({} units)",
                        shared.intake.capacity()
                    ),
                    timestamp_us,
                );
                false
            }
        };
        shared.report_usage();
        accepted
    }

    /// Intake queue fill level, 0-100. Capture sources may throttle on it.
    pub fn buffer_usage(&self) -> u8 {
        self.shared.intake.usage_percent()
    }

    /// Whether every accepted unit has been fully processed.
    pub fn is_idle(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire) == 0
    }

    /// Frames numbered so far.
    pub fn frames_decoded(&self) -> u64 {
        self.shared.next_frame.load(Ordering::Relaxed) - 1
    }

    /// Run both stages on this thread until both queues are empty.
    /// Returns the number of frames dispatched.
    pub fn drain(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let decoded = self.shared.intake_step();
            let processed = self.shared.frame_step();
            dispatched += usize::from(processed);
            if !decoded && !processed {
                break;
            }
        }
        dispatched
    }

    /// End of capture: drain, then close every session and settle every
    /// transfer still in flight.
    pub fn flush(&self) {
        self.drain();
        let timestamp_us = self.shared.last_timestamp_us.load(Ordering::Relaxed);
        self.shared.dispatcher.lock().flush(timestamp_us);
    }

    /// Clear all state before the next frame is dispatched.
    pub fn request_reset(&self) {
        self.shared.reset_requested.store(true, Ordering::Release);
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.shared.hosts
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.shared.sessions
    }

    pub fn assemblers(&self) -> &FileAssemblerList {
        &self.shared.assemblers
    }

    pub fn anomalies(&self) -> &AnomalyLog {
        self.shared.events.anomalies()
    }

    /// Incomplete IPv4 datagrams held for reassembly.
    pub fn pending_fragments(&self) -> usize {
        self.shared.fragments.len()
    }

    /// Start both stages on blocking workers. Requires a Tokio runtime.
    pub fn spawn(&self) -> PipelineWorkers {
        let cancel = CancellationToken::new();
        let intake = spawn_stage(&self.shared, cancel.clone(), "intake", Shared::intake_step);
        let frames = spawn_stage(&self.shared, cancel.clone(), "frames", Shared::frame_step);
        PipelineWorkers {
            pipeline: self.clone(),
            cancel,
            intake,
            frames,
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("intake", &self.shared.intake.len())
            .field("frames", &self.shared.frames.len())
            .field("hosts", &self.shared.hosts.len())
            .field("sessions", &self.shared.sessions.len())
            .finish()
    }
}

fn spawn_stage(
    shared: &Arc<Shared>,
    cancel: CancellationToken,
    stage: &'static str,
    step: fn(&Shared) -> bool,
) -> JoinHandle<()> {
    let shared = Arc::clone(shared);
    tokio::task::spawn_blocking(move || {
        debug!(stage, "worker started");
        while !cancel.is_cancelled() {
            if !step(&shared) {
                std::thread::sleep(shared.config.idle_delay);
            }
        }
        debug!(stage, "worker stopped");
    })
}

/// The two blocking workers started by [`Pipeline::spawn`].
pub struct PipelineWorkers {
    pipeline: Pipeline,
    cancel: CancellationToken,
    intake: JoinHandle<()>,
    frames: JoinHandle<()>,
}

impl PipelineWorkers {
    /// Token that hard-stops both workers between iterations.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until everything accepted so far has been dispatched, then stop.
    pub async fn finish(self) {
        let delay = self.pipeline.config().idle_delay;
        while !self.pipeline.is_idle() && !self.cancel.is_cancelled() {
            tokio::time::sleep(delay).await;
        }
        self.stop().await;
    }

    /// Stop both workers without waiting for the queues to empty.
    pub async fn stop(self) {
        self.cancel.cancel();
        for (stage, handle) in [("intake", self.intake), ("frames", self.frames)] {
            if let Err(err) = handle.await {
                warn!(stage, %err, "pipeline worker failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::LinkType;
    use crate::protocol::test_utils::{tcp_frame, Flags};

    fn unit(ts: i64) -> RawUnit {
        let data = tcp_frame([10, 0, 0, 2], [10, 0, 0, 1], 40000, 80, 1, 0, Flags::SYN, b"");
        RawUnit::new(ts, LinkType::Ethernet, data)
    }

    fn quiet() -> PipelineConfig {
        PipelineConfig {
            emit_frames: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_frames_are_numbered_from_one() {
        let (pipeline, mut rx) = Pipeline::new(PipelineConfig::default(), HandlerRegistry::new(), NullSink);
        assert!(pipeline.try_enqueue(unit(10)));
        assert!(pipeline.try_enqueue(unit(20)));
        assert_eq!(pipeline.drain(), 2);
        assert!(pipeline.is_idle());
        assert_eq!(pipeline.frames_decoded(), 2);

        let numbers: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                Event::FrameObserved(frame) => Some(frame.number()),
                _ => None,
            })
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_usage_reported_on_change() {
        let config = PipelineConfig {
            intake_capacity: 4,
            ..quiet()
        };
        let (pipeline, mut rx) = Pipeline::new(config, HandlerRegistry::new(), NullSink);
        pipeline.try_enqueue(unit(1));
        pipeline.try_enqueue(unit(2));
        assert_eq!(pipeline.buffer_usage(), 50);
        pipeline.drain();

        let levels: Vec<u8> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                Event::BufferUsageChanged { percent } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(levels, vec![25, 50, 25, 0]);
    }

    #[test]
    fn test_fragment_count_readable_during_dispatch() {
        let (pipeline, _rx) = Pipeline::new(quiet(), HandlerRegistry::new(), NullSink);
        let _dispatching = pipeline.shared.dispatcher.lock();
        assert_eq!(pipeline.pending_fragments(), 0);
    }

    #[test]
    fn test_reset_clears_registries() {
        let (pipeline, _rx) = Pipeline::new(quiet(), HandlerRegistry::new(), NullSink);
        pipeline.try_enqueue(unit(1));
        pipeline.drain();
        assert_eq!(pipeline.hosts().len(), 2);
        assert_eq!(pipeline.sessions().len(), 1);

        pipeline.request_reset();
        pipeline.drain();
        assert!(pipeline.hosts().is_empty());
        assert!(pipeline.sessions().is_empty());
    }

    #[test]
    fn test_undecodable_unit_raises_anomaly() {
        let (pipeline, _rx) = Pipeline::new(quiet(), HandlerRegistry::new(), NullSink);
        let oversized = vec![0u8; crate::frame::MAX_FRAME_SIZE + 1];
        assert!(pipeline.try_enqueue(RawUnit::new(5, LinkType::Ethernet, oversized)));
        assert_eq!(pipeline.drain(), 0);
        assert!(pipeline.is_idle());
        assert_eq!(pipeline.anomalies().len(), 1);
        assert!(pipeline.anomalies().entries()[0].message.starts_with("frame 1 not decoded"));
    }
}
