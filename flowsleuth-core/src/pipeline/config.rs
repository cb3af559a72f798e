use std::time::Duration;

use crate::file::DEFAULT_MAX_FILE_SIZE;
use crate::handler::DEFAULT_WINDOW_SEGMENTS;
use crate::stream::DEFAULT_MAX_OUT_OF_ORDER;

/// Capacities and timing of a [`Pipeline`](super::Pipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Raw units held before intake starts dropping packets.
    pub intake_capacity: usize,
    /// Decoded frames waiting for the dispatcher.
    pub frame_capacity: usize,
    /// Active TCP sessions.
    pub session_capacity: usize,
    /// In-flight file transfers.
    pub assembler_capacity: usize,
    /// Incomplete IPv4 datagrams.
    pub fragment_capacity: usize,
    /// Out-of-order segments buffered per stream direction.
    pub max_out_of_order: usize,
    /// Smallest window offered to a session handler.
    pub window_segments: usize,
    /// Sleep of a worker that found its queue empty.
    pub idle_delay: Duration,
    /// Decode only up to the transport layer.
    pub quick_parse: bool,
    pub max_file_size: u64,
    /// Emit a `FrameObserved` event for every frame.
    pub emit_frames: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 4096,
            frame_capacity: 4096,
            session_capacity: 1000,
            assembler_capacity: 200,
            fragment_capacity: 256,
            max_out_of_order: DEFAULT_MAX_OUT_OF_ORDER,
            window_segments: DEFAULT_WINDOW_SEGMENTS,
            idle_delay: Duration::from_millis(20),
            quick_parse: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            emit_frames: true,
        }
    }
}
