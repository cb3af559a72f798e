//! Capture file reading (PCAP and PCAPNG).
//!
//! Both containers are parsed with `pcap_parser`; records come out as
//! [`RawUnit`]s carrying the link type of their interface and a timestamp
//! in microseconds. [`Replay`] feeds a whole file into a [`Pipeline`],
//! backing off while the intake queue is above a high-water mark.
//!
//! ```no_run
//! use flowsleuth::capture::{replay, CaptureReader, ReplayOptions};
//! use flowsleuth_core::Pipeline;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> anyhow::Result<()> {
//! let (pipeline, _events) = Pipeline::with_defaults();
//! let mut reader = CaptureReader::open("capture.pcap")?;
//! let options = ReplayOptions { throttle: None, ..Default::default() };
//! let stats = replay(&mut reader, &pipeline, &options, &CancellationToken::new())?;
//! pipeline.flush();
//! println!("{} records", stats.records);
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use flowsleuth_core::{LinkType, Pipeline, RawUnit};
use pcap_parser::pcapng::Block;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError as ParserError, PcapNGReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::CaptureError;

/// Buffer size for pcap_parser readers (256KB).
const BUFFER_SIZE: usize = 262144;

/// Container format, detected from the magic number.
///
/// Byte order is handled by the parser; only timestamp resolution matters
/// here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Classic PCAP, microsecond timestamps
    LegacyMicro,
    /// Classic PCAP, nanosecond timestamps
    LegacyNano,
    /// PCAPNG
    PcapNg,
}

impl CaptureFormat {
    /// Detect the format from the first four bytes of a file.
    pub fn detect(data: &[u8]) -> Result<Self, CaptureError> {
        let magic: [u8; 4] = data
            .get(..4)
            .and_then(|m| m.try_into().ok())
            .ok_or_else(|| CaptureError::InvalidFormat {
                reason: "Data too small for capture magic".into(),
            })?;

        match u32::from_le_bytes(magic) {
            0xa1b2c3d4 | 0xd4c3b2a1 => Ok(CaptureFormat::LegacyMicro),
            0xa1b23c4d | 0x4d3cb2a1 => Ok(CaptureFormat::LegacyNano),
            0x0a0d0d0a => Ok(CaptureFormat::PcapNg),
            other => Err(CaptureError::InvalidFormat {
                reason: format!("Unknown capture magic: 0x{other:08x}"),
            }),
        }
    }

    pub fn is_pcapng(&self) -> bool {
        matches!(self, CaptureFormat::PcapNg)
    }
}

/// Per-interface state from a PCAPNG Interface Description Block.
#[derive(Clone, Copy, Debug)]
struct Interface {
    link_type: u16,
    /// Timestamp units per second.
    resolution: u64,
    /// Seconds added to every timestamp.
    offset_secs: i64,
}

impl Interface {
    fn new(link_type: u16, tsresol: u8, offset_secs: i64) -> Self {
        let exponent = u32::from(tsresol & 0x7f);
        let resolution = if tsresol & 0x80 != 0 {
            1u64.checked_shl(exponent).unwrap_or(u64::MAX)
        } else {
            10u64.checked_pow(exponent).unwrap_or(u64::MAX)
        };
        Self {
            link_type,
            resolution: resolution.max(1),
            offset_secs,
        }
    }

    fn timestamp_us(&self, ts_high: u32, ts_low: u32) -> i64 {
        let ticks = (u128::from(ts_high) << 32) | u128::from(ts_low);
        let micros = ticks * 1_000_000 / u128::from(self.resolution);
        i64::try_from(micros)
            .unwrap_or(i64::MAX)
            .saturating_add(self.offset_secs.saturating_mul(1_000_000))
    }
}

enum ReaderInner<R: Read> {
    Legacy(LegacyPcapReader<BufReader<R>>),
    Ng(PcapNGReader<BufReader<R>>),
}

/// Reads capture records from any byte source.
pub struct CaptureReader<R: Read> {
    inner: ReaderInner<R>,
    format: CaptureFormat,
    records: u64,
    /// Link type of the legacy header.
    link_type: u16,
    /// PCAPNG interfaces, by interface id.
    interfaces: Vec<Interface>,
    last_timestamp_us: i64,
}

impl CaptureReader<File> {
    /// Open a capture file, detecting its format.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let file = File::open(path.as_ref())?;
        Self::new(file)
    }
}

impl<R: Read> CaptureReader<R> {
    /// Wrap a byte source, detecting the format from its first bytes.
    pub fn new(source: R) -> Result<Self, CaptureError> {
        let mut buf_reader = BufReader::with_capacity(BUFFER_SIZE, source);
        let format = CaptureFormat::detect(buf_reader.fill_buf()?)?;

        let inner = if format.is_pcapng() {
            let reader = PcapNGReader::new(BUFFER_SIZE, buf_reader).map_err(|e| {
                CaptureError::InvalidFormat {
                    reason: format!("Failed to parse PCAPNG: {e}"),
                }
            })?;
            ReaderInner::Ng(reader)
        } else {
            let reader = LegacyPcapReader::new(BUFFER_SIZE, buf_reader).map_err(|e| {
                CaptureError::InvalidFormat {
                    reason: format!("Failed to parse legacy PCAP: {e}"),
                }
            })?;
            ReaderInner::Legacy(reader)
        };

        debug!(?format, "capture opened");
        Ok(Self {
            inner,
            format,
            records: 0,
            link_type: LinkType::Ethernet.as_u16(),
            interfaces: Vec::new(),
            last_timestamp_us: 0,
        })
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Records returned so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Read the next packet record. Returns `Ok(None)` at end of file.
    pub fn next_unit(&mut self) -> Result<Option<RawUnit>, CaptureError> {
        let unit = match &mut self.inner {
            ReaderInner::Legacy(reader) => next_legacy(
                reader,
                self.format,
                self.records,
                &mut self.link_type,
            )?,
            ReaderInner::Ng(reader) => next_pcapng(
                reader,
                self.records,
                &mut self.interfaces,
                self.last_timestamp_us,
            )?,
        };
        if let Some(unit) = &unit {
            self.records += 1;
            self.last_timestamp_us = unit.timestamp_us;
        }
        Ok(unit)
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<RawUnit, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_unit().transpose()
    }
}

fn read_error(record: u64, what: &str, err: impl std::fmt::Display) -> CaptureError {
    CaptureError::Read {
        record,
        reason: format!("{what}: {err}"),
    }
}

fn next_legacy<S: Read>(
    reader: &mut LegacyPcapReader<S>,
    format: CaptureFormat,
    records: u64,
    link_type: &mut u16,
) -> Result<Option<RawUnit>, CaptureError> {
    loop {
        match reader.next() {
            Ok((offset, block)) => match block {
                PcapBlockOwned::Legacy(packet) => {
                    let fraction_us = match format {
                        CaptureFormat::LegacyNano => i64::from(packet.ts_usec) / 1_000,
                        _ => i64::from(packet.ts_usec),
                    };
                    let timestamp_us = i64::from(packet.ts_sec) * 1_000_000 + fraction_us;
                    let unit = RawUnit::new(
                        timestamp_us,
                        LinkType::from_u16(*link_type),
                        Bytes::copy_from_slice(packet.data),
                    );
                    reader.consume(offset);
                    return Ok(Some(unit));
                }
                PcapBlockOwned::LegacyHeader(header) => {
                    *link_type = header.network.0 as u16;
                    trace!(link_type = *link_type, "legacy header");
                    reader.consume(offset);
                }
                _ => reader.consume(offset),
            },
            Err(ParserError::Eof) => return Ok(None),
            Err(ParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| read_error(records, "legacy PCAP refill", e))?;
            }
            Err(e) => return Err(read_error(records, "legacy PCAP parse", e)),
        }
    }
}

fn next_pcapng<S: Read>(
    reader: &mut PcapNGReader<S>,
    records: u64,
    interfaces: &mut Vec<Interface>,
    last_timestamp_us: i64,
) -> Result<Option<RawUnit>, CaptureError> {
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let unit = match block {
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        // interface ids restart in every section
                        interfaces.clear();
                        None
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        interfaces.push(Interface::new(
                            idb.linktype.0 as u16,
                            idb.if_tsresol,
                            idb.if_tsoffset,
                        ));
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let interface = interfaces
                            .get(epb.if_id as usize)
                            .copied()
                            .unwrap_or_else(|| Interface::new(LinkType::Ethernet.as_u16(), 6, 0));
                        Some(RawUnit::new(
                            interface.timestamp_us(epb.ts_high, epb.ts_low),
                            LinkType::from_u16(interface.link_type),
                            Bytes::copy_from_slice(epb.data),
                        ))
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        // no timestamp on simple packets; reuse the previous one
                        let link_type = interfaces
                            .first()
                            .map_or(LinkType::Ethernet.as_u16(), |i| i.link_type);
                        Some(RawUnit::new(
                            last_timestamp_us,
                            LinkType::from_u16(link_type),
                            Bytes::copy_from_slice(spb.data),
                        ))
                    }
                    _ => None,
                };
                reader.consume(offset);
                if unit.is_some() {
                    return Ok(unit);
                }
            }
            Err(ParserError::Eof) => return Ok(None),
            Err(ParserError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| read_error(records, "PCAPNG refill", e))?;
            }
            Err(e) => return Err(read_error(records, "PCAPNG parse", e)),
        }
    }
}

/// How a [`Replay`] paces itself against the pipeline.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Wait while the intake queue is at or above this percentage.
    /// `None` offers every record immediately and lets the pipeline drop.
    pub throttle: Option<u8>,

    /// Sleep between buffer usage checks.
    pub poll: Duration,

    /// Stop after this many records.
    pub limit: Option<u64>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            throttle: Some(90),
            poll: Duration::from_millis(1),
            limit: None,
        }
    }
}

/// Counters from a [`Replay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: u64,
    pub accepted: u64,
    pub dropped: u64,
}

/// Feeds capture records into a pipeline, keeping counters across runs.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    options: ReplayOptions,
    stats: ReplayStats,
}

impl Replay {
    pub fn new(options: ReplayOptions) -> Self {
        Self {
            options,
            stats: ReplayStats::default(),
        }
    }

    /// Counters so far, including records delivered before a read error.
    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Feed every record of `reader` into `pipeline`.
    ///
    /// Blocks the calling thread; run it on a blocking worker. Throttling
    /// needs the pipeline's workers running, otherwise it waits on a full
    /// queue until `cancel` fires.
    pub fn run<R: Read>(
        &mut self,
        reader: &mut CaptureReader<R>,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
    ) -> Result<ReplayStats, CaptureError> {
        while self.options.limit.map_or(true, |limit| self.stats.records < limit) {
            if cancel.is_cancelled() {
                debug!(records = self.stats.records, "replay cancelled");
                break;
            }
            let Some(unit) = reader.next_unit()? else {
                break;
            };
            self.stats.records += 1;

            if let Some(high_water) = self.options.throttle {
                while pipeline.buffer_usage() >= high_water && !cancel.is_cancelled() {
                    std::thread::sleep(self.options.poll);
                }
            }
            if pipeline.try_enqueue(unit) {
                self.stats.accepted += 1;
            } else {
                self.stats.dropped += 1;
            }
        }
        debug!(stats = ?self.stats, "replay finished");
        Ok(self.stats)
    }
}

/// Feed a whole capture into `pipeline` with the given options.
pub fn replay<R: Read>(
    reader: &mut CaptureReader<R>,
    pipeline: &Pipeline,
    options: &ReplayOptions,
    cancel: &CancellationToken,
) -> Result<ReplayStats, CaptureError> {
    Replay::new(options.clone()).run(reader, pipeline, cancel)
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_detect_magic() {
        assert_eq!(
            CaptureFormat::detect(&[0xd4, 0xc3, 0xb2, 0xa1]).unwrap(),
            CaptureFormat::LegacyMicro
        );
        assert_eq!(
            CaptureFormat::detect(&[0xa1, 0xb2, 0xc3, 0xd4]).unwrap(),
            CaptureFormat::LegacyMicro
        );
        assert_eq!(
            CaptureFormat::detect(&[0x4d, 0x3c, 0xb2, 0xa1]).unwrap(),
            CaptureFormat::LegacyNano
        );
        assert_eq!(
            CaptureFormat::detect(&[0x0a, 0x0d, 0x0d, 0x0a]).unwrap(),
            CaptureFormat::PcapNg
        );
        assert!(CaptureFormat::detect(b"GIF8").is_err());
        assert!(CaptureFormat::detect(&[0xd4]).is_err());
    }

    #[test]
    fn test_read_legacy_records() {
        let bytes = legacy_pcap(&[(1_700_000_000_250_000, b"first"), (1_700_000_001_000_001, b"second")]);
        let mut reader = CaptureReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.format(), CaptureFormat::LegacyMicro);

        let first = reader.next_unit().unwrap().unwrap();
        assert_eq!(first.timestamp_us, 1_700_000_000_250_000);
        assert_eq!(first.link_type, LinkType::Ethernet);
        assert_eq!(first.data.as_ref(), b"first");

        let second = reader.next_unit().unwrap().unwrap();
        assert_eq!(second.timestamp_us, 1_700_000_001_000_001);
        assert!(reader.next_unit().unwrap().is_none());
        assert_eq!(reader.records(), 2);
    }

    #[test]
    fn test_read_pcapng_records() {
        let bytes = pcapng(101, &[(42, b"raw ip bytes")]);
        let units: Vec<RawUnit> = CaptureReader::new(Cursor::new(bytes))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].timestamp_us, 42);
        assert_eq!(units[0].link_type, LinkType::RawIp);
        assert_eq!(units[0].data.as_ref(), b"raw ip bytes");
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let mut bytes = legacy_pcap(&[(0, b"complete"), (0, b"cut short")]);
        bytes.truncate(bytes.len() - 4);
        let mut reader = CaptureReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next_unit().unwrap().is_some());
        assert!(reader.next_unit().is_err());
    }

    #[test]
    fn test_interface_resolution() {
        let micro = Interface::new(1, 6, 0);
        assert_eq!(micro.timestamp_us(0, 1_500_000), 1_500_000);
        let nano = Interface::new(1, 9, 0);
        assert_eq!(nano.timestamp_us(0, 1_500_000), 1_500);
        let binary = Interface::new(1, 0x80 | 10, 1);
        assert_eq!(binary.timestamp_us(0, 1024), 2_000_000);
    }

    #[test]
    fn test_replay_keeps_counts_after_read_error() {
        let mut bytes = legacy_pcap(&[(1, b"a"), (2, b"b"), (3, b"c")]);
        bytes.truncate(bytes.len() - 1);
        let mut reader = CaptureReader::new(Cursor::new(bytes)).unwrap();
        let (pipeline, _events) = Pipeline::with_defaults();
        let mut replay = Replay::new(ReplayOptions {
            throttle: None,
            ..Default::default()
        });
        assert!(replay.run(&mut reader, &pipeline, &CancellationToken::new()).is_err());
        assert_eq!(replay.stats().accepted, 2);
    }

    #[test]
    fn test_replay_respects_limit() {
        let bytes = legacy_pcap(&[(1, b"a"), (2, b"b"), (3, b"c")]);
        let mut reader = CaptureReader::new(Cursor::new(bytes)).unwrap();
        let (pipeline, _events) = Pipeline::with_defaults();
        let options = ReplayOptions {
            throttle: None,
            limit: Some(2),
            ..Default::default()
        };
        let stats = replay(&mut reader, &pipeline, &options, &CancellationToken::new()).unwrap();
        assert_eq!(
            stats,
            ReplayStats {
                records: 2,
                accepted: 2,
                dropped: 0
            }
        );
    }
}
