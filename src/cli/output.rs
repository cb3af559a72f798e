//! Event and summary formatting.
//!
//! Events print as one line each: timestamp, kind, then a kind-specific
//! rendering. The end-of-run summary is a host table plus per-kind counts.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Write};
use std::net::SocketAddr;

use chrono::DateTime;
use comfy_table::{Cell, Table};
use flowsleuth_core::{Event, Host};

use super::EventKind;
use crate::capture::ReplayStats;

/// Maps an event to its printable kind.
pub fn event_kind(event: &Event) -> EventKind {
    match event {
        Event::FrameObserved(_) => EventKind::Frame,
        Event::HostObserved(_) => EventKind::Host,
        Event::SessionObserved { .. } => EventKind::Session,
        Event::FileReconstructed { .. } => EventKind::File,
        Event::CredentialObserved(_) => EventKind::Credential,
        Event::DnsRecordObserved(_) => EventKind::Dns,
        Event::MessageObserved(_) => EventKind::Message,
        Event::AnomalyRaised { .. } => EventKind::Anomaly,
        Event::BufferUsageChanged { .. } => EventKind::Buffer,
        Event::CleartextWordsFound { .. } => EventKind::Cleartext,
    }
}

/// UTC timestamp with microseconds, or the raw value if out of range.
pub fn format_timestamp(timestamp_us: i64) -> String {
    let secs = timestamp_us.div_euclid(1_000_000);
    let nanos = (timestamp_us.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
        .unwrap_or_else(|| format!("{timestamp_us}us"))
}

fn record_type(value: u16) -> String {
    match value {
        1 => "A".into(),
        2 => "NS".into(),
        5 => "CNAME".into(),
        12 => "PTR".into(),
        15 => "MX".into(),
        16 => "TXT".into(),
        28 => "AAAA".into(),
        33 => "SRV".into(),
        other => format!("TYPE{other}"),
    }
}

fn endpoint(address: Option<SocketAddr>) -> String {
    address.map_or_else(|| "?".to_string(), |a| a.to_string())
}

/// Timestamp and body of one event line. Events without a timestamp of
/// their own return `None` for it.
pub fn describe(event: &Event) -> (Option<i64>, String) {
    match event {
        Event::FrameObserved(frame) => (
            Some(frame.timestamp_us()),
            format!(
                "#{} {} bytes{}",
                frame.number(),
                frame.len(),
                if frame.errors().is_empty() { "" } else { " (malformed)" }
            ),
        ),
        Event::HostObserved(host) => (
            Some(host.first_seen_us()),
            format!("{host} first seen in frame {}", host.first_seen_frame()),
        ),
        Event::SessionObserved {
            protocol,
            client,
            server,
            client_port,
            server_port,
            is_tcp,
            start_frame,
            start_time_us,
        } => (
            Some(*start_time_us),
            format!(
                "{protocol} {} {} -> {} from frame {start_frame}",
                if *is_tcp { "tcp" } else { "udp" },
                SocketAddr::new(*client, *client_port),
                SocketAddr::new(*server, *server_port),
            ),
        ),
        Event::FileReconstructed {
            source,
            destination,
            path,
            protocol,
            filename,
            size,
            timestamp_us,
            details,
        } => {
            let mut line = format!("{protocol} {source} -> {destination} {filename} ({size} bytes) at {path}");
            if !details.is_empty() {
                line.push_str(&format!(" [{details}]"));
            }
            (Some(*timestamp_us), line)
        }
        Event::CredentialObserved(credential) => (
            Some(credential.timestamp_us),
            format!(
                "{} {} -> {} user={:?} password={}{}",
                credential.protocol,
                credential.client,
                credential.server,
                credential.username,
                credential
                    .password
                    .as_deref()
                    .map_or_else(|| "-".to_string(), |p| format!("{p:?}")),
                if credential.proven_valid { " (valid)" } else { "" }
            ),
        ),
        Event::DnsRecordObserved(record) => (
            None,
            format!(
                "{} {} {} ttl={} ({} -> {}, frame {})",
                record.query,
                record_type(record.record_type),
                record.answer,
                record.ttl,
                record.server,
                record.client,
                record.frame
            ),
        ),
        Event::MessageObserved(message) => (
            None,
            format!(
                "{} {} -> {} from={:?} to={:?} subject={:?} ({} bytes)",
                message
                    .protocol
                    .map_or_else(|| "?".to_string(), |p| p.to_string()),
                endpoint(message.source),
                endpoint(message.destination),
                message.from,
                message.to,
                message.subject,
                message.body.len()
            ),
        ),
        Event::AnomalyRaised {
            message,
            timestamp_us,
        } => (Some(*timestamp_us), message.clone()),
        Event::BufferUsageChanged { percent } => (None, format!("intake {percent}%")),
        Event::CleartextWordsFound {
            words,
            frame,
            timestamp_us,
        } => (
            Some(*timestamp_us),
            format!("frame {frame}: {}", words.join(", ")),
        ),
    }
}

/// Prints the selected event kinds and counts every event.
#[derive(Debug, Default)]
pub struct EventPrinter {
    shown: HashSet<EventKind>,
    counts: BTreeMap<&'static str, u64>,
}

impl EventPrinter {
    pub fn new(shown: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            shown: shown.into_iter().collect(),
            counts: BTreeMap::new(),
        }
    }

    /// Count `event` and write it if its kind is shown.
    pub fn record<W: Write>(&mut self, event: &Event, writer: &mut W) -> io::Result<()> {
        *self.counts.entry(event.kind()).or_default() += 1;
        if !self.shown.contains(&event_kind(event)) {
            return Ok(());
        }
        let (timestamp_us, body) = describe(event);
        let timestamp = timestamp_us.map_or_else(|| "-".to_string(), format_timestamp);
        writeln!(writer, "{timestamp:<26} {:<10} {body}", event.kind())
    }

    /// Events seen per kind.
    pub fn counts(&self) -> &BTreeMap<&'static str, u64> {
        &self.counts
    }
}

/// Host table plus totals, written after the capture is exhausted.
pub fn write_summary<W: Write>(
    writer: &mut W,
    hosts: &[Host],
    counts: &BTreeMap<&'static str, u64>,
    replay: &ReplayStats,
) -> io::Result<()> {
    if !hosts.is_empty() {
        let mut table = Table::new();
        table.set_header(vec![
            Cell::new("Host"),
            Cell::new("MAC"),
            Cell::new("Names"),
            Cell::new("OS guess"),
            Cell::new("Open TCP"),
            Cell::new("Packets out/in"),
            Cell::new("Bytes out/in"),
        ]);
        for host in hosts {
            let ports: Vec<String> = host.open_tcp_ports().map(|p| p.to_string()).collect();
            let names: Vec<&str> = host.hostnames().collect();
            table.add_row(vec![
                Cell::new(host.address()),
                Cell::new(host.mac().map_or_else(String::new, |m| m.to_string())),
                Cell::new(names.join(", ")),
                Cell::new(host.best_os_guess().map_or("", |(os, _)| os)),
                Cell::new(ports.join(", ")),
                Cell::new(format!("{}/{}", host.packets_sent, host.packets_received)),
                Cell::new(format!("{}/{}", host.bytes_sent, host.bytes_received)),
            ]);
        }
        writeln!(writer, "{table}")?;
    }

    writeln!(
        writer,
        "{} records read, {} accepted, {} dropped",
        replay.records, replay.accepted, replay.dropped
    )?;
    let totals: Vec<String> = counts
        .iter()
        .filter(|(kind, _)| **kind != "buffer")
        .map(|(kind, n)| format!("{kind}: {n}"))
        .collect();
    if !totals.is_empty() {
        writeln!(writer, "{}", totals.join(", "))?;
    }
    Ok(())
}
