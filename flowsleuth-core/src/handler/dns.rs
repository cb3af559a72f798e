//! DNS frame handler.
//!
//! Parses answers out of UDP responses from port 53. Each answer becomes a
//! `DnsRecordObserved` event; A and AAAA answers also name the matching
//! host, if it has been seen.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{FrameContext, FrameHandler};
use crate::error::HandlerError;
use crate::event::{DnsRecord, Event};
use crate::frame::Frame;
use crate::protocol::ApplicationProtocol;

/// DNS well-known port.
pub const DNS_PORT: u16 = 53;

const HEADER_LEN: usize = 12;

/// Compression pointers followed before a name is rejected.
const MAX_POINTERS: usize = 16;

/// DNS record types.
pub mod record_type {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
}

/// Frame handler for DNS over UDP.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsHandler;

impl DnsHandler {
    pub fn new() -> Self {
        Self
    }
}

impl FrameHandler for DnsHandler {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Dns
    }

    fn accepts(&self, frame: &Frame) -> bool {
        frame.udp().is_some_and(|udp| udp.source_port == DNS_PORT) && frame.payload().is_some()
    }

    fn extract(&mut self, ctx: &mut FrameContext<'_>) -> Result<(), HandlerError> {
        let Some(payload) = ctx.frame.payload() else {
            return Ok(());
        };
        let Some((server, client)) = ctx.frame.ip_endpoints() else {
            return Ok(());
        };
        let answers = parse_response(payload.bytes()).map_err(|e| HandlerError::malformed("dns", e))?;

        for answer in answers {
            if let Ok(addr) = answer.data.parse::<IpAddr>() {
                if let Some(host) = ctx.hosts.get(&addr) {
                    host.lock().add_hostname(&answer.name);
                }
            }
            ctx.emit(Event::DnsRecordObserved(DnsRecord {
                query: answer.name,
                answer: answer.data,
                record_type: answer.record_type,
                client,
                server,
                transaction_id: answer.transaction_id,
                ttl: answer.ttl,
                frame: ctx.frame.number(),
            }));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Answer {
    transaction_id: u16,
    name: String,
    record_type: u16,
    ttl: u32,
    data: String,
}

fn be16(msg: &[u8], at: usize) -> Result<u16, String> {
    msg.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| "truncated message".to_string())
}

fn be32(msg: &[u8], at: usize) -> Result<u32, String> {
    msg.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| "truncated message".to_string())
}

/// Answers of a response. Queries yield nothing.
fn parse_response(msg: &[u8]) -> Result<Vec<Answer>, String> {
    if msg.len() < HEADER_LEN {
        return Err("DNS header too short".to_string());
    }
    let transaction_id = be16(msg, 0)?;
    let flags = be16(msg, 2)?;
    if flags & 0x8000 == 0 {
        return Ok(Vec::new());
    }
    let questions = be16(msg, 4)?;
    let answers = be16(msg, 6)?;

    let mut pos = HEADER_LEN;
    for _ in 0..questions {
        let (_, next) = read_name(msg, pos)?;
        pos = next + 4;
    }

    let mut out = Vec::with_capacity(answers as usize);
    for _ in 0..answers {
        let (name, next) = read_name(msg, pos)?;
        let record_type = be16(msg, next)?;
        let ttl = be32(msg, next + 4)?;
        let rdlength = be16(msg, next + 8)? as usize;
        let rdata_start = next + 10;
        let rdata = msg
            .get(rdata_start..rdata_start + rdlength)
            .ok_or_else(|| "record data past end of message".to_string())?;
        let data = render_rdata(msg, record_type, rdata, rdata_start)?;
        out.push(Answer {
            transaction_id,
            name,
            record_type,
            ttl,
            data,
        });
        pos = rdata_start + rdlength;
    }
    Ok(out)
}

fn render_rdata(msg: &[u8], record_type: u16, rdata: &[u8], start: usize) -> Result<String, String> {
    Ok(match record_type {
        record_type::A if rdata.len() == 4 => Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string(),
        record_type::AAAA if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Ipv6Addr::from(octets).to_string()
        }
        record_type::CNAME | record_type::NS | record_type::PTR => read_name(msg, start)?.0,
        record_type::MX if rdata.len() > 2 => read_name(msg, start + 2)?.0,
        record_type::TXT => {
            let mut text = String::new();
            let mut i = 0;
            while i < rdata.len() {
                let len = rdata[i] as usize;
                let end = (i + 1 + len).min(rdata.len());
                text.push_str(&String::from_utf8_lossy(&rdata[i + 1..end]));
                i = end;
            }
            text
        }
        _ => format!("{} bytes", rdata.len()),
    })
}

/// Decode a possibly compressed name at `pos`. Returns the name and the
/// offset just past it in the original position.
fn read_name(msg: &[u8], mut pos: usize) -> Result<(String, usize), String> {
    let mut labels: Vec<String> = Vec::with_capacity(4);
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos).ok_or("name past end of message")? as usize;
        if len == 0 {
            end.get_or_insert(pos + 1);
            break;
        }
        if len & 0xC0 == 0xC0 {
            let pointer = (be16(msg, pos)? & 0x3FFF) as usize;
            end.get_or_insert(pos + 2);
            jumps += 1;
            if jumps > MAX_POINTERS {
                return Err("compression loop".to_string());
            }
            pos = pointer;
            continue;
        }
        if len > 63 {
            return Err(format!("invalid label length: {len}"));
        }
        let label = msg
            .get(pos + 1..pos + 1 + len)
            .ok_or("label past end of message")?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        labels.join(".")
    };
    Ok((name, end.unwrap_or(pos)))
}
