//! HTTP/1.x session handler.
//!
//! Requests yield host names, user agents, Basic credentials and form
//! posts. Response bodies become files through a [`FileAssembler`], framed
//! by Content-Length, chunked coding, or connection close.

use std::collections::{HashMap, VecDeque};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use httparse::{Request, Response, Status, EMPTY_HEADER};

use super::{SessionContext, SessionHandler};
use crate::error::HandlerError;
use crate::event::{Event, Message};
use crate::file::{
    sanitize_filename, AssemblerKey, ChunkDecoder, ContentEncoding, FileAssembler, FileMetadata,
    Framing,
};
use crate::protocol::ApplicationProtocol;
use crate::stream::{ConnectionKey, Direction, SessionInfo, StreamWindow};

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 64;

/// Form bodies larger than this are skipped, not reported.
const MAX_FORM_BODY: usize = 64 * 1024;

/// Requests remembered per connection while waiting for responses.
const MAX_PENDING_REQUESTS: usize = 32;

#[derive(Debug, Clone)]
struct RequestInfo {
    method: String,
    uri: String,
    host: Option<String>,
}

#[derive(Debug)]
enum BodyFraming {
    Known(u64),
    Chunked(ChunkDecoder),
}

/// Request body being skipped (or collected, for form posts).
#[derive(Debug)]
struct RequestBody {
    framing: BodyFraming,
    uri: String,
    form: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct HttpFlow {
    requests: VecDeque<RequestInfo>,
    request_body: Option<RequestBody>,
    /// A response body assembler is registered for this connection.
    response_active: bool,
}

/// Session handler for HTTP/1.0 and HTTP/1.1.
#[derive(Debug, Default)]
pub struct HttpHandler {
    flows: HashMap<ConnectionKey, HttpFlow>,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn flow(&mut self, session: &SessionInfo) -> &mut HttpFlow {
        self.flows
            .entry(ConnectionKey::new(session.client, session.server))
            .or_default()
    }

    fn extract_request(&mut self, ctx: &mut SessionContext<'_>, data: &[u8]) -> Result<usize, HandlerError> {
        let flow = self.flow(&ctx.session);
        if let Some(body) = flow.request_body.as_mut() {
            let (consumed, done) = advance_body(body, data)?;
            if done {
                if let Some(body) = flow.request_body.take() {
                    report_form(ctx, body);
                }
            }
            return Ok(consumed);
        }

        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut request = Request::new(&mut headers);
        let header_len = match request.parse(data) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => return Ok(0),
            Err(e) => return Err(HandlerError::malformed("http", e.to_string())),
        };

        let method = request.method.unwrap_or("GET").to_string();
        let uri = request.path.unwrap_or("/").to_string();
        let mut host = None;
        let mut content_length = None;
        let mut chunked = false;
        let mut form = false;

        for header in request.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            match header.name.to_ascii_lowercase().as_str() {
                "host" => {
                    let name = value.rsplit_once(':').map_or(&*value, |(h, _)| h).to_string();
                    ctx.server.lock().add_hostname(&name);
                    host = Some(name);
                }
                "user-agent" => ctx.client.lock().set_detail("User-Agent", value.to_string()),
                "authorization" => {
                    if let Some((user, pass)) = basic_credentials(&value) {
                        ctx.credential(user, Some(pass), false);
                    }
                }
                "content-length" => content_length = value.trim().parse::<u64>().ok(),
                "transfer-encoding" => chunked = value.to_ascii_lowercase().contains("chunked"),
                "content-type" => {
                    form = value
                        .to_ascii_lowercase()
                        .starts_with("application/x-www-form-urlencoded")
                }
                _ => {}
            }
        }

        ctx.confirm(ApplicationProtocol::Http);
        let flow = self.flow(&ctx.session);
        if flow.requests.len() >= MAX_PENDING_REQUESTS {
            flow.requests.pop_front();
        }
        flow.requests.push_back(RequestInfo {
            method,
            uri: uri.clone(),
            host,
        });

        let framing = if chunked {
            Some(BodyFraming::Chunked(ChunkDecoder::new()))
        } else {
            content_length.filter(|n| *n > 0).map(BodyFraming::Known)
        };
        if let Some(framing) = framing {
            let collect = form && content_length.is_some_and(|n| n as usize <= MAX_FORM_BODY);
            flow.request_body = Some(RequestBody {
                framing,
                uri,
                form: collect.then(Vec::new),
            });
        }
        Ok(header_len)
    }

    fn extract_response(&mut self, ctx: &mut SessionContext<'_>, data: &[u8]) -> Result<usize, HandlerError> {
        let key = AssemblerKey::new(ctx.session.client, ctx.session.server, ApplicationProtocol::Http);

        if self.flow(&ctx.session).response_active {
            return self.feed_body(ctx, &key, data);
        }

        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut response = Response::new(&mut headers);
        let header_len = match response.parse(data) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => return Ok(0),
            Err(e) => return Err(HandlerError::malformed("http", e.to_string())),
        };
        let status = response.code.unwrap_or(0);

        let mut content_length = None;
        let mut chunked = false;
        let mut encoding = ContentEncoding::Identity;
        let mut content_type = None;
        for header in response.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            match header.name.to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse::<u64>().ok(),
                "transfer-encoding" => chunked = value.to_ascii_lowercase().contains("chunked"),
                "content-encoding" => encoding = ContentEncoding::from_header(&value),
                "content-type" => content_type = Some(value.to_string()),
                "server" => {
                    let mut server = ctx.server.lock();
                    server.set_detail("Server", value.to_string());
                    let service = server.service_mut(ctx.session.server.port());
                    service.protocol = Some(ApplicationProtocol::Http);
                    service.attributes.insert("banner".into(), value.to_string());
                }
                _ => {}
            }
        }
        ctx.confirm(ApplicationProtocol::Http);

        // Interim responses answer no request
        if (100..200).contains(&status) {
            return Ok(header_len);
        }
        let request = self.flow(&ctx.session).requests.pop_front();
        let head = request.as_ref().is_some_and(|r| r.method.eq_ignore_ascii_case("HEAD"));
        if head || status == 204 || status == 304 {
            return Ok(header_len);
        }

        let framing = if chunked {
            Framing::Chunked
        } else {
            match content_length {
                Some(0) => return Ok(header_len),
                Some(n) => Framing::Known(n),
                None => Framing::UntilClose,
            }
        };

        let uri = request.as_ref().map_or("/", |r| r.uri.as_str());
        let filename = filename_from_uri(uri);
        let server = ctx.session.server;
        let metadata = FileMetadata {
            source: server,
            destination: ctx.session.client,
            protocol: ApplicationProtocol::Http,
            path_hint: format!("{}/TCP-{}/{}", server.ip(), server.port(), filename),
            filename,
            details: match (&request, content_type) {
                (Some(r), Some(ct)) => format!("{} {}{} ({ct})", r.method, r.host.as_deref().unwrap_or(""), r.uri),
                (Some(r), None) => format!("{} {}{}", r.method, r.host.as_deref().unwrap_or(""), r.uri),
                (None, _) => format!("HTTP {status}"),
            },
            frame: ctx.frame.number(),
            timestamp_us: ctx.timestamp_us(),
        };
        let mut assembler = FileAssembler::new(metadata, framing)
            .with_encoding(encoding)
            .with_max_size(ctx.max_file_size);
        assembler.activate()?;
        ctx.assemblers.insert(key, assembler);
        self.flow(&ctx.session).response_active = true;
        Ok(header_len)
    }

    fn feed_body(
        &mut self,
        ctx: &mut SessionContext<'_>,
        key: &AssemblerKey,
        data: &[u8],
    ) -> Result<usize, HandlerError> {
        let result = ctx.assemblers.with_mut(key, |a| a.add_data(data).map(|n| (n, a.is_finished())));
        let flow = self.flow(&ctx.session);
        match result {
            None => {
                flow.response_active = false;
                Err(HandlerError::malformed("http", "response body assembler was evicted"))
            }
            Some(Err(e)) => {
                flow.response_active = false;
                ctx.assemblers.remove(key);
                Err(e.into())
            }
            Some(Ok((consumed, finished))) => {
                if finished {
                    flow.response_active = false;
                    if let Some(file) = ctx.assemblers.take_finished(key) {
                        ctx.file_finished(file);
                    }
                }
                Ok(consumed)
            }
        }
    }
}

impl SessionHandler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Http
    }

    fn max_window_segments(&self) -> usize {
        32
    }

    fn extract(&mut self, ctx: &mut SessionContext<'_>, window: &StreamWindow) -> Result<usize, HandlerError> {
        if window.is_empty() {
            return Ok(0);
        }
        let data = window.materialize();
        match ctx.direction {
            Direction::ToServer => self.extract_request(ctx, &data),
            Direction::ToClient => self.extract_response(ctx, &data),
        }
    }

    fn session_closed(&mut self, session: &SessionInfo) {
        self.flows.remove(&ConnectionKey::new(session.client, session.server));
    }

    fn reset(&mut self) {
        self.flows.clear();
    }
}

/// Consume request body bytes. Returns (consumed, body complete).
fn advance_body(body: &mut RequestBody, data: &[u8]) -> Result<(usize, bool), HandlerError> {
    match &mut body.framing {
        BodyFraming::Known(remaining) => {
            let take = (*remaining).min(data.len() as u64) as usize;
            if let Some(form) = body.form.as_mut() {
                form.extend_from_slice(&data[..take]);
            }
            *remaining -= take as u64;
            Ok((take, *remaining == 0))
        }
        BodyFraming::Chunked(decoder) => {
            let mut decoded = Vec::new();
            let consumed = decoder.push(data, &mut decoded)?;
            Ok((consumed, decoder.is_done()))
        }
    }
}

fn report_form(ctx: &mut SessionContext<'_>, body: RequestBody) {
    let Some(raw) = body.form else {
        return;
    };
    let text = String::from_utf8_lossy(&raw).into_owned();
    let attributes: Vec<(String, String)> = text
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(k), url_decode(v))
        })
        .collect();
    ctx.emit(Event::MessageObserved(Message {
        protocol: Some(ApplicationProtocol::Http),
        source: Some(ctx.session.client),
        destination: Some(ctx.session.server),
        subject: format!("POST {}", body.uri),
        body: text,
        attributes,
        ..Message::default()
    }));
}

/// `user:password` from an `Authorization: Basic ...` value.
fn basic_credentials(value: &str) -> Option<(String, String)> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(token.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Last path segment of a request target, or `index.html`.
fn filename_from_uri(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let name = path.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "index.html".to_string()
    } else {
        sanitize_filename(&url_decode(name))
    }
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let hex = |b: u8| (b as char).to_digit(16).map(|d| d as u8);
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
