//! MessagePack-RPC framing, request correlation and notification dispatch.
//!
//! Wire shapes:
//!   Request      `[0, id, method, params]`
//!   Response     `[1, id, error, result]`
//!   Notification `[2, method, params]`
//!
//! Messages follow each other with no outer length prefix, so the decoder
//! keeps whatever tail of the stream does not yet form a complete value and
//! retries once more bytes arrive.
//!
//! `Protocol` owns no socket. Encoded bytes go to an outbound channel drained
//! by the writer task and inbound bytes are handed to [`Protocol::feed`] by the
//! single event loop, which is also the only caller of [`Protocol::expire`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rmpv::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{ProtocolError, RequestError, RpcError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const TYPE_REQUEST: u64 = 0;
const TYPE_RESPONSE: u64 = 1;
const TYPE_NOTIFICATION: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { id: u64, method: String, params: Value },
    Response { id: u64, error: Value, result: Value },
    Notification { method: String, params: Value },
}

impl Message {
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { id, method, params } => Value::Array(vec![
                Value::from(TYPE_REQUEST), Value::from(*id), Value::from(method.as_str()), params.clone(),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                Value::from(TYPE_RESPONSE), Value::from(*id), error.clone(), result.clone(),
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(TYPE_NOTIFICATION), Value::from(method.as_str()), params.clone(),
            ]),
        }
    }

    /// Validate the positional shape of a decoded value. Trailing extra
    /// elements are tolerated.
    pub fn from_value(v: Value) -> Result<Message, ProtocolError> {
        let items = match v {
            Value::Array(items) => items,
            other => return Err(ProtocolError::Malformed(format!("expected array, got {other}"))),
        };
        let kind = items.first().and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::Malformed("missing message type".into()))?;
        let mut it = items.into_iter().skip(1);
        match kind {
            TYPE_REQUEST => {
                let id = next_id(&mut it)?;
                let method = next_method(&mut it)?;
                let params = it.next().unwrap_or(Value::Nil);
                Ok(Message::Request { id, method, params })
            }
            TYPE_RESPONSE => {
                let id = next_id(&mut it)?;
                let error = it.next().ok_or_else(|| ProtocolError::Malformed("response without error slot".into()))?;
                let result = it.next().ok_or_else(|| ProtocolError::Malformed("response without result slot".into()))?;
                Ok(Message::Response { id, error, result })
            }
            TYPE_NOTIFICATION => {
                let method = next_method(&mut it)?;
                let params = it.next().unwrap_or(Value::Nil);
                Ok(Message::Notification { method, params })
            }
            other => Err(ProtocolError::Malformed(format!("unknown message type {other}"))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())?;
        Ok(buf)
    }
}

fn next_id(it: &mut impl Iterator<Item = Value>) -> Result<u64, ProtocolError> {
    it.next().as_ref().and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Malformed("missing or non-integer id".into()))
}

fn next_method(it: &mut impl Iterator<Item = Value>) -> Result<String, ProtocolError> {
    it.next().as_ref().and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| ProtocolError::Malformed("missing method name".into()))
}

/// Incremental decoder for a stream of concatenated MessagePack values.
///
/// Headers are walked as bytes arrive and the walk resumes where it stopped,
/// so a large value delivered in many reads is scanned once. The value is
/// only built when its last byte is in.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
    /// Offset in `buf` up to which the leading value has been walked.
    scanned: usize,
    /// Items still owed by each open array or map.
    open: Vec<u64>,
}

enum Scan {
    Complete(usize),
    Partial,
}

impl Decoder {
    pub fn new() -> Self { Self::default() }

    /// Append `bytes` and pull out every complete message. A value cut off
    /// mid-way stays buffered; a complete value with the wrong shape comes
    /// back as an `Err` entry and decoding continues after it.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Result<Message, ProtocolError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut start = 0usize;
        while start < self.buf.len() {
            match self.scan() {
                Ok(Scan::Complete(end)) => {
                    let mut value = &self.buf[start..end];
                    out.push(match rmpv::decode::read_value(&mut value) {
                        Ok(v) => Message::from_value(v),
                        Err(e) => Err(ProtocolError::Malformed(e.to_string())),
                    });
                    start = end;
                }
                Ok(Scan::Partial) => break,
                Err(e) => {
                    // Not valid MessagePack at all: there is no boundary to resync on.
                    out.push(Err(e));
                    start = self.buf.len();
                    self.scanned = start;
                    self.open.clear();
                }
            }
        }
        self.buf.drain(..start);
        self.scanned -= start;
        out
    }

    /// Walk value headers from `scanned` until the leading value ends or the
    /// buffer runs out.
    fn scan(&mut self) -> Result<Scan, ProtocolError> {
        loop {
            let rest = &self.buf[self.scanned..];
            let Some((head, items, body)) = header(rest)? else { return Ok(Scan::Partial) };
            let total = head as u64 + body;
            if (rest.len() as u64) < total {
                return Ok(Scan::Partial);
            }
            self.scanned += total as usize;
            if items > 0 {
                self.open.push(items);
                continue;
            }
            loop {
                match self.open.last_mut() {
                    None => return Ok(Scan::Complete(self.scanned)),
                    Some(left) => {
                        *left -= 1;
                        if *left > 0 { break; }
                        self.open.pop();
                    }
                }
            }
        }
    }

    pub fn buffered(&self) -> usize { self.buf.len() }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.open.clear();
    }
}

/// Header length, child count and payload length of the value at the front
/// of `b`. `None` while the marker or its length bytes are still missing.
fn header(b: &[u8]) -> Result<Option<(usize, u64, u64)>, ProtocolError> {
    let Some(&m) = b.first() else { return Ok(None) };
    let int = |n: usize| b.get(1..1 + n).map(|s| s.iter().fold(0u64, |acc, &x| acc << 8 | u64::from(x)));
    let sized = |n: usize, extra: u64| int(n).map(|len| (1 + n, 0, len + extra));
    let counted = |n: usize, per: u64| int(n).map(|len| (1 + n, len * per, 0));
    let fixed = |total: usize| Some((total, 0u64, 0u64));
    Ok(match m {
        0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => fixed(1),
        0x80..=0x8f => Some((1, 2 * u64::from(m & 0x0f), 0)),
        0x90..=0x9f => Some((1, u64::from(m & 0x0f), 0)),
        0xa0..=0xbf => Some((1, 0, u64::from(m & 0x1f))),
        0xc1 => return Err(ProtocolError::Malformed("reserved marker 0xc1".into())),
        0xc4 | 0xd9 => sized(1, 0),
        0xc5 | 0xda => sized(2, 0),
        0xc6 | 0xdb => sized(4, 0),
        // ext: one type byte ahead of the data
        0xc7 => sized(1, 1),
        0xc8 => sized(2, 1),
        0xc9 => sized(4, 1),
        0xcc | 0xd0 => fixed(2),
        0xcd | 0xd1 => fixed(3),
        0xca | 0xce | 0xd2 => fixed(5),
        0xcb | 0xcf | 0xd3 => fixed(9),
        0xd4 => fixed(3),
        0xd5 => fixed(4),
        0xd6 => fixed(6),
        0xd7 => fixed(10),
        0xd8 => fixed(18),
        0xdc => counted(2, 1),
        0xdd => counted(4, 1),
        0xde => counted(2, 2),
        0xdf => counted(4, 2),
    })
}

type Outcome = Result<Value, RequestError>;

struct PendingRequest {
    method: String,
    timeout: Duration,
    deadline: Instant,
    tx: oneshot::Sender<Outcome>,
}

/// Completion handle for one outstanding request.
#[derive(Debug)]
pub struct Reply {
    id: u64,
    rx: oneshot::Receiver<Outcome>,
}

impl Reply {
    fn failed(id: u64, err: RequestError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Reply { id, rx }
    }

    pub fn id(&self) -> u64 { self.id }
}

impl Future for Reply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(Err(RequestError::Disconnected)))
    }
}

pub type Handler = Box<dyn FnMut(Value)>;

pub struct Protocol {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    handlers: HashMap<String, Handler>,
    decoder: Decoder,
    sink: mpsc::UnboundedSender<Vec<u8>>,
    default_timeout: Duration,
}

impl Protocol {
    pub fn new(sink: mpsc::UnboundedSender<Vec<u8>>, default_timeout: Duration) -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            handlers: HashMap::new(),
            decoder: Decoder::new(),
            sink,
            default_timeout,
        }
    }

    /// Assign the next id, register the pending entry and return the bytes
    /// to put on the wire together with the completion handle.
    pub fn encode_request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
        now: Instant,
    ) -> Result<(Vec<u8>, Reply), ProtocolError> {
        let id = self.next_id;
        let bytes = Message::Request { id, method: method.to_string(), params }.encode()?;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingRequest {
            method: method.to_string(),
            timeout,
            deadline: now + timeout,
            tx,
        });
        Ok((bytes, Reply { id, rx }))
    }

    pub fn request(&mut self, method: &str, params: Value) -> Reply {
        let timeout = self.default_timeout;
        self.request_with_timeout(method, params, timeout)
    }

    pub fn request_with_timeout(&mut self, method: &str, params: Value, timeout: Duration) -> Reply {
        match self.encode_request(method, params, timeout, Instant::now()) {
            Ok((bytes, reply)) => {
                log::trace!("-> request {} {}", reply.id, method);
                if self.sink.send(bytes).is_err() {
                    // Writer is gone; the reset on reconnect fails the entry.
                    log::warn!("request {} ({}) queued without a live writer", reply.id, method);
                }
                reply
            }
            Err(e) => Reply::failed(0, RequestError::Protocol(e)),
        }
    }

    /// Fire-and-forget: no id, nothing registered.
    pub fn notify(&mut self, method: &str, params: Value) -> Result<(), ProtocolError> {
        let bytes = Message::Notification { method: method.to_string(), params }.encode()?;
        if self.sink.send(bytes).is_err() {
            log::warn!("notification {} dropped, writer closed", method);
        }
        Ok(())
    }

    /// Register the handler for one notification method, replacing any
    /// previous one.
    pub fn on(&mut self, method: &str, handler: impl FnMut(Value) + 'static) {
        self.handlers.insert(method.to_string(), Box::new(handler));
    }

    /// Decode inbound bytes and dispatch every complete message. Returns the
    /// number of well-formed messages handled.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let mut handled = 0;
        for msg in self.decoder.decode(bytes) {
            match msg {
                Ok(m) => { handled += 1; self.dispatch(m); }
                Err(e) => log::warn!("dropping message: {e}"),
            }
        }
        handled
    }

    fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::Response { id, error, result } => {
                let Some(p) = self.pending.remove(&id) else {
                    log::debug!("stale or unknown response id {id}, dropped");
                    return;
                };
                let outcome = if error.is_nil() {
                    Ok(result)
                } else {
                    Err(RequestError::Rpc(RpcError::from_value(error)))
                };
                log::trace!("<- response {} {} ok={}", id, p.method, outcome.is_ok());
                let _ = p.tx.send(outcome);
            }
            Message::Notification { method, params } => match self.handlers.get_mut(&method) {
                Some(h) => h(params),
                None => log::debug!("no handler for notification '{method}'"),
            },
            Message::Request { id, method, .. } => {
                log::debug!("ignoring server-initiated request {id} ({method})");
            }
        }
    }

    /// Fail every pending request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let overdue: Vec<u64> = self.pending.iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &overdue {
            if let Some(p) = self.pending.remove(id) {
                log::warn!("request {} ({}) timed out after {:?}", id, p.method, p.timeout);
                let _ = p.tx.send(Err(RequestError::Timeout { method: p.method, id: *id, after: p.timeout }));
            }
        }
        overdue.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn outstanding(&self) -> usize { self.pending.len() }

    /// Start over on a fresh transport: every outstanding request fails with
    /// `Disconnected`, buffered partial input is discarded. Handlers survive.
    pub fn reset(&mut self, sink: mpsc::UnboundedSender<Vec<u8>>) {
        for (_, p) in self.pending.drain() {
            let _ = p.tx.send(Err(RequestError::Disconnected));
        }
        self.decoder.reset();
        self.sink = sink;
    }
}
