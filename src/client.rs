//! Typed wrappers over the server's RPC methods.
//!
//! Results arrive as loosely typed MessagePack values. Each one goes through
//! a serde struct or an explicit accessor before anything else sees it, so a
//! malformed result becomes `RequestError::InvalidResult` for that call only.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rmpv::Value;
use serde::Deserialize;

use crate::error::{ProtocolError, RequestError};
use crate::protocol::Protocol;
use crate::types::PtyId;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attached_client_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PtyInfo {
    pub id: PtyId,
    #[serde(default)]
    pub rows: u16,
    #[serde(default)]
    pub cols: u16,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub attached_client_count: u32,
}

impl From<PtyInfo> for SessionInfo {
    fn from(p: PtyInfo) -> Self {
        let name = if p.title.is_empty() { format!("pty {}", p.id) } else { p.title };
        SessionInfo { id: p.id, name, attached_client_count: p.attached_client_count }
    }
}

#[derive(Debug, Deserialize)]
struct SessionList {
    #[serde(default)]
    sessions: Vec<SessionInfo>,
}

#[derive(Debug, Deserialize)]
struct PtyList {
    #[serde(default)]
    ptys: Vec<PtyInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub rows: u16,
    pub cols: u16,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub attach: bool,
    pub env: BTreeMap<String, String>,
    pub macos_option_as_alt: bool,
}

impl SpawnOptions {
    /// Wire map; optional fields are left out rather than sent as nil.
    pub fn to_value(&self) -> Value {
        let mut m = vec![
            (Value::from("rows"), Value::from(self.rows)),
            (Value::from("cols"), Value::from(self.cols)),
        ];
        if let Some(shell) = &self.shell { m.push((Value::from("shell"), Value::from(shell.as_str()))); }
        if let Some(cwd) = &self.cwd { m.push((Value::from("cwd"), Value::from(cwd.as_str()))); }
        m.push((Value::from("attach"), Value::Boolean(self.attach)));
        if !self.env.is_empty() {
            let env = self.env.iter().map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str()))).collect();
            m.push((Value::from("env"), Value::Map(env)));
        }
        m.push((Value::from("macos_option_as_alt"), Value::Boolean(self.macos_option_as_alt)));
        Value::Map(m)
    }
}

/// Where a roster came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterSource {
    Sessions,
    /// `list_sessions` was unsupported or empty; entries are bare PTYs.
    LegacyPtys,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub source: RosterSource,
    pub entries: Vec<SessionInfo>,
}

fn invalid(method: &str, reason: impl ToString) -> RequestError {
    RequestError::InvalidResult { method: method.to_string(), reason: reason.to_string() }
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, v: Value) -> Result<T, RequestError> {
    rmpv::ext::from_value(v).map_err(|e| invalid(method, e))
}

/// A pty id is either the bare integer or a map carrying `id` / `pty_id`.
fn pty_id_from(method: &str, v: &Value) -> Result<PtyId, RequestError> {
    if let Some(id) = v.as_u64() { return Ok(id); }
    if let Value::Map(entries) = v {
        for (k, val) in entries {
            if matches!(k.as_str(), Some("id") | Some("pty_id")) {
                if let Some(id) = val.as_u64() { return Ok(id); }
            }
        }
    }
    Err(invalid(method, format!("expected pty id, got {v}")))
}

/// Cheap handle shared by the event loop and the tasks awaiting replies.
/// The protocol is only borrowed while a request is being queued, never
/// across an await.
#[derive(Clone)]
pub struct Client {
    proto: Rc<RefCell<Protocol>>,
}

impl Client {
    pub fn new(proto: Rc<RefCell<Protocol>>) -> Self { Self { proto } }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RequestError> {
        let reply = self.proto.borrow_mut().request(method, Value::Array(params));
        reply.await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, RequestError> {
        let v = self.call("list_sessions", vec![]).await?;
        let list: SessionList = decode("list_sessions", v)?;
        Ok(list.sessions)
    }

    pub async fn list_ptys(&self) -> Result<Vec<PtyInfo>, RequestError> {
        let v = self.call("list_ptys", vec![]).await?;
        let list: PtyList = decode("list_ptys", v)?;
        Ok(list.ptys)
    }

    /// `list_sessions`, falling back to `list_ptys` when the server does not
    /// know the method or has no sessions to report.
    pub async fn fetch_roster(&self) -> Result<Roster, RequestError> {
        match self.list_sessions().await {
            Ok(sessions) if !sessions.is_empty() => {
                return Ok(Roster { source: RosterSource::Sessions, entries: sessions });
            }
            Ok(_) => log::debug!("list_sessions returned nothing, trying list_ptys"),
            Err(RequestError::Rpc(e)) if e.is_unsupported_method() => log::debug!("server has no list_sessions, using list_ptys"),
            Err(RequestError::Rpc(e)) => log::warn!("list_sessions failed ({e}), trying list_ptys"),
            Err(e) => return Err(e),
        }
        let ptys = self.list_ptys().await?;
        Ok(Roster { source: RosterSource::LegacyPtys, entries: ptys.into_iter().map(SessionInfo::from).collect() })
    }

    pub async fn spawn_pty(&self, opts: &SpawnOptions) -> Result<PtyId, RequestError> {
        let v = self.call("spawn_pty", vec![opts.to_value()]).await?;
        pty_id_from("spawn_pty", &v)
    }

    pub async fn attach_pty(&self, pty: PtyId, macos_option_as_alt: bool) -> Result<(), RequestError> {
        self.call("attach_pty", vec![Value::from(pty), Value::Boolean(macos_option_as_alt)]).await?;
        Ok(())
    }

    pub async fn resize_pty(&self, pty: PtyId, rows: u16, cols: u16) -> Result<(), RequestError> {
        self.call("resize_pty", vec![Value::from(pty), Value::from(rows), Value::from(cols)]).await?;
        Ok(())
    }

    /// Keystrokes are a notification: no reply, nothing to time out.
    pub fn write_pty(&self, pty: PtyId, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.proto.borrow_mut().notify("write_pty", Value::Array(vec![Value::from(pty), Value::Binary(bytes.to_vec())]))
    }

    pub async fn detach_pty(&self, pty: PtyId) -> Result<(), RequestError> {
        self.call("detach_pty", vec![Value::from(pty)]).await?;
        Ok(())
    }

    pub async fn detach_ptys(&self, ptys: &[PtyId]) -> Result<(), RequestError> {
        let ids = ptys.iter().map(|&p| Value::from(p)).collect();
        self.call("detach_ptys", vec![Value::Array(ids)]).await?;
        Ok(())
    }

    pub async fn close_pty(&self, pty: PtyId) -> Result<(), RequestError> {
        self.call("close_pty", vec![Value::from(pty)]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Decoder, Message, DEFAULT_REQUEST_TIMEOUT};
    use tokio::sync::mpsc;

    fn client() -> (Client, Rc<RefCell<Protocol>>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let proto = Rc::new(RefCell::new(Protocol::new(tx, DEFAULT_REQUEST_TIMEOUT)));
        (Client::new(proto.clone()), proto, rx)
    }

    fn map(pairs: Vec<(&str, Value)>) -> Value {
        Value::Map(pairs.into_iter().map(|(k, v)| (Value::from(k), v)).collect())
    }

    /// Answer the next request on the wire with `error` / `result`.
    async fn answer(
        proto: &Rc<RefCell<Protocol>>,
        wire: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        expect_method: &str,
        error: Value,
        result: Value,
    ) -> Value {
        let bytes = wire.recv().await.unwrap();
        let Message::Request { id, method, params } = Decoder::new().decode(&bytes).pop().unwrap().unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(method, expect_method);
        let resp = Message::Response { id, error, result }.encode().unwrap();
        proto.borrow_mut().feed(&resp);
        params
    }

    #[tokio::test]
    async fn roster_uses_sessions_when_present() {
        let (c, proto, mut wire) = client();
        let local = tokio::task::LocalSet::new();
        local.run_until(async move {
            let task = tokio::task::spawn_local(async move { c.fetch_roster().await });
            answer(&proto, &mut wire, "list_sessions", Value::Nil, map(vec![
                ("sessions", Value::Array(vec![map(vec![
                    ("id", Value::from(1)),
                    ("name", Value::from("main")),
                    ("attached_client_count", Value::from(2)),
                    ("created_at", Value::from(12345)),
                ])])),
            ])).await;
            let roster = task.await.unwrap().unwrap();
            assert_eq!(roster.source, RosterSource::Sessions);
            assert_eq!(roster.entries, vec![SessionInfo { id: 1, name: "main".into(), attached_client_count: 2 }]);
        }).await;
    }

    #[tokio::test]
    async fn roster_falls_back_to_ptys() {
        let (c, proto, mut wire) = client();
        let local = tokio::task::LocalSet::new();
        local.run_until(async move {
            let task = tokio::task::spawn_local(async move { c.fetch_roster().await });
            answer(&proto, &mut wire, "list_sessions", Value::from("unknown method"), Value::Nil).await;
            answer(&proto, &mut wire, "list_ptys", Value::Nil, map(vec![
                ("ptys", Value::Array(vec![
                    map(vec![("id", Value::from(4)), ("rows", Value::from(24)), ("cols", Value::from(80)), ("title", Value::from("vim"))]),
                    map(vec![("id", Value::from(5))]),
                ])),
            ])).await;
            let roster = task.await.unwrap().unwrap();
            assert_eq!(roster.source, RosterSource::LegacyPtys);
            assert_eq!(roster.entries[0].name, "vim");
            assert_eq!(roster.entries[1].name, "pty 5");
        }).await;
    }

    #[tokio::test]
    async fn spawn_sends_options_and_validates_result() {
        let (c, proto, mut wire) = client();
        let local = tokio::task::LocalSet::new();
        local.run_until(async move {
            let c2 = c.clone();
            let opts = SpawnOptions { rows: 24, cols: 80, attach: true, shell: Some("/bin/sh".into()), ..Default::default() };
            let task = tokio::task::spawn_local(async move { c2.spawn_pty(&opts).await });
            let params = answer(&proto, &mut wire, "spawn_pty", Value::Nil, map(vec![("pty_id", Value::from(17))])).await;
            assert_eq!(task.await.unwrap().unwrap(), 17);
            let Value::Array(items) = params else { panic!("params not an array") };
            let opts = items[0].as_map().unwrap();
            assert!(opts.iter().any(|(k, v)| k.as_str() == Some("shell") && v.as_str() == Some("/bin/sh")));
            assert!(!opts.iter().any(|(k, _)| k.as_str() == Some("cwd")));

            let task = tokio::task::spawn_local(async move { c.spawn_pty(&SpawnOptions::default()).await });
            answer(&proto, &mut wire, "spawn_pty", Value::Nil, Value::from("nope")).await;
            assert!(matches!(task.await.unwrap(), Err(RequestError::InvalidResult { .. })));
        }).await;
    }

    #[tokio::test]
    async fn write_pty_is_a_notification() {
        let (c, proto, mut wire) = client();
        c.write_pty(3, b"ls\r").unwrap();
        assert_eq!(proto.borrow().outstanding(), 0);
        let bytes = wire.recv().await.unwrap();
        let msg = Decoder::new().decode(&bytes).pop().unwrap().unwrap();
        assert_eq!(msg, Message::Notification {
            method: "write_pty".into(),
            params: Value::Array(vec![Value::from(3), Value::Binary(b"ls\r".to_vec())]),
        });
    }
}
