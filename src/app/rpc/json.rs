//! Line-delimited JSON-RPC over a forwarded TCP port.
//!
//! Handshake: the client sends `{"cmd": "initiate", "uid": -1}` for a new
//! session or `{"cmd": "continue", "uid": N}` to join one, and the server
//! answers `{"status": true, "uid": N}`. After that every request is
//! `{"id", "method", "params"}` and every reply `{"id", "result", "error"}`.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::app::error::AppError;
use crate::app::rpc::{Connection, RpcClient, RpcConnection, SessionId};

const TERMINATE_METHOD: &str = "closeSl4aSession";

#[derive(Debug, Serialize)]
struct Handshake<'a> {
    cmd: &'a str,
    uid: SessionId,
}

#[derive(Debug, Deserialize)]
struct HandshakeReply {
    status: bool,
    #[serde(default)]
    uid: Option<SessionId>,
}

#[derive(Debug, Deserialize)]
struct CallReply {
    id: u64,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

struct Channel {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Channel {
    fn send(&mut self, payload: &Value) -> std::io::Result<()> {
        let mut line = payload.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()
    }

    fn receive(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ));
        }
        Ok(line)
    }
}

pub struct JsonRpcConnection {
    uid: SessionId,
    channel: Mutex<Channel>,
    // Shut down without the channel lock, which a blocked call may hold.
    control: TcpStream,
    closed: AtomicBool,
    next_id: AtomicU64,
    trace_id: String,
}

impl RpcConnection for JsonRpcConnection {
    fn uid(&self) -> SessionId {
        self.uid
    }

    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| AppError::system("RPC channel lock poisoned", &self.trace_id))?;
        channel
            .send(&json!({ "id": id, "method": method, "params": params }))
            .map_err(|err| AppError::transient(format!("RPC send failed: {err}"), &self.trace_id))?;
        let line = channel
            .receive()
            .map_err(|err| AppError::transient(format!("RPC receive failed: {err}"), &self.trace_id))?;
        let reply: CallReply = serde_json::from_str(&line).map_err(|err| {
            AppError::protocol(format!("Malformed RPC reply to {method}: {err}"), &self.trace_id)
        })?;
        if reply.id != id {
            return Err(AppError::protocol(
                format!("RPC reply id {} does not match request id {id}", reply.id),
                &self.trace_id,
            ));
        }
        if !reply.error.is_null() {
            return Err(AppError::dependency(
                format!("RPC {method} failed: {}", reply.error),
                &self.trace_id,
            ));
        }
        Ok(reply.result)
    }

    fn terminate(&self) -> Result<(), AppError> {
        self.call(TERMINATE_METHOD, Vec::new()).map(|_| ())
    }

    fn close(&self) -> Result<(), AppError> {
        self.closed.store(true, Ordering::Relaxed);
        match self.control.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(AppError::system(
                format!("Failed to close RPC connection: {err}"),
                &self.trace_id,
            )),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// [`RpcClient`] that talks to the server through `127.0.0.1:<host port>`.
pub struct JsonRpcClient {
    host: String,
    connect_timeout: Duration,
    trace_id: String,
}

impl JsonRpcClient {
    pub fn new(connect_timeout: Duration, trace_id: &str) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            connect_timeout,
            trace_id: trace_id.to_string(),
        }
    }

    fn connect(&self, port: u16, cmd: &str, uid: SessionId) -> Result<JsonRpcConnection, AppError> {
        let addr: SocketAddr = format!("{}:{port}", self.host).parse().map_err(|err| {
            AppError::validation(format!("Invalid RPC address: {err}"), &self.trace_id)
        })?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|err| {
            AppError::transient(format!("RPC server unreachable on {addr}: {err}"), &self.trace_id)
        })?;
        stream.set_read_timeout(Some(self.connect_timeout)).ok();
        let clone = || {
            stream.try_clone().map_err(|err| {
                AppError::system(format!("Failed to clone RPC stream: {err}"), &self.trace_id)
            })
        };
        let writer = clone()?;
        let control = clone()?;
        let mut channel = Channel {
            reader: BufReader::new(stream),
            writer,
        };

        let handshake = serde_json::to_value(Handshake { cmd, uid }).map_err(|err| {
            AppError::system(format!("Failed to encode handshake: {err}"), &self.trace_id)
        })?;
        channel.send(&handshake).map_err(|err| {
            AppError::transient(format!("RPC handshake send failed: {err}"), &self.trace_id)
        })?;
        let line = channel.receive().map_err(|err| {
            AppError::transient(format!("RPC handshake receive failed: {err}"), &self.trace_id)
        })?;
        let reply: HandshakeReply = serde_json::from_str(&line).map_err(|err| {
            AppError::protocol(format!("Malformed RPC handshake reply: {err}"), &self.trace_id)
        })?;
        let uid = match reply {
            HandshakeReply {
                status: true,
                uid: Some(uid),
            } => uid,
            _ => {
                return Err(AppError::protocol(
                    format!("RPC server rejected {cmd} handshake: {}", line.trim()),
                    &self.trace_id,
                ))
            }
        };
        // Handshake done; calls such as eventWait may block for a long time.
        channel.reader.get_ref().set_read_timeout(None).ok();
        debug!(trace_id = %self.trace_id, port, uid, cmd, "rpc connection established");

        Ok(JsonRpcConnection {
            uid,
            channel: Mutex::new(channel),
            control,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            trace_id: self.trace_id.clone(),
        })
    }
}

impl RpcClient for JsonRpcClient {
    fn open(&self, port: u16) -> Result<(Connection, SessionId), AppError> {
        let connection = self.connect(port, "initiate", -1)?;
        let uid = connection.uid;
        Ok((Arc::new(connection), uid))
    }

    fn join(&self, uid: SessionId, port: u16) -> Result<Connection, AppError> {
        let connection = self.connect(port, "continue", uid)?;
        if connection.uid != uid {
            let _ = connection.close();
            return Err(AppError::protocol(
                format!("RPC server answered uid {} when joining session {uid}", connection.uid),
                &self.trace_id,
            ));
        }
        Ok(Arc::new(connection))
    }
}
