//! Seams to the on-device RPC server.
//!
//! A session is a server-side context identified by a uid; several physical
//! connections can join the same session. The controller only relies on the
//! traits here, [`json`] and [`dispatcher`] are the stock implementations.

pub mod dispatcher;
pub mod json;

use std::sync::Arc;

use serde_json::Value;

use crate::app::error::AppError;

pub type SessionId = i64;

pub trait RpcConnection: Send + Sync {
    fn uid(&self) -> SessionId;
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, AppError>;
    /// Asks the server to end the session this connection belongs to.
    fn terminate(&self) -> Result<(), AppError>;
    /// Drops the local end of the connection. Safe to call twice.
    fn close(&self) -> Result<(), AppError>;
    /// Whether `close` already ran on this end.
    fn is_closed(&self) -> bool;
}

pub type Connection = Arc<dyn RpcConnection>;

pub trait RpcClient: Send + Sync {
    /// Opens a brand-new session and returns its primary connection and uid.
    fn open(&self, port: u16) -> Result<(Connection, SessionId), AppError>;
    /// Opens another connection into an existing session.
    fn join(&self, uid: SessionId, port: u16) -> Result<Connection, AppError>;
}

pub trait EventDispatcher: Send + Sync {
    /// Starts delivery. Calling it on a running dispatcher is a no-op.
    fn start(&self) -> Result<(), AppError>;
    fn clean_up(&self);
}

pub type DispatcherFactory = Arc<dyn Fn(Connection) -> Arc<dyn EventDispatcher> + Send + Sync>;
