use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::rpc::{Connection, RpcClient, SessionId};

struct SessionEntry {
    port: u16,
    connections: Vec<Connection>,
}

/// Tracks RPC sessions on one device by server-issued uid. Index 0 of each
/// connection list is the primary connection.
pub struct SessionMultiplexer {
    serial: String,
    rpc: Arc<dyn RpcClient>,
    sessions: BTreeMap<SessionId, SessionEntry>,
}

impl SessionMultiplexer {
    pub fn new(serial: &str, rpc: Arc<dyn RpcClient>) -> Self {
        Self {
            serial: serial.to_string(),
            rpc,
            sessions: BTreeMap::new(),
        }
    }

    /// Opens a new session through `port`. A uid the table already holds is a
    /// protocol violation: the existing entry is left alone and the new
    /// connection is dropped.
    pub fn start_session(
        &mut self,
        port: u16,
        trace_id: &str,
    ) -> Result<(SessionId, Connection), AppError> {
        let (connection, uid) = self.rpc.open(port)?;
        if self.sessions.contains_key(&uid) {
            if let Err(err) = connection.close() {
                warn!(trace_id = %trace_id, serial = %self.serial, uid, error = %err, "failed to close orphan connection");
            }
            return Err(AppError::protocol(
                format!("Session {uid} already exists on {}", self.serial),
                trace_id,
            ));
        }
        self.sessions.insert(
            uid,
            SessionEntry {
                port,
                connections: vec![Arc::clone(&connection)],
            },
        );
        info!(trace_id = %trace_id, serial = %self.serial, uid, port, "rpc session started");
        Ok((uid, connection))
    }

    /// Joins another connection to session `uid`.
    pub fn add_connection(&mut self, uid: SessionId, trace_id: &str) -> Result<Connection, AppError> {
        let Some(entry) = self.sessions.get_mut(&uid) else {
            return Err(AppError::protocol(
                format!("Session {uid} doesn't exist."),
                trace_id,
            ));
        };
        let connection = self.rpc.join(uid, entry.port)?;
        entry.connections.push(Arc::clone(&connection));
        Ok(connection)
    }

    /// Terminates and closes every connection of `uid`. Connections already
    /// closed locally (an event dispatcher's) are not asked to terminate.
    /// All connections are attempted; the first failure is returned.
    /// Unknown uids are a no-op.
    pub fn close_session(&mut self, uid: SessionId, trace_id: &str) -> Result<(), AppError> {
        let Some(entry) = self.sessions.remove(&uid) else {
            return Ok(());
        };
        let mut first_error = None;
        for connection in entry.connections {
            let result = if connection.is_closed() {
                Ok(())
            } else {
                connection.terminate().and(connection.close())
            };
            if let Err(err) = result {
                warn!(trace_id = %trace_id, serial = %self.serial, uid, error = %err, "failed to close rpc connection");
                first_error.get_or_insert(err);
            }
        }
        info!(trace_id = %trace_id, serial = %self.serial, uid, "rpc session closed");
        first_error.map_or(Ok(()), Err)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn contains(&self, uid: SessionId) -> bool {
        self.sessions.contains_key(&uid)
    }

    pub fn primary(&self, uid: SessionId) -> Option<Connection> {
        self.sessions
            .get(&uid)
            .and_then(|entry| entry.connections.first())
            .cloned()
    }

    /// Primary connection of the lowest uid.
    pub fn first_primary(&self) -> Option<Connection> {
        self.sessions
            .values()
            .next()
            .and_then(|entry| entry.connections.first())
            .cloned()
    }

    pub fn primaries(&self) -> Vec<Connection> {
        self.sessions
            .values()
            .filter_map(|entry| entry.connections.first().cloned())
            .collect()
    }

    pub fn connection_count(&self, uid: SessionId) -> usize {
        self.sessions
            .get(&uid)
            .map_or(0, |entry| entry.connections.len())
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::FakeRpc;

    #[test]
    fn start_and_join_sessions() {
        let rpc = Arc::new(FakeRpc::with_uids(vec![4, 2]));
        let mut sessions = SessionMultiplexer::new("A1", rpc.clone());

        let (uid, primary) = sessions.start_session(20000, "t").expect("start");
        assert_eq!(uid, 4);
        assert_eq!(primary.uid(), 4);
        sessions.start_session(20000, "t").expect("second");
        assert_eq!(sessions.session_ids(), vec![2, 4]);
        assert_eq!(sessions.first_primary().expect("first").uid(), 2);

        let secondary = sessions.add_connection(4, "t").expect("join");
        assert_eq!(secondary.uid(), 4);
        assert_eq!(sessions.connection_count(4), 2);
        assert_eq!(rpc.joins(), vec![(4, 20000)]);
        assert_eq!(sessions.primaries().len(), 2);
    }

    #[test]
    fn duplicate_uid_is_a_protocol_error_and_leaves_table_alone() {
        let rpc = Arc::new(FakeRpc::with_uids(vec![1, 1]));
        let mut sessions = SessionMultiplexer::new("A1", rpc.clone());
        let (_, original) = sessions.start_session(20000, "t").expect("start");
        sessions.add_connection(1, "t").expect("join");

        let err = sessions.start_session(20001, "t").err().expect("duplicate");
        assert_eq!(err.code, "ERR_PROTOCOL");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.connection_count(1), 2);
        assert!(Arc::ptr_eq(&sessions.primary(1).expect("primary"), &original));
        // The orphan from the second handshake was closed.
        assert_eq!(rpc.closed_count(), 1);
    }

    #[test]
    fn add_connection_to_unknown_session_fails() {
        let rpc = Arc::new(FakeRpc::with_uids(vec![1]));
        let mut sessions = SessionMultiplexer::new("A1", rpc);
        let err = sessions.add_connection(9, "t").err().expect("unknown");
        assert_eq!(err.code, "ERR_PROTOCOL");
        assert!(err.error.contains("doesn't exist"));
    }

    #[test]
    fn close_session_closes_everything_and_reports_first_error() {
        let rpc = Arc::new(FakeRpc::with_uids(vec![3]));
        let mut sessions = SessionMultiplexer::new("A1", rpc.clone());
        let (_, primary) = sessions.start_session(20000, "t").expect("start");
        let secondary = sessions.add_connection(3, "t").expect("join");
        rpc.fail_terminate_on(&primary);

        let err = sessions.close_session(3, "t").expect_err("first error");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert!(sessions.is_empty());
        // Both connections are closed even though the first terminate failed.
        assert_eq!(rpc.closed_count(), 2);
        assert!(rpc.was_closed(&secondary));

        sessions.close_session(3, "t").expect("unknown uid is a no-op");
    }

    #[test]
    fn locally_closed_connection_is_not_terminated() {
        let rpc = Arc::new(FakeRpc::with_uids(vec![6]));
        let mut sessions = SessionMultiplexer::new("A1", rpc.clone());
        sessions.start_session(20000, "t").expect("start");
        let secondary = sessions.add_connection(6, "t").expect("join");
        // What an event dispatcher's clean_up does to its connection.
        secondary.close().expect("close");

        sessions.close_session(6, "t").expect("clean close");
        let connections = rpc.connections();
        assert!(connections[0].is_terminated());
        assert!(!connections[1].is_terminated());
        assert!(connections.iter().all(|c| c.is_closed()));
    }
}
