use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::app::error::AppError;
use crate::app::rpc::{DispatcherFactory, EventDispatcher, SessionId};
use crate::app::session::SessionMultiplexer;

/// At most one event dispatcher per session, each on its own secondary
/// connection.
pub struct EventChannelRegistry {
    serial: String,
    factory: DispatcherFactory,
    dispatchers: BTreeMap<SessionId, Arc<dyn EventDispatcher>>,
}

impl EventChannelRegistry {
    pub fn new(serial: &str, factory: DispatcherFactory) -> Self {
        Self {
            serial: serial.to_string(),
            factory,
            dispatchers: BTreeMap::new(),
        }
    }

    /// The dispatcher for `uid`, created on first request.
    pub fn get(
        &mut self,
        sessions: &mut SessionMultiplexer,
        uid: SessionId,
        trace_id: &str,
    ) -> Result<Arc<dyn EventDispatcher>, AppError> {
        if let Some(existing) = self.dispatchers.get(&uid) {
            return Ok(Arc::clone(existing));
        }
        let connection = sessions.add_connection(uid, trace_id)?;
        let dispatcher = (self.factory)(connection);
        self.dispatchers.insert(uid, Arc::clone(&dispatcher));
        debug!(trace_id = %trace_id, serial = %self.serial, uid, "event dispatcher created");
        Ok(dispatcher)
    }

    /// Cleans up and forgets the dispatcher of `uid`, if any.
    pub fn release(&mut self, uid: SessionId) {
        if let Some(dispatcher) = self.dispatchers.remove(&uid) {
            dispatcher.clean_up();
        }
    }

    pub fn contains(&self, uid: SessionId) -> bool {
        self.dispatchers.contains_key(&uid)
    }

    pub fn first(&self) -> Option<Arc<dyn EventDispatcher>> {
        self.dispatchers.values().next().cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn EventDispatcher>> {
        self.dispatchers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{fake_dispatcher_factory, FakeRpc};

    #[test]
    fn get_is_memoized_with_a_single_join() {
        let rpc = Arc::new(FakeRpc::with_uids(vec![5]));
        let mut sessions = SessionMultiplexer::new("A1", rpc.clone());
        let (factory, created) = fake_dispatcher_factory();
        let mut registry = EventChannelRegistry::new("A1", factory);
        let (uid, _) = sessions.start_session(20000, "t").expect("start");

        let first = registry.get(&mut sessions, uid, "t").ok().expect("first");
        let second = registry.get(&mut sessions, uid, "t").ok().expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(rpc.joins().len(), 1);
        assert_eq!(created.lock().expect("lock").len(), 1);
        assert_eq!(sessions.connection_count(uid), 2);
    }

    #[test]
    fn unknown_session_creates_nothing() {
        let rpc = Arc::new(FakeRpc::with_uids(vec![]));
        let mut sessions = SessionMultiplexer::new("A1", rpc);
        let (factory, created) = fake_dispatcher_factory();
        let mut registry = EventChannelRegistry::new("A1", factory);
        let err = registry.get(&mut sessions, 3, "t").err().expect("unknown");
        assert_eq!(err.code, "ERR_PROTOCOL");
        assert!(registry.is_empty());
        assert!(created.lock().expect("lock").is_empty());
    }

    #[test]
    fn release_cleans_up_once() {
        let rpc = Arc::new(FakeRpc::with_uids(vec![1, 2]));
        let mut sessions = SessionMultiplexer::new("A1", rpc);
        let (factory, created) = fake_dispatcher_factory();
        let mut registry = EventChannelRegistry::new("A1", factory);
        let (a, _) = sessions.start_session(20000, "t").expect("a");
        let (b, _) = sessions.start_session(20000, "t").expect("b");
        registry.get(&mut sessions, b, "t").ok().expect("b");
        registry.get(&mut sessions, a, "t").ok().expect("a");
        assert_eq!(registry.len(), 2);

        registry.release(a);
        registry.release(a);
        assert!(!registry.contains(a));
        assert_eq!(registry.all().len(), 1);
        let dispatchers = created.lock().expect("lock");
        let cleaned: Vec<usize> = dispatchers.iter().map(|d| d.clean_up_count()).collect();
        // b was created first, a second.
        assert_eq!(cleaned, vec![0, 1]);
    }
}
