use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::Connection;

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<u64, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: DashMap::new(),
        }
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id(), conn);
    }

    pub fn unregister(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// First connection matching `predicate`.
    pub fn find<F>(&self, predicate: F) -> Option<Arc<Connection>>
    where
        F: Fn(&Connection) -> bool,
    {
        self.connections
            .iter()
            .find(|entry| predicate(entry.value().as_ref()))
            .map(|entry| entry.value().clone())
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for entry in self.connections.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Tells every connection to leave its read loop.
    pub fn stop_all(&self) {
        debug!("stopping {} connections", self.len());
        self.for_each(|conn| conn.set_exiting());
    }
}
