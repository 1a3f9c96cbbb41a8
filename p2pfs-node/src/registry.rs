//! Live inbound connections, keyed by remote socket address.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle to one accepted socket. The socket itself belongs to its handler task;
/// this carries identity plus a token that asks the handler to close it.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(remote_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Registry key: the remote address as a string.
    pub fn key(&self) -> String {
        self.remote_addr.to_string()
    }

    /// Ask the owning handler to close the socket at its next suspension point.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Connection) {
        self.connections.write().insert(conn.key(), conn);
    }

    /// Remove `conn`. An entry under the same address that belongs to a different
    /// connection is left alone. Returns whether anything was removed.
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut connections = self.connections.write();
        match connections.get(&conn.key()) {
            Some(current) if current.id == conn.id => {
                connections.remove(&conn.key());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, remote_addr: &str) -> Option<Connection> {
        self.connections.read().get(remote_addr).cloned()
    }

    /// Signal the connection from `remote_addr` to close. Its handler deregisters it.
    pub fn close(&self, remote_addr: &str) -> bool {
        match self.get(remote_addr) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
