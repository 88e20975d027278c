use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};
use uuid::Uuid;

use parley_net::StreamConnection;

use crate::error::StateError;

/// Online users and the connection each one is bound to.
pub struct SessionRegistry {
    inner: RwLock<Sessions>,
}

#[derive(Default)]
struct Sessions {
    /// username -> connection
    by_name: HashMap<String, StreamConnection>,
    /// connection id -> username
    by_conn: HashMap<Uuid, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Sessions::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Sessions> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Sessions> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `name` to `conn`. Returns the trimmed name on success.
    pub fn login(&self, name: &str, conn: &StreamConnection) -> Result<String, StateError> {
        let name = validate_name(name)?;
        let mut sessions = self.write();

        if let Some(bound) = sessions.by_conn.get(&conn.id()) {
            return Err(StateError::AlreadyLoggedIn(bound.clone()));
        }
        if sessions.by_name.contains_key(&name) {
            return Err(StateError::NameTaken(name));
        }

        sessions.by_name.insert(name.clone(), conn.clone());
        sessions.by_conn.insert(conn.id(), name.clone());
        info!("{} logged in from {}", name, conn.peer_addr());
        Ok(name)
    }

    /// Remove the binding for `name`. No-op if absent.
    pub fn logout(&self, name: &str) -> Option<StreamConnection> {
        let mut sessions = self.write();
        let conn = sessions.by_name.remove(name)?;
        sessions.by_conn.remove(&conn.id());
        info!("{} logged out", name);
        Some(conn)
    }

    /// Remove whatever name `conn_id` was bound to.
    pub fn logout_connection(&self, conn_id: Uuid) -> Option<String> {
        let mut sessions = self.write();
        let name = sessions.by_conn.remove(&conn_id)?;
        sessions.by_name.remove(&name);
        Some(name)
    }

    pub fn user_for(&self, conn_id: Uuid) -> Option<String> {
        self.read().by_conn.get(&conn_id).cloned()
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.read().by_name.contains_key(name)
    }

    /// Sorted snapshot of online names.
    pub fn online_users(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to one user if online. Returns whether the record was queued.
    pub fn unicast(&self, name: &str, record: &str) -> bool {
        let sessions = self.read();
        let Some(conn) = sessions.by_name.get(name) else {
            debug!("Dropping record for offline user {}", name);
            return false;
        };
        match conn.send(record) {
            Ok(()) => true,
            Err(e) => {
                debug!("Send to {} failed: {}", name, e);
                false
            }
        }
    }

    /// Deliver to every online user. Returns how many sends were queued.
    pub fn broadcast(&self, record: &str) -> usize {
        let sessions = self.read();
        let mut delivered = 0;
        for (name, conn) in &sessions.by_name {
            match conn.send(record) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to {} failed: {}", name, e),
            }
        }
        delivered
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared rule for user and group names: trimmed, non-empty, and free of the
/// `,` list separator and control characters.
pub fn validate_name(raw: &str) -> Result<String, StateError> {
    let name = raw.trim();
    if name.is_empty() || name.contains(',') || name.chars().any(char::is_control) {
        return Err(StateError::InvalidName(raw.to_string()));
    }
    Ok(name.to_string())
}
