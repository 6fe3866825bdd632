//! Tunnel registry (component C3): the in-memory map from user login to
//! active tunnels, with per-user quota enforcement and id allocation.
//!
//! Grounded in `bore-server::server::Server`'s `DashMap<String, u32>`
//! per-user tunnel counter and atomic check-then-insert via the entry API;
//! here the whole per-user record (not just a counter) is held behind a
//! single readers–writer lock per spec's "thread-safe map ... protected by a
//! readers–writer discipline" (§4.3). Locks are never held across an
//! `.await` — every public method here is synchronous.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::QuotaExceeded;
use crate::session::SessionHandle;
use crate::wire::TunnelKind;

/// Default quota, per spec §3 `UserRecord.max_tunnels`.
pub const DEFAULT_MAX_TUNNELS: u32 = 2;

/// One active tunnel: a mapping from a public endpoint to one client
/// session. Per spec §9, the registry stores only a handle sufficient to
/// open streams and to request the listener's closure — it never owns the
/// `TcpListener` itself (that belongs to the TCP data-plane task).
pub struct Tunnel {
    pub id: String,
    pub kind: TunnelKind,
    pub session: SessionHandle,
    pub public_endpoint: String,
    /// Present only for TCP tunnels: signals the owning TCP data-plane task
    /// to stop accepting and close its listener (invariant I3).
    cancel_listener: Option<oneshot::Sender<()>>,
}

impl Tunnel {
    pub fn new_http(id: String, session: SessionHandle, domain: &str) -> Self {
        let public_endpoint = format!("{id}.{domain}");
        Tunnel {
            id,
            kind: TunnelKind::Http,
            session,
            public_endpoint,
            cancel_listener: None,
        }
    }

    pub fn new_tcp(
        id: String,
        session: SessionHandle,
        domain: &str,
        port: u16,
        cancel_listener: oneshot::Sender<()>,
    ) -> Self {
        let public_endpoint = format!("{domain}:{port}");
        Tunnel {
            id,
            kind: TunnelKind::Tcp,
            session,
            public_endpoint,
            cancel_listener: Some(cancel_listener),
        }
    }
}

/// The per-user slot inside the registry (spec §3 `UserRecord`).
pub struct UserRecord {
    pub login: String,
    pub tunnels: HashMap<String, Tunnel>,
    pub max_tunnels: u32,
    /// Monotonically increasing counter for TCP tunnel ids, so a removed
    /// tunnel's id is never reissued to a later tunnel for the same user
    /// (spec §9 open question: `len(tunnels)+1` is not collision-free).
    next_tcp_index: u32,
}

impl UserRecord {
    fn new(login: String) -> Self {
        UserRecord {
            login,
            tunnels: HashMap::new(),
            max_tunnels: DEFAULT_MAX_TUNNELS,
            next_tcp_index: 0,
        }
    }
}

/// Thread-safe map `login -> UserRecord` (component C3).
#[derive(Default)]
pub struct TunnelRegistry {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        TunnelRegistry {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Create the user's record if absent.
    pub fn reserve(&self, login: &str) {
        let mut users = self.users.write().unwrap();
        users
            .entry(login.to_string())
            .or_insert_with(|| UserRecord::new(login.to_string()));
    }

    /// Returns `login` if free for that user, else `login-<n>` for the
    /// smallest `n >= 1` not already taken within that user's tunnels
    /// (spec §4.3 `allocate_http_id`). The collision test is scoped to the
    /// user, but uniqueness is global in practice because a label's prefix
    /// before the first `-` is the login itself (invariant I1).
    pub fn allocate_http_id(&self, login: &str) -> String {
        let users = self.users.read().unwrap();
        let taken = users.get(login).map(|u| &u.tunnels);
        if taken.map(|t| !t.contains_key(login)).unwrap_or(true) {
            return login.to_string();
        }
        let taken = taken.unwrap();
        let mut n = 1u32;
        loop {
            let candidate = format!("{login}-{n}");
            if !taken.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// `tcp-<login>-<n>`, `n` from a per-user monotonic counter (spec §9
    /// open question resolution).
    pub fn allocate_tcp_id(&self, login: &str) -> String {
        let mut users = self.users.write().unwrap();
        let user = users
            .entry(login.to_string())
            .or_insert_with(|| UserRecord::new(login.to_string()));
        user.next_tcp_index += 1;
        format!("tcp-{login}-{}", user.next_tcp_index)
    }

    /// Read-only quota check, so a caller can confirm a registration would
    /// succeed *before* consuming a scarce resource (a public TCP port)
    /// that `insert`'s own check would otherwise reject after the fact
    /// (spec §4.5 S4t: quota is checked before a port is allocated).
    pub fn check_quota(&self, login: &str, kind: TunnelKind) -> Result<(), QuotaExceeded> {
        let users = self.users.read().unwrap();
        if let Some(user) = users.get(login) {
            if user.tunnels.len() as u32 >= user.max_tunnels {
                return Err(QuotaExceeded {
                    kind: kind.as_str(),
                    max: user.max_tunnels,
                });
            }
        }
        Ok(())
    }

    /// Insert a tunnel for `login`, failing with `QuotaExceeded` if the
    /// user is already at `max_tunnels`. Atomic with the quota check.
    pub fn insert(&self, login: &str, tunnel: Tunnel) -> Result<(), QuotaExceeded> {
        let mut users = self.users.write().unwrap();
        let user = users
            .entry(login.to_string())
            .or_insert_with(|| UserRecord::new(login.to_string()));
        if user.tunnels.len() as u32 >= user.max_tunnels {
            return Err(QuotaExceeded {
                kind: tunnel.kind.as_str(),
                max: user.max_tunnels,
            });
        }
        info!(login, id = %tunnel.id, endpoint = %tunnel.public_endpoint, "tunnel registered");
        user.tunnels.insert(tunnel.id.clone(), tunnel);
        Ok(())
    }

    /// Split `host_label` at the first `-`; the prefix is the candidate
    /// login, the full label is the tunnel id (spec §4.3 `lookup`).
    pub fn lookup(&self, host_label: &str) -> Option<SessionHandle> {
        let login = host_label.split('-').next().unwrap_or(host_label);
        let users = self.users.read().unwrap();
        users
            .get(login)?
            .tunnels
            .get(host_label)
            .map(|t| t.session.clone())
    }

    /// Remove the tunnel; if the user now has zero tunnels, drop the user
    /// record too. Returns the removed tunnel so the caller can trigger
    /// listener shutdown.
    pub fn remove(&self, login: &str, id: &str) -> Option<Tunnel> {
        let mut users = self.users.write().unwrap();
        let user = users.get_mut(login)?;
        let tunnel = user.tunnels.remove(id);
        if tunnel.is_some() {
            debug!(login, id, "tunnel removed");
        }
        if user.tunnels.is_empty() {
            users.remove(login);
        }
        tunnel
    }

    /// Current tunnel count for a user (used by tests and diagnostics).
    pub fn tunnel_count(&self, login: &str) -> usize {
        self.users
            .read()
            .unwrap()
            .get(login)
            .map(|u| u.tunnels.len())
            .unwrap_or(0)
    }
}

/// Drop glue: cancel the TCP listener task, if any, when a `Tunnel` is
/// dropped (e.g. taken out of the registry on removal).
impl Tunnel {
    pub fn cancel_listener(self) {
        if let Some(tx) = self.cancel_listener {
            let _ = tx.send(());
        }
    }
}

pub type SharedRegistry = Arc<TunnelRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;

    fn fake_session() -> SessionHandle {
        SessionHandle::new_for_test()
    }

    #[test]
    fn http_id_allocation_collision_b2() {
        let reg = TunnelRegistry::new();
        reg.reserve("alice");
        assert_eq!(reg.allocate_http_id("alice"), "alice");
        reg.insert("alice", Tunnel::new_http("alice".into(), fake_session(), "ex.io"))
            .unwrap();
        assert_eq!(reg.allocate_http_id("alice"), "alice-1");
    }

    #[test]
    fn quota_enforced_b1() {
        let reg = TunnelRegistry::new();
        reg.reserve("alice");
        reg.insert("alice", Tunnel::new_http("alice".into(), fake_session(), "ex.io"))
            .unwrap();
        reg.insert(
            "alice",
            Tunnel::new_http("alice-1".into(), fake_session(), "ex.io"),
        )
        .unwrap();
        let err = reg
            .insert(
                "alice",
                Tunnel::new_http("alice-2".into(), fake_session(), "ex.io"),
            )
            .unwrap_err();
        assert_eq!(err.max, 2);
        assert_eq!(err.kind, "http");
        assert_eq!(reg.tunnel_count("alice"), 2);
    }

    #[test]
    fn lookup_scoped_to_user_i1() {
        let reg = TunnelRegistry::new();
        reg.reserve("bob");
        reg.insert("bob", Tunnel::new_http("bob".into(), fake_session(), "ex.io"))
            .unwrap();
        assert!(reg.lookup("bob").is_some());
        assert!(reg.lookup("bob-9").is_none());
        assert!(reg.lookup("nobody").is_none());
    }

    #[test]
    fn remove_drops_empty_user_record() {
        let reg = TunnelRegistry::new();
        reg.reserve("carol");
        reg.insert(
            "carol",
            Tunnel::new_http("carol".into(), fake_session(), "ex.io"),
        )
        .unwrap();
        assert!(reg.remove("carol", "carol").is_some());
        assert_eq!(reg.tunnel_count("carol"), 0);
        assert!(reg.lookup("carol").is_none());
    }

    #[test]
    fn tcp_ids_never_reused_after_removal() {
        let reg = TunnelRegistry::new();
        reg.reserve("dave");
        let id1 = reg.allocate_tcp_id("dave");
        assert_eq!(id1, "tcp-dave-1");
        reg.insert(
            "dave",
            Tunnel::new_http(id1.clone(), fake_session(), "ex.io"),
        )
        .unwrap();
        reg.remove("dave", &id1);
        let id2 = reg.allocate_tcp_id("dave");
        assert_eq!(id2, "tcp-dave-2");
    }
}
