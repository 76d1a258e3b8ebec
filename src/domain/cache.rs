use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::session::SessionTracker;
use super::{AuthenticatorId, ConnectionKey, DestinationKey, IdentityCheck, ProxyDescriptor};
use crate::ports::TlsSocket;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

/// An authenticated TLS connection that can outlive the request that opened it.
pub struct PooledConnection {
    id: Uuid,
    socket: Box<dyn TlsSocket>,
    session: Arc<SessionTracker>,
    proxy: ProxyDescriptor,
    authenticator: AuthenticatorId,
    identity_check: IdentityCheck,
    created_at: Instant,
    idle_since: Option<Instant>,
    in_cache: bool,
}

impl PooledConnection {
    pub fn new(
        socket: Box<dyn TlsSocket>,
        session: Arc<SessionTracker>,
        proxy: ProxyDescriptor,
        authenticator: AuthenticatorId,
        identity_check: IdentityCheck,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            socket,
            session,
            proxy,
            authenticator,
            identity_check,
            created_at: Instant::now(),
            idle_since: None,
            in_cache: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn socket_mut(&mut self) -> &mut Box<dyn TlsSocket> {
        &mut self.socket
    }

    pub fn session(&self) -> &Arc<SessionTracker> {
        &self.session
    }

    pub fn proxy(&self) -> &ProxyDescriptor {
        &self.proxy
    }

    pub fn authenticator(&self) -> &AuthenticatorId {
        &self.authenticator
    }

    pub fn identity_check(&self) -> IdentityCheck {
        self.identity_check
    }

    pub fn in_cache(&self) -> bool {
        self.in_cache
    }

    /// Reusable for `key` only if it was built through the same proxy and
    /// for the same authenticator.
    pub fn is_compatible(&self, key: &ConnectionKey) -> bool {
        self.proxy == key.proxy && self.authenticator == key.authenticator
    }

    fn is_expired(&self, now: Instant, keep_alive: Duration) -> bool {
        self.idle_since
            .map_or(false, |since| now.saturating_duration_since(since) >= keep_alive)
    }

    pub async fn close(mut self) {
        debug!("closing connection {} after {:?}", self.id, self.created_at.elapsed());
        let _ = self.socket.shutdown().await;
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("host", &self.socket.host())
            .field("proxy", &self.proxy)
            .field("in_cache", &self.in_cache)
            .finish()
    }
}

type Bucket = Mutex<Vec<PooledConnection>>;

/// What a pool lookup took out of the pool.
#[derive(Debug, Default)]
pub struct Checkout {
    pub connection: Option<PooledConnection>,
    /// Expired or incompatible entries, no longer pooled and not yet closed.
    pub stale: Vec<PooledConnection>,
}

fn lock(bucket: &Bucket) -> MutexGuard<'_, Vec<PooledConnection>> {
    // Nothing under this lock panics midway through an update.
    bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pool of idle connections, bucketed by destination.
///
/// Every destination has its own lock, so taking an entry out is atomic with
/// respect to concurrent `get`/`put` on the same destination.
pub struct ConnectionCache {
    entries: DashMap<DestinationKey, Bucket>,
    keep_alive: Duration,
    max_per_destination: usize,
}

impl ConnectionCache {
    pub fn new(keep_alive: Duration, max_per_destination: usize) -> Self {
        Self {
            entries: DashMap::new(),
            keep_alive,
            max_per_destination,
        }
    }

    /// Removes and returns the most recently released connection that was
    /// opened through the same proxy and for the same authenticator as `key`.
    ///
    /// Expired entries of the destination, and entries opened for another
    /// proxy or authenticator, leave the pool too; they come back in
    /// [`Checkout::stale`] for the caller to close.
    pub fn get(&self, key: &ConnectionKey) -> Checkout {
        let destination = key.destination();
        let mut checkout = Checkout::default();

        let emptied = {
            let Some(bucket) = self.entries.get(&destination) else {
                return checkout;
            };
            let mut idle = lock(&bucket);

            let now = Instant::now();
            let mut kept = Vec::with_capacity(idle.len());
            for mut conn in idle.drain(..) {
                if conn.is_expired(now, self.keep_alive) {
                    debug!("evicting idle connection {} to {}", conn.id, key.authority());
                } else if !conn.is_compatible(key) {
                    debug!(
                        "evicting connection {} to {} opened via {} for {}",
                        conn.id,
                        key.authority(),
                        conn.proxy,
                        conn.authenticator
                    );
                } else {
                    kept.push(conn);
                    continue;
                }
                conn.in_cache = false;
                checkout.stale.push(conn);
            }

            checkout.connection = kept.pop().map(|mut conn| {
                conn.in_cache = false;
                conn.idle_since = None;
                debug!("reusing connection {} to {}", conn.id, key.authority());
                conn
            });
            *idle = kept;
            idle.is_empty()
        };

        if emptied {
            self.entries.remove_if(&destination, |_, bucket| lock(bucket).is_empty());
        }
        checkout
    }

    /// Parks an idle connection. Returns false when the destination is at
    /// capacity, in which case the connection is dropped and its socket closed.
    ///
    /// # Panics
    ///
    /// If the connection is already flagged as cached.
    pub fn put(&self, key: &ConnectionKey, mut conn: PooledConnection) -> bool {
        assert!(!conn.in_cache, "connection {} is already in the cache", conn.id);

        let bucket = self.entries.entry(key.destination()).or_default();
        let mut idle = lock(&bucket);
        if idle.len() >= self.max_per_destination {
            debug!(
                "cache full for {} ({} idle), dropping connection {}",
                key.authority(),
                idle.len(),
                conn.id
            );
            return false;
        }

        conn.in_cache = true;
        conn.idle_since = Some(Instant::now());
        debug!("caching connection {} to {}", conn.id, key.authority());
        idle.push(conn);
        true
    }

    pub fn len(&self) -> usize {
        let mut total = 0;
        for bucket in self.entries.iter() {
            total += lock(bucket.value()).len();
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the pool, closing every idle connection.
    pub async fn clear(&self) {
        let mut drained = Vec::new();
        for bucket in self.entries.iter() {
            drained.append(&mut lock(bucket.value()));
        }
        self.entries.retain(|_, bucket| !lock(bucket).is_empty());
        for conn in drained {
            conn.close().await;
        }
    }
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_ALIVE, DEFAULT_MAX_CONNECTIONS)
    }
}
