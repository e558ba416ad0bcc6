//! WebDAV write locks and in-flight stream locks.
//!
//! One [`LockManager`] instance is owned by the handler. It keeps two
//! coupled indexes over the active RFC 4918 locks (token to lock, and
//! path to token set), leases them out with a timeout, and expires them
//! both lazily on access and from a background sweep. Orthogonal to
//! that, a per-path *stream lock* table serializes concurrent request
//! bodies on the same resource: many readers or one writer, never both.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;
use xmltree::Element;

use crate::davpath::DavPath;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// An active RFC 4918 write lock.
#[derive(Debug, Clone)]
pub struct DavLock {
    /// `opaquelocktoken:<uuid>`.
    pub token:   String,
    pub path:    DavPath,
    /// Owner element from the lockinfo body, echoed back verbatim.
    pub owner:   Option<Element>,
    pub timeout: Duration,
    pub created: SystemTime,
    pub shared:  bool,
    pub deep:    bool,
}

impl DavLock {
    pub(crate) fn expired_at(&self, now: SystemTime) -> bool {
        now > self.created + self.timeout
    }

    pub fn expired(&self) -> bool {
        self.expired_at(SystemTime::now())
    }

    // The RFC 4918 overlap rule: a lock applies to an operation on
    // `path` if it sits on that very path, or on an ancestor at depth
    // infinity.
    pub(crate) fn covers(&self, path: &DavPath) -> bool {
        self.path == *path || (self.deep && self.path.is_ancestor_of(path))
    }
}

#[derive(Debug, Default)]
struct Tables {
    by_token: HashMap<String, DavLock>,
    by_path:  HashMap<DavPath, HashSet<String>>,
}

impl Tables {
    fn insert(&mut self, lock: DavLock) {
        self.by_path
            .entry(lock.path.clone())
            .or_default()
            .insert(lock.token.clone());
        self.by_token.insert(lock.token.clone(), lock);
    }

    fn remove(&mut self, token: &str) -> Option<DavLock> {
        let lock = self.by_token.remove(token)?;
        if let Some(set) = self.by_path.get_mut(&lock.path) {
            set.remove(token);
            if set.is_empty() {
                self.by_path.remove(&lock.path);
            }
        }
        Some(lock)
    }

    // All non-expired locks that cover `path`, walking the ancestor
    // chain from the path up to the root.
    fn covering(&self, path: &DavPath, now: SystemTime) -> Vec<DavLock> {
        let mut found = Vec::new();
        let mut cur = path.clone();
        loop {
            if let Some(tokens) = self.by_path.get(&cur) {
                for t in tokens {
                    let lock = &self.by_token[t];
                    if !lock.expired_at(now) && lock.covers(path) {
                        found.push(lock.clone());
                    }
                }
            }
            if cur.is_root() {
                break;
            }
            cur = cur.parent();
        }
        found
    }

    // All non-expired locks rooted strictly below `path`.
    fn below(&self, path: &DavPath, now: SystemTime) -> Vec<DavLock> {
        self.by_token
            .values()
            .filter(|l| !l.expired_at(now) && path.is_ancestor_of(&l.path))
            .cloned()
            .collect()
    }

    fn purge_expired(&mut self, now: SystemTime) -> usize {
        let dead: Vec<String> = self
            .by_token
            .values()
            .filter(|l| l.expired_at(now))
            .map(|l| l.token.clone())
            .collect();
        let n = dead.len();
        for token in dead {
            self.remove(&token);
        }
        n
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamState {
    Read(u32),
    Write,
}

#[derive(Debug)]
struct Inner {
    tables:  RwLock<Tables>,
    streams: Mutex<HashMap<DavPath, StreamState>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// The lock manager. A cheap-to-clone handle; all clones share state.
#[derive(Debug, Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager {
            inner: Arc::new(Inner {
                tables:  RwLock::new(Tables::default()),
                streams: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    // Start the expiry sweep on first use; at that point we are inside
    // the runtime. The task only holds a weak reference, so dropping
    // the last handle also ends the sweep.
    pub(crate) fn ensure_sweeper(&self) {
        let mut slot = self.inner.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        let n = inner.tables.write().purge_expired(SystemTime::now());
                        if n > 0 {
                            debug!("lock sweep: removed {} expired locks", n);
                        }
                    }
                    None => break,
                }
            }
        }));
    }

    /// Stop the background sweep. Active locks stay in place; they are
    /// still expired lazily on access.
    pub fn close(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Take out a new lock. An exclusive lock needs the whole overlap
    /// set empty; a shared lock only refuses overlapping exclusive
    /// locks. On conflict the offending lock is returned.
    pub fn create(
        &self,
        path: &DavPath,
        owner: Option<Element>,
        shared: bool,
        deep: bool,
        timeout: Duration,
    ) -> Result<DavLock, DavLock> {
        let now = SystemTime::now();
        let mut tables = self.inner.tables.write();
        tables.purge_expired(now);

        for l in tables.covering(path, now) {
            if !shared || !l.shared {
                trace!("lock {}: conflict with {}", path, l.token);
                return Err(l);
            }
        }
        if deep {
            for l in tables.below(path, now) {
                if !shared || !l.shared {
                    trace!("lock {}: conflict below with {}", path, l.token);
                    return Err(l);
                }
            }
        }

        let lock = DavLock {
            token: format!("opaquelocktoken:{}", Uuid::new_v4()),
            path: path.clone(),
            owner,
            timeout,
            created: now,
            shared,
            deep,
        };
        trace!("lock {} created on {}", lock.token, path);
        tables.insert(lock.clone());
        Ok(lock)
    }

    /// Refresh a lock: reset the lease clock and replace the timeout.
    /// Fails if the token is unknown, expired, or does not cover the
    /// path it is refreshed through.
    pub fn refresh(&self, path: &DavPath, token: &str, timeout: Duration) -> Result<DavLock, ()> {
        let now = SystemTime::now();
        let mut tables = self.inner.tables.write();
        let expired = match tables.by_token.get_mut(token) {
            None => return Err(()),
            Some(lock) => {
                if !lock.expired_at(now) {
                    if !lock.covers(path) {
                        return Err(());
                    }
                    lock.created = now;
                    lock.timeout = timeout;
                    return Ok(lock.clone());
                }
                true
            }
        };
        if expired {
            tables.remove(token);
        }
        Err(())
    }

    /// Remove the lock `token`, provided it covers `path`.
    pub fn unlock(&self, path: &DavPath, token: &str) -> Result<(), ()> {
        let now = SystemTime::now();
        let mut tables = self.inner.tables.write();
        match tables.by_token.get(token) {
            Some(lock) if lock.expired_at(now) => {
                tables.remove(token);
                Err(())
            }
            Some(lock) if lock.covers(path) => {
                tables.remove(token);
                Ok(())
            }
            _ => Err(()),
        }
    }

    /// Check whether an operation on `path` (deep: on the whole subtree
    /// under it) is admissible given the submitted lock tokens. On
    /// refusal one conflicting lock is returned.
    pub fn check(&self, path: &DavPath, deep: bool, tokens: &[String]) -> Result<(), DavLock> {
        let now = SystemTime::now();
        let tables = self.inner.tables.read();

        let mut holds_lock = false;
        let mut first_shared: Option<DavLock> = None;
        for l in tables.covering(path, now) {
            if tokens.iter().any(|t| t == &l.token) {
                holds_lock = true;
            } else if !l.shared {
                return Err(l);
            } else if first_shared.is_none() {
                first_shared = Some(l);
            }
        }
        // shared locks deny writers that hold none of them.
        if !holds_lock {
            if let Some(l) = first_shared {
                return Err(l);
            }
        }

        if deep {
            for l in tables.below(path, now) {
                if !tokens.iter().any(|t| t == &l.token) {
                    return Err(l);
                }
            }
        }
        Ok(())
    }

    /// True iff `token` resolves to a live lock that covers `path`.
    pub fn has_valid_token(&self, path: &DavPath, token: &str) -> bool {
        let tables = self.inner.tables.read();
        match tables.by_token.get(token) {
            Some(lock) => !lock.expired() && lock.covers(path),
            None => false,
        }
    }

    /// All locks that apply to `path`, for `lockdiscovery`.
    pub fn discover(&self, path: &DavPath) -> Vec<DavLock> {
        self.inner.tables.read().covering(path, SystemTime::now())
    }

    /// Does an exclusive lock sit on exactly this path?
    pub fn is_exclusively_locked(&self, path: &DavPath) -> bool {
        let now = SystemTime::now();
        let tables = self.inner.tables.read();
        match tables.by_path.get(path) {
            Some(tokens) => tokens
                .iter()
                .any(|t| !tables.by_token[t].shared && !tables.by_token[t].expired_at(now)),
            None => false,
        }
    }

    /// Drop every lock rooted at `path` or below. Called when the
    /// resource tree under `path` goes away.
    pub fn purge_subtree(&self, path: &DavPath) {
        let mut tables = self.inner.tables.write();
        let doomed: Vec<String> = tables
            .by_token
            .values()
            .filter(|l| l.path == *path || path.is_ancestor_of(&l.path))
            .map(|l| l.token.clone())
            .collect();
        for token in doomed {
            trace!("purging lock {}", token);
            tables.remove(&token);
        }
    }

    /// Re-root the locks held on exactly `from` onto `to`, re-keying
    /// the path index. Used by MOVE.
    pub fn migrate(&self, from: &DavPath, to: &DavPath) {
        let mut tables = self.inner.tables.write();
        let tokens = match tables.by_path.remove(from) {
            Some(t) => t,
            None => return,
        };
        for token in tokens {
            if let Some(lock) = tables.by_token.get_mut(&token) {
                trace!("migrating lock {} to {}", token, to);
                lock.path = to.clone();
            }
            tables.by_path.entry(to.clone()).or_default().insert(token);
        }
    }

    /// Take a shared stream lock for a body read. Fails while a write
    /// is in flight.
    pub fn try_read_stream(&self, path: &DavPath) -> Option<StreamGuard> {
        let mut streams = self.inner.streams.lock();
        match streams.get_mut(path) {
            None => {
                streams.insert(path.clone(), StreamState::Read(1));
            }
            Some(StreamState::Read(n)) => *n += 1,
            Some(StreamState::Write) => return None,
        }
        Some(StreamGuard {
            inner: self.inner.clone(),
            path:  path.clone(),
        })
    }

    /// Take the exclusive stream lock for a body write. Fails while any
    /// other transfer is in flight.
    pub fn try_write_stream(&self, path: &DavPath) -> Option<StreamGuard> {
        let mut streams = self.inner.streams.lock();
        if streams.contains_key(path) {
            return None;
        }
        streams.insert(path.clone(), StreamState::Write);
        Some(StreamGuard {
            inner: self.inner.clone(),
            path:  path.clone(),
        })
    }
}

/// RAII stream-lock guard; releasing is dropping. The guard travels
/// into the response body for GET so that the read lock is held until
/// the body is fully sent or the connection goes away.
#[derive(Debug)]
pub struct StreamGuard {
    inner: Arc<Inner>,
    path:  DavPath,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut streams = self.inner.streams.lock();
        match streams.get_mut(&self.path) {
            Some(StreamState::Read(n)) if *n > 1 => *n -= 1,
            Some(_) => {
                streams.remove(&self.path);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    fn minute() -> Duration {
        Duration::from_secs(60)
    }

    #[test]
    fn exclusive_excludes() {
        let ls = LockManager::new();
        let l = ls.create(&p("/a"), None, false, false, minute()).unwrap();
        assert!(l.token.starts_with("opaquelocktoken:"));
        assert!(ls.create(&p("/a"), None, false, false, minute()).is_err());
        assert!(ls.create(&p("/a"), None, true, false, minute()).is_err());
        // sibling is fine
        assert!(ls.create(&p("/b"), None, false, false, minute()).is_ok());
    }

    #[test]
    fn shared_locks_coexist() {
        let ls = LockManager::new();
        ls.create(&p("/a"), None, true, false, minute()).unwrap();
        ls.create(&p("/a"), None, true, false, minute()).unwrap();
        assert!(ls.create(&p("/a"), None, false, false, minute()).is_err());
    }

    #[test]
    fn deep_lock_covers_descendants() {
        let ls = LockManager::new();
        let l = ls.create(&p("/a"), None, false, true, minute()).unwrap();
        // new lock below a deep exclusive lock is refused
        assert!(ls.create(&p("/a/b/c"), None, false, false, minute()).is_err());
        // modification without the token is refused, with it allowed
        assert!(ls.check(&p("/a/b/c"), false, &[]).is_err());
        assert!(ls.check(&p("/a/b/c"), false, &[l.token.clone()]).is_ok());
        assert!(ls.has_valid_token(&p("/a/b/c"), &l.token));
        // a deep lock request above existing locks is refused too
        assert!(ls.create(&p("/"), None, false, true, minute()).is_err());
    }

    #[test]
    fn shallow_lock_does_not_cover_children() {
        let ls = LockManager::new();
        let l = ls.create(&p("/a"), None, false, false, minute()).unwrap();
        assert!(ls.check(&p("/a/b"), false, &[]).is_ok());
        assert!(!ls.has_valid_token(&p("/a/b"), &l.token));
    }

    #[test]
    fn unlock_and_refresh() {
        let ls = LockManager::new();
        let l = ls.create(&p("/a"), None, false, false, minute()).unwrap();
        assert!(ls.refresh(&p("/a"), &l.token, Duration::from_secs(120)).is_ok());
        assert!(ls.refresh(&p("/b"), &l.token, minute()).is_err());
        assert!(ls.unlock(&p("/b"), &l.token).is_err());
        assert!(ls.unlock(&p("/a"), &l.token).is_ok());
        assert!(ls.unlock(&p("/a"), &l.token).is_err());
        assert!(ls.create(&p("/a"), None, false, false, minute()).is_ok());
    }

    #[test]
    fn expiry_is_lazy() {
        let ls = LockManager::new();
        let l = ls.create(&p("/a"), None, false, false, minute()).unwrap();
        // backdate the lock past its lease
        {
            let mut tables = ls.inner.tables.write();
            let lock = tables.by_token.get_mut(&l.token).unwrap();
            lock.created = SystemTime::now() - Duration::from_secs(120);
        }
        assert!(!ls.has_valid_token(&p("/a"), &l.token));
        assert!(ls.check(&p("/a"), false, &[]).is_ok());
        // refreshing an expired lock purges it from both indexes
        assert!(ls.refresh(&p("/a"), &l.token, minute()).is_err());
        let tables = ls.inner.tables.read();
        assert!(tables.by_token.is_empty());
        assert!(tables.by_path.is_empty());
    }

    #[test]
    fn sweep_purges_both_indexes() {
        let ls = LockManager::new();
        let l = ls.create(&p("/a"), None, false, true, minute()).unwrap();
        {
            let mut tables = ls.inner.tables.write();
            tables.by_token.get_mut(&l.token).unwrap().created =
                SystemTime::now() - Duration::from_secs(3600);
        }
        let n = ls.inner.tables.write().purge_expired(SystemTime::now());
        assert_eq!(n, 1);
        let tables = ls.inner.tables.read();
        assert!(tables.by_token.is_empty() && tables.by_path.is_empty());
    }

    #[test]
    fn migrate_rewrites_path_index() {
        let ls = LockManager::new();
        let l = ls.create(&p("/src"), None, false, false, minute()).unwrap();
        ls.migrate(&p("/src"), &p("/dst"));
        assert!(!ls.has_valid_token(&p("/src"), &l.token));
        assert!(ls.has_valid_token(&p("/dst"), &l.token));
        let locks = ls.discover(&p("/dst"));
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].path, p("/dst"));
        assert!(ls.discover(&p("/src")).is_empty());
    }

    #[test]
    fn purge_subtree_is_recursive() {
        let ls = LockManager::new();
        ls.create(&p("/a"), None, false, false, minute()).unwrap();
        ls.create(&p("/a/b"), None, true, false, minute()).unwrap();
        ls.create(&p("/other"), None, false, false, minute()).unwrap();
        ls.purge_subtree(&p("/a"));
        let tables = ls.inner.tables.read();
        assert_eq!(tables.by_token.len(), 1);
        assert!(tables.by_path.contains_key(&p("/other")));
    }

    #[test]
    fn stream_locks_single_writer_many_readers() {
        let ls = LockManager::new();
        let r1 = ls.try_read_stream(&p("/f")).unwrap();
        let r2 = ls.try_read_stream(&p("/f")).unwrap();
        assert!(ls.try_write_stream(&p("/f")).is_none());
        drop(r1);
        assert!(ls.try_write_stream(&p("/f")).is_none());
        drop(r2);
        let w = ls.try_write_stream(&p("/f")).unwrap();
        assert!(ls.try_read_stream(&p("/f")).is_none());
        assert!(ls.try_write_stream(&p("/f")).is_none());
        drop(w);
        assert!(ls.try_read_stream(&p("/f")).is_some());
    }
}
