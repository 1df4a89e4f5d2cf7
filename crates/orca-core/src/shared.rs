//! Lock-guarded namespace shared between a monitor task and its readers.
//!
//! [`SharedData`] holds a fixed set of named JSON values behind a reentrant,
//! thread-owned lock. Fields are declared exactly once with
//! [`SharedData::init_data`]; afterwards they can be read and replaced but
//! never added or removed.
//!
//! Two access modes exist:
//!
//! - **write-protected** ([`SharedData::new`]): every read and write requires
//!   the calling thread to hold the lock.
//! - **readable** ([`SharedData::readable`]): reads may skip the lock and see a
//!   slightly stale value; writes still require it.
//!
//! Every successful write bumps a generation counter that waiters can block on.

use crate::error::{OrcaError, OrcaResult};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Default)]
struct Hold {
    owner: Option<ThreadId>,
    count: usize,
}

#[derive(Debug, Default)]
struct Namespace {
    fields: Option<BTreeMap<String, Value>>,
    generation: u64,
}

/// Reentrant-lock-protected set of named values.
#[derive(Debug)]
pub struct SharedData {
    protect_reads: bool,
    hold: Mutex<Hold>,
    released: Condvar,
    namespace: Mutex<Namespace>,
    changed: Condvar,
}

impl SharedData {
    /// Write-protected instance: reads and writes both need the lock.
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    /// Instance whose fields may be read without holding the lock.
    pub fn readable() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(protect_reads: bool) -> Self {
        Self {
            protect_reads,
            hold: Mutex::new(Hold::default()),
            released: Condvar::new(),
            namespace: Mutex::new(Namespace::default()),
            changed: Condvar::new(),
        }
    }

    /// Whether unlocked reads are refused.
    pub fn is_read_protected(&self) -> bool {
        self.protect_reads
    }

    /// Take the lock, blocking while another thread holds it.
    ///
    /// A thread that already owns the lock just increments its hold count.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut hold = self.hold.lock();
        if hold.owner == Some(me) {
            hold.count += 1;
            return;
        }
        while hold.owner.is_some() {
            self.released.wait(&mut hold);
        }
        hold.owner = Some(me);
        hold.count = 1;
    }

    /// Take the lock only if it is free or already ours.
    pub fn try_acquire(&self) -> bool {
        let me = thread::current().id();
        let mut hold = self.hold.lock();
        match hold.owner {
            Some(owner) if owner == me => {
                hold.count += 1;
                true
            }
            Some(_) => false,
            None => {
                hold.owner = Some(me);
                hold.count = 1;
                true
            }
        }
    }

    /// Drop one hold; the lock is freed when the count reaches zero.
    pub fn release(&self) -> OrcaResult<()> {
        let me = thread::current().id();
        let mut hold = self.hold.lock();
        if hold.owner != Some(me) || hold.count == 0 {
            return Err(OrcaError::Protocol(
                "release() called without holding the lock".to_string(),
            ));
        }
        hold.count -= 1;
        if hold.count == 0 {
            hold.owner = None;
            drop(hold);
            self.released.notify_one();
        }
        Ok(())
    }

    /// True when the calling thread holds the lock.
    pub fn is_owned(&self) -> bool {
        self.hold.lock().owner == Some(thread::current().id())
    }

    /// Number of outstanding holds by the calling thread.
    pub fn hold_count(&self) -> usize {
        let hold = self.hold.lock();
        if hold.owner == Some(thread::current().id()) {
            hold.count
        } else {
            0
        }
    }

    /// Acquire the lock for the lifetime of the returned guard.
    pub fn lock(&self) -> SharedDataGuard<'_> {
        self.acquire();
        SharedDataGuard { data: self }
    }

    /// Declare the full set of fields and their initial values.
    ///
    /// May be called once per instance.
    pub fn init_data<K, I>(&self, initial: I) -> OrcaResult<()>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let _guard = self.lock();
        let mut ns = self.namespace.lock();
        if ns.fields.is_some() {
            return Err(OrcaError::Protocol(
                "init_data() called more than once".to_string(),
            ));
        }
        ns.fields = Some(initial.into_iter().map(|(k, v)| (k.into(), v)).collect());
        ns.generation += 1;
        drop(ns);
        self.changed.notify_all();
        Ok(())
    }

    /// Names of all declared fields. Does not need the lock.
    pub fn dir(&self) -> Vec<String> {
        let ns = self.namespace.lock();
        ns.fields
            .as_ref()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Read a field.
    pub fn get(&self, name: &str) -> OrcaResult<Value> {
        let ns = self.namespace.lock();
        let value = declared(&ns, name)?;
        if self.protect_reads && !self.is_owned() {
            return Err(OrcaError::Access(format!(
                "read of '{name}' without holding the lock"
            )));
        }
        Ok(value.clone())
    }

    /// Read a field and deserialize it.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> OrcaResult<T> {
        Ok(serde_json::from_value(self.get(name)?)?)
    }

    /// Replace the value of a declared field. Always requires the lock.
    pub fn set<T: Serialize>(&self, name: &str, value: T) -> OrcaResult<()> {
        let value = serde_json::to_value(value)?;
        let mut ns = self.namespace.lock();
        declared(&ns, name)?;
        if !self.is_owned() {
            return Err(OrcaError::Access(format!(
                "write of '{name}' without holding the lock"
            )));
        }
        if let Some(slot) = ns.fields.as_mut().and_then(|f| f.get_mut(name)) {
            *slot = value;
        }
        ns.generation += 1;
        drop(ns);
        self.changed.notify_all();
        Ok(())
    }

    /// Count of successful writes (including initialization).
    pub fn generation(&self) -> u64 {
        self.namespace.lock().generation
    }

    /// Block until the generation moves past `after` or `timeout` elapses.
    ///
    /// Returns the generation observed on wake-up. Must not be called while
    /// holding the lock, since writers need it to make progress.
    pub fn wait_for_generation(&self, after: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut ns = self.namespace.lock();
        while ns.generation <= after {
            if self.changed.wait_until(&mut ns, deadline).timed_out() {
                break;
            }
        }
        ns.generation
    }
}

impl Default for SharedData {
    fn default() -> Self {
        Self::new()
    }
}

fn declared<'a>(ns: &'a Namespace, name: &str) -> OrcaResult<&'a Value> {
    ns.fields
        .as_ref()
        .and_then(|f| f.get(name))
        .ok_or_else(|| OrcaError::UndeclaredField(name.to_string()))
}

/// Scoped hold on a [`SharedData`] lock.
///
/// Releases exactly one hold when dropped, on every exit path.
#[derive(Debug)]
pub struct SharedDataGuard<'a> {
    data: &'a SharedData,
}

impl SharedDataGuard<'_> {
    pub fn get(&self, name: &str) -> OrcaResult<Value> {
        self.data.get(name)
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> OrcaResult<T> {
        self.data.get_as(name)
    }

    pub fn set<T: Serialize>(&self, name: &str, value: T) -> OrcaResult<()> {
        self.data.set(name, value)
    }
}

impl Drop for SharedDataGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.data.release() {
            warn!(error = %e, "shared data guard released an unheld lock");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn sample(sd: &SharedData) {
        sd.init_data([
            ("name", json!("Ray")),
            ("test", json!(true)),
            ("config", json!({})),
        ])
        .unwrap();
    }

    #[test]
    fn test_acquire_release_counting() {
        let sd = SharedData::new();
        assert!(!sd.is_owned());
        sd.acquire();
        assert!(sd.is_owned());
        sd.acquire();
        assert_eq!(sd.hold_count(), 2);
        sd.release().unwrap();
        assert!(sd.is_owned(), "lock not kept after partial release");
        sd.release().unwrap();
        assert!(!sd.is_owned());
    }

    #[test]
    fn test_unmatched_release_fails() {
        let sd = SharedData::new();
        assert!(matches!(sd.release(), Err(OrcaError::Protocol(_))));
        sd.acquire();
        sd.release().unwrap();
        assert!(matches!(sd.release(), Err(OrcaError::Protocol(_))));
    }

    #[test]
    fn test_guard_releases_on_scope_exit() {
        let sd = SharedData::new();
        {
            let _g = sd.lock();
            assert!(sd.is_owned());
            let _inner = sd.lock();
            assert_eq!(sd.hold_count(), 2);
        }
        assert!(!sd.is_owned());
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let sd = Arc::new(SharedData::new());
        let sd2 = Arc::clone(&sd);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = sd2.lock();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!sd.is_owned());
        assert!(sd.try_acquire());
        sd.release().unwrap();
    }

    #[test]
    fn test_no_data() {
        let sd = SharedData::new();
        assert!(sd.dir().is_empty());
        let _g = sd.lock();
        assert!(matches!(sd.get("name"), Err(OrcaError::UndeclaredField(_))));
    }

    #[test]
    fn test_init_declares_fields() {
        let sd = SharedData::new();
        sample(&sd);
        let attrs = sd.dir();
        assert_eq!(attrs.len(), 3);
        for key in ["name", "test", "config"] {
            assert!(attrs.iter().any(|a| a == key), "missing attr {key}");
        }
    }

    #[test]
    fn test_init_twice_is_protocol_error() {
        let sd = SharedData::new();
        sample(&sd);
        let err = sd.init_data([("other", json!(1))]).unwrap_err();
        assert!(matches!(err, OrcaError::Protocol(_)));
        assert_eq!(sd.dir().len(), 3);
        assert!(!sd.is_owned());
    }

    #[test]
    fn test_protected_read_without_lock_fails() {
        let sd = SharedData::new();
        sample(&sd);
        assert!(matches!(sd.get("name"), Err(OrcaError::Access(_))));
        assert_eq!(sd.dir().len(), 3);
    }

    #[test]
    fn test_access_and_update_under_lock() {
        let sd = SharedData::new();
        sample(&sd);
        {
            let g = sd.lock();
            assert_eq!(g.get("name").unwrap(), json!("Ray"));
            assert!(g.get_as::<bool>("test").unwrap());
            g.set("name", "Plante").unwrap();
            assert_eq!(g.get_as::<String>("name").unwrap(), "Plante");
        }
        assert_eq!(sd.dir().len(), 3);
    }

    #[test]
    fn test_write_without_lock_fails_in_both_modes() {
        for sd in [SharedData::new(), SharedData::readable()] {
            sample(&sd);
            assert!(matches!(sd.set("name", "x"), Err(OrcaError::Access(_))));
        }
    }

    #[test]
    fn test_undeclared_fails_regardless_of_lock() {
        for sd in [SharedData::new(), SharedData::readable()] {
            sample(&sd);
            assert!(matches!(sd.get("goob"), Err(OrcaError::UndeclaredField(_))));
            assert!(matches!(sd.set("goob", 1), Err(OrcaError::UndeclaredField(_))));
            let _g = sd.lock();
            assert!(matches!(sd.get("goob"), Err(OrcaError::UndeclaredField(_))));
            assert!(matches!(sd.set("lname", "Plante"), Err(OrcaError::UndeclaredField(_))));
            assert_eq!(sd.dir().len(), 3);
        }
    }

    #[test]
    fn test_readable_mode_allows_unlocked_reads() {
        let sd = SharedData::readable();
        assert!(!sd.is_read_protected());
        sample(&sd);
        assert_eq!(sd.get("name").unwrap(), json!("Ray"));
        assert_eq!(sd.get_as::<serde_json::Map<String, Value>>("config").unwrap().len(), 0);
    }

    #[test]
    fn test_lock_excludes_other_threads() {
        let sd = Arc::new(SharedData::new());
        sample(&sd);
        sd.acquire();

        let other = Arc::clone(&sd);
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            assert!(!other.is_owned());
            assert!(matches!(other.get("name"), Err(OrcaError::Access(_))));
            assert!(!other.try_acquire());
            assert!(matches!(other.release(), Err(OrcaError::Protocol(_))));
            tx.send(()).unwrap();
            other.acquire();
            other.set("name", "Plante").unwrap();
            other.release().unwrap();
        });

        rx.recv().unwrap();
        sd.release().unwrap();
        handle.join().unwrap();

        let g = sd.lock();
        assert_eq!(g.get_as::<String>("name").unwrap(), "Plante");
    }

    #[test]
    fn test_generation_wakes_waiter() {
        let sd = Arc::new(SharedData::new());
        sample(&sd);
        let before = sd.generation();

        let writer = Arc::clone(&sd);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let g = writer.lock();
            g.set("test", false).unwrap();
        });

        let seen = sd.wait_for_generation(before, Duration::from_secs(5));
        assert!(seen > before);
        handle.join().unwrap();
    }

    #[test]
    fn test_generation_wait_times_out() {
        let sd = SharedData::new();
        let now = sd.generation();
        assert_eq!(sd.wait_for_generation(now, Duration::from_millis(10)), now);
    }
}
