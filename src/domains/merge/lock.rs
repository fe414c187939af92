use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

// One guard per session id; sync and merge share it
static SESSION_LOCKS: Lazy<DashMap<String, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

/// Held for the duration of one sync or merge. Dropping the last holder
/// removes the session's entry from the lock table.
pub struct SessionGuard {
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Another caller cloning the lock keeps the count above one
        SESSION_LOCKS.remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Returns `None` while another sync or merge holds the session.
pub fn try_acquire(session_id: &str) -> Option<SessionGuard> {
    let lock = SESSION_LOCKS
        .entry(session_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .value()
        .clone();

    let guard = lock.try_lock_owned().ok()?;
    Some(SessionGuard {
        session_id: session_id.to_string(),
        guard: Some(guard),
    })
}
