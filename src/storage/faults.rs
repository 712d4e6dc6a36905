use crate::core::IntentId;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Failure injected in front of a lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFault {
    Deadlock,
    Timeout,
}

/// Hook the in-memory store consults before locking and before CAS.
/// Lets tests reproduce contention without real races.
pub trait FaultHook: Send + Sync {
    fn before_lock(&self, _id: &IntentId) -> Option<LockFault> {
        None
    }

    /// `true` forces the CAS to report a version conflict.
    fn before_cas(&self, _id: &IntentId) -> bool {
        false
    }
}

/// Counter-driven faults: the first `n` calls fail, or all of them.
#[derive(Debug, Default)]
pub struct ScriptedFaults {
    deadlocks_left: AtomicU32,
    deadlock_always: AtomicBool,
    timeouts_left: AtomicU32,
    conflicts_left: AtomicU32,
    conflict_always: AtomicBool,
    lock_calls: AtomicU32,
    cas_calls: AtomicU32,
}

impl ScriptedFaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deadlock_first(self, times: u32) -> Self {
        self.deadlocks_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn deadlock_always(self) -> Self {
        self.deadlock_always.store(true, Ordering::SeqCst);
        self
    }

    pub fn timeout_first(self, times: u32) -> Self {
        self.timeouts_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn conflict_first(self, times: u32) -> Self {
        self.conflicts_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn conflict_always(self) -> Self {
        self.conflict_always.store(true, Ordering::SeqCst);
        self
    }

    /// Lock acquisitions seen so far, faulted or not.
    pub fn lock_calls(&self) -> u32 {
        self.lock_calls.load(Ordering::SeqCst)
    }

    pub fn cas_calls(&self) -> u32 {
        self.cas_calls.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

impl FaultHook for ScriptedFaults {
    fn before_lock(&self, _id: &IntentId) -> Option<LockFault> {
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        if self.deadlock_always.load(Ordering::SeqCst) || take_one(&self.deadlocks_left) {
            return Some(LockFault::Deadlock);
        }
        if take_one(&self.timeouts_left) {
            return Some(LockFault::Timeout);
        }
        None
    }

    fn before_cas(&self, _id: &IntentId) -> bool {
        self.cas_calls.fetch_add(1, Ordering::SeqCst);
        self.conflict_always.load(Ordering::SeqCst) || take_one(&self.conflicts_left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counted_faults_run_out() {
        let faults = ScriptedFaults::new().deadlock_first(2).conflict_first(1);
        let id = IntentId::new();

        assert_eq!(faults.before_lock(&id), Some(LockFault::Deadlock));
        assert_eq!(faults.before_lock(&id), Some(LockFault::Deadlock));
        assert_eq!(faults.before_lock(&id), None);
        assert_eq!(faults.lock_calls(), 3);

        assert!(faults.before_cas(&id));
        assert!(!faults.before_cas(&id));
        assert_eq!(faults.cas_calls(), 2);
    }

    #[test]
    fn test_always_faults_never_run_out() {
        let faults = ScriptedFaults::new().deadlock_always().conflict_always();
        let id = IntentId::new();
        for _ in 0..10 {
            assert_eq!(faults.before_lock(&id), Some(LockFault::Deadlock));
            assert!(faults.before_cas(&id));
        }
    }
}
