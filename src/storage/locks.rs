// ============================================================================
// Row Locks and Deadlock Detection
// ============================================================================
//
// Each intent has one async row mutex. Holders and waiters are recorded in a
// wait-for graph keyed by `LockOwner`; a blocked waiter re-checks the graph
// every `check_interval` and aborts with `Deadlock` once its wait would close
// a cycle. Waits that outlive the timeout end with `LockTimeout`.
//
// ============================================================================

use crate::core::{BridgeError, IntentId, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{Instant, timeout};
use tracing::{Level, event};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity a set of row locks is held under.
///
/// Locks taken by the same owner are one transaction for deadlock detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockOwner(u64);

impl LockOwner {
    pub fn new() -> Self {
        LockOwner(NEXT_OWNER_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner_{}", self.0)
    }
}

#[derive(Debug, Default)]
struct WaitGraph {
    holders: HashMap<IntentId, LockOwner>,
    waiting: HashMap<LockOwner, IntentId>,
}

impl WaitGraph {
    /// Follows holder -> awaited id -> holder edges starting at `id`.
    fn closes_cycle(&self, owner: LockOwner, id: &IntentId) -> bool {
        let Some(mut current) = self.holders.get(id).copied() else {
            return false;
        };
        let mut seen = HashSet::new();
        loop {
            if current == owner {
                return true;
            }
            if !seen.insert(current) {
                return false;
            }
            let Some(next_id) = self.waiting.get(&current) else {
                return false;
            };
            let Some(next_holder) = self.holders.get(next_id) else {
                return false;
            };
            current = *next_holder;
        }
    }
}

/// Shared wait-for graph for all row locks of one store.
#[derive(Debug, Default)]
pub struct LockRegistry {
    graph: Mutex<WaitGraph>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquired(&self, owner: LockOwner, id: IntentId) -> Result<()> {
        let mut graph = self.graph.lock()?;
        graph.waiting.remove(&owner);
        graph.holders.insert(id, owner);
        Ok(())
    }

    fn begin_wait(&self, owner: LockOwner, id: IntentId) -> Result<bool> {
        let mut graph = self.graph.lock()?;
        graph.waiting.insert(owner, id);
        Ok(graph.closes_cycle(owner, &id))
    }

    fn would_deadlock(&self, owner: LockOwner, id: &IntentId) -> Result<bool> {
        Ok(self.graph.lock()?.closes_cycle(owner, id))
    }

    fn end_wait(&self, owner: LockOwner) {
        if let Ok(mut graph) = self.graph.lock() {
            graph.waiting.remove(&owner);
        }
    }

    fn release(&self, owner: LockOwner, id: &IntentId) {
        if let Ok(mut graph) = self.graph.lock() {
            if graph.holders.get(id) == Some(&owner) {
                graph.holders.remove(id);
            }
        }
    }

    /// Current holder of the row lock on `id`, if any.
    pub fn holder_of(&self, id: &IntentId) -> Option<LockOwner> {
        self.graph.lock().ok()?.holders.get(id).copied()
    }
}

/// Held row lock. Dropping it unlocks the row and clears the holder entry.
pub struct RowGuard {
    _guard: OwnedMutexGuard<()>,
    registry: Arc<LockRegistry>,
    owner: LockOwner,
    id: IntentId,
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        self.registry.release(self.owner, &self.id);
    }
}

impl fmt::Debug for RowGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowGuard")
            .field("owner", &self.owner)
            .field("id", &self.id)
            .finish()
    }
}

/// Acquires `row` for `owner`, polling the wait graph while blocked.
pub async fn acquire_row(
    registry: &Arc<LockRegistry>,
    row: &Arc<AsyncMutex<()>>,
    owner: LockOwner,
    id: IntentId,
    wait_limit: Duration,
    check_interval: Duration,
) -> Result<RowGuard> {
    let guard_for = |guard: OwnedMutexGuard<()>| -> Result<RowGuard> {
        registry.acquired(owner, id)?;
        Ok(RowGuard {
            _guard: guard,
            registry: registry.clone(),
            owner,
            id,
        })
    };

    if let Ok(guard) = row.clone().try_lock_owned() {
        return guard_for(guard);
    }

    if registry.begin_wait(owner, id)? {
        registry.end_wait(owner);
        event!(Level::WARN, intent_id = %id, owner = %owner, "lock wait closes a cycle");
        return Err(deadlock(id));
    }

    let deadline = Instant::now() + wait_limit;
    let pending = row.clone().lock_owned();
    tokio::pin!(pending);

    loop {
        let now = Instant::now();
        if now >= deadline {
            registry.end_wait(owner);
            event!(
                Level::WARN,
                intent_id = %id,
                timeout_ms = wait_limit.as_millis() as u64,
                "row lock wait timed out"
            );
            return Err(BridgeError::LockTimeout {
                intent_id: id,
                timeout_ms: wait_limit.as_millis() as u64,
            });
        }

        let slice = check_interval.min(deadline - now);
        match timeout(slice, &mut pending).await {
            Ok(guard) => return guard_for(guard),
            Err(_) => {
                if registry.would_deadlock(owner, &id)? {
                    registry.end_wait(owner);
                    event!(Level::WARN, intent_id = %id, owner = %owner, "deadlock detected");
                    return Err(deadlock(id));
                }
            }
        }
    }
}

fn deadlock(intent_id: IntentId) -> BridgeError {
    BridgeError::Deadlock {
        intent_id,
        attempts: 1,
    }
}
