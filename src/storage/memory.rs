use super::faults::{FaultHook, LockFault};
use super::locks::{LockOwner, LockRegistry, RowGuard, acquire_row};
use super::{IntentFilter, IntentStore, LockSession, SessionCommitter, missing};
use crate::config::ConcurrencyConfig;
use crate::core::{BridgeError, Intent, IntentId, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{Instrument, Level, event, info_span};

/// One stored intent: the row lock writers serialize on, and the last
/// committed value readers see.
struct IntentSlot {
    row: Arc<Mutex<()>>,
    committed: RwLock<Intent>,
    /// Set under the row lock when the row is deleted; waiters that were
    /// already queued on `row` see it once they get the lock.
    removed: AtomicBool,
}

impl IntentSlot {
    fn new(intent: Intent) -> Arc<Self> {
        Arc::new(Self {
            row: Arc::new(Mutex::new(())),
            committed: RwLock::new(intent),
            removed: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self, id: &IntentId) -> Result<()> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(missing(id));
        }
        Ok(())
    }
}

type Shard = RwLock<HashMap<IntentId, Arc<IntentSlot>>>;

/// Stable FNV-1a over the id bytes.
fn shard_for(id: &IntentId, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    let mut hash = 14695981039346656037u64;
    for byte in id.as_uuid().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % shard_count as u64) as usize
}

/// Process-local intent store with per-id row locks.
///
/// Intents are spread over `lock_shards` maps so unrelated ids do not
/// contend on the same map lock.
pub struct InMemoryIntentStore {
    shards: Vec<Shard>,
    registry: Arc<LockRegistry>,
    config: ConcurrencyConfig,
    faults: Option<Arc<dyn FaultHook>>,
}

impl InMemoryIntentStore {
    pub fn new() -> Self {
        Self::with_config(ConcurrencyConfig::default())
    }

    pub fn with_config(config: ConcurrencyConfig) -> Self {
        let shard_count = config.lock_shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            registry: Arc::new(LockRegistry::new()),
            config,
            faults: None,
        }
    }

    /// Installs a fault hook consulted before every lock and CAS.
    pub fn with_faults(mut self, faults: Arc<dyn FaultHook>) -> Self {
        self.faults = Some(faults);
        self
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn shard(&self, id: &IntentId) -> &Shard {
        &self.shards[shard_for(id, self.shards.len())]
    }

    async fn slot(&self, id: &IntentId) -> Result<Arc<IntentSlot>> {
        self.shard(id)
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| missing(id))
    }

    async fn lock_row(
        &self,
        slot: &IntentSlot,
        owner: LockOwner,
        id: &IntentId,
        timeout: Duration,
    ) -> Result<RowGuard> {
        acquire_row(
            &self.registry,
            &slot.row,
            owner,
            *id,
            timeout,
            self.config.deadlock_check_interval(),
        )
        .await
    }

    async fn open_session(
        &self,
        owner: LockOwner,
        id: &IntentId,
        timeout: Duration,
    ) -> Result<LockSession> {
        if let Some(faults) = &self.faults {
            match faults.before_lock(id) {
                Some(LockFault::Deadlock) => {
                    return Err(BridgeError::Deadlock {
                        intent_id: *id,
                        attempts: 1,
                    });
                }
                Some(LockFault::Timeout) => {
                    return Err(BridgeError::LockTimeout {
                        intent_id: *id,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                None => {}
            }
        }

        let slot = self.slot(id).await?;
        let row = self.lock_row(&slot, owner, id, timeout).await?;
        slot.ensure_live(id)?;
        let snapshot = slot.committed.read().await.clone();
        Ok(LockSession::new(
            owner,
            snapshot,
            Box::new(SlotCommitter { slot, _row: row }),
        ))
    }
}

impl Default for InMemoryIntentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes through to the slot while the row guard is held.
struct SlotCommitter {
    slot: Arc<IntentSlot>,
    _row: RowGuard,
}

#[async_trait]
impl SessionCommitter for SlotCommitter {
    async fn persist(&mut self, intent: Intent) -> Result<Intent> {
        let mut committed = self.slot.committed.write().await;
        *committed = intent.clone();
        event!(
            Level::DEBUG,
            intent_id = %intent.id,
            version = intent.version,
            "session committed"
        );
        Ok(intent)
    }
}

#[async_trait]
impl IntentStore for InMemoryIntentStore {
    async fn save(&self, mut intent: Intent) -> Result<Intent> {
        if intent.id.is_nil() {
            intent.id = IntentId::new();
        }
        let mut shard = self.shard(&intent.id).write().await;
        if shard.contains_key(&intent.id) {
            return Err(BridgeError::AlreadyExists(intent.id));
        }
        shard.insert(intent.id, IntentSlot::new(intent.clone()));
        event!(Level::DEBUG, intent_id = %intent.id, intent_type = %intent.intent_type, "intent saved");
        Ok(intent)
    }

    async fn get(&self, id: &IntentId) -> Result<Intent> {
        let slot = self.slot(id).await?;
        let intent = slot.committed.read().await.clone();
        Ok(intent)
    }

    async fn list(&self, filter: &IntentFilter) -> Result<Vec<Intent>> {
        let mut slots = Vec::new();
        for shard in &self.shards {
            slots.extend(shard.read().await.values().cloned());
        }

        let mut intents = Vec::with_capacity(slots.len());
        for slot in slots {
            let intent = slot.committed.read().await;
            if filter.matches(&intent) {
                intents.push(intent.clone());
            }
        }
        intents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            intents.truncate(limit);
        }
        Ok(intents)
    }

    async fn compare_and_swap(
        &self,
        id: &IntentId,
        mut intent: Intent,
        expected_version: u64,
    ) -> Result<bool> {
        let slot = self.slot(id).await?;
        if let Some(faults) = &self.faults {
            if faults.before_cas(id) {
                event!(Level::DEBUG, intent_id = %id, "injected CAS conflict");
                return Ok(false);
            }
        }

        let _row = self
            .lock_row(&slot, LockOwner::new(), id, self.config.lock_timeout())
            .await?;
        slot.ensure_live(id)?;
        let mut committed = slot.committed.write().await;
        if committed.version != expected_version {
            event!(
                Level::DEBUG,
                intent_id = %id,
                expected = expected_version,
                actual = committed.version,
                "CAS version mismatch"
            );
            return Ok(false);
        }

        intent.id = *id;
        intent.created_at = committed.created_at;
        intent.version = expected_version + 1;
        *committed = intent;
        Ok(true)
    }

    async fn delete(&self, id: &IntentId, expected_version: u64) -> Result<bool> {
        let slot = self.slot(id).await?;
        let _row = self
            .lock_row(&slot, LockOwner::new(), id, self.config.lock_timeout())
            .await?;
        slot.ensure_live(id)?;

        let actual = slot.committed.read().await.version;
        if actual != expected_version {
            event!(
                Level::DEBUG,
                intent_id = %id,
                expected = expected_version,
                actual,
                "delete skipped, version moved on"
            );
            return Ok(false);
        }
        slot.removed.store(true, Ordering::SeqCst);
        self.shard(id).write().await.remove(id);
        event!(Level::DEBUG, intent_id = %id, "intent deleted");
        Ok(true)
    }

    async fn lock_for_update_as(
        &self,
        owner: LockOwner,
        id: &IntentId,
        timeout: Duration,
    ) -> Result<LockSession> {
        let span = info_span!("store.lock_for_update", intent_id = %id, owner = %owner);
        self.open_session(owner, id, timeout).instrument(span).await
    }

    fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout()
    }
}
