// ============================================================================
// Intent Storage
// ============================================================================
//
// Contract every intent backend implements, plus the lock-scoped session
// handed out by `lock_for_update`.
//
// Two write paths exist and both serialize on the same per-id row lock:
// - `compare_and_swap`: version-gated write, returns `false` on a stale version
// - `lock_for_update`: exclusive read/modify/write scope, committed explicitly
//
// A session that is dropped without `commit` rolls back and releases the lock.
//
// ============================================================================

pub mod faults;
pub mod locks;
pub mod memory;

pub use faults::{FaultHook, LockFault, ScriptedFaults};
pub use locks::LockOwner;
pub use memory::InMemoryIntentStore;

use crate::core::{
    BridgeError, Correction, CorrectionApplied, Intent, IntentId, IntentStatus, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Row filter for [`IntentStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentFilter {
    pub status: Option<IntentStatus>,
    pub intent_type: Option<String>,
    pub limit: Option<usize>,
}

impl IntentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: IntentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn intent_type(mut self, intent_type: impl Into<String>) -> Self {
        self.intent_type = Some(intent_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, intent: &Intent) -> bool {
        let status_ok = self.status.is_none_or(|status| intent.status == status);
        let type_ok = self
            .intent_type
            .as_ref()
            .is_none_or(|intent_type| &intent.intent_type == intent_type);
        status_ok && type_ok
    }
}

/// Backend side of a [`LockSession`]: writes the committed value while the
/// row lock is still held. Dropping the committer releases the lock.
#[async_trait]
pub trait SessionCommitter: Send + Sync {
    async fn persist(&mut self, intent: Intent) -> Result<Intent>;
}

/// Exclusive read/modify/write scope over one intent.
///
/// `intent()` is the value as of lock acquisition, or the staged replacement.
/// Only `commit` makes a replacement visible; the version is bumped there.
pub struct LockSession {
    owner: LockOwner,
    original: Intent,
    staged: Option<Intent>,
    committer: Box<dyn SessionCommitter>,
}

impl LockSession {
    pub fn new(owner: LockOwner, original: Intent, committer: Box<dyn SessionCommitter>) -> Self {
        Self {
            owner,
            original,
            staged: None,
            committer,
        }
    }

    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    pub fn id(&self) -> IntentId {
        self.original.id
    }

    pub fn intent(&self) -> &Intent {
        self.staged.as_ref().unwrap_or(&self.original)
    }

    /// Value as it was when the lock was acquired.
    pub fn original(&self) -> &Intent {
        &self.original
    }

    pub fn is_dirty(&self) -> bool {
        self.staged.is_some()
    }

    /// Stages `updated` as the value to commit. Identity and creation time
    /// always come from the locked row.
    pub fn replace(&mut self, mut updated: Intent) -> &Intent {
        updated.id = self.original.id;
        updated.created_at = self.original.created_at;
        updated.version = self.original.version;
        self.staged.insert(updated)
    }

    /// Persists the staged value with `version + 1` and releases the lock.
    /// Without a staged value nothing is written and the version is unchanged.
    pub async fn commit(mut self) -> Result<Intent> {
        let Some(mut next) = self.staged.take() else {
            return Ok(self.original);
        };
        next.version = self.original.version + 1;
        next.updated_at = Utc::now();
        self.committer.persist(next).await
    }

    /// Releases the lock without writing.
    pub fn rollback(self) {}
}

impl std::fmt::Debug for LockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSession")
            .field("owner", &self.owner)
            .field("intent_id", &self.original.id)
            .field("version", &self.original.version)
            .field("dirty", &self.staged.is_some())
            .finish()
    }
}

#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Persists a new intent. A nil id is replaced with a fresh one.
    async fn save(&self, intent: Intent) -> Result<Intent>;

    /// Last committed value; never blocks on row locks.
    async fn get(&self, id: &IntentId) -> Result<Intent>;

    async fn list(&self, filter: &IntentFilter) -> Result<Vec<Intent>>;

    /// Writes `intent` with version `expected_version + 1` iff the stored
    /// version still equals `expected_version`. A stale version yields `false`.
    async fn compare_and_swap(
        &self,
        id: &IntentId,
        intent: Intent,
        expected_version: u64,
    ) -> Result<bool>;

    /// Removes the row iff its committed version still equals
    /// `expected_version`. Waits for the row lock like a writer; a version
    /// that moved on yields `false` and the row is kept.
    async fn delete(&self, id: &IntentId, expected_version: u64) -> Result<bool>;

    /// Acquires the row lock on behalf of `owner`. Fails with `LockTimeout`
    /// after `timeout`, or `Deadlock` when waiting would close a cycle.
    async fn lock_for_update_as(
        &self,
        owner: LockOwner,
        id: &IntentId,
        timeout: Duration,
    ) -> Result<LockSession>;

    /// Lock timeout used by the convenience operations below.
    fn lock_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn lock_for_update(&self, id: &IntentId, timeout: Duration) -> Result<LockSession> {
        self.lock_for_update_as(LockOwner::new(), id, timeout).await
    }

    /// Lock-scoped, idempotent correction. A replayed correction id returns
    /// the current intent without writing.
    async fn apply_correction(&self, id: &IntentId, correction: &Correction) -> Result<Intent> {
        let mut session = self.lock_for_update(id, self.lock_timeout()).await?;
        match session.intent().apply_correction(correction)? {
            CorrectionApplied::AlreadyApplied { .. } => Ok(session.original().clone()),
            CorrectionApplied::Applied { intent, .. } => {
                session.replace(intent);
                session.commit().await
            }
        }
    }

    /// Strict status change under the row lock. Setting the current status
    /// again is a no-op.
    async fn update_status(&self, id: &IntentId, status: IntentStatus) -> Result<Intent> {
        let mut session = self.lock_for_update(id, self.lock_timeout()).await?;
        if session.intent().status == status {
            return Ok(session.original().clone());
        }
        let mut next = session.intent().clone();
        next.transition_to(status)?;
        session.replace(next);
        session.commit().await
    }
}

/// Locks every id in ascending order on behalf of a single owner.
///
/// Duplicates are collapsed. On failure the locks already taken are released
/// before the error is returned.
pub async fn lock_many_ordered<S>(
    store: &S,
    owner: LockOwner,
    ids: &[IntentId],
    timeout: Duration,
) -> Result<Vec<LockSession>>
where
    S: IntentStore + ?Sized,
{
    let mut ordered = ids.to_vec();
    ordered.sort();
    ordered.dedup();

    let mut sessions = Vec::with_capacity(ordered.len());
    for id in &ordered {
        sessions.push(store.lock_for_update_as(owner, id, timeout).await?);
    }
    Ok(sessions)
}

/// Commits sessions in order, stopping at the first failure.
pub async fn commit_all(sessions: Vec<LockSession>) -> Result<Vec<Intent>> {
    let mut committed = Vec::with_capacity(sessions.len());
    for session in sessions {
        committed.push(session.commit().await?);
    }
    Ok(committed)
}

pub(crate) fn missing(id: &IntentId) -> BridgeError {
    BridgeError::NotFound(*id)
}
