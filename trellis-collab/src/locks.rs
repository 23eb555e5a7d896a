//! Per-element lease locks with pre-emptive acquisition.
//!
//! Each diagram gets its own `tokio::sync::Mutex`, so lock traffic on one
//! diagram never waits on another. Callers that need a check-then-act
//! sequence (the conflict resolver) hold the diagram guard across both steps.
//!
//! Acquisition always wins: any live lock on the same
//! (diagram, element, path) is deactivated and handed back to the caller so
//! the previous holder can be told. Expired locks are treated as absent by
//! every query even before `sweep_expired` removes them.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::model::{ElementLock, LockKind};

/// (element id, element path)
type LockKey = (String, String);

/// What a participant asks for when acquiring.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub session_id: Uuid,
    pub element_id: String,
    pub element_path: String,
    pub kind: LockKind,
    pub holder: Uuid,
    pub ttl: Duration,
}

/// Result of an acquisition.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub lock: ElementLock,
    /// Live lock of a different holder that this acquisition displaced.
    pub preempted: Option<ElementLock>,
}

#[derive(Debug, Default)]
pub struct DiagramLocks {
    locks: HashMap<LockKey, ElementLock>,
}

impl DiagramLocks {
    fn live(&self, now: DateTime<Utc>) -> impl Iterator<Item = &ElementLock> {
        self.locks.values().filter(move |l| l.is_live_at(now))
    }
}

/// Exclusive access to one diagram's locks.
pub struct DiagramGuard {
    diagram_id: Uuid,
    inner: OwnedMutexGuard<DiagramLocks>,
}

impl DiagramGuard {
    pub fn diagram_id(&self) -> Uuid {
        self.diagram_id
    }

    /// Holder of a live lock on `element_id` (any path) other than `requester`.
    pub fn blocking_holder(&self, element_id: &str, requester: Uuid) -> Option<Uuid> {
        let now = Utc::now();
        self.inner
            .live(now)
            .find(|l| l.element_id == element_id && l.holder != requester)
            .map(|l| l.holder)
    }

    pub fn can_edit(&self, element_id: &str, requester: Uuid) -> bool {
        self.blocking_holder(element_id, requester).is_none()
    }

    pub fn acquire(&mut self, req: LockRequest) -> Acquired {
        let now = Utc::now();
        let key = (req.element_id.clone(), req.element_path.clone());

        let preempted = self
            .inner
            .locks
            .remove(&key)
            .filter(|prev| prev.is_live_at(now) && prev.holder != req.holder)
            .map(|mut prev| {
                prev.active = false;
                prev
            });

        let lock = ElementLock {
            id: Uuid::new_v4(),
            session_id: req.session_id,
            diagram_id: self.diagram_id,
            element_id: req.element_id,
            element_path: req.element_path,
            kind: req.kind,
            holder: req.holder,
            acquired_at: now,
            expires_at: now + req.ttl,
            active: true,
        };
        self.inner.locks.insert(key, lock.clone());

        if let Some(prev) = &preempted {
            log::debug!(
                "Lock on {}/{} pre-empted: {} -> {}",
                self.diagram_id,
                lock.element_id,
                prev.holder,
                lock.holder
            );
        }

        Acquired { lock, preempted }
    }

    /// Deactivate the lock on the tuple if `holder` owns it and it is still live.
    pub fn release(&mut self, element_id: &str, element_path: &str, holder: Uuid) -> Option<ElementLock> {
        let now = Utc::now();
        let key = (element_id.to_string(), element_path.to_string());
        match self.inner.locks.get(&key) {
            Some(lock) if lock.holder == holder && lock.is_live_at(now) => {
                self.inner.locks.remove(&key).map(|mut l| {
                    l.active = false;
                    l
                })
            }
            _ => None,
        }
    }

    /// Release every live lock held by `holder`.
    pub fn release_held_by(&mut self, holder: Uuid) -> Vec<ElementLock> {
        self.drain_where(|l| l.holder == holder)
    }

    pub fn release_all(&mut self) -> Vec<ElementLock> {
        self.drain_where(|_| true)
    }

    pub fn active_locks(&self) -> Vec<ElementLock> {
        let mut locks: Vec<_> = self.inner.live(Utc::now()).cloned().collect();
        locks.sort_by_key(|l| l.acquired_at);
        locks
    }

    fn drain_where(&mut self, pred: impl Fn(&ElementLock) -> bool) -> Vec<ElementLock> {
        let now = Utc::now();
        let keys: Vec<LockKey> = self
            .inner
            .locks
            .iter()
            .filter(|(_, l)| pred(l))
            .map(|(k, _)| k.clone())
            .collect();

        let mut released = Vec::new();
        for key in keys {
            if let Some(mut lock) = self.inner.locks.remove(&key) {
                // Expired leases are dropped silently; nobody holds them anymore.
                if lock.is_live_at(now) {
                    lock.active = false;
                    released.push(lock);
                }
            }
        }
        released
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> Vec<ElementLock> {
        let keys: Vec<LockKey> = self
            .inner
            .locks
            .iter()
            .filter(|(_, l)| l.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.inner.locks.remove(&key))
            .map(|mut l| {
                l.active = false;
                l
            })
            .collect()
    }
}

/// All element locks, partitioned by diagram.
pub struct LockTable {
    diagrams: RwLock<HashMap<Uuid, Arc<Mutex<DiagramLocks>>>>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            diagrams: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, diagram_id: Uuid) -> Arc<Mutex<DiagramLocks>> {
        // Fast path: read lock
        {
            let diagrams = self.diagrams.read().await;
            if let Some(slot) = diagrams.get(&diagram_id) {
                return slot.clone();
            }
        }

        // Slow path: write lock to create
        let mut diagrams = self.diagrams.write().await;
        diagrams
            .entry(diagram_id)
            .or_insert_with(|| Arc::new(Mutex::new(DiagramLocks::default())))
            .clone()
    }

    /// Enter the diagram's critical section.
    pub async fn lock_diagram(&self, diagram_id: Uuid) -> DiagramGuard {
        let slot = self.slot(diagram_id).await;
        DiagramGuard {
            diagram_id,
            inner: slot.lock_owned().await,
        }
    }

    pub async fn acquire(&self, diagram_id: Uuid, req: LockRequest) -> Acquired {
        self.lock_diagram(diagram_id).await.acquire(req)
    }

    /// Returns false when `holder` has no live lock on the tuple.
    pub async fn release(&self, diagram_id: Uuid, element_id: &str, element_path: &str, holder: Uuid) -> bool {
        self.lock_diagram(diagram_id)
            .await
            .release(element_id, element_path, holder)
            .is_some()
    }

    pub async fn can_edit(&self, diagram_id: Uuid, element_id: &str, requester: Uuid) -> bool {
        self.lock_diagram(diagram_id).await.can_edit(element_id, requester)
    }

    pub async fn release_held_by(&self, diagram_id: Uuid, holder: Uuid) -> Vec<ElementLock> {
        self.lock_diagram(diagram_id).await.release_held_by(holder)
    }

    pub async fn release_all(&self, diagram_id: Uuid) -> Vec<ElementLock> {
        self.lock_diagram(diagram_id).await.release_all()
    }

    pub async fn active_locks(&self, diagram_id: Uuid) -> Vec<ElementLock> {
        self.lock_diagram(diagram_id).await.active_locks()
    }

    /// Deactivate every expired lock and return them. Only expired rows are
    /// touched, so this is safe to run alongside acquire/release.
    pub async fn sweep_expired(&self) -> Vec<ElementLock> {
        let now = Utc::now();
        let slots: Vec<(Uuid, Arc<Mutex<DiagramLocks>>)> = {
            let diagrams = self.diagrams.read().await;
            diagrams.iter().map(|(id, s)| (*id, s.clone())).collect()
        };

        let mut swept = Vec::new();
        for (diagram_id, slot) in slots {
            let mut guard = DiagramGuard {
                diagram_id,
                inner: slot.lock_owned().await,
            };
            swept.extend(guard.sweep(now));
        }

        self.prune_empty().await;

        if !swept.is_empty() {
            log::debug!("Swept {} expired locks", swept.len());
        }
        swept
    }

    /// Drop diagram slots that hold no locks and that nobody else references.
    async fn prune_empty(&self) {
        let mut diagrams = self.diagrams.write().await;
        diagrams.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            slot.try_lock().map_or(true, |inner| !inner.locks.is_empty())
        });
    }

    /// Number of diagrams with a lock slot.
    pub async fn diagram_count(&self) -> usize {
        self.diagrams.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn request(element_id: &str, holder: Uuid) -> LockRequest {
        LockRequest {
            session_id: Uuid::new_v4(),
            element_id: element_id.to_string(),
            element_path: String::new(),
            kind: LockKind::Element,
            holder,
            ttl: Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_acquire_and_can_edit() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        assert!(table.can_edit(diagram, "e1", bob).await);

        let acquired = table.acquire(diagram, request("e1", alice)).await;
        assert!(acquired.lock.active);
        assert!(acquired.preempted.is_none());
        assert_eq!(acquired.lock.holder, alice);

        assert!(table.can_edit(diagram, "e1", alice).await);
        assert!(!table.can_edit(diagram, "e1", bob).await);
        assert!(table.can_edit(diagram, "e2", bob).await);
    }

    #[tokio::test]
    async fn test_latest_acquirer_wins() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let first = table.acquire(diagram, request("e1", alice)).await;
        let second = table.acquire(diagram, request("e1", bob)).await;

        let preempted = second.preempted.expect("alice's lock should be displaced");
        assert_eq!(preempted.id, first.lock.id);
        assert!(!preempted.active);

        let live = table.active_locks(diagram).await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].holder, bob);
        assert!(!table.can_edit(diagram, "e1", alice).await);
    }

    #[tokio::test]
    async fn test_reacquire_renews_own_lease() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();

        let first = table.acquire(diagram, request("e1", alice)).await;
        let mut longer = request("e1", alice);
        longer.ttl = Duration::minutes(30);
        let second = table.acquire(diagram, longer).await;

        assert!(second.preempted.is_none());
        assert!(second.lock.expires_at > first.lock.expires_at);
        assert_eq!(table.active_locks(diagram).await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        table.acquire(diagram, request("e1", alice)).await;
        assert!(!table.release(diagram, "e1", "", bob).await);
        assert!(!table.can_edit(diagram, "e1", bob).await);

        assert!(table.release(diagram, "e1", "", alice).await);
        // Releasing twice is harmless
        assert!(!table.release(diagram, "e1", "", alice).await);
        assert!(table.can_edit(diagram, "e1", bob).await);
    }

    #[tokio::test]
    async fn test_sub_path_lock_blocks_element_edit() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut req = request("e1", alice);
        req.element_path = "attributes.name".into();
        req.kind = LockKind::Attribute;
        table.acquire(diagram, req).await;

        assert!(!table.can_edit(diagram, "e1", bob).await);
        // A whole-element release does not touch the sub-path lock
        assert!(!table.release(diagram, "e1", "", alice).await);
        assert!(table.release(diagram, "e1", "attributes.name", alice).await);
    }

    #[tokio::test]
    async fn test_expired_lock_treated_as_absent() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut req = request("e1", alice);
        req.ttl = Duration::milliseconds(20);
        table.acquire(diagram, req).await;

        tokio::time::sleep(StdDuration::from_millis(60)).await;

        // Before any sweep
        assert!(table.can_edit(diagram, "e1", bob).await);
        assert!(table.active_locks(diagram).await.is_empty());
        assert!(!table.release(diagram, "e1", "", alice).await);
    }

    #[tokio::test]
    async fn test_sweep_only_touches_expired() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();

        let mut short = request("e1", alice);
        short.ttl = Duration::milliseconds(20);
        table.acquire(diagram, short).await;
        table.acquire(diagram, request("e2", alice)).await;

        tokio::time::sleep(StdDuration::from_millis(60)).await;

        let swept = table.sweep_expired().await;
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].element_id, "e1");
        assert!(!swept[0].active);

        // Idempotent
        assert!(table.sweep_expired().await.is_empty());
        assert_eq!(table.active_locks(diagram).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_prunes_empty_diagrams() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();

        table.acquire(diagram, request("e1", alice)).await;
        table.release(diagram, "e1", "", alice).await;
        assert_eq!(table.diagram_count().await, 1);

        table.sweep_expired().await;
        assert_eq!(table.diagram_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_held_by() {
        let table = LockTable::new();
        let diagram = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        table.acquire(diagram, request("e1", alice)).await;
        table.acquire(diagram, request("e2", alice)).await;
        table.acquire(diagram, request("e3", bob)).await;

        let released = table.release_held_by(diagram, alice).await;
        assert_eq!(released.len(), 2);
        assert!(table.can_edit(diagram, "e1", bob).await);
        assert!(table.can_edit(diagram, "e2", bob).await);
        assert!(!table.can_edit(diagram, "e3", alice).await);

        assert_eq!(table.release_all(diagram).await.len(), 1);
        assert!(table.active_locks(diagram).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let table = Arc::new(LockTable::new());
        let diagram = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.acquire(diagram, request("hot", Uuid::new_v4())).await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(table.active_locks(diagram).await.len(), 1);
    }

    #[tokio::test]
    async fn test_diagrams_are_isolated() {
        let table = LockTable::new();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        table.acquire(d1, request("e1", alice)).await;
        assert!(table.can_edit(d2, "e1", bob).await);
    }
}
