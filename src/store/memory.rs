//! In-memory store for tests
//!
//! Simulates the two behaviours the harness cares about:
//! - READ COMMITTED / READ UNCOMMITTED: every read sees the latest committed
//!   value, commits are last-writer-wins (lost updates are possible)
//! - REPEATABLE READ / SERIALIZABLE: reads come from a snapshot taken at
//!   `BEGIN`, commits are first-committer-wins and losers fail with 40001
//!
//! Every operation can be delayed so tests can force interleavings with
//! `tokio::time::pause`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{AccessMode, IsolationLevel, StoreTransaction, TransactionalStore};
use crate::error::{HarnessError, SQLSTATE_SERIALIZATION_FAILURE};
use crate::transfer::AccountId;

#[derive(Debug, Clone, Copy)]
struct Versioned {
    balance: i64,
    version: u64,
}

#[derive(Default)]
struct Inner {
    rows: Mutex<HashMap<AccountId, Versioned>>,
    latency: Mutex<Duration>,
    fail_begin: AtomicBool,
    begins: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    conflicts: AtomicUsize,
}

impl Inner {
    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn close(&self, committed: bool) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        if committed {
            self.commits.fetch_add(1, Ordering::SeqCst);
        } else {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding the given accounts
    pub fn with_accounts(accounts: &[(AccountId, i64)]) -> Self {
        let store = Self::new();
        for (id, balance) in accounts {
            store.set_balance(*id, *balance);
        }
        store
    }

    /// Delay applied before begin, read, write and commit
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock().unwrap() = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock().unwrap() = latency;
    }

    /// Make `begin` fail as if the pool were unreachable
    pub fn set_fail_begin(&self, fail: bool) {
        self.inner.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a row outside of any transaction
    pub fn set_balance(&self, account: AccountId, balance: i64) {
        let mut rows = self.inner.rows.lock().unwrap();
        let version = rows.get(&account).map(|r| r.version + 1).unwrap_or(0);
        rows.insert(account, Versioned { balance, version });
    }

    /// Latest committed balance
    pub fn balance(&self, account: AccountId) -> Option<i64> {
        self.inner
            .rows
            .lock()
            .unwrap()
            .get(&account)
            .map(|r| r.balance)
    }

    pub fn begins(&self) -> usize {
        self.inner.begins.load(Ordering::SeqCst)
    }

    pub fn open_transactions(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn peak_open_transactions(&self) -> usize {
        self.inner.peak_open.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    pub fn conflicts(&self) -> usize {
        self.inner.conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(
        &self,
        isolation: IsolationLevel,
        mode: AccessMode,
    ) -> Result<Box<dyn StoreTransaction>, HarnessError> {
        self.inner.delay().await;
        if self.inner.fail_begin.load(Ordering::SeqCst) {
            return Err(HarnessError::Connection(
                "memory store: connection refused".to_string(),
            ));
        }

        let snapshot = isolation
            .uses_snapshot()
            .then(|| self.inner.rows.lock().unwrap().clone());

        self.inner.begins.fetch_add(1, Ordering::SeqCst);
        let open = self.inner.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_open.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            isolation,
            mode,
            snapshot,
            writes: BTreeMap::new(),
            finished: false,
        }))
    }
}

pub struct MemoryTransaction {
    inner: Arc<Inner>,
    isolation: IsolationLevel,
    mode: AccessMode,
    snapshot: Option<HashMap<AccountId, Versioned>>,
    writes: BTreeMap<AccountId, i64>,
    finished: bool,
}

impl MemoryTransaction {
    /// First-committer-wins check for snapshot levels
    fn check_conflicts(&self, rows: &HashMap<AccountId, Versioned>) -> Result<(), HarnessError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        if self.writes.is_empty() {
            return Ok(());
        }

        // SERIALIZABLE also guards rows that were only read
        let watched: Vec<&AccountId> = if self.isolation == IsolationLevel::Serializable {
            snapshot.keys().collect()
        } else {
            self.writes.keys().collect()
        };

        for id in watched {
            let seen = snapshot.get(id).map(|r| r.version);
            let now = rows.get(id).map(|r| r.version);
            if seen != now {
                return Err(HarnessError::conflict(
                    SQLSTATE_SERIALIZATION_FAILURE,
                    "could not serialize access due to concurrent update",
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn read_balance(&mut self, account: AccountId) -> Result<i64, HarnessError> {
        self.inner.delay().await;
        if let Some(balance) = self.writes.get(&account) {
            return Ok(*balance);
        }
        let row = match &self.snapshot {
            Some(snapshot) => snapshot.get(&account).copied(),
            None => self.inner.rows.lock().unwrap().get(&account).copied(),
        };
        row.map(|r| r.balance)
            .ok_or(HarnessError::AccountNotFound(account))
    }

    async fn write_balance(
        &mut self,
        account: AccountId,
        balance: i64,
    ) -> Result<u64, HarnessError> {
        self.inner.delay().await;
        if self.mode == AccessMode::ReadOnly {
            return Err(HarnessError::Store(
                "cannot execute UPDATE in a read-only transaction".to_string(),
            ));
        }
        if !self.inner.rows.lock().unwrap().contains_key(&account) {
            return Err(HarnessError::AccountNotFound(account));
        }
        self.writes.insert(account, balance);
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), HarnessError> {
        let mut this = self;
        this.inner.delay().await;
        this.finished = true;

        let result = {
            let mut rows = this.inner.rows.lock().unwrap();
            this.check_conflicts(&rows).map(|()| {
                for (id, balance) in &this.writes {
                    if let Some(row) = rows.get_mut(id) {
                        row.balance = *balance;
                        row.version += 1;
                    }
                }
            })
        };

        if result.is_err() {
            this.inner.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        this.inner.close(result.is_ok());
        result
    }

    async fn rollback(self: Box<Self>) -> Result<(), HarnessError> {
        let mut this = self;
        this.finished = true;
        this.inner.close(false);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.close(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: AccountId = AccountId::new(1);
    const B: AccountId = AccountId::new(2);

    fn store() -> MemoryStore {
        MemoryStore::with_accounts(&[(A, 1000), (B, 2000)])
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let store = store();
        let mut tx = store
            .begin(IsolationLevel::ReadCommitted, AccessMode::ReadWrite)
            .await
            .unwrap();
        tx.write_balance(A, 1500).await.unwrap();
        assert_eq!(tx.read_balance(A).await.unwrap(), 1500);
        assert_eq!(store.balance(A), Some(1000));
        tx.commit().await.unwrap();

        assert_eq!(store.balance(A), Some(1500));
        assert_eq!(store.commits(), 1);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = store();
        {
            let mut tx = store
                .begin(IsolationLevel::Serializable, AccessMode::ReadWrite)
                .await
                .unwrap();
            tx.write_balance(B, 0).await.unwrap();
        }
        assert_eq!(store.balance(B), Some(2000));
        assert_eq!(store.rollbacks(), 1);
        assert_eq!(store.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_read_committed_last_writer_wins() {
        let store = store();
        let mut t1 = store
            .begin(IsolationLevel::ReadCommitted, AccessMode::ReadWrite)
            .await
            .unwrap();
        let mut t2 = store
            .begin(IsolationLevel::ReadCommitted, AccessMode::ReadWrite)
            .await
            .unwrap();

        let b1 = t1.read_balance(B).await.unwrap();
        let b2 = t2.read_balance(B).await.unwrap();
        t1.write_balance(B, b1 - 1000).await.unwrap();
        t2.write_balance(B, b2 - 1000).await.unwrap();
        t1.commit().await.unwrap();
        t2.commit().await.unwrap();

        // Lost update: two withdrawals, one debit
        assert_eq!(store.balance(B), Some(1000));
    }

    #[tokio::test]
    async fn test_serializable_first_committer_wins() {
        let store = store();
        let mut t1 = store
            .begin(IsolationLevel::Serializable, AccessMode::ReadWrite)
            .await
            .unwrap();
        let mut t2 = store
            .begin(IsolationLevel::Serializable, AccessMode::ReadWrite)
            .await
            .unwrap();

        let b1 = t1.read_balance(B).await.unwrap();
        let b2 = t2.read_balance(B).await.unwrap();
        t1.write_balance(B, b1 - 1000).await.unwrap();
        t2.write_balance(B, b2 - 1000).await.unwrap();
        t1.commit().await.unwrap();

        let err = t2.commit().await.unwrap_err();
        assert!(err.is_benign());
        assert_eq!(store.balance(B), Some(1000));
        assert_eq!(store.conflicts(), 1);
        assert_eq!(store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_read_is_stable() {
        let store = store();
        let mut reader = store
            .begin(IsolationLevel::RepeatableRead, AccessMode::ReadOnly)
            .await
            .unwrap();
        store.set_balance(A, 0);
        assert_eq!(reader.read_balance(A).await.unwrap(), 1000);
        assert!(reader.write_balance(A, 1).await.is_err());
        reader.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_begin() {
        let store = store();
        store.set_fail_begin(true);
        let err = store
            .begin(IsolationLevel::ReadCommitted, AccessMode::ReadWrite)
            .await
            .err()
            .unwrap();
        assert!(err.is_connection());
        assert_eq!(store.open_transactions(), 0);
    }
}
