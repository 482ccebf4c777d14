//! etcd-backed distributed leader lock, grounded on
//! `DistributedPolicy.h`/`.cpp` (`EtcdDistributedLock`).

use crate::error::{LeaderLockError, LeaderLockResult};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const MIN_KEEPALIVE_INTERVAL_SECS: i64 = 1;
const MAX_KEEPALIVE_RETRY: u32 = 5;
const MAX_WATCH_RETRY: u32 = 5;
const WATCH_RETRY_GAP_SECS: u64 = 2;

/// The slice of the etcd v3 API the lock actually calls, narrowed to a
/// trait so tests can inject an in-memory fake the way the original swaps
/// in mock gRPC stubs under its `UT_FLAG` constructor.
#[async_trait]
pub trait EtcdOps: Send + Sync {
    async fn try_create_lock(&self, key: &str, value: &str, lease_id: i64) -> LeaderLockResult<bool>;
    async fn read_current_holder(&self, key: &str) -> LeaderLockResult<Option<(String, i64)>>;
    async fn grant_lease(&self, ttl_secs: i64) -> LeaderLockResult<i64>;
    async fn keep_alive_once(&self, lease_id: i64) -> LeaderLockResult<i64>;
    async fn revoke_lease(&self, lease_id: i64) -> LeaderLockResult<()>;
    async fn key_exists(&self, key: &str) -> LeaderLockResult<bool>;
}

/// Real etcd client, talking to a live cluster.
pub struct EtcdClientOps {
    client: Mutex<Client>,
    rpc_timeout: Duration,
}

impl EtcdClientOps {
    pub async fn connect(endpoints: &[String], rpc_timeout: Duration) -> LeaderLockResult<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client: Mutex::new(client), rpc_timeout })
    }

    async fn with_timeout<T>(&self, fut: impl std::future::Future<Output = etcd_client::Result<T>>) -> LeaderLockResult<T> {
        tokio::time::timeout(self.rpc_timeout, fut)
            .await
            .map_err(|_| LeaderLockError::Timeout)?
            .map_err(LeaderLockError::from)
    }
}

#[async_trait]
impl EtcdOps for EtcdClientOps {
    async fn try_create_lock(&self, key: &str, value: &str, lease_id: i64) -> LeaderLockResult<bool> {
        let mut client = self.client.lock().await;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, Some(PutOptions::new().with_lease(lease_id)))])
            .or_else(vec![TxnOp::get(key, None)]);
        let resp = self.with_timeout(client.txn(txn)).await?;
        Ok(resp.succeeded())
    }

    async fn read_current_holder(&self, key: &str) -> LeaderLockResult<Option<(String, i64)>> {
        let mut client = self.client.lock().await;
        let resp = self.with_timeout(client.get(key, None)).await?;
        Ok(resp.kvs().first().map(|kv| (kv.value_str().unwrap_or_default().to_string(), kv.mod_revision())))
    }

    async fn grant_lease(&self, ttl_secs: i64) -> LeaderLockResult<i64> {
        let mut client = self.client.lock().await;
        let resp = self.with_timeout(client.lease_grant(ttl_secs, None)).await?;
        Ok(resp.id())
    }

    async fn keep_alive_once(&self, lease_id: i64) -> LeaderLockResult<i64> {
        let mut client = self.client.lock().await;
        let (mut keeper, mut stream) = self.with_timeout(client.lease_keep_alive(lease_id)).await?;
        keeper.keep_alive().await.map_err(LeaderLockError::from)?;
        match tokio::time::timeout(self.rpc_timeout, stream.message()).await {
            Ok(Ok(Some(resp))) if resp.ttl() > 0 => Ok(resp.ttl()),
            Ok(Ok(_)) => Err(LeaderLockError::Lease("keep-alive rejected by server".into())),
            Ok(Err(err)) => Err(LeaderLockError::from(err)),
            Err(_) => Err(LeaderLockError::Timeout),
        }
    }

    async fn revoke_lease(&self, lease_id: i64) -> LeaderLockResult<()> {
        let mut client = self.client.lock().await;
        self.with_timeout(client.lease_revoke(lease_id)).await?;
        Ok(())
    }

    async fn key_exists(&self, key: &str) -> LeaderLockResult<bool> {
        Ok(self.read_current_holder(key).await?.is_some())
    }
}

pub type LockChangeCallback = dyn Fn(bool) + Send + Sync;

/// etcd-backed mutual-exclusion lock for the global-scheduler leader role.
/// Holding the lock is advisory to the rest of the process: callers decide
/// what "being leader" means (running the scheduler tick loop, say).
pub struct LeaderLock {
    ops: Arc<dyn EtcdOps>,
    lock_key: String,
    client_id: String,
    lease_ttl_secs: i64,
    is_locked: AtomicBool,
    lease_id: AtomicI64,
    last_observed_revision: AtomicI64,
    running: AtomicBool,
    callback: Mutex<Option<Box<LockChangeCallback>>>,
    keepalive_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    watch_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LeaderLock {
    pub fn new(ops: Arc<dyn EtcdOps>, lock_key: String, client_id: String, lease_ttl_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            ops,
            lock_key,
            client_id,
            lease_ttl_secs,
            is_locked: AtomicBool::new(false),
            lease_id: AtomicI64::new(0),
            last_observed_revision: AtomicI64::new(0),
            running: AtomicBool::new(false),
            callback: Mutex::new(None),
            keepalive_handle: std::sync::Mutex::new(None),
            watch_handle: std::sync::Mutex::new(None),
        })
    }

    pub async fn register_callback(&self, callback: Box<LockChangeCallback>) {
        *self.callback.lock().await = Some(callback);
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked.load(Ordering::SeqCst)
    }

    /// Single CAS attempt: create the lock key only if it does not exist
    /// yet. On conflict, records the current holder's revision for
    /// diagnostics and returns `false` without retrying.
    pub async fn acquire_once(&self) -> LeaderLockResult<bool> {
        if self.is_locked.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let lease_id = self.ops.grant_lease(self.lease_ttl_secs).await?;
        let acquired = self.ops.try_create_lock(&self.lock_key, &self.client_id, lease_id).await?;
        if acquired {
            self.lease_id.store(lease_id, Ordering::SeqCst);
            tracing::info!(key = %self.lock_key, client = %self.client_id, "acquired leader lock");
        } else if let Some((holder, revision)) = self.ops.read_current_holder(&self.lock_key).await? {
            self.last_observed_revision.store(revision, Ordering::SeqCst);
            tracing::info!(key = %self.lock_key, %holder, revision, "lock held by another client");
        }
        Ok(acquired)
    }

    async fn handle_lock_change(self: &Arc<Self>, new_state: bool) {
        let old_state = self.is_locked.swap(new_state, Ordering::SeqCst);
        if old_state == new_state {
            return;
        }
        tracing::info!(key = %self.lock_key, locked = new_state, "leader lock state changed");
        if let Some(cb) = self.callback.lock().await.as_ref() {
            cb(new_state);
        }
    }

    /// Fast path if already held; otherwise attempts `acquire_once` and
    /// (re)starts the watch task regardless of the outcome — even the
    /// current holder watches its own key to notice an unexpected lease
    /// loss.
    pub async fn try_lock(self: &Arc<Self>) -> LeaderLockResult<bool> {
        if self.is_locked.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let acquired = self.acquire_once().await?;
        self.handle_lock_change(acquired).await;
        if acquired {
            self.start_keep_alive();
        }
        self.start_watch();
        Ok(acquired)
    }

    pub async fn unlock(&self) {
        if self.is_locked.swap(false, Ordering::SeqCst) {
            let lease_id = self.lease_id.swap(0, Ordering::SeqCst);
            if lease_id != 0 {
                if let Err(err) = self.ops.revoke_lease(lease_id).await {
                    tracing::warn!(?err, "failed to revoke lease on unlock");
                }
            }
            tracing::info!(key = %self.lock_key, "released leader lock");
        }
    }

    fn start_keep_alive(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut retry_count = 0u32;
            while this.is_locked.load(Ordering::SeqCst) {
                let lease_id = this.lease_id.load(Ordering::SeqCst);
                match this.ops.keep_alive_once(lease_id).await {
                    Ok(ttl) => {
                        retry_count = 0;
                        let sleep_secs = (ttl / 2).max(MIN_KEEPALIVE_INTERVAL_SECS) as u64;
                        tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
                    }
                    Err(err) => {
                        retry_count += 1;
                        tracing::warn!(?err, retry_count, "lease keep-alive failed");
                        if retry_count >= MAX_KEEPALIVE_RETRY {
                            tracing::warn!(key = %this.lock_key, "lease presumed lost, stepping down");
                            this.handle_lock_change(false).await;
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        *self.keepalive_handle.lock().expect("lock poisoned") = Some(handle);
    }

    fn start_watch(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut retry_count = 0u32;
            while retry_count < MAX_WATCH_RETRY {
                match this.ops.key_exists(&this.lock_key).await {
                    Ok(true) => {
                        retry_count = 0;
                    }
                    Ok(false) => {
                        retry_count = 0;
                        if !this.is_locked.load(Ordering::SeqCst) {
                            tracing::info!(key = %this.lock_key, "lock released, attempting to acquire");
                            if let Err(err) = this.try_lock().await {
                                tracing::warn!(?err, "follower lock attempt failed");
                            }
                            return;
                        } else {
                            tracing::warn!(key = %this.lock_key, "lock key missing while we believe we hold it");
                            this.handle_lock_change(false).await;
                        }
                    }
                    Err(err) => {
                        retry_count += 1;
                        tracing::warn!(?err, retry_count, "watch range failed");
                    }
                }
                tokio::time::sleep(Duration::from_secs(WATCH_RETRY_GAP_SECS)).await;
            }
            tracing::warn!(key = %this.lock_key, "watch loop exhausted retries, exiting");
        });
        *self.watch_handle.lock().expect("lock poisoned") = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.keepalive_handle.lock().expect("lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.watch_handle.lock().expect("lock poisoned").take() {
            handle.abort();
        }
        self.unlock().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeEtcd {
        locked_by: StdMutex<Option<(String, i64)>>,
        next_lease: AtomicI64,
    }

    #[async_trait]
    impl EtcdOps for FakeEtcd {
        async fn try_create_lock(&self, _key: &str, value: &str, lease_id: i64) -> LeaderLockResult<bool> {
            let mut guard = self.locked_by.lock().unwrap();
            if guard.is_some() {
                return Ok(false);
            }
            *guard = Some((value.to_string(), lease_id));
            Ok(true)
        }

        async fn read_current_holder(&self, _key: &str) -> LeaderLockResult<Option<(String, i64)>> {
            Ok(self.locked_by.lock().unwrap().clone())
        }

        async fn grant_lease(&self, _ttl_secs: i64) -> LeaderLockResult<i64> {
            Ok(self.next_lease.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn keep_alive_once(&self, _lease_id: i64) -> LeaderLockResult<i64> {
            Ok(10)
        }

        async fn revoke_lease(&self, _lease_id: i64) -> LeaderLockResult<()> {
            *self.locked_by.lock().unwrap() = None;
            Ok(())
        }

        async fn key_exists(&self, _key: &str) -> LeaderLockResult<bool> {
            Ok(self.locked_by.lock().unwrap().is_some())
        }
    }

    #[tokio::test]
    async fn acquire_once_is_exclusive() {
        let ops = Arc::new(FakeEtcd::default());
        let lock_a = LeaderLock::new(ops.clone(), "lock/digs".into(), "node-a".into(), 10);
        let lock_b = LeaderLock::new(ops, "lock/digs".into(), "node-b".into(), 10);

        assert!(lock_a.acquire_once().await.expect("acquire should not error"));
        assert!(!lock_b.acquire_once().await.expect("acquire should not error"));
    }

    #[tokio::test]
    async fn unlock_releases_for_others() {
        let ops = Arc::new(FakeEtcd::default());
        let lock_a = LeaderLock::new(ops.clone(), "lock/digs".into(), "node-a".into(), 10);
        assert!(lock_a.acquire_once().await.unwrap());
        lock_a.is_locked.store(true, Ordering::SeqCst);
        lock_a.unlock().await;
        assert!(!lock_a.is_locked());

        let lock_b = LeaderLock::new(ops, "lock/digs".into(), "node-b".into(), 10);
        assert!(lock_b.acquire_once().await.unwrap());
    }
}
