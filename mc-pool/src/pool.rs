//! # Connection Pool
//!
//! Purpose: Share a growable set of cache clients between concurrent callers
//! so each client serves at most one operation at a time.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Clients are created once and reused; slots are
//!    never removed, so the pool only grows.
//! 2. **Grow, Don't Wait**: When every slot is busy a new one is appended
//!    instead of blocking, unless a `max_size` ceiling is configured.
//! 3. **Minimal Locking**: The slot list mutex is held only while scanning or
//!    appending; claiming a slot is a non-blocking `try_lock_owned`.
//! 4. **Scoped Acquisition**: `PooledClient` releases its slot on drop, on
//!    success, failure and cancellation alike.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex as ClientLock, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use crate::client::{CacheClient, GetOptions, MemcachedClient};
use crate::config::{PoolConfig, Target};
use crate::error::{ClientError, ClientResult, PoolError, PoolResult};

/// One pooled client. The slot is locked exactly while its client lock is held.
struct Slot<C> {
    client: Arc<ClientLock<C>>,
    // Mirrors `client.is_connected()` so status can be read without the lock.
    connected: Arc<AtomicBool>,
}

impl<C> Slot<C> {
    fn new(client: C) -> Self {
        Slot {
            client: Arc::new(ClientLock::new(client)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<C> Clone for Slot<C> {
    fn clone(&self) -> Self {
        Slot {
            client: Arc::clone(&self.client),
            connected: Arc::clone(&self.connected),
        }
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    /// An operation currently holds the slot.
    pub locked: bool,
    /// The slot's client holds an active connection.
    pub connected: bool,
}

struct PoolInner<C> {
    target: Target,
    max_size: Option<usize>,
    slots: Mutex<Vec<Slot<C>>>,
    factory: Box<dyn Fn() -> C + Send + Sync>,
}

/// Connection pool handle. Clones share the same slots.
pub struct MemcachedPool<C: CacheClient = MemcachedClient> {
    inner: Arc<PoolInner<C>>,
}

impl<C: CacheClient> Clone for MemcachedPool<C> {
    fn clone(&self) -> Self {
        MemcachedPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MemcachedPool<MemcachedClient> {
    /// Creates a pool of memcached clients.
    ///
    /// Unless `lazy_connect` is set, every slot is connected before this
    /// returns and the first connect failure aborts construction.
    pub async fn new(config: PoolConfig) -> PoolResult<Self> {
        let client_config = config.client.clone();
        Self::with_factory(config, move || MemcachedClient::new(client_config.clone())).await
    }
}

impl<C: CacheClient> MemcachedPool<C> {
    /// Creates a pool whose slots hold clients built by `factory`.
    pub async fn with_factory<F>(config: PoolConfig, factory: F) -> PoolResult<Self>
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        let target = config.target()?;
        let slots = (0..config.pool_size).map(|_| Slot::new(factory())).collect();
        let pool = MemcachedPool {
            inner: Arc::new(PoolInner {
                target,
                max_size: config.max_size,
                slots: Mutex::new(slots),
                factory: Box::new(factory),
            }),
        };
        debug!(
            addr = %pool.inner.target,
            size = config.pool_size,
            lazy = config.lazy_connect,
            "memcached pool created"
        );

        if !config.lazy_connect {
            pool.connect_all().await?;
        }
        Ok(pool)
    }

    /// Connects every disconnected slot, stopping at the first failure.
    async fn connect_all(&self) -> PoolResult<()> {
        let slots = self.inner.slots.lock().clone();
        for (index, slot) in slots.iter().enumerate() {
            let mut client = slot.client.lock().await;
            if !client.is_connected() {
                client
                    .connect(&self.inner.target)
                    .await
                    .map_err(PoolError::Connection)?;
                debug!(slot = index, "slot connected");
            }
            slot.connected.store(client.is_connected(), Ordering::Release);
        }
        Ok(())
    }

    /// Acquires a connected slot, growing the pool when all slots are busy.
    ///
    /// A slot that has never connected, or whose client dropped its
    /// connection, is connected here. On connect failure the slot is released
    /// and left disconnected.
    pub async fn acquire(&self) -> PoolResult<PooledClient<C>> {
        let mut pooled = self.claim_slot()?;
        if !pooled.client.is_connected() {
            debug!(slot = pooled.index, addr = %self.inner.target, "connecting slot on first use");
            pooled
                .client
                .connect(&self.inner.target)
                .await
                .map_err(PoolError::Connection)?;
            pooled.connected.store(true, Ordering::Release);
        }
        Ok(pooled)
    }

    /// Claims the first free slot in growth order, appending one if needed.
    fn claim_slot(&self) -> PoolResult<PooledClient<C>> {
        let mut slots = self.inner.slots.lock();
        loop {
            for (index, slot) in slots.iter().enumerate() {
                if let Ok(client) = Arc::clone(&slot.client).try_lock_owned() {
                    trace!(slot = index, "slot acquired");
                    return Ok(PooledClient {
                        client,
                        connected: Arc::clone(&slot.connected),
                        index,
                        in_flight: false,
                    });
                }
            }

            if let Some(max) = self.inner.max_size {
                if slots.len() >= max {
                    return Err(PoolError::Exhausted { max });
                }
            }
            slots.push(Slot::new((self.inner.factory)()));
            debug!(size = slots.len(), "all slots busy, pool grown");
        }
    }

    /// Number of slots, busy or free.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Returns true when the pool holds no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connection target shared by every slot.
    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// Lock and connection state of every slot, in growth order.
    pub fn status(&self) -> Vec<SlotStatus> {
        self.inner
            .slots
            .lock()
            .iter()
            .map(|slot| SlotStatus {
                locked: slot.client.try_lock().is_err(),
                connected: slot.connected.load(Ordering::Acquire),
            })
            .collect()
    }

    /// Stores a text value under `table`/`id`.
    pub async fn set(&self, table: &str, id: &str, value: &str) -> PoolResult<bool> {
        let mut client = self.acquire().await?;
        let result = client.begin().set(table, id, value).await;
        client.finish(result)
    }

    /// Fetches a text value. Returns `Ok(None)` when the key is missing.
    pub async fn get(
        &self,
        table: &str,
        id: &str,
        options: Option<&GetOptions>,
    ) -> PoolResult<Option<String>> {
        let mut client = self.acquire().await?;
        let result = client.begin().get(table, id, options).await;
        client.finish(result)
    }

    /// Stores a structured record.
    pub async fn set_json<T>(&self, table: &str, id: &str, value: &T) -> PoolResult<bool>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value).map_err(json_error)?;
        let mut client = self.acquire().await?;
        let result = client.begin().set_json(table, id, &value).await;
        client.finish(result)
    }

    /// Fetches a structured record. Returns `Ok(None)` when the key is missing.
    pub async fn get_json<T>(&self, table: &str, id: &str) -> PoolResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let mut client = self.acquire().await?;
        let result = client.begin().get_json(table, id).await;
        let value = client.finish(result)?;
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(json_error)
    }

    /// Stores an ordered list.
    pub async fn set_list<T>(&self, list_id: &str, values: &[T]) -> PoolResult<bool>
    where
        T: Serialize,
    {
        let values = values
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(json_error)?;
        let mut client = self.acquire().await?;
        let result = client.begin().set_list(list_id, &values).await;
        client.finish(result)
    }

    /// Fetches an ordered list in stored order. Returns `Ok(None)` when the
    /// list is missing.
    pub async fn get_list<T>(&self, list_id: &str) -> PoolResult<Option<Vec<T>>>
    where
        T: DeserializeOwned,
    {
        let mut client = self.acquire().await?;
        let result = client.begin().get_list(list_id).await;
        let values = client.finish(result)?;
        values
            .map(|values| {
                values
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<T>, _>>()
            })
            .transpose()
            .map_err(json_error)
    }
}

fn json_error(err: serde_json::Error) -> PoolError {
    PoolError::Operation(ClientError::Json(err))
}

/// RAII guard holding one slot. The slot is released on drop.
pub struct PooledClient<C: CacheClient> {
    client: OwnedMutexGuard<C>,
    connected: Arc<AtomicBool>,
    index: usize,
    in_flight: bool,
}

impl<C: CacheClient> PooledClient<C> {
    /// Position of the held slot in growth order.
    pub fn slot(&self) -> usize {
        self.index
    }

    fn begin(&mut self) -> &mut C {
        self.in_flight = true;
        &mut self.client
    }

    fn finish<T>(&mut self, result: ClientResult<T>) -> PoolResult<T> {
        self.in_flight = false;
        result.map_err(PoolError::Operation)
    }
}

impl<C: CacheClient> Deref for PooledClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C: CacheClient> DerefMut for PooledClient<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

impl<C: CacheClient> Drop for PooledClient<C> {
    fn drop(&mut self) {
        if self.in_flight {
            // Dropped mid-request: the reply may still be on the wire.
            warn!(slot = self.index, "operation cancelled, dropping slot connection");
            self.client.disconnect();
        }
        self.connected
            .store(self.client.is_connected(), Ordering::Release);
        trace!(slot = self.index, "slot released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Barrier;

    #[derive(Clone, Default)]
    struct Backend {
        store: Arc<Mutex<HashMap<String, Value>>>,
        connects: Arc<AtomicUsize>,
        created: Arc<AtomicUsize>,
        fail_connect: Arc<AtomicBool>,
        fail_ops: Arc<AtomicBool>,
        gate: Option<Arc<Barrier>>,
    }

    impl Backend {
        fn gated(parties: usize) -> Self {
            Backend {
                gate: Some(Arc::new(Barrier::new(parties))),
                ..Backend::default()
            }
        }

        fn factory(&self) -> impl Fn() -> MockClient + Send + Sync + 'static {
            let backend = self.clone();
            move || {
                backend.created.fetch_add(1, Ordering::SeqCst);
                MockClient {
                    backend: backend.clone(),
                    connected: false,
                }
            }
        }
    }

    struct MockClient {
        backend: Backend,
        connected: bool,
    }

    impl MockClient {
        async fn exchange(&self) -> ClientResult<()> {
            if !self.connected {
                return Err(ClientError::NotConnected);
            }
            if let Some(gate) = &self.backend.gate {
                gate.wait().await;
            }
            if self.backend.fail_ops.load(Ordering::SeqCst) {
                return Err(ClientError::Server {
                    message: "out of memory".into(),
                });
            }
            Ok(())
        }

        fn put(&self, key: String, value: Value) -> bool {
            self.backend.store.lock().insert(key, value);
            true
        }

        fn fetch(&self, key: &str) -> Option<Value> {
            self.backend.store.lock().get(key).cloned()
        }
    }

    #[async_trait]
    impl CacheClient for MockClient {
        async fn connect(&mut self, _target: &Target) -> ClientResult<()> {
            if self.backend.fail_connect.load(Ordering::SeqCst) {
                return Err(ClientError::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionRefused,
                )));
            }
            self.backend.connects.fetch_add(1, Ordering::SeqCst);
            self.connected = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        async fn set(&mut self, table: &str, id: &str, value: &str) -> ClientResult<bool> {
            self.exchange().await?;
            Ok(self.put(format!("{}:{}", table, id), Value::String(value.to_string())))
        }

        async fn get(
            &mut self,
            table: &str,
            id: &str,
            _options: Option<&GetOptions>,
        ) -> ClientResult<Option<String>> {
            self.exchange().await?;
            Ok(self
                .fetch(&format!("{}:{}", table, id))
                .and_then(|value| value.as_str().map(str::to_string)))
        }

        async fn set_json(&mut self, table: &str, id: &str, value: &Value) -> ClientResult<bool> {
            self.exchange().await?;
            Ok(self.put(format!("{}:{}", table, id), value.clone()))
        }

        async fn get_json(&mut self, table: &str, id: &str) -> ClientResult<Option<Value>> {
            self.exchange().await?;
            Ok(self.fetch(&format!("{}:{}", table, id)))
        }

        async fn set_list(&mut self, list_id: &str, values: &[Value]) -> ClientResult<bool> {
            self.exchange().await?;
            Ok(self.put(format!("list:{}", list_id), Value::Array(values.to_vec())))
        }

        async fn get_list(&mut self, list_id: &str) -> ClientResult<Option<Vec<Value>>> {
            self.exchange().await?;
            Ok(self.fetch(&format!("list:{}", list_id)).and_then(|value| match value {
                Value::Array(items) => Some(items),
                _ => None,
            }))
        }
    }

    fn lazy(pool_size: usize) -> PoolConfig {
        PoolConfig {
            pool_size,
            lazy_connect: true,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn eager_pool_connects_every_slot() {
        for size in [0, 1, 5] {
            let backend = Backend::default();
            let config = PoolConfig {
                pool_size: size,
                ..PoolConfig::default()
            };
            let pool = MemcachedPool::with_factory(config, backend.factory())
                .await
                .unwrap();

            assert_eq!(pool.len(), size);
            assert_eq!(backend.connects.load(Ordering::SeqCst), size);
            assert!(pool.status().iter().all(|s| s.connected && !s.locked));
        }
    }

    #[tokio::test]
    async fn lazy_pool_connects_on_first_acquire() {
        let backend = Backend::default();
        let pool = MemcachedPool::with_factory(lazy(3), backend.factory())
            .await
            .unwrap();
        assert_eq!(backend.connects.load(Ordering::SeqCst), 0);
        assert!(pool.status().iter().all(|s| !s.connected && !s.locked));

        assert!(pool.set("users", "1", "alice").await.unwrap());
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
        let status = pool.status();
        assert!(status[0].connected);
        assert!(!status[1].connected);
    }

    #[tokio::test]
    async fn conflicting_transport_allocates_nothing() {
        let backend = Backend::default();
        let config = PoolConfig {
            unix_path: Some(PathBuf::from("/tmp/mc.sock")),
            host: Some("localhost".into()),
            ..PoolConfig::default()
        };
        let result = MemcachedPool::with_factory(config, backend.factory()).await;
        assert!(matches!(result, Err(PoolError::Configuration(_))));
        assert_eq!(backend.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_sets_grow_pool_by_deficit() {
        let backend = Backend::gated(3);
        let pool = MemcachedPool::with_factory(lazy(2), backend.factory())
            .await
            .unwrap();

        let tasks: Vec<_> = (0..3)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.set("jobs", &i.to_string(), "queued").await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }

        assert_eq!(pool.len(), 3);
        assert_eq!(backend.created.load(Ordering::SeqCst), 3);
        assert!(pool.status().iter().all(|s| !s.locked && s.connected));
    }

    #[tokio::test]
    async fn released_slot_is_reused() {
        let backend = Backend::default();
        let pool = MemcachedPool::with_factory(lazy(1), backend.factory())
            .await
            .unwrap();
        for i in 0..4 {
            pool.set("users", &i.to_string(), "x").await.unwrap();
        }
        assert_eq!(pool.len(), 1);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_takes_first_free_slot_in_order() {
        let backend = Backend::default();
        let pool = MemcachedPool::with_factory(lazy(2), backend.factory())
            .await
            .unwrap();

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!((first.slot(), second.slot()), (0, 1));

        drop(first);
        let again = pool.acquire().await.unwrap();
        assert_eq!(again.slot(), 0);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn held_slots_show_as_locked() {
        let backend = Backend::default();
        let pool = MemcachedPool::with_factory(lazy(2), backend.factory())
            .await
            .unwrap();
        let held = pool.acquire().await.unwrap();
        assert_eq!(
            pool.status(),
            vec![
                SlotStatus {
                    locked: true,
                    connected: true
                },
                SlotStatus {
                    locked: false,
                    connected: false
                },
            ]
        );
        drop(held);
        assert!(!pool.status()[0].locked);
    }

    #[tokio::test]
    async fn failed_operation_releases_slot() {
        let backend = Backend::default();
        backend.fail_ops.store(true, Ordering::SeqCst);
        let pool = MemcachedPool::with_factory(lazy(1), backend.factory())
            .await
            .unwrap();

        let err = pool.set("users", "1", "alice").await.unwrap_err();
        assert!(matches!(err, PoolError::Operation(ClientError::Server { .. })));
        assert_eq!(
            pool.status(),
            vec![SlotStatus {
                locked: false,
                connected: true
            }]
        );

        backend.fail_ops.store(false, Ordering::SeqCst);
        assert!(pool.set("users", "1", "alice").await.unwrap());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn failed_connect_releases_slot() {
        let backend = Backend::default();
        backend.fail_connect.store(true, Ordering::SeqCst);
        let pool = MemcachedPool::with_factory(lazy(1), backend.factory())
            .await
            .unwrap();

        let err = pool.get("users", "1", None).await.unwrap_err();
        assert!(matches!(err, PoolError::Connection(ClientError::Io(_))));
        assert_eq!(
            pool.status(),
            vec![SlotStatus {
                locked: false,
                connected: false
            }]
        );

        backend.fail_connect.store(false, Ordering::SeqCst);
        assert_eq!(pool.get("users", "1", None).await.unwrap(), None);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn eager_connect_failure_aborts_construction() {
        let backend = Backend::default();
        backend.fail_connect.store(true, Ordering::SeqCst);
        let result = MemcachedPool::with_factory(PoolConfig::default(), backend.factory()).await;
        assert!(matches!(result, Err(PoolError::Connection(_))));
    }

    #[tokio::test]
    async fn cancelled_operation_disconnects_slot() {
        // The gate never fills, so the operation hangs until cancelled.
        let backend = Backend::gated(2);
        let pool = MemcachedPool::with_factory(lazy(1), backend.factory())
            .await
            .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            pool.set("users", "1", "alice"),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(
            pool.status(),
            vec![SlotStatus {
                locked: false,
                connected: false
            }]
        );
    }

    #[tokio::test]
    async fn ceiling_fails_fast_when_exhausted() {
        let backend = Backend::default();
        let config = PoolConfig {
            max_size: Some(1),
            ..lazy(1)
        };
        let pool = MemcachedPool::with_factory(config, backend.factory())
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::Exhausted { max: 1 })
        ));
        drop(held);
        assert!(pool.acquire().await.is_ok());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn empty_pool_grows_on_demand() {
        let backend = Backend::default();
        let pool = MemcachedPool::with_factory(lazy(0), backend.factory())
            .await
            .unwrap();
        assert!(pool.is_empty());
        pool.set("users", "1", "alice").await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn json_and_list_values_round_trip() {
        let backend = Backend::default();
        let pool = MemcachedPool::with_factory(lazy(2), backend.factory())
            .await
            .unwrap();

        let missing: Option<Value> = pool.get_json("users", "404").await.unwrap();
        assert!(missing.is_none());

        let record = json!({"name": "alice", "age": 30});
        assert!(pool.set_json("users", "1", &record).await.unwrap());
        let stored: Option<Value> = pool.get_json("users", "1").await.unwrap();
        assert_eq!(stored, Some(record));

        assert!(pool.set_list("mylist", &[1, 2, 3]).await.unwrap());
        let list: Option<Vec<i64>> = pool.get_list("mylist").await.unwrap();
        assert_eq!(list, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn mistyped_json_is_an_operation_error() {
        let backend = Backend::default();
        let pool = MemcachedPool::with_factory(lazy(1), backend.factory())
            .await
            .unwrap();
        pool.set_json("users", "1", &json!({"name": "alice"}))
            .await
            .unwrap();

        let err = pool.get_json::<Vec<u8>>("users", "1").await.unwrap_err();
        assert!(matches!(err, PoolError::Operation(ClientError::Json(_))));
        assert!(!pool.status()[0].locked);
    }
}
