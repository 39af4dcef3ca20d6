//! # Cache Client
//!
//! Purpose: One physical connection to the cache backend. The pool only sees
//! the `CacheClient` trait; `MemcachedClient` is the production
//! implementation speaking the memcached text protocol over TCP or a unix
//! socket.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: The pool is generic over `CacheClient`.
//! 2. **Buffer Reuse**: Each connection keeps its own line and write buffers.
//! 3. **Fail Fast**: A broken stream is dropped immediately; the client then
//!    reports disconnected and the next `connect` starts fresh.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::{ClientConfig, Target};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    encode_gat, encode_get, encode_set, read_item, read_store_reply, validate_key, Item,
    StoreReply, FLAG_JSON, FLAG_LIST, FLAG_TEXT,
};

/// memcached reads expiry values above this many seconds as unix timestamps.
const RELATIVE_EXPIRY_LIMIT_SECS: u64 = 60 * 60 * 24 * 30;

/// Options for a scalar `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Refresh the item's expiry to this TTL while fetching it (`gat`).
    pub touch: Option<Duration>,
}

/// Operations the pool delegates to a single connection.
///
/// Implementations own exactly one connection and are never shared between
/// pool slots.
#[async_trait]
pub trait CacheClient: Send + 'static {
    /// Establishes the connection to `target`.
    async fn connect(&mut self, target: &Target) -> ClientResult<()>;

    /// Returns true while an active connection is held.
    fn is_connected(&self) -> bool;

    /// Drops the connection. The next `connect` starts fresh.
    fn disconnect(&mut self);

    /// Stores a text value. Returns true when the server stored it.
    async fn set(&mut self, table: &str, id: &str, value: &str) -> ClientResult<bool>;

    /// Fetches a text value. Returns `Ok(None)` when the key is missing.
    async fn get(
        &mut self,
        table: &str,
        id: &str,
        options: Option<&GetOptions>,
    ) -> ClientResult<Option<String>>;

    /// Stores a structured record.
    async fn set_json(&mut self, table: &str, id: &str, value: &Value) -> ClientResult<bool>;

    /// Fetches a structured record. Returns `Ok(None)` when the key is missing.
    async fn get_json(&mut self, table: &str, id: &str) -> ClientResult<Option<Value>>;

    /// Stores an ordered list.
    async fn set_list(&mut self, list_id: &str, values: &[Value]) -> ClientResult<bool>;

    /// Fetches an ordered list. Returns `Ok(None)` when the list is missing.
    async fn get_list(&mut self, list_id: &str) -> ClientResult<Option<Vec<Value>>>;
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Single socket with reusable buffers.
struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Box<dyn Transport>>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
    // Set while a request is written but its reply not yet fully read.
    pending: bool,
}

impl Connection {
    async fn open(target: &Target, config: &ClientConfig) -> ClientResult<Self> {
        let stream = with_timeout(config.connect_timeout, open_stream(target)).await?;
        Ok(Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(256),
            pending: false,
        })
    }

    async fn flush_request(&mut self) -> ClientResult<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn store(&mut self, key: &str, flags: u32, exptime: u32, data: &[u8]) -> ClientResult<StoreReply> {
        self.pending = true;
        self.write_buf.clear();
        encode_set(key, flags, exptime, data, &mut self.write_buf);
        self.flush_request().await?;
        let reply = read_store_reply(&mut self.reader, &mut self.line_buf).await;
        self.pending = false;
        reply
    }

    async fn fetch(&mut self, key: &str, touch: Option<u32>) -> ClientResult<Option<Item>> {
        self.pending = true;
        self.write_buf.clear();
        match touch {
            Some(exptime) => encode_gat(exptime, key, &mut self.write_buf),
            None => encode_get(key, &mut self.write_buf),
        }
        self.flush_request().await?;
        let item = read_item(&mut self.reader, &mut self.line_buf, key).await;
        self.pending = false;
        item
    }
}

async fn open_stream(target: &Target) -> ClientResult<Box<dyn Transport>> {
    match target {
        Target::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            // Disable Nagle to keep request latency low for small payloads.
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Target::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Target::Unix(_) => Err(ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ))),
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ClientError::Timeout)?,
        None => fut.await,
    }
}

/// Converts a TTL into a memcached `exptime`.
fn exptime(ttl: Option<Duration>) -> u32 {
    let secs = match ttl {
        None => return 0,
        // Zero would mean "never expires"; round sub-second TTLs up.
        Some(ttl) => ttl.as_secs().max(1),
    };
    if secs <= RELATIVE_EXPIRY_LIMIT_SECS {
        return secs as u32;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    u32::try_from(now.saturating_add(secs)).unwrap_or(u32::MAX)
}

fn item_key(table: &str, id: &str) -> String {
    format!("{}:{}", table, id)
}

fn list_key(list_id: &str) -> String {
    format!("list:{}", list_id)
}

/// Unwraps an item's data, checking the kind recorded in its flags.
fn expect_kind(item: Item, expected: u32) -> ClientResult<Vec<u8>> {
    if item.flags != expected {
        return Err(ClientError::KindMismatch {
            expected,
            found: item.flags,
        });
    }
    Ok(item.data)
}

/// memcached client owning at most one connection.
pub struct MemcachedClient {
    config: ClientConfig,
    conn: Option<Connection>,
}

impl MemcachedClient {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        MemcachedClient { config, conn: None }
    }

    async fn store(&mut self, key: &str, flags: u32, data: &[u8]) -> ClientResult<bool> {
        validate_key(key)?;
        let expiry = exptime(self.config.default_ttl);
        let limit = self.config.io_timeout;
        let conn = self.ready()?;
        let reply = with_timeout(limit, conn.store(key, flags, expiry, data)).await;
        match self.checked(reply)? {
            StoreReply::Stored => Ok(true),
            StoreReply::NotStored => Ok(false),
            StoreReply::Exists | StoreReply::NotFound => Err(ClientError::UnexpectedResponse),
        }
    }

    async fn fetch(&mut self, key: &str, touch: Option<Duration>) -> ClientResult<Option<Item>> {
        validate_key(key)?;
        let touch = touch.map(|ttl| exptime(Some(ttl)));
        let limit = self.config.io_timeout;
        let conn = self.ready()?;
        let item = with_timeout(limit, conn.fetch(key, touch)).await;
        self.checked(item)
    }

    /// Returns the connection, dropping it first if an earlier request was
    /// abandoned before its reply was read.
    fn ready(&mut self) -> ClientResult<&mut Connection> {
        if self.conn.as_ref().map_or(false, |conn| conn.pending) {
            warn!("previous request never completed, dropping memcached connection");
            self.conn = None;
        }
        self.conn.as_mut().ok_or(ClientError::NotConnected)
    }

    /// Drops the stream after failures that leave it out of sync.
    fn checked<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(err) = &result {
            if err.breaks_connection() {
                warn!(error = %err, "dropping broken memcached connection");
                self.conn = None;
            }
        }
        result
    }
}

impl Default for MemcachedClient {
    fn default() -> Self {
        MemcachedClient::new(ClientConfig::default())
    }
}

#[async_trait]
impl CacheClient for MemcachedClient {
    async fn connect(&mut self, target: &Target) -> ClientResult<()> {
        let conn = Connection::open(target, &self.config).await?;
        debug!(addr = %target, "memcached connection established");
        self.conn = Some(conn);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.as_ref().map_or(false, |conn| !conn.pending)
    }

    fn disconnect(&mut self) {
        self.conn = None;
    }

    async fn set(&mut self, table: &str, id: &str, value: &str) -> ClientResult<bool> {
        self.store(&item_key(table, id), FLAG_TEXT, value.as_bytes()).await
    }

    async fn get(
        &mut self,
        table: &str,
        id: &str,
        options: Option<&GetOptions>,
    ) -> ClientResult<Option<String>> {
        let touch = options.and_then(|options| options.touch);
        match self.fetch(&item_key(table, id), touch).await? {
            Some(item) => Ok(Some(String::from_utf8(expect_kind(item, FLAG_TEXT)?)?)),
            None => Ok(None),
        }
    }

    async fn set_json(&mut self, table: &str, id: &str, value: &Value) -> ClientResult<bool> {
        let data = serde_json::to_vec(value)?;
        self.store(&item_key(table, id), FLAG_JSON, &data).await
    }

    async fn get_json(&mut self, table: &str, id: &str) -> ClientResult<Option<Value>> {
        match self.fetch(&item_key(table, id), None).await? {
            Some(item) => Ok(Some(serde_json::from_slice(&expect_kind(item, FLAG_JSON)?)?)),
            None => Ok(None),
        }
    }

    async fn set_list(&mut self, list_id: &str, values: &[Value]) -> ClientResult<bool> {
        let data = serde_json::to_vec(values)?;
        self.store(&list_key(list_id), FLAG_LIST, &data).await
    }

    async fn get_list(&mut self, list_id: &str) -> ClientResult<Option<Vec<Value>>> {
        match self.fetch(&list_key(list_id), None).await? {
            Some(item) => Ok(Some(serde_json::from_slice(&expect_kind(item, FLAG_LIST)?)?)),
            None => Ok(None),
        }
    }
}
