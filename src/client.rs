//! KV client protocol engine
//!
//! The client bootstraps against one node: it opens an endpoint, receives a
//! session tag, and discovers the shard map with `INF`. Every operation then
//! runs over that endpoint, scoped by the session tag. Values move by remote
//! memory access against descriptors the server hands out; the tagged channel
//! carries only opcodes, keys and status codes.
//!
//! Transient failures (timeouts, transport errors, desynchronized exchanges)
//! are retried by throwing the worker away, reconnecting, and running the
//! exchange again. Missing and duplicate keys are final answers. A session
//! that saw a transient failure is never reused: the next attempt, even one
//! made by a later call, starts with a reconnect.

use crate::codec;
use crate::connection::{receive_session_tag, Channel};
use crate::error::{KvError, Result};
use crate::protocol::{status, Entry, OpCode};
use crate::shard::{resolve, ShardMap};
use crate::transport::{EndpointId, Tag, TransportContext, Worker};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Node the client bootstraps against
    pub bootstrap_addr: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Endpoint + session tag attempts before giving up
    pub connect_attempts: u32,
    /// Attempt budget callers use when they have no better idea
    pub default_attempts: u32,
    /// Largest control message accepted (addresses, descriptors, digests)
    pub control_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_addr: "mock://node0:13337".to_string(),
            request_timeout_ms: 1000,
            connect_attempts: 5,
            default_attempts: 5,
            control_capacity: 4096,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Session lifecycle
///
/// `Ready` drops back to `Connecting` after a transient failure and returns
/// to `Ready` once a reconnect succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Discovering,
    Ready,
    Closed,
}

#[derive(Clone, Copy, Debug)]
struct Session {
    endpoint: EndpointId,
    tag: Tag,
}

enum Request<'a> {
    Put { key: &'a str, value: &'a [u8] },
    Get { key: &'a str },
    Del { key: &'a str },
    Contains { key: &'a str },
    Hash { key: &'a str },
    ListShard { address: &'a str },
    Close,
}

impl Request<'_> {
    fn op(&self) -> OpCode {
        match self {
            Request::Put { .. } => OpCode::Put,
            Request::Get { .. } => OpCode::Get,
            Request::Del { .. } => OpCode::Del,
            Request::Contains { .. } => OpCode::Contains,
            Request::Hash { .. } => OpCode::Hash,
            Request::ListShard { .. } => OpCode::List,
            Request::Close => OpCode::Bye,
        }
    }
}

enum Reply {
    Done,
    Flag(bool),
    Value(Vec<u8>),
    Values(Vec<Vec<u8>>),
}

fn unexpected(op: OpCode, code: u32) -> KvError {
    KvError::protocol(format!("{}: unexpected status {}", op, code))
}

fn exhausted(op: OpCode, attempts: u32, last: Option<KvError>) -> KvError {
    let cause = last.map(|e| e.to_string()).unwrap_or_default();
    KvError::Network(format!("{} failed after {} attempt(s): {}", op, attempts, cause))
}

/// KV client: one session against a bootstrap node
pub struct KvClient {
    config: ClientConfig,
    context: Arc<dyn TransportContext>,
    worker: Box<dyn Worker>,
    session: Option<Session>,
    shard_map: ShardMap,
    state: SessionState,
    /// The current session saw a transient failure and must be replaced
    needs_reconnect: bool,
}

impl KvClient {
    /// Create a client; no network traffic until [`KvClient::initialize`].
    pub fn new(config: ClientConfig, context: Arc<dyn TransportContext>) -> Result<Self> {
        let worker = context.create_worker()?;
        Ok(Self {
            config,
            context,
            worker,
            session: None,
            shard_map: ShardMap::default(),
            state: SessionState::Unconnected,
            needs_reconnect: false,
        })
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Shard map learned during discovery (empty before `initialize`)
    pub fn shard_map(&self) -> &ShardMap {
        &self.shard_map
    }

    /// Tag of the live session, if any
    pub fn session_tag(&self) -> Option<Tag> {
        self.session.map(|s| s.tag)
    }

    /// Shard responsible for `key`, or -1 before discovery.
    pub fn shard_for(&self, key: &str) -> i32 {
        resolve(key, i32::try_from(self.shard_map.len()).unwrap_or(i32::MAX))
    }

    /// Connect to the bootstrap node and discover the shard map.
    pub async fn initialize(&mut self, max_attempts: u32) -> Result<()> {
        let attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.reset_worker()?;
            }
            let outcome = match self.connect().await {
                Ok(()) => self.discover().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    self.state = SessionState::Ready;
                    self.needs_reconnect = false;
                    tracing::info!(
                        "Session ready on {} (tag {:?}, {} shards)",
                        self.config.bootstrap_addr,
                        self.session_tag(),
                        self.shard_map.len()
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Discovery attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    self.state = SessionState::Unconnected;
                    return Err(e);
                }
            }
        }

        self.state = SessionState::Unconnected;
        Err(exhausted(OpCode::Info, attempts, last_error))
    }

    /// Open the bootstrap endpoint and receive the session tag.
    async fn connect(&mut self) -> Result<()> {
        self.state = SessionState::Connecting;
        let attempts = self.config.connect_attempts.max(1);
        let timeout = self.config.request_timeout();
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.reset_worker()?;
            }
            let endpoint = match self.worker.connect(&self.config.bootstrap_addr) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    continue;
                }
            };
            match receive_session_tag(self.worker.as_mut(), timeout).await {
                Ok(tag) => {
                    tracing::debug!("Connected to {} with tag {}", self.config.bootstrap_addr, tag);
                    self.session = Some(Session { endpoint, tag });
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Session tag attempt {}/{} failed: {}", attempt, attempts, e);
                    self.worker.close_endpoint(endpoint);
                    last_error = Some(e);
                }
            }
        }

        Err(KvError::Network(format!(
            "could not connect to {} after {} attempt(s): {}",
            self.config.bootstrap_addr,
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn discover(&mut self) -> Result<()> {
        self.state = SessionState::Discovering;
        let mut chan = self.session_channel()?;

        chan.send(codec::encode_string(OpCode::Info.as_str())).await?;
        let count = chan.recv_i32().await?;
        let count = usize::try_from(count)
            .map_err(|_| KvError::protocol(format!("negative shard count {}", count)))?;
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            addresses.push(chan.recv_string().await?);
        }

        tracing::debug!("Discovered shards: {:?}", addresses);
        self.shard_map = ShardMap::new(addresses);
        Ok(())
    }

    /// Fresh worker from the same context; the old one and its endpoints go away.
    fn reset_worker(&mut self) -> Result<()> {
        self.session = None;
        self.worker = self.context.create_worker()?;
        Ok(())
    }

    /// Replace the worker and re-establish the session; the shard map is kept.
    async fn reconnect(&mut self) -> Result<()> {
        self.reset_worker()?;
        self.connect().await?;
        self.state = SessionState::Ready;
        self.needs_reconnect = false;
        tracing::debug!("Session re-established with tag {:?}", self.session_tag());
        Ok(())
    }

    /// Mark the session dead after a transient failure.
    fn invalidate_session(&mut self) {
        self.needs_reconnect = true;
        self.state = SessionState::Connecting;
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Connecting if self.needs_reconnect => Ok(()),
            _ => Err(KvError::NotConnected),
        }
    }

    fn session_channel(&mut self) -> Result<Channel<'_>> {
        let session = self.session.ok_or(KvError::NotConnected)?;
        Ok(Channel::new(
            self.worker.as_mut(),
            session.endpoint,
            session.tag,
            self.config.request_timeout(),
            self.config.control_capacity,
        ))
    }

    /// Run `request` with up to `max_attempts` attempts, reconnecting in between.
    async fn process_request(&mut self, request: Request<'_>, max_attempts: u32) -> Result<Reply> {
        self.ensure_ready()?;
        let op = request.op();
        let attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let outcome = if self.needs_reconnect {
                match self.reconnect().await {
                    Ok(()) => self.exchange(&request).await,
                    Err(e) => Err(e),
                }
            } else {
                self.exchange(&request).await
            };
            match outcome {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("{} attempt {}/{} failed: {}", op, attempt, attempts, e);
                    self.invalidate_session();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(exhausted(op, attempts, last_error))
    }

    async fn exchange(&mut self, request: &Request<'_>) -> Result<Reply> {
        if let Request::ListShard { address } = request {
            return self.list_shard(address).await.map(Reply::Values);
        }

        let mut chan = self.session_channel()?;
        match *request {
            Request::Put { key, value } => put_exchange(&mut chan, key, value).await.map(|_| Reply::Done),
            Request::Get { key } => get_exchange(&mut chan, key).await.map(Reply::Value),
            Request::Del { key } => del_exchange(&mut chan, key).await.map(|_| Reply::Done),
            Request::Contains { key } => contains_exchange(&mut chan, key).await.map(Reply::Flag),
            Request::Hash { key } => hash_exchange(&mut chan, key).await.map(Reply::Value),
            Request::Close => bye_exchange(&mut chan).await.map(|_| Reply::Done),
            Request::ListShard { .. } => Err(KvError::protocol("listing runs on its own endpoint")),
        }
    }

    /// List one shard over a fresh endpoint with its own session tag.
    async fn list_shard(&mut self, address: &str) -> Result<Vec<Vec<u8>>> {
        let endpoint = self.worker.connect(address)?;
        let outcome = self.list_over(endpoint).await;
        self.worker.close_endpoint(endpoint);
        outcome
    }

    async fn list_over(&mut self, endpoint: EndpointId) -> Result<Vec<Vec<u8>>> {
        let timeout = self.config.request_timeout();
        let tag = receive_session_tag(self.worker.as_mut(), timeout).await?;
        let mut chan = Channel::new(
            self.worker.as_mut(),
            endpoint,
            tag,
            timeout,
            self.config.control_capacity,
        );

        chan.send(codec::encode_string(OpCode::List.as_str())).await?;
        let count = chan.recv_i32().await?;
        let count = usize::try_from(count)
            .map_err(|_| KvError::protocol(format!("negative item count {}", count)))?;

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let desc = chan.recv_descriptor().await?;
            let value = chan.read_remote(&desc).await?;
            chan.send_status(status::LST_ACK).await?;
            items.push(value.to_vec());
        }
        Ok(items)
    }

    /// Store `value` under `key`. Fails with `DuplicateKey` if the key exists.
    pub async fn put(&mut self, key: &str, value: &[u8], max_attempts: u32) -> Result<()> {
        tracing::debug!("PUT {:?} ({} bytes, shard {})", key, value.len(), self.shard_for(key));
        self.process_request(Request::Put { key, value }, max_attempts)
            .await
            .map(|_| ())
    }

    /// Fetch the value stored under `key`. Fails with `KeyNotFound` if absent.
    pub async fn get(&mut self, key: &str, max_attempts: u32) -> Result<Vec<u8>> {
        tracing::debug!("GET {:?} (shard {})", key, self.shard_for(key));
        match self.process_request(Request::Get { key }, max_attempts).await? {
            Reply::Value(value) => Ok(value),
            _ => Err(KvError::protocol("GET produced no value")),
        }
    }

    /// Delete `key`. Fails with `KeyNotFound` if absent.
    pub async fn del(&mut self, key: &str, max_attempts: u32) -> Result<()> {
        tracing::debug!("DEL {:?} (shard {})", key, self.shard_for(key));
        self.process_request(Request::Del { key }, max_attempts)
            .await
            .map(|_| ())
    }

    /// Whether `key` is stored. Absence is an answer, not an error.
    pub async fn contains(&mut self, key: &str, max_attempts: u32) -> Result<bool> {
        match self.process_request(Request::Contains { key }, max_attempts).await? {
            Reply::Flag(found) => Ok(found),
            _ => Err(KvError::protocol("CNT produced no answer")),
        }
    }

    /// Digest of the stored value, as computed by the server.
    pub async fn hash(&mut self, key: &str, max_attempts: u32) -> Result<Vec<u8>> {
        match self.process_request(Request::Hash { key }, max_attempts).await? {
            Reply::Value(digest) => Ok(digest),
            _ => Err(KvError::protocol("HSH produced no digest")),
        }
    }

    /// Every value on every shard, shard by shard.
    ///
    /// Each shard gets its own attempt budget. If any shard runs out, the
    /// whole listing fails and nothing is returned.
    pub async fn list(&mut self, max_attempts: u32) -> Result<Vec<Vec<u8>>> {
        self.ensure_ready()?;
        let shards: Vec<String> = self
            .shard_map
            .iter()
            .map(|(_, address)| address.to_string())
            .collect();

        let mut items = Vec::new();
        for address in &shards {
            match self
                .process_request(Request::ListShard { address }, max_attempts)
                .await?
            {
                Reply::Values(values) => {
                    tracing::debug!("LST {} returned {} items", address, values.len());
                    items.extend(values);
                }
                _ => return Err(KvError::protocol("LST produced no items")),
            }
        }
        Ok(items)
    }

    /// Say goodbye to the bootstrap node and tear the session down.
    pub async fn close_connection(&mut self, max_attempts: u32) -> Result<()> {
        self.process_request(Request::Close, max_attempts).await?;
        if let Some(session) = self.session.take() {
            self.worker.close_endpoint(session.endpoint);
        }
        self.state = SessionState::Closed;
        tracing::info!("Session to {} closed", self.config.bootstrap_addr);
        Ok(())
    }
}

async fn put_exchange(chan: &mut Channel<'_>, key: &str, value: &[u8]) -> Result<()> {
    let payload = codec::encode_entry(&Entry::new(key, value.to_vec()))?;
    let length = i32::try_from(payload.len())
        .map_err(|_| KvError::protocol(format!("entry of {} bytes too large", payload.len())))?;

    chan.send_all(vec![
        codec::encode_string(OpCode::Put.as_str()),
        codec::encode_key(key)?,
        codec::encode_i32(length),
    ])
    .await?;
    match chan.recv_status().await? {
        status::PUT_READY => {}
        status::PUT_DUPLICATE => return Err(KvError::DuplicateKey(key.to_string())),
        other => return Err(unexpected(OpCode::Put, other)),
    }

    let desc = chan.recv_descriptor().await?;
    chan.write_remote(&desc, payload).await?;
    chan.send_status(status::PUT_COMMIT).await?;
    match chan.recv_status().await? {
        status::PUT_OK => Ok(()),
        code @ (status::PUT_FAILED | status::PUT_COMMIT_FAILED) => Err(KvError::protocol(
            format!("server rejected commit of {:?} with status {}", key, code),
        )),
        other => Err(unexpected(OpCode::Put, other)),
    }
}

async fn get_exchange(chan: &mut Channel<'_>, key: &str) -> Result<Vec<u8>> {
    chan.send_request(OpCode::Get, key).await?;
    match chan.recv_status().await? {
        status::GET_FOUND => {}
        status::GET_NOT_FOUND => return Err(KvError::KeyNotFound(key.to_string())),
        other => return Err(unexpected(OpCode::Get, other)),
    }

    let desc = chan.recv_descriptor().await?;
    let value = chan.read_remote(&desc).await?;
    chan.send_status(status::GET_ACK).await?;
    chan.expect_status(status::GET_OK, "GET final").await?;
    Ok(value.to_vec())
}

async fn del_exchange(chan: &mut Channel<'_>, key: &str) -> Result<()> {
    chan.send_request(OpCode::Del, key).await?;
    match chan.recv_status().await? {
        status::DEL_OK => Ok(()),
        status::DEL_NOT_FOUND => Err(KvError::KeyNotFound(key.to_string())),
        other => Err(unexpected(OpCode::Del, other)),
    }
}

async fn contains_exchange(chan: &mut Channel<'_>, key: &str) -> Result<bool> {
    chan.send_request(OpCode::Contains, key).await?;
    match chan.recv_status().await? {
        status::CNT_FOUND => Ok(true),
        status::CNT_NOT_FOUND => Ok(false),
        other => Err(unexpected(OpCode::Contains, other)),
    }
}

async fn hash_exchange(chan: &mut Channel<'_>, key: &str) -> Result<Vec<u8>> {
    chan.send_request(OpCode::Hash, key).await?;
    match chan.recv_status().await? {
        status::HSH_OK => {}
        status::HSH_NOT_FOUND => return Err(KvError::KeyNotFound(key.to_string())),
        other => return Err(unexpected(OpCode::Hash, other)),
    }
    let digest = chan.recv().await?;
    chan.expect_status(status::HSH_DONE, "HSH final").await?;
    Ok(digest.to_vec())
}

async fn bye_exchange(chan: &mut Channel<'_>) -> Result<()> {
    chan.send(codec::encode_string(OpCode::Bye.as_str())).await?;
    let echo = chan.recv_string().await?;
    if echo != OpCode::Bye.as_str() {
        return Err(KvError::protocol(format!("BYE answered with {:?}", echo)));
    }
    Ok(())
}
