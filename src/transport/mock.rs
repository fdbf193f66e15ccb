//! In-process transport for testing without RDMA hardware
//!
//! [`MockCluster`] holds a set of simulated storage nodes. Each endpoint a
//! [`MockWorker`] opens gets a peer session that speaks the server side of the
//! wire protocol against the node's in-memory store, handing out registered
//! regions from a [`RegionTable`] for the bulk-transfer phases.
//!
//! Nothing moves until the worker is progressed, which keeps the timing of
//! the awaiter honest. Faults can be injected cluster-wide:
//! - keys starting with [`UNRESPONSIVE_KEY_PREFIX`] make the peer go silent;
//! - [`MockCluster::stall_next_requests`] silences the next N operations;
//! - [`MockCluster::refuse_next_connects`] fails the next N endpoint creations;
//! - [`MockCluster::rewrite_next_status`] and [`MockCluster::echo_next_bye`]
//!   corrupt one reply to exercise the client's error paths.

use crate::codec;
use crate::error::{KvError, Result};
use crate::memory::{unpack_rkey, RegionTable, RegionTableConfig};
use crate::protocol::{status, Entry, MemoryRegionDescriptor, OpCode};
use crate::shard::key_digest;
use crate::transport::{
    EndpointId, RemoteKey, RequestHandle, RequestStatus, Tag, TransportContext, Worker,
    HANDSHAKE_TAG,
};
use bytes::Bytes;
use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Keys with this prefix simulate a peer that stops answering.
pub const UNRESPONSIVE_KEY_PREFIX: &str = "timeout_test";

/// Placement digest used by the simulated nodes to bucket entries.
pub type DigestFn = fn(&str) -> u128;

#[derive(Default)]
struct FaultPlan {
    stalls: usize,
    refused_connects: usize,
    /// (status the node meant to send, status it sends instead)
    rewrites: Vec<(u32, u32)>,
    bye_echo: Option<String>,
}

/// One simulated storage node
struct NodeState {
    /// digest -> chain of serialized entries
    buckets: BTreeMap<u128, Vec<Vec<u8>>>,
    regions: RegionTable,
    digest: DigestFn,
}

impl NodeState {
    fn new(index: usize, digest: DigestFn) -> Self {
        let config = RegionTableConfig {
            key_seed: RegionTableConfig::default().key_seed ^ index as u64,
            ..Default::default()
        };
        Self {
            buckets: BTreeMap::new(),
            regions: RegionTable::new(config),
            digest,
        }
    }

    fn lookup(&self, key: &str) -> Option<Entry> {
        self.buckets
            .get(&(self.digest)(key))?
            .iter()
            .filter_map(|raw| codec::decode_entry(raw).ok())
            .find(|entry| entry.key == key)
    }

    /// Append to the key's chain. False if the key is already stored.
    fn insert(&mut self, raw: Vec<u8>) -> Result<bool> {
        let entry = codec::decode_entry(&raw)?;
        if self.lookup(&entry.key).is_some() {
            return Ok(false);
        }
        self.buckets
            .entry((self.digest)(&entry.key))
            .or_default()
            .push(raw);
        Ok(true)
    }

    fn remove(&mut self, key: &str) -> bool {
        let digest = (self.digest)(key);
        let Some(chain) = self.buckets.get_mut(&digest) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|raw| {
            codec::decode_entry(raw)
                .map(|entry| entry.key != key)
                .unwrap_or(true)
        });
        let removed = chain.len() != before;
        if chain.is_empty() {
            self.buckets.remove(&digest);
        }
        removed
    }

    fn values(&self) -> Vec<Vec<u8>> {
        self.buckets
            .values()
            .flatten()
            .filter_map(|raw| codec::decode_entry(raw).ok())
            .map(|entry| entry.value)
            .collect()
    }

    fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

struct ClusterState {
    addresses: Vec<String>,
    nodes: DashMap<String, NodeState>,
    faults: Mutex<FaultPlan>,
    next_session_tag: AtomicU32,
    in_flight: AtomicUsize,
}

impl ClusterState {
    fn with_node<T>(&self, address: &str, f: impl FnOnce(&mut NodeState) -> Result<T>) -> Result<T> {
        let mut node = self
            .nodes
            .get_mut(address)
            .ok_or_else(|| KvError::transport(format!("unknown node {}", address)))?;
        f(node.value_mut())
    }

    fn take_stall(&self) -> bool {
        let mut faults = self.faults.lock();
        if faults.stalls > 0 {
            faults.stalls -= 1;
            true
        } else {
            false
        }
    }

    /// Encode a status reply, applying the first matching rewrite.
    fn status_reply(&self, code: u32) -> Result<Bytes> {
        let code = {
            let mut faults = self.faults.lock();
            match faults.rewrites.iter().position(|(from, _)| *from == code) {
                Some(idx) => {
                    let (_, to) = faults.rewrites.remove(idx);
                    tracing::debug!("rewriting status {} to {}", code, to);
                    to
                }
                None => code,
            }
        };
        codec::encode_status(code)
    }

    fn bye_echo(&self) -> Bytes {
        match self.faults.lock().bye_echo.take() {
            Some(text) => codec::encode_string(&text),
            None => codec::encode_string(OpCode::Bye.as_str()),
        }
    }

    /// Drop a region a peer session was holding.
    fn release_region(&self, node: &str, region: u64) {
        match self.with_node(node, |n| Ok(n.regions.deregister(region))) {
            Ok(Some(contents)) => tracing::trace!(
                "released region {:#x} ({} bytes) on {}",
                region,
                contents.len(),
                node
            ),
            Ok(None) => tracing::trace!("region {:#x} on {} was already released", region, node),
            Err(e) => tracing::trace!("could not release region {:#x}: {}", region, e),
        }
    }

    fn take_refusal(&self) -> bool {
        let mut faults = self.faults.lock();
        if faults.refused_connects > 0 {
            faults.refused_connects -= 1;
            true
        } else {
            false
        }
    }
}

/// A simulated cluster of storage nodes
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<ClusterState>,
}

impl MockCluster {
    /// Cluster of `shard_count` nodes, bucketing keys by their placement digest.
    pub fn new(shard_count: usize) -> Self {
        Self::with_digest(shard_count, key_digest)
    }

    /// Cluster whose nodes bucket keys with `digest`; used to force collisions.
    pub fn with_digest(shard_count: usize, digest: DigestFn) -> Self {
        let addresses: Vec<String> = (0..shard_count)
            .map(|i| format!("mock://node{}:{}", i, 13337 + i))
            .collect();
        let nodes = DashMap::new();
        for (i, addr) in addresses.iter().enumerate() {
            nodes.insert(addr.clone(), NodeState::new(i, digest));
        }
        Self {
            state: Arc::new(ClusterState {
                addresses,
                nodes,
                faults: Mutex::new(FaultPlan::default()),
                next_session_tag: AtomicU32::new(1),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.state.addresses.clone()
    }

    /// Address clients bootstrap against (the first node).
    pub fn bootstrap_address(&self) -> String {
        self.state.addresses.first().cloned().unwrap_or_default()
    }

    pub fn context(&self) -> Arc<dyn TransportContext> {
        Arc::new(MockContext {
            cluster: self.state.clone(),
        })
    }

    /// Store an entry directly on a node, bypassing the wire.
    pub fn seed(&self, address: &str, key: &str, value: &[u8]) -> Result<bool> {
        let raw = codec::encode_entry(&Entry::new(key, value.to_vec()))?;
        self.state.with_node(address, |node| node.insert(raw.to_vec()))
    }

    pub fn stored_value(&self, address: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .nodes
            .get(address)
            .and_then(|node| node.lookup(key))
            .map(|entry| entry.value)
    }

    pub fn entry_count(&self, address: &str) -> usize {
        self.state.nodes.get(address).map(|node| node.len()).unwrap_or(0)
    }

    /// The next `count` operations received by any node are swallowed.
    pub fn stall_next_requests(&self, count: usize) {
        self.state.faults.lock().stalls += count;
    }

    /// The next `count` endpoint creations fail.
    pub fn refuse_next_connects(&self, count: usize) {
        self.state.faults.lock().refused_connects += count;
    }

    /// The next time any node would answer `from`, it answers `to` instead.
    pub fn rewrite_next_status(&self, from: u32, to: u32) {
        self.state.faults.lock().rewrites.push((from, to));
    }

    /// The next BYE is answered with `text` instead of the echoed opcode.
    pub fn echo_next_bye(&self, text: &str) {
        self.state.faults.lock().bye_echo = Some(text.to_string());
    }

    /// Requests posted by any worker and not yet released or cancelled.
    pub fn in_flight_requests(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Registered regions still alive across all nodes.
    pub fn live_regions(&self) -> usize {
        self.state
            .nodes
            .iter()
            .map(|node| node.regions.stats().regions)
            .sum()
    }
}

struct MockContext {
    cluster: Arc<ClusterState>,
}

impl TransportContext for MockContext {
    fn create_worker(&self) -> Result<Box<dyn Worker>> {
        Ok(Box::new(MockWorker::new(self.cluster.clone())))
    }
}

/// Server side of one endpoint
enum PeerState {
    AwaitOpcode,
    AwaitKey(OpCode),
    PutAwaitLength { key: String },
    PutAwaitCommit { key: String, region: u64 },
    GetAwaitAck { region: u64 },
    ListAwaitAck { region: u64, remaining: VecDeque<Vec<u8>> },
    Silent,
    Closed,
}

impl PeerState {
    fn held_region(&self) -> Option<u64> {
        match self {
            PeerState::PutAwaitCommit { region, .. }
            | PeerState::GetAwaitAck { region }
            | PeerState::ListAwaitAck { region, .. } => Some(*region),
            _ => None,
        }
    }
}

struct PeerSession {
    node: String,
    tag: Tag,
    state: PeerState,
}

type Step = (PeerState, Vec<Bytes>);

impl PeerSession {
    fn on_message(&mut self, tag: Tag, data: &[u8], cluster: &ClusterState) -> Vec<Bytes> {
        if tag != self.tag {
            tracing::trace!("peer {} dropping message for tag {}", self.tag, tag);
            return Vec::new();
        }
        let state = std::mem::replace(&mut self.state, PeerState::Silent);
        let held = state.held_region();
        match self.step(state, data, cluster) {
            Ok((next, replies)) => {
                self.state = next;
                replies
            }
            Err(e) => {
                tracing::warn!("peer {} on {} desynchronized: {}", self.tag, self.node, e);
                if let Some(region) = held {
                    cluster.release_region(&self.node, region);
                }
                Vec::new()
            }
        }
    }

    fn release(&mut self, cluster: &ClusterState) {
        if let Some(region) = self.state.held_region() {
            cluster.release_region(&self.node, region);
        }
        self.state = PeerState::Closed;
    }

    fn step(&self, state: PeerState, data: &[u8], cluster: &ClusterState) -> Result<Step> {
        match state {
            PeerState::Silent | PeerState::Closed => Ok((state, Vec::new())),
            PeerState::AwaitOpcode => self.on_opcode(data, cluster),
            PeerState::AwaitKey(op) => {
                let key = codec::decode_key(data)?;
                if key.starts_with(UNRESPONSIVE_KEY_PREFIX) {
                    tracing::debug!("peer {} going silent for {}", self.tag, key);
                    return Ok((PeerState::Silent, Vec::new()));
                }
                cluster.with_node(&self.node, |node| on_key(cluster, node, op, key))
            }
            PeerState::PutAwaitLength { key } => {
                let len = codec::decode_i32(data)?;
                cluster.with_node(&self.node, |node| {
                    if node.lookup(&key).is_some() {
                        let replies = vec![cluster.status_reply(status::PUT_DUPLICATE)?];
                        return Ok((PeerState::AwaitOpcode, replies));
                    }
                    let Ok(len) = usize::try_from(len) else {
                        let replies = vec![cluster.status_reply(status::PUT_FAILED)?];
                        return Ok((PeerState::AwaitOpcode, replies));
                    };
                    let desc = node.regions.register(len);
                    let replies = vec![
                        cluster.status_reply(status::PUT_READY)?,
                        codec::encode_descriptor(&desc)?,
                    ];
                    Ok((PeerState::PutAwaitCommit { key, region: desc.ptr }, replies))
                })
            }
            PeerState::PutAwaitCommit { key, region } => {
                let signal = codec::decode_status(data)?;
                cluster.with_node(&self.node, |node| {
                    let contents = node.regions.deregister(region).unwrap_or_default();
                    if signal != status::PUT_COMMIT {
                        let replies = vec![cluster.status_reply(status::PUT_FAILED)?];
                        return Ok((PeerState::AwaitOpcode, replies));
                    }
                    let stored = match codec::decode_entry(&contents) {
                        Ok(entry) if entry.key == key => node.insert(contents)?,
                        _ => false,
                    };
                    let code = if stored {
                        status::PUT_OK
                    } else {
                        status::PUT_COMMIT_FAILED
                    };
                    Ok((PeerState::AwaitOpcode, vec![cluster.status_reply(code)?]))
                })
            }
            PeerState::GetAwaitAck { region } => {
                let ack = codec::decode_status(data)?;
                cluster.with_node(&self.node, |node| {
                    node.regions.deregister(region);
                    let code = if ack == status::GET_ACK {
                        status::GET_OK
                    } else {
                        status::GET_FAILED
                    };
                    Ok((PeerState::AwaitOpcode, vec![cluster.status_reply(code)?]))
                })
            }
            PeerState::ListAwaitAck { region, mut remaining } => {
                let ack = codec::decode_status(data)?;
                cluster.with_node(&self.node, |node| {
                    node.regions.deregister(region);
                    if ack != status::LST_ACK {
                        return Ok((PeerState::AwaitOpcode, Vec::new()));
                    }
                    match remaining.pop_front() {
                        None => Ok((PeerState::AwaitOpcode, Vec::new())),
                        Some(value) => {
                            let desc = node.regions.register_with(value);
                            let replies = vec![codec::encode_descriptor(&desc)?];
                            Ok((PeerState::ListAwaitAck { region: desc.ptr, remaining }, replies))
                        }
                    }
                })
            }
        }
    }

    fn on_opcode(&self, data: &[u8], cluster: &ClusterState) -> Result<Step> {
        let op = OpCode::from_bytes(data)
            .ok_or_else(|| KvError::protocol(format!("unknown opcode {:?}", data)))?;
        if cluster.take_stall() {
            tracing::debug!("peer {} stalling on {}", self.tag, op);
            return Ok((PeerState::Silent, Vec::new()));
        }
        match op {
            OpCode::Info => {
                let count = i32::try_from(cluster.addresses.len())
                    .map_err(|_| KvError::protocol("too many shards"))?;
                let mut replies = vec![codec::encode_i32(count)];
                replies.extend(cluster.addresses.iter().map(|a| codec::encode_string(a)));
                Ok((PeerState::AwaitOpcode, replies))
            }
            OpCode::Bye => Ok((PeerState::Closed, vec![cluster.bye_echo()])),
            OpCode::List => cluster.with_node(&self.node, |node| {
                let mut remaining: VecDeque<Vec<u8>> = node.values().into();
                let count = i32::try_from(remaining.len())
                    .map_err(|_| KvError::protocol("too many items"))?;
                let mut replies = vec![codec::encode_i32(count)];
                match remaining.pop_front() {
                    None => Ok((PeerState::AwaitOpcode, replies)),
                    Some(value) => {
                        let desc = node.regions.register_with(value);
                        replies.push(codec::encode_descriptor(&desc)?);
                        Ok((PeerState::ListAwaitAck { region: desc.ptr, remaining }, replies))
                    }
                }
            }),
            keyed => Ok((PeerState::AwaitKey(keyed), Vec::new())),
        }
    }
}

fn on_key(
    cluster: &ClusterState,
    node: &mut NodeState,
    op: OpCode,
    key: String,
) -> Result<Step> {
    let done = |code: u32| -> Result<Step> {
        Ok((PeerState::AwaitOpcode, vec![cluster.status_reply(code)?]))
    };
    match op {
        OpCode::Put => Ok((PeerState::PutAwaitLength { key }, Vec::new())),
        OpCode::Get => match node.lookup(&key) {
            None => done(status::GET_NOT_FOUND),
            Some(entry) => {
                let desc = node.regions.register_with(entry.value);
                let replies = vec![
                    cluster.status_reply(status::GET_FOUND)?,
                    codec::encode_descriptor(&desc)?,
                ];
                Ok((PeerState::GetAwaitAck { region: desc.ptr }, replies))
            }
        },
        OpCode::Del if node.remove(&key) => done(status::DEL_OK),
        OpCode::Del => done(status::DEL_NOT_FOUND),
        OpCode::Contains if node.lookup(&key).is_some() => done(status::CNT_FOUND),
        OpCode::Contains => done(status::CNT_NOT_FOUND),
        OpCode::Hash => match node.lookup(&key) {
            None => done(status::HSH_NOT_FOUND),
            Some(entry) => {
                let digest = Bytes::from(Md5::digest(&entry.value).to_vec());
                let replies = vec![
                    cluster.status_reply(status::HSH_OK)?,
                    digest,
                    cluster.status_reply(status::HSH_DONE)?,
                ];
                Ok((PeerState::AwaitOpcode, replies))
            }
        },
        other => Err(KvError::protocol(format!("{} does not take a key", other))),
    }
}

#[derive(Clone)]
enum MockOp {
    Send { endpoint: EndpointId, tag: Tag, data: Bytes },
    Recv { tag: Tag, capacity: usize },
    Get { endpoint: EndpointId, addr: u64, rkey: u64, length: usize },
    Put { endpoint: EndpointId, addr: u64, rkey: u64, data: Bytes },
}

enum MockRequest {
    Pending(MockOp),
    Complete(Option<Bytes>),
    Failed(String),
}

/// Worker over a [`MockCluster`]
pub struct MockWorker {
    cluster: Arc<ClusterState>,
    next_id: u64,
    endpoints: HashMap<EndpointId, PeerSession>,
    /// Messages delivered by peers, waiting for a matching receive
    inbox: HashMap<Tag, VecDeque<Bytes>>,
    requests: BTreeMap<u64, MockRequest>,
    /// token -> unpacked rkey
    remote_keys: HashMap<u64, u64>,
}

impl MockWorker {
    fn new(cluster: Arc<ClusterState>) -> Self {
        Self {
            cluster,
            next_id: 1,
            endpoints: HashMap::new(),
            inbox: HashMap::new(),
            requests: BTreeMap::new(),
            remote_keys: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn post(&mut self, op: MockOp) -> RequestHandle {
        let id = self.next_id();
        self.requests.insert(id, MockRequest::Pending(op));
        self.cluster.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestHandle::new(id)
    }

    fn forget(&mut self, handle: &RequestHandle) -> Option<MockRequest> {
        let request = self.requests.remove(&handle.id());
        if request.is_some() {
            self.cluster.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        request
    }

    fn node_of(&self, endpoint: EndpointId) -> Result<String> {
        self.endpoints
            .get(&endpoint)
            .map(|peer| peer.node.clone())
            .ok_or_else(|| KvError::transport(format!("endpoint {:?} is closed", endpoint)))
    }

    /// `None` while the operation cannot make progress yet.
    fn try_complete(&mut self, op: &MockOp) -> Option<Result<Option<Bytes>>> {
        match op {
            MockOp::Send {
                endpoint,
                tag,
                data,
            } => {
                let Some(peer) = self.endpoints.get_mut(endpoint) else {
                    return Some(Err(KvError::transport(format!(
                        "endpoint {:?} is closed",
                        endpoint
                    ))));
                };
                let replies = peer.on_message(*tag, data, &self.cluster);
                let queue = self.inbox.entry(peer.tag).or_default();
                queue.extend(replies);
                Some(Ok(None))
            }
            MockOp::Recv { tag, capacity } => {
                let message = self.inbox.get_mut(tag)?.pop_front()?;
                if message.len() > *capacity {
                    return Some(Err(KvError::transport(format!(
                        "message of {} bytes truncated by {}-byte receive",
                        message.len(),
                        capacity
                    ))));
                }
                Some(Ok(Some(message)))
            }
            MockOp::Get {
                endpoint,
                addr,
                rkey,
                length,
            } => Some(self.node_of(*endpoint).and_then(|node| {
                self.cluster
                    .with_node(&node, |n| n.regions.read(*addr, *rkey, *length))
                    .map(Some)
            })),
            MockOp::Put {
                endpoint,
                addr,
                rkey,
                data,
            } => Some(self.node_of(*endpoint).and_then(|node| {
                self.cluster
                    .with_node(&node, |n| n.regions.write(*addr, *rkey, data))
                    .map(|_| None)
            })),
        }
    }
}

impl Worker for MockWorker {
    fn connect(&mut self, address: &str) -> Result<EndpointId> {
        if self.cluster.take_refusal() {
            return Err(KvError::transport(format!("connection to {} refused", address)));
        }
        if !self.cluster.nodes.contains_key(address) {
            return Err(KvError::transport(format!("no route to {}", address)));
        }
        let tag = self.cluster.next_session_tag.fetch_add(1, Ordering::SeqCst);
        let endpoint = EndpointId(self.next_id());
        self.endpoints.insert(
            endpoint,
            PeerSession {
                node: address.to_string(),
                tag: Tag::from(tag),
                state: PeerState::AwaitOpcode,
            },
        );
        // the peer greets every new endpoint with its session tag
        let greeting = codec::encode_i32(tag as i32);
        self.inbox.entry(HANDSHAKE_TAG).or_default().push_back(greeting);
        tracing::trace!("mock endpoint {:?} -> {} (tag {})", endpoint, address, tag);
        Ok(endpoint)
    }

    fn send_tagged(&mut self, endpoint: EndpointId, tag: Tag, data: Bytes) -> Result<RequestHandle> {
        if !self.endpoints.contains_key(&endpoint) {
            return Err(KvError::transport(format!("endpoint {:?} is closed", endpoint)));
        }
        Ok(self.post(MockOp::Send {
            endpoint,
            tag,
            data,
        }))
    }

    fn recv_tagged(&mut self, tag: Tag, capacity: usize) -> Result<RequestHandle> {
        Ok(self.post(MockOp::Recv { tag, capacity }))
    }

    fn unpack_remote_key(
        &mut self,
        endpoint: EndpointId,
        descriptor: &MemoryRegionDescriptor,
    ) -> Result<RemoteKey> {
        self.node_of(endpoint)?;
        let rkey = unpack_rkey(descriptor)?;
        let token = self.next_id();
        self.remote_keys.insert(token, rkey);
        Ok(RemoteKey {
            endpoint,
            remote_addr: descriptor.ptr,
            length: descriptor.length,
            token,
        })
    }

    fn release_remote_key(&mut self, key: RemoteKey) {
        self.remote_keys.remove(&key.token);
    }

    fn remote_get(&mut self, key: &RemoteKey, length: usize) -> Result<RequestHandle> {
        let rkey = *self
            .remote_keys
            .get(&key.token)
            .ok_or_else(|| KvError::transport("remote key already released"))?;
        Ok(self.post(MockOp::Get {
            endpoint: key.endpoint,
            addr: key.remote_addr,
            rkey,
            length,
        }))
    }

    fn remote_put(&mut self, key: &RemoteKey, data: Bytes) -> Result<RequestHandle> {
        let rkey = *self
            .remote_keys
            .get(&key.token)
            .ok_or_else(|| KvError::transport("remote key already released"))?;
        Ok(self.post(MockOp::Put {
            endpoint: key.endpoint,
            addr: key.remote_addr,
            rkey,
            data,
        }))
    }

    fn progress(&mut self) -> usize {
        let pending: Vec<(u64, MockOp)> = self
            .requests
            .iter()
            .filter_map(|(id, request)| match request {
                MockRequest::Pending(op) => Some((*id, op.clone())),
                _ => None,
            })
            .collect();

        let mut completed = 0;
        for (id, op) in pending {
            if let Some(outcome) = self.try_complete(&op) {
                completed += 1;
                let finished = match outcome {
                    Ok(data) => MockRequest::Complete(data),
                    Err(e) => MockRequest::Failed(e.to_string()),
                };
                self.requests.insert(id, finished);
            }
        }
        completed
    }

    fn status(&self, handle: &RequestHandle) -> RequestStatus {
        match self.requests.get(&handle.id()) {
            Some(MockRequest::Pending(_)) => RequestStatus::Pending,
            Some(MockRequest::Complete(_)) => RequestStatus::Complete,
            Some(MockRequest::Failed(e)) => RequestStatus::Failed(e.clone()),
            None => RequestStatus::Failed(format!("unknown request {}", handle.id())),
        }
    }

    fn release(&mut self, handle: RequestHandle) -> Option<Bytes> {
        match self.forget(&handle) {
            Some(MockRequest::Complete(data)) => data,
            _ => None,
        }
    }

    fn cancel(&mut self, handle: RequestHandle) {
        if self.forget(&handle).is_some() {
            tracing::trace!("cancelled mock request {}", handle.id());
        }
    }

    fn close_endpoint(&mut self, endpoint: EndpointId) {
        if let Some(mut peer) = self.endpoints.remove(&endpoint) {
            peer.release(&self.cluster);
            self.inbox.remove(&peer.tag);
        }
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        let outstanding = self.requests.len();
        if outstanding > 0 {
            self.cluster.in_flight.fetch_sub(outstanding, Ordering::SeqCst);
        }
        for (_, mut peer) in self.endpoints.drain() {
            peer.release(&self.cluster);
        }
    }
}
