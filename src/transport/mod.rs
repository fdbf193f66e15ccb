//! Tagged-messaging + remote-memory transport abstraction
//!
//! The engine talks to the network only through [`Worker`]. A worker owns its
//! endpoints and in-flight requests; nothing completes unless [`Worker::progress`]
//! is called. Workers are created by a [`TransportContext`], which outlives
//! them, so a client can throw a wedged worker away and build a fresh one.
//!
//! [`mock`] provides an in-process implementation that also plays the storage
//! node side of the protocol.

pub mod mock;

use crate::error::Result;
use crate::protocol::MemoryRegionDescriptor;
use bytes::Bytes;

/// Message tag. Tag 0 is reserved for the session-tag handshake.
pub type Tag = u64;

pub const HANDSHAKE_TAG: Tag = 0;

/// Identifier of an endpoint within one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u64);

/// One in-flight send, receive, or remote access
///
/// Deliberately neither `Clone` nor `Copy`: whoever holds the handle must
/// either [`Worker::release`] or [`Worker::cancel`] it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RequestHandle(u64);

impl RequestHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Complete,
    Failed(String),
}

/// Unpacked remote key, valid for one transfer against one remote buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct RemoteKey {
    pub endpoint: EndpointId,
    pub remote_addr: u64,
    pub length: u64,
    pub(crate) token: u64,
}

/// A worker context: endpoints, requests and a progress engine
pub trait Worker: Send {
    /// Open an endpoint to `address`.
    fn connect(&mut self, address: &str) -> Result<EndpointId>;

    fn send_tagged(&mut self, endpoint: EndpointId, tag: Tag, data: Bytes) -> Result<RequestHandle>;

    /// Post a receive for the next message under `tag`, at most `capacity` bytes.
    fn recv_tagged(&mut self, tag: Tag, capacity: usize) -> Result<RequestHandle>;

    fn unpack_remote_key(
        &mut self,
        endpoint: EndpointId,
        descriptor: &MemoryRegionDescriptor,
    ) -> Result<RemoteKey>;

    fn release_remote_key(&mut self, key: RemoteKey);

    /// Read `length` bytes from the start of the remote buffer.
    fn remote_get(&mut self, key: &RemoteKey, length: usize) -> Result<RequestHandle>;

    /// Write `data` at the start of the remote buffer.
    fn remote_put(&mut self, key: &RemoteKey, data: Bytes) -> Result<RequestHandle>;

    /// Advance in-flight operations without blocking. Returns completions.
    fn progress(&mut self) -> usize;

    fn status(&self, handle: &RequestHandle) -> RequestStatus;

    /// Reclaim a finished request; returns received bytes for receives and gets.
    fn release(&mut self, handle: RequestHandle) -> Option<Bytes>;

    fn cancel(&mut self, handle: RequestHandle);

    fn close_endpoint(&mut self, endpoint: EndpointId);
}

/// Factory for workers bound to the same transport context.
pub trait TransportContext: Send + Sync {
    fn create_worker(&self) -> Result<Box<dyn Worker>>;
}
