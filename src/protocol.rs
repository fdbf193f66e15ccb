//! Wire-level types for the sharded KV protocol
//!
//! Control messages (opcodes, keys, status codes) travel over the tagged
//! channel. Values travel by remote memory access against a
//! [`MemoryRegionDescriptor`] the server hands out for one transfer.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Width of the reserved collision-chain field in a stored entry.
pub const CONTINUATION_LEN: usize = 20;

/// Every status code occupies exactly this many bytes on the wire.
pub const STATUS_SLOT_LEN: usize = 10;

/// Three-letter operation tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Put,
    Get,
    Del,
    Contains,
    Hash,
    List,
    Bye,
    Info,
}

impl OpCode {
    pub const ALL: [OpCode; 8] = [
        OpCode::Put,
        OpCode::Get,
        OpCode::Del,
        OpCode::Contains,
        OpCode::Hash,
        OpCode::List,
        OpCode::Bye,
        OpCode::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Put => "PUT",
            OpCode::Get => "GET",
            OpCode::Del => "DEL",
            OpCode::Contains => "CNT",
            OpCode::Hash => "HSH",
            OpCode::List => "LST",
            OpCode::Bye => "BYE",
            OpCode::Info => "INF",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str().as_bytes() == bytes)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric status codes exchanged after each phase.
pub mod status {
    pub const PUT_READY: u32 = 200;
    pub const PUT_COMMIT: u32 = 201;
    pub const PUT_OK: u32 = 202;
    pub const PUT_DUPLICATE: u32 = 400;
    pub const PUT_FAILED: u32 = 401;
    pub const PUT_COMMIT_FAILED: u32 = 402;

    pub const GET_FOUND: u32 = 211;
    pub const GET_ACK: u32 = 212;
    pub const GET_OK: u32 = 213;
    pub const GET_NOT_FOUND: u32 = 411;
    pub const GET_FAILED: u32 = 412;

    pub const DEL_OK: u32 = 221;
    pub const DEL_NOT_FOUND: u32 = 421;

    pub const CNT_FOUND: u32 = 231;
    pub const CNT_NOT_FOUND: u32 = 431;

    pub const HSH_OK: u32 = 241;
    pub const HSH_DONE: u32 = 242;
    pub const HSH_NOT_FOUND: u32 = 441;

    pub const LST_ACK: u32 = 251;
}

/// Unit of storage. Built for a PUT, serialized, sent, discarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    /// Server-side chain linkage; zero-filled by the client.
    pub continuation: [u8; CONTINUATION_LEN],
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            continuation: [0u8; CONTINUATION_LEN],
        }
    }

    /// Serialized size: key prefix + key + value prefix + value + continuation.
    pub fn encoded_len(&self) -> usize {
        4 + self.key.len() + 4 + self.value.len() + CONTINUATION_LEN
    }
}

/// Descriptor for a remote buffer, handed out by the server for one transfer
///
/// `rkey` is the packed transport key; it is opaque to the client and only
/// meaningful to the worker that unpacks it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryRegionDescriptor {
    /// Base address of the region on the remote side
    pub ptr: u64,
    /// Length of the region in bytes
    pub length: u64,
    /// Packed remote key
    pub rkey: SmallVec<[u8; 32]>,
}

impl MemoryRegionDescriptor {
    pub fn new(ptr: u64, length: u64, rkey: &[u8]) -> Self {
        Self {
            ptr,
            length,
            rkey: SmallVec::from_slice(rkey),
        }
    }
}
