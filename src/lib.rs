pub mod awaiter;
pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod shard;
pub mod transport;

pub use client::{ClientConfig, KvClient, SessionState};
pub use error::{KvError, Result};
pub use protocol::{Entry, MemoryRegionDescriptor, OpCode};
pub use shard::{resolve, ShardId, ShardMap};
pub use transport::{TransportContext, Worker};
