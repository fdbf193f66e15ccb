//! Tag-scoped message exchange over one endpoint
//!
//! A [`Channel`] borrows the worker for the duration of one exchange and
//! owns nothing beyond it: every buffer lives for one phase, every remote key
//! for one transfer.

use crate::awaiter::{await_request, await_requests};
use crate::codec;
use crate::error::{KvError, Result};
use crate::protocol::{MemoryRegionDescriptor, OpCode, STATUS_SLOT_LEN};
use crate::transport::{EndpointId, Tag, Worker, HANDSHAKE_TAG};
use bytes::Bytes;
use std::time::Duration;

/// Receive the session tag a peer assigns to a freshly created endpoint.
pub async fn receive_session_tag(worker: &mut dyn Worker, timeout: Duration) -> Result<Tag> {
    let handle = worker.recv_tagged(HANDSHAKE_TAG, 4)?;
    let data = await_request(worker, handle, timeout)
        .await?
        .ok_or_else(|| KvError::protocol("empty session tag"))?;
    let tag = codec::decode_i32(&data)?;
    Ok(Tag::from(tag as u32))
}

/// One endpoint plus the session tag that scopes its messages
///
/// Every receive and transfer is awaited with the same per-request timeout.
pub struct Channel<'w> {
    worker: &'w mut dyn Worker,
    endpoint: EndpointId,
    tag: Tag,
    timeout: Duration,
    /// Largest control message we accept
    capacity: usize,
}

impl<'w> Channel<'w> {
    /// Create a channel over `endpoint`, borrowing `worker` for its lifetime
    pub fn new(
        worker: &'w mut dyn Worker,
        endpoint: EndpointId,
        tag: Tag,
        timeout: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            worker,
            endpoint,
            tag,
            timeout,
            capacity,
        }
    }

    /// Post all messages in order and await them as one batch.
    pub async fn send_all(&mut self, messages: Vec<Bytes>) -> Result<()> {
        let mut handles = Vec::with_capacity(messages.len());
        for message in messages {
            match self.worker.send_tagged(self.endpoint, self.tag, message) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        self.worker.cancel(handle);
                    }
                    return Err(e);
                }
            }
        }
        await_requests(self.worker, handles, self.timeout).await?;
        Ok(())
    }

    /// Send one message under the session tag
    pub async fn send(&mut self, message: Bytes) -> Result<()> {
        self.send_all(vec![message]).await
    }

    /// Opcode followed by the length-prefixed key.
    pub async fn send_request(&mut self, op: OpCode, key: &str) -> Result<()> {
        self.send_all(vec![codec::encode_string(op.as_str()), codec::encode_key(key)?])
            .await
    }

    /// Send a status code in its fixed-width slot
    pub async fn send_status(&mut self, code: u32) -> Result<()> {
        self.send(codec::encode_status(code)?).await
    }

    /// Receive the next message, up to the channel's control capacity
    pub async fn recv(&mut self) -> Result<Bytes> {
        let handle = self.worker.recv_tagged(self.tag, self.capacity)?;
        Ok(await_request(self.worker, handle, self.timeout)
            .await?
            .unwrap_or_default())
    }

    /// Receive a status code
    pub async fn recv_status(&mut self) -> Result<u32> {
        let handle = self.worker.recv_tagged(self.tag, STATUS_SLOT_LEN)?;
        let data = await_request(self.worker, handle, self.timeout)
            .await?
            .unwrap_or_default();
        codec::decode_status(&data)
    }

    /// Receive a status and fail with a protocol error unless it is `expected`.
    pub async fn expect_status(&mut self, expected: u32, phase: &str) -> Result<()> {
        match self.recv_status().await? {
            code if code == expected => Ok(()),
            other => Err(KvError::protocol(format!(
                "{}: expected status {}, got {}",
                phase, expected, other
            ))),
        }
    }

    /// Receive a big-endian 4-byte integer
    pub async fn recv_i32(&mut self) -> Result<i32> {
        let handle = self.worker.recv_tagged(self.tag, 4)?;
        let data = await_request(self.worker, handle, self.timeout)
            .await?
            .unwrap_or_default();
        codec::decode_i32(&data)
    }

    /// Receive a UTF-8 string
    pub async fn recv_string(&mut self) -> Result<String> {
        let data = self.recv().await?;
        codec::decode_string(&data)
    }

    /// Receive a remote-memory descriptor
    pub async fn recv_descriptor(&mut self) -> Result<MemoryRegionDescriptor> {
        let data = self.recv().await?;
        codec::decode_descriptor(&data)
    }

    /// Read the whole remote buffer described by `desc`.
    pub async fn read_remote(&mut self, desc: &MemoryRegionDescriptor) -> Result<Bytes> {
        let length = usize::try_from(desc.length)
            .map_err(|_| KvError::protocol(format!("remote length {} too large", desc.length)))?;
        let key = self.worker.unpack_remote_key(self.endpoint, desc)?;
        let outcome = match self.worker.remote_get(&key, length) {
            Ok(handle) => await_request(self.worker, handle, self.timeout).await,
            Err(e) => Err(e),
        };
        self.worker.release_remote_key(key);
        let data = outcome?.unwrap_or_default();
        if data.len() != length {
            return Err(KvError::protocol(format!(
                "remote read returned {} of {} bytes",
                data.len(),
                length
            )));
        }
        Ok(data)
    }

    /// Write `data` into the remote buffer described by `desc`.
    pub async fn write_remote(&mut self, desc: &MemoryRegionDescriptor, data: Bytes) -> Result<()> {
        if data.len() as u64 > desc.length {
            return Err(KvError::protocol(format!(
                "{} bytes do not fit remote buffer of {}",
                data.len(),
                desc.length
            )));
        }
        let key = self.worker.unpack_remote_key(self.endpoint, desc)?;
        let outcome = match self.worker.remote_put(&key, data) {
            Ok(handle) => await_request(self.worker, handle, self.timeout).await,
            Err(e) => Err(e),
        };
        self.worker.release_remote_key(key);
        outcome.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{status, Entry};
    use crate::transport::mock::MockCluster;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_discovery_exchange() {
        let cluster = MockCluster::new(3);
        let mut worker = cluster.context().create_worker().unwrap();
        let ep = worker.connect(&cluster.bootstrap_address()).unwrap();
        let tag = receive_session_tag(worker.as_mut(), TIMEOUT).await.unwrap();

        let mut chan = Channel::new(worker.as_mut(), ep, tag, TIMEOUT, 1024);
        chan.send(codec::encode_string("INF")).await.unwrap();
        assert_eq!(chan.recv_i32().await.unwrap(), 3);
        for expected in cluster.addresses() {
            assert_eq!(chan.recv_string().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_remote_read_releases_region() {
        let cluster = MockCluster::new(1);
        let addr = cluster.bootstrap_address();
        cluster.seed(&addr, "k", b"payload").unwrap();

        let mut worker = cluster.context().create_worker().unwrap();
        let ep = worker.connect(&addr).unwrap();
        let tag = receive_session_tag(worker.as_mut(), TIMEOUT).await.unwrap();
        let mut chan = Channel::new(worker.as_mut(), ep, tag, TIMEOUT, 1024);

        chan.send_request(OpCode::Get, "k").await.unwrap();
        chan.expect_status(status::GET_FOUND, "get").await.unwrap();
        let desc = chan.recv_descriptor().await.unwrap();
        assert_eq!(&chan.read_remote(&desc).await.unwrap()[..], b"payload");
        assert_eq!(cluster.live_regions(), 1);

        chan.send_status(status::GET_ACK).await.unwrap();
        chan.expect_status(status::GET_OK, "get").await.unwrap();
        assert_eq!(cluster.live_regions(), 0);
        assert_eq!(cluster.in_flight_requests(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_status() {
        let cluster = MockCluster::new(1);
        let mut worker = cluster.context().create_worker().unwrap();
        let ep = worker.connect(&cluster.bootstrap_address()).unwrap();
        let tag = receive_session_tag(worker.as_mut(), TIMEOUT).await.unwrap();
        let mut chan = Channel::new(worker.as_mut(), ep, tag, TIMEOUT, 1024);

        chan.send_request(OpCode::Del, "missing").await.unwrap();
        let err = chan.expect_status(status::DEL_OK, "del").await.unwrap_err();
        assert!(matches!(err, KvError::Protocol(_)));
    }

    async fn put_prelude(chan: &mut Channel<'_>, key: &str, len: usize) -> MemoryRegionDescriptor {
        chan.send_all(vec![
            codec::encode_string(OpCode::Put.as_str()),
            codec::encode_key(key).unwrap(),
            codec::encode_i32(len as i32),
        ])
        .await
        .unwrap();
        chan.expect_status(status::PUT_READY, "put").await.unwrap();
        chan.recv_descriptor().await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_of_foreign_entry_fails() {
        let cluster = MockCluster::new(1);
        let addr = cluster.bootstrap_address();
        let mut worker = cluster.context().create_worker().unwrap();
        let ep = worker.connect(&addr).unwrap();
        let tag = receive_session_tag(worker.as_mut(), TIMEOUT).await.unwrap();
        let mut chan = Channel::new(worker.as_mut(), ep, tag, TIMEOUT, 1024);

        // announce "k" but write an entry for "other"
        let payload = codec::encode_entry(&Entry::new("other", b"v".to_vec())).unwrap();
        let desc = put_prelude(&mut chan, "k", payload.len()).await;
        chan.write_remote(&desc, payload).await.unwrap();
        chan.send_status(status::PUT_COMMIT).await.unwrap();
        assert_eq!(chan.recv_status().await.unwrap(), status::PUT_COMMIT_FAILED);

        assert_eq!(cluster.entry_count(&addr), 0);
        assert_eq!(cluster.live_regions(), 0);
        assert_eq!(cluster.in_flight_requests(), 0);
    }

    #[tokio::test]
    async fn test_wrong_commit_signal_fails_put() {
        let cluster = MockCluster::new(1);
        let addr = cluster.bootstrap_address();
        let mut worker = cluster.context().create_worker().unwrap();
        let ep = worker.connect(&addr).unwrap();
        let tag = receive_session_tag(worker.as_mut(), TIMEOUT).await.unwrap();
        let mut chan = Channel::new(worker.as_mut(), ep, tag, TIMEOUT, 1024);

        let payload = codec::encode_entry(&Entry::new("k", b"v".to_vec())).unwrap();
        let desc = put_prelude(&mut chan, "k", payload.len()).await;
        chan.write_remote(&desc, payload).await.unwrap();
        chan.send_status(status::GET_ACK).await.unwrap();
        assert_eq!(chan.recv_status().await.unwrap(), status::PUT_FAILED);

        assert_eq!(cluster.entry_count(&addr), 0);
        assert_eq!(cluster.live_regions(), 0);
    }

    #[tokio::test]
    async fn test_wrong_ack_fails_get() {
        let cluster = MockCluster::new(1);
        let addr = cluster.bootstrap_address();
        cluster.seed(&addr, "k", b"payload").unwrap();

        let mut worker = cluster.context().create_worker().unwrap();
        let ep = worker.connect(&addr).unwrap();
        let tag = receive_session_tag(worker.as_mut(), TIMEOUT).await.unwrap();
        let mut chan = Channel::new(worker.as_mut(), ep, tag, TIMEOUT, 1024);

        chan.send_request(OpCode::Get, "k").await.unwrap();
        chan.expect_status(status::GET_FOUND, "get").await.unwrap();
        let desc = chan.recv_descriptor().await.unwrap();
        chan.read_remote(&desc).await.unwrap();
        chan.send_status(status::LST_ACK).await.unwrap();
        assert_eq!(chan.recv_status().await.unwrap(), status::GET_FAILED);

        assert_eq!(cluster.live_regions(), 0);
        assert_eq!(cluster.in_flight_requests(), 0);
    }

    #[tokio::test]
    async fn test_oversized_remote_write_rejected() {
        let cluster = MockCluster::new(1);
        let mut worker = cluster.context().create_worker().unwrap();
        let ep = worker.connect(&cluster.bootstrap_address()).unwrap();
        let mut chan = Channel::new(worker.as_mut(), ep, 1, TIMEOUT, 1024);

        let desc = MemoryRegionDescriptor::new(0x1000, 2, &[0u8; 8]);
        let err = chan
            .write_remote(&desc, Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Protocol(_)));
    }
}
