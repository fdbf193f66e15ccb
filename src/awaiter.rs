//! Poll-with-deadline over a batch of transport requests
//!
//! The worker never blocks; we drive `progress` ourselves and yield to the
//! runtime between steps. A batch either completes entirely or fails, and a
//! failed batch leaves nothing in flight.

use crate::error::{KvError, Result};
use crate::transport::{RequestHandle, RequestStatus, Worker};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

fn cancel_all(worker: &mut dyn Worker, handles: impl Iterator<Item = RequestHandle>) {
    for handle in handles {
        worker.cancel(handle);
    }
}

/// Wait for every handle in order, sharing one deadline.
///
/// Returns one payload slot per handle (received bytes for receives and
/// remote reads, `None` otherwise). On timeout the straggler and all handles
/// after it are cancelled; handles that already completed have been released.
pub async fn await_requests(
    worker: &mut dyn Worker,
    handles: Vec<RequestHandle>,
    timeout: Duration,
) -> Result<Vec<Option<Bytes>>> {
    let deadline = Instant::now() + timeout;
    let mut results = Vec::with_capacity(handles.len());
    let mut remaining = handles.into_iter();

    while let Some(handle) = remaining.next() {
        loop {
            worker.progress();
            match worker.status(&handle) {
                RequestStatus::Complete => {
                    results.push(worker.release(handle));
                    break;
                }
                RequestStatus::Failed(reason) => {
                    worker.release(handle);
                    cancel_all(worker, remaining);
                    return Err(KvError::Transport(reason));
                }
                RequestStatus::Pending if Instant::now() >= deadline => {
                    tracing::debug!("request {} timed out after {:?}", handle.id(), timeout);
                    worker.cancel(handle);
                    cancel_all(worker, remaining);
                    return Err(KvError::Timeout(timeout));
                }
                RequestStatus::Pending => tokio::task::yield_now().await,
            }
        }
    }

    Ok(results)
}

pub async fn await_request(
    worker: &mut dyn Worker,
    handle: RequestHandle,
    timeout: Duration,
) -> Result<Option<Bytes>> {
    let mut results = await_requests(worker, vec![handle], timeout).await?;
    Ok(results.pop().flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::transport::mock::MockCluster;
    use crate::transport::HANDSHAKE_TAG;

    #[tokio::test]
    async fn test_batch_completes() {
        let cluster = MockCluster::new(1);
        let mut worker = cluster.context().create_worker().unwrap();
        worker.connect(&cluster.bootstrap_address()).unwrap();

        let recv = worker.recv_tagged(HANDSHAKE_TAG, 4).unwrap();
        let data = await_request(worker.as_mut(), recv, Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert!(codec::decode_i32(&data).unwrap() > 0);
        assert_eq!(cluster.in_flight_requests(), 0);
    }

    #[tokio::test]
    async fn test_timeout_cancels_remaining() {
        let cluster = MockCluster::new(1);
        let mut worker = cluster.context().create_worker().unwrap();
        worker.connect(&cluster.bootstrap_address()).unwrap();

        let greeting = worker.recv_tagged(HANDSHAKE_TAG, 4).unwrap();
        let never = worker.recv_tagged(4242, 16).unwrap();
        let after = worker.recv_tagged(4243, 16).unwrap();

        let started = std::time::Instant::now();
        let err = await_requests(
            worker.as_mut(),
            vec![greeting, never, after],
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();

        assert_eq!(err, KvError::Timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(cluster.in_flight_requests(), 0);
    }

    #[tokio::test]
    async fn test_failed_request_is_transport_error() {
        let cluster = MockCluster::new(1);
        let mut worker = cluster.context().create_worker().unwrap();
        let ep = worker.connect(&cluster.bootstrap_address()).unwrap();

        let send = worker.send_tagged(ep, 1, Bytes::from_static(b"INF")).unwrap();
        let trailing = worker.recv_tagged(77, 4).unwrap();
        worker.close_endpoint(ep);

        let err = await_requests(worker.as_mut(), vec![send, trailing], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Transport(_)));
        assert_eq!(cluster.in_flight_requests(), 0);
    }
}
