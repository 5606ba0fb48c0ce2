// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Eager RPC client.
//!
//! [`EagerClient::streaming_enqueue_async`] places a request on an ordered
//! stream before it returns and hands back a future for the response. Nodes
//! call it synchronously during dispatch, so the wire order of requests is the
//! order in which the executor dispatched them.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{EagerError, ErrorCode, Result};
use crate::protocol::{EnqueueRequest, EnqueueResponse};

/// Future resolving to the response of one enqueue RPC.
pub type ResponseFuture = BoxFuture<'static, Result<EnqueueResponse>>;

/// Client side of the enqueue stream to one remote worker.
pub trait EagerClient: Send + Sync {
    /// Submits `request` on the stream. The request is ordered relative to
    /// other submissions when this call returns.
    fn streaming_enqueue_async(&self, request: Arc<EnqueueRequest>) -> ResponseFuture;
}

/// Remote side of the enqueue stream.
#[async_trait]
pub trait EnqueueService: Send + Sync + 'static {
    async fn enqueue(&self, request: Arc<EnqueueRequest>) -> Result<EnqueueResponse>;
}

struct PendingEnqueue {
    request: Arc<EnqueueRequest>,
    responder: oneshot::Sender<Result<EnqueueResponse>>,
}

/// [`EagerClient`] that forwards requests to an [`EnqueueService`] strictly in
/// submission order from a single pump task.
///
/// Dropping the client does not cancel anything: the pump forwards whatever
/// is still queued and exits once the queue is empty.
pub struct StreamingEagerClient {
    tx: flume::Sender<PendingEnqueue>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl StreamingEagerClient {
    /// Starts the pump on `runtime`.
    pub fn new(
        service: Arc<dyn EnqueueService>,
        config: &ClientConfig,
        runtime: &tokio::runtime::Handle,
    ) -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let timeout = config.request_timeout_ms.map(Duration::from_millis);

        tracker.spawn_on(pump(rx, service, timeout, cancel.clone()), runtime);
        tracker.close();

        Arc::new(Self {
            tx,
            cancel,
            tracker,
        })
    }

    /// Stops the stream. The in-flight request and everything still queued
    /// resolve with `Cancelled`; later submissions fail with `Unavailable`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the pump task to exit after [`Self::close`].
    pub async fn closed(&self) {
        self.tracker.wait().await;
    }
}

impl EagerClient for StreamingEagerClient {
    fn streaming_enqueue_async(&self, request: Arc<EnqueueRequest>) -> ResponseFuture {
        if self.cancel.is_cancelled() {
            return futures::future::ready(Err(EagerError::unavailable(
                "Enqueue stream is closed",
            )))
            .boxed();
        }

        let (responder, response) = oneshot::channel();
        if self.tx.send(PendingEnqueue { request, responder }).is_err() {
            return futures::future::ready(Err(EagerError::unavailable(
                "Enqueue stream is closed",
            )))
            .boxed();
        }

        async move {
            response.await.unwrap_or_else(|_| {
                Err(EagerError::cancelled(
                    "Enqueue stream dropped the request before responding",
                ))
            })
        }
        .boxed()
    }
}

async fn pump(
    rx: flume::Receiver<PendingEnqueue>,
    service: Arc<dyn EnqueueService>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    loop {
        let pending = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            pending = rx.recv_async() => match pending {
                Ok(pending) => pending,
                Err(_) => break,
            },
        };

        trace!(
            target: "dynamo_eager::client",
            context_id = pending.request.context_id,
            items = pending.request.queue.len(),
            "Forwarding enqueue request"
        );

        let call = service.enqueue(pending.request);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EagerError::cancelled("Enqueue stream closed while the request was in flight")),
            result = with_deadline(call, timeout) => result,
        };
        // the caller may have stopped listening
        let _ = pending.responder.send(result);
    }

    let mut drained = 0usize;
    for pending in rx.drain() {
        let _ = pending
            .responder
            .send(Err(EagerError::cancelled("Enqueue stream closed")));
        drained += 1;
    }
    debug!(
        target: "dynamo_eager::client",
        drained, "Enqueue stream pump exited"
    );
}

async fn with_deadline<F>(call: F, timeout: Option<Duration>) -> Result<EnqueueResponse>
where
    F: std::future::Future<Output = Result<EnqueueResponse>>,
{
    match timeout {
        None => call.await,
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(EagerError::with_code(
                ErrorCode::DeadlineExceeded,
                format!("Enqueue request timed out after {limit:?}"),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Operation, TensorShapeProto};
    use crate::testing::ScriptedService;

    fn request(name: &str) -> Arc<EnqueueRequest> {
        Arc::new(EnqueueRequest::new(1).push_operation(Operation {
            id: 1,
            name: name.to_string(),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_requests_reach_service_in_submission_order() {
        let service = ScriptedService::new();
        let client = StreamingEagerClient::new(
            service.clone(),
            &ClientConfig::default(),
            &tokio::runtime::Handle::current(),
        );

        let futures: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|name| client.streaming_enqueue_async(request(name)))
            .collect();
        for fut in futures {
            fut.await.unwrap();
        }

        let seen: Vec<String> = service
            .requests()
            .iter()
            .map(|r| r.describe())
            .collect();
        assert_eq!(
            seen,
            vec![
                "RemoteOperation(A)",
                "RemoteOperation(B)",
                "RemoteOperation(C)"
            ]
        );
    }

    #[tokio::test]
    async fn test_service_response_is_returned() {
        let service = ScriptedService::new();
        service.push_response(Ok(EnqueueResponse::with_shapes(vec![
            TensorShapeProto::from_dims(&[2, 3]),
        ])));
        let client = StreamingEagerClient::new(
            service,
            &ClientConfig::default(),
            &tokio::runtime::Handle::current(),
        );

        let response = client
            .streaming_enqueue_async(request("Add"))
            .await
            .unwrap();
        assert_eq!(
            response.queue_response[0].shape[0],
            TensorShapeProto::from_dims(&[2, 3])
        );
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_and_rejects_new() {
        let service = ScriptedService::new();
        let gate = service.hold_next();
        let client = StreamingEagerClient::new(
            service,
            &ClientConfig::default(),
            &tokio::runtime::Handle::current(),
        );

        let in_flight = client.streaming_enqueue_async(request("Slow"));
        let queued = client.streaming_enqueue_async(request("Queued"));
        tokio::task::yield_now().await;

        client.close();
        client.closed().await;
        drop(gate);

        assert_eq!(in_flight.await.unwrap_err().code(), ErrorCode::Cancelled);
        assert_eq!(queued.await.unwrap_err().code(), ErrorCode::Cancelled);
        assert_eq!(
            client
                .streaming_enqueue_async(request("Late"))
                .await
                .unwrap_err()
                .code(),
            ErrorCode::Unavailable
        );
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let service = ScriptedService::new();
        let _gate = service.hold_next();
        let config = ClientConfig {
            request_timeout_ms: Some(20),
        };
        let client =
            StreamingEagerClient::new(service, &config, &tokio::runtime::Handle::current());

        let err = client
            .streaming_enqueue_async(request("Slow"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    }
}
