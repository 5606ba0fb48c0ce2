// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process stand-ins for a remote worker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::client::{EagerClient, EnqueueService, StreamingEagerClient};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::handle::{Device, TensorHandle};
use crate::protocol::{EnqueueRequest, EnqueueResponse, OpId};

pub const WORKER_CPU: &str = "/job:worker/replica:0/task:1/device:CPU:0";

pub fn worker_cpu() -> Device {
    Device::new(WORKER_CPU)
}

/// `count` handles for outputs `0..count` of remote op `op_id` on [`WORKER_CPU`].
pub fn remote_handles(op_id: OpId, count: usize) -> Vec<Arc<TensorHandle>> {
    (0..count)
        .map(|i| TensorHandle::remote(op_id, i as i32, worker_cpu()))
        .collect()
}

type Responder = Box<dyn Fn(&EnqueueRequest) -> Result<EnqueueResponse> + Send + Sync>;

/// An [`EnqueueService`] that records every request and answers from a script.
///
/// Answers come from queued responses first, then from the responder set
/// with [`ScriptedService::respond_with`], and otherwise an empty response.
#[derive(Default)]
pub struct ScriptedService {
    requests: Mutex<Vec<Arc<EnqueueRequest>>>,
    responses: Mutex<VecDeque<Result<EnqueueResponse>>>,
    responder: Mutex<Option<Responder>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Holds the next enqueue call until dropped.
pub struct Gate {
    _release: oneshot::Sender<()>,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A streaming client over a fresh service, on the current runtime.
    pub fn client() -> Arc<dyn EagerClient> {
        Self::new().streaming_client()
    }

    pub fn streaming_client(self: &Arc<Self>) -> Arc<StreamingEagerClient> {
        StreamingEagerClient::new(
            self.clone(),
            &ClientConfig::default(),
            &tokio::runtime::Handle::current(),
        )
    }

    pub fn push_response(&self, response: Result<EnqueueResponse>) {
        self.responses.lock().push_back(response);
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&EnqueueRequest) -> Result<EnqueueResponse> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Blocks the next enqueue call until the returned gate is dropped.
    pub fn hold_next(&self) -> Gate {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        Gate { _release: tx }
    }

    pub fn requests(&self) -> Vec<Arc<EnqueueRequest>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl EnqueueService for ScriptedService {
    async fn enqueue(&self, request: Arc<EnqueueRequest>) -> Result<EnqueueResponse> {
        self.requests.lock().push(request.clone());

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if let Some(response) = self.responses.lock().pop_front() {
            return response;
        }
        match &*self.responder.lock() {
            Some(responder) => responder(&request),
            None => Ok(EnqueueResponse::default()),
        }
    }
}
