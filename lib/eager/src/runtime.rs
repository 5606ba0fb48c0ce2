// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A self-contained eager context: a dedicated Tokio runtime with the enqueue
//! stream and the executor started on it.
//!
//! Embedders that already own a runtime can wire [`StreamingEagerClient`] and
//! [`EagerExecutor`] by hand instead.

use std::sync::Arc;
use validator::Validate;

use crate::client::{EnqueueService, StreamingEagerClient};
use crate::config::{ConfigError, EagerConfig};
use crate::error::Status;
use crate::executor::EagerExecutor;
use crate::node::{RemoteExecuteNode, RemoteExecuteNodeBuilder};
use crate::protocol::{EnqueueRequest, NodeDef};

pub struct EagerRuntime {
    // dropped before the runtime so the dispatch task sees its cancellation
    executor: EagerExecutor,
    client: Arc<StreamingEagerClient>,
    runtime: tokio::runtime::Runtime,
}

impl EagerRuntime {
    /// Builds the runtime from `config.tokio`, then starts the client and the
    /// executor on it.
    ///
    /// Must not be called from within an async context.
    pub fn from_config(
        config: &EagerConfig,
        service: Arc<dyn EnqueueService>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let runtime = config.tokio.build_runtime().map_err(|e| {
            ConfigError::Other(anyhow::Error::new(e).context("Failed to build eager runtime"))
        })?;
        let client = StreamingEagerClient::new(service, &config.client, runtime.handle());
        let executor = EagerExecutor::new(&config.executor, runtime.handle());

        tracing::debug!(
            target: "dynamo_eager::runtime",
            worker_threads = ?config.tokio.worker_threads,
            max_pending_nodes = config.executor.max_pending_nodes,
            "Eager runtime started"
        );

        Ok(Self {
            executor,
            client,
            runtime,
        })
    }

    /// [`Self::from_config`] with configuration loaded from the environment.
    pub fn from_env(service: Arc<dyn EnqueueService>) -> Result<Self, ConfigError> {
        Self::from_config(&EagerConfig::from_env()?, service)
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        self.runtime.handle()
    }

    pub fn client(&self) -> &Arc<StreamingEagerClient> {
        &self.client
    }

    pub fn executor(&self) -> &EagerExecutor {
        &self.executor
    }

    /// A node builder bound to this context's client and runtime.
    pub fn node(
        &self,
        node_def: NodeDef,
        request: Arc<EnqueueRequest>,
    ) -> RemoteExecuteNodeBuilder {
        RemoteExecuteNode::builder(node_def, request, self.client.clone())
            .runtime(self.handle().clone())
    }

    /// Blocks until every added node has completed.
    pub fn sync(&self) -> Status {
        self.runtime.block_on(self.executor.wait_for_all_pending_nodes())
    }

    /// Drains the executor, closes the stream and stops the runtime.
    pub fn shutdown(self) -> Status {
        let status = self.runtime.block_on(self.executor.shutdown());
        self.client.close();
        self.runtime.block_on(self.client.closed());
        status
    }
}
