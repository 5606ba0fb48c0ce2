// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime hosting the enqueue stream pump and the executor dispatch task.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Worker pool of the runtime owned by [`crate::runtime::EagerRuntime`].
///
/// RPC completions run on these workers, so a single worker keeps them
/// strictly serialized with dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TokioConfig {
    /// Async worker threads, at most one per logical CPU.
    /// `None` lets tokio pick one per CPU.
    #[validate(range(min = 1, max = logical_cpus()))]
    pub worker_threads: Option<usize>,

    /// Cap on blocking threads. `None` keeps tokio's default.
    #[validate(range(min = 1))]
    pub max_blocking_threads: Option<usize>,
}

impl TokioConfig {
    /// Builds a multi-threaded runtime whose workers are named `eager-worker`.
    pub fn build_runtime(&self) -> std::io::Result<::tokio::runtime::Runtime> {
        let mut builder = ::tokio::runtime::Builder::new_multi_thread();
        builder.thread_name("eager-worker").enable_all();

        if let Some(threads) = self.worker_threads {
            builder.worker_threads(threads);
        }
        if let Some(blocking) = self.max_blocking_threads {
            builder.max_blocking_threads(blocking);
        }
        builder.build()
    }
}

impl Default for TokioConfig {
    fn default() -> Self {
        // one worker is valid on every host
        Self {
            worker_threads: Some(1),
            max_blocking_threads: None,
        }
    }
}

fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
