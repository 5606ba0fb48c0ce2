// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Eager executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ExecutorConfig {
    /// Nodes that may be added but not yet completed before `add` starts
    /// rejecting with `Unavailable`.
    #[validate(range(min = 1))]
    #[serde(default = "default_max_pending_nodes")]
    pub max_pending_nodes: usize,
}

fn default_max_pending_nodes() -> usize {
    1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_pending_nodes: default_max_pending_nodes(),
        }
    }
}
