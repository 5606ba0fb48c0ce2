// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Streaming enqueue client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ClientConfig {
    /// Deadline for a single enqueue RPC, measured from the moment the stream
    /// starts forwarding it. None = no deadline.
    #[validate(range(min = 1))]
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}
