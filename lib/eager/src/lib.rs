// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamo eager remote execution.
//!
//! The client side of a distributed eager runtime: ops are queued on an
//! [`executor::EagerExecutor`], shapes are inferred locally while the request
//! is in flight, and a [`node::RemoteExecuteNode`] ships each request over a
//! streaming enqueue RPC and resolves its [`handle::TensorHandle`] outputs
//! when the worker replies.

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod handle;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod ops;
pub mod protocol;
pub mod runtime;
pub mod shape;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{EagerClient, EnqueueService, StreamingEagerClient};
pub use config::EagerConfig;
pub use error::{EagerError, ErrorCode, Result, Status};
pub use executor::{EagerExecutor, EagerNode, StatusCallback};
pub use handle::{Device, TensorHandle};
pub use node::RemoteExecuteNode;
pub use ops::{FunctionLibraryDefinition, OpMetadataSource, OpRegistry};
pub use runtime::EagerRuntime;
