// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Messages exchanged between the eager client and a remote worker.
//!
//! A request carries a batch of queue items, each either an operation to run
//! or a directive to drop one reference on a remote tensor. The i-th queue
//! response carries the output shapes of the i-th operation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of an operation within an eager context.
pub type OpId = i64;

/// Value of a node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    String(String),
    Shape(TensorShapeProto),
    IntList(Vec<i64>),
}

/// Structural description of an op invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            ..Default::default()
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }
}

/// Wire form of a tensor shape. `-1` marks an unknown dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShapeProto {
    #[serde(default)]
    pub dims: Vec<i64>,
    #[serde(default)]
    pub unknown_rank: bool,
}

impl TensorShapeProto {
    pub fn from_dims(dims: &[i64]) -> Self {
        Self {
            dims: dims.to_vec(),
            unknown_rank: false,
        }
    }

    pub fn unknown_rank() -> Self {
        Self {
            dims: Vec::new(),
            unknown_rank: true,
        }
    }
}

/// Reference to an output of an operation that lives on a remote worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTensorHandle {
    pub op_id: OpId,
    pub output_num: i32,
    #[serde(default)]
    pub device: String,
}

impl RemoteTensorHandle {
    pub fn new(op_id: OpId, output_num: i32) -> Self {
        Self {
            op_id,
            output_num,
            device: String::new(),
        }
    }
}

/// An operation to execute remotely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<RemoteTensorHandle>,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub device: String,
}

impl Operation {
    /// Builds the wire operation for `node_def`, consuming `inputs` in order.
    pub fn from_node_def(id: OpId, node_def: &NodeDef, inputs: Vec<RemoteTensorHandle>) -> Self {
        Self {
            id,
            name: node_def.op.clone(),
            inputs,
            attrs: node_def.attrs.clone(),
            device: node_def.device.clone(),
        }
    }
}

/// One element of an enqueue request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItem {
    Operation(Operation),
    HandleToDecref(RemoteTensorHandle),
}

impl QueueItem {
    /// Short label used in RPC descriptions.
    pub fn describe(&self) -> String {
        match self {
            QueueItem::Operation(op) => op.name.clone(),
            QueueItem::HandleToDecref(handle) => {
                format!("DeleteHandle({}:{})", handle.op_id, handle.output_num)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub context_id: u64,
    #[serde(default)]
    pub queue: Vec<QueueItem>,
}

impl EnqueueRequest {
    pub fn new(context_id: u64) -> Self {
        Self {
            context_id,
            queue: Vec::new(),
        }
    }

    pub fn push_operation(mut self, operation: Operation) -> Self {
        self.queue.push(QueueItem::Operation(operation));
        self
    }

    pub fn push_decref(mut self, handle: RemoteTensorHandle) -> Self {
        self.queue.push(QueueItem::HandleToDecref(handle));
        self
    }

    /// Human-readable identity of the whole batch, e.g.
    /// `RemoteOperation(MatMul, DeleteHandle(3:0))`.
    ///
    /// Walks the entire queue; callers on hot paths should gate it on the
    /// log level.
    pub fn describe(&self) -> String {
        let ops: Vec<String> = self.queue.iter().map(QueueItem::describe).collect();
        format!("RemoteOperation({})", ops.join(", "))
    }

    pub fn num_operations(&self) -> usize {
        self.queue
            .iter()
            .filter(|item| matches!(item, QueueItem::Operation(_)))
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub shape: Vec<TensorShapeProto>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    #[serde(default)]
    pub queue_response: Vec<QueueResponse>,
}

impl EnqueueResponse {
    /// Response for a single operation producing `shapes`.
    pub fn with_shapes(shapes: Vec<TensorShapeProto>) -> Self {
        Self {
            queue_response: vec![QueueResponse { shape: shapes }],
        }
    }
}
