// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tensor handles: shared futures for tensors produced on remote workers.
//!
//! Handles are shared as `Arc<TensorHandle>`; cloning the `Arc` takes a
//! reference and dropping it releases one. Relative to the node that produces
//! it, a handle moves through these states:
//!
//! 1. unresolved: no shape known yet;
//! 2. inference-shape known: a locally inferred shape is attached;
//! 3. remote-shape set: the worker reported the authoritative shape;
//! 4. poisoned: a terminal error every consumer observes.
//!
//! States 2 and 3 are additive; 4 is terminal.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{EagerError, Result, Status};
use crate::protocol::{OpId, RemoteTensorHandle, TensorShapeProto};
use crate::shape::{InferenceContext, Shape, ShapeHandle};

/// Name of the device a tensor lives on, e.g.
/// `/job:worker/replica:0/task:1/device:CPU:0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    name: String,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Default)]
struct HandleState {
    inference_shape: Option<Shape>,
    remote_shape: Option<Shape>,
    poison: Option<EagerError>,
}

impl HandleState {
    fn is_ready(&self) -> bool {
        self.remote_shape.is_some() || self.poison.is_some()
    }
}

/// A reference-counted future for a remote tensor.
pub struct TensorHandle {
    op_id: OpId,
    output_num: i32,
    device: Device,
    state: Mutex<HandleState>,
    ready: Notify,
}

impl TensorHandle {
    /// A handle for output `output_num` of remote op `op_id`, materialized on
    /// `device`.
    pub fn remote(op_id: OpId, output_num: i32, device: Device) -> Arc<Self> {
        Arc::new(Self {
            op_id,
            output_num,
            device,
            state: Mutex::new(HandleState::default()),
            ready: Notify::new(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Wire reference to this tensor, usable as an operation input.
    pub fn remote_id(&self) -> RemoteTensorHandle {
        RemoteTensorHandle {
            op_id: self.op_id,
            output_num: self.output_num,
            device: self.device.name().to_string(),
        }
    }

    /// Binds this handle's best known shape into `ctx`.
    ///
    /// The remote shape wins over the inferred one; a handle with neither
    /// yields an unknown shape. A poisoned handle returns its error.
    pub fn inference_shape(&self, ctx: &mut InferenceContext<'_>) -> Result<ShapeHandle> {
        let state = self.state.lock();
        if let Some(err) = &state.poison {
            return Err(err.clone());
        }
        let shape = state
            .remote_shape
            .as_ref()
            .or(state.inference_shape.as_ref())
            .cloned();
        drop(state);
        Ok(match shape {
            Some(shape) => ctx.make_shape(shape),
            None => ctx.unknown_shape(),
        })
    }

    /// Copies the shape behind `handle` out of `ctx` into this tensor.
    pub fn set_inference_shape(&self, ctx: &InferenceContext<'_>, handle: ShapeHandle) {
        let shape = ctx.shape(handle).clone();
        self.state.lock().inference_shape = Some(shape);
    }

    /// Records the authoritative shape reported by the remote worker.
    pub fn set_remote_shape(&self, proto: &TensorShapeProto, device: &Device) -> Status {
        if *device != self.device {
            return Err(EagerError::invalid_argument(format!(
                "Could not find remote mirror of tensor {}:{} on device {device}; it lives on {}",
                self.op_id, self.output_num, self.device
            )));
        }
        let shape = Shape::from_proto(proto)?;

        let mut state = self.state.lock();
        if let Some(err) = &state.poison {
            return Err(EagerError::failed_precondition(format!(
                "Cannot set the shape of poisoned tensor {}:{}: {err}",
                self.op_id, self.output_num
            )));
        }
        if state.remote_shape.is_some() {
            return Err(EagerError::internal(format!(
                "Remote shape of tensor {}:{} is already set",
                self.op_id, self.output_num
            )));
        }
        state.remote_shape = Some(shape);
        drop(state);
        self.ready.notify_waiters();
        Ok(())
    }

    /// Marks the tensor as terminally failed with `err`.
    pub fn poison(&self, err: EagerError) {
        let mut state = self.state.lock();
        if state.is_ready() {
            warn!(
                op_id = self.op_id,
                output_num = self.output_num,
                error = %err,
                "Ignoring poison of a tensor handle that is already ready"
            );
            return;
        }
        state.poison = Some(err);
        drop(state);
        self.ready.notify_waiters();
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().is_ready()
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poison.is_some()
    }

    pub fn poison_status(&self) -> Status {
        match &self.state.lock().poison {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn inferred_shape(&self) -> Option<Shape> {
        self.state.lock().inference_shape.clone()
    }

    pub fn remote_shape(&self) -> Option<Shape> {
        self.state.lock().remote_shape.clone()
    }

    /// Best shape known right now, without waiting.
    pub fn shape(&self) -> Result<Option<Shape>> {
        let state = self.state.lock();
        if let Some(err) = &state.poison {
            return Err(err.clone());
        }
        Ok(state
            .remote_shape
            .clone()
            .or_else(|| state.inference_shape.clone()))
    }

    /// Waits until the remote shape is set or the handle is poisoned.
    pub async fn wait_ready(&self) -> Result<Shape> {
        loop {
            // registered before the state check so a concurrent notify is not lost
            let notified = self.ready.notified();
            {
                let state = self.state.lock();
                if let Some(err) = &state.poison {
                    return Err(err.clone());
                }
                if let Some(shape) = &state.remote_shape {
                    return Ok(shape.clone());
                }
            }
            notified.await;
        }
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("op_id", &self.op_id)
            .field("output_num", &self.output_num)
            .field("device", &self.device.name)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::ops::{Arity, OpDef};
    use crate::protocol::NodeDef;
    use crate::shape::GRAPH_DEF_VERSION;

    fn cpu() -> Device {
        Device::new("/job:worker/replica:0/task:1/device:CPU:0")
    }

    #[test]
    fn test_inference_shape_prefers_remote() {
        let handle = TensorHandle::remote(1, 0, cpu());
        let ndef = NodeDef::new("id", "Identity");
        let op_def = OpDef::new("Identity")
            .inputs(Arity::Fixed(1))
            .outputs(Arity::Fixed(1));
        let mut ctx = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 1).unwrap();

        let h = handle.inference_shape(&mut ctx).unwrap();
        assert_eq!(ctx.shape(h), &Shape::UnknownRank);

        let inferred = ctx.make_shape(Shape::from_dims(&[-1, 3]));
        handle.set_inference_shape(&ctx, inferred);
        let h = handle.inference_shape(&mut ctx).unwrap();
        assert_eq!(ctx.shape(h), &Shape::from_dims(&[-1, 3]));

        handle
            .set_remote_shape(&TensorShapeProto::from_dims(&[4, 3]), &cpu())
            .unwrap();
        let h = handle.inference_shape(&mut ctx).unwrap();
        assert_eq!(ctx.shape(h), &Shape::from_dims(&[4, 3]));
        // both shapes are kept
        assert_eq!(handle.inferred_shape(), Some(Shape::from_dims(&[-1, 3])));
    }

    #[test]
    fn test_inference_shape_outlives_context() {
        let handle = TensorHandle::remote(1, 0, cpu());
        {
            let ndef = NodeDef::new("id", "Identity");
            let op_def = OpDef::new("Identity")
                .inputs(Arity::Fixed(1))
                .outputs(Arity::Fixed(1));
            let mut ctx = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 1).unwrap();
            let h = ctx.make_shape(Shape::from_dims(&[2, 3]));
            handle.set_inference_shape(&ctx, h);
        }
        assert_eq!(handle.shape().unwrap(), Some(Shape::from_dims(&[2, 3])));
    }

    #[test]
    fn test_set_remote_shape_errors() {
        let handle = TensorHandle::remote(1, 0, cpu());
        let gpu = Device::new("/job:worker/replica:0/task:1/device:GPU:0");

        let err = handle
            .set_remote_shape(&TensorShapeProto::from_dims(&[2]), &gpu)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = handle
            .set_remote_shape(&TensorShapeProto::from_dims(&[2, -5]), &cpu())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(!handle.is_ready());

        handle
            .set_remote_shape(&TensorShapeProto::from_dims(&[2]), &cpu())
            .unwrap();
        let err = handle
            .set_remote_shape(&TensorShapeProto::from_dims(&[2]), &cpu())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_poison_is_terminal() {
        let handle = TensorHandle::remote(1, 0, cpu());
        handle.poison(EagerError::unavailable("worker went away"));
        assert!(handle.is_poisoned());
        assert_eq!(
            handle.poison_status().unwrap_err().code(),
            ErrorCode::Unavailable
        );

        let err = handle
            .set_remote_shape(&TensorShapeProto::from_dims(&[2]), &cpu())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(handle.shape().is_err());
    }

    #[test]
    fn test_poison_after_ready_is_ignored() {
        let handle = TensorHandle::remote(1, 0, cpu());
        handle
            .set_remote_shape(&TensorShapeProto::from_dims(&[1]), &cpu())
            .unwrap();
        handle.poison(EagerError::internal("late"));
        assert!(!handle.is_poisoned());
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_on_remote_shape() {
        let handle = TensorHandle::remote(1, 0, cpu());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_ready().await })
        };
        tokio::task::yield_now().await;

        handle
            .set_remote_shape(&TensorShapeProto::from_dims(&[5]), &cpu())
            .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Shape::from_dims(&[5]));
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_on_poison() {
        let handle = TensorHandle::remote(1, 0, cpu());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_ready().await })
        };
        tokio::task::yield_now().await;

        handle.poison(EagerError::cancelled("shutdown"));
        assert_eq!(
            waiter.await.unwrap().unwrap_err().code(),
            ErrorCode::Cancelled
        );
    }
}
