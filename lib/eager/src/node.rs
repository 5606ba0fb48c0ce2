// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote execute node.
//!
//! A [`RemoteExecuteNode`] carries one enqueue request for a remote worker
//! through the eager executor. [`EagerNode::prepare`] infers output shapes
//! locally so dependent ops can be built before the worker answers;
//! [`EagerNode::run_async`] submits the request on the client stream and
//! resolves the output handles when the response arrives.
//!
//! Completion order is fixed: inputs are released, each output is finalized
//! (remote shape set, or poisoned) and released, `done` fires, and only then
//! is the response dropped.

use std::sync::Arc;
use tracing::{debug, error, warn, Level};

use crate::client::{EagerClient, ResponseFuture};
use crate::error::{EagerError, ErrorCode, Result, Status};
use crate::executor::{EagerNode, StatusCallback};
use crate::handle::{Device, TensorHandle};
use crate::logging::RPC_TARGET;
use crate::metrics::{RpcMetricsGuard, RPC_ERRORS_TOTAL, SHAPE_ERRORS_TOTAL};
use crate::ops::OpMetadataSource;
use crate::protocol::{EnqueueRequest, EnqueueResponse, NodeDef};
use crate::shape::{InferenceContext, GRAPH_DEF_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePhase {
    Constructed,
    Prepared,
    Failed,
}

pub struct RemoteExecuteNode {
    node_def: NodeDef,
    request: Arc<EnqueueRequest>,
    client: Arc<dyn EagerClient>,
    device: Device,
    ops: OpMetadataSource,
    inputs: Vec<Arc<TensorHandle>>,
    retvals: Vec<Arc<TensorHandle>>,
    runtime: tokio::runtime::Handle,
    phase: NodePhase,
}

impl RemoteExecuteNode {
    pub fn builder(
        node_def: NodeDef,
        request: Arc<EnqueueRequest>,
        client: Arc<dyn EagerClient>,
    ) -> RemoteExecuteNodeBuilder {
        RemoteExecuteNodeBuilder {
            device: None,
            ops: None,
            inputs: Vec::new(),
            retvals: Vec::new(),
            runtime: None,
            node_def,
            request,
            client,
        }
    }

    pub fn node_def(&self) -> &NodeDef {
        &self.node_def
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn retvals(&self) -> &[Arc<TensorHandle>] {
        &self.retvals
    }

    fn infer_output_shapes(&self) -> Status {
        // nothing to infer into; skip the registries entirely
        if self.retvals.is_empty() {
            return Ok(());
        }

        let op = self.ops.look_up(&self.node_def.op)?;
        let mut ctx = InferenceContext::new(
            GRAPH_DEF_VERSION,
            &self.node_def,
            &op.op_def,
            self.inputs.len(),
        )?;

        for (i, input) in self.inputs.iter().enumerate() {
            let shape = input.inference_shape(&mut ctx)?;
            ctx.set_input(i, shape);
        }

        ctx.run(&op.shape_inference_fn)?;

        if ctx.num_outputs() != self.retvals.len() {
            let err = EagerError::internal(format!(
                "Shape inference for {} ({}) produced {} outputs but the node has {} return values",
                self.node_def.name,
                self.node_def.op,
                ctx.num_outputs(),
                self.retvals.len()
            ));
            error!(node = %self.node_def.name, op = %self.node_def.op, "{err}");
            return Err(err);
        }

        for (i, retval) in self.retvals.iter().enumerate() {
            retval.set_inference_shape(&ctx, ctx.output(i));
        }
        Ok(())
    }
}

/// RPC description, built only when [`RPC_TARGET`] logs at `DEBUG`.
fn rpc_description(request: &EnqueueRequest) -> Option<String> {
    if tracing::enabled!(target: RPC_TARGET, Level::DEBUG) {
        Some(request.describe())
    } else {
        None
    }
}

impl EagerNode for RemoteExecuteNode {
    fn prepare(&mut self) -> Status {
        let result = self.infer_output_shapes();
        self.phase = if result.is_ok() {
            NodePhase::Prepared
        } else {
            NodePhase::Failed
        };
        result
    }

    fn run_async(self: Box<Self>, done: StatusCallback) {
        let RemoteExecuteNode {
            node_def,
            request,
            client,
            device,
            inputs,
            retvals,
            runtime,
            phase,
            ..
        } = *self;

        if phase != NodePhase::Prepared {
            let err = EagerError::failed_precondition(format!(
                "Remote node {} ({}) was not prepared successfully and will not be dispatched",
                node_def.name, node_def.op
            ));
            for retval in &retvals {
                retval.poison(err.clone());
            }
            drop(retvals);
            drop(inputs);
            done(Err(err));
            return;
        }

        let description = rpc_description(&request);
        if let Some(rpc) = &description {
            debug!(target: RPC_TARGET, %rpc, "Issuing");
        }

        let in_flight = InFlightRpc {
            inputs,
            retvals,
            device,
            description,
            done: Some(done),
            _metrics: RpcMetricsGuard::start(),
        };

        // submitted before spawning so the stream sees requests in dispatch order
        let response = client.streaming_enqueue_async(request);
        runtime.spawn(in_flight.complete(response));
    }

    fn abort(self: Box<Self>, status: EagerError) {
        for retval in &self.retvals {
            retval.poison(status.clone());
        }
    }
}

/// References held for one outstanding RPC.
///
/// If the completion task is dropped before it finishes, `Drop` fails the
/// outputs with `Cancelled` and still invokes `done`.
struct InFlightRpc {
    inputs: Vec<Arc<TensorHandle>>,
    retvals: Vec<Arc<TensorHandle>>,
    device: Device,
    description: Option<String>,
    done: Option<StatusCallback>,
    _metrics: RpcMetricsGuard,
}

impl InFlightRpc {
    async fn complete(mut self, response: ResponseFuture) {
        let result = response.await;

        self.inputs.clear();

        let status = match &result {
            Ok(response) => {
                if let Some(rpc) = &self.description {
                    debug!(target: RPC_TARGET, %rpc, "Completed successfully");
                }
                self.apply_response(response)
            }
            Err(err) => {
                if let Some(rpc) = &self.description {
                    debug!(target: RPC_TARGET, %rpc, error = %err, "Failed");
                }
                RPC_ERRORS_TOTAL
                    .with_label_values(&[err.code().as_str()])
                    .inc();
                for retval in self.retvals.drain(..) {
                    retval.poison(err.clone());
                }
                Err(err.clone())
            }
        };

        if let Some(done) = self.done.take() {
            done(status);
        }
        drop(result);
    }

    /// Sets the remote shape of every output from the first queue response.
    ///
    /// Errors applying an individual shape are logged and skipped. Outputs the
    /// response has no shape for are poisoned, and that is reported.
    fn apply_response(&mut self, response: &EnqueueResponse) -> Status {
        let shapes = response
            .queue_response
            .first()
            .map(|r| r.shape.as_slice())
            .unwrap_or_default();
        let num_outputs = self.retvals.len();
        let mut status = Ok(());

        for (i, retval) in self.retvals.drain(..).enumerate() {
            match shapes.get(i) {
                Some(proto) => {
                    if let Err(err) = retval.set_remote_shape(proto, &self.device) {
                        SHAPE_ERRORS_TOTAL.inc();
                        error!(
                            output = i,
                            device = %self.device,
                            error = %err,
                            "Ignoring error setting remote shape of output"
                        );
                    }
                }
                None => {
                    let err = EagerError::internal(format!(
                        "Enqueue response carried {} shapes for {num_outputs} outputs",
                        shapes.len()
                    ));
                    retval.poison(err.clone());
                    if status.is_ok() {
                        status = Err(err);
                    }
                }
            }
        }

        if let Err(err) = &status {
            RPC_ERRORS_TOTAL
                .with_label_values(&[err.code().as_str()])
                .inc();
        }
        status
    }
}

impl Drop for InFlightRpc {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };

        let err = EagerError::cancelled("Remote execution was cancelled before the RPC completed");
        warn!(
            target: RPC_TARGET,
            rpc = self.description.as_deref().unwrap_or_default(),
            outputs = self.retvals.len(),
            "{err}"
        );
        RPC_ERRORS_TOTAL
            .with_label_values(&[err.code().as_str()])
            .inc();

        self.inputs.clear();
        for retval in self.retvals.drain(..) {
            retval.poison(err.clone());
        }
        done(Err(err));
    }
}

/// Builder for [`RemoteExecuteNode`].
pub struct RemoteExecuteNodeBuilder {
    node_def: NodeDef,
    request: Arc<EnqueueRequest>,
    client: Arc<dyn EagerClient>,
    device: Option<Device>,
    ops: Option<OpMetadataSource>,
    inputs: Vec<Arc<TensorHandle>>,
    retvals: Vec<Arc<TensorHandle>>,
    runtime: Option<tokio::runtime::Handle>,
}

impl RemoteExecuteNodeBuilder {
    /// Device the outputs live on. Defaults to the node def's device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Defaults to an empty function library over the global registry.
    pub fn ops(mut self, ops: OpMetadataSource) -> Self {
        self.ops = Some(ops);
        self
    }

    pub fn inputs(mut self, inputs: Vec<Arc<TensorHandle>>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn retvals(mut self, retvals: Vec<Arc<TensorHandle>>) -> Self {
        self.retvals = retvals;
        self
    }

    /// Runtime that completions run on. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: tokio::runtime::Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<RemoteExecuteNode> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => tokio::runtime::Handle::try_current().map_err(|e| {
                EagerError::new(
                    ErrorCode::FailedPrecondition,
                    "Remote execute node needs a Tokio runtime",
                    Some(e),
                )
            })?,
        };
        let device = self
            .device
            .unwrap_or_else(|| Device::new(self.node_def.device.clone()));

        Ok(RemoteExecuteNode {
            ops: self.ops.unwrap_or_default(),
            node_def: self.node_def,
            request: self.request,
            client: self.client,
            device,
            inputs: self.inputs,
            retvals: self.retvals,
            runtime,
            phase: NodePhase::Constructed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Arity, FunctionLibraryDefinition, OpDef, OpRegistrationData, OpRegistry};
    use crate::protocol::Operation;
    use crate::shape::common_shape_fns;
    use crate::testing::{remote_handles, worker_cpu, ScriptedService};
    use std::sync::Mutex as StdMutex;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    fn node_for(
        node_def: NodeDef,
        inputs: Vec<Arc<TensorHandle>>,
        retvals: Vec<Arc<TensorHandle>>,
        ops: OpMetadataSource,
    ) -> RemoteExecuteNode {
        let request = Arc::new(
            EnqueueRequest::new(1).push_operation(Operation::from_node_def(9, &node_def, vec![])),
        );
        RemoteExecuteNode::builder(node_def, request, ScriptedService::client())
            .device(worker_cpu())
            .ops(ops)
            .inputs(inputs)
            .retvals(retvals)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_retvals_skip_lookup() {
        let empty = OpMetadataSource::new(
            Arc::new(FunctionLibraryDefinition::new()),
            Arc::new(OpRegistry::new()),
        );
        let mut node = node_for(NodeDef::new("n", "Unregistered"), vec![], vec![], empty);
        node.prepare().unwrap();
        assert_eq!(node.phase, NodePhase::Prepared);
    }

    #[tokio::test]
    async fn test_output_count_mismatch_is_internal() {
        let library = Arc::new(FunctionLibraryDefinition::new());
        library
            .add_function(OpRegistrationData::new(
                OpDef::new("Split2")
                    .inputs(Arity::Fixed(1))
                    .outputs(Arity::Fixed(2)),
                common_shape_fns::unknown_shape,
            ))
            .unwrap();
        let ops = OpMetadataSource::new(library, Arc::new(OpRegistry::new()));

        let mut node = node_for(
            NodeDef::new("split", "Split2"),
            remote_handles(1, 1),
            remote_handles(2, 1),
            ops,
        );
        let err = node.prepare().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(node.phase, NodePhase::Failed);
    }

    #[tokio::test]
    async fn test_unprepared_node_poisons_outputs() {
        let retvals = remote_handles(2, 1);
        let node = node_for(
            NodeDef::new("id", "Identity"),
            remote_handles(1, 1),
            retvals.clone(),
            OpMetadataSource::global(),
        );

        let (tx, rx) = tokio::sync::oneshot::channel();
        Box::new(node).run_async(Box::new(move |status| {
            let _ = tx.send(status);
        }));

        let status = rx.await.unwrap();
        assert_eq!(status.unwrap_err().code(), ErrorCode::FailedPrecondition);
        assert!(retvals[0].is_poisoned());
    }

    #[tokio::test]
    async fn test_abort_poisons_outputs() {
        let retvals = remote_handles(2, 2);
        let node = node_for(
            NodeDef::new("add", "Add"),
            remote_handles(1, 2),
            retvals.clone(),
            OpMetadataSource::global(),
        );
        Box::new(node).abort(EagerError::cancelled("executor shut down"));
        assert!(retvals.iter().all(|r| r.is_poisoned()));
    }

    #[test]
    fn test_rpc_description_follows_log_level() {
        let request = EnqueueRequest::new(1).push_operation(Operation {
            id: 1,
            name: "MatMul".to_string(),
            ..Default::default()
        });

        let quiet = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::sink)
                .with_filter(LevelFilter::INFO),
        );
        tracing::subscriber::with_default(quiet, || {
            assert_eq!(rpc_description(&request), None);
        });

        let verbose = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::sink)
                .with_filter(
                    tracing_subscriber::filter::Targets::new()
                        .with_target(RPC_TARGET, LevelFilter::DEBUG),
                ),
        );
        tracing::subscriber::with_default(verbose, || {
            assert_eq!(
                rpc_description(&request).as_deref(),
                Some("RemoteOperation(MatMul)")
            );
        });
    }

    #[test]
    fn test_dropped_completion_still_calls_done() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let retvals = remote_handles(3, 1);

        let in_flight = InFlightRpc {
            inputs: remote_handles(1, 1),
            retvals: retvals.clone(),
            device: worker_cpu(),
            description: None,
            done: Some(Box::new({
                let statuses = statuses.clone();
                move |status: Status| statuses.lock().unwrap().push(status)
            })),
            _metrics: RpcMetricsGuard::start(),
        };
        let never: ResponseFuture = Box::pin(futures::future::pending());
        runtime.spawn(in_flight.complete(never));
        // dropping the runtime drops the unfinished completion task
        drop(runtime);

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(
            statuses[0].as_ref().unwrap_err().code(),
            ErrorCode::Cancelled
        );
        assert!(retvals[0].is_poisoned());
    }
}
