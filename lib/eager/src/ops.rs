// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Op metadata: schemas and shape functions.
//!
//! Ops are resolved in two tiers. The graph-local [`FunctionLibraryDefinition`]
//! is consulted first so user-defined functions can shadow primitives; the
//! process-wide [`OpRegistry`] is the fallback. Lookups never mutate either
//! tier and are safe to run concurrently.

use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{EagerError, Result, Status};
use crate::protocol::{AttrValue, NodeDef};
use crate::shape::{common_shape_fns, InferenceContext, ShapeInferenceFn};

/// Number of inputs or outputs of an op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    /// Taken from an int attr of the node, e.g. `N` for `IdentityN`.
    FromAttr(String),
}

impl Arity {
    fn resolve(&self, node_def: &NodeDef) -> Result<usize> {
        match self {
            Arity::Fixed(n) => Ok(*n),
            Arity::FromAttr(name) => match node_def.attr(name) {
                Some(AttrValue::Int(n)) if *n >= 0 => Ok(*n as usize),
                Some(other) => Err(EagerError::invalid_argument(format!(
                    "Attr {name} of node {} must be a non-negative int, got {other:?}",
                    node_def.name
                ))),
                None => Err(EagerError::invalid_argument(format!(
                    "Node {} ({}) is missing attr {name}",
                    node_def.name, node_def.op
                ))),
            },
        }
    }
}

/// Schema of an op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpDef {
    pub name: String,
    pub inputs: Arity,
    pub outputs: Arity,
}

impl OpDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Arity::Fixed(0),
            outputs: Arity::Fixed(0),
        }
    }

    pub fn inputs(mut self, arity: Arity) -> Self {
        self.inputs = arity;
        self
    }

    pub fn outputs(mut self, arity: Arity) -> Self {
        self.outputs = arity;
        self
    }

    pub fn num_inputs(&self, node_def: &NodeDef) -> Result<usize> {
        self.inputs.resolve(node_def)
    }

    pub fn num_outputs(&self, node_def: &NodeDef) -> Result<usize> {
        self.outputs.resolve(node_def)
    }
}

/// An op schema together with its shape function.
#[derive(Clone)]
pub struct OpRegistrationData {
    pub op_def: OpDef,
    pub shape_inference_fn: ShapeInferenceFn,
}

impl OpRegistrationData {
    pub fn new<F>(op_def: OpDef, shape_fn: F) -> Self
    where
        F: Fn(&mut InferenceContext<'_>) -> Status + Send + Sync + 'static,
    {
        Self {
            op_def,
            shape_inference_fn: Arc::new(shape_fn),
        }
    }
}

impl fmt::Debug for OpRegistrationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistrationData")
            .field("op_def", &self.op_def)
            .finish_non_exhaustive()
    }
}

/// Process-wide table of primitive ops.
#[derive(Debug, Default)]
pub struct OpRegistry {
    ops: DashMap<String, Arc<OpRegistrationData>>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the standard ops.
    pub fn with_standard_ops() -> Self {
        let registry = Self::new();
        for data in standard_ops() {
            // names in the standard set are unique
            let _ = registry.register(data);
        }
        registry
    }

    /// The global registry, created on first use.
    pub fn global() -> Arc<OpRegistry> {
        static GLOBAL: OnceLock<Arc<OpRegistry>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(OpRegistry::with_standard_ops()))
            .clone()
    }

    pub fn register(&self, data: OpRegistrationData) -> Status {
        let name = data.op_def.name.clone();
        match self.ops.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(EagerError::already_exists(
                format!("Op with name {} already registered", entry.key()),
            )),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(data));
                Ok(())
            }
        }
    }

    pub fn look_up(&self, op: &str) -> Result<Arc<OpRegistrationData>> {
        self.ops
            .get(op)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                EagerError::not_found(format!(
                    "Op type not registered '{op}' in the global op registry"
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Graph-local library of function definitions.
#[derive(Debug, Default)]
pub struct FunctionLibraryDefinition {
    functions: DashMap<String, Arc<OpRegistrationData>>,
}

impl FunctionLibraryDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&self, data: OpRegistrationData) -> Status {
        let name = data.op_def.name.clone();
        if self.functions.contains_key(&name) {
            return Err(EagerError::already_exists(format!(
                "Function {name} already defined in the library"
            )));
        }
        self.functions.insert(name, Arc::new(data));
        Ok(())
    }

    pub fn find(&self, op: &str) -> Option<Arc<OpRegistrationData>> {
        self.functions.get(op).map(|entry| entry.value().clone())
    }

    pub fn look_up(&self, op: &str) -> Result<Arc<OpRegistrationData>> {
        self.find(op).ok_or_else(|| {
            EagerError::not_found(format!("Function {op} not found in the function library"))
        })
    }

    pub fn contains(&self, op: &str) -> bool {
        self.functions.contains_key(op)
    }
}

/// Two-tier op lookup: function library first, then the op registry.
#[derive(Debug, Clone)]
pub struct OpMetadataSource {
    library: Arc<FunctionLibraryDefinition>,
    registry: Arc<OpRegistry>,
}

impl OpMetadataSource {
    pub fn new(library: Arc<FunctionLibraryDefinition>, registry: Arc<OpRegistry>) -> Self {
        Self { library, registry }
    }

    /// Empty function library backed by the global registry.
    pub fn global() -> Self {
        Self::new(
            Arc::new(FunctionLibraryDefinition::new()),
            OpRegistry::global(),
        )
    }

    pub fn library(&self) -> &Arc<FunctionLibraryDefinition> {
        &self.library
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    pub fn look_up(&self, op: &str) -> Result<Arc<OpRegistrationData>> {
        if let Some(data) = self.library.find(op) {
            return Ok(data);
        }
        self.registry.look_up(op).map_err(|_| {
            EagerError::not_found(format!(
                "Op type not registered '{op}' in the function library or the op registry"
            ))
        })
    }
}

impl Default for OpMetadataSource {
    fn default() -> Self {
        Self::global()
    }
}

fn standard_ops() -> Vec<OpRegistrationData> {
    use common_shape_fns::*;

    let unary = |name: &str| OpDef::new(name).inputs(Arity::Fixed(1)).outputs(Arity::Fixed(1));
    let binary = |name: &str| OpDef::new(name).inputs(Arity::Fixed(2)).outputs(Arity::Fixed(1));

    vec![
        OpRegistrationData::new(unary("Identity"), unchanged_shape),
        OpRegistrationData::new(unary("Neg"), unchanged_shape),
        OpRegistrationData::new(unary("Relu"), unchanged_shape),
        OpRegistrationData::new(binary("Add"), broadcast_binary_op),
        OpRegistrationData::new(binary("AddV2"), broadcast_binary_op),
        OpRegistrationData::new(binary("Sub"), broadcast_binary_op),
        OpRegistrationData::new(binary("Mul"), broadcast_binary_op),
        OpRegistrationData::new(binary("MatMul"), matmul_shape),
        OpRegistrationData::new(
            OpDef::new("IdentityN")
                .inputs(Arity::FromAttr("N".to_string()))
                .outputs(Arity::FromAttr("N".to_string())),
            forward_all_inputs,
        ),
        OpRegistrationData::new(OpDef::new("NoOp"), no_outputs),
        OpRegistrationData::new(
            OpDef::new("VarHandleOp").outputs(Arity::Fixed(1)),
            scalar_shape,
        ),
        OpRegistrationData::new(
            OpDef::new("AssignVariableOp").inputs(Arity::Fixed(2)),
            no_outputs,
        ),
    ]
}
