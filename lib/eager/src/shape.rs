// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local shape inference.
//!
//! An [`InferenceContext`] is a transient arena of shapes addressed by
//! [`ShapeHandle`]s. Shape functions read input handles, build new shapes in
//! the arena, and bind output handles. Handles are only meaningful inside the
//! context that produced them; consumers that need a shape after the context
//! is gone copy it out with [`InferenceContext::shape`].

use std::fmt;
use std::sync::Arc;

use crate::error::{EagerError, Result, Status};
use crate::ops::OpDef;
use crate::protocol::{AttrValue, NodeDef, TensorShapeProto};

/// Version of the graph format shape functions are written against.
pub const GRAPH_DEF_VERSION: i32 = 175;

/// A single dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Known(i64),
    Unknown,
}

impl Dim {
    pub fn value(&self) -> Option<i64> {
        match self {
            Dim::Known(v) => Some(*v),
            Dim::Unknown => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Known(v) => write!(f, "{v}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

/// A possibly partially known tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    UnknownRank,
    Known(Vec<Dim>),
}

impl Shape {
    /// Builds a shape from raw dimensions; negative values become unknown.
    pub fn from_dims(dims: &[i64]) -> Self {
        Shape::Known(
            dims.iter()
                .map(|&d| if d < 0 { Dim::Unknown } else { Dim::Known(d) })
                .collect(),
        )
    }

    pub fn scalar() -> Self {
        Shape::Known(Vec::new())
    }

    pub fn unknown() -> Self {
        Shape::UnknownRank
    }

    pub fn rank(&self) -> Option<usize> {
        match self {
            Shape::UnknownRank => None,
            Shape::Known(dims) => Some(dims.len()),
        }
    }

    pub fn dims(&self) -> Option<&[Dim]> {
        match self {
            Shape::UnknownRank => None,
            Shape::Known(dims) => Some(dims),
        }
    }

    pub fn is_fully_defined(&self) -> bool {
        match self {
            Shape::UnknownRank => false,
            Shape::Known(dims) => dims.iter().all(|d| matches!(d, Dim::Known(_))),
        }
    }

    /// Number of elements, if every dimension is known.
    pub fn num_elements(&self) -> Option<i64> {
        self.dims()?
            .iter()
            .try_fold(1i64, |acc, d| d.value().and_then(|v| acc.checked_mul(v)))
    }

    /// Parses a wire shape, rejecting dimensions below `-1`.
    pub fn from_proto(proto: &TensorShapeProto) -> Result<Self> {
        if proto.unknown_rank {
            if !proto.dims.is_empty() {
                return Err(EagerError::invalid_argument(format!(
                    "Shape with unknown rank must not carry dimensions, got {:?}",
                    proto.dims
                )));
            }
            return Ok(Shape::UnknownRank);
        }
        if let Some(bad) = proto.dims.iter().find(|&&d| d < -1) {
            return Err(EagerError::invalid_argument(format!(
                "Shape {:?} has dimension {bad} below -1",
                proto.dims
            )));
        }
        Ok(Shape::from_dims(&proto.dims))
    }

    pub fn to_proto(&self) -> TensorShapeProto {
        match self {
            Shape::UnknownRank => TensorShapeProto::unknown_rank(),
            Shape::Known(dims) => TensorShapeProto::from_dims(
                &dims.iter().map(|d| d.value().unwrap_or(-1)).collect::<Vec<_>>(),
            ),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::UnknownRank => write!(f, "<unknown>"),
            Shape::Known(dims) => {
                write!(f, "[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Index of a shape inside an [`InferenceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeHandle(usize);

/// Shape function registered for an op.
pub type ShapeInferenceFn = Arc<dyn Fn(&mut InferenceContext<'_>) -> Status + Send + Sync>;

/// Holds the inference state for a single node.
pub struct InferenceContext<'a> {
    graph_def_version: i32,
    node_def: &'a NodeDef,
    op_def: &'a OpDef,
    shapes: Vec<Shape>,
    inputs: Vec<ShapeHandle>,
    outputs: Vec<ShapeHandle>,
}

impl<'a> InferenceContext<'a> {
    /// Creates a context for `node_def` with `num_inputs` unknown inputs.
    ///
    /// Fails with `InvalidArgument` when the op schema expects a different
    /// number of inputs, or when an attr-driven arity cannot be resolved.
    pub fn new(
        graph_def_version: i32,
        node_def: &'a NodeDef,
        op_def: &'a OpDef,
        num_inputs: usize,
    ) -> Result<Self> {
        let expected_inputs = op_def.num_inputs(node_def)?;
        if expected_inputs != num_inputs {
            return Err(EagerError::invalid_argument(format!(
                "Op {} expects {expected_inputs} inputs but node {} was given {num_inputs}",
                op_def.name, node_def.name
            )));
        }
        let num_outputs = op_def.num_outputs(node_def)?;

        let mut ctx = Self {
            graph_def_version,
            node_def,
            op_def,
            shapes: vec![Shape::UnknownRank],
            inputs: Vec::with_capacity(num_inputs),
            outputs: Vec::with_capacity(num_outputs),
        };
        let unknown = ShapeHandle(0);
        ctx.inputs.resize(num_inputs, unknown);
        ctx.outputs.resize(num_outputs, unknown);
        Ok(ctx)
    }

    pub fn graph_def_version(&self) -> i32 {
        self.graph_def_version
    }

    pub fn node_def(&self) -> &NodeDef {
        self.node_def
    }

    pub fn op_def(&self) -> &OpDef {
        self.op_def
    }

    /// Adds `shape` to the arena.
    pub fn make_shape(&mut self, shape: Shape) -> ShapeHandle {
        if shape == Shape::UnknownRank {
            return ShapeHandle(0);
        }
        self.shapes.push(shape);
        ShapeHandle(self.shapes.len() - 1)
    }

    pub fn unknown_shape(&self) -> ShapeHandle {
        ShapeHandle(0)
    }

    pub fn scalar(&mut self) -> ShapeHandle {
        self.make_shape(Shape::scalar())
    }

    /// Resolves a handle produced by this context.
    pub fn shape(&self, handle: ShapeHandle) -> &Shape {
        &self.shapes[handle.0]
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, idx: usize) -> ShapeHandle {
        self.inputs[idx]
    }

    pub fn set_input(&mut self, idx: usize, handle: ShapeHandle) {
        self.inputs[idx] = handle;
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn output(&self, idx: usize) -> ShapeHandle {
        self.outputs[idx]
    }

    pub fn set_output(&mut self, idx: usize, handle: ShapeHandle) -> Status {
        match self.outputs.get_mut(idx) {
            Some(slot) => {
                *slot = handle;
                Ok(())
            }
            None => Err(EagerError::invalid_argument(format!(
                "Output index {idx} out of range for op {} with {} outputs",
                self.op_def.name,
                self.outputs.len()
            ))),
        }
    }

    /// Runs `shape_fn` against this context.
    pub fn run(&mut self, shape_fn: &ShapeInferenceFn) -> Status {
        shape_fn(self).map_err(|e| {
            e.context(format!(
                "Shape inference failed for node {} (op {})",
                self.node_def.name, self.op_def.name
            ))
        })
    }

    pub fn attr_int(&self, name: &str) -> Result<i64> {
        match self.node_def.attr(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(other) => Err(EagerError::invalid_argument(format!(
                "Attr {name} of node {} is {other:?}, expected int",
                self.node_def.name
            ))),
            None => Err(EagerError::not_found(format!(
                "Node {} has no attr named {name}",
                self.node_def.name
            ))),
        }
    }

    pub fn attr_bool(&self, name: &str, default: bool) -> Result<bool> {
        match self.node_def.attr(name) {
            Some(AttrValue::Bool(v)) => Ok(*v),
            None => Ok(default),
            Some(other) => Err(EagerError::invalid_argument(format!(
                "Attr {name} of node {} is {other:?}, expected bool",
                self.node_def.name
            ))),
        }
    }

    /// Returns `handle` if it is compatible with `rank`, refining an unknown
    /// rank into `rank` unknown dimensions.
    pub fn with_rank(&mut self, handle: ShapeHandle, rank: usize) -> Result<ShapeHandle> {
        match self.shape(handle).rank() {
            None => Ok(self.make_shape(Shape::Known(vec![Dim::Unknown; rank]))),
            Some(r) if r == rank => Ok(handle),
            Some(r) => Err(EagerError::invalid_argument(format!(
                "Shape {} must be rank {rank} but is rank {r}",
                self.shape(handle)
            ))),
        }
    }

    /// Merges two compatible shapes into the most specific one.
    pub fn merge(&mut self, a: ShapeHandle, b: ShapeHandle) -> Result<ShapeHandle> {
        let (sa, sb) = (self.shape(a), self.shape(b));
        let (da, db) = match (sa.dims(), sb.dims()) {
            (None, _) => return Ok(b),
            (_, None) => return Ok(a),
            (Some(da), Some(db)) => (da, db),
        };
        if da.len() != db.len() {
            return Err(EagerError::invalid_argument(format!(
                "Shapes {sa} and {sb} have different ranks"
            )));
        }
        let mut merged = Vec::with_capacity(da.len());
        for (x, y) in da.iter().zip(db) {
            merged.push(match (x, y) {
                (Dim::Unknown, d) | (d, Dim::Unknown) => *d,
                (Dim::Known(p), Dim::Known(q)) if p == q => *x,
                _ => {
                    return Err(EagerError::invalid_argument(format!(
                        "Shapes {sa} and {sb} are not compatible"
                    )));
                }
            });
        }
        Ok(self.make_shape(Shape::Known(merged)))
    }

    /// Numpy-style broadcast of two shapes.
    pub fn broadcast(&mut self, a: ShapeHandle, b: ShapeHandle) -> Result<ShapeHandle> {
        let (sa, sb) = (self.shape(a), self.shape(b));
        let (da, db) = match (sa.dims(), sb.dims()) {
            (Some(da), Some(db)) => (da, db),
            _ => return Ok(self.unknown_shape()),
        };
        let rank = da.len().max(db.len());
        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let x = (i + da.len()).checked_sub(rank).map_or(Dim::Known(1), |j| da[j]);
            let y = (i + db.len()).checked_sub(rank).map_or(Dim::Known(1), |j| db[j]);
            out.push(match (x, y) {
                (Dim::Known(1), d) | (d, Dim::Known(1)) => d,
                (Dim::Known(p), Dim::Known(q)) if p == q => x,
                (Dim::Known(_), Dim::Known(_)) => {
                    return Err(EagerError::invalid_argument(format!(
                        "Incompatible shapes: {sa} vs. {sb}"
                    )));
                }
                (Dim::Unknown, Dim::Known(_)) => y,
                (Dim::Known(_), Dim::Unknown) => x,
                (Dim::Unknown, Dim::Unknown) => Dim::Unknown,
            });
        }
        Ok(self.make_shape(Shape::Known(out)))
    }
}

/// Shape functions shared by the standard ops.
pub mod common_shape_fns {
    use super::*;

    /// Output 0 has the shape of input 0.
    pub fn unchanged_shape(ctx: &mut InferenceContext<'_>) -> Status {
        let input = ctx.input(0);
        ctx.set_output(0, input)
    }

    /// Every output mirrors the input at the same position.
    pub fn forward_all_inputs(ctx: &mut InferenceContext<'_>) -> Status {
        for i in 0..ctx.num_outputs().min(ctx.num_inputs()) {
            let input = ctx.input(i);
            ctx.set_output(i, input)?;
        }
        Ok(())
    }

    /// Output 0 is the broadcast of inputs 0 and 1.
    pub fn broadcast_binary_op(ctx: &mut InferenceContext<'_>) -> Status {
        let (a, b) = (ctx.input(0), ctx.input(1));
        let out = ctx.broadcast(a, b)?;
        ctx.set_output(0, out)
    }

    /// Every output has an unknown shape.
    pub fn unknown_shape(ctx: &mut InferenceContext<'_>) -> Status {
        let unknown = ctx.unknown_shape();
        for i in 0..ctx.num_outputs() {
            ctx.set_output(i, unknown)?;
        }
        Ok(())
    }

    pub fn scalar_shape(ctx: &mut InferenceContext<'_>) -> Status {
        let scalar = ctx.scalar();
        ctx.set_output(0, scalar)
    }

    pub fn no_outputs(_ctx: &mut InferenceContext<'_>) -> Status {
        Ok(())
    }

    /// `[m, k] x [k, n] -> [m, n]`, honouring `transpose_a` / `transpose_b`.
    pub fn matmul_shape(ctx: &mut InferenceContext<'_>) -> Status {
        let (a, b) = (ctx.input(0), ctx.input(1));
        let a = ctx.with_rank(a, 2)?;
        let b = ctx.with_rank(b, 2)?;
        let transpose_a = ctx.attr_bool("transpose_a", false)?;
        let transpose_b = ctx.attr_bool("transpose_b", false)?;

        let (da, db) = match (ctx.shape(a).dims(), ctx.shape(b).dims()) {
            (Some(da), Some(db)) => (da.to_vec(), db.to_vec()),
            _ => return Err(EagerError::internal("rank-checked shape lost its rank")),
        };
        let (m, k_a) = if transpose_a { (da[1], da[0]) } else { (da[0], da[1]) };
        let (k_b, n) = if transpose_b { (db[1], db[0]) } else { (db[0], db[1]) };
        if let (Dim::Known(x), Dim::Known(y)) = (k_a, k_b) {
            if x != y {
                return Err(EagerError::invalid_argument(format!(
                    "Matrix size-incompatible: In[0]: {}, In[1]: {}",
                    ctx.shape(a),
                    ctx.shape(b)
                )));
            }
        }
        let out = ctx.make_shape(Shape::Known(vec![m, n]));
        ctx.set_output(0, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Arity, OpDef};
    use rstest::rstest;

    fn binary_op() -> OpDef {
        OpDef::new("Add").inputs(Arity::Fixed(2)).outputs(Arity::Fixed(1))
    }

    #[test]
    fn test_context_rejects_wrong_input_count() {
        let ndef = NodeDef::new("add", "Add");
        let op_def = binary_op();
        let err = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 3)
            .err()
            .unwrap();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_inputs_start_unknown() {
        let ndef = NodeDef::new("add", "Add");
        let op_def = binary_op();
        let ctx = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 2).unwrap();
        assert_eq!(ctx.num_inputs(), 2);
        assert_eq!(ctx.num_outputs(), 1);
        assert_eq!(ctx.shape(ctx.input(1)), &Shape::UnknownRank);
    }

    #[rstest]
    #[case(&[2, 3], &[2, 3], Shape::from_dims(&[2, 3]))]
    #[case(&[2, 3], &[3], Shape::from_dims(&[2, 3]))]
    #[case(&[4, 1], &[1, 5], Shape::from_dims(&[4, 5]))]
    #[case(&[-1, 3], &[2, 3], Shape::from_dims(&[2, 3]))]
    #[case(&[], &[7], Shape::from_dims(&[7]))]
    fn test_broadcast(#[case] a: &[i64], #[case] b: &[i64], #[case] expected: Shape) {
        let ndef = NodeDef::new("add", "Add");
        let op_def = binary_op();
        let mut ctx = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 2).unwrap();
        let ha = ctx.make_shape(Shape::from_dims(a));
        let hb = ctx.make_shape(Shape::from_dims(b));
        let out = ctx.broadcast(ha, hb).unwrap();
        assert_eq!(ctx.shape(out), &expected);
    }

    #[test]
    fn test_broadcast_incompatible() {
        let ndef = NodeDef::new("add", "Add");
        let op_def = binary_op();
        let mut ctx = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 2).unwrap();
        let ha = ctx.make_shape(Shape::from_dims(&[2, 3]));
        let hb = ctx.make_shape(Shape::from_dims(&[4]));
        assert!(ctx.broadcast(ha, hb).is_err());
    }

    #[test]
    fn test_merge_refines_unknown_dims() {
        let ndef = NodeDef::new("add", "Add");
        let op_def = binary_op();
        let mut ctx = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 2).unwrap();
        let a = ctx.make_shape(Shape::from_dims(&[-1, 3]));
        let b = ctx.make_shape(Shape::from_dims(&[2, -1]));
        let merged = ctx.merge(a, b).unwrap();
        assert_eq!(ctx.shape(merged), &Shape::from_dims(&[2, 3]));

        let c = ctx.make_shape(Shape::from_dims(&[5, 3]));
        assert!(ctx.merge(merged, c).is_err());
    }

    #[test]
    fn test_matmul_shape() {
        let ndef = NodeDef::new("mm", "MatMul")
            .with_attr("transpose_b", AttrValue::Bool(true));
        let op_def = OpDef::new("MatMul")
            .inputs(Arity::Fixed(2))
            .outputs(Arity::Fixed(1));
        let mut ctx = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 2).unwrap();
        let a = ctx.make_shape(Shape::from_dims(&[8, 4]));
        let b = ctx.make_shape(Shape::from_dims(&[16, 4]));
        ctx.set_input(0, a);
        ctx.set_input(1, b);

        let shape_fn: ShapeInferenceFn = Arc::new(common_shape_fns::matmul_shape);
        ctx.run(&shape_fn).unwrap();
        assert_eq!(ctx.shape(ctx.output(0)), &Shape::from_dims(&[8, 16]));
    }

    #[test]
    fn test_run_wraps_shape_fn_error() {
        let ndef = NodeDef::new("mm", "MatMul");
        let op_def = OpDef::new("MatMul")
            .inputs(Arity::Fixed(2))
            .outputs(Arity::Fixed(1));
        let mut ctx = InferenceContext::new(GRAPH_DEF_VERSION, &ndef, &op_def, 2).unwrap();
        let a = ctx.make_shape(Shape::from_dims(&[8, 4, 2]));
        ctx.set_input(0, a);

        let shape_fn: ShapeInferenceFn = Arc::new(common_shape_fns::matmul_shape);
        let err = ctx.run(&shape_fn).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
        assert!(err.message().contains("node mm"));
    }

    #[rstest]
    #[case(TensorShapeProto::from_dims(&[2, 3]), Some(Shape::from_dims(&[2, 3])))]
    #[case(TensorShapeProto::from_dims(&[-1, 3]), Some(Shape::Known(vec![Dim::Unknown, Dim::Known(3)])))]
    #[case(TensorShapeProto::unknown_rank(), Some(Shape::UnknownRank))]
    #[case(TensorShapeProto::from_dims(&[2, -7]), None)]
    fn test_from_proto(#[case] proto: TensorShapeProto, #[case] expected: Option<Shape>) {
        assert_eq!(Shape::from_proto(&proto).ok(), expected);
    }

    #[test]
    fn test_display_and_num_elements() {
        assert_eq!(Shape::from_dims(&[2, -1]).to_string(), "[2,?]");
        assert_eq!(Shape::unknown().to_string(), "<unknown>");
        assert_eq!(Shape::from_dims(&[2, 3]).num_elements(), Some(6));
        assert_eq!(Shape::from_dims(&[2, -1]).num_elements(), None);
        assert_eq!(Shape::scalar().num_elements(), Some(1));
    }
}
