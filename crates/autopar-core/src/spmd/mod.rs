//! Sharding propagation.
//!
//! A [`SpmdRule`] infers dims mappings for the inputs and outputs of an op from the dims mappings
//! of its tensors, in both directions. A [`DistOperator`] is the per-op-type container that feeds
//! a rule from the [`DistContext`](crate::DistContext) and writes the merged result back into the
//! op's distributed attribute.

mod fused_rope;

pub use fused_rope::*;

use std::sync::Arc;

use crate::{Block, DistContext, HashMap, OpDesc, TensorDistAttr};

#[derive(Debug, thiserror::Error)]
pub enum SpmdError {
    #[error("{rule} expects {expected} tensors, got {actual}.")]
    Arity {
        rule: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Dims mapping {mapping:?} does not match rank {rank} of {name}.")]
    RankMismatch {
        name: String,
        rank: usize,
        mapping: Vec<i64>,
    },
    #[error("Dims mappings of different length cannot be merged: {0:?}.")]
    LengthMismatch(Vec<Vec<i64>>),
    #[error("Dim {dim} is sharded on both mesh dim {lhs} and {rhs}.")]
    Incompatible { dim: usize, lhs: i64, rhs: i64 },
    #[error("Op {op_type} has no required argument {slot}.")]
    MissingArgument { op_type: String, slot: &'static str },
    #[error("Var {0} not found.")]
    MissingVar(String),
    #[error("Op {0} has no distributed attribute.")]
    MissingDistAttr(String),
}

/// Shape and distributed attribute of one tensor fed to a rule.
///
/// Absent optional tensors are passed as [`DistTensorSpec::empty`] to keep the positional order of
/// the op definition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DistTensorSpec {
    pub shape: Vec<i64>,
    pub dist_attr: TensorDistAttr,
}

impl DistTensorSpec {
    pub fn new(shape: Vec<i64>, dist_attr: TensorDistAttr) -> Result<Self, SpmdError> {
        if dist_attr.dims_mapping.len() != shape.len() {
            return Err(SpmdError::RankMismatch {
                name: format!("{shape:?}"),
                rank: shape.len(),
                mapping: dist_attr.dims_mapping,
            });
        }
        Ok(Self { shape, dist_attr })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn dims_mapping(&self) -> &[i64] {
        &self.dist_attr.dims_mapping
    }
}

/// Inferred attributes, positional over the rule's inputs and outputs. Placeholder positions hold
/// a default attribute.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpmdInfo {
    pub inputs: Vec<TensorDistAttr>,
    pub outputs: Vec<TensorDistAttr>,
}

pub trait SpmdRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn infer_forward(&self, inputs: &[DistTensorSpec]) -> Result<SpmdInfo, SpmdError>;

    fn infer_backward(
        &self,
        inputs: &[DistTensorSpec],
        outputs: &[DistTensorSpec],
    ) -> Result<SpmdInfo, SpmdError>;
}

/// Merges dims mappings of the same tensor. A replicated dim (`-1`) yields to a sharded one; two
/// different sharded mesh dims are incompatible.
pub fn compute_compatible_dims_mapping(mappings: &[&[i64]]) -> Result<Vec<i64>, SpmdError> {
    let Some(first) = mappings.first() else {
        return Ok(Vec::new());
    };
    if mappings.iter().any(|m| m.len() != first.len()) {
        return Err(SpmdError::LengthMismatch(
            mappings.iter().map(|m| m.to_vec()).collect(),
        ));
    }
    let mut merged = first.to_vec();
    for mapping in &mappings[1..] {
        for (dim, (acc, other)) in merged.iter_mut().zip(mapping.iter()).enumerate() {
            match (*acc, *other) {
                (_, -1) => {}
                (-1, o) => *acc = o,
                (a, o) if a == o => {}
                (a, o) => return Err(SpmdError::Incompatible { dim, lhs: a, rhs: o }),
            }
        }
    }
    Ok(merged)
}

/// Container of the distributed implementations of one op type.
pub trait DistOperator: Send + Sync {
    fn op_type(&self) -> &'static str;

    /// Propagates dims mappings through `op` and returns whether its attribute changed.
    fn update_dims_mapping(
        &self,
        op: &OpDesc,
        block: &Block,
        ctx: &mut DistContext,
    ) -> Result<bool, SpmdError>;

    /// Selects the implementation used to partition `op`. Returns whether the op's dims
    /// mappings were changed by the selection.
    fn mapping_to_dist_operator_impl(
        &self,
        op: &OpDesc,
        ctx: &mut DistContext,
    ) -> Result<bool, SpmdError>;
}

/// Name and index of the implementation every container falls back to.
pub const DEFAULT_IMPL_TYPE: &str = "default";
pub const DEFAULT_IMPL_IDX: usize = 0;

/// Dist-op containers by op type.
#[derive(Default, Clone)]
pub struct DistOpRegistry {
    containers: HashMap<&'static str, Arc<dyn DistOperator>>,
}

impl DistOpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in container.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DistributedFusedRope));
        registry
    }

    pub fn register(&mut self, container: Arc<dyn DistOperator>) {
        log::debug!("Registering dist op container {}", container.op_type());
        self.containers.insert(container.op_type(), container);
    }

    pub fn get(&self, op_type: &str) -> Option<Arc<dyn DistOperator>> {
        self.containers.get(op_type).cloned()
    }
}

impl std::fmt::Debug for DistOpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.containers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicated_yields_to_sharded() {
        let merged = compute_compatible_dims_mapping(&[&[-1, 0, -1], &[1, -1, -1]]).unwrap();
        assert_eq!(merged, vec![1, 0, -1]);
    }

    #[test]
    fn conflicting_shards_fail() {
        let err = compute_compatible_dims_mapping(&[&[0, -1], &[1, -1]]).unwrap_err();
        assert!(matches!(err, SpmdError::Incompatible { dim: 0, .. }));
        assert!(compute_compatible_dims_mapping(&[&[0], &[0, -1]]).is_err());
    }

    #[test]
    fn builtins_are_registered() {
        let registry = DistOpRegistry::with_builtins();
        assert!(registry.get(FUSED_ROPE_OP).is_some());
        assert!(registry.get("matmul").is_none());
    }
}
