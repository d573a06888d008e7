use super::{
    compute_compatible_dims_mapping, DistOperator, DistTensorSpec, SpmdError, SpmdInfo, SpmdRule,
    DEFAULT_IMPL_IDX, DEFAULT_IMPL_TYPE,
};
use crate::{Block, DistContext, OpDesc, ProcessMesh, TensorDistAttr};

pub const FUSED_ROPE_OP: &str = "fused_rotary_position_embedding";

/// Argument slots in the order of the op definition.
const INPUT_SLOTS: [&str; 6] = ["q", "k", "v", "sin", "cos", "position_ids"];
const OUTPUT_SLOTS: [&str; 3] = ["out_q", "out_k", "out_v"];

// q, k and v are laid out as [batch, seq_len, num_heads, head_dim].
const BATCH_AXIS: usize = 0;
const HEAD_AXIS: usize = 2;
const QKV_RANK: usize = 4;

/// Sharding rule of the fused rotary position embedding.
///
/// Batch and head axes may stay sharded and follow q (falling back to k and v). Sequence and
/// head-dim axes are replicated because the rotation mixes elements along them. sin and cos are
/// replicated and position_ids follows the batch axis.
#[derive(Debug, Default, Clone, Copy)]
pub struct FusedRopeSpmd;

impl FusedRopeSpmd {
    fn check_qkv(&self, specs: &[&DistTensorSpec]) -> Result<(), SpmdError> {
        for spec in specs.iter().filter(|s| !s.is_empty()) {
            if spec.shape.len() != QKV_RANK || spec.dims_mapping().len() != QKV_RANK {
                return Err(SpmdError::RankMismatch {
                    name: "qkv".to_string(),
                    rank: QKV_RANK,
                    mapping: spec.dims_mapping().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Picks the mesh dim of `axis` from the first non-empty spec that shards it.
    fn follow_axis(specs: &[&DistTensorSpec], axis: usize) -> i64 {
        specs
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.dims_mapping()[axis])
            .find(|d| *d != -1)
            .unwrap_or(-1)
    }

    fn build(
        &self,
        inputs: &[DistTensorSpec],
        present_outputs: [bool; 3],
        reference: &TensorDistAttr,
        batch: i64,
        head: i64,
    ) -> SpmdInfo {
        let head = if head == batch { -1 } else { head };
        let mesh: &ProcessMesh = &reference.process_mesh;
        let attr = |mapping: Vec<i64>| TensorDistAttr::new(mesh.clone(), mapping, reference.chunk_id);
        let qkv = || attr(vec![batch, -1, head, -1]);

        let inputs = inputs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                if spec.is_empty() {
                    return TensorDistAttr::default();
                }
                match i {
                    0..=2 => qkv(),
                    3 | 4 => attr(vec![-1; spec.shape.len()]),
                    _ => {
                        let mut mapping = vec![-1; spec.shape.len()];
                        if let Some(first) = mapping.first_mut() {
                            *first = batch;
                        }
                        attr(mapping)
                    }
                }
            })
            .collect();
        let outputs = present_outputs
            .iter()
            .map(|present| {
                if *present {
                    qkv()
                } else {
                    TensorDistAttr::default()
                }
            })
            .collect();
        SpmdInfo { inputs, outputs }
    }
}

impl SpmdRule for FusedRopeSpmd {
    fn name(&self) -> &'static str {
        FUSED_ROPE_OP
    }

    fn infer_forward(&self, inputs: &[DistTensorSpec]) -> Result<SpmdInfo, SpmdError> {
        if inputs.len() != INPUT_SLOTS.len() {
            return Err(SpmdError::Arity {
                rule: self.name(),
                expected: INPUT_SLOTS.len(),
                actual: inputs.len(),
            });
        }
        let qkv = [&inputs[0], &inputs[1], &inputs[2]];
        self.check_qkv(&qkv)?;
        if inputs[0].is_empty() {
            return Err(SpmdError::MissingArgument {
                op_type: FUSED_ROPE_OP.to_string(),
                slot: "q",
            });
        }
        let batch = Self::follow_axis(&qkv, BATCH_AXIS);
        let head = Self::follow_axis(&qkv, HEAD_AXIS);
        let present = [true, !inputs[1].is_empty(), !inputs[2].is_empty()];
        log::trace!("{}: forward batch={batch} head={head}", self.name());
        Ok(self.build(inputs, present, &inputs[0].dist_attr, batch, head))
    }

    fn infer_backward(
        &self,
        inputs: &[DistTensorSpec],
        outputs: &[DistTensorSpec],
    ) -> Result<SpmdInfo, SpmdError> {
        if inputs.len() != INPUT_SLOTS.len() || outputs.len() != OUTPUT_SLOTS.len() {
            return Err(SpmdError::Arity {
                rule: self.name(),
                expected: INPUT_SLOTS.len() + OUTPUT_SLOTS.len(),
                actual: inputs.len() + outputs.len(),
            });
        }
        let outs = [&outputs[0], &outputs[1], &outputs[2]];
        self.check_qkv(&outs)?;
        if outputs[0].is_empty() {
            return Err(SpmdError::MissingArgument {
                op_type: FUSED_ROPE_OP.to_string(),
                slot: "out_q",
            });
        }
        let batch = Self::follow_axis(&outs, BATCH_AXIS);
        let head = Self::follow_axis(&outs, HEAD_AXIS);
        let present = [true, !outputs[1].is_empty(), !outputs[2].is_empty()];
        log::trace!("{}: backward batch={batch} head={head}", self.name());
        Ok(self.build(inputs, present, &outputs[0].dist_attr, batch, head))
    }
}

/// Dist-op container of the fused rotary position embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct DistributedFusedRope;

impl DistributedFusedRope {
    fn spec(
        block: &Block,
        name: &str,
        mapping: Option<&[i64]>,
        mesh: &ProcessMesh,
        chunk_id: i64,
    ) -> Result<DistTensorSpec, SpmdError> {
        let var = block
            .var(name)
            .ok_or_else(|| SpmdError::MissingVar(name.to_string()))?;
        let shape = var.shape().to_vec();
        let mapping = mapping.map(<[i64]>::to_vec).unwrap_or(vec![-1; shape.len()]);
        DistTensorSpec::new(shape, TensorDistAttr::new(mesh.clone(), mapping, chunk_id))
    }
}

impl DistOperator for DistributedFusedRope {
    fn op_type(&self) -> &'static str {
        FUSED_ROPE_OP
    }

    fn update_dims_mapping(
        &self,
        op: &OpDesc,
        block: &Block,
        ctx: &mut DistContext,
    ) -> Result<bool, SpmdError> {
        let mut op_attr = ctx
            .op_dist_attr(op)
            .cloned()
            .ok_or_else(|| SpmdError::MissingDistAttr(op.op_type().to_string()))?;
        let first = |names: Option<&[String]>| names.and_then(|n| n.first()).cloned();
        let input_names = INPUT_SLOTS.map(|slot| first(op.input(slot)));
        let output_names = OUTPUT_SLOTS.map(|slot| first(op.output(slot)));
        if input_names[0].is_none() {
            return Err(SpmdError::MissingArgument {
                op_type: op.op_type().to_string(),
                slot: "q",
            });
        }
        if output_names[0].is_none() {
            return Err(SpmdError::MissingArgument {
                op_type: op.op_type().to_string(),
                slot: "out_q",
            });
        }

        let mesh = op_attr.process_mesh.clone();
        let chunk_id = op_attr.chunk_id;
        let mut input_specs = Vec::with_capacity(INPUT_SLOTS.len());
        for name in &input_names {
            input_specs.push(match name {
                Some(name) => {
                    Self::spec(block, name, op_attr.input_dims_mapping(name), &mesh, chunk_id)?
                }
                None => DistTensorSpec::empty(),
            });
        }
        let mut output_specs = Vec::with_capacity(OUTPUT_SLOTS.len());
        for name in &output_names {
            output_specs.push(match name {
                Some(name) => {
                    Self::spec(block, name, op_attr.output_dims_mapping(name), &mesh, chunk_id)?
                }
                None => DistTensorSpec::empty(),
            });
        }

        let rule = FusedRopeSpmd;
        let fw = rule.infer_forward(&input_specs)?;
        let bw = rule.infer_backward(&input_specs, &output_specs)?;

        let mut changed = false;
        for (i, name) in input_names.iter().enumerate() {
            let Some(name) = name else { continue };
            let merged = compute_compatible_dims_mapping(&[
                &fw.inputs[i].dims_mapping,
                &bw.inputs[i].dims_mapping,
            ])?;
            if op_attr.input_dims_mapping(name) != Some(merged.as_slice()) {
                log::trace!("{FUSED_ROPE_OP}: input {name} -> {merged:?}");
                op_attr.set_input_dims_mapping(name, merged);
                changed = true;
            }
        }
        for (i, name) in output_names.iter().enumerate() {
            let Some(name) = name else { continue };
            let merged = compute_compatible_dims_mapping(&[
                &fw.outputs[i].dims_mapping,
                &bw.outputs[i].dims_mapping,
            ])?;
            if op_attr.output_dims_mapping(name) != Some(merged.as_slice()) {
                log::trace!("{FUSED_ROPE_OP}: output {name} -> {merged:?}");
                op_attr.set_output_dims_mapping(name, merged);
                changed = true;
            }
        }
        if changed {
            ctx.set_op_dist_attr(op, op_attr);
        }
        Ok(changed)
    }

    fn mapping_to_dist_operator_impl(
        &self,
        op: &OpDesc,
        ctx: &mut DistContext,
    ) -> Result<bool, SpmdError> {
        let attr = ctx
            .op_dist_attr_mut(op)
            .ok_or_else(|| SpmdError::MissingDistAttr(op.op_type().to_string()))?;
        attr.impl_type = DEFAULT_IMPL_TYPE.to_string();
        attr.impl_idx = DEFAULT_IMPL_IDX;
        Ok(false)
    }
}
