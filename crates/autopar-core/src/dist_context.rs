use crate::{
    program::CONTROL_FLOW_OPS, HashMap, InvariantError, OpDesc, OpDistAttr, OpId, ProcessMesh,
    Program, TensorDistAttr, VarDesc, VarId,
};

/// Side table of distributed attributes for the vars and ops of imperative programs.
///
/// Op attributes are looked up by id first and then by original id, so a structural copy of an
/// op finds the attribute registered for the op it was copied from.
#[derive(Debug, Default, Clone)]
pub struct DistContext {
    tensors: HashMap<VarId, TensorDistAttr>,
    ops: HashMap<OpId, OpDistAttr>,
}

impl DistContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensor_dist_attr(&self, var: &VarDesc) -> Option<&TensorDistAttr> {
        self.tensors.get(&var.id())
    }

    pub fn set_tensor_dist_attr(&mut self, var: &VarDesc, attr: TensorDistAttr) {
        self.tensors.insert(var.id(), attr);
    }

    pub fn remove_tensor_dist_attr(&mut self, var: &VarDesc) -> Option<TensorDistAttr> {
        self.tensors.remove(&var.id())
    }

    pub fn op_dist_attr(&self, op: &OpDesc) -> Option<&OpDistAttr> {
        self.ops
            .get(&op.id())
            .or_else(|| self.ops.get(&op.original_id()))
    }

    pub fn op_dist_attr_mut(&mut self, op: &OpDesc) -> Option<&mut OpDistAttr> {
        let key = if self.ops.contains_key(&op.id()) {
            op.id()
        } else {
            op.original_id()
        };
        self.ops.get_mut(&key)
    }

    pub fn set_op_dist_attr(&mut self, op: &OpDesc, attr: OpDistAttr) {
        self.ops.insert(op.id(), attr);
    }

    pub fn remove_op_dist_attr(&mut self, op: &OpDesc) -> Option<OpDistAttr> {
        self.ops.remove(&op.id())
    }

    pub fn num_tensor_attrs(&self) -> usize {
        self.tensors.len()
    }

    pub fn num_op_attrs(&self) -> usize {
        self.ops.len()
    }

    /// Annotates every input and output of `op` with the same mesh and dims mapping. Tensor
    /// attributes are left untouched.
    pub fn naive_set_op_dist_attr(
        &mut self,
        op: &OpDesc,
        mesh: &ProcessMesh,
        mapping: &[i64],
        chunk_id: i64,
    ) {
        let mut attr = OpDistAttr::new(mesh.clone(), chunk_id);
        for name in op.input_arg_names() {
            attr.set_input_dims_mapping(name, mapping.to_vec());
        }
        for name in op.output_arg_names() {
            attr.set_output_dims_mapping(name, mapping.to_vec());
        }
        self.set_op_dist_attr(op, attr);
    }

    /// Checks that every annotated var written by an annotated op carries the dims mapping the
    /// op records for that output. Control-flow ops are skipped.
    pub fn verify(&self, program: &Program) -> Result<(), InvariantError> {
        for block in program.blocks() {
            for op in block.ops() {
                if CONTROL_FLOW_OPS.contains(&op.op_type()) {
                    continue;
                }
                let Some(op_attr) = self.op_dist_attr(op) else {
                    continue;
                };
                for name in op.output_arg_names() {
                    let (Some(expected), Some(var)) = (
                        op_attr.output_dims_mapping(name),
                        program.find_var(block.idx(), name),
                    ) else {
                        continue;
                    };
                    if let Some(actual) = self.tensor_dist_attr(var) {
                        if actual.dims_mapping != expected {
                            return Err(InvariantError::DistAttrMismatch {
                                name: name.to_string(),
                                op_type: op.op_type().to_string(),
                                expected: expected.to_vec(),
                                actual: actual.dims_mapping.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
