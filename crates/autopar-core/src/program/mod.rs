//! Imperative programs: blocks of ops with named var edges.

mod block;
mod op_desc;
mod var_desc;

pub use block::*;
pub use op_desc::*;
pub use var_desc::*;

use crate::InvariantError;

/// Op types that own a sub-block through their `sub_block` attribute.
pub const CONTROL_FLOW_OPS: [&str; 2] = ["conditional_block", "while"];

pub const SUB_BLOCK_KEY: &str = "sub_block";

/// A program is an ordered list of blocks. Block 0 is the global block; every other block has a
/// parent through which it resolves names it does not declare itself.
#[derive(Debug, Clone)]
pub struct Program {
    blocks: Vec<Block>,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::new(0, None)],
        }
    }

    pub fn global_block(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn global_block_mut(&mut self) -> &mut Block {
        &mut self.blocks[0]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, idx: BlockId) -> Result<&Block, InvariantError> {
        self.blocks.get(idx).ok_or(InvariantError::BlockNotFound(idx))
    }

    pub fn block_mut(&mut self, idx: BlockId) -> Result<&mut Block, InvariantError> {
        self.blocks
            .get_mut(idx)
            .ok_or(InvariantError::BlockNotFound(idx))
    }

    pub fn create_block(&mut self, parent: BlockId) -> Result<BlockId, InvariantError> {
        self.block(parent)?;
        let idx = self.blocks.len();
        self.blocks.push(Block::new(idx, Some(parent)));
        log::trace!("Created block {idx} with parent {parent}");
        Ok(idx)
    }

    /// Resolves `name` in `block` or any of its ancestors.
    pub fn find_var(&self, block: BlockId, name: &str) -> Option<&VarDesc> {
        let mut current = self.blocks.get(block);
        while let Some(b) = current {
            if let Some(var) = b.var(name) {
                return Some(var);
            }
            current = b.parent().and_then(|p| self.blocks.get(p));
        }
        None
    }

    /// Checks that every op argument resolves, usage indices are in sync and every control-flow
    /// op points at an existing sub-block.
    pub fn verify(&self) -> Result<(), InvariantError> {
        for block in &self.blocks {
            block.verify_index()?;
            for op in block.ops() {
                for name in op.input_arg_names().chain(op.output_arg_names()) {
                    if self.find_var(block.idx(), name).is_none() {
                        return Err(InvariantError::DanglingReference {
                            op: op.id(),
                            op_type: op.op_type().to_string(),
                            name: name.to_string(),
                            block: block.idx(),
                        });
                    }
                }
                if CONTROL_FLOW_OPS.contains(&op.op_type()) {
                    let sub = op
                        .attr(SUB_BLOCK_KEY)
                        .and_then(|a| a.as_block())
                        .ok_or(InvariantError::ArgumentNotFound {
                            op: op.id(),
                            name: SUB_BLOCK_KEY.to_string(),
                            direction: "attribute",
                        })?;
                    self.block(sub)?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for block in &self.blocks {
            writeln!(f, "block {} (parent {:?}) {{", block.idx(), block.parent())?;
            for var in block.vars() {
                writeln!(
                    f,
                    "  var {} : {}{}{}",
                    var.name(),
                    var.dtype(),
                    var.shape(),
                    if var.persistable() { " persistable" } else { "" }
                )?;
            }
            for op in block.ops() {
                writeln!(f, "  {op}")?;
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shape, DType, OpRole};

    #[test]
    fn sub_block_resolves_through_parent() {
        let mut program = Program::new();
        program
            .global_block_mut()
            .create_var(VarDesc::new("acc", shape![4], DType::F32).with_persistable(true))
            .unwrap();
        let sub = program.create_block(0).unwrap();
        program.block_mut(sub).unwrap().append_op(
            OpDesc::new("scale")
                .with_input("X", ["acc"])
                .with_output("Out", ["acc"])
                .with_role(OpRole::OPTIMIZE),
        );
        program
            .global_block_mut()
            .append_op(OpDesc::new("conditional_block").with_attr(SUB_BLOCK_KEY, crate::Attribute::Block(sub)));
        program.verify().unwrap();
        assert!(program.find_var(sub, "acc").is_some());
    }

    #[test]
    fn dangling_reference_is_reported() {
        let mut program = Program::new();
        program
            .global_block_mut()
            .append_op(OpDesc::new("assign").with_input("X", ["ghost"]));
        let err = program.verify().unwrap_err();
        assert!(matches!(err, InvariantError::DanglingReference { name, .. } if name == "ghost"));
    }
}
