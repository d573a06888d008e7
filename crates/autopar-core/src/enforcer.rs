use crate::{BlockId, OpId};

/// Structural invariant violations of a program in either representation.
#[derive(Debug, thiserror::Error)]
pub enum InvariantError {
    #[error("Var {name} already exists in block {block}.")]
    DuplicateVar { name: String, block: BlockId },
    #[error("Var {name} not found in block {block} or its ancestors.")]
    VarNotFound { name: String, block: BlockId },
    #[error("Op {op:?} ({op_type}) references undefined var {name} in block {block}.")]
    DanglingReference {
        op: OpId,
        op_type: String,
        name: String,
        block: BlockId,
    },
    #[error("Op index {index} out of range for block {block} with {len} ops.")]
    OpIndexOutOfRange {
        index: usize,
        len: usize,
        block: BlockId,
    },
    #[error("Op {0:?} not found.")]
    OpNotFound(OpId),
    #[error("Block {0} does not exist.")]
    BlockNotFound(BlockId),
    #[error("Op {op:?} has no {direction} argument {name}.")]
    ArgumentNotFound {
        op: OpId,
        name: String,
        direction: &'static str,
    },
    #[error("Usage index of var {name} is out of sync with the ops of block {block}.")]
    StaleIndex { name: String, block: BlockId },
    #[error("Value {0} does not exist.")]
    ValueNotFound(String),
    #[error("Operation {0} does not exist.")]
    OperationNotFound(String),
    #[error("Value {value} used by {op} before it is defined.")]
    UseBeforeDef { value: String, op: String },
    #[error("Cannot erase {op}: result {value} still has {uses} uses.")]
    ValueStillUsed {
        op: String,
        value: String,
        uses: usize,
    },
    #[error("Operand index {index} out of range for {op} with {len} operands.")]
    OperandOutOfRange {
        op: String,
        index: usize,
        len: usize,
    },
    #[error("Dims mapping of {name} is {actual:?} but its producer {op_type} writes {expected:?}.")]
    DistAttrMismatch {
        name: String,
        op_type: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },
}
