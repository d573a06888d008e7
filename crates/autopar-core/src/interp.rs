//! Host interpreter for imperative programs.
//!
//! Every var is an `f32` buffer; integer and boolean vars are represented by their float value.
//! Collective ops simulate `nranks` identical replicas, so a sum reduction multiplies by the
//! replica count and an average reduction is the identity.

use crate::{program::SUB_BLOCK_KEY, Attribute, BlockId, HashMap, InvariantError, OpDesc, Program};

#[derive(Debug, thiserror::Error)]
pub enum InterpError {
    #[error("No kernel for op type {0}.")]
    UnsupportedOp(String),
    #[error("Op {op_type} has no {what} {name}.")]
    Missing {
        op_type: String,
        what: &'static str,
        name: String,
    },
    #[error("Var {0} is read before it is written.")]
    Uninitialized(String),
    #[error("Cannot broadcast {lhs:?} with {rhs:?} in {op_type}.")]
    Broadcast {
        op_type: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("Condition {0} must hold a single element.")]
    NonScalarCondition(String),
    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self::full(&[1], value)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// The single element of a one-element tensor.
    pub fn item(&self) -> Option<f32> {
        match self.data.as_slice() {
            [x] => Some(*x),
            _ => None,
        }
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|x| f(*x)).collect(),
        }
    }
}

/// Named tensors that live across program runs.
#[derive(Debug, Default, Clone)]
pub struct Scope {
    tensors: HashMap<String, HostTensor>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, tensor: HostTensor) {
        self.tensors.insert(name.to_string(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&HostTensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<HostTensor> {
        self.tensors.remove(name)
    }

    fn read(&self, name: &str) -> Result<&HostTensor, InterpError> {
        self.get(name)
            .ok_or_else(|| InterpError::Uninitialized(name.to_string()))
    }
}

pub struct Interpreter<'a> {
    program: &'a Program,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self { program }
    }

    /// Runs the global block once.
    pub fn run(&self, scope: &mut Scope) -> Result<(), InterpError> {
        self.run_block(0, scope)
    }

    pub fn run_block(&self, block: BlockId, scope: &mut Scope) -> Result<(), InterpError> {
        for op in self.program.block(block)?.ops() {
            log::trace!("interp: {op}");
            self.run_op(op, scope)?;
        }
        Ok(())
    }

    fn run_op(&self, op: &OpDesc, scope: &mut Scope) -> Result<(), InterpError> {
        let out = match op.op_type() {
            "fill_constant" => {
                let shape = attr(op, "shape")?
                    .as_ints()
                    .map(|dims| dims.iter().map(|d| (*d).max(1) as usize).collect::<Vec<_>>())
                    .unwrap_or_else(|| vec![1]);
                let value = float_attr(op, "value", 0.0);
                HostTensor::full(&shape, value)
            }
            "assign" | "cast" => scope.read(arg(op, "X")?)?.clone(),
            "elementwise_add" => binary(op, scope, |x, y| x + y)?,
            "elementwise_sub" => binary(op, scope, |x, y| x - y)?,
            "elementwise_mul" => binary(op, scope, |x, y| x * y)?,
            "elementwise_mod" => binary(op, scope, f32::rem_euclid)?,
            "equal" => binary(op, scope, |x, y| if x == y { 1.0 } else { 0.0 })?,
            "increment" => {
                let step = float_attr(op, "step", 1.0);
                scope.read(arg(op, "X")?)?.map(|x| x + step)
            }
            "scale" => {
                let s = float_attr(op, "scale", 1.0);
                let b = float_attr(op, "bias", 0.0);
                let after = op
                    .attr("bias_after_scale")
                    .and_then(Attribute::as_bool)
                    .unwrap_or(true);
                scope
                    .read(arg(op, "X")?)?
                    .map(|x| if after { x * s + b } else { (x + b) * s })
            }
            "set_value" => {
                let value = attr(op, "values")?
                    .as_floats()
                    .and_then(|v| v.first().copied())
                    .unwrap_or(0.0) as f32;
                scope.read(arg(op, "Input")?)?.map(|_| value)
            }
            "sgd" => {
                let param = scope.read(arg(op, "Param")?)?;
                let grad = scope.read(arg(op, "Grad")?)?;
                let lr = scope
                    .read(arg(op, "LearningRate")?)?
                    .item()
                    .ok_or_else(|| InterpError::NonScalarCondition("LearningRate".into()))?;
                if param.shape != grad.shape {
                    return Err(InterpError::Broadcast {
                        op_type: op.op_type().to_string(),
                        lhs: param.shape.clone(),
                        rhs: grad.shape.clone(),
                    });
                }
                let data = param
                    .data
                    .iter()
                    .zip(grad.data.iter())
                    .map(|(p, g)| p - lr * g)
                    .collect();
                let updated = HostTensor::new(param.shape.clone(), data);
                scope.set(out_arg(op, "ParamOut")?, updated);
                return Ok(());
            }
            "c_allreduce_sum" | "c_allreduce_avg" | "reduce" => {
                let nranks = op.attr("nranks").and_then(Attribute::as_int).unwrap_or(1) as f32;
                let is_sum = match op.op_type() {
                    "c_allreduce_sum" => true,
                    "c_allreduce_avg" => false,
                    _ => match op.attr("reduce_type").and_then(Attribute::as_int) {
                        Some(REDUCE_SUM) => true,
                        Some(REDUCE_AVG) => false,
                        other => {
                            return Err(InterpError::UnsupportedOp(format!(
                                "reduce with reduce_type {other:?}"
                            )))
                        }
                    },
                };
                let x = scope.read(arg(op, "X")?)?;
                if is_sum {
                    x.map(|v| v * nranks)
                } else {
                    x.clone()
                }
            }
            "conditional_block" => {
                let cond_name = arg(op, "Cond")?;
                let cond = scope
                    .read(cond_name)?
                    .item()
                    .ok_or_else(|| InterpError::NonScalarCondition(cond_name.to_string()))?;
                if cond != 0.0 {
                    let sub = attr(op, SUB_BLOCK_KEY)?.as_block().ok_or_else(|| {
                        InterpError::Missing {
                            op_type: op.op_type().to_string(),
                            what: "attribute",
                            name: SUB_BLOCK_KEY.to_string(),
                        }
                    })?;
                    self.run_block(sub, scope)?;
                }
                return Ok(());
            }
            other => return Err(InterpError::UnsupportedOp(other.to_string())),
        };
        scope.set(out_arg(op, "Out")?, out);
        Ok(())
    }
}

/// `reduce_type` values of the `reduce` op.
pub const REDUCE_SUM: i64 = 0;
pub const REDUCE_AVG: i64 = 4;

fn arg<'o>(op: &'o OpDesc, slot: &str) -> Result<&'o str, InterpError> {
    op.input(slot)
        .and_then(|names| names.first())
        .map(String::as_str)
        .ok_or_else(|| InterpError::Missing {
            op_type: op.op_type().to_string(),
            what: "input",
            name: slot.to_string(),
        })
}

fn out_arg<'o>(op: &'o OpDesc, slot: &str) -> Result<&'o str, InterpError> {
    op.output(slot)
        .and_then(|names| names.first())
        .map(String::as_str)
        .ok_or_else(|| InterpError::Missing {
            op_type: op.op_type().to_string(),
            what: "output",
            name: slot.to_string(),
        })
}

fn attr<'o>(op: &'o OpDesc, key: &str) -> Result<&'o Attribute, InterpError> {
    op.attr(key).ok_or_else(|| InterpError::Missing {
        op_type: op.op_type().to_string(),
        what: "attribute",
        name: key.to_string(),
    })
}

fn float_attr(op: &OpDesc, key: &str, default: f32) -> f32 {
    op.attr(key)
        .and_then(Attribute::as_float)
        .map(|v| v as f32)
        .unwrap_or(default)
}

fn binary(op: &OpDesc, scope: &Scope, f: impl Fn(f32, f32) -> f32) -> Result<HostTensor, InterpError> {
    let x = scope.read(arg(op, "X")?)?;
    let y = scope.read(arg(op, "Y")?)?;
    if x.data.len() == y.data.len() {
        let data = x.data.iter().zip(&y.data).map(|(a, b)| f(*a, *b)).collect();
        Ok(HostTensor::new(x.shape.clone(), data))
    } else if let Some(b) = y.item() {
        Ok(x.map(|a| f(a, b)))
    } else if let Some(a) = x.item() {
        Ok(y.map(|b| f(a, b)))
    } else {
        Err(InterpError::Broadcast {
            op_type: op.op_type().to_string(),
            lhs: x.shape.clone(),
            rhs: y.shape.clone(),
        })
    }
}
