use autopar::{InvariantError, OpDesc, Program, VarDesc};

use crate::{StatementIr, StatementKind, Symbol, SymbolicTraceContext};

#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error("No statement IR named {0}.")]
    UnknownSir(String),
    #[error("Cannot lower {kind} statement {name}.")]
    Unsupported { kind: &'static str, name: String },
    #[error("Statement {name} expects {expected} inputs, got {actual}.")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Symbol {0} has no meta info.")]
    MissingMeta(String),
    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

/// A lowered trace: a program plus the var names bound to the trace's inputs and outputs.
#[derive(Debug, Clone)]
pub struct LoweredProgram {
    pub program: Program,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Op type and input slots of a lowerable API.
fn op_for(name: &str) -> Option<(&'static str, &'static [&'static str])> {
    const BINARY: &[&str] = &["X", "Y"];
    const UNARY: &[&str] = &["X"];
    let base = name.strip_prefix("paddle.").unwrap_or(name);
    let base = base.trim_matches('_');
    Some(match base {
        "add" => ("elementwise_add", BINARY),
        "sub" | "subtract" => ("elementwise_sub", BINARY),
        "mul" | "multiply" => ("elementwise_mul", BINARY),
        "mod" | "remainder" => ("elementwise_mod", BINARY),
        "eq" | "equal" => ("equal", BINARY),
        "assign" | "clone" => ("assign", UNARY),
        "cast" | "astype" => ("cast", UNARY),
        _ => return None,
    })
}

fn declare(program: &mut Program, sir: &StatementIr, symbol: &Symbol) -> Result<(), LowerError> {
    let block = program.global_block_mut();
    if block.has_var(symbol.name()) {
        return Ok(());
    }
    let meta = sir
        .meta(symbol)
        .ok_or_else(|| LowerError::MissingMeta(symbol.name().to_string()))?;
    block.create_var(VarDesc::new(symbol.name(), meta.shape.clone(), meta.dtype))?;
    Ok(())
}

/// Lowers the statement IR `sir_name` to a single-block program.
pub fn compile_sir(ctx: &SymbolicTraceContext, sir_name: &str) -> Result<LoweredProgram, LowerError> {
    let sir = ctx
        .get_sir(sir_name)
        .ok_or_else(|| LowerError::UnknownSir(sir_name.to_string()))?;
    let mut program = Program::new();

    for input in &sir.inputs {
        declare(&mut program, sir, input)?;
    }
    for statement in &sir.statements {
        let lowered = match statement.kind {
            StatementKind::Api | StatementKind::Method => op_for(&statement.name),
            StatementKind::Call | StatementKind::Layer => None,
        };
        let Some((op_type, slots)) = lowered else {
            return Err(LowerError::Unsupported {
                kind: statement.kind.as_str(),
                name: statement.name.clone(),
            });
        };
        if statement.inputs.len() != slots.len() || statement.outputs.len() != 1 {
            return Err(LowerError::Arity {
                name: statement.name.clone(),
                expected: slots.len(),
                actual: statement.inputs.len(),
            });
        }
        for symbol in statement.inputs.iter().chain(statement.outputs.iter()) {
            declare(&mut program, sir, symbol)?;
        }
        let mut op = OpDesc::new(op_type);
        for (slot, symbol) in slots.iter().zip(&statement.inputs) {
            op = op.with_input(slot, [symbol.name()]);
        }
        op = op.with_output("Out", [statement.outputs[0].name()]);
        if op_type == "cast" {
            if let Some(meta) = sir.meta(&statement.outputs[0]) {
                op = op.with_attr("out_dtype", meta.dtype);
            }
        }
        program.global_block_mut().append_op(op);
    }
    for output in &sir.outputs {
        declare(&mut program, sir, output)?;
    }
    program.verify()?;
    log::debug!(
        "Lowered {sir_name} to {} ops",
        program.global_block().num_ops()
    );

    Ok(LoweredProgram {
        program,
        inputs: sir.inputs.iter().map(|s| s.name().to_string()).collect(),
        outputs: sir.outputs.iter().map(|s| s.name().to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetaInfo;
    use autopar::{shape, DType};

    #[test]
    fn lowers_arithmetic() {
        let mut ctx = SymbolicTraceContext::new();
        let name = ctx.start_sir();
        let meta = MetaInfo::new(shape![3], DType::F32);
        let x = ctx.input(meta.clone());
        let y = ctx.input(meta.clone());
        let z = ctx.call_method("__add__", &[x, y], meta.clone());
        let w = ctx.call_api("paddle.multiply", &[z.clone(), z], meta);
        ctx.finish(vec![w]);

        let lowered = compile_sir(&ctx, &name).unwrap();
        let types: Vec<_> = lowered
            .program
            .global_block()
            .ops()
            .iter()
            .map(|op| op.op_type().to_string())
            .collect();
        assert_eq!(types, ["elementwise_add", "elementwise_mul"]);
        assert_eq!(lowered.inputs, ["var_0", "var_1"]);
        assert_eq!(lowered.outputs, ["var_3"]);
    }

    #[test]
    fn layers_and_unknown_apis_are_rejected() {
        let mut ctx = SymbolicTraceContext::new();
        let name = ctx.start_sir();
        let meta = MetaInfo::new(shape![3], DType::F32);
        let x = ctx.input(meta.clone());
        let y = ctx.call_api("paddle.nn.functional.relu", &[x], meta);
        ctx.finish(vec![y]);
        assert!(matches!(
            compile_sir(&ctx, &name),
            Err(LowerError::Unsupported { kind: "api", .. })
        ));
        assert!(matches!(
            compile_sir(&ctx, "SIR_9"),
            Err(LowerError::UnknownSir(_))
        ));
    }
}
