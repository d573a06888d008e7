//! Gradient merge on imperative programs.
//!
//! The rewrite runs in order:
//! 1. optimizer ops are taken out of the main block,
//! 2. an accumulation `acc = acc + grad` is inserted after each gradient producer,
//! 3. data-parallel reductions optionally move behind the accumulation,
//! 4. master-precision gradient casts are elided,
//! 5. a step counter advances as `step = (step + 1) % k` and sets `cond = step == 0`,
//! 6. the optimizer ops are replayed on the accumulators inside a conditional block.

use std::collections::{BTreeMap, BTreeSet};

use autopar::{
    interp::{REDUCE_AVG, REDUCE_SUM},
    program::{OP_ROLE_VAR_KEY, SUB_BLOCK_KEY},
    shape, Attribute, DType, DistContext, InvariantError, NamescopeGuard, OpDesc, OpRole,
    ProcessMesh, Program, TensorDistAttr, VarDesc, VarKind, VarRelation, DATA_PARALLEL_SCOPE,
};

use super::{
    merge_var_name, GradientMergeConfig, GradientMergeError, GRADIENT_MERGE_SCOPE, MASTER_GRAD_CAST_KEY,
};
use crate::{ParamGrad, PassContext};

pub const GRADIENT_MERGE_K: &str = "gradient_merge_k";
pub const GRADIENT_MERGE_ZERO: &str = "gradient_merge_zero";
pub const GRADIENT_MERGE_STEP: &str = "gradient_merge_step";
pub const GRADIENT_MERGE_COND: &str = "gradient_merge_cond";

const MASTER_GRAD_MARKER: &str = "@master_grad";

type Result<T> = std::result::Result<T, GradientMergeError>;

/// Rewrites `main` and `startup` for gradient merge and returns the gradient to accumulator
/// renames.
pub fn parse_program(
    main: &mut Program,
    startup: &mut Program,
    params_grads: &[ParamGrad<String>],
    config: &GradientMergeConfig,
    ctx: &mut PassContext,
) -> Result<BTreeMap<String, String>> {
    let mut optimize_ops = remove_and_get_optimizer_ops(main)?;

    let (new_params_grads, grad_to_merge) =
        append_gradient_merge_backward_ops(main, startup, params_grads, &mut ctx.dist_context)?;

    if config.gradient_sync_after_accumulate {
        move_reduce_to_optimizer_ops(main, &mut optimize_ops)?;
    }

    remove_cast_for_master_grad(main, &mut ctx.dist_context)?;

    let world_mesh = ProcessMesh::from_ranks(&ctx.world_ranks);
    let cond = create_cond_var(main, startup, config.k_steps, &world_mesh, &mut ctx.dist_context)?;

    create_cond_block_and_update_optimizer(
        main,
        &cond,
        &new_params_grads,
        &grad_to_merge,
        optimize_ops,
        config,
        &mut ctx.dist_context,
    )?;

    Ok(grad_to_merge)
}

/// Removes every optimize-role op from the global block and returns them in program order.
pub fn remove_and_get_optimizer_ops(main: &mut Program) -> Result<Vec<OpDesc>> {
    let block = main.global_block_mut();
    let indices: Vec<usize> = block
        .ops()
        .iter()
        .enumerate()
        .filter(|(_, op)| op.role().is_optimize())
        .map(|(i, _)| i)
        .collect();
    let mut removed = Vec::with_capacity(indices.len());
    for idx in indices.into_iter().rev() {
        removed.push(block.remove_op(idx)?);
    }
    removed.reverse();
    log::debug!("Took {} optimizer ops out of the main block", removed.len());
    Ok(removed)
}

/// Creates an accumulator for every requested gradient and accumulates into it right after the
/// gradient's producer.
///
/// Each requested pair is matched by exactly one producer in the backward region. Pairs left
/// unmatched are an error.
pub fn append_gradient_merge_backward_ops(
    main: &mut Program,
    startup: &mut Program,
    params_grads: &[ParamGrad<String>],
    dist_context: &mut DistContext,
) -> Result<(Vec<ParamGrad<String>>, BTreeMap<String, String>)> {
    let mut pending: Vec<(String, String)> = Vec::new();
    for pair in params_grads {
        let Some(grad) = &pair.grad else {
            log::trace!("Parameter {} has no gradient, skipping", pair.param);
            continue;
        };
        let param = main
            .global_block()
            .var(&pair.param)
            .ok_or_else(|| InvariantError::VarNotFound {
                name: pair.param.clone(),
                block: 0,
            })?;
        if param.kind() == VarKind::SelectedRows {
            return Err(GradientMergeError::SelectedRowsParam(pair.param.clone()));
        }
        pending.push((pair.param.clone(), grad.clone()));
    }

    let mut new_params_grads = Vec::new();
    let mut grad_to_merge = BTreeMap::new();

    let num_ops = main.global_block().num_ops();
    for idx in (0..num_ops).rev() {
        if pending.is_empty() {
            break;
        }
        let op = &main.global_block().ops()[idx];
        if op.role().is_forward() {
            break;
        }
        let outputs: Vec<String> = op.output_arg_names().map(str::to_string).collect();
        for out_name in outputs {
            let Some(pos) = pending.iter().position(|(_, grad)| *grad == out_name) else {
                continue;
            };
            let (param, grad) = pending.remove(pos);
            let merge = accumulate_after(main, startup, idx, &param, &grad, dist_context)?;
            log::debug!("Accumulating {grad} into {merge} after op {idx}");
            new_params_grads.push(ParamGrad::new(param, Some(merge.clone())));
            grad_to_merge.insert(grad, merge);
        }
    }

    if !pending.is_empty() {
        return Err(GradientMergeError::UnresolvedGradients(
            pending.into_iter().map(|(_, grad)| grad).collect(),
        ));
    }
    Ok((new_params_grads, grad_to_merge))
}

fn accumulate_after(
    main: &mut Program,
    startup: &mut Program,
    producer: usize,
    param: &str,
    grad: &str,
    dist_context: &mut DistContext,
) -> Result<String> {
    let block = main.global_block_mut();
    let param_var = block.var(param).ok_or_else(|| InvariantError::VarNotFound {
        name: param.to_string(),
        block: 0,
    })?;
    let ref_dist_attr = dist_context
        .tensor_dist_attr(param_var)
        .cloned()
        .ok_or_else(|| GradientMergeError::MissingParamDistAttr(param.to_string()))?;
    let grad_var = block.var(grad).ok_or_else(|| InvariantError::VarNotFound {
        name: grad.to_string(),
        block: 0,
    })?;
    let (shape, dtype) = (grad_var.shape().clone(), grad_var.dtype());

    let merge = merge_var_name(param);
    let relation = VarRelation::AccumulatorOf {
        param: param.to_string(),
    };
    let merge_var = block.create_var(
        VarDesc::new(merge.clone(), shape.clone(), dtype)
            .with_persistable(true)
            .with_relation(relation.clone()),
    )?;
    dist_context.set_tensor_dist_attr(merge_var, ref_dist_attr.clone());

    let startup_block = startup.global_block_mut();
    startup_block.create_var(
        VarDesc::new(merge.clone(), shape.clone(), dtype)
            .with_persistable(true)
            .with_relation(relation),
    )?;
    startup_block.append_op(
        OpDesc::new("fill_constant")
            .with_output("Out", [merge.as_str()])
            .with_attr("shape", shape.to_vec())
            .with_attr("dtype", dtype)
            .with_attr("value", 0.0),
    );

    // In-place accumulation must read the accumulator first.
    let add = {
        let _scope = NamescopeGuard::new(GRADIENT_MERGE_SCOPE);
        OpDesc::new("elementwise_add")
            .with_input("X", [merge.as_str()])
            .with_input("Y", [grad])
            .with_output("Out", [merge.as_str()])
            .with_attr("axis", -1)
            .with_role(OpRole::BACKWARD)
    };
    dist_context.naive_set_op_dist_attr(
        &add,
        &ref_dist_attr.process_mesh,
        &ref_dist_attr.dims_mapping,
        ref_dist_attr.chunk_id,
    );
    block.insert_op(producer + 1, add)?;
    Ok(merge)
}

fn in_data_parallel_scope(op: &OpDesc) -> bool {
    op.namescope()
        .is_some_and(|scope| scope.contains(DATA_PARALLEL_SCOPE))
}

/// Gradient synchronization ops inserted by data parallelism.
pub fn is_data_parallel_reduce_op(op: &OpDesc) -> bool {
    let is_reduce = match op.op_type() {
        "c_allreduce_sum" | "c_allreduce_avg" => true,
        "reduce" => matches!(
            op.attr("reduce_type").and_then(Attribute::as_int),
            Some(REDUCE_SUM | REDUCE_AVG)
        ),
        _ => false,
    };
    is_reduce && in_data_parallel_scope(op)
}

pub fn is_data_parallel_scale_op(op: &OpDesc) -> bool {
    op.op_type() == "scale" && in_data_parallel_scope(op)
}

fn is_sum_reduce(op: &OpDesc) -> bool {
    op.op_type() == "c_allreduce_sum"
        || (op.op_type() == "reduce"
            && op.attr("reduce_type").and_then(Attribute::as_int) == Some(REDUCE_SUM))
}

/// Moves data-parallel reductions, and the scale paired with each sum reduction, to the front
/// of the optimizer ops so gradients are synchronized once per merged step. Reductions of a
/// renamed gradient alias stay where they are.
pub fn move_reduce_to_optimizer_ops(main: &mut Program, optimize_ops: &mut Vec<OpDesc>) -> Result<()> {
    let block = main.global_block_mut();
    let mut claimed = BTreeSet::new();
    let mut moved = 0;

    for idx in 0..block.num_ops() {
        let op = &block.ops()[idx];
        if claimed.contains(&idx) || !is_data_parallel_reduce_op(op) {
            continue;
        }
        let renamed = op.input_arg_names().next().is_some_and(|name| {
            block
                .var(name)
                .map(VarDesc::is_renamed_alias)
                .unwrap_or_else(|| name.contains(autopar::program::RENAME_MARKER))
        });
        if renamed {
            log::trace!("Keeping {} on a renamed gradient in the backward region", op.op_type());
            continue;
        }

        let mut copy = op.structural_copy();
        copy.set_role(OpRole::OPTIMIZE);
        optimize_ops.insert(moved, copy);
        moved += 1;
        claimed.insert(idx);

        if is_sum_reduce(op) {
            let paired = (idx + 1..block.num_ops())
                .find(|j| !claimed.contains(j) && is_data_parallel_scale_op(&block.ops()[*j]));
            if let Some(j) = paired {
                let mut scale = block.ops()[j].structural_copy();
                scale.set_role(OpRole::OPTIMIZE);
                optimize_ops.insert(moved, scale);
                moved += 1;
                claimed.insert(j);
            }
        }
    }

    for idx in claimed.iter().rev() {
        block.remove_op(*idx)?;
    }
    log::debug!("Moved {moved} gradient synchronization ops behind the accumulation");
    Ok(())
}

fn is_master_grad_cast_op(op: &OpDesc) -> bool {
    op.op_type() == "cast"
        && (op
            .attr(MASTER_GRAD_CAST_KEY)
            .and_then(Attribute::as_bool)
            .unwrap_or(false)
            || op
                .input_arg_names()
                .next()
                .is_some_and(|name| name.contains(MASTER_GRAD_MARKER)))
}

/// Removes casts producing master-precision gradients and makes the backward producer write the
/// cast's output directly.
pub fn remove_cast_for_master_grad(main: &mut Program, dist_context: &mut DistContext) -> Result<()> {
    let block = main.global_block_mut();
    let mut rename = BTreeMap::new();

    for idx in (0..block.num_ops()).rev() {
        let op = &block.ops()[idx];
        if !is_master_grad_cast_op(op) {
            continue;
        }
        let (Some(input), Some(output)) = (
            op.input_arg_names().next().map(str::to_string),
            op.output_arg_names().next().map(str::to_string),
        ) else {
            continue;
        };
        let in_dtype = block
            .var(&input)
            .ok_or_else(|| InvariantError::VarNotFound {
                name: input.clone(),
                block: 0,
            })?
            .dtype();
        block
            .var_mut(&output)
            .ok_or_else(|| InvariantError::VarNotFound {
                name: output.clone(),
                block: 0,
            })?
            .set_dtype(in_dtype);
        let cast = block.remove_op(idx)?;
        dist_context.remove_op_dist_attr(&cast);
        if let Some(var) = block.remove_var(&input) {
            dist_context.remove_tensor_dist_attr(&var);
        }
        log::trace!("Elided master grad cast {input} -> {output}");
        rename.insert(input, output);
    }

    if rename.is_empty() {
        return Ok(());
    }

    for idx in (0..block.num_ops()).rev() {
        let op = &block.ops()[idx];
        if op.role().is_forward() {
            break;
        }
        if !op.role().is_backward() {
            continue;
        }
        let targets: Vec<(String, String)> = op
            .output_arg_names()
            .filter_map(|name| rename.get(name).map(|new| (name.to_string(), new.clone())))
            .collect();
        for (old, new) in targets {
            let op = &block.ops()[idx];
            let mut attr = dist_context
                .op_dist_attr(op)
                .cloned()
                .ok_or_else(|| GradientMergeError::MissingOpDistAttr(op.op_type().to_string()))?;
            attr.rename_output(&old, &new);
            block.rename_output(idx, &old, &new)?;
            dist_context.set_op_dist_attr(&block.ops()[idx], attr);
            rename.remove(&old);
        }
    }

    if !rename.is_empty() {
        return Err(GradientMergeError::UnresolvedRenames(rename));
    }
    Ok(())
}

/// Creates the step counter `step = (step + 1) % k`, written back in place, and the condition
/// `cond = step == 0`.
fn create_cond_var(
    main: &mut Program,
    startup: &mut Program,
    k_steps: i64,
    world_mesh: &ProcessMesh,
    dist_context: &mut DistContext,
) -> Result<String> {
    let globals = [
        (GRADIENT_MERGE_K, DType::I32, k_steps as f64),
        (GRADIENT_MERGE_ZERO, DType::I32, 0.0),
        (GRADIENT_MERGE_STEP, DType::I32, 0.0),
        (GRADIENT_MERGE_COND, DType::Bool, 0.0),
    ];
    for (name, dtype, value) in globals {
        let var = main.global_block_mut().create_var(
            VarDesc::new(name, shape![1], dtype).with_persistable(true),
        )?;
        dist_context.set_tensor_dist_attr(var, TensorDistAttr::new(world_mesh.clone(), vec![-1], 0));

        let startup_block = startup.global_block_mut();
        startup_block.create_var(VarDesc::new(name, shape![1], dtype).with_persistable(true))?;
        startup_block.append_op(
            OpDesc::new("fill_constant")
                .with_output("Out", [name])
                .with_attr("shape", vec![1i64])
                .with_attr("dtype", dtype)
                .with_attr("value", value)
                .with_attr("force_cpu", true),
        );
    }

    let ops = [
        OpDesc::new("increment")
            .with_input("X", [GRADIENT_MERGE_STEP])
            .with_output("Out", [GRADIENT_MERGE_STEP])
            .with_attr("step", 1.0),
        OpDesc::new("elementwise_mod")
            .with_input("X", [GRADIENT_MERGE_STEP])
            .with_input("Y", [GRADIENT_MERGE_K])
            .with_output("Out", [GRADIENT_MERGE_STEP])
            .with_attr("axis", -1),
        OpDesc::new("equal")
            .with_input("X", [GRADIENT_MERGE_STEP])
            .with_input("Y", [GRADIENT_MERGE_ZERO])
            .with_output("Out", [GRADIENT_MERGE_COND]),
    ];
    for op in ops {
        let op = op.with_role(OpRole::BACKWARD);
        dist_context.naive_set_op_dist_attr(&op, world_mesh, &[-1], 0);
        main.global_block_mut().append_op(op);
    }
    Ok(GRADIENT_MERGE_COND.to_string())
}

fn acc_dist_attr(main: &Program, dist_context: &DistContext, name: &str) -> Result<TensorDistAttr> {
    let var = main
        .global_block()
        .var(name)
        .ok_or_else(|| InvariantError::VarNotFound {
            name: name.to_string(),
            block: 0,
        })?;
    dist_context
        .tensor_dist_attr(var)
        .cloned()
        .ok_or_else(|| GradientMergeError::MissingVarDistAttr(name.to_string()))
}

/// Builds the block run when `cond` holds: scale the accumulators, replay the optimizer ops on
/// them and reset them to zero.
fn create_cond_block_and_update_optimizer(
    main: &mut Program,
    cond: &str,
    new_params_grads: &[ParamGrad<String>],
    grad_to_merge: &BTreeMap<String, String>,
    optimize_ops: Vec<OpDesc>,
    config: &GradientMergeConfig,
    dist_context: &mut DistContext,
) -> Result<()> {
    let accumulators: Vec<&str> = new_params_grads
        .iter()
        .filter_map(|pair| pair.grad.as_deref())
        .collect();
    let sub = main.create_block(0)?;

    if config.avg {
        for acc in &accumulators {
            let attr = acc_dist_attr(main, dist_context, acc)?;
            let scale = OpDesc::new("scale")
                .with_input("X", [*acc])
                .with_output("Out", [*acc])
                .with_attr("scale", 1.0 / config.k_steps as f64)
                .with_attr("bias", 0.0)
                .with_attr("bias_after_scale", false)
                .with_role(OpRole::OPTIMIZE);
            dist_context.naive_set_op_dist_attr(
                &scale,
                &attr.process_mesh,
                &attr.dims_mapping,
                attr.chunk_id,
            );
            main.block_mut(sub)?.append_op(scale);
        }
    }

    for op in optimize_ops {
        let mut copy = op.structural_copy();
        copy.remove_attr(OP_ROLE_VAR_KEY);
        let mut attr = dist_context
            .op_dist_attr(&copy)
            .cloned()
            .ok_or_else(|| GradientMergeError::MissingOpDistAttr(copy.op_type().to_string()))?;
        let inputs: BTreeSet<String> = copy
            .input_arg_names()
            .filter(|name| grad_to_merge.contains_key(*name))
            .map(str::to_string)
            .collect();
        let outputs: BTreeSet<String> = copy
            .output_arg_names()
            .filter(|name| grad_to_merge.contains_key(*name))
            .map(str::to_string)
            .collect();

        let block = main.block_mut(sub)?;
        block.append_op(copy);
        let idx = block.num_ops() - 1;
        for old in &inputs {
            let new = &grad_to_merge[old];
            block.rename_input(idx, old, new)?;
            attr.rename_input(old, new);
        }
        for old in &outputs {
            let new = &grad_to_merge[old];
            block.rename_output(idx, old, new)?;
            attr.rename_output(old, new);
        }
        dist_context.set_op_dist_attr(&block.ops()[idx], attr);
    }

    for acc in &accumulators {
        let attr = acc_dist_attr(main, dist_context, acc)?;
        let dtype = main
            .global_block()
            .var(acc)
            .map(VarDesc::dtype)
            .unwrap_or_default();
        let reset = OpDesc::new("set_value")
            .with_input("Input", [*acc])
            .with_output("Out", [*acc])
            .with_attr("values", vec![0.0f64])
            .with_attr("dtype", dtype)
            .with_attr("shape", vec![1i64])
            .with_attr("axes", Vec::<i64>::new())
            .with_attr("starts", Vec::<i64>::new())
            .with_attr("ends", Vec::<i64>::new())
            .with_attr("steps", Vec::<i64>::new())
            .with_role(OpRole::OPTIMIZE);
        dist_context.naive_set_op_dist_attr(
            &reset,
            &attr.process_mesh,
            &attr.dims_mapping,
            attr.chunk_id,
        );
        main.block_mut(sub)?.append_op(reset);
    }

    // The conditional block lists the outside vars its branch reads and writes.
    let branch = main.block(sub)?;
    let mut reads = BTreeSet::new();
    let mut writes = BTreeSet::new();
    for op in branch.ops() {
        reads.extend(op.input_arg_names().filter(|n| !branch.has_var(n)).map(str::to_string));
        writes.extend(op.output_arg_names().filter(|n| !branch.has_var(n)).map(str::to_string));
    }
    let cond_op = OpDesc::new("conditional_block")
        .with_input("Cond", [cond])
        .with_input("Input", reads)
        .with_output("Out", writes)
        .with_attr(SUB_BLOCK_KEY, Attribute::Block(sub))
        .with_attr("is_scalar_condition", true)
        .with_role(OpRole::OPTIMIZE);
    let cond_attr = acc_dist_attr(main, dist_context, cond)?;
    dist_context.naive_set_op_dist_attr(
        &cond_op,
        &cond_attr.process_mesh,
        &cond_attr.dims_mapping,
        cond_attr.chunk_id,
    );
    main.global_block_mut().append_op(cond_op);
    log::debug!(
        "Built conditional block {sub} with {} ops",
        main.block(sub)?.num_ops()
    );
    Ok(())
}
