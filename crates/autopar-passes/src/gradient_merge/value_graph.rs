//! Gradient merge on value-graph programs.
//!
//! Accumulators are block arguments updated in place after each gradient producer. Optimizer
//! consumers are rewired to read the accumulators, and the accumulators are reset at the end of
//! every step.

use autopar::{
    pir::{InsertionPoint, OperationId, PirProgram, ValueId, ValueType},
    shape, Attribute, DType, HashSet, InvariantError, OpRole, VarKind,
};

use super::{merge_var_name, GradientMergeConfig, GradientMergeError, MASTER_GRAD_CAST_KEY};
use crate::ParamGrad;

/// Attribute set on the in-place accumulation op.
pub const GRAD_MERGE_ADD_KEY: &str = "grad_merge_add";

/// Users that must stay in the backward stage, and everything feeding them with it.
const PINNED_OPS: [&str; 2] = ["pd_op.send_v2", "pd_op.send"];

type Result<T> = std::result::Result<T, GradientMergeError>;

/// Rewrites `main` and `startup` for gradient merge and returns the (param, accumulator) pairs.
pub fn parse_program(
    main: &mut PirProgram,
    startup: &mut PirProgram,
    params_grads: &[ParamGrad<ValueId>],
    config: &GradientMergeConfig,
) -> Result<Vec<(ValueId, ValueId)>> {
    let new_params_grads = append_gradient_merge_backward_ops(main, startup, params_grads)?;

    if !config.gradient_sync_after_accumulate {
        // Reductions already run in the backward stage.
        log::debug!("Gradient sync stays before accumulation");
    }

    if config.avg {
        append_scale_ops(main, &new_params_grads, config.k_steps)?;
    }
    Ok(new_params_grads)
}

fn set_attrs(
    program: &mut PirProgram,
    op: OperationId,
    attrs: impl IntoIterator<Item = (&'static str, Attribute)>,
) -> std::result::Result<(), InvariantError> {
    let op = program.op_mut(op)?;
    for (key, value) in attrs {
        op.set_attr(key, value);
    }
    Ok(())
}

fn set_role(program: &mut PirProgram, op: OperationId, role: OpRole) -> Result<()> {
    program.op_mut(op)?.set_role(role);
    Ok(())
}

/// Appends `full(shape, value)` at `at` and returns the op and its result.
fn insert_full(
    program: &mut PirProgram,
    at: InsertionPoint,
    ty: ValueType,
    value: f64,
) -> Result<(OperationId, ValueId)> {
    let attrs = [
        ("shape", Attribute::from(ty.shape.to_vec())),
        ("value", Attribute::from(value)),
        ("dtype", Attribute::from(ty.dtype)),
    ];
    let full = program.insert_op(at, "pd_op.full", &[], vec![ty])?;
    set_attrs(program, full, attrs)?;
    let result = program
        .op(full)?
        .result(0)
        .ok_or_else(|| InvariantError::ValueNotFound("result of pd_op.full".to_string()))?;
    Ok((full, result))
}

/// Type of the gradient as the optimizer sees it: a master-precision cast, if any, decides it.
fn accumulator_type(main: &PirProgram, grad: ValueId) -> Result<ValueType> {
    let mut ty = main.value(grad)?.ty().clone();
    for user in main.all_used_ops(grad) {
        let op = main.op(user)?;
        if !op.has_attr(MASTER_GRAD_CAST_KEY) {
            continue;
        }
        if let Some(result) = op.result(0) {
            ty = main.value(result)?.ty().clone();
        }
    }
    Ok(ty)
}

pub fn append_gradient_merge_backward_ops(
    main: &mut PirProgram,
    startup: &mut PirProgram,
    params_grads: &[ParamGrad<ValueId>],
) -> Result<Vec<(ValueId, ValueId)>> {
    let mut new_params_grads = Vec::new();

    for pair in params_grads {
        let Some(grad) = pair.grad else {
            continue;
        };
        let param = main.value(pair.param)?;
        let param_name = param
            .name()
            .map(str::to_string)
            .ok_or_else(|| GradientMergeError::UnnamedParam(format!("{:?}", pair.param)))?;
        if param.ty().kind == VarKind::SelectedRows {
            return Err(GradientMergeError::SelectedRowsParam(param_name));
        }
        let merge = merge_var_name(&param_name);
        let ty = accumulator_type(main, grad)?;

        let (_, init) = insert_full(startup, InsertionPoint::BlockEnd, ty.clone(), 0.0)?;
        startup.value_mut(init)?.set_persistable(true);
        let persist = startup.append_op("pd_op.set_persistable_value", &[init], vec![])?;
        set_attrs(startup, persist, [("name", Attribute::from(merge.as_str()))])?;

        let grad_def = main
            .defining_op(grad)
            .ok_or_else(|| GradientMergeError::GradWithoutProducer(format!("{grad:?}")))?;
        let acc = main.add_kwarg(&merge, ty.clone())?;
        main.value_mut(acc)?.set_persistable(true);

        // In-place accumulation must read the accumulator first.
        let add = main.insert_op(InsertionPoint::After(grad_def), "pd_op.add_", &[acc, grad], vec![ty.clone()])?;
        let (role, dist_attr) = {
            let def = main.op(grad_def)?;
            (def.role(), def.dist_attr().cloned())
        };
        let add_op = main.op_mut(add)?;
        add_op.set_role(role);
        add_op.set_dist_attr(dist_attr);
        add_op.set_attr(GRAD_MERGE_ADD_KEY, true);
        log::debug!("Accumulating {grad:?} into {merge}");

        for user in main.all_used_ops(grad) {
            move_used_grad_op(main, user, grad)?;
        }

        let optimizer_users: HashSet<OperationId> = main
            .all_used_ops(grad)
            .into_iter()
            .filter(|op| main.op(*op).is_ok_and(|op| op.role().is_optimize()))
            .collect();
        main.replace_uses_in(grad, acc, &optimizer_users)?;

        let zero_ty = ValueType::dense(shape![1], ty.dtype);
        let (_, zero) = insert_full(main, InsertionPoint::BlockEnd, zero_ty, 0.0)?;
        let reset = main.append_op("pd_op.set_value_with_tensor_", &[acc, zero], vec![ty])?;
        let empty = || Attribute::Ints(Vec::new());
        set_attrs(
            main,
            reset,
            [
                ("starts", empty()),
                ("ends", empty()),
                ("steps", empty()),
                ("axes", empty()),
                ("decrease_axes", empty()),
                ("none_axes", empty()),
            ],
        )?;
        set_role(main, reset, OpRole::OPTIMIZE)?;
        let inputs: Vec<ValueId> = main.op(reset)?.operands()[1..].to_vec();
        for input in inputs {
            if let Some(def) = main.defining_op(input) {
                set_role(main, def, OpRole::OPTIMIZE)?;
            }
        }

        new_params_grads.push((pair.param, acc));
    }
    Ok(new_params_grads)
}

/// Retags a consumer of `grad`, and the consumers downstream of it, as optimizer ops so they run
/// on the accumulated gradient. Only chains of single-operand ops (and slices of the gradient)
/// are retagged. If any op in the chain does not qualify, nothing is.
pub fn move_used_grad_op(main: &mut PirProgram, used_grad_op: OperationId, grad: ValueId) -> Result<()> {
    let mut movable: Vec<OperationId> = Vec::new();
    let mut stack = vec![used_grad_op];

    while let Some(id) = stack.pop() {
        if movable.contains(&id) {
            continue;
        }
        let op = main.op(id)?;
        if PINNED_OPS.contains(&op.name()) {
            log::trace!("{} pins {grad:?} to the backward stage", op.name());
            return Ok(());
        }
        if op.num_operands() == 1 {
            movable.push(id);
        } else if op.name() == "pd_op.slice" {
            movable.push(id);
            movable.extend(
                op.operands()
                    .iter()
                    .filter(|operand| **operand != grad)
                    .filter_map(|operand| main.defining_op(*operand)),
            );
        } else {
            return Ok(());
        }
        for result in op.results() {
            for next in main.all_used_ops(*result) {
                if !main.op(next)?.role().is_optimize() {
                    stack.push(next);
                }
            }
        }
    }

    for id in movable {
        set_role(main, id, OpRole::OPTIMIZE)?;
    }
    Ok(())
}

/// Adam and sgd ops, fused and merged variants included, are matched by name fragment.
fn is_trivial_optimizer(name: &str) -> bool {
    name.contains("adam") || name.contains("sgd")
}

/// Optimizer ops in program order.
pub fn find_trivial_optimizer_ops(main: &PirProgram) -> Result<Vec<OperationId>> {
    let mut found = Vec::new();
    for id in main.ops() {
        if is_trivial_optimizer(main.op(id)?.name()) {
            found.push(id);
        }
    }
    Ok(found)
}

/// Operand of the optimizer op carrying the gradient.
fn grad_operand(name: &str) -> Result<usize> {
    if name.contains("adam") {
        Ok(1)
    } else if name.contains("sgd") {
        Ok(2)
    } else {
        Err(GradientMergeError::UnsupportedOptimizer(name.to_string()))
    }
}

/// Inserts `full(scale)` and `scale_(target, full)` at `at` and returns the scale op.
fn insert_scale(
    main: &mut PirProgram,
    at: InsertionPoint,
    target: ValueId,
    scale: f64,
) -> Result<(OperationId, ValueId)> {
    let target_ty = main.value(target)?.ty().clone();
    let (full, factor) = insert_full(main, at, ValueType::dense(shape![1], DType::F32), scale)?;
    set_role(main, full, OpRole::OPTIMIZE)?;
    let scale_op = main.insert_op(
        InsertionPoint::After(full),
        "pd_op.scale_",
        &[target, factor],
        vec![target_ty],
    )?;
    set_attrs(
        main,
        scale_op,
        [
            ("bias", Attribute::from(0.0)),
            ("bias_after_scale", Attribute::from(false)),
        ],
    )?;
    set_role(main, scale_op, OpRole::OPTIMIZE)?;
    let scaled = main
        .op(scale_op)?
        .result(0)
        .ok_or_else(|| InvariantError::ValueNotFound("result of pd_op.scale_".to_string()))?;
    Ok((scale_op, scaled))
}

/// Scales the merged gradients by `1 / k_steps`, right before each optimizer op reads them when
/// there are optimizer ops, otherwise right after the backward stage.
pub fn append_scale_ops(
    main: &mut PirProgram,
    new_params_grads: &[(ValueId, ValueId)],
    k_steps: i64,
) -> Result<()> {
    let scale = 1.0 / k_steps as f64;
    let optimizer_ops = find_trivial_optimizer_ops(main)?;

    if optimizer_ops.is_empty() {
        let last_backward = main
            .ops()
            .rev()
            .find(|id| main.op(*id).is_ok_and(|op| op.role() == OpRole::BACKWARD));
        let mut at = last_backward.map_or(InsertionPoint::BlockStart, InsertionPoint::After);
        for (_, acc) in new_params_grads {
            let (scale_op, _) = insert_scale(main, at, *acc, scale)?;
            at = InsertionPoint::After(scale_op);
        }
        return Ok(());
    }

    for opt in optimizer_ops {
        let index = grad_operand(main.op(opt)?.name())?;
        let target = main.op(opt)?.operand(index).ok_or_else(|| InvariantError::OperandOutOfRange {
            op: format!("{opt:?}"),
            index,
            len: main.op(opt).map_or(0, |op| op.num_operands()),
        })?;
        let at = match main.defining_op(target).or_else(|| main.prev_op(opt)) {
            Some(op) => InsertionPoint::After(op),
            None => InsertionPoint::BlockStart,
        };
        let (_, scaled) = insert_scale(main, at, target, scale)?;
        main.set_operand(opt, index, scaled)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(dtype: DType) -> ValueType {
        ValueType::dense(shape![4], dtype)
    }

    struct Net {
        main: PirProgram,
        w: ValueId,
        w_grad: ValueId,
        reduce: OperationId,
        opt: OperationId,
    }

    fn result(main: &PirProgram, op: OperationId) -> ValueId {
        main.op(op).unwrap().result(0).unwrap()
    }

    /// matmul, its grad, a reduction of the grad and one optimizer op.
    fn net(optimizer: &str, reduce: &str) -> Net {
        let mut main = PirProgram::new();
        let x = main.add_kwarg("x", dense(DType::F32)).unwrap();
        let w = main.add_kwarg("w", dense(DType::F32)).unwrap();
        let lr = main.add_kwarg("lr", ValueType::dense(shape![1], DType::F32)).unwrap();
        let mm = main.append_op("pd_op.matmul", &[x, w], vec![dense(DType::F32)]).unwrap();
        let y = result(&main, mm);
        let grad = main
            .append_op("pd_op.matmul_grad", &[x, y], vec![dense(DType::F32)])
            .unwrap();
        main.op_mut(grad).unwrap().set_role(OpRole::BACKWARD);
        let w_grad = result(&main, grad);
        let reduce = main.append_op(reduce, &[w_grad], vec![dense(DType::F32)]).unwrap();
        main.op_mut(reduce).unwrap().set_role(OpRole::BACKWARD);
        let synced = result(&main, reduce);
        let opt = main
            .append_op(optimizer, &[w, lr, synced], vec![dense(DType::F32)])
            .unwrap();
        main.op_mut(opt).unwrap().set_role(OpRole::OPTIMIZE);
        Net {
            main,
            w,
            w_grad,
            reduce,
            opt,
        }
    }

    fn config(avg: bool) -> GradientMergeConfig {
        GradientMergeConfig {
            k_steps: 4,
            avg,
            gradient_sync_after_accumulate: false,
        }
    }

    #[test]
    fn reduction_moves_to_optimizer_and_reads_accumulator() {
        let _ = env_logger::builder().is_test(true).try_init();
        let Net {
            mut main,
            w,
            w_grad,
            reduce,
            opt,
        } = net("pd_op.sgd_", "pd_op.c_allreduce_sum_");
        let mut startup = PirProgram::new();
        let pairs = [ParamGrad::new(w, Some(w_grad))];

        let merged = parse_program(&mut main, &mut startup, &pairs, &config(true)).unwrap();
        let acc = main.kwarg("w@GRAD@MERGE").unwrap();
        assert_eq!(merged, vec![(w, acc)]);
        assert!(main.value(acc).unwrap().persistable());

        let reduce_op = main.op(reduce).unwrap();
        assert!(reduce_op.role().is_optimize());
        assert_eq!(reduce_op.operand(0), Some(acc));

        let add = main.all_used_ops(w_grad);
        assert_eq!(add.len(), 1);
        let add = main.op(add[0]).unwrap();
        assert_eq!(add.name(), "pd_op.add_");
        assert_eq!(add.operands(), &[acc, w_grad]);
        assert_eq!(add.role(), OpRole::BACKWARD);
        assert_eq!(add.attr(GRAD_MERGE_ADD_KEY), Some(&Attribute::Bool(true)));

        let scaled = main.op(opt).unwrap().operand(2).unwrap();
        let scale_op = main.op(main.defining_op(scaled).unwrap()).unwrap();
        assert_eq!(scale_op.name(), "pd_op.scale_");
        assert!(scale_op.role().is_optimize());
        assert_eq!(scale_op.operand(0), Some(result(&main, reduce)));

        let last = main.ops().last().unwrap();
        let reset = main.op(last).unwrap();
        assert_eq!(reset.name(), "pd_op.set_value_with_tensor_");
        assert_eq!(reset.operand(0), Some(acc));
        assert!(reset.role().is_optimize());
        let zero = main.defining_op(reset.operand(1).unwrap()).unwrap();
        assert!(main.op(zero).unwrap().role().is_optimize());

        let names: Vec<_> = startup
            .ops()
            .map(|id| startup.op(id).unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["pd_op.full", "pd_op.set_persistable_value"]);

        main.verify().unwrap();
        startup.verify().unwrap();
    }

    #[test]
    fn pinned_consumer_stays_in_backward() {
        let Net {
            mut main,
            w,
            w_grad,
            reduce,
            ..
        } = net("pd_op.sgd_", "pd_op.send_v2");
        let mut startup = PirProgram::new();
        parse_program(
            &mut main,
            &mut startup,
            &[ParamGrad::new(w, Some(w_grad))],
            &config(false),
        )
        .unwrap();
        let send = main.op(reduce).unwrap();
        assert_eq!(send.role(), OpRole::BACKWARD);
        assert_eq!(send.operand(0), Some(w_grad));
    }

    #[test]
    fn unrecognized_optimizer_falls_back_to_bulk_scaling() {
        let Net {
            mut main,
            w,
            w_grad,
            reduce,
            opt,
        } = net("pd_op.momentum_", "pd_op.c_allreduce_sum_");
        let mut startup = PirProgram::new();
        parse_program(
            &mut main,
            &mut startup,
            &[ParamGrad::new(w, Some(w_grad))],
            &config(true),
        )
        .unwrap();
        let acc = main.kwarg("w@GRAD@MERGE").unwrap();
        assert_eq!(main.op(opt).unwrap().operand(2), Some(result(&main, reduce)));
        let scales: Vec<_> = main
            .ops()
            .filter(|id| main.op(*id).unwrap().name() == "pd_op.scale_")
            .collect();
        assert_eq!(scales.len(), 1);
        assert_eq!(main.op(scales[0]).unwrap().operand(0), Some(acc));
        main.verify().unwrap();
    }

    #[test]
    fn merged_adam_is_scaled_in_place() {
        let mut main = PirProgram::new();
        let x = main.add_kwarg("x", dense(DType::F32)).unwrap();
        let w = main.add_kwarg("w", dense(DType::F32)).unwrap();
        let lr = main.add_kwarg("lr", ValueType::dense(shape![1], DType::F32)).unwrap();
        let grad = main.append_op("pd_op.matmul_grad", &[x, w], vec![dense(DType::F32)]).unwrap();
        main.op_mut(grad).unwrap().set_role(OpRole::BACKWARD);
        let w_grad = result(&main, grad);
        let opt = main
            .append_op("pd_op.merged_adam_", &[w, w_grad, lr], vec![dense(DType::F32)])
            .unwrap();
        main.op_mut(opt).unwrap().set_role(OpRole::OPTIMIZE);
        let mut startup = PirProgram::new();

        parse_program(
            &mut main,
            &mut startup,
            &[ParamGrad::new(w, Some(w_grad))],
            &config(true),
        )
        .unwrap();
        let acc = main.kwarg("w@GRAD@MERGE").unwrap();
        let operand = main.op(opt).unwrap().operand(1).unwrap();
        assert_ne!(operand, acc);
        let scale_op = main.op(main.defining_op(operand).unwrap()).unwrap();
        assert_eq!(scale_op.name(), "pd_op.scale_");
        assert_eq!(scale_op.operand(0), Some(acc));
        let names: Vec<_> = main
            .ops()
            .map(|id| main.op(id).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names[..5],
            [
                "pd_op.matmul_grad",
                "pd_op.add_",
                "pd_op.full",
                "pd_op.scale_",
                "pd_op.merged_adam_",
            ]
        );
        main.verify().unwrap();
    }

    #[test]
    fn slice_pulls_in_its_index_producer() {
        let mut main = PirProgram::new();
        let x = main.add_kwarg("x", dense(DType::F32)).unwrap();
        let w = main.add_kwarg("w", dense(DType::F32)).unwrap();
        let lr = main.add_kwarg("lr", ValueType::dense(shape![1], DType::F32)).unwrap();
        let grad = main.append_op("pd_op.matmul_grad", &[x, w], vec![dense(DType::F32)]).unwrap();
        main.op_mut(grad).unwrap().set_role(OpRole::BACKWARD);
        let w_grad = result(&main, grad);
        let index = main
            .append_op("pd_op.full_int_array", &[], vec![ValueType::dense(shape![1], DType::I64)])
            .unwrap();
        main.op_mut(index).unwrap().set_role(OpRole::BACKWARD);
        let index_value = result(&main, index);
        let slice = main
            .append_op("pd_op.slice", &[w_grad, index_value], vec![dense(DType::F32)])
            .unwrap();
        main.op_mut(slice).unwrap().set_role(OpRole::BACKWARD);
        let sliced = result(&main, slice);
        let opt = main.append_op("pd_op.sgd_", &[w, lr, sliced], vec![dense(DType::F32)]).unwrap();
        main.op_mut(opt).unwrap().set_role(OpRole::OPTIMIZE);
        let mut startup = PirProgram::new();

        parse_program(
            &mut main,
            &mut startup,
            &[ParamGrad::new(w, Some(w_grad))],
            &config(false),
        )
        .unwrap();
        let acc = main.kwarg("w@GRAD@MERGE").unwrap();
        assert!(main.op(slice).unwrap().role().is_optimize());
        assert!(main.op(index).unwrap().role().is_optimize());
        assert_eq!(main.op(slice).unwrap().operand(0), Some(acc));
        assert_eq!(main.op(grad).unwrap().role(), OpRole::BACKWARD);
        main.verify().unwrap();
    }

    #[test]
    fn two_operand_op_keeps_chain_in_backward() {
        let mut main = PirProgram::new();
        let x = main.add_kwarg("x", dense(DType::F32)).unwrap();
        let w = main.add_kwarg("w", dense(DType::F32)).unwrap();
        let other = main.add_kwarg("other", dense(DType::F32)).unwrap();
        let lr = main.add_kwarg("lr", ValueType::dense(shape![1], DType::F32)).unwrap();
        let grad = main.append_op("pd_op.matmul_grad", &[x, w], vec![dense(DType::F32)]).unwrap();
        main.op_mut(grad).unwrap().set_role(OpRole::BACKWARD);
        let w_grad = result(&main, grad);
        let scale = main.append_op("pd_op.scale", &[w_grad], vec![dense(DType::F32)]).unwrap();
        main.op_mut(scale).unwrap().set_role(OpRole::BACKWARD);
        let scaled = result(&main, scale);
        let multiply = main
            .append_op("pd_op.multiply", &[scaled, other], vec![dense(DType::F32)])
            .unwrap();
        main.op_mut(multiply).unwrap().set_role(OpRole::BACKWARD);
        let product = result(&main, multiply);
        let opt = main.append_op("pd_op.sgd_", &[w, lr, product], vec![dense(DType::F32)]).unwrap();
        main.op_mut(opt).unwrap().set_role(OpRole::OPTIMIZE);
        let mut startup = PirProgram::new();

        parse_program(
            &mut main,
            &mut startup,
            &[ParamGrad::new(w, Some(w_grad))],
            &config(false),
        )
        .unwrap();
        assert_eq!(main.op(scale).unwrap().role(), OpRole::BACKWARD);
        assert_eq!(main.op(multiply).unwrap().role(), OpRole::BACKWARD);
        assert_eq!(main.op(scale).unwrap().operand(0), Some(w_grad));
        main.verify().unwrap();
    }

    #[test]
    fn without_optimizer_ops_scaling_follows_backward() {
        let mut main = PirProgram::new();
        let x = main.add_kwarg("x", dense(DType::F32)).unwrap();
        let w = main.add_kwarg("w", dense(DType::F32)).unwrap();
        let grad = main.append_op("pd_op.matmul_grad", &[x, w], vec![dense(DType::F32)]).unwrap();
        main.op_mut(grad).unwrap().set_role(OpRole::BACKWARD);
        let w_grad = result(&main, grad);
        let mut startup = PirProgram::new();

        parse_program(
            &mut main,
            &mut startup,
            &[ParamGrad::new(w, Some(w_grad))],
            &config(true),
        )
        .unwrap();
        let names: Vec<_> = main
            .ops()
            .map(|id| main.op(id).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            [
                "pd_op.matmul_grad",
                "pd_op.add_",
                "pd_op.full",
                "pd_op.scale_",
                "pd_op.full",
                "pd_op.set_value_with_tensor_",
            ]
        );
        main.verify().unwrap();
    }

    #[test]
    fn master_grad_cast_decides_accumulator_dtype() {
        let mut main = PirProgram::new();
        let x = main.add_kwarg("x", dense(DType::F16)).unwrap();
        let w = main.add_kwarg("w", dense(DType::F16)).unwrap();
        let grad = main.append_op("pd_op.matmul_grad", &[x, w], vec![dense(DType::F16)]).unwrap();
        main.op_mut(grad).unwrap().set_role(OpRole::BACKWARD);
        let w_grad = result(&main, grad);
        let cast = main.append_op("pd_op.cast", &[w_grad], vec![dense(DType::F32)]).unwrap();
        main.op_mut(cast).unwrap().set_attr(MASTER_GRAD_CAST_KEY, true);
        let mut startup = PirProgram::new();

        parse_program(
            &mut main,
            &mut startup,
            &[ParamGrad::new(w, Some(w_grad)), ParamGrad::new(x, None)],
            &config(false),
        )
        .unwrap();
        let acc = main.kwarg("w@GRAD@MERGE").unwrap();
        assert_eq!(main.value(acc).unwrap().ty().dtype, DType::F32);
        assert!(main.kwarg("x@GRAD@MERGE").is_none());
    }

    #[test]
    fn optimizers_by_name_fragment() {
        assert!(is_trivial_optimizer("pd_op.adamw_"));
        assert!(is_trivial_optimizer("pd_op.fused_adam_"));
        assert!(is_trivial_optimizer("pd_op.sgd_"));
        assert!(!is_trivial_optimizer("pd_op.momentum_"));
        assert!(!is_trivial_optimizer("pd_op.matmul"));
        assert_eq!(grad_operand("pd_op.merged_adam_").unwrap(), 1);
        assert_eq!(grad_operand("pd_op.sgd_").unwrap(), 2);
        assert!(matches!(
            grad_operand("pd_op.lamb_"),
            Err(GradientMergeError::UnsupportedOptimizer(name)) if name == "pd_op.lamb_"
        ));
    }
}
