use autopar::{
    interp::{HostTensor, Interpreter, Scope},
    shape, DType, DistContext, NamescopeGuard, OpDesc, OpRole, ProcessMesh, Program,
    TensorDistAttr, VarDesc, VarKind, DATA_PARALLEL_SCOPE,
};
use autopar_passes::{
    gradient_merge::{GRADIENT_MERGE_PASS, MASTER_GRAD_CAST_KEY, MERGE_SUFFIX},
    GradientMergeError, ParamGrad, PassAttrs, PassContext, PassError, PassManager, PassTarget,
};
use test_strategy::{proptest, Arbitrary};

const INIT: f32 = 10.0;

fn mesh() -> ProcessMesh {
    ProcessMesh::from_ranks(&[0])
}

/// Parameters `w{i}` whose gradient is the constant `i + 1`, each updated by sgd with lr 1.
struct Model {
    main: Program,
    startup: Program,
    ctx: PassContext,
    params: Vec<String>,
}

fn persistable(block: &mut autopar::Block, name: &str) {
    block
        .create_var(VarDesc::new(name, shape![1], DType::F32).with_persistable(true))
        .unwrap();
}

fn fill(name: &str, value: f64) -> OpDesc {
    OpDesc::new("fill_constant")
        .with_output("Out", [name])
        .with_attr("shape", vec![1i64])
        .with_attr("dtype", DType::F32)
        .with_attr("value", value)
}

fn model(num_params: usize) -> Model {
    let (mut main, mut startup) = (Program::new(), Program::new());
    let mut ctx = PassContext::new(DistContext::new(), vec![0]);
    let params: Vec<String> = (0..num_params).map(|i| format!("w{i}")).collect();

    for block in [main.global_block_mut(), startup.global_block_mut()] {
        persistable(block, "lr");
        for p in &params {
            persistable(block, p);
        }
    }
    startup.global_block_mut().append_op(fill("lr", 1.0));
    for p in &params {
        startup.global_block_mut().append_op(fill(p, INIT as f64));
    }

    let block = main.global_block_mut();
    block
        .create_var(VarDesc::new("x", shape![1], DType::F32))
        .unwrap();
    block.append_op(fill("x", 1.0));
    for (i, p) in params.iter().enumerate() {
        let grad = format!("{p}@GRAD");
        block
            .create_var(VarDesc::new(grad.as_str(), shape![1], DType::F32))
            .unwrap();
        block.append_op(fill(&grad, (i + 1) as f64).with_role(OpRole::BACKWARD));
    }
    for p in &params {
        let grad = format!("{p}@GRAD");
        let sgd = OpDesc::new("sgd")
            .with_input("Param", [p.as_str()])
            .with_input("Grad", [grad.as_str()])
            .with_input("LearningRate", ["lr"])
            .with_output("ParamOut", [p.as_str()])
            .with_attr("op_role_var", vec![p.clone(), grad.clone()])
            .with_role(OpRole::OPTIMIZE);
        ctx.dist_context.naive_set_op_dist_attr(&sgd, &mesh(), &[-1], 0);
        block.append_op(sgd);
        let var = block.var(p).unwrap();
        ctx.dist_context
            .set_tensor_dist_attr(var, TensorDistAttr::new(mesh(), vec![-1], 0));
    }

    Model {
        main,
        startup,
        ctx,
        params,
    }
}

fn pairs(params: &[String]) -> Vec<ParamGrad<String>> {
    params
        .iter()
        .map(|p| ParamGrad::new(p.clone(), Some(format!("{p}@GRAD"))))
        .collect()
}

fn apply(model: &mut Model, attrs: PassAttrs) -> Result<Vec<&'static str>, PassError> {
    let manager = PassManager::from_names([(GRADIENT_MERGE_PASS, attrs)])?.with_verification(true);
    let mut target = PassTarget::Imperative {
        main: &mut model.main,
        startup: &mut model.startup,
    };
    manager.apply(&mut target, &mut model.ctx)
}

fn value(scope: &Scope, name: &str) -> f32 {
    scope.get(name).and_then(HostTensor::item).unwrap()
}

fn run(model: &Model, steps: usize) -> Scope {
    let mut scope = Scope::new();
    Interpreter::new(&model.startup).run(&mut scope).unwrap();
    let interp = Interpreter::new(&model.main);
    for _ in 0..steps {
        interp.run(&mut scope).unwrap();
    }
    scope
}

#[test]
fn optimizer_sees_averaged_gradient_every_k_steps() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut model = model(2);
    let attrs = PassAttrs::new()
        .with("k_steps", 4)
        .with("avg", true)
        .with("params_grads", pairs(&model.params));
    assert_eq!(apply(&mut model, attrs).unwrap(), [GRADIENT_MERGE_PASS]);

    let merged = format!("w1{MERGE_SUFFIX}");
    assert_eq!(model.ctx.grad_to_global_grad["w1@GRAD"], merged);
    assert!(model.ctx.is_applied(GRADIENT_MERGE_PASS));

    let scope = run(&model, 3);
    assert_eq!(value(&scope, "w0@GRAD@MERGE"), 3.0);
    assert_eq!(value(&scope, &merged), 6.0);
    assert_eq!(value(&scope, "w0"), INIT);
    assert_eq!(value(&scope, "w1"), INIT);

    let scope = run(&model, 4);
    assert_eq!(value(&scope, "w0"), INIT - 1.0);
    assert_eq!(value(&scope, "w1"), INIT - 2.0);
    assert_eq!(value(&scope, "w0@GRAD@MERGE"), 0.0);
    assert_eq!(value(&scope, &merged), 0.0);

    let scope = run(&model, 8);
    assert_eq!(value(&scope, "w0"), INIT - 2.0);
    assert_eq!(value(&scope, "w1"), INIT - 4.0);
}

#[test]
fn optimizer_ops_move_into_the_conditional_block() {
    let mut model = model(1);
    let attrs = PassAttrs::new()
        .with("k_steps", 2)
        .with("avg", false)
        .with("params_grads", pairs(&model.params));
    apply(&mut model, attrs).unwrap();

    let global = model.main.global_block();
    assert!(global.ops().iter().all(|op| op.op_type() != "sgd"));
    let last = global.ops().last().unwrap();
    assert_eq!(last.op_type(), "conditional_block");
    assert!(last.role().is_optimize());
    assert_eq!(last.input("Cond").unwrap(), ["gradient_merge_cond"]);

    let sub = model.main.block(1).unwrap();
    let types: Vec<_> = sub.ops().iter().map(|op| op.op_type()).collect();
    assert_eq!(types, ["sgd", "set_value"]);
    let sgd = &sub.ops()[0];
    assert_eq!(sgd.input("Grad").unwrap(), ["w0@GRAD@MERGE"]);
    assert!(!sgd.has_attr("op_role_var"));
    let attr = model.ctx.dist_context.op_dist_attr(sgd).unwrap();
    assert!(attr.input_dims_mapping("w0@GRAD@MERGE").is_some());
    assert!(attr.input_dims_mapping("w0@GRAD").is_none());

    let acc = global.var("w0@GRAD@MERGE").unwrap();
    assert!(acc.persistable());
    assert_eq!(
        model.ctx.dist_context.tensor_dist_attr(acc).unwrap().dims_mapping,
        vec![-1]
    );
    assert!(model.startup.global_block().has_var("w0@GRAD@MERGE"));
    assert!(model.startup.global_block().has_var("gradient_merge_step"));
}

#[test]
fn parameters_without_gradients_get_no_accumulator() {
    let mut model = model(2);
    let params_grads = vec![
        ParamGrad::new("w0".to_string(), Some("w0@GRAD".to_string())),
        ParamGrad::new("w1".to_string(), None),
    ];
    let attrs = PassAttrs::new()
        .with("k_steps", 2)
        .with("params_grads", params_grads);
    apply(&mut model, attrs).unwrap();

    let global = model.main.global_block();
    assert!(global.has_var("w0@GRAD@MERGE"));
    assert!(!global.has_var("w1@GRAD@MERGE"));
    assert_eq!(model.ctx.grad_to_global_grad.len(), 1);

    // w1's optimizer still moves behind the condition and reads its raw gradient.
    let sub = model.main.block(1).unwrap();
    let w1_sgd = sub
        .ops()
        .iter()
        .find(|op| op.input("Param") == Some(&["w1".to_string()][..]))
        .unwrap();
    assert_eq!(w1_sgd.input("Grad").unwrap(), ["w1@GRAD"]);
}

#[test]
fn data_parallel_sync_moves_behind_accumulation() {
    let mut model = model(1);
    {
        let block = model.main.global_block_mut();
        let renamed = "w0@GRAD@RENAME@0";
        block
            .create_var(VarDesc::new(renamed, shape![1], DType::F32))
            .unwrap();
        let _scope = NamescopeGuard::new(DATA_PARALLEL_SCOPE);
        let ops = [
            fill(renamed, 1.0).with_role(OpRole::BACKWARD),
            OpDesc::new("c_allreduce_sum")
                .with_input("X", [renamed])
                .with_output("Out", [renamed])
                .with_role(OpRole::BACKWARD),
            OpDesc::new("c_allreduce_sum")
                .with_input("X", ["w0@GRAD"])
                .with_output("Out", ["w0@GRAD"])
                .with_attr("nranks", 2i64)
                .with_role(OpRole::BACKWARD),
            OpDesc::new("scale")
                .with_input("X", ["w0@GRAD"])
                .with_output("Out", ["w0@GRAD"])
                .with_attr("scale", 0.5)
                .with_role(OpRole::BACKWARD),
        ];
        // Insert after the gradient producers and before the optimizer.
        let at = block.num_ops() - 1;
        for (i, op) in ops.into_iter().enumerate() {
            model
                .ctx
                .dist_context
                .naive_set_op_dist_attr(&op, &mesh(), &[-1], 0);
            block.insert_op(at + i, op).unwrap();
        }
    }

    let attrs = PassAttrs::new()
        .with("k_steps", 2)
        .with("avg", true)
        .with("gradient_sync_after_accumulate", true)
        .with("params_grads", pairs(&model.params));
    apply(&mut model, attrs).unwrap();

    let global = model.main.global_block();
    let reduces: Vec<_> = global
        .ops()
        .iter()
        .filter(|op| op.op_type() == "c_allreduce_sum")
        .collect();
    assert_eq!(reduces.len(), 1);
    assert_eq!(reduces[0].input("X").unwrap(), ["w0@GRAD@RENAME@0"]);
    assert!(global
        .ops()
        .iter()
        .all(|op| op.op_type() != "scale" || op.role().is_optimize()));

    let sub = model.main.block(1).unwrap();
    let types: Vec<_> = sub.ops().iter().map(|op| op.op_type()).collect();
    assert_eq!(types, ["scale", "c_allreduce_sum", "scale", "sgd", "set_value"]);
    assert_eq!(sub.ops()[1].input("X").unwrap(), ["w0@GRAD@MERGE"]);
    assert!(sub.ops()[1].role().is_optimize());

    // Sum over two ranks then halve: the update is unchanged.
    let scope = run(&model, 2);
    assert_eq!(value(&scope, "w0"), INIT - 1.0);
}

#[test]
fn gradient_claimed_twice_is_unresolved() {
    let mut model = model(2);
    let params_grads = vec![
        ParamGrad::new("w0".to_string(), Some("w0@GRAD".to_string())),
        ParamGrad::new("w1".to_string(), Some("w0@GRAD".to_string())),
    ];
    let attrs = PassAttrs::new()
        .with("k_steps", 2)
        .with("params_grads", params_grads);
    let err = apply(&mut model, attrs).unwrap_err();
    assert!(matches!(
        err,
        PassError::GradientMerge(GradientMergeError::UnresolvedGradients(ref grads)) if grads == &["w0@GRAD"]
    ));
    assert!(err.to_string().contains("pairs not fully resolved"));
    assert!(!model.ctx.is_applied(GRADIENT_MERGE_PASS));
}

#[test]
fn k_steps_of_one_updates_every_step() {
    let mut model = model(1);
    let attrs = PassAttrs::new()
        .with("k_steps", 1)
        .with("params_grads", pairs(&model.params));
    apply(&mut model, attrs).unwrap();
    let scope = run(&model, 3);
    assert_eq!(value(&scope, "w0"), INIT - 3.0);
    assert_eq!(value(&scope, "w0@GRAD@MERGE"), 0.0);
}

#[test]
fn step_counter_wraps_in_place() {
    let mut model = model(1);
    let attrs = PassAttrs::new()
        .with("k_steps", 3)
        .with("params_grads", pairs(&model.params));
    apply(&mut model, attrs).unwrap();

    let global = model.main.global_block();
    let counter: Vec<_> = global
        .ops()
        .iter()
        .filter(|op| op.input_arg_names().any(|name| name == "gradient_merge_step"))
        .collect();
    let types: Vec<_> = counter.iter().map(|op| op.op_type()).collect();
    assert_eq!(types, ["increment", "elementwise_mod", "equal"]);
    assert_eq!(counter[1].output("Out").unwrap(), ["gradient_merge_step"]);
    assert_eq!(counter[2].output("Out").unwrap(), ["gradient_merge_cond"]);

    let scope = run(&model, 2);
    assert_eq!(value(&scope, "gradient_merge_step"), 2.0);
    assert_eq!(value(&scope, "gradient_merge_cond"), 0.0);
    let scope = run(&model, 4);
    assert_eq!(value(&scope, "gradient_merge_step"), 1.0);
    let scope = run(&model, 3);
    assert_eq!(value(&scope, "gradient_merge_step"), 0.0);
    assert_eq!(value(&scope, "gradient_merge_cond"), 1.0);
}

#[test]
fn missing_k_steps_skips_the_pass() {
    let mut model = model(1);
    let attrs = PassAttrs::new().with("params_grads", pairs(&model.params));
    assert!(apply(&mut model, attrs).unwrap().is_empty());
    assert_eq!(model.main.num_blocks(), 1);
}

const LOW_PRECISION_GRAD: &str = "w0@GRAD@fp16";

/// Routes w0's gradient through a master-precision cast. With `produced`, the backward fill
/// writes the low-precision gradient; otherwise nothing does.
fn with_master_grad_cast(model: &mut Model, produced: bool) {
    let block = model.main.global_block_mut();
    block
        .create_var(VarDesc::new(LOW_PRECISION_GRAD, shape![1], DType::F16))
        .unwrap();
    let producer = block
        .ops()
        .iter()
        .position(|op| op.output("Out") == Some(&["w0@GRAD".to_string()][..]))
        .unwrap();
    block.remove_op(producer).unwrap();

    let cast = OpDesc::new("cast")
        .with_input("X", [LOW_PRECISION_GRAD])
        .with_output("Out", ["w0@GRAD"])
        .with_attr("in_dtype", DType::F16)
        .with_attr("out_dtype", DType::F32)
        .with_attr(MASTER_GRAD_CAST_KEY, true)
        .with_role(OpRole::BACKWARD);
    model
        .ctx
        .dist_context
        .naive_set_op_dist_attr(&cast, &mesh(), &[-1], 0);
    block.insert_op(producer, cast).unwrap();
    if produced {
        let fill = fill(LOW_PRECISION_GRAD, 1.0).with_role(OpRole::BACKWARD);
        model
            .ctx
            .dist_context
            .naive_set_op_dist_attr(&fill, &mesh(), &[-1], 0);
        block.insert_op(producer, fill).unwrap();
    }
}

#[test]
fn master_grad_cast_is_elided() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut model = model(1);
    with_master_grad_cast(&mut model, true);
    let attrs = PassAttrs::new()
        .with("k_steps", 2)
        .with("avg", false)
        .with("params_grads", pairs(&model.params));
    apply(&mut model, attrs).unwrap();

    let global = model.main.global_block();
    assert!(global.ops().iter().all(|op| op.op_type() != "cast"));
    assert!(!global.has_var(LOW_PRECISION_GRAD));
    let producer = global
        .ops()
        .iter()
        .find(|op| op.op_type() == "fill_constant" && op.role().is_backward())
        .unwrap();
    assert_eq!(producer.output("Out").unwrap(), ["w0@GRAD"]);
    assert_eq!(global.var("w0@GRAD").unwrap().dtype(), DType::F16);
    let attr = model.ctx.dist_context.op_dist_attr(producer).unwrap();
    assert!(attr.output_dims_mapping("w0@GRAD").is_some());

    let scope = run(&model, 1);
    assert_eq!(value(&scope, "w0"), INIT);
    assert_eq!(value(&scope, "w0@GRAD@MERGE"), 1.0);
    let scope = run(&model, 2);
    assert_eq!(value(&scope, "w0"), INIT - 2.0);
    assert_eq!(value(&scope, "w0@GRAD@MERGE"), 0.0);
}

#[test]
fn master_grad_cast_without_backward_producer_is_unresolved() {
    let mut model = model(1);
    with_master_grad_cast(&mut model, false);
    let attrs = PassAttrs::new()
        .with("k_steps", 2)
        .with("params_grads", pairs(&model.params));
    let err = apply(&mut model, attrs).unwrap_err();
    assert!(matches!(
        err,
        PassError::GradientMerge(GradientMergeError::UnresolvedRenames(ref renames))
            if renames.get(LOW_PRECISION_GRAD).map(String::as_str) == Some("w0@GRAD")
    ));
    assert!(!model.ctx.is_applied(GRADIENT_MERGE_PASS));
}

#[test]
fn selected_rows_parameter_is_rejected() {
    let mut model = model(2);
    {
        let block = model.main.global_block_mut();
        block.remove_var("w1").unwrap();
        block
            .create_var(
                VarDesc::new("w1", shape![1], DType::F32)
                    .with_persistable(true)
                    .with_kind(VarKind::SelectedRows),
            )
            .unwrap();
    }
    let attrs = PassAttrs::new()
        .with("k_steps", 2)
        .with("params_grads", pairs(&model.params));
    let err = apply(&mut model, attrs).unwrap_err();
    assert!(matches!(
        err,
        PassError::GradientMerge(GradientMergeError::SelectedRowsParam(ref name)) if name == "w1"
    ));
    assert!(err.to_string().contains("selected rows"));
    assert!(!model.main.global_block().has_var("w0@GRAD@MERGE"));
    assert!(!model.ctx.is_applied(GRADIENT_MERGE_PASS));
}

#[derive(Arbitrary, Debug)]
struct MergeProblem {
    #[strategy(1..=5i64)]
    k_steps: i64,
    #[strategy(1..=12usize)]
    steps: usize,
    #[strategy(1..=3usize)]
    num_params: usize,
    avg: bool,
}

fn run_merge_trial(prob: MergeProblem) -> anyhow::Result<()> {
    let MergeProblem {
        k_steps,
        steps,
        num_params,
        avg,
    } = prob;
    let mut model = model(num_params);
    let attrs = PassAttrs::new()
        .with("k_steps", k_steps)
        .with("avg", avg)
        .with("params_grads", pairs(&model.params));
    apply(&mut model, attrs)?;
    let scope = run(&model, steps);

    let k = k_steps as usize;
    let updates = (steps / k) as f32;
    let pending = (steps % k) as f32;
    for (i, p) in model.params.iter().enumerate() {
        let grad = (i + 1) as f32;
        let per_update = if avg { grad } else { grad * k as f32 };
        anyhow::ensure!(value(&scope, p) == INIT - updates * per_update, "{p} after {steps} steps");
        anyhow::ensure!(
            value(&scope, &format!("{p}{MERGE_SUFFIX}")) == pending * grad,
            "accumulator of {p} after {steps} steps"
        );
    }
    Ok(())
}

#[proptest(cases = 16)]
fn test_gradient_merge(prob: MergeProblem) {
    run_merge_trial(prob).unwrap();
}
