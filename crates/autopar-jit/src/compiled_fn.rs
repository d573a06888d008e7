use std::sync::Arc;

use autopar::interp::HostTensor;
use once_cell::sync::OnceCell;

use crate::{
    amp_cast_inputs, graph_logger, ConcreteProgram, InputSpec, StaticFunction, StatementIr,
};

/// A compiled statement IR. The concrete program is materialized on the first call and reused
/// afterwards.
#[derive(Debug)]
pub struct CompiledFn {
    function: Arc<dyn StaticFunction>,
    sir: StatementIr,
    training: bool,
    concrete: OnceCell<ConcreteProgram>,
}

impl CompiledFn {
    pub fn new(function: Arc<dyn StaticFunction>, sir: StatementIr, training: bool) -> Self {
        Self {
            function,
            sir,
            training,
            concrete: OnceCell::new(),
        }
    }

    pub fn sir(&self) -> &StatementIr {
        &self.sir
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn function(&self) -> &Arc<dyn StaticFunction> {
        &self.function
    }

    fn materialize(&self, specs: impl FnOnce() -> Vec<InputSpec>) -> anyhow::Result<&ConcreteProgram> {
        self.concrete.get_or_try_init(|| {
            log::debug!(
                "Materializing {} (training: {})",
                self.sir.name,
                self.training
            );
            self.function.concrete_program(&amp_cast_inputs(specs()))
        })
    }

    /// The materialized program, if a call or [`Self::graph_size`] produced one.
    pub fn concrete_program(&self) -> Option<&ConcreteProgram> {
        self.concrete.get()
    }

    /// Specs derived from the recorded input metas. Dynamic dimensions become `1`.
    fn recorded_specs(&self) -> Vec<InputSpec> {
        self.sir
            .inputs
            .iter()
            .filter_map(|symbol| self.sir.meta(symbol))
            .map(|meta| {
                InputSpec::new(
                    meta.shape.dims().iter().map(|d| (*d).max(1)).collect(),
                    meta.dtype,
                )
            })
            .collect()
    }

    pub fn call(&self, args: &[HostTensor]) -> anyhow::Result<Vec<HostTensor>> {
        let concrete = self.materialize(|| args.iter().map(InputSpec::of).collect())?;
        let outputs = concrete.run(args)?;
        graph_logger().add_subgraph(&concrete.main_program);
        Ok(outputs)
    }

    /// Op count of the materialized program, or `-1` when it has more than one block.
    pub fn graph_size(&self) -> anyhow::Result<i64> {
        let program = &self.materialize(|| self.recorded_specs())?.main_program;
        if program.num_blocks() > 1 {
            return Ok(-1);
        }
        Ok(program.global_block().num_ops() as i64)
    }
}
