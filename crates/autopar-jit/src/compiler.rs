use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Context};
use autopar::{
    interp::{HostTensor, Interpreter, Scope},
    DType, Program,
};
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::LoweredProgram;

/// Options forwarded to the host compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Backend name, e.g. `"interp"`. `None` selects the compiler's default.
    pub backend: Option<String>,
    /// Named build-strategy switches.
    pub build_strategy: BTreeMap<String, bool>,
}

/// Shape and dtype of an actual argument. The compiled function is specialized on these.
#[derive(new, Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputSpec {
    pub shape: Vec<i64>,
    pub dtype: DType,
}

impl InputSpec {
    pub fn of(tensor: &HostTensor) -> Self {
        Self::new(
            tensor.shape().iter().map(|d| *d as i64).collect(),
            DType::F32,
        )
    }
}

/// A program specialized for one set of input specs.
#[derive(new, Debug, Clone)]
pub struct ConcreteProgram {
    pub main_program: Program,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub input_specs: Vec<InputSpec>,
}

impl ConcreteProgram {
    /// Runs the program on host tensors with the reference interpreter.
    pub fn run(&self, args: &[HostTensor]) -> anyhow::Result<Vec<HostTensor>> {
        ensure!(
            args.len() == self.inputs.len(),
            "expected {} arguments, got {}",
            self.inputs.len(),
            args.len()
        );
        let mut scope = Scope::new();
        for (name, arg) in self.inputs.iter().zip(args) {
            scope.set(name, arg.clone());
        }
        Interpreter::new(&self.main_program).run(&mut scope)?;
        self.outputs
            .iter()
            .map(|name| {
                scope
                    .get(name)
                    .cloned()
                    .with_context(|| format!("output {name} was never written"))
            })
            .collect()
    }
}

/// A compiled function that can produce specialized programs.
pub trait StaticFunction: Send + Sync + Debug {
    fn concrete_program(&self, specs: &[InputSpec]) -> anyhow::Result<ConcreteProgram>;
}

/// The host's ahead-of-time compiler.
pub trait ProgramCompiler: Send + Sync + Debug {
    fn compile(
        &self,
        lowered: LoweredProgram,
        options: &BuildOptions,
    ) -> anyhow::Result<Arc<dyn StaticFunction>>;
}

/// Compiles to the reference interpreter.
#[derive(Debug, Default)]
pub struct InterpretingCompiler;

pub const INTERP_BACKEND: &str = "interp";

impl ProgramCompiler for InterpretingCompiler {
    fn compile(
        &self,
        lowered: LoweredProgram,
        options: &BuildOptions,
    ) -> anyhow::Result<Arc<dyn StaticFunction>> {
        if let Some(backend) = &options.backend {
            if backend != INTERP_BACKEND {
                bail!("unknown backend {backend}");
            }
        }
        Ok(Arc::new(InterpretedFunction::new(lowered)))
    }
}

#[derive(Debug)]
pub struct InterpretedFunction {
    lowered: LoweredProgram,
    specializations: AtomicUsize,
}

impl InterpretedFunction {
    pub fn new(lowered: LoweredProgram) -> Self {
        Self {
            lowered,
            specializations: AtomicUsize::new(0),
        }
    }

    /// Number of concrete programs produced so far.
    pub fn specializations(&self) -> usize {
        self.specializations.load(Ordering::Relaxed)
    }
}

impl StaticFunction for InterpretedFunction {
    fn concrete_program(&self, specs: &[InputSpec]) -> anyhow::Result<ConcreteProgram> {
        ensure!(
            specs.len() == self.lowered.inputs.len(),
            "expected {} input specs, got {}",
            self.lowered.inputs.len(),
            specs.len()
        );
        self.specializations.fetch_add(1, Ordering::Relaxed);
        log::debug!("Specializing program for {specs:?}");
        Ok(ConcreteProgram::new(
            self.lowered.program.clone(),
            self.lowered.inputs.clone(),
            self.lowered.outputs.clone(),
            specs.to_vec(),
        ))
    }
}
