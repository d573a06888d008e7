//! Gradient merge: accumulate the gradients of `k_steps` micro-steps into persistent buffers and
//! run the optimizer on every `k_steps`-th step only.
//!
//! Both program representations are supported. For imperative programs the optimizer ops are
//! moved into a conditional block gated by a step counter (see [`imperative`]). For value-graph
//! programs the optimizer ops read the accumulators directly and the accumulators are reset at
//! the end of the step (see [`value_graph`]).

pub mod imperative;
pub mod value_graph;

use std::collections::BTreeMap;
use std::sync::Arc;

use autopar::InvariantError;

use crate::{Pass, PassAttrs, PassContext, PassError, PassRegistration, PassTarget, PassType};

pub const GRADIENT_MERGE_PASS: &str = "auto_parallel_gradient_merge_pass";

/// Suffix of the persistent accumulator of a parameter's gradient.
pub const MERGE_SUFFIX: &str = "@GRAD@MERGE";

/// Namescope of the accumulation ops.
pub const GRADIENT_MERGE_SCOPE: &str = "auto_parallel/gradient_merge";

/// Attribute marking a cast that produces the master-precision copy of a gradient.
pub const MASTER_GRAD_CAST_KEY: &str = "master_grad_cast";

/// Name of the accumulator of `param`.
pub fn merge_var_name(param: &str) -> String {
    format!("{param}{MERGE_SUFFIX}")
}

#[derive(Debug, thiserror::Error)]
pub enum GradientMergeError {
    #[error("Parameter {0} is stored as selected rows, which gradient merge does not support.")]
    SelectedRowsParam(String),
    #[error("Parameter {0} has no distributed attribute.")]
    MissingParamDistAttr(String),
    #[error("Op {0} has no distributed attribute.")]
    MissingOpDistAttr(String),
    #[error("Var {0} has no distributed attribute.")]
    MissingVarDistAttr(String),
    #[error("(param, grad) pairs not fully resolved: no backward op produces {0:?}.")]
    UnresolvedGradients(Vec<String>),
    #[error("Rename map must be empty, but it is: {0:?}.")]
    UnresolvedRenames(BTreeMap<String, String>),
    #[error("Gradient {0} has no defining op.")]
    GradWithoutProducer(String),
    #[error("Parameter value {0} has no name.")]
    UnnamedParam(String),
    #[error("Only adamw, adam and sgd are supported, but got {0}.")]
    UnsupportedOptimizer(String),
    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

/// Typed view of the pass attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientMergeConfig {
    pub k_steps: i64,
    pub avg: bool,
    pub gradient_sync_after_accumulate: bool,
}

impl Default for GradientMergeConfig {
    fn default() -> Self {
        Self {
            k_steps: -1,
            avg: true,
            gradient_sync_after_accumulate: false,
        }
    }
}

impl GradientMergeConfig {
    pub fn from_attrs(attrs: &PassAttrs) -> Result<Self, PassError> {
        let defaults = Self::default();
        let pass = GRADIENT_MERGE_PASS;
        Ok(Self {
            k_steps: attrs.get_int(pass, "k_steps")?.unwrap_or(defaults.k_steps),
            avg: attrs.get_bool(pass, "avg")?.unwrap_or(defaults.avg),
            gradient_sync_after_accumulate: attrs
                .get_bool(pass, "gradient_sync_after_accumulate")?
                .unwrap_or(defaults.gradient_sync_after_accumulate),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GradientMergePass {
    attrs: PassAttrs,
}

impl GradientMergePass {
    pub fn new(mut attrs: PassAttrs) -> Self {
        let defaults = GradientMergeConfig::default();
        attrs.set_default("k_steps", defaults.k_steps);
        attrs.set_default("avg", defaults.avg);
        Self { attrs }
    }

    pub fn config(&self) -> Result<GradientMergeConfig, PassError> {
        GradientMergeConfig::from_attrs(&self.attrs)
    }
}

impl Pass for GradientMergePass {
    fn name(&self) -> &'static str {
        GRADIENT_MERGE_PASS
    }

    fn pass_type(&self) -> PassType {
        PassType::CommOpt
    }

    fn attrs(&self) -> &PassAttrs {
        &self.attrs
    }

    fn check_self(&self) -> bool {
        matches!(self.config(), Ok(config) if config.k_steps >= 1)
    }

    fn apply_impl(&self, target: &mut PassTarget<'_>, ctx: &mut PassContext) -> Result<(), PassError> {
        let config = self.config()?;
        log::debug!("{GRADIENT_MERGE_PASS}: {config:?}");
        match target {
            PassTarget::Imperative { main, startup } => {
                let params_grads = self.attrs.get_params_grads(GRADIENT_MERGE_PASS, "params_grads")?;
                let grad_to_merge = imperative::parse_program(main, startup, params_grads, &config, ctx)?;
                ctx.grad_to_global_grad.extend(grad_to_merge);
            }
            PassTarget::ValueGraph { main, startup } => {
                let params_grads =
                    self.attrs.get_value_params_grads(GRADIENT_MERGE_PASS, "params_grads")?;
                value_graph::parse_program(main, startup, params_grads, &config)?;
            }
        }
        Ok(())
    }
}

fn create_gradient_merge_pass(attrs: PassAttrs) -> Arc<dyn Pass> {
    Arc::new(GradientMergePass::new(attrs))
}

inventory::submit! {
    PassRegistration {
        name: GRADIENT_MERGE_PASS,
        factory: create_gradient_merge_pass,
    }
}
