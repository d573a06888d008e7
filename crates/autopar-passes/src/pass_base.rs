use std::collections::BTreeMap;
use std::sync::Arc;

use autopar::{pir::PirProgram, DistContext, InvariantError, Program};
use derive_new::new;

use crate::{GradientMergeError, PassAttrs};

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("Pass {0} is not registered.")]
    UnknownPass(String),
    #[error("Pass {pass} requires attribute {key}.")]
    MissingAttr { pass: &'static str, key: String },
    #[error("Attribute {key} of pass {pass} must be {expected}, got {actual}.")]
    AttrType {
        pass: &'static str,
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Pass {pass} cannot rewrite {target} programs.")]
    UnsupportedTarget {
        pass: &'static str,
        target: &'static str,
    },
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    #[error(transparent)]
    GradientMerge(#[from] GradientMergeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassType {
    Unknown,
    CommOpt,
    CalcOpt,
    ParallelOpt,
    FusionOpt,
}

/// The pair of programs a pass rewrites: the main program and the startup program run once
/// before training.
pub enum PassTarget<'a> {
    Imperative {
        main: &'a mut Program,
        startup: &'a mut Program,
    },
    ValueGraph {
        main: &'a mut PirProgram,
        startup: &'a mut PirProgram,
    },
}

impl PassTarget<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            PassTarget::Imperative { .. } => "imperative",
            PassTarget::ValueGraph { .. } => "value-graph",
        }
    }

    /// Structural verification of both programs.
    pub fn verify(&self, ctx: &PassContext) -> Result<(), InvariantError> {
        match self {
            PassTarget::Imperative { main, startup } => {
                main.verify()?;
                startup.verify()?;
                ctx.dist_context.verify(main)
            }
            PassTarget::ValueGraph { main, startup } => {
                main.verify()?;
                startup.verify()
            }
        }
    }
}

/// State shared by the passes applied to one pair of programs.
#[derive(new, Debug)]
pub struct PassContext {
    pub dist_context: DistContext,
    /// Ranks of the world process group.
    pub world_ranks: Vec<i64>,
    /// Gradient var renames performed by applied passes.
    #[new(default)]
    pub grad_to_global_grad: BTreeMap<String, String>,
    #[new(default)]
    applied: Vec<Arc<dyn Pass>>,
}

impl PassContext {
    pub fn applied_passes(&self) -> &[Arc<dyn Pass>] {
        &self.applied
    }

    pub fn is_applied(&self, name: &str) -> bool {
        self.applied.iter().any(|p| p.name() == name)
    }
}

/// A named program transformation.
pub trait Pass: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn pass_type(&self) -> PassType {
        PassType::Unknown
    }

    fn attrs(&self) -> &PassAttrs;

    /// Whether the pass is applicable with its current attributes.
    fn check_self(&self) -> bool {
        true
    }

    /// Whether this pass must not run together with `other`.
    fn conflicts_with(&self, _other: &dyn Pass) -> bool {
        false
    }

    fn apply_impl(&self, target: &mut PassTarget<'_>, ctx: &mut PassContext)
        -> Result<(), PassError>;
}

/// Applies `pass` unless it is not applicable, already applied, or conflicts with an applied
/// pass. Returns whether the pass ran. A failing pass leaves the programs as it left them.
pub fn apply_pass(
    pass: Arc<dyn Pass>,
    target: &mut PassTarget<'_>,
    ctx: &mut PassContext,
) -> Result<bool, PassError> {
    if !pass.check_self() {
        log::info!("Skipping pass {}: not applicable", pass.name());
        return Ok(false);
    }
    if ctx.is_applied(pass.name()) {
        log::info!("Skipping pass {}: already applied", pass.name());
        return Ok(false);
    }
    if let Some(other) = ctx
        .applied
        .iter()
        .find(|other| pass.conflicts_with(other.as_ref()) || other.conflicts_with(pass.as_ref()))
    {
        log::info!(
            "Skipping pass {}: conflicts with {}",
            pass.name(),
            other.name()
        );
        return Ok(false);
    }
    log::info!("Applying pass {} to {} program", pass.name(), target.kind());
    pass.apply_impl(target, ctx)?;
    ctx.applied.push(pass);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Tagging {
        name: &'static str,
        attrs: PassAttrs,
        exclusive_with: Option<&'static str>,
    }

    impl Pass for Tagging {
        fn name(&self) -> &'static str {
            self.name
        }

        fn attrs(&self) -> &PassAttrs {
            &self.attrs
        }

        fn check_self(&self) -> bool {
            self.attrs.get_bool(self.name, "enabled").ok().flatten().unwrap_or(true)
        }

        fn conflicts_with(&self, other: &dyn Pass) -> bool {
            self.exclusive_with == Some(other.name())
        }

        fn apply_impl(
            &self,
            target: &mut PassTarget<'_>,
            _ctx: &mut PassContext,
        ) -> Result<(), PassError> {
            if let PassTarget::Imperative { main, .. } = target {
                let n = main.global_block().num_ops();
                main.global_block_mut()
                    .append_op(autopar::OpDesc::new(format!("tag_{n}")));
            }
            Ok(())
        }
    }

    fn tagging(name: &'static str, exclusive_with: Option<&'static str>) -> Arc<dyn Pass> {
        Arc::new(Tagging {
            name,
            attrs: PassAttrs::new(),
            exclusive_with,
        })
    }

    #[test]
    fn applied_once_and_conflicts_skip() {
        let (mut main, mut startup) = (Program::new(), Program::new());
        let mut target = PassTarget::Imperative {
            main: &mut main,
            startup: &mut startup,
        };
        let mut ctx = PassContext::new(DistContext::new(), vec![0]);

        assert!(apply_pass(tagging("a", None), &mut target, &mut ctx).unwrap());
        assert!(!apply_pass(tagging("a", None), &mut target, &mut ctx).unwrap());
        assert!(!apply_pass(tagging("b", Some("a")), &mut target, &mut ctx).unwrap());
        assert!(apply_pass(tagging("c", None), &mut target, &mut ctx).unwrap());
        assert_eq!(ctx.applied_passes().len(), 2);
        assert_eq!(main.global_block().num_ops(), 2);
    }

    #[test]
    fn inapplicable_pass_is_skipped() {
        let (mut main, mut startup) = (Program::new(), Program::new());
        let mut target = PassTarget::Imperative {
            main: &mut main,
            startup: &mut startup,
        };
        let mut ctx = PassContext::new(DistContext::new(), vec![0]);
        let pass = Arc::new(Tagging {
            name: "off",
            attrs: PassAttrs::new().with("enabled", false),
            exclusive_with: None,
        });
        assert!(!apply_pass(pass, &mut target, &mut ctx).unwrap());
        assert!(!ctx.is_applied("off"));
    }
}
