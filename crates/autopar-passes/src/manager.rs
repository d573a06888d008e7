use std::sync::Arc;

use autopar::flags;

use crate::{apply_pass, new_pass, Pass, PassAttrs, PassContext, PassError, PassTarget};

/// Applies an ordered list of passes.
#[derive(Debug, Default)]
pub struct PassManager {
    passes: Vec<Arc<dyn Pass>>,
    verify: bool,
}

impl PassManager {
    pub fn new(passes: Vec<Arc<dyn Pass>>) -> Self {
        Self {
            passes,
            verify: flags().verify_passes,
        }
    }

    /// Builds a manager from registered pass names and their attributes.
    pub fn from_names<'a>(
        specs: impl IntoIterator<Item = (&'a str, PassAttrs)>,
    ) -> Result<Self, PassError> {
        let passes = specs
            .into_iter()
            .map(|(name, attrs)| new_pass(name, attrs))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(passes))
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn passes(&self) -> &[Arc<dyn Pass>] {
        &self.passes
    }

    /// Applies every pass in order and returns the names of the ones that ran.
    pub fn apply(
        &self,
        target: &mut PassTarget<'_>,
        ctx: &mut PassContext,
    ) -> Result<Vec<&'static str>, PassError> {
        let mut applied = Vec::new();
        for pass in &self.passes {
            if !apply_pass(pass.clone(), target, ctx)? {
                continue;
            }
            if self.verify {
                log::debug!("Verifying programs after {}", pass.name());
                target.verify(ctx)?;
            }
            applied.push(pass.name());
        }
        Ok(applied)
    }
}
