use std::sync::Arc;

use autopar::HashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::{Pass, PassAttrs, PassError};

pub type PassFactory = fn(PassAttrs) -> Arc<dyn Pass>;

/// Static registration of a built-in pass.
pub struct PassRegistration {
    pub name: &'static str,
    pub factory: PassFactory,
}

inventory::collect!(PassRegistration);

/// Pass factories by name, seeded from every [`PassRegistration`] submission.
static PASSES: Lazy<RwLock<HashMap<&'static str, PassFactory>>> = Lazy::new(|| {
    let mut map = HashMap::default();
    for reg in inventory::iter::<PassRegistration> {
        log::debug!("Registering pass {}", reg.name);
        map.insert(reg.name, reg.factory);
    }
    RwLock::new(map)
});

/// Registers a pass at runtime. Returns false if the name is taken.
pub fn register_pass(name: &'static str, factory: PassFactory) -> bool {
    let mut passes = PASSES.write();
    if passes.contains_key(name) {
        log::warn!("Pass {name} is already registered");
        return false;
    }
    passes.insert(name, factory);
    true
}

/// Creates the pass registered as `name`, configured with `attrs`.
pub fn new_pass(name: &str, attrs: PassAttrs) -> Result<Arc<dyn Pass>, PassError> {
    let factory = PASSES
        .read()
        .get(name)
        .copied()
        .ok_or_else(|| PassError::UnknownPass(name.to_string()))?;
    Ok(factory(attrs))
}

pub fn registered_passes() -> Vec<&'static str> {
    let mut names: Vec<_> = PASSES.read().keys().copied().collect();
    names.sort_unstable();
    names
}
