use once_cell::sync::Lazy;

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(s) => !s.is_empty() && s != "0",
        Err(_) => default,
    }
}

/// Process-wide switches read once from the environment.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    /// `AUTOPAR_VERIFY_PASSES`: verify program structure after every applied pass.
    pub verify_passes: bool,
    /// `AUTOPAR_ENABLE_CACHE`: memoize compiled traces.
    pub enable_cache: bool,
}

static FLAGS: Lazy<Flags> = Lazy::new(|| {
    let flags = Flags {
        verify_passes: env_flag("AUTOPAR_VERIFY_PASSES", true),
        enable_cache: env_flag("AUTOPAR_ENABLE_CACHE", true),
    };
    log::debug!("Flags: {flags:?}");
    flags
});

pub fn flags() -> &'static Flags {
    &FLAGS
}
