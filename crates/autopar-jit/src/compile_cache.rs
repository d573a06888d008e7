use std::cell::RefCell;
use std::hash::{Hash, Hasher as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use autopar::{flags, HashMap, Hasher};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};

use crate::{
    compile_sir, is_training, BuildOptions, CompiledFn, LowerError, ProgramCompiler,
    SymbolicTraceContext,
};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("No statement IR named {0}.")]
    UnknownSir(String),
    #[error("Compilation of {sir} (key {key:#x}) re-entered itself; reentrant builds of one key are not supported.")]
    ReentrantBuild { sir: String, key: u64 },
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Compile(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When off, every lookup compiles afresh and nothing is stored.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Empty,
    Building,
    Ready(Arc<CompiledFn>),
}

/// One cache entry. Holding the lock serializes builds of the key across threads, and the
/// `Building` state catches a build that re-enters itself on the same thread.
type Slot = ReentrantMutex<RefCell<SlotState>>;

/// Memoizes compiled statement IRs by their structure and training flag.
#[derive(Debug, Default)]
pub struct CompileSirCache {
    entries: Mutex<HashMap<u64, Arc<Slot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    config: CacheConfig,
}

static COMPILE_SIR_CACHE: Lazy<CompileSirCache> = Lazy::new(CompileSirCache::default);

/// The process-wide cache.
pub fn compile_sir_cache() -> &'static CompileSirCache {
    &COMPILE_SIR_CACHE
}

/// Hash of the canonical program text and the training flag. Collisions are not checked.
pub fn cache_key(canonical: &str, training: bool) -> u64 {
    let mut hasher = Hasher::default();
    (canonical, training).hash(&mut hasher);
    hasher.finish()
}

impl CompileSirCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn build(
        ctx: &SymbolicTraceContext,
        sir_name: &str,
        training: bool,
        options: &BuildOptions,
        compiler: &dyn ProgramCompiler,
    ) -> Result<Arc<CompiledFn>, CacheError> {
        let sir = ctx
            .get_sir(sir_name)
            .ok_or_else(|| CacheError::UnknownSir(sir_name.to_string()))?;
        let lowered = compile_sir(ctx, sir_name)?;
        let function = compiler.compile(lowered, options)?;
        Ok(Arc::new(CompiledFn::new(function, sir.clone(), training)))
    }

    /// Returns the compiled callable for `sir_name`, compiling it on a miss.
    pub fn lookup_or_build(
        &self,
        ctx: &SymbolicTraceContext,
        sir_name: &str,
        training: bool,
        options: &BuildOptions,
        compiler: &dyn ProgramCompiler,
    ) -> Result<Arc<CompiledFn>, CacheError> {
        if !self.config.enabled || !flags().enable_cache {
            return Self::build(ctx, sir_name, training, options, compiler);
        }
        let sir = ctx
            .get_sir(sir_name)
            .ok_or_else(|| CacheError::UnknownSir(sir_name.to_string()))?;
        let key = cache_key(&sir.canonical(), training);

        let slot = self.entries.lock().entry(key).or_default().clone();
        let guard = slot.lock();
        match &*guard.borrow() {
            SlotState::Ready(compiled) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                log::trace!("Cache hit for {sir_name} (key {key:#x})");
                return Ok(compiled.clone());
            }
            SlotState::Building => {
                return Err(CacheError::ReentrantBuild {
                    sir: sir_name.to_string(),
                    key,
                })
            }
            SlotState::Empty => {}
        }

        *guard.borrow_mut() = SlotState::Building;
        match Self::build(ctx, sir_name, training, options, compiler) {
            Ok(compiled) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                log::debug!("Compiled {sir_name} (key {key:#x}, training: {training})");
                *guard.borrow_mut() = SlotState::Ready(compiled.clone());
                Ok(compiled)
            }
            Err(e) => {
                log::warn!("Failed to compile {sir_name}: {e}");
                *guard.borrow_mut() = SlotState::Empty;
                Err(e)
            }
        }
    }

    /// Like [`Self::lookup_or_build`], taking the training flag from the current thread's mode.
    pub fn lookup(
        &self,
        ctx: &SymbolicTraceContext,
        sir_name: &str,
        options: &BuildOptions,
        compiler: &dyn ProgramCompiler,
    ) -> Result<Arc<CompiledFn>, CacheError> {
        self.lookup_or_build(ctx, sir_name, is_training(), options, compiler)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Number of compiled entries.
    pub fn len(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.entries.lock().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| matches!(&*slot.lock().borrow(), SlotState::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
