//! Trace-compile cache for symbolic statement IR.
//!
//! A [`SymbolicTraceContext`] records one [`StatementIr`] per traced function. The
//! [`CompileSirCache`] lowers a trace to a [`Program`](autopar::Program), hands it to a
//! [`ProgramCompiler`] and memoizes the resulting [`CompiledFn`] by the trace's canonical form and
//! the training flag.

mod amp;
mod compile_cache;
mod compiled_fn;
mod compiler;
mod context;
mod graph_log;
mod lower;
mod sir;
mod training;

pub use amp::*;
pub use compile_cache::*;
pub use compiled_fn::*;
pub use compiler::*;
pub use context::*;
pub use graph_log::*;
pub use lower::*;
pub use sir::*;
pub use training::*;
