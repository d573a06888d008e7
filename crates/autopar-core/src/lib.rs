//! # autopar
//!
//! Graph model shared by the auto-parallel compilation passes.
//!
//! ## Modules
//!
//! - [`program`]: imperative programs. Blocks hold an explicit op list with named edges, kept
//!   consistent through a per-block usage index.
//! - [`pir`]: value-graph programs. Ops produce typed values and uses are found by walking
//!   the consumers of a value.
//! - [`DistContext`]: side table of distributed attributes for imperative vars and ops.
//! - [`spmd`]: sharding propagation rules and distributed-operator containers.
//! - [`interp`]: a host interpreter for imperative programs, used to simulate training steps.

mod attribute;
mod dist_attr;
mod dist_context;
mod dtype;
mod enforcer;
mod flags;
pub mod interp;
mod op_id;
pub mod pir;
pub mod program;
mod role;
mod scope;
mod shape;
pub mod spmd;

pub use attribute::*;
pub use dist_attr::*;
pub use dist_context::*;
pub use dtype::*;
pub use enforcer::*;
pub use flags::*;
pub use op_id::*;
pub use program::{Block, BlockId, OpDesc, Program, VarDesc, VarKind, VarRelation};
pub use role::*;
pub use scope::*;
pub use shape::*;

use std::hash::BuildHasherDefault;

pub type Hasher = rustc_hash::FxHasher;
pub type HashMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<Hasher>>;
pub type HashSet<K> = std::collections::HashSet<K, BuildHasherDefault<Hasher>>;

pub use smallvec;

pub type RVec<T> = smallvec::SmallVec<[T; 4]>;

#[macro_export]
macro_rules! rvec {
    ($($x:tt)*) => {
        $crate::smallvec::smallvec![$($x)*]
    };
}
