//! Program-to-program passes for auto-parallel training.
//!
//! A pass is created by name from the process-wide [registry](new_pass), configured through a
//! flat [`PassAttrs`] map and applied to a [`PassTarget`] together with a shared
//! [`PassContext`]. [`PassManager`] applies a sequence of passes and verifies the rewritten
//! programs after each one.

mod attrs;
pub mod gradient_merge;
mod manager;
mod pass_base;
mod registry;

pub use attrs::*;
pub use gradient_merge::{GradientMergeConfig, GradientMergeError, GradientMergePass};
pub use manager::*;
pub use pass_base::*;
pub use registry::*;
