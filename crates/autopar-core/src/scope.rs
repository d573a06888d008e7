use std::cell::RefCell;

/// Attribute under which an op records the namescope it was created in.
pub const OP_NAMESCOPE_KEY: &str = "op_namescope";

/// Namescope segment of ops inserted by auto-parallel passes.
pub const AUTO_PARALLEL_SCOPE: &str = "auto_parallel";

/// Namescope segment under which data-parallel communication ops are created.
pub const DATA_PARALLEL_SCOPE: &str = "auto_parallel/data_parallel";

#[derive(Debug)]
struct ScopeEntry {
    name: String,
}

// The namescope context holds a stack of segments, innermost last.
#[derive(Debug, Default)]
struct NamescopeContext {
    scopes: Vec<ScopeEntry>,
}

thread_local! {
    static NAMESCOPE_CONTEXT: RefCell<NamescopeContext> = RefCell::new(NamescopeContext::default());
}

/// Returns the current namescope as `/outer/inner`, or `/` when no scope is active.
pub fn current_namescope() -> String {
    NAMESCOPE_CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        let joined = ctx
            .scopes
            .iter()
            .map(|entry| entry.name.as_str())
            .collect::<Vec<_>>()
            .join("/");
        format!("/{joined}")
    })
}

fn push_namescope(name: &str) {
    NAMESCOPE_CONTEXT.with(|cell| {
        cell.borrow_mut().scopes.push(ScopeEntry {
            name: name.trim_matches('/').to_string(),
        });
    });
}

/// Panics if there are no scopes to pop.
fn pop_namescope() {
    NAMESCOPE_CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if ctx.scopes.pop().is_none() {
            panic!("Attempted to pop namescope from an empty stack");
        }
    });
}

/// Resets the namescope context. Panics if a scope is still open.
pub fn reset_namescope_context() {
    NAMESCOPE_CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        if !ctx.scopes.is_empty() {
            panic!(
                "Expecting namescope to be empty but it is '{}'",
                ctx.scopes
                    .iter()
                    .map(|e| e.name.as_str())
                    .collect::<Vec<_>>()
                    .join("/")
            );
        }
    });
}

/// A RAII-style guard that pushes a namescope on creation and pops it when dropped.
pub struct NamescopeGuard;

impl NamescopeGuard {
    pub fn new(name: &str) -> Self {
        push_namescope(name);
        NamescopeGuard
    }
}

impl Drop for NamescopeGuard {
    fn drop(&mut self) {
        pop_namescope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_namescopes() {
        assert_eq!(current_namescope(), "/");
        {
            let _outer = NamescopeGuard::new(AUTO_PARALLEL_SCOPE);
            let _inner = NamescopeGuard::new("gradient_merge");
            assert_eq!(current_namescope(), "/auto_parallel/gradient_merge");
        }
        assert_eq!(current_namescope(), "/");
        reset_namescope_context();
    }

    #[test]
    fn data_parallel_scope_is_a_path() {
        let _guard = NamescopeGuard::new(DATA_PARALLEL_SCOPE);
        assert_eq!(current_namescope(), "/auto_parallel/data_parallel");
    }
}
