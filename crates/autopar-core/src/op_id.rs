use std::sync::atomic;

macro_rules! unique_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl $name {
            pub(crate) fn new() -> Self {
                // https://users.rust-lang.org/t/idiomatic-rust-way-to-generate-unique-id/33805
                static COUNTER: atomic::AtomicUsize = atomic::AtomicUsize::new(1);
                Self(COUNTER.fetch_add(1, atomic::Ordering::Relaxed))
            }

            pub fn raw(&self) -> usize {
                self.0
            }
        }
    };
}

unique_id!(
    /// Unique identifier of an op description.
    ///
    /// A structural copy of an op receives a fresh id; the id it was copied from is kept as
    /// its original id.
    OpId,
    "Op"
);

unique_id!(
    /// Unique identifier of a var description. Two vars with the same name in different
    /// programs (e.g. main and startup) have different ids.
    VarId,
    "Var"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = OpId::new();
        let b = OpId::new();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(format!("{a:?}"), format!("Op{}", a.raw()));
    }
}
