use crate::RVec;
use serde::{Deserialize, Serialize};

/// Shape of a var or value. A dimension of `-1` is dynamic.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(RVec<i64>);

impl Shape {
    pub fn new(dims: RVec<i64>) -> Self {
        Self(dims)
    }

    pub fn scalar() -> Self {
        Self(crate::rvec![1])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    pub fn is_dynamic(&self) -> bool {
        self.0.iter().any(|d| *d < 0)
    }

    /// Number of elements, or `None` if any dimension is dynamic.
    pub fn numel(&self) -> Option<usize> {
        self.0
            .iter()
            .try_fold(1usize, |acc, d| usize::try_from(*d).ok().map(|d| acc * d))
    }

    pub fn to_vec(&self) -> Vec<i64> {
        self.0.to_vec()
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = i64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl From<&[i64]> for Shape {
    fn from(dims: &[i64]) -> Self {
        Self(dims.iter().copied().collect())
    }
}

impl From<Vec<i64>> for Shape {
    fn from(dims: Vec<i64>) -> Self {
        Self(dims.into_iter().collect())
    }
}

impl<const N: usize> From<[i64; N]> for Shape {
    fn from(dims: [i64; N]) -> Self {
        Self(dims.into_iter().collect())
    }
}

#[macro_export]
macro_rules! shape {
    ($($x:expr),*$(,)*) => {
        $crate::Shape::new($crate::rvec![$($x as i64),*])
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn numel_of_static_and_dynamic_shapes() {
        assert_eq!(shape![2, 3, 4].numel(), Some(24));
        assert_eq!(shape![-1, 3].numel(), None);
        assert!(shape![-1, 3].is_dynamic());
        assert_eq!(format!("{:?}", shape![2, 3]), "[2, 3]");
    }
}
