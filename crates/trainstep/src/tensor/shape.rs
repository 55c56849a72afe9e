//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

use smallvec::SmallVec;

/// Stores the logical dimensions of a tensor. Rank 0 denotes a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    pub fn new<D: IntoIterator<Item = usize>>(dims: D) -> Self {
        Shape {
            dims: dims.into_iter().collect(),
        }
    }

    /// Shape of a 0-dimensional (scalar) tensor.
    pub fn scalar() -> Self {
        Shape {
            dims: SmallVec::new(),
        }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    /// A scalar holds exactly one element.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns a copy with `dim` scaled by `factor`.
    pub fn with_dim_scaled(&self, dim: usize, factor: usize) -> Shape {
        let mut dims = self.dims.clone();
        dims[dim] *= factor;
        Shape { dims }
    }

    /// Returns a copy with `dim` divided by `parts`. Callers must have
    /// validated divisibility.
    pub fn with_dim_divided(&self, dim: usize, parts: usize) -> Shape {
        let mut dims = self.dims.clone();
        dims[dim] /= parts;
        Shape { dims }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::Shape;

    #[test]
    fn scalar_shape_holds_one_element() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.num_elements(), 1);
    }

    #[test]
    fn zero_extent_shape_holds_no_elements() {
        let s = Shape::new([0]);
        assert_eq!(s.rank(), 1);
        assert_eq!(s.num_elements(), 0);
    }

    #[test]
    fn dim_scaling_round_trips() {
        let s = Shape::new([8, 3]);
        assert_eq!(s.with_dim_divided(0, 4).with_dim_scaled(0, 4), s);
    }
}
