//! Dense Gauss-Newton accumulator.
//!
//! Collects Hessian and gradient block contributions from the linearisers
//! and solves the (optionally damped) normal equations. Accumulators merge
//! associatively, which is what the parallel visual reduction relies on.

use nalgebra::{DMatrix, DVector, Dim, Matrix, Storage};
use tracing::warn;

/// Dense `H`, `b` accumulator over the absolute variable ordering.
#[derive(Debug, Clone)]
pub struct DenseAccumulator {
    h: DMatrix<f64>,
    b: DVector<f64>,
}

impl DenseAccumulator {
    pub fn new(size: usize) -> Self {
        Self {
            h: DMatrix::zeros(size, size),
            b: DVector::zeros(size),
        }
    }

    pub fn size(&self) -> usize {
        self.b.len()
    }

    /// Add a block into `H` at row `i`, column `j`.
    pub fn add_h<R: Dim, C: Dim, S: Storage<f64, R, C>>(
        &mut self,
        i: usize,
        j: usize,
        block: &Matrix<f64, R, C, S>,
    ) {
        for r in 0..block.nrows() {
            for c in 0..block.ncols() {
                self.h[(i + r, j + c)] += block[(r, c)];
            }
        }
    }

    /// Add a segment into `b` at row `i`.
    pub fn add_b<R: Dim, S: Storage<f64, R, nalgebra::U1>>(
        &mut self,
        i: usize,
        segment: &Matrix<f64, R, nalgebra::U1, S>,
    ) {
        for r in 0..segment.nrows() {
            self.b[i + r] += segment[r];
        }
    }

    pub fn h(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    pub fn h_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.h
    }

    pub fn b_mut(&mut self) -> &mut DVector<f64> {
        &mut self.b
    }

    pub fn h_diagonal(&self) -> DVector<f64> {
        self.h.diagonal()
    }

    /// Merge another accumulator of the same size (parallel-reduce join).
    pub fn join(&mut self, other: &DenseAccumulator) {
        assert_eq!(self.size(), other.size());
        self.h += &other.h;
        self.b += &other.b;
    }

    /// Solve `(H + diag(extra)) inc = b`. The increment is applied with a
    /// negative sign by the caller.
    pub fn solve(&self, extra_diagonal: Option<&DVector<f64>>) -> DVector<f64> {
        let mut h = self.h.clone();
        if let Some(d) = extra_diagonal {
            assert_eq!(d.len(), self.size());
            for i in 0..d.len() {
                h[(i, i)] += d[i];
            }
        }

        if let Some(chol) = h.clone().cholesky() {
            return chol.solve(&self.b);
        }
        // Indefinite after damping is rare but possible with a rank-deficient
        // window; LU still produces a usable step.
        warn!("accumulator Hessian not positive definite, falling back to LU");
        match h.lu().solve(&self.b) {
            Some(x) => x,
            None => {
                warn!("accumulator solve failed, returning zero increment");
                DVector::zeros(self.size())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix2, Vector2};

    #[test]
    fn test_block_accumulation() {
        let mut acc = DenseAccumulator::new(4);
        let block = Matrix2::new(2.0, 0.0, 0.0, 2.0);
        acc.add_h(0, 0, &block);
        acc.add_h(2, 2, &block);
        acc.add_h(0, 0, &block);
        acc.add_b(0, &Vector2::new(4.0, 4.0));
        acc.add_b(2, &Vector2::new(2.0, 2.0));

        assert_relative_eq!(acc.h()[(0, 0)], 4.0);
        assert_relative_eq!(acc.h()[(2, 2)], 2.0);

        let inc = acc.solve(None);
        assert_relative_eq!(inc[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(inc[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_join_is_additive() {
        let mut a = DenseAccumulator::new(2);
        let mut b = DenseAccumulator::new(2);
        a.add_h(0, 0, &Matrix2::identity());
        b.add_h(0, 0, &Matrix2::identity());
        b.add_b(0, &Vector2::new(1.0, -1.0));
        a.join(&b);

        assert_relative_eq!(a.h()[(1, 1)], 2.0);
        assert_relative_eq!(a.b()[1], -1.0);
    }

    #[test]
    fn test_damped_solve() {
        let mut acc = DenseAccumulator::new(2);
        acc.add_h(0, 0, &Matrix2::new(1.0, 0.0, 0.0, 1.0));
        acc.add_b(0, &Vector2::new(1.0, 1.0));

        let damping = DVector::from_element(2, 1.0);
        let inc = acc.solve(Some(&damping));
        assert_relative_eq!(inc[0], 0.5, epsilon = 1e-12);
    }
}
