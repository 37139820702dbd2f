use std::fmt;

use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD, Axis};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand_distr::Uniform;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RnnError};

/// One gate's parameters: a dense weight matrix (`output × input`), its bias
/// vector, and (for gates fed by the previous timestep's output) a recurrent
/// matrix (`output × output`).
///
/// A unit is owned by exactly one cell type's parameter bundle. Gradient
/// bundles reuse the same type with identical shapes, produced by
/// `zeros_like` and accumulated across timesteps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterUnit {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub recurrent: Option<Array2<f64>>,
}

impl ParameterUnit {
    /// Glorot-uniform weights, zero biases, seeded through `rng`.
    pub fn glorot(output: usize, input: usize, recurrent: bool, rng: &mut StdRng) -> Result<Self> {
        let weights = glorot_matrix(output, input, rng)?;
        let recurrent = if recurrent {
            Some(glorot_matrix(output, output, rng)?)
        } else {
            None
        };
        Ok(Self {
            weights,
            biases: Array1::zeros(output),
            recurrent,
        })
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            weights: Array2::zeros(self.weights.raw_dim()),
            biases: Array1::zeros(self.biases.len()),
            recurrent: self
                .recurrent
                .as_ref()
                .map(|r| Array2::zeros(r.raw_dim())),
        }
    }

    pub fn output_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn input_size(&self) -> usize {
        self.weights.ncols()
    }

    /// `W·x + b`.
    pub fn apply(&self, input: &Array1<f64>) -> Array1<f64> {
        self.weights.dot(input) + &self.biases
    }

    /// `Wrec·yPrev` for units carrying a recurrent matrix.
    pub fn recurrent_term(&self, y_prev: &Array1<f64>) -> Result<Array1<f64>> {
        let rec = self
            .recurrent
            .as_ref()
            .ok_or(RnnError::UnsupportedOperation("unit has no recurrent weights"))?;
        Ok(rec.dot(y_prev))
    }

    /// Accumulates `∂W += δ ⊗ xᵗ` and `∂b += δ` into `grad`, returning the
    /// propagated input error `Wᵗ·δ`.
    pub fn backward_input(
        &self,
        grad: &mut ParameterUnit,
        delta: &Array1<f64>,
        input: &Array1<f64>,
    ) -> Array1<f64> {
        grad.weights += &outer(delta, input);
        grad.biases += delta;
        self.weights.t().dot(delta)
    }

    /// Accumulates `∂Wrec += δ ⊗ yPrevᵗ` into `grad`, returning `Wrecᵗ·δ`.
    pub fn backward_recurrent(
        &self,
        grad: &mut ParameterUnit,
        delta: &Array1<f64>,
        y_prev: &Array1<f64>,
    ) -> Result<Array1<f64>> {
        let rec = self
            .recurrent
            .as_ref()
            .ok_or(RnnError::UnsupportedOperation("unit has no recurrent weights"))?;
        if let Some(grad_rec) = &mut grad.recurrent {
            *grad_rec += &outer(delta, y_prev);
        }
        Ok(rec.t().dot(delta))
    }

    pub(crate) fn collect_tensors<'a>(&'a self, out: &mut Vec<ArrayViewD<'a, f64>>) {
        out.push(self.weights.view().into_dyn());
        out.push(self.biases.view().into_dyn());
        if let Some(rec) = &self.recurrent {
            out.push(rec.view().into_dyn());
        }
    }

    pub(crate) fn collect_tensors_mut<'a>(&'a mut self, out: &mut Vec<ArrayViewMutD<'a, f64>>) {
        out.push(self.weights.view_mut().into_dyn());
        out.push(self.biases.view_mut().into_dyn());
        if let Some(rec) = &mut self.recurrent {
            out.push(rec.view_mut().into_dyn());
        }
    }
}

/// A cell type's full parameter collection, exposed to the optimizer
/// boundary as an ordered list of tensor views.
///
/// The same concrete type doubles as the gradient accumulator for its cell;
/// `zeroed`, `accumulate` and `scale` implement the sum-then-average
/// discipline of backpropagation-through-time.
pub trait ParamBundle: Clone + fmt::Debug {
    fn tensors(&self) -> Vec<ArrayViewD<'_, f64>>;
    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>>;

    /// A same-shaped bundle with every tensor zeroed.
    fn zeroed(&self) -> Self {
        let mut zero = self.clone();
        for mut tensor in zero.tensors_mut() {
            tensor.fill(0.0);
        }
        zero
    }

    /// Elementwise `self += other`. Shapes must match by construction.
    fn accumulate(&mut self, other: &Self) {
        for (mut tensor, incoming) in self.tensors_mut().into_iter().zip(other.tensors()) {
            tensor += &incoming;
        }
    }

    /// Elementwise `self *= factor`.
    fn scale(&mut self, factor: f64) {
        for mut tensor in self.tensors_mut() {
            tensor *= factor;
        }
    }
}

/// `δ ⊗ xᵗ` as a dense matrix.
pub(crate) fn outer(delta: &Array1<f64>, input: &Array1<f64>) -> Array2<f64> {
    let d = delta.view().insert_axis(Axis(1));
    let x = input.view().insert_axis(Axis(0));
    d.dot(&x)
}

/// Glorot-uniform matrix: `U(-limit, limit)` with
/// `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Result<Array2<f64>> {
    let limit = (6.0 / (rows + cols) as f64).sqrt();
    let dist = Uniform::new(-limit, limit)
        .map_err(|_| RnnError::InvalidConfig(format!("degenerate init range {rows}x{cols}")))?;
    Ok(Array2::random_using((rows, cols), dist, rng))
}

/// Seeded Glorot vector, for elementwise parameters such as DeltaRNN's
/// `alpha`/`beta` mixing coefficients.
pub fn glorot_vector(len: usize, rng: &mut StdRng) -> Result<Array1<f64>> {
    let limit = (6.0 / (len + 1) as f64).sqrt();
    let dist = Uniform::new(-limit, limit)
        .map_err(|_| RnnError::InvalidConfig(format!("degenerate init range {len}")))?;
    Ok(Array1::random_using(len, dist, rng))
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;

    use super::*;

    #[derive(Debug, Clone)]
    struct OneUnit {
        unit: ParameterUnit,
    }

    impl ParamBundle for OneUnit {
        fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
            let mut out = Vec::new();
            self.unit.collect_tensors(&mut out);
            out
        }

        fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
            let mut out = Vec::new();
            self.unit.collect_tensors_mut(&mut out);
            out
        }
    }

    fn unit() -> ParameterUnit {
        ParameterUnit {
            weights: array![[1.0, -2.0], [0.5, 0.0]],
            biases: array![0.1, -0.1],
            recurrent: Some(array![[0.3, 0.0], [-0.2, 0.4]]),
        }
    }

    #[test]
    fn test_apply_is_affine() {
        let u = unit();
        let y = u.apply(&array![2.0, 1.0]);
        assert!((y[0] - 0.1).abs() < 1e-12);
        assert!((y[1] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_backward_input_accumulates_and_propagates() {
        let u = unit();
        let mut grad = u.zeros_like();
        let delta = array![1.0, 2.0];
        let input = array![3.0, -1.0];
        let back = u.backward_input(&mut grad, &delta, &input);
        // ∂W = δ ⊗ xᵗ
        assert_eq!(grad.weights, array![[3.0, -1.0], [6.0, -2.0]]);
        assert_eq!(grad.biases, delta);
        // Wᵗ·δ
        assert!((back[0] - 2.0).abs() < 1e-12);
        assert!((back[1] - (-2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_glorot_is_seed_deterministic_and_bounded() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let m1 = glorot_matrix(4, 3, &mut a).unwrap();
        let m2 = glorot_matrix(4, 3, &mut b).unwrap();
        assert_eq!(m1, m2);
        let limit = (6.0 / 7.0_f64).sqrt();
        assert!(m1.iter().all(|v| v.abs() < limit));
    }

    #[test]
    fn test_bundle_zeroed_accumulate_scale() {
        let params = OneUnit { unit: unit() };
        let mut acc = params.zeroed();
        assert!(acc.tensors().iter().all(|t| t.iter().all(|&v| v == 0.0)));
        acc.accumulate(&params);
        acc.accumulate(&params);
        acc.scale(0.5);
        for (got, want) in acc.tensors().into_iter().zip(params.tensors()) {
            for (g, w) in got.iter().zip(want.iter()) {
                assert!((g - w).abs() < 1e-12);
            }
        }
    }
}
