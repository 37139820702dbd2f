use ndarray::{ArrayViewD, ArrayViewMutD};

use super::UpdateMethod;

/// Gradient descent update rule.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    learning_rate: f64,
}

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    ///
    /// # Arguments
    /// * `learning_rate` - The length of the steps taken on `update`.
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl UpdateMethod for GradientDescent {
    /// Steps every parameter tensor in the opposite direction of its
    /// gradient, scaled by the learning rate.
    fn update(&mut self, params: &mut [ArrayViewMutD<'_, f64>], grads: &[ArrayViewD<'_, f64>]) {
        let lr = self.learning_rate;

        for (param, grad) in params.iter_mut().zip(grads) {
            param.zip_mut_with(grad, |w, g| *w -= lr * g);
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_step_moves_against_the_gradient() {
        let mut weights = array![[1.0, 2.0], [3.0, 4.0]];
        let mut biases = array![0.5, -0.5];
        let grad_w = array![[0.5, 0.0], [0.0, 0.25]];
        let grad_b = array![1.0, -1.0];

        let mut method = GradientDescent::new(0.5);
        {
            let mut params = vec![weights.view_mut().into_dyn(), biases.view_mut().into_dyn()];
            let grads = vec![grad_w.view().into_dyn(), grad_b.view().into_dyn()];
            method.update(&mut params, &grads);
        }

        assert_eq!(weights, array![[0.75, 2.0], [3.0, 3.875]]);
        assert_eq!(biases, array![0.0, 0.0]);
    }

    #[test]
    fn test_zero_gradient_leaves_parameters_unchanged() {
        let mut weights = array![[1.0, -2.0]];
        let grad_w = array![[0.0, 0.0]];

        let mut method = GradientDescent::new(0.9);
        let mut params = vec![weights.view_mut().into_dyn()];
        let grads = vec![grad_w.view().into_dyn()];
        method.update(&mut params, &grads);
        drop(params);

        assert_eq!(weights, array![[1.0, -2.0]]);
    }
}
