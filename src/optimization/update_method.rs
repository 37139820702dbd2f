use ndarray::{ArrayViewD, ArrayViewMutD};

/// A parameter update rule.
///
/// `update` receives matching view lists over a layer's parameter tensors
/// and its accumulated gradient tensors, in bundle order. The lifecycle
/// hooks are invoked by the training driver at the matching boundaries;
/// rules without per-phase state keep the empty defaults.
pub trait UpdateMethod {
    /// Applies one step to `params` from `grads`.
    ///
    /// # Arguments
    /// * `params` - The parameter tensors that are going to be modified.
    /// * `grads` - The gradient tensors, shape-matched one to one.
    fn update(&mut self, params: &mut [ArrayViewMutD<'_, f64>], grads: &[ArrayViewD<'_, f64>]);

    fn new_epoch(&mut self) {}

    fn new_batch(&mut self) {}

    fn new_example(&mut self) {}
}
