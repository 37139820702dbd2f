//! The cell contract and the concrete cell algorithms.
//!
//! A cell is one timestep of a recurrent layer: it owns its input/output
//! arrays and gate state, computes its forward formula from the previous
//! timestep's values, its backward formula from the next timestep's stored
//! error injections, and its relevance formula from contributions saved
//! during forward. Neighbor access is resolved by the arena; cells never
//! hold references to each other.

use ndarray::Array1;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::activation::ActFn;
use crate::augmented::AugmentedArray;
use crate::error::{Result, RnnError};
use crate::params::ParamBundle;

mod cfn;
mod delta;
mod gru;
mod lstm;
mod ltm;
mod ran;
mod simple;

pub use cfn::{CfnCell, CfnParams};
pub use delta::{DeltaCell, DeltaParams};
pub use gru::{GruCell, GruParams};
pub use lstm::{LstmCell, LstmParams};
pub use ltm::{LtmCell, LtmParams};
pub use ran::{RanCell, RanParams};
pub use simple::{SimpleCell, SimpleParams};

/// The kind of layer connection a factory is asked for. Only the recurrent
/// kinds can be built into a sequence processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    Feedforward,
    Simple,
    Cfn,
    Gru,
    Lstm,
    Delta,
    Ran,
    Ltm,
}

/// Shared construction settings for every cell type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    pub input_size: usize,
    pub output_size: usize,
    pub activation: ActFn,
    /// Dropout probability on the input values; `0.0` disables it.
    pub dropout: f64,
}

impl CellConfig {
    pub fn new(input_size: usize, output_size: usize, activation: ActFn) -> Self {
        Self {
            input_size,
            output_size,
            activation,
            dropout: 0.0,
        }
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.output_size == 0 {
            return Err(RnnError::InvalidConfig(format!(
                "zero-sized layer ({} -> {})",
                self.input_size, self.output_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(RnnError::InvalidConfig(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Initial hidden state injected at the first timestep in place of a
/// previous cell instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitHidden {
    pub output: Array1<f64>,
    pub cell: Option<Array1<f64>>,
}

impl InitHidden {
    pub fn new(output: Array1<f64>) -> Self {
        Self { output, cell: None }
    }

    pub fn with_cell(output: Array1<f64>, cell: Array1<f64>) -> Self {
        Self {
            output,
            cell: Some(cell),
        }
    }
}

/// The previous timestep's values a cell consumes during forward.
#[derive(Debug, Clone, Copy)]
pub struct PrevValues<'a> {
    pub output: &'a Array1<f64>,
    pub cell: Option<&'a Array1<f64>>,
}

/// The error vectors the next timestep stored for this cell during its own
/// backward pass.
#[derive(Debug, Clone, Copy)]
pub struct NextErrors<'a> {
    pub output: &'a Array1<f64>,
    pub cell: Option<&'a Array1<f64>>,
}

/// Mutable relevance destinations on the previous timestep.
pub struct PrevSlots<'a> {
    pub output: &'a mut AugmentedArray,
    pub cell: Option<&'a mut AugmentedArray>,
}

/// One timestep of a recurrent layer.
///
/// Lifecycle per sequence: `reset` (on arena reuse), input assignment,
/// `forward`, output-error assignment, `backward`, and optionally
/// `calculate_relevance` when forward saved contributions.
pub trait Cell: Sized {
    type Params: ParamBundle;

    fn kind() -> ConnectionType;

    fn new(config: &CellConfig) -> Result<Self>;

    /// Fresh, seeded parameters for this cell type.
    fn init_params(config: &CellConfig, rng: &mut StdRng) -> Result<Self::Params>;

    fn input(&self) -> &AugmentedArray;
    fn input_mut(&mut self) -> &mut AugmentedArray;
    fn output(&self) -> &AugmentedArray;
    fn output_mut(&mut self) -> &mut AugmentedArray;

    /// The internal cell-state chain, for cell types that carry one.
    fn cell_state(&self) -> Option<&AugmentedArray> {
        None
    }

    fn cell_state_mut(&mut self) -> Option<&mut AugmentedArray> {
        None
    }

    /// This cell's output and cell-state arrays borrowed together, in the
    /// shape a later timestep's relevance step writes into.
    fn relevance_slots(&mut self) -> PrevSlots<'_>;

    /// The output-side error this cell computed for its previous state
    /// during backward, or `None` when no previous state was consumed.
    fn recurrent_error(&self) -> Option<&Array1<f64>>;

    /// The cell-chain error for the previous state, for cell types with an
    /// internal state chain.
    fn recurrent_cell_error(&self) -> Option<&Array1<f64>> {
        None
    }

    /// Computes gate values and the output from the assigned input and the
    /// previous state's values. With `save_contributions` the per-element
    /// pre-summation products are retained for later relevance calls.
    fn forward(
        &mut self,
        params: &Self::Params,
        prev: Option<PrevValues<'_>>,
        save_contributions: bool,
    ) -> Result<()>;

    /// Consumes the assigned output errors plus the next state's stored
    /// injections, accumulates parameter gradients into `grads`, stores the
    /// injections for the previous state, and (with `propagate_to_input`)
    /// fills the input errors.
    fn backward(
        &mut self,
        params: &Self::Params,
        grads: &mut Self::Params,
        next: Option<NextErrors<'_>>,
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()>;

    /// Redistributes the relevance assigned on the output array onto gates,
    /// the input, and (with `to_previous`) the previous state's arrays.
    ///
    /// A cell that consumed a previous state but is handed no `prev` slots
    /// while `to_previous` is set fails with `StructuralMisuse`.
    fn calculate_relevance(
        &mut self,
        params: &Self::Params,
        prev: Option<PrevSlots<'_>>,
        to_previous: bool,
    ) -> Result<()>;

    /// Clears all per-sequence state so the instance can be reused.
    fn reset(&mut self);
}

/// The output error a cell differentiates: its assigned errors, plus the
/// next state's recurrent injection, optionally truncated to the `k`
/// largest-magnitude components (meProp).
pub(crate) fn effective_output_error(
    output: &AugmentedArray,
    next: Option<&NextErrors<'_>>,
    me_prop_k: Option<usize>,
) -> Result<Array1<f64>> {
    let mut errors = output.errors()?.clone();
    if let Some(next) = next {
        errors += next.output;
    }
    if let Some(k) = me_prop_k {
        me_prop_truncate(&mut errors, k);
    }
    Ok(errors)
}

/// Zeroes every component except the `k` of largest magnitude.
pub(crate) fn me_prop_truncate(errors: &mut Array1<f64>, k: usize) {
    if k >= errors.len() {
        return;
    }
    let mut order: Vec<usize> = (0..errors.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        errors[b]
            .abs()
            .partial_cmp(&errors[a].abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for &i in &order[k..] {
        errors[i] = 0.0;
    }
}

/// Guard for relevance propagation toward a previous state: fails when the
/// walk expects one and the context window has none.
pub(crate) fn require_prev_window<'a>(
    prev: Option<PrevSlots<'a>>,
    to_previous: bool,
    consumed_prev: bool,
) -> Result<Option<PrevSlots<'a>>> {
    if !to_previous {
        return Ok(None);
    }
    if consumed_prev && prev.is_none() {
        return Err(RnnError::StructuralMisuse(
            "relevance requested toward a previous state that does not exist",
        ));
    }
    Ok(prev)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_me_prop_keeps_largest_components() {
        let mut e = array![0.1, -0.9, 0.5, -0.2];
        me_prop_truncate(&mut e, 2);
        assert_eq!(e, array![0.0, -0.9, 0.5, 0.0]);
    }

    #[test]
    fn test_me_prop_with_large_k_is_identity() {
        let mut e = array![0.1, -0.9];
        me_prop_truncate(&mut e, 5);
        assert_eq!(e, array![0.1, -0.9]);
    }

    #[test]
    fn test_config_validation() {
        assert!(CellConfig::new(3, 4, ActFn::Tanh).validate().is_ok());
        assert!(CellConfig::new(0, 4, ActFn::Tanh).validate().is_err());
        assert!(
            CellConfig::new(3, 4, ActFn::Tanh)
                .with_dropout(1.0)
                .validate()
                .is_err()
        );
    }
}
