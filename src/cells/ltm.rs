use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{
    Cell, CellConfig, ConnectionType, NextErrors, PrevSlots, PrevValues, effective_output_error,
    require_prev_window,
};
use crate::activation::ActFn;
use crate::augmented::AugmentedArray;
use crate::error::{Result, RnnError};
use crate::params::{ParamBundle, ParameterUnit, outer};
use crate::relevance;

/// Long-Term Memory parameters: three sigmoid gate units over the extended
/// input and the cell projection over the gated input. None of the units
/// carries recurrent weights; recurrence enters through the extended input
/// itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LtmParams {
    pub input_gate: ParameterUnit,
    pub forget_gate: ParameterUnit,
    pub output_gate: ParameterUnit,
    pub cell: ParameterUnit,
}

impl ParamBundle for LtmParams {
    fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut out = Vec::new();
        self.input_gate.collect_tensors(&mut out);
        self.forget_gate.collect_tensors(&mut out);
        self.output_gate.collect_tensors(&mut out);
        self.cell.collect_tensors(&mut out);
        out
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut out = Vec::new();
        self.input_gate.collect_tensors_mut(&mut out);
        self.forget_gate.collect_tensors_mut(&mut out);
        self.output_gate.collect_tensors_mut(&mut out);
        self.cell.collect_tensors_mut(&mut out);
        out
    }
}

#[derive(Debug, Clone)]
struct LtmContribs {
    cell_input: Array2<f64>,
}

/// The Long-Term Memory cell:
///
/// ```text
/// xE   = x + yPrev
/// l1   = σ(W1·xE + b1)
/// l2   = σ(W2·xE + b2)
/// l3   = σ(W3·xE + b3)
/// cell = f(Wc·(l1 ⊙ xE) + bc + l2 ⊙ cellPrev)
/// y    = cell ⊙ l3
/// ```
///
/// The extended input folds the previous output into the current input
/// elementwise, which is why this cell requires the input and output sizes
/// to match. Both the previous output and the previous cell state feed it,
/// so backward produces both recurrent error vectors.
#[derive(Debug, Clone)]
pub struct LtmCell {
    activation: ActFn,
    input: AugmentedArray,
    output: AugmentedArray,
    extended: AugmentedArray,
    cell: AugmentedArray,
    input_gate: AugmentedArray,
    forget_gate: AugmentedArray,
    output_gate: AugmentedArray,
    y_prev: Option<Array1<f64>>,
    cell_prev: Option<Array1<f64>>,
    prev_error: Option<Array1<f64>>,
    prev_cell_error: Option<Array1<f64>>,
    contribs: Option<LtmContribs>,
}

impl LtmCell {
    pub fn extended_input(&self) -> &AugmentedArray {
        &self.extended
    }

    pub fn input_gate(&self) -> &AugmentedArray {
        &self.input_gate
    }

    pub fn forget_gate(&self) -> &AugmentedArray {
        &self.forget_gate
    }

    pub fn output_gate(&self) -> &AugmentedArray {
        &self.output_gate
    }

    fn check_square(config: &CellConfig) -> Result<()> {
        if config.input_size != config.output_size {
            return Err(RnnError::InvalidConfig(format!(
                "ltm cells fold the previous output into the input and need matching sizes, \
                 got input {} and output {}",
                config.input_size, config.output_size
            )));
        }
        Ok(())
    }
}

impl Cell for LtmCell {
    type Params = LtmParams;

    fn kind() -> ConnectionType {
        ConnectionType::Ltm
    }

    fn new(config: &CellConfig) -> Result<Self> {
        config.validate()?;
        Self::check_square(config)?;
        let out = config.output_size;
        Ok(Self {
            activation: config.activation,
            input: AugmentedArray::new(config.input_size),
            output: AugmentedArray::new(out),
            extended: AugmentedArray::new(out),
            cell: AugmentedArray::new(out),
            input_gate: AugmentedArray::new(out),
            forget_gate: AugmentedArray::new(out),
            output_gate: AugmentedArray::new(out),
            y_prev: None,
            cell_prev: None,
            prev_error: None,
            prev_cell_error: None,
            contribs: None,
        })
    }

    fn init_params(config: &CellConfig, rng: &mut StdRng) -> Result<LtmParams> {
        config.validate()?;
        Self::check_square(config)?;
        let (out, inp) = (config.output_size, config.input_size);
        Ok(LtmParams {
            input_gate: ParameterUnit::glorot(out, inp, false, rng)?,
            forget_gate: ParameterUnit::glorot(out, inp, false, rng)?,
            output_gate: ParameterUnit::glorot(out, inp, false, rng)?,
            cell: ParameterUnit::glorot(out, inp, false, rng)?,
        })
    }

    fn input(&self) -> &AugmentedArray {
        &self.input
    }

    fn input_mut(&mut self) -> &mut AugmentedArray {
        &mut self.input
    }

    fn output(&self) -> &AugmentedArray {
        &self.output
    }

    fn output_mut(&mut self) -> &mut AugmentedArray {
        &mut self.output
    }

    fn cell_state(&self) -> Option<&AugmentedArray> {
        Some(&self.cell)
    }

    fn cell_state_mut(&mut self) -> Option<&mut AugmentedArray> {
        Some(&mut self.cell)
    }

    fn relevance_slots(&mut self) -> PrevSlots<'_> {
        PrevSlots {
            output: &mut self.output,
            cell: Some(&mut self.cell),
        }
    }

    fn recurrent_error(&self) -> Option<&Array1<f64>> {
        self.prev_error.as_ref()
    }

    fn recurrent_cell_error(&self) -> Option<&Array1<f64>> {
        self.prev_cell_error.as_ref()
    }

    fn forward(
        &mut self,
        params: &LtmParams,
        prev: Option<PrevValues<'_>>,
        save_contributions: bool,
    ) -> Result<()> {
        self.y_prev = prev.as_ref().map(|p| p.output.clone());
        self.cell_prev = prev.as_ref().and_then(|p| p.cell.cloned());
        let x = self.input.values()?;

        let extended = match &self.y_prev {
            Some(y_prev) => x + y_prev,
            None => x.clone(),
        };
        self.input_gate
            .assign_values(params.input_gate.apply(&extended))?;
        self.input_gate.activate(ActFn::Sigmoid)?;
        self.forget_gate
            .assign_values(params.forget_gate.apply(&extended))?;
        self.forget_gate.activate(ActFn::Sigmoid)?;
        self.output_gate
            .assign_values(params.output_gate.apply(&extended))?;
        self.output_gate.activate(ActFn::Sigmoid)?;

        let gated = self.input_gate.values()? * &extended;
        let mut cell_pre = params.cell.apply(&gated);
        if let Some(cell_prev) = &self.cell_prev {
            cell_pre += &(self.forget_gate.values()? * cell_prev);
        }
        self.cell.assign_values(cell_pre)?;
        self.cell.activate(self.activation)?;

        let y = self.cell.values()? * self.output_gate.values()?;
        self.contribs = if save_contributions {
            Some(LtmContribs {
                cell_input: relevance::contributions(&params.cell.weights, &gated),
            })
        } else {
            None
        };
        self.extended.assign_values(extended)?;
        self.output.assign_values(y)
    }

    fn backward(
        &mut self,
        params: &LtmParams,
        grads: &mut LtmParams,
        next: Option<NextErrors<'_>>,
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()> {
        let gy = effective_output_error(&self.output, next.as_ref(), me_prop_k)?;
        let extended = self.extended.values()?;

        // the cell chain joins before the cell activation is differentiated
        let mut g_cell_act = &gy * self.output_gate.values()?;
        if let Some(cell_errors) = next.as_ref().and_then(|n| n.cell) {
            g_cell_act += cell_errors;
        }
        let g_cell = &g_cell_act * &self.cell.derivative(self.activation)?;

        let g_out =
            &gy * self.cell.values()? * self.output_gate.derivative(ActFn::Sigmoid)?;
        let propagated = params.cell.weights.t().dot(&g_cell);
        let g_in = &propagated * extended * self.input_gate.derivative(ActFn::Sigmoid)?;

        let gated = self.input_gate.values()? * extended;
        grads.cell.weights += &outer(&g_cell, &gated);
        grads.cell.biases += &g_cell;

        let mut extended_error = &propagated * self.input_gate.values()?;
        extended_error += &params
            .input_gate
            .backward_input(&mut grads.input_gate, &g_in, extended);
        extended_error += &params
            .output_gate
            .backward_input(&mut grads.output_gate, &g_out, extended);

        self.prev_cell_error = match &self.cell_prev {
            Some(cell_prev) => {
                let g_for =
                    &g_cell * cell_prev * self.forget_gate.derivative(ActFn::Sigmoid)?;
                extended_error += &params
                    .forget_gate
                    .backward_input(&mut grads.forget_gate, &g_for, extended);
                self.forget_gate.assign_errors(g_for)?;
                Some(&g_cell * self.forget_gate.values()?)
            }
            None => None,
        };

        // x and yPrev enter the extended input symmetrically, so both
        // receive the full extended error
        self.prev_error = self.y_prev.as_ref().map(|_| extended_error.clone());
        self.input_gate.assign_errors(g_in)?;
        self.output_gate.assign_errors(g_out)?;
        self.cell.assign_errors(g_cell)?;
        self.extended.assign_errors(extended_error.clone())?;

        if propagate_to_input {
            self.input.assign_errors(extended_error)?;
        }
        Ok(())
    }

    fn calculate_relevance(
        &mut self,
        params: &LtmParams,
        prev: Option<PrevSlots<'_>>,
        to_previous: bool,
    ) -> Result<()> {
        let contribs = self.contribs.as_ref().ok_or(RnnError::UninitializedAccess {
            what: "saved contributions",
        })?;
        let consumed_prev = self.y_prev.is_some() || self.cell_prev.is_some();
        let prev = require_prev_window(prev, to_previous, consumed_prev)?;

        // the output gate modulates, so the cell inherits the output
        // relevance whole, plus anything pushed onto the cell chain
        let mut cell_rel = self.output.relevance()?.clone();
        if let Some(injected) = self.cell.drain_recurrent_relevance() {
            cell_rel += &injected;
        }

        let cell_pre = self.cell.not_activated()?;
        let sources = if self.cell_prev.is_some() { 2 } else { 1 };
        let share = 1.0 / sources as f64;

        let mut cell_contribs = contribs.cell_input.clone();
        relevance::add_bias_share(&mut cell_contribs, &params.cell.biases, share);
        let extended_rel =
            relevance::through_contributions(&cell_rel, &cell_contribs, cell_pre, sources);

        if let Some(slots) = prev {
            if let Some(cell_prev) = &self.cell_prev {
                let cell_slot = slots.cell.ok_or(RnnError::StructuralMisuse(
                    "relevance requested toward a previous cell state without a slot for it",
                ))?;
                let bias_share = params.cell.biases.mapv(|b| b * share);
                let prev_term = self.forget_gate.values()? * cell_prev + &bias_share;
                let rel_prev_cell =
                    relevance::through_term(&cell_rel, &prev_term, cell_pre, sources);
                cell_slot.add_recurrent_relevance(&rel_prev_cell)?;
            }
            if let Some(y_prev) = &self.y_prev {
                let extended = self.extended.values()?;
                let rel_prev =
                    relevance::through_term(&extended_rel, y_prev, extended, 2);
                slots.output.add_recurrent_relevance(&rel_prev)?;
            }
        }

        let input_rel = match &self.y_prev {
            Some(_) => {
                let extended = self.extended.values()?;
                relevance::through_term(&extended_rel, self.input.values()?, extended, 2)
            }
            None => extended_rel.clone(),
        };
        self.extended.assign_relevance(extended_rel)?;
        self.cell.assign_relevance(cell_rel)?;
        self.input.assign_relevance(input_rel)
    }

    fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.extended.clear();
        self.cell.clear();
        self.input_gate.clear();
        self.forget_gate.clear();
        self.output_gate.clear();
        self.y_prev = None;
        self.cell_prev = None;
        self.prev_error = None;
        self.prev_cell_error = None;
        self.contribs = None;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn params() -> LtmParams {
        let unit = |w, b| ParameterUnit {
            weights: w,
            biases: b,
            recurrent: None,
        };
        LtmParams {
            input_gate: unit(array![[0.3, -0.2], [0.1, 0.4]], array![0.05, -0.05]),
            forget_gate: unit(array![[0.2, 0.1], [-0.1, 0.3]], array![0.0, 0.1]),
            output_gate: unit(array![[-0.3, 0.2], [0.4, 0.1]], array![0.1, 0.0]),
            cell: unit(array![[0.5, -0.4], [0.3, 0.6]], array![-0.1, 0.05]),
        }
    }

    #[test]
    fn test_sizes_must_match() {
        let err = LtmCell::new(&CellConfig::new(3, 2, ActFn::Tanh)).unwrap_err();
        assert!(matches!(err, RnnError::InvalidConfig(_)));
    }

    #[test]
    fn test_extended_input_folds_prev_output() {
        let p = params();
        let mut c = LtmCell::new(&CellConfig::new(2, 2, ActFn::Tanh)).unwrap();
        c.input_mut().assign_values(array![0.4, -0.7]).unwrap();
        c.forward(
            &p,
            Some(PrevValues {
                output: &array![0.1, 0.2],
                cell: Some(&array![0.3, -0.1]),
            }),
            false,
        )
        .unwrap();

        let extended = c.extended_input().values().unwrap();
        assert!((extended[0] - 0.5).abs() < 1e-12);
        assert!((extended[1] + 0.5).abs() < 1e-12);

        let cell = c.cell_state().unwrap().values().unwrap();
        let out_g = c.output_gate().values().unwrap();
        let got = c.output().values().unwrap();
        for i in 0..2 {
            assert!((got[i] - cell[i] * out_g[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_both_error_chains_reach_the_previous_state() {
        let p = params();
        let mut grads = p.zeroed();
        let mut c = LtmCell::new(&CellConfig::new(2, 2, ActFn::Tanh)).unwrap();
        c.input_mut().assign_values(array![0.4, -0.7]).unwrap();
        c.forward(
            &p,
            Some(PrevValues {
                output: &array![0.1, 0.2],
                cell: Some(&array![0.3, -0.1]),
            }),
            false,
        )
        .unwrap();
        c.output_mut().assign_errors(array![1.0, -0.5]).unwrap();
        c.backward(&p, &mut grads, None, true, None).unwrap();

        let prev_error = c.recurrent_error().unwrap();
        let input_error = c.input().errors().unwrap();
        for i in 0..2 {
            assert!((prev_error[i] - input_error[i]).abs() < 1e-12);
        }
        assert!(c.recurrent_cell_error().is_some());
    }
}
