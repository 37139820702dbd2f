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
use crate::params::{ParamBundle, ParameterUnit};
use crate::relevance;

/// Long Short-Term Memory parameters: three sigmoid gate units and the
/// candidate unit, each with input and recurrent weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmParams {
    pub input_gate: ParameterUnit,
    pub output_gate: ParameterUnit,
    pub forget_gate: ParameterUnit,
    pub candidate: ParameterUnit,
}

impl ParamBundle for LstmParams {
    fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut out = Vec::new();
        self.input_gate.collect_tensors(&mut out);
        self.output_gate.collect_tensors(&mut out);
        self.forget_gate.collect_tensors(&mut out);
        self.candidate.collect_tensors(&mut out);
        out
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut out = Vec::new();
        self.input_gate.collect_tensors_mut(&mut out);
        self.output_gate.collect_tensors_mut(&mut out);
        self.forget_gate.collect_tensors_mut(&mut out);
        self.candidate.collect_tensors_mut(&mut out);
        out
    }
}

#[derive(Debug, Clone)]
struct LstmContribs {
    input: Array2<f64>,
    recurrent: Option<Array2<f64>>,
}

/// The Long Short-Term Memory cell:
///
/// ```text
/// inG  = σ(Wi·x + bi + WiRec·yPrev)
/// outG = σ(Wo·x + bo + WoRec·yPrev)
/// forG = σ(Wf·x + bf + WfRec·yPrev)
/// cand = f(Wg·x + bg + WgRec·yPrev)
/// cell = f(inG ⊙ cand + forG ⊙ cellPrev)
/// y    = outG ⊙ cell
/// ```
///
/// The cell state carries its own error and relevance chains alongside the
/// output. A previous state may supply an output without a cell state, in
/// which case the forget gate is computed but idle.
#[derive(Debug, Clone)]
pub struct LstmCell {
    activation: ActFn,
    input: AugmentedArray,
    output: AugmentedArray,
    cell: AugmentedArray,
    input_gate: AugmentedArray,
    output_gate: AugmentedArray,
    forget_gate: AugmentedArray,
    candidate: AugmentedArray,
    y_prev: Option<Array1<f64>>,
    cell_prev: Option<Array1<f64>>,
    prev_error: Option<Array1<f64>>,
    prev_cell_error: Option<Array1<f64>>,
    contribs: Option<LstmContribs>,
}

impl LstmCell {
    pub fn input_gate(&self) -> &AugmentedArray {
        &self.input_gate
    }

    pub fn output_gate(&self) -> &AugmentedArray {
        &self.output_gate
    }

    pub fn forget_gate(&self) -> &AugmentedArray {
        &self.forget_gate
    }

    pub fn candidate(&self) -> &AugmentedArray {
        &self.candidate
    }
}

impl Cell for LstmCell {
    type Params = LstmParams;

    fn kind() -> ConnectionType {
        ConnectionType::Lstm
    }

    fn new(config: &CellConfig) -> Result<Self> {
        config.validate()?;
        let out = config.output_size;
        Ok(Self {
            activation: config.activation,
            input: AugmentedArray::new(config.input_size),
            output: AugmentedArray::new(out),
            cell: AugmentedArray::new(out),
            input_gate: AugmentedArray::new(out),
            output_gate: AugmentedArray::new(out),
            forget_gate: AugmentedArray::new(out),
            candidate: AugmentedArray::new(out),
            y_prev: None,
            cell_prev: None,
            prev_error: None,
            prev_cell_error: None,
            contribs: None,
        })
    }

    fn init_params(config: &CellConfig, rng: &mut StdRng) -> Result<LstmParams> {
        config.validate()?;
        let (out, inp) = (config.output_size, config.input_size);
        Ok(LstmParams {
            input_gate: ParameterUnit::glorot(out, inp, true, rng)?,
            output_gate: ParameterUnit::glorot(out, inp, true, rng)?,
            forget_gate: ParameterUnit::glorot(out, inp, true, rng)?,
            candidate: ParameterUnit::glorot(out, inp, true, rng)?,
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
        params: &LstmParams,
        prev: Option<PrevValues<'_>>,
        save_contributions: bool,
    ) -> Result<()> {
        self.y_prev = prev.as_ref().map(|p| p.output.clone());
        self.cell_prev = prev.as_ref().and_then(|p| p.cell.cloned());
        let x = self.input.values()?;

        let mut s_in = params.input_gate.apply(x);
        let mut s_out = params.output_gate.apply(x);
        let mut s_for = params.forget_gate.apply(x);
        let mut s_cand = params.candidate.apply(x);
        if let Some(y_prev) = &self.y_prev {
            s_in += &params.input_gate.recurrent_term(y_prev)?;
            s_out += &params.output_gate.recurrent_term(y_prev)?;
            s_for += &params.forget_gate.recurrent_term(y_prev)?;
            s_cand += &params.candidate.recurrent_term(y_prev)?;
        }
        self.input_gate.assign_values(s_in)?;
        self.input_gate.activate(ActFn::Sigmoid)?;
        self.output_gate.assign_values(s_out)?;
        self.output_gate.activate(ActFn::Sigmoid)?;
        self.forget_gate.assign_values(s_for)?;
        self.forget_gate.activate(ActFn::Sigmoid)?;
        self.candidate.assign_values(s_cand)?;
        self.candidate.activate(self.activation)?;

        let mut cell_pre = self.input_gate.values()? * self.candidate.values()?;
        if let Some(cell_prev) = &self.cell_prev {
            cell_pre += &(self.forget_gate.values()? * cell_prev);
        }
        self.cell.assign_values(cell_pre)?;
        self.cell.activate(self.activation)?;

        let y = self.output_gate.values()? * self.cell.values()?;
        self.contribs = if save_contributions {
            Some(LstmContribs {
                input: relevance::contributions(&params.candidate.weights, x),
                recurrent: match (&params.candidate.recurrent, &self.y_prev) {
                    (Some(w), Some(y_prev)) => Some(relevance::contributions(w, y_prev)),
                    _ => None,
                },
            })
        } else {
            None
        };
        self.output.assign_values(y)
    }

    fn backward(
        &mut self,
        params: &LstmParams,
        grads: &mut LstmParams,
        next: Option<NextErrors<'_>>,
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()> {
        let gy = effective_output_error(&self.output, next.as_ref(), me_prop_k)?;
        let x = self.input.values()?;

        // the cell chain joins before the cell activation is differentiated
        let mut g_cell_act = &gy * self.output_gate.values()?;
        if let Some(cell_errors) = next.as_ref().and_then(|n| n.cell) {
            g_cell_act += cell_errors;
        }
        let g_cell = &g_cell_act * &self.cell.derivative(self.activation)?;

        let g_out = &gy * self.cell.values()? * self.output_gate.derivative(ActFn::Sigmoid)?;
        let g_in =
            &g_cell * self.candidate.values()? * self.input_gate.derivative(ActFn::Sigmoid)?;
        let g_cand =
            &g_cell * self.input_gate.values()? * self.candidate.derivative(self.activation)?;

        let mut input_error = params
            .input_gate
            .backward_input(&mut grads.input_gate, &g_in, x);
        input_error += &params
            .output_gate
            .backward_input(&mut grads.output_gate, &g_out, x);
        input_error += &params
            .candidate
            .backward_input(&mut grads.candidate, &g_cand, x);

        let g_for = match &self.cell_prev {
            Some(cell_prev) => {
                let g_for =
                    &g_cell * cell_prev * self.forget_gate.derivative(ActFn::Sigmoid)?;
                input_error += &params
                    .forget_gate
                    .backward_input(&mut grads.forget_gate, &g_for, x);
                Some(g_for)
            }
            None => None,
        };
        self.prev_cell_error = match &self.cell_prev {
            Some(_) => Some(&g_cell * self.forget_gate.values()?),
            None => None,
        };

        self.prev_error = match &self.y_prev {
            Some(y_prev) => {
                let mut injection =
                    params
                        .input_gate
                        .backward_recurrent(&mut grads.input_gate, &g_in, y_prev)?;
                injection += &params.output_gate.backward_recurrent(
                    &mut grads.output_gate,
                    &g_out,
                    y_prev,
                )?;
                injection += &params.candidate.backward_recurrent(
                    &mut grads.candidate,
                    &g_cand,
                    y_prev,
                )?;
                if let Some(g_for) = &g_for {
                    injection += &params.forget_gate.backward_recurrent(
                        &mut grads.forget_gate,
                        g_for,
                        y_prev,
                    )?;
                }
                Some(injection)
            }
            None => None,
        };

        self.input_gate.assign_errors(g_in)?;
        self.output_gate.assign_errors(g_out)?;
        if let Some(g_for) = g_for {
            self.forget_gate.assign_errors(g_for)?;
        }
        self.candidate.assign_errors(g_cand)?;
        self.cell.assign_errors(g_cell)?;

        if propagate_to_input {
            self.input.assign_errors(input_error)?;
        }
        Ok(())
    }

    fn calculate_relevance(
        &mut self,
        params: &LstmParams,
        prev: Option<PrevSlots<'_>>,
        to_previous: bool,
    ) -> Result<()> {
        let contribs = self.contribs.as_ref().ok_or(RnnError::UninitializedAccess {
            what: "saved contributions",
        })?;
        let consumed_prev = self.y_prev.is_some() || self.cell_prev.is_some();
        let prev = require_prev_window(prev, to_previous, consumed_prev)?;

        // the output gate modulates, so the cell inherits the output relevance
        // whole, plus whatever the next state pushed onto the cell chain
        let mut cell_rel = self.output.relevance()?.clone();
        if let Some(injected) = self.cell.drain_recurrent_relevance() {
            cell_rel += &injected;
        }

        let terms = if self.cell_prev.is_some() { 2 } else { 1 };
        let cand_sources = if contribs.recurrent.is_some() { 2 } else { 1 };
        let share = 1.0 / cand_sources as f64;

        let candidate_term = self.input_gate.values()? * self.candidate.values()?;
        let rel_candidate = relevance::through_term(
            &cell_rel,
            &candidate_term,
            self.cell.not_activated()?,
            terms,
        );

        let mut input_contribs = contribs.input.clone();
        relevance::add_bias_share(&mut input_contribs, &params.candidate.biases, share);
        let input_rel = relevance::through_contributions(
            &rel_candidate,
            &input_contribs,
            self.candidate.not_activated()?,
            cand_sources,
        );

        if let Some(slots) = prev {
            if let Some(rec) = &contribs.recurrent {
                let mut rec_contribs = rec.clone();
                relevance::add_bias_share(&mut rec_contribs, &params.candidate.biases, share);
                let rel_prev = relevance::through_contributions(
                    &rel_candidate,
                    &rec_contribs,
                    self.candidate.not_activated()?,
                    cand_sources,
                );
                slots.output.add_recurrent_relevance(&rel_prev)?;
            }
            match (slots.cell, &self.cell_prev) {
                (Some(cell_slot), Some(cell_prev)) => {
                    let prev_term = self.forget_gate.values()? * cell_prev;
                    let rel_prev_cell = relevance::through_term(
                        &cell_rel,
                        &prev_term,
                        self.cell.not_activated()?,
                        terms,
                    );
                    cell_slot.add_recurrent_relevance(&rel_prev_cell)?;
                }
                (None, Some(_)) => {
                    return Err(RnnError::StructuralMisuse(
                        "relevance requested toward a previous cell state without a slot for it",
                    ));
                }
                _ => {}
            }
        }

        self.cell.assign_relevance(cell_rel)?;
        self.candidate.assign_relevance(rel_candidate)?;
        self.input.assign_relevance(input_rel)
    }

    fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.cell.clear();
        self.input_gate.clear();
        self.output_gate.clear();
        self.forget_gate.clear();
        self.candidate.clear();
        self.y_prev = None;
        self.cell_prev = None;
        self.prev_error = None;
        self.prev_cell_error = None;
        self.contribs = None;
    }
}
