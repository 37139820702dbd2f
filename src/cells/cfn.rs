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
use crate::params::{ParamBundle, ParameterUnit, glorot_matrix, outer};
use crate::relevance;

/// Chaos-Free Network parameters: gated input and forget units plus a
/// bias-free, non-recurrent candidate projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfnParams {
    pub input_gate: ParameterUnit,
    pub forget_gate: ParameterUnit,
    pub candidate_weights: Array2<f64>,
}

impl ParamBundle for CfnParams {
    fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut out = Vec::new();
        self.input_gate.collect_tensors(&mut out);
        self.forget_gate.collect_tensors(&mut out);
        out.push(self.candidate_weights.view().into_dyn());
        out
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut out = Vec::new();
        self.input_gate.collect_tensors_mut(&mut out);
        self.forget_gate.collect_tensors_mut(&mut out);
        out.push(self.candidate_weights.view_mut().into_dyn());
        out
    }
}

#[derive(Debug, Clone)]
struct CfnContribs {
    candidate: Array2<f64>,
}

/// The Chaos-Free Network cell:
///
/// ```text
/// inG  = σ(Wi·x + bi + WiRec·yPrev)
/// forG = σ(Wf·x + bf + WfRec·yPrev)
/// c    = f(Wc·x)
/// y    = inG ⊙ c + forG ⊙ f(yPrev)
/// ```
///
/// The forget path exists only when a previous state does. The output is a
/// plain sum of gated terms with no outer activation.
#[derive(Debug, Clone)]
pub struct CfnCell {
    activation: ActFn,
    input: AugmentedArray,
    output: AugmentedArray,
    input_gate: AugmentedArray,
    forget_gate: AugmentedArray,
    candidate: AugmentedArray,
    y_prev: Option<Array1<f64>>,
    prev_activated: Option<Array1<f64>>,
    prev_error: Option<Array1<f64>>,
    contribs: Option<CfnContribs>,
}

impl CfnCell {
    pub fn input_gate(&self) -> &AugmentedArray {
        &self.input_gate
    }

    pub fn forget_gate(&self) -> &AugmentedArray {
        &self.forget_gate
    }

    pub fn candidate(&self) -> &AugmentedArray {
        &self.candidate
    }
}

impl Cell for CfnCell {
    type Params = CfnParams;

    fn kind() -> ConnectionType {
        ConnectionType::Cfn
    }

    fn new(config: &CellConfig) -> Result<Self> {
        config.validate()?;
        let out = config.output_size;
        Ok(Self {
            activation: config.activation,
            input: AugmentedArray::new(config.input_size),
            output: AugmentedArray::new(out),
            input_gate: AugmentedArray::new(out),
            forget_gate: AugmentedArray::new(out),
            candidate: AugmentedArray::new(out),
            y_prev: None,
            prev_activated: None,
            prev_error: None,
            contribs: None,
        })
    }

    fn init_params(config: &CellConfig, rng: &mut StdRng) -> Result<CfnParams> {
        config.validate()?;
        let (out, inp) = (config.output_size, config.input_size);
        Ok(CfnParams {
            input_gate: ParameterUnit::glorot(out, inp, true, rng)?,
            forget_gate: ParameterUnit::glorot(out, inp, true, rng)?,
            candidate_weights: glorot_matrix(out, inp, rng)?,
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

    fn relevance_slots(&mut self) -> PrevSlots<'_> {
        PrevSlots {
            output: &mut self.output,
            cell: None,
        }
    }

    fn recurrent_error(&self) -> Option<&Array1<f64>> {
        self.prev_error.as_ref()
    }

    fn forward(
        &mut self,
        params: &CfnParams,
        prev: Option<PrevValues<'_>>,
        save_contributions: bool,
    ) -> Result<()> {
        self.y_prev = prev.map(|p| p.output.clone());
        let x = self.input.values()?;

        let mut s_in = params.input_gate.apply(x);
        if let Some(y_prev) = &self.y_prev {
            s_in += &params.input_gate.recurrent_term(y_prev)?;
        }
        self.input_gate.assign_values(s_in)?;
        self.input_gate.activate(ActFn::Sigmoid)?;

        self.candidate
            .assign_values(params.candidate_weights.dot(x))?;
        self.candidate.activate(self.activation)?;

        let mut y = self.input_gate.values()? * self.candidate.values()?;
        self.prev_activated = None;
        if let Some(y_prev) = &self.y_prev {
            let mut s_for = params.forget_gate.apply(x);
            s_for += &params.forget_gate.recurrent_term(y_prev)?;
            self.forget_gate.assign_values(s_for)?;
            self.forget_gate.activate(ActFn::Sigmoid)?;

            let activated_prev = self.activation.apply(y_prev);
            y += &(self.forget_gate.values()? * &activated_prev);
            self.prev_activated = Some(activated_prev);
        }
        self.contribs = if save_contributions {
            Some(CfnContribs {
                candidate: relevance::contributions(&params.candidate_weights, x),
            })
        } else {
            None
        };
        self.output.assign_values(y)
    }

    fn backward(
        &mut self,
        params: &CfnParams,
        grads: &mut CfnParams,
        next: Option<NextErrors<'_>>,
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()> {
        let gy = effective_output_error(&self.output, next.as_ref(), me_prop_k)?;
        let x = self.input.values()?;

        let g_in = &gy * self.candidate.values()? * self.input_gate.derivative(ActFn::Sigmoid)?;
        let g_cand = &gy * self.input_gate.values()? * self.candidate.derivative(self.activation)?;

        let mut input_error = params
            .input_gate
            .backward_input(&mut grads.input_gate, &g_in, x);
        grads.candidate_weights += &outer(&g_cand, x);
        input_error += &params.candidate_weights.t().dot(&g_cand);

        self.prev_error = match &self.y_prev {
            Some(y_prev) => {
                let activated_prev =
                    self.prev_activated
                        .as_ref()
                        .ok_or(RnnError::UninitializedAccess {
                            what: "activated previous output",
                        })?;
                let g_for =
                    &gy * activated_prev * self.forget_gate.derivative(ActFn::Sigmoid)?;
                input_error += &params
                    .forget_gate
                    .backward_input(&mut grads.forget_gate, &g_for, x);

                let mut injection =
                    params
                        .input_gate
                        .backward_recurrent(&mut grads.input_gate, &g_in, y_prev)?;
                injection += &params.forget_gate.backward_recurrent(
                    &mut grads.forget_gate,
                    &g_for,
                    y_prev,
                )?;
                injection +=
                    &(&gy * self.forget_gate.values()? * self.activation.derivative(y_prev));
                self.input_gate.assign_errors(g_in)?;
                self.forget_gate.assign_errors(g_for)?;
                Some(injection)
            }
            None => {
                self.input_gate.assign_errors(g_in)?;
                None
            }
        };
        self.candidate.assign_errors(g_cand)?;

        if propagate_to_input {
            self.input.assign_errors(input_error)?;
        }
        Ok(())
    }

    fn calculate_relevance(
        &mut self,
        _params: &CfnParams,
        prev: Option<PrevSlots<'_>>,
        to_previous: bool,
    ) -> Result<()> {
        let contribs = self.contribs.as_ref().ok_or(RnnError::UninitializedAccess {
            what: "saved contributions",
        })?;
        let prev = require_prev_window(prev, to_previous, self.y_prev.is_some())?;

        let out_rel = self.output.relevance()?;
        let y = self.output.values()?;
        let sources = if self.y_prev.is_some() { 2 } else { 1 };

        let candidate_term = self.input_gate.values()? * self.candidate.values()?;
        let rel_candidate = relevance::through_term(out_rel, &candidate_term, y, sources);
        let input_rel = relevance::through_contributions(
            &rel_candidate,
            &contribs.candidate,
            self.candidate.not_activated()?,
            1,
        );

        if let (Some(slots), Some(activated_prev)) = (prev, &self.prev_activated) {
            let prev_term = self.forget_gate.values()? * activated_prev;
            let rel_prev = relevance::through_term(out_rel, &prev_term, y, sources);
            slots.output.add_recurrent_relevance(&rel_prev)?;
        }

        self.candidate.assign_relevance(rel_candidate)?;
        self.input.assign_relevance(input_rel)
    }

    fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.input_gate.clear();
        self.forget_gate.clear();
        self.candidate.clear();
        self.y_prev = None;
        self.prev_activated = None;
        self.prev_error = None;
        self.contribs = None;
    }
}
