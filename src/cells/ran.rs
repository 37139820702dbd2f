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

/// Recurrent Additive Network parameters: two recurrent gate units and a
/// non-recurrent content projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RanParams {
    pub input_gate: ParameterUnit,
    pub forget_gate: ParameterUnit,
    pub content: ParameterUnit,
}

impl ParamBundle for RanParams {
    fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut out = Vec::new();
        self.input_gate.collect_tensors(&mut out);
        self.forget_gate.collect_tensors(&mut out);
        self.content.collect_tensors(&mut out);
        out
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut out = Vec::new();
        self.input_gate.collect_tensors_mut(&mut out);
        self.forget_gate.collect_tensors_mut(&mut out);
        self.content.collect_tensors_mut(&mut out);
        out
    }
}

#[derive(Debug, Clone)]
struct RanContribs {
    content: Array2<f64>,
}

/// The Recurrent Additive Network cell:
///
/// ```text
/// inG  = σ(Wi·x + bi + WiRec·yPrev)
/// forG = σ(Wf·x + bf + WfRec·yPrev)
/// c    = Wc·x + bc
/// y    = f(inG ⊙ c + forG ⊙ yPrev)
/// ```
///
/// The content projection stays linear; only the blended accumulation is
/// activated. Without a previous state the forget path never forms.
#[derive(Debug, Clone)]
pub struct RanCell {
    activation: ActFn,
    input: AugmentedArray,
    output: AugmentedArray,
    input_gate: AugmentedArray,
    forget_gate: AugmentedArray,
    content: AugmentedArray,
    y_prev: Option<Array1<f64>>,
    prev_error: Option<Array1<f64>>,
    contribs: Option<RanContribs>,
}

impl RanCell {
    pub fn input_gate(&self) -> &AugmentedArray {
        &self.input_gate
    }

    pub fn forget_gate(&self) -> &AugmentedArray {
        &self.forget_gate
    }

    pub fn content(&self) -> &AugmentedArray {
        &self.content
    }
}

impl Cell for RanCell {
    type Params = RanParams;

    fn kind() -> ConnectionType {
        ConnectionType::Ran
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
            content: AugmentedArray::new(out),
            y_prev: None,
            prev_error: None,
            contribs: None,
        })
    }

    fn init_params(config: &CellConfig, rng: &mut StdRng) -> Result<RanParams> {
        config.validate()?;
        let (out, inp) = (config.output_size, config.input_size);
        Ok(RanParams {
            input_gate: ParameterUnit::glorot(out, inp, true, rng)?,
            forget_gate: ParameterUnit::glorot(out, inp, true, rng)?,
            content: ParameterUnit::glorot(out, inp, false, rng)?,
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
        params: &RanParams,
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
        self.content.assign_values(params.content.apply(x))?;

        let mut y_pre = self.input_gate.values()? * self.content.values()?;
        if let Some(y_prev) = &self.y_prev {
            let mut s_for = params.forget_gate.apply(x);
            s_for += &params.forget_gate.recurrent_term(y_prev)?;
            self.forget_gate.assign_values(s_for)?;
            self.forget_gate.activate(ActFn::Sigmoid)?;
            y_pre += &(self.forget_gate.values()? * y_prev);
        }
        self.contribs = if save_contributions {
            Some(RanContribs {
                content: relevance::contributions(&params.content.weights, x),
            })
        } else {
            None
        };
        self.output.assign_values(y_pre)?;
        self.output.activate(self.activation)
    }

    fn backward(
        &mut self,
        params: &RanParams,
        grads: &mut RanParams,
        next: Option<NextErrors<'_>>,
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()> {
        let gy = effective_output_error(&self.output, next.as_ref(), me_prop_k)?;
        let x = self.input.values()?;

        let g_pre = &gy * &self.output.derivative(self.activation)?;
        let g_in =
            &g_pre * self.content.values()? * self.input_gate.derivative(ActFn::Sigmoid)?;
        let g_content = &g_pre * self.input_gate.values()?;

        let mut input_error = params
            .input_gate
            .backward_input(&mut grads.input_gate, &g_in, x);
        input_error += &params
            .content
            .backward_input(&mut grads.content, &g_content, x);

        self.prev_error = match &self.y_prev {
            Some(y_prev) => {
                let g_for =
                    &g_pre * y_prev * self.forget_gate.derivative(ActFn::Sigmoid)?;
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
                injection += &(&g_pre * self.forget_gate.values()?);
                self.forget_gate.assign_errors(g_for)?;
                Some(injection)
            }
            None => None,
        };
        self.input_gate.assign_errors(g_in)?;
        self.content.assign_errors(g_content)?;

        if propagate_to_input {
            self.input.assign_errors(input_error)?;
        }
        Ok(())
    }

    fn calculate_relevance(
        &mut self,
        params: &RanParams,
        prev: Option<PrevSlots<'_>>,
        to_previous: bool,
    ) -> Result<()> {
        let contribs = self.contribs.as_ref().ok_or(RnnError::UninitializedAccess {
            what: "saved contributions",
        })?;
        let prev = require_prev_window(prev, to_previous, self.y_prev.is_some())?;

        let out_rel = self.output.relevance()?;
        let y_pre = self.output.not_activated()?;
        let terms = if self.y_prev.is_some() { 2 } else { 1 };

        let content_term = self.input_gate.values()? * self.content.values()?;
        let rel_content = relevance::through_term(out_rel, &content_term, y_pre, terms);

        // the content is its own summation, so its full bias rides along
        let mut content_contribs = contribs.content.clone();
        relevance::add_bias_share(&mut content_contribs, &params.content.biases, 1.0);
        let input_rel = relevance::through_contributions(
            &rel_content,
            &content_contribs,
            self.content.values()?,
            1,
        );

        if let Some(slots) = prev {
            let y_prev = self.y_prev.as_ref().ok_or(RnnError::UninitializedAccess {
                what: "previous output snapshot",
            })?;
            let prev_term = self.forget_gate.values()? * y_prev;
            let rel_prev = relevance::through_term(out_rel, &prev_term, y_pre, terms);
            slots.output.add_recurrent_relevance(&rel_prev)?;
        }

        self.content.assign_relevance(rel_content)?;
        self.input.assign_relevance(input_rel)
    }

    fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.input_gate.clear();
        self.forget_gate.clear();
        self.content.clear();
        self.y_prev = None;
        self.prev_error = None;
        self.contribs = None;
    }
}
