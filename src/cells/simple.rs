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

/// Parameters of the plain recurrent cell: one unit with input weights,
/// bias and recurrent weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleParams {
    pub unit: ParameterUnit,
}

impl ParamBundle for SimpleParams {
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

#[derive(Debug, Clone)]
struct SimpleContribs {
    input: Array2<f64>,
    recurrent: Option<Array2<f64>>,
}

/// The elementary recurrent cell:
///
/// ```text
/// s = W·x + b + Wrec·yPrev
/// y = f(s)
/// ```
///
/// with the recurrent term omitted at the first timestep.
#[derive(Debug, Clone)]
pub struct SimpleCell {
    activation: ActFn,
    input: AugmentedArray,
    output: AugmentedArray,
    y_prev: Option<Array1<f64>>,
    prev_error: Option<Array1<f64>>,
    contribs: Option<SimpleContribs>,
}

impl Cell for SimpleCell {
    type Params = SimpleParams;

    fn kind() -> ConnectionType {
        ConnectionType::Simple
    }

    fn new(config: &CellConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            activation: config.activation,
            input: AugmentedArray::new(config.input_size),
            output: AugmentedArray::new(config.output_size),
            y_prev: None,
            prev_error: None,
            contribs: None,
        })
    }

    fn init_params(config: &CellConfig, rng: &mut StdRng) -> Result<SimpleParams> {
        config.validate()?;
        Ok(SimpleParams {
            unit: ParameterUnit::glorot(config.output_size, config.input_size, true, rng)?,
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
        params: &SimpleParams,
        prev: Option<PrevValues<'_>>,
        save_contributions: bool,
    ) -> Result<()> {
        self.y_prev = prev.map(|p| p.output.clone());
        let x = self.input.values()?;
        let mut s = params.unit.apply(x);
        if let Some(y_prev) = &self.y_prev {
            s += &params.unit.recurrent_term(y_prev)?;
        }
        self.contribs = if save_contributions {
            let recurrent = match (&self.y_prev, &params.unit.recurrent) {
                (Some(y_prev), Some(rec)) => Some(relevance::contributions(rec, y_prev)),
                _ => None,
            };
            Some(SimpleContribs {
                input: relevance::contributions(&params.unit.weights, x),
                recurrent,
            })
        } else {
            None
        };
        self.output.assign_values(s)?;
        self.output.activate(self.activation)
    }

    fn backward(
        &mut self,
        params: &SimpleParams,
        grads: &mut SimpleParams,
        next: Option<NextErrors<'_>>,
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()> {
        let errors = effective_output_error(&self.output, next.as_ref(), me_prop_k)?;
        let delta = errors * self.output.derivative(self.activation)?;

        let input_error = params
            .unit
            .backward_input(&mut grads.unit, &delta, self.input.values()?);
        self.prev_error = match &self.y_prev {
            Some(y_prev) => Some(params.unit.backward_recurrent(&mut grads.unit, &delta, y_prev)?),
            None => None,
        };
        if propagate_to_input {
            self.input.assign_errors(input_error)?;
        }
        Ok(())
    }

    fn calculate_relevance(
        &mut self,
        params: &SimpleParams,
        prev: Option<PrevSlots<'_>>,
        to_previous: bool,
    ) -> Result<()> {
        let contribs = self.contribs.as_ref().ok_or(RnnError::UninitializedAccess {
            what: "saved contributions",
        })?;
        let prev = require_prev_window(prev, to_previous, self.y_prev.is_some())?;

        let out_rel = self.output.relevance()?;
        let s = self.output.not_activated()?;
        let sources = if self.y_prev.is_some() { 2 } else { 1 };
        let share = 1.0 / sources as f64;

        let mut c_in = contribs.input.clone();
        relevance::add_bias_share(&mut c_in, &params.unit.biases, share);
        let input_rel = relevance::through_contributions(out_rel, &c_in, s, sources);

        if let (Some(slots), Some(c_rec)) = (prev, &contribs.recurrent) {
            let mut c = c_rec.clone();
            relevance::add_bias_share(&mut c, &params.unit.biases, share);
            let prev_rel = relevance::through_contributions(out_rel, &c, s, sources);
            slots.output.add_recurrent_relevance(&prev_rel)?;
        }
        self.input.assign_relevance(input_rel)
    }

    fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.y_prev = None;
        self.prev_error = None;
        self.contribs = None;
    }
}
