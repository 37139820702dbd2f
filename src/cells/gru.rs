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

/// Gated Recurrent Unit parameters. All three units carry recurrent weights;
/// the candidate's recurrent term is applied to the reset-scaled previous
/// output rather than the previous output itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruParams {
    pub reset_gate: ParameterUnit,
    pub partition_gate: ParameterUnit,
    pub candidate: ParameterUnit,
}

impl ParamBundle for GruParams {
    fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut out = Vec::new();
        self.reset_gate.collect_tensors(&mut out);
        self.partition_gate.collect_tensors(&mut out);
        self.candidate.collect_tensors(&mut out);
        out
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut out = Vec::new();
        self.reset_gate.collect_tensors_mut(&mut out);
        self.partition_gate.collect_tensors_mut(&mut out);
        self.candidate.collect_tensors_mut(&mut out);
        out
    }
}

#[derive(Debug, Clone)]
struct GruContribs {
    input: Array2<f64>,
    recurrent: Option<Array2<f64>>,
}

/// The Gated Recurrent Unit cell:
///
/// ```text
/// r = σ(Wr·x + br + WrRec·yPrev)
/// p = σ(Wp·x + bp + WpRec·yPrev)
/// c = f(Wc·x + bc + WcRec·(r ⊙ yPrev))
/// y = p ⊙ c + (1 − p) ⊙ yPrev
/// ```
///
/// Without a previous state the gates lose their recurrent terms, the output
/// collapses to `p ⊙ c`, and the reset gate is computed but feeds nothing, so
/// it receives no error and no gradients.
#[derive(Debug, Clone)]
pub struct GruCell {
    activation: ActFn,
    input: AugmentedArray,
    output: AugmentedArray,
    reset_gate: AugmentedArray,
    partition: AugmentedArray,
    candidate: AugmentedArray,
    y_prev: Option<Array1<f64>>,
    reset_prev: Option<Array1<f64>>,
    prev_error: Option<Array1<f64>>,
    contribs: Option<GruContribs>,
}

impl GruCell {
    pub fn reset_gate(&self) -> &AugmentedArray {
        &self.reset_gate
    }

    pub fn partition(&self) -> &AugmentedArray {
        &self.partition
    }

    pub fn candidate(&self) -> &AugmentedArray {
        &self.candidate
    }
}

impl Cell for GruCell {
    type Params = GruParams;

    fn kind() -> ConnectionType {
        ConnectionType::Gru
    }

    fn new(config: &CellConfig) -> Result<Self> {
        config.validate()?;
        let out = config.output_size;
        Ok(Self {
            activation: config.activation,
            input: AugmentedArray::new(config.input_size),
            output: AugmentedArray::new(out),
            reset_gate: AugmentedArray::new(out),
            partition: AugmentedArray::new(out),
            candidate: AugmentedArray::new(out),
            y_prev: None,
            reset_prev: None,
            prev_error: None,
            contribs: None,
        })
    }

    fn init_params(config: &CellConfig, rng: &mut StdRng) -> Result<GruParams> {
        config.validate()?;
        let (out, inp) = (config.output_size, config.input_size);
        Ok(GruParams {
            reset_gate: ParameterUnit::glorot(out, inp, true, rng)?,
            partition_gate: ParameterUnit::glorot(out, inp, true, rng)?,
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
        params: &GruParams,
        prev: Option<PrevValues<'_>>,
        save_contributions: bool,
    ) -> Result<()> {
        self.y_prev = prev.map(|p| p.output.clone());
        let x = self.input.values()?;

        let mut s_reset = params.reset_gate.apply(x);
        let mut s_part = params.partition_gate.apply(x);
        if let Some(y_prev) = &self.y_prev {
            s_reset += &params.reset_gate.recurrent_term(y_prev)?;
            s_part += &params.partition_gate.recurrent_term(y_prev)?;
        }
        self.reset_gate.assign_values(s_reset)?;
        self.reset_gate.activate(ActFn::Sigmoid)?;
        self.partition.assign_values(s_part)?;
        self.partition.activate(ActFn::Sigmoid)?;

        let mut s_cand = params.candidate.apply(x);
        self.reset_prev = match &self.y_prev {
            Some(y_prev) => {
                let scaled = self.reset_gate.values()? * y_prev;
                s_cand += &params.candidate.recurrent_term(&scaled)?;
                Some(scaled)
            }
            None => None,
        };
        self.candidate.assign_values(s_cand)?;
        self.candidate.activate(self.activation)?;

        let mut y = self.partition.values()? * self.candidate.values()?;
        if let Some(y_prev) = &self.y_prev {
            let carry = self.partition.values()?.mapv(|v| 1.0 - v);
            y += &(&carry * y_prev);
        }
        self.contribs = if save_contributions {
            Some(GruContribs {
                input: relevance::contributions(&params.candidate.weights, x),
                recurrent: match (&params.candidate.recurrent, &self.reset_prev) {
                    (Some(w), Some(scaled)) => Some(relevance::contributions(w, scaled)),
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
        params: &GruParams,
        grads: &mut GruParams,
        next: Option<NextErrors<'_>>,
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()> {
        let gy = effective_output_error(&self.output, next.as_ref(), me_prop_k)?;
        let x = self.input.values()?;

        let partition_swing = match &self.y_prev {
            Some(y_prev) => self.candidate.values()? - y_prev,
            None => self.candidate.values()?.clone(),
        };
        let g_part =
            &gy * &partition_swing * self.partition.derivative(ActFn::Sigmoid)?;
        let g_cand =
            &gy * self.partition.values()? * self.candidate.derivative(self.activation)?;

        let mut input_error = params
            .partition_gate
            .backward_input(&mut grads.partition_gate, &g_part, x);
        input_error += &params
            .candidate
            .backward_input(&mut grads.candidate, &g_cand, x);

        self.prev_error = match (&self.y_prev, &self.reset_prev) {
            (Some(y_prev), Some(scaled)) => {
                let rec_back =
                    params
                        .candidate
                        .backward_recurrent(&mut grads.candidate, &g_cand, scaled)?;
                let g_reset =
                    &rec_back * y_prev * self.reset_gate.derivative(ActFn::Sigmoid)?;
                input_error += &params
                    .reset_gate
                    .backward_input(&mut grads.reset_gate, &g_reset, x);

                let mut injection = params.reset_gate.backward_recurrent(
                    &mut grads.reset_gate,
                    &g_reset,
                    y_prev,
                )?;
                injection += &params.partition_gate.backward_recurrent(
                    &mut grads.partition_gate,
                    &g_part,
                    y_prev,
                )?;
                injection += &(&rec_back * self.reset_gate.values()?);
                injection += &(&gy * &self.partition.values()?.mapv(|v| 1.0 - v));
                self.reset_gate.assign_errors(g_reset)?;
                Some(injection)
            }
            _ => None,
        };
        self.partition.assign_errors(g_part)?;
        self.candidate.assign_errors(g_cand)?;

        if propagate_to_input {
            self.input.assign_errors(input_error)?;
        }
        Ok(())
    }

    fn calculate_relevance(
        &mut self,
        params: &GruParams,
        prev: Option<PrevSlots<'_>>,
        to_previous: bool,
    ) -> Result<()> {
        let contribs = self.contribs.as_ref().ok_or(RnnError::UninitializedAccess {
            what: "saved contributions",
        })?;
        let prev = require_prev_window(prev, to_previous, self.y_prev.is_some())?;

        let out_rel = self.output.relevance()?;
        let y = self.output.values()?;
        let terms = if self.y_prev.is_some() { 2 } else { 1 };
        let cand_sources = if contribs.recurrent.is_some() { 2 } else { 1 };
        let share = 1.0 / cand_sources as f64;

        let candidate_term = self.partition.values()? * self.candidate.values()?;
        let rel_candidate = relevance::through_term(out_rel, &candidate_term, y, terms);

        let mut input_contribs = contribs.input.clone();
        relevance::add_bias_share(&mut input_contribs, &params.candidate.biases, share);
        let input_rel = relevance::through_contributions(
            &rel_candidate,
            &input_contribs,
            self.candidate.not_activated()?,
            cand_sources,
        );

        if let Some(slots) = prev {
            let y_prev = self.y_prev.as_ref().ok_or(RnnError::UninitializedAccess {
                what: "previous output snapshot",
            })?;
            let carry_term = self.partition.values()?.mapv(|v| 1.0 - v) * y_prev;
            let mut rel_prev = relevance::through_term(out_rel, &carry_term, y, terms);
            if let Some(rec) = &contribs.recurrent {
                let mut rec_contribs = rec.clone();
                relevance::add_bias_share(&mut rec_contribs, &params.candidate.biases, share);
                rel_prev += &relevance::through_contributions(
                    &rel_candidate,
                    &rec_contribs,
                    self.candidate.not_activated()?,
                    cand_sources,
                );
            }
            slots.output.add_recurrent_relevance(&rel_prev)?;
        }

        self.candidate.assign_relevance(rel_candidate)?;
        self.input.assign_relevance(input_rel)
    }

    fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.reset_gate.clear();
        self.partition.clear();
        self.candidate.clear();
        self.y_prev = None;
        self.reset_prev = None;
        self.prev_error = None;
        self.contribs = None;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn params() -> GruParams {
        let unit = |w, b, r| ParameterUnit {
            weights: w,
            biases: b,
            recurrent: Some(r),
        };
        GruParams {
            reset_gate: unit(
                array![[0.3, -0.1], [0.2, 0.5]],
                array![0.0, 0.1],
                array![[0.1, 0.2], [-0.2, 0.0]],
            ),
            partition_gate: unit(
                array![[-0.4, 0.2], [0.1, 0.3]],
                array![0.2, -0.1],
                array![[0.0, 0.15], [0.1, -0.1]],
            ),
            candidate: unit(
                array![[0.6, -0.5], [0.4, 0.7]],
                array![-0.05, 0.05],
                array![[0.3, -0.2], [0.1, 0.1]],
            ),
        }
    }

    #[test]
    fn test_output_blends_candidate_and_prev() {
        let p = params();
        let mut c = GruCell::new(&CellConfig::new(2, 2, ActFn::Tanh)).unwrap();
        let x = array![0.8, -0.3];
        let y_prev = array![0.4, -0.6];
        c.input_mut().assign_values(x).unwrap();
        c.forward(
            &p,
            Some(PrevValues {
                output: &y_prev,
                cell: None,
            }),
            false,
        )
        .unwrap();

        let part = c.partition().values().unwrap();
        let cand = c.candidate().values().unwrap();
        let got = c.output().values().unwrap();
        for i in 0..2 {
            let want = part[i] * cand[i] + (1.0 - part[i]) * y_prev[i];
            assert!((got[i] - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reset_gate_idle_without_prev() {
        let p = params();
        let mut grads = p.zeroed();
        let mut c = GruCell::new(&CellConfig::new(2, 2, ActFn::Tanh)).unwrap();
        c.input_mut().assign_values(array![0.8, -0.3]).unwrap();
        c.forward(&p, None, false).unwrap();
        c.output_mut().assign_errors(array![0.5, -0.5]).unwrap();
        c.backward(&p, &mut grads, None, true, None).unwrap();

        // the gate value exists but nothing flows through it
        assert!(c.reset_gate().values().is_ok());
        assert!(c.reset_gate().errors().is_err());
        assert!(grads.reset_gate.weights.iter().all(|&g| g == 0.0));
        assert!(c.recurrent_error().is_none());
    }
}
