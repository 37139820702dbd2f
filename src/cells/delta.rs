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
use crate::params::{ParamBundle, ParameterUnit, glorot_vector, outer};
use crate::relevance;

/// DeltaRNN parameters. A single unit holds the feed-forward weights, the
/// candidate biases and the recurrent weights; the partition gate has its own
/// biases but reuses the feed-forward projection. `alpha`, `beta1` and
/// `beta2` scale the second-order and first-order mixing terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaParams {
    pub unit: ParameterUnit,
    pub partition_biases: Array1<f64>,
    pub alpha: Array1<f64>,
    pub beta1: Array1<f64>,
    pub beta2: Array1<f64>,
}

impl ParamBundle for DeltaParams {
    fn tensors(&self) -> Vec<ArrayViewD<'_, f64>> {
        let mut out = Vec::new();
        self.unit.collect_tensors(&mut out);
        out.push(self.partition_biases.view().into_dyn());
        out.push(self.alpha.view().into_dyn());
        out.push(self.beta1.view().into_dyn());
        out.push(self.beta2.view().into_dyn());
        out
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut out = Vec::new();
        self.unit.collect_tensors_mut(&mut out);
        out.push(self.partition_biases.view_mut().into_dyn());
        out.push(self.alpha.view_mut().into_dyn());
        out.push(self.beta1.view_mut().into_dyn());
        out.push(self.beta2.view_mut().into_dyn());
        out
    }
}

#[derive(Debug, Clone)]
struct DeltaContribs {
    input: Array2<f64>,
    recurrent: Option<Array2<f64>>,
    d1_input: Array1<f64>,
    d1_rec: Option<Array1<f64>>,
    d2: Option<Array1<f64>>,
}

/// The DeltaRNN cell:
///
/// ```text
/// wx    = W·x
/// wyRec = WRec·yPrev
/// d1    = β1 ⊙ wx + β2 ⊙ wyRec + bc
/// d2    = α ⊙ wx ⊙ wyRec
/// c     = tanh(d1 + d2)
/// p     = σ(wx + bp)
/// y     = f(p ⊙ c + (1 − p) ⊙ yPrev)
/// ```
///
/// The candidate and partition activations are fixed; the configured
/// activation shapes only the blended output. Both projections are shared
/// between the candidate and the partition, so their gradients join on the
/// way back to `W`. The `wx` and `wyRec` projections are retained across the
/// forward pass because backward and relevance both re-read them.
#[derive(Debug, Clone)]
pub struct DeltaCell {
    activation: ActFn,
    input: AugmentedArray,
    output: AugmentedArray,
    wx: AugmentedArray,
    wy_rec: AugmentedArray,
    candidate: AugmentedArray,
    partition: AugmentedArray,
    y_prev: Option<Array1<f64>>,
    prev_error: Option<Array1<f64>>,
    contribs: Option<DeltaContribs>,
}

impl DeltaCell {
    pub fn candidate(&self) -> &AugmentedArray {
        &self.candidate
    }

    pub fn partition(&self) -> &AugmentedArray {
        &self.partition
    }

    pub fn input_projection(&self) -> &AugmentedArray {
        &self.wx
    }

    pub fn recurrent_projection(&self) -> &AugmentedArray {
        &self.wy_rec
    }
}

impl Cell for DeltaCell {
    type Params = DeltaParams;

    fn kind() -> ConnectionType {
        ConnectionType::Delta
    }

    fn new(config: &CellConfig) -> Result<Self> {
        config.validate()?;
        let out = config.output_size;
        Ok(Self {
            activation: config.activation,
            input: AugmentedArray::new(config.input_size),
            output: AugmentedArray::new(out),
            wx: AugmentedArray::new(out),
            wy_rec: AugmentedArray::new(out),
            candidate: AugmentedArray::new(out),
            partition: AugmentedArray::new(out),
            y_prev: None,
            prev_error: None,
            contribs: None,
        })
    }

    fn init_params(config: &CellConfig, rng: &mut StdRng) -> Result<DeltaParams> {
        config.validate()?;
        let (out, inp) = (config.output_size, config.input_size);
        Ok(DeltaParams {
            unit: ParameterUnit::glorot(out, inp, true, rng)?,
            partition_biases: Array1::zeros(out),
            alpha: glorot_vector(out, rng)?,
            beta1: glorot_vector(out, rng)?,
            beta2: glorot_vector(out, rng)?,
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
        params: &DeltaParams,
        prev: Option<PrevValues<'_>>,
        save_contributions: bool,
    ) -> Result<()> {
        self.y_prev = prev.map(|p| p.output.clone());
        let x = self.input.values()?;

        let wx = params.unit.weights.dot(x);
        let mut cand_pre = &params.beta1 * &wx + &params.unit.biases;
        let wy = match &self.y_prev {
            Some(y_prev) => {
                let wy = params.unit.recurrent_term(y_prev)?;
                cand_pre += &(&params.beta2 * &wy);
                cand_pre += &(&params.alpha * &(&wx * &wy));
                Some(wy)
            }
            None => None,
        };
        self.candidate.assign_values(cand_pre)?;
        self.candidate.activate(ActFn::Tanh)?;
        self.partition.assign_values(&wx + &params.partition_biases)?;
        self.partition.activate(ActFn::Sigmoid)?;

        let mut y_pre = self.partition.values()? * self.candidate.values()?;
        if let Some(y_prev) = &self.y_prev {
            let carry = self.partition.values()?.mapv(|v| 1.0 - v);
            y_pre += &(&carry * y_prev);
        }
        self.contribs = if save_contributions {
            Some(DeltaContribs {
                input: relevance::contributions(&params.unit.weights, x),
                recurrent: match (&params.unit.recurrent, &self.y_prev) {
                    (Some(w), Some(y_prev)) => Some(relevance::contributions(w, y_prev)),
                    _ => None,
                },
                d1_input: &params.beta1 * &wx,
                d1_rec: wy.as_ref().map(|wy| &params.beta2 * wy),
                d2: wy.as_ref().map(|wy| &params.alpha * &(&wx * wy)),
            })
        } else {
            None
        };
        self.wx.assign_values(wx)?;
        if let Some(wy) = wy {
            self.wy_rec.assign_values(wy)?;
        }
        self.output.assign_values(y_pre)?;
        self.output.activate(self.activation)
    }

    fn backward(
        &mut self,
        params: &DeltaParams,
        grads: &mut DeltaParams,
        next: Option<NextErrors<'_>>,
        propagate_to_input: bool,
        me_prop_k: Option<usize>,
    ) -> Result<()> {
        let gy = effective_output_error(&self.output, next.as_ref(), me_prop_k)?;
        let x = self.input.values()?;

        let g_pre = &gy * &self.output.derivative(self.activation)?;
        let g_cand = &g_pre * self.partition.values()? * self.candidate.derivative(ActFn::Tanh)?;
        let partition_swing = match &self.y_prev {
            Some(y_prev) => self.candidate.values()? - y_prev,
            None => self.candidate.values()?.clone(),
        };
        let g_part = &g_pre * &partition_swing * self.partition.derivative(ActFn::Sigmoid)?;

        let mut g_wx = &params.beta1 * &g_cand + &g_part;
        grads.unit.biases += &g_cand;
        grads.partition_biases += &g_part;
        grads.beta1 += &(&g_cand * self.wx.values()?);

        self.prev_error = match &self.y_prev {
            Some(y_prev) => {
                let wx = self.wx.values()?;
                let wy = self.wy_rec.values()?;
                g_wx += &(&params.alpha * wy * &g_cand);
                let g_wy = &params.beta2 * &g_cand + &params.alpha * wx * &g_cand;
                grads.beta2 += &(&g_cand * wy);
                grads.alpha += &(&g_cand * &(wx * wy));

                let mut injection =
                    params.unit.backward_recurrent(&mut grads.unit, &g_wy, y_prev)?;
                injection += &(&g_pre * &self.partition.values()?.mapv(|v| 1.0 - v));
                self.wy_rec.assign_errors(g_wy)?;
                Some(injection)
            }
            None => None,
        };

        grads.unit.weights += &outer(&g_wx, x);
        let input_error = params.unit.weights.t().dot(&g_wx);
        self.wx.assign_errors(g_wx)?;
        self.candidate.assign_errors(g_cand)?;
        self.partition.assign_errors(g_part)?;

        if propagate_to_input {
            self.input.assign_errors(input_error)?;
        }
        Ok(())
    }

    fn calculate_relevance(
        &mut self,
        params: &DeltaParams,
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

        let gate_term = self.partition.values()? * self.candidate.values()?;
        let rel_candidate = relevance::through_term(out_rel, &gate_term, y_pre, terms);

        // the candidate summation has up to three sources (d1 input, d1
        // recurrent, d2 cross term) and the bias is shared across them
        let cand_pre = self.candidate.not_activated()?;
        let cand_sources = if self.y_prev.is_some() { 3 } else { 1 };
        let bias_share = params.unit.biases.mapv(|b| b / cand_sources as f64);
        let rel_d1_input = relevance::through_term(
            &rel_candidate,
            &(&contribs.d1_input + &bias_share),
            cand_pre,
            cand_sources,
        );

        let rel_wx = match (&contribs.d1_rec, &contribs.d2) {
            (Some(d1_rec), Some(d2)) => {
                let rel_d1_rec = relevance::through_term(
                    &rel_candidate,
                    &(d1_rec + &bias_share),
                    cand_pre,
                    cand_sources,
                );
                let rel_d2 = relevance::through_term(
                    &rel_candidate,
                    &(d2 + &bias_share),
                    cand_pre,
                    cand_sources,
                );
                // the cross term involves both projections equally
                let half = rel_d2.mapv(|v| 0.5 * v);
                let rel_wy = rel_d1_rec + &half;

                if let Some(slots) = prev {
                    let rec = contribs
                        .recurrent
                        .as_ref()
                        .ok_or(RnnError::UninitializedAccess {
                            what: "saved contributions",
                        })?;
                    let y_prev = self.y_prev.as_ref().ok_or(RnnError::UninitializedAccess {
                        what: "previous output snapshot",
                    })?;
                    let carry_term = self.partition.values()?.mapv(|v| 1.0 - v) * y_prev;
                    let mut rel_prev =
                        relevance::through_term(out_rel, &carry_term, y_pre, terms);
                    rel_prev += &relevance::through_contributions(
                        &rel_wy,
                        rec,
                        self.wy_rec.values()?,
                        1,
                    );
                    slots.output.add_recurrent_relevance(&rel_prev)?;
                }
                self.wy_rec.assign_relevance(rel_wy)?;
                rel_d1_input + &half
            }
            _ => rel_d1_input,
        };

        let input_rel =
            relevance::through_contributions(&rel_wx, &contribs.input, self.wx.values()?, 1);
        self.wx.assign_relevance(rel_wx)?;
        self.candidate.assign_relevance(rel_candidate)?;
        self.input.assign_relevance(input_rel)
    }

    fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.wx.clear();
        self.wy_rec.clear();
        self.candidate.clear();
        self.partition.clear();
        self.y_prev = None;
        self.prev_error = None;
        self.contribs = None;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, array};

    use super::*;

    fn reference_params() -> DeltaParams {
        DeltaParams {
            unit: ParameterUnit {
                weights: array![
                    [0.5, 0.6, -0.8, -0.6],
                    [0.7, -0.4, 0.1, -0.8],
                    [0.7, -0.7, 0.3, 0.5],
                    [0.8, -0.9, 0.0, -0.1],
                    [0.4, 1.0, -0.7, 0.8]
                ],
                biases: array![0.4, 0.0, -0.3, 0.8, -0.4],
                recurrent: Some(Array2::zeros((5, 5))),
            },
            partition_biases: array![0.9, -0.5, 0.4, -0.8, 0.2],
            alpha: Array1::zeros(5),
            beta1: array![-0.3, -0.4, -0.4, -0.4, -0.4],
            beta2: Array1::zeros(5),
        }
    }

    fn reference_cell() -> DeltaCell {
        let mut cell = DeltaCell::new(&CellConfig::new(4, 5, ActFn::Tanh)).unwrap();
        cell.input_mut()
            .assign_values(array![-0.8, -0.9, -0.9, 1.0])
            .unwrap();
        cell
    }

    #[test]
    fn test_reference_forward_values() {
        let params = reference_params();
        let mut cell = reference_cell();
        cell.forward(&params, None, false).unwrap();

        let candidate = [0.568971, 0.410323, -0.39693, 0.648091, -0.449441];
        let partition = [0.519989, 0.169384, 0.668188, 0.325195, 0.601088];
        let output = [0.287518, 0.06939, -0.259175, 0.20769, -0.263768];
        for i in 0..5 {
            assert!((cell.candidate().values().unwrap()[i] - candidate[i]).abs() < 1e-6);
            assert!((cell.partition().values().unwrap()[i] - partition[i]).abs() < 1e-6);
            assert!((cell.output().values().unwrap()[i] - output[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_reference_backward_candidate_errors() {
        let params = reference_params();
        let mut grads = params.zeroed();
        let mut cell = reference_cell();
        cell.forward(&params, None, false).unwrap();

        let target = array![0.57, 0.75, -0.15, 1.64, 0.45];
        let error = cell.output().values().unwrap() - &target;
        cell.output_mut().assign_errors(error).unwrap();
        cell.backward(&params, &mut grads, None, true, None).unwrap();

        let expected = [-0.091124, -0.095413, -0.057328, -0.258489, -0.318553];
        let got = cell.candidate().errors().unwrap();
        for i in 0..5 {
            assert!((got[i] - expected[i]).abs() < 1e-6);
        }
        assert_eq!(cell.input().errors().unwrap().len(), 4);
    }

    #[test]
    fn test_partition_blends_toward_prev() {
        let params = reference_params();
        let mut cell = reference_cell();
        let y_prev = array![0.1, -0.2, 0.3, 0.0, 0.25];
        cell.forward(
            &params,
            Some(PrevValues {
                output: &y_prev,
                cell: None,
            }),
            false,
        )
        .unwrap();

        let p = cell.partition().values().unwrap();
        let c = cell.candidate().values().unwrap();
        let got = cell.output().values().unwrap();
        for i in 0..5 {
            let want = (p[i] * c[i] + (1.0 - p[i]) * y_prev[i]).tanh();
            assert!((got[i] - want).abs() < 1e-12);
        }
    }
}
