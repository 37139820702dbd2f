//! Connection-type-keyed construction and dispatch of sequence processors.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::cells::{
    Cell, CellConfig, CfnCell, CfnParams, ConnectionType, DeltaCell, DeltaParams, GruCell,
    GruParams, InitHidden, LstmCell, LstmParams, LtmCell, LtmParams, RanCell, RanParams,
    SimpleCell, SimpleParams,
};
use crate::error::{Result, RnnError};
use crate::optimization::UpdateMethod;
use crate::params::ParamBundle;
use crate::processor::SequenceProcessor;

/// A sequence processor behind a connection-type key, so callers can build
/// and drive a recurrent layer without naming the cell type.
#[derive(Debug)]
pub enum RecurrentLayer {
    Simple(SequenceProcessor<SimpleCell>),
    Cfn(SequenceProcessor<CfnCell>),
    Gru(SequenceProcessor<GruCell>),
    Lstm(SequenceProcessor<LstmCell>),
    Delta(SequenceProcessor<DeltaCell>),
    Ran(SequenceProcessor<RanCell>),
    Ltm(SequenceProcessor<LtmCell>),
}

use RecurrentLayer::*;

/// Runs `body` against the concrete processor behind a layer.
///
/// Every variant carries a differently-typed processor, so one closure
/// cannot cover them all; this macro duplicates the match instead and keeps
/// the cell type statically dispatched at every call site.
macro_rules! with_processor {
    ($layer:expr, $proc:ident => $body:expr) => {
        match $layer {
            Simple($proc) => $body,
            Cfn($proc) => $body,
            Gru($proc) => $body,
            Lstm($proc) => $body,
            Delta($proc) => $body,
            Ran($proc) => $body,
            Ltm($proc) => $body,
        }
    };
}

impl RecurrentLayer {
    /// Builds the processor variant for `kind` with fresh seeded parameters.
    ///
    /// # Errors
    /// `InvalidConfig` when `kind` is not a recurrent connection, plus any
    /// configuration or initialization failure from the processor.
    pub fn new(kind: ConnectionType, config: CellConfig, seed: u64) -> Result<Self> {
        match kind {
            ConnectionType::Feedforward => Err(RnnError::InvalidConfig(
                "feedforward connections have no recurrent processor".to_string(),
            )),
            ConnectionType::Simple => Ok(Simple(SequenceProcessor::new(config, seed)?)),
            ConnectionType::Cfn => Ok(Cfn(SequenceProcessor::new(config, seed)?)),
            ConnectionType::Gru => Ok(Gru(SequenceProcessor::new(config, seed)?)),
            ConnectionType::Lstm => Ok(Lstm(SequenceProcessor::new(config, seed)?)),
            ConnectionType::Delta => Ok(Delta(SequenceProcessor::new(config, seed)?)),
            ConnectionType::Ran => Ok(Ran(SequenceProcessor::new(config, seed)?)),
            ConnectionType::Ltm => Ok(Ltm(SequenceProcessor::new(config, seed)?)),
        }
    }

    /// Rebuilds a layer around a previously exported parameter bundle.
    pub fn from_params(config: CellConfig, params: LayerParams, seed: u64) -> Result<Self> {
        match params {
            LayerParams::Simple(p) => Ok(Simple(SequenceProcessor::with_params(config, p, seed)?)),
            LayerParams::Cfn(p) => Ok(Cfn(SequenceProcessor::with_params(config, p, seed)?)),
            LayerParams::Gru(p) => Ok(Gru(SequenceProcessor::with_params(config, p, seed)?)),
            LayerParams::Lstm(p) => Ok(Lstm(SequenceProcessor::with_params(config, p, seed)?)),
            LayerParams::Delta(p) => Ok(Delta(SequenceProcessor::with_params(config, p, seed)?)),
            LayerParams::Ran(p) => Ok(Ran(SequenceProcessor::with_params(config, p, seed)?)),
            LayerParams::Ltm(p) => Ok(Ltm(SequenceProcessor::with_params(config, p, seed)?)),
        }
    }

    pub fn kind(&self) -> ConnectionType {
        match self {
            Simple(_) => ConnectionType::Simple,
            Cfn(_) => ConnectionType::Cfn,
            Gru(_) => ConnectionType::Gru,
            Lstm(_) => ConnectionType::Lstm,
            Delta(_) => ConnectionType::Delta,
            Ran(_) => ConnectionType::Ran,
            Ltm(_) => ConnectionType::Ltm,
        }
    }

    pub fn config(&self) -> &CellConfig {
        with_processor!(self, proc => proc.config())
    }

    /// A serializable copy of the layer's parameter bundle.
    pub fn export_params(&self) -> LayerParams {
        match self {
            Simple(p) => LayerParams::Simple(p.params().clone()),
            Cfn(p) => LayerParams::Cfn(p.params().clone()),
            Gru(p) => LayerParams::Gru(p.params().clone()),
            Lstm(p) => LayerParams::Lstm(p.params().clone()),
            Delta(p) => LayerParams::Delta(p.params().clone()),
            Ran(p) => LayerParams::Ran(p.params().clone()),
            Ltm(p) => LayerParams::Ltm(p.params().clone()),
        }
    }

    /// See [`SequenceProcessor::forward`].
    pub fn forward(
        &mut self,
        inputs: &[Array1<f64>],
        init: Option<&InitHidden>,
        save_contributions: bool,
        use_dropout: bool,
    ) -> Result<Vec<Array1<f64>>> {
        with_processor!(self, proc => proc.forward(inputs, init, save_contributions, use_dropout))
    }

    /// See [`SequenceProcessor::forward_step`].
    pub fn forward_step(
        &mut self,
        input: &Array1<f64>,
        first_state: bool,
        init: Option<&InitHidden>,
        save_contributions: bool,
        use_dropout: bool,
    ) -> Result<Array1<f64>> {
        with_processor!(
            self,
            proc => proc.forward_step(input, first_state, init, save_contributions, use_dropout)
        )
    }

    /// See [`SequenceProcessor::backward`].
    pub fn backward(
        &mut self,
        output_errors: &[Array1<f64>],
        propagate_to_input: bool,
    ) -> Result<()> {
        with_processor!(self, proc => proc.backward(output_errors, propagate_to_input))
    }

    /// See [`SequenceProcessor::backward_truncated`].
    pub fn backward_truncated(
        &mut self,
        output_errors: &[Array1<f64>],
        propagate_to_input: bool,
        me_prop_k: usize,
    ) -> Result<()> {
        with_processor!(
            self,
            proc => proc.backward_truncated(output_errors, propagate_to_input, me_prop_k)
        )
    }

    /// See [`SequenceProcessor::calculate_relevance`].
    pub fn calculate_relevance(
        &mut self,
        from: usize,
        to: usize,
        distribution: &Array1<f64>,
    ) -> Result<Array1<f64>> {
        with_processor!(self, proc => proc.calculate_relevance(from, to, distribution))
    }

    /// Applies one update step to the parameters, consuming the accumulated
    /// gradients.
    pub fn apply_update(&mut self, method: &mut dyn UpdateMethod) {
        with_processor!(self, proc => apply_step(proc, method))
    }

    pub fn output(&self, index: usize) -> Result<&Array1<f64>> {
        with_processor!(self, proc => proc.output(index))
    }

    pub fn input_errors(&self, index: usize) -> Result<&Array1<f64>> {
        with_processor!(self, proc => proc.input_errors(index))
    }

    pub fn sequence_len(&self) -> usize {
        with_processor!(self, proc => proc.sequence_len())
    }

    pub fn allocations(&self) -> usize {
        with_processor!(self, proc => proc.allocations())
    }

    pub fn last_state(&self) -> Option<usize> {
        with_processor!(self, proc => proc.last_state())
    }

    pub fn reset(&mut self) {
        with_processor!(self, proc => proc.reset())
    }
}

fn apply_step<C: Cell>(proc: &mut SequenceProcessor<C>, method: &mut dyn UpdateMethod) {
    let grads = proc.take_params_errors();
    let mut params = proc.params_mut().tensors_mut();
    method.update(&mut params, &grads.tensors());
}

/// The parameter bundle of one layer in exportable form, keyed like the
/// layer itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerParams {
    Simple(SimpleParams),
    Cfn(CfnParams),
    Gru(GruParams),
    Lstm(LstmParams),
    Delta(DeltaParams),
    Ran(RanParams),
    Ltm(LtmParams),
}

impl LayerParams {
    pub fn kind(&self) -> ConnectionType {
        match self {
            LayerParams::Simple(_) => ConnectionType::Simple,
            LayerParams::Cfn(_) => ConnectionType::Cfn,
            LayerParams::Gru(_) => ConnectionType::Gru,
            LayerParams::Lstm(_) => ConnectionType::Lstm,
            LayerParams::Delta(_) => ConnectionType::Delta,
            LayerParams::Ran(_) => ConnectionType::Ran,
            LayerParams::Ltm(_) => ConnectionType::Ltm,
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::activation::ActFn;
    use crate::optimization::GradientDescent;

    fn config() -> CellConfig {
        CellConfig::new(3, 3, ActFn::Tanh)
    }

    fn sequence() -> Vec<Array1<f64>> {
        vec![array![0.2, -0.5, 0.8], array![0.0, 0.4, -0.3]]
    }

    #[test]
    fn test_feedforward_kind_is_rejected() {
        let err = RecurrentLayer::new(ConnectionType::Feedforward, config(), 3).unwrap_err();
        assert_eq!(
            err,
            RnnError::InvalidConfig("feedforward connections have no recurrent processor".into())
        );
    }

    #[test]
    fn test_layer_is_debug_printable() {
        let layer = RecurrentLayer::new(ConnectionType::Gru, config(), 3).unwrap();
        assert!(format!("{layer:?}").starts_with("Gru"));
    }

    #[test]
    fn test_every_recurrent_kind_builds_and_runs() {
        let kinds = [
            ConnectionType::Simple,
            ConnectionType::Cfn,
            ConnectionType::Gru,
            ConnectionType::Lstm,
            ConnectionType::Delta,
            ConnectionType::Ran,
            ConnectionType::Ltm,
        ];
        for kind in kinds {
            let mut layer = RecurrentLayer::new(kind, config(), 3).unwrap();
            assert_eq!(layer.kind(), kind);
            let outputs = layer.forward(&sequence(), None, false, false).unwrap();
            assert_eq!(outputs.len(), 2);
            assert_eq!(outputs[1].len(), 3);
        }
    }

    #[test]
    fn test_update_step_changes_parameters() {
        let mut layer = RecurrentLayer::new(ConnectionType::Gru, config(), 5).unwrap();
        let before = layer.export_params();

        layer.forward(&sequence(), None, false, false).unwrap();
        let errors = vec![array![0.3, -0.2, 0.1], array![-0.4, 0.5, 0.2]];
        layer.backward(&errors, false).unwrap();
        layer.apply_update(&mut GradientDescent::new(0.1));

        assert_ne!(layer.export_params(), before);
    }

    #[test]
    fn test_exported_params_rebuild_the_same_layer() {
        let mut layer = RecurrentLayer::new(ConnectionType::Lstm, config(), 5).unwrap();
        let params = layer.export_params();
        assert_eq!(params.kind(), ConnectionType::Lstm);

        let mut rebuilt = RecurrentLayer::from_params(config(), params, 9).unwrap();
        let a = layer.forward(&sequence(), None, false, false).unwrap();
        let b = rebuilt.forward(&sequence(), None, false, false).unwrap();
        assert_eq!(a, b);
    }
}
