//! Relevance-walk behavior across cell types.

mod common;

use common::{
    assert_close, patterned_matrix, patterned_vector, reference_inputs, simple_reference_params,
};
use ndarray::{array, Array1};
use rnn_core::cells::{
    CfnCell, DeltaCell, DeltaParams, GruCell, LstmCell, LstmParams, LtmCell, RanCell, SimpleCell,
};
use rnn_core::{ActFn, Cell, CellConfig, ParameterUnit, RnnError, SequenceProcessor};

fn patterned_unit(output: usize, input: usize, phase: usize) -> ParameterUnit {
    ParameterUnit {
        weights: patterned_matrix(output, input, phase),
        biases: patterned_vector(output, phase + 1),
        recurrent: Some(patterned_matrix(output, output, phase + 2)),
    }
}

/// A state without a previous neighbor splits its output relevance without
/// losing any of it, whatever the cell type.
fn single_step_conservation<C: Cell>(config: CellConfig, input: Array1<f64>) {
    let mut proc: SequenceProcessor<C> = SequenceProcessor::new(config, 17).unwrap();
    let dist = array![0.4, 0.35, 0.25];
    proc.forward(&[input], None, true, false).unwrap();
    let rel = proc.calculate_relevance(0, 0, &dist).unwrap();
    assert!(
        (rel.sum() - dist.sum()).abs() < 1e-9,
        "leaked relevance: total {}",
        rel.sum()
    );
}

fn walk_two_steps<C: Cell>(config: CellConfig, inputs: Vec<Array1<f64>>) {
    let input_size = config.input_size;
    let n = config.output_size;
    let mut proc: SequenceProcessor<C> = SequenceProcessor::new(config, 23).unwrap();
    proc.forward(&inputs, None, true, false).unwrap();
    let dist = Array1::from_elem(n, 1.0 / n as f64);
    let rel = proc.calculate_relevance(0, 1, &dist).unwrap();
    assert_eq!(rel.len(), input_size);
    assert!(rel.iter().all(|v| v.is_finite()));
}

#[test]
fn simple_single_step_relevance_is_conserved() {
    single_step_conservation::<SimpleCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        array![0.9, -0.4, 0.3, -0.8],
    );
}

#[test]
fn cfn_single_step_relevance_is_conserved() {
    single_step_conservation::<CfnCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        array![0.9, -0.4, 0.3, -0.8],
    );
}

#[test]
fn gru_single_step_relevance_is_conserved() {
    single_step_conservation::<GruCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        array![0.9, -0.4, 0.3, -0.8],
    );
}

#[test]
fn lstm_single_step_relevance_is_conserved() {
    single_step_conservation::<LstmCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        array![0.9, -0.4, 0.3, -0.8],
    );
}

#[test]
fn delta_single_step_relevance_is_conserved() {
    single_step_conservation::<DeltaCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        array![0.9, -0.4, 0.3, -0.8],
    );
}

#[test]
fn ran_single_step_relevance_is_conserved() {
    single_step_conservation::<RanCell>(
        CellConfig::new(4, 3, ActFn::LecunTanh),
        array![0.9, -0.4, 0.3, -0.8],
    );
}

#[test]
fn ltm_single_step_relevance_is_conserved() {
    single_step_conservation::<LtmCell>(
        CellConfig::new(3, 3, ActFn::Sigmoid),
        array![0.6, -0.3, 0.8],
    );
}

#[test]
fn simple_walk_yields_expected_input_relevance() {
    let mut proc: SequenceProcessor<SimpleCell> =
        SequenceProcessor::new(CellConfig::new(4, 3, ActFn::Tanh), 1).unwrap();
    proc.set_params(simple_reference_params());
    proc.forward(&reference_inputs(), None, true, false).unwrap();

    let rel_first = proc
        .calculate_relevance(0, 1, &array![0.4, 0.35, 0.25])
        .unwrap();
    assert_close(
        &rel_first,
        &array![0.506690168017, 2.339729630488, 0.960025714004, -3.072005084454],
        1e-9,
    );
    let walked = proc.state(1).unwrap();
    assert_close(
        walked.input().relevance().unwrap(),
        &array![0.277850843697, 1.274286749005, -1.469862534750, 0.284301929974],
        1e-9,
    );
}

#[test]
fn lstm_walk_routes_relevance_through_the_cell_chain() {
    let mut proc: SequenceProcessor<LstmCell> =
        SequenceProcessor::new(CellConfig::new(3, 2, ActFn::Tanh), 1).unwrap();
    proc.set_params(LstmParams {
        input_gate: patterned_unit(2, 3, 0),
        output_gate: patterned_unit(2, 3, 3),
        forget_gate: patterned_unit(2, 3, 6),
        candidate: patterned_unit(2, 3, 9),
    });
    let inputs = vec![array![0.6, -0.3, 0.8], array![-0.4, 0.7, 0.2]];
    proc.forward(&inputs, None, true, false).unwrap();

    let rel_first = proc.calculate_relevance(0, 1, &array![0.55, 0.45]).unwrap();
    assert_close(
        &rel_first,
        &array![0.408106976862, 0.442771914740, 0.745333103710],
        1e-9,
    );
    assert_close(
        proc.state(1).unwrap().input().relevance().unwrap(),
        &array![-0.116947572797, -0.808116093355, 0.384035762780],
        1e-9,
    );
}

#[test]
fn delta_walk_splits_relevance_across_its_terms() {
    let mut proc: SequenceProcessor<DeltaCell> =
        SequenceProcessor::new(CellConfig::new(4, 3, ActFn::Tanh), 1).unwrap();
    proc.set_params(DeltaParams {
        unit: patterned_unit(3, 4, 0),
        partition_biases: patterned_vector(3, 3),
        alpha: patterned_vector(3, 4),
        beta1: patterned_vector(3, 5),
        beta2: patterned_vector(3, 6),
    });
    let inputs = vec![array![0.5, -0.6, 0.3, 0.9], array![-0.8, 0.2, 0.7, -0.1]];
    proc.forward(&inputs, None, true, false).unwrap();

    let rel_first = proc.calculate_relevance(0, 1, &array![0.2, 0.5, 0.3]).unwrap();
    assert_close(
        &rel_first,
        &array![2.472898810492, -0.509682308372, -0.261664377424, -3.353155157695],
        1e-9,
    );
    assert_close(
        proc.state(1).unwrap().input().relevance().unwrap(),
        &array![1.751450292792, -0.982288677320, 2.226833631525, 0.029619770496],
        1e-9,
    );
}

#[test]
fn cfn_walk_promotes_relevance_to_the_earlier_state() {
    walk_two_steps::<CfnCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        reference_inputs()[..2].to_vec(),
    );
}

#[test]
fn gru_walk_promotes_relevance_to_the_earlier_state() {
    walk_two_steps::<GruCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        reference_inputs()[..2].to_vec(),
    );
}

#[test]
fn ran_walk_promotes_relevance_to_the_earlier_state() {
    walk_two_steps::<RanCell>(
        CellConfig::new(4, 3, ActFn::LecunTanh),
        reference_inputs()[..2].to_vec(),
    );
}

#[test]
fn ltm_walk_promotes_relevance_to_the_earlier_state() {
    walk_two_steps::<LtmCell>(
        CellConfig::new(3, 3, ActFn::Sigmoid),
        vec![array![0.6, -0.3, 0.8], array![-0.4, 0.7, 0.2]],
    );
}

#[test]
fn relevance_requires_saved_contributions() {
    let mut proc: SequenceProcessor<SimpleCell> =
        SequenceProcessor::new(CellConfig::new(4, 3, ActFn::Tanh), 2).unwrap();
    proc.forward(&reference_inputs(), None, false, false).unwrap();
    let err = proc
        .calculate_relevance(0, 2, &array![0.4, 0.35, 0.25])
        .unwrap_err();
    assert!(matches!(
        err,
        RnnError::UninitializedAccess {
            what: "saved contributions"
        }
    ));
}

#[test]
fn walk_stops_at_the_requested_first_state() {
    let mut proc: SequenceProcessor<SimpleCell> =
        SequenceProcessor::new(CellConfig::new(4, 3, ActFn::Tanh), 2).unwrap();
    proc.set_params(simple_reference_params());
    proc.forward(&reference_inputs(), None, true, false).unwrap();
    proc.calculate_relevance(1, 2, &array![0.4, 0.35, 0.25])
        .unwrap();

    // Nothing may spill past the boundary into the first state.
    let first = proc.state(0).unwrap();
    assert!(first.output().recurrent_relevance().is_err());
}

#[test]
fn repeated_walks_after_a_fresh_forward_agree() {
    let mut proc: SequenceProcessor<SimpleCell> =
        SequenceProcessor::new(CellConfig::new(4, 3, ActFn::Tanh), 2).unwrap();
    proc.set_params(simple_reference_params());
    let dist = array![0.4, 0.35, 0.25];

    proc.forward(&reference_inputs(), None, true, false).unwrap();
    let first = proc.calculate_relevance(0, 2, &dist).unwrap();
    proc.forward(&reference_inputs(), None, true, false).unwrap();
    let second = proc.calculate_relevance(0, 2, &dist).unwrap();

    assert_eq!(first, second);
}
