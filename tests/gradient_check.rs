//! Finite-difference checks of every cell's analytic parameter gradients.

mod common;

use common::{check_gradients, init_logs, reference_inputs};
use ndarray::{array, Array1};
use rnn_core::cells::{CfnCell, DeltaCell, GruCell, LstmCell, LtmCell, RanCell, SimpleCell};
use rnn_core::{ActFn, CellConfig, InitHidden};

fn single_input() -> Vec<Array1<f64>> {
    vec![array![0.9, -0.4, 0.3, -0.8]]
}

fn square_inputs() -> Vec<Array1<f64>> {
    vec![
        array![0.6, -0.3, 0.8],
        array![-0.4, 0.7, 0.2],
        array![0.1, -0.9, 0.5],
    ]
}

fn init_hidden() -> InitHidden {
    InitHidden::new(array![0.3, -0.2, 0.5])
}

fn init_hidden_with_cell() -> InitHidden {
    InitHidden::with_cell(array![0.3, -0.2, 0.5], array![-0.1, 0.4, 0.2])
}

#[test]
fn simple_gradients_match_finite_differences() {
    init_logs();
    check_gradients::<SimpleCell>(CellConfig::new(4, 3, ActFn::Tanh), 42, &reference_inputs(), None);
}

#[test]
fn simple_single_step_gradients() {
    check_gradients::<SimpleCell>(CellConfig::new(4, 3, ActFn::Tanh), 43, &single_input(), None);
}

#[test]
fn simple_gradients_with_initial_hidden() {
    check_gradients::<SimpleCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        44,
        &reference_inputs(),
        Some(&init_hidden()),
    );
}

#[test]
fn simple_gradients_with_a_numeric_derivative() {
    // Gelu has no optimized derivative, so this walks the plain df path.
    check_gradients::<SimpleCell>(CellConfig::new(4, 3, ActFn::Gelu), 45, &reference_inputs(), None);
}

#[test]
fn cfn_gradients_match_finite_differences() {
    check_gradients::<CfnCell>(CellConfig::new(4, 3, ActFn::Tanh), 46, &reference_inputs(), None);
}

#[test]
fn cfn_single_step_gradients() {
    check_gradients::<CfnCell>(CellConfig::new(4, 3, ActFn::Tanh), 47, &single_input(), None);
}

#[test]
fn cfn_gradients_with_initial_hidden() {
    check_gradients::<CfnCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        48,
        &reference_inputs(),
        Some(&init_hidden()),
    );
}

#[test]
fn gru_gradients_match_finite_differences() {
    check_gradients::<GruCell>(CellConfig::new(4, 3, ActFn::Tanh), 49, &reference_inputs(), None);
}

#[test]
fn gru_single_step_gradients() {
    check_gradients::<GruCell>(CellConfig::new(4, 3, ActFn::Tanh), 50, &single_input(), None);
}

#[test]
fn gru_gradients_with_initial_hidden() {
    check_gradients::<GruCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        51,
        &reference_inputs(),
        Some(&init_hidden()),
    );
}

#[test]
fn lstm_gradients_match_finite_differences() {
    check_gradients::<LstmCell>(CellConfig::new(4, 3, ActFn::Tanh), 52, &reference_inputs(), None);
}

#[test]
fn lstm_single_step_gradients() {
    check_gradients::<LstmCell>(CellConfig::new(4, 3, ActFn::Tanh), 53, &single_input(), None);
}

#[test]
fn lstm_gradients_with_an_initial_cell_state() {
    check_gradients::<LstmCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        54,
        &reference_inputs(),
        Some(&init_hidden_with_cell()),
    );
}

#[test]
fn delta_gradients_match_finite_differences() {
    check_gradients::<DeltaCell>(CellConfig::new(4, 3, ActFn::Tanh), 55, &reference_inputs(), None);
}

#[test]
fn delta_single_step_gradients() {
    check_gradients::<DeltaCell>(CellConfig::new(4, 3, ActFn::Tanh), 56, &single_input(), None);
}

#[test]
fn delta_gradients_with_initial_hidden() {
    check_gradients::<DeltaCell>(
        CellConfig::new(4, 3, ActFn::Tanh),
        61,
        &reference_inputs(),
        Some(&init_hidden()),
    );
}

#[test]
fn ran_gradients_match_finite_differences() {
    check_gradients::<RanCell>(
        CellConfig::new(4, 3, ActFn::LecunTanh),
        57,
        &reference_inputs(),
        None,
    );
}

#[test]
fn ran_single_step_gradients() {
    check_gradients::<RanCell>(
        CellConfig::new(4, 3, ActFn::LecunTanh),
        58,
        &single_input(),
        None,
    );
}

#[test]
fn ran_gradients_with_initial_hidden() {
    check_gradients::<RanCell>(
        CellConfig::new(4, 3, ActFn::LecunTanh),
        62,
        &reference_inputs(),
        Some(&init_hidden()),
    );
}

#[test]
fn ltm_gradients_match_finite_differences() {
    check_gradients::<LtmCell>(CellConfig::new(3, 3, ActFn::Sigmoid), 59, &square_inputs(), None);
}

#[test]
fn ltm_single_step_gradients() {
    check_gradients::<LtmCell>(
        CellConfig::new(3, 3, ActFn::Sigmoid),
        63,
        &square_inputs()[..1],
        None,
    );
}

#[test]
fn ltm_gradients_with_an_initial_cell_state() {
    check_gradients::<LtmCell>(
        CellConfig::new(3, 3, ActFn::Sigmoid),
        60,
        &square_inputs(),
        Some(&init_hidden_with_cell()),
    );
}
