#![allow(dead_code)]

//! Shared fixtures and the finite-difference harness.

use ndarray::{array, Array1, Array2};

use rnn_core::cells::{Cell, SimpleParams};
use rnn_core::{CellConfig, InitHidden, ParamBundle, ParameterUnit, SequenceProcessor};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Matrix with a fixed value pattern, for fixtures that must not depend on
/// the RNG.
pub fn patterned_matrix(rows: usize, cols: usize, phase: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        ((i * 7 + j * 3 + phase) % 11) as f64 / 10.0 - 0.5
    })
}

pub fn patterned_vector(len: usize, phase: usize) -> Array1<f64> {
    Array1::from_shape_fn(len, |i| ((i * 5 + phase) % 11) as f64 / 10.0 - 0.5)
}

/// Fixed parameters for a 4 -> 3 simple recurrent cell, shared by the tests
/// that compare against worked-out numbers.
pub fn simple_reference_params() -> SimpleParams {
    SimpleParams {
        unit: ParameterUnit {
            weights: array![
                [0.5, -0.3, 0.2, 0.7],
                [-0.6, 0.4, 0.1, -0.2],
                [0.3, 0.8, -0.5, 0.1]
            ],
            biases: array![0.1, -0.2, 0.3],
            recurrent: Some(array![
                [0.2, -0.4, 0.1],
                [0.5, 0.3, -0.2],
                [-0.1, 0.6, 0.4]
            ]),
        },
    }
}

pub fn reference_inputs() -> Vec<Array1<f64>> {
    vec![
        array![0.9, -0.4, 0.3, -0.8],
        array![-0.2, 0.7, -0.5, 0.1],
        array![0.4, 0.2, 0.6, -0.3],
    ]
}

pub fn assert_close(got: &Array1<f64>, want: &Array1<f64>, tol: f64) {
    assert_eq!(got.len(), want.len(), "length mismatch");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tol,
            "component {i}: got {g}, want {w}"
        );
    }
}

/// Quadratic sequence loss `0.5 * sum_t |y_t - target_t|^2`.
pub fn quadratic_loss(outputs: &[Array1<f64>], targets: &[Array1<f64>]) -> f64 {
    outputs
        .iter()
        .zip(targets)
        .map(|(y, t)| {
            let d = y - t;
            d.dot(&d)
        })
        .sum::<f64>()
        * 0.5
}

fn nudge<P: ParamBundle>(params: &mut P, tensor: usize, index: usize, delta: f64) {
    let mut views = params.tensors_mut();
    if let Some(w) = views[tensor].iter_mut().nth(index) {
        *w += delta;
    }
}

fn component<P: ParamBundle>(bundle: &P, tensor: usize, index: usize) -> f64 {
    bundle.tensors()[tensor].iter().nth(index).copied().unwrap()
}

/// Checks every analytic parameter gradient of cell type `C` against a
/// central finite difference of the quadratic sequence loss.
///
/// The processor averages gradients over the sequence length, so the
/// numeric quotient is divided by the same factor before comparing.
pub fn check_gradients<C: Cell>(
    config: CellConfig,
    seed: u64,
    inputs: &[Array1<f64>],
    init: Option<&InitHidden>,
) {
    const H: f64 = 1e-5;

    let output_size = config.output_size;
    let mut proc: SequenceProcessor<C> = SequenceProcessor::new(config, seed).unwrap();
    let targets: Vec<Array1<f64>> = (0..inputs.len())
        .map(|t| Array1::from_shape_fn(output_size, |i| 0.25 * ((t * 3 + i) as f64).sin() + 0.1))
        .collect();

    let steps = inputs.len() as f64;
    let outputs = proc.forward(inputs, init, false, false).unwrap();
    let errors: Vec<Array1<f64>> = outputs.iter().zip(&targets).map(|(y, t)| y - t).collect();
    proc.backward(&errors, true).unwrap();
    let analytic = proc.take_params_errors();

    let tensor_count = analytic.tensors().len();
    for k in 0..tensor_count {
        let len = analytic.tensors()[k].len();
        for i in 0..len {
            nudge(proc.params_mut(), k, i, H);
            let plus =
                quadratic_loss(&proc.forward(inputs, init, false, false).unwrap(), &targets);
            nudge(proc.params_mut(), k, i, -2.0 * H);
            let minus =
                quadratic_loss(&proc.forward(inputs, init, false, false).unwrap(), &targets);
            nudge(proc.params_mut(), k, i, H);

            let numeric = (plus - minus) / (2.0 * H) / steps;
            let analytic_value = component(&analytic, k, i);
            assert!(
                (numeric - analytic_value).abs() <= 1e-5 + 1e-5 * analytic_value.abs(),
                "tensor {k} component {i}: numeric {numeric} vs analytic {analytic_value}"
            );
        }
    }
}
