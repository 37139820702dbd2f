//! The epsilon-LRP rule shared by every cell type.
//!
//! Relevance of an output is redistributed onto the sources that summed into
//! it. Two shapes of source exist: a matrix contribution (`C[j,i]` is what
//! `x_i` added to row `j` before summation) and an elementwise term (one of
//! several vectors added together). Each application is stabilized by a
//! small epsilon sign-matched to the summation value and divided by the
//! number of distinct sources at that point, so the partial relevances of
//! all sources still add up to (approximately) the incoming total.

use ndarray::{Array1, Array2};

/// Default LRP stabilizer magnitude.
pub const EPSILON: f64 = 0.01;

/// The stabilizer for one summation row: `±EPSILON / sources`, carrying the
/// sign of the row's summation value.
pub fn stabilizer(summation: f64, sources: usize) -> f64 {
    let eps = EPSILON / sources as f64;
    if summation < 0.0 { -eps } else { eps }
}

/// Raw contribution matrix `C[j,i] = weights[j,i] * input[i]`.
pub fn contributions(weights: &Array2<f64>, input: &Array1<f64>) -> Array2<f64> {
    let mut c = weights.clone();
    for mut row in c.rows_mut() {
        row *= input;
    }
    c
}

/// Folds a bias into a contribution matrix, spread uniformly over the row
/// (`b_j * share / n` per element). `share` is `1/k` when `k` sources split
/// one bias.
pub fn add_bias_share(c: &mut Array2<f64>, biases: &Array1<f64>, share: f64) {
    let n = c.ncols() as f64;
    for (mut row, &b) in c.rows_mut().into_iter().zip(biases) {
        row += b * share / n;
    }
}

/// Propagates relevance through a matrix source:
/// `rel(x_i) = Σ_j out_rel_j · (C[j,i] + ε_j/n) / (s_j + ε_j)`.
pub fn through_contributions(
    out_rel: &Array1<f64>,
    c: &Array2<f64>,
    summation: &Array1<f64>,
    sources: usize,
) -> Array1<f64> {
    let n = c.ncols() as f64;
    let mut rel = Array1::zeros(c.ncols());
    for ((&r_j, &s_j), row) in out_rel.iter().zip(summation).zip(c.rows()) {
        let eps = stabilizer(s_j, sources);
        let denom = s_j + eps;
        let spread = eps / n;
        for (acc, &c_ji) in rel.iter_mut().zip(row) {
            *acc += r_j * (c_ji + spread) / denom;
        }
    }
    rel
}

/// Propagates relevance through one elementwise term of a summation:
/// `rel_j = out_rel_j · (t_j + ε_j) / (s_j + ε_j)`.
pub fn through_term(
    out_rel: &Array1<f64>,
    term: &Array1<f64>,
    summation: &Array1<f64>,
    sources: usize,
) -> Array1<f64> {
    let mut rel = Array1::zeros(out_rel.len());
    for i in 0..rel.len() {
        let eps = stabilizer(summation[i], sources);
        rel[i] = out_rel[i] * (term[i] + eps) / (summation[i] + eps);
    }
    rel
}
