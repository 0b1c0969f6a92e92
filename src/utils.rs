/// Numeric helpers shared across the crate.
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Sigmoid activation function: σ(x) = 1 / (1 + e^(-x))
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable column-wise softmax
pub fn softmax(x: &Array2<f64>) -> Array2<f64> {
    let mut result = Array2::zeros(x.raw_dim());

    for (i, col) in x.axis_iter(Axis(1)).enumerate() {
        let max_val = col.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exp_vals: Array1<f64> = col.map(|&val| (val - max_val).exp());
        let sum_exp = exp_vals.sum();

        for (j, &exp_val) in exp_vals.iter().enumerate() {
            result[[j, i]] = exp_val / sum_exp;
        }
    }

    result
}

/// Position of the first maximum of `values`; 0 for an empty view.
pub fn argmax(values: ArrayView1<f64>) -> usize {
    let mut best = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best = i;
            best_val = v;
        }
    }
    best
}

/// Scales `values` in place so they sum to one. Leaves the slice untouched
/// when the sum is zero or not finite.
pub fn normalize(values: &mut [f64]) {
    let sum: f64 = values.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}
