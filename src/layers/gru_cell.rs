use ndarray::{Array2, Axis};
use ndarray_rand::RandomExt;
use rand_distr::Uniform;

use crate::context;
use crate::layers::Activation;
use crate::optimizers::Optimizer;
use crate::utils::sigmoid;

/// Holds gradients for all GRU cell parameters during backpropagation
#[derive(Clone, Debug)]
pub struct GRUCellGradients {
    pub w_ir: Array2<f64>,
    pub w_hr: Array2<f64>,
    pub b_ir: Array2<f64>,
    pub b_hr: Array2<f64>,
    pub w_iz: Array2<f64>,
    pub w_hz: Array2<f64>,
    pub b_iz: Array2<f64>,
    pub b_hz: Array2<f64>,
    pub w_ih: Array2<f64>,
    pub w_hh: Array2<f64>,
    pub b_ih: Array2<f64>,
    pub b_hh: Array2<f64>,
}

impl GRUCellGradients {
    pub fn matrices_mut(&mut self) -> [&mut Array2<f64>; 12] {
        [
            &mut self.w_ir, &mut self.w_hr, &mut self.b_ir, &mut self.b_hr,
            &mut self.w_iz, &mut self.w_hz, &mut self.b_iz, &mut self.b_hz,
            &mut self.w_ih, &mut self.w_hh, &mut self.b_ih, &mut self.b_hh,
        ]
    }

    pub fn matrices(&self) -> [&Array2<f64>; 12] {
        [
            &self.w_ir, &self.w_hr, &self.b_ir, &self.b_hr,
            &self.w_iz, &self.w_hz, &self.b_iz, &self.b_hz,
            &self.w_ih, &self.w_hh, &self.b_ih, &self.b_hh,
        ]
    }

    pub fn accumulate(&mut self, other: &GRUCellGradients) {
        for (total, step) in self.matrices_mut().into_iter().zip(other.matrices()) {
            *total += step;
        }
    }
}

/// Caches intermediate values during forward pass for efficient backward computation
#[derive(Clone, Debug)]
pub struct GRUCellCache {
    pub input: Array2<f64>,
    pub hx: Array2<f64>,
    pub reset_gate: Array2<f64>,
    pub update_gate: Array2<f64>,
    pub new_gate_pre: Array2<f64>,
    pub new_gate: Array2<f64>,
    pub reset_hidden: Array2<f64>,
}

/// GRU cell with trainable parameters
///
/// - r_t = σ(W_ir * x_t + b_ir + W_hr * h_{t-1} + b_hr)
/// - z_t = σ(W_iz * x_t + b_iz + W_hz * h_{t-1} + b_hz)
/// - n_t = act(W_ih * x_t + b_ih + W_hh * (r_t ⊙ h_{t-1}) + b_hh)
/// - h_t = (1 - z_t) ⊙ h_{t-1} + z_t ⊙ n_t
#[derive(Clone, Debug)]
pub struct GRUCell {
    // Reset gate parameters
    pub w_ir: Array2<f64>,
    pub w_hr: Array2<f64>,
    pub b_ir: Array2<f64>,
    pub b_hr: Array2<f64>,

    // Update gate parameters
    pub w_iz: Array2<f64>,
    pub w_hz: Array2<f64>,
    pub b_iz: Array2<f64>,
    pub b_hz: Array2<f64>,

    // New gate parameters
    pub w_ih: Array2<f64>,
    pub w_hh: Array2<f64>,
    pub b_ih: Array2<f64>,
    pub b_hh: Array2<f64>,

    pub hidden_size: usize,
    pub activation: Activation,
}

fn column_sum(m: &Array2<f64>) -> Array2<f64> {
    m.sum_axis(Axis(1)).insert_axis(Axis(1))
}

impl GRUCell {
    /// Creates a new GRU cell with uniform weights drawn from the active
    /// engine context
    pub fn new(input_size: usize, hidden_size: usize, activation: Activation) -> Self {
        let dist = Uniform::new(-0.1, 0.1);
        let input_shape = (hidden_size, input_size);
        let hidden_shape = (hidden_size, hidden_size);

        let [w_ir, w_hr, w_iz, w_hz, w_ih, w_hh] = context::with_rng(|rng| {
            [
                Array2::random_using(input_shape, dist, rng),
                Array2::random_using(hidden_shape, dist, rng),
                Array2::random_using(input_shape, dist, rng),
                Array2::random_using(hidden_shape, dist, rng),
                Array2::random_using(input_shape, dist, rng),
                Array2::random_using(hidden_shape, dist, rng),
            ]
        });
        let bias = || Array2::zeros((hidden_size, 1));

        GRUCell {
            w_ir, w_hr, b_ir: bias(), b_hr: bias(),
            w_iz, w_hz, b_iz: bias(), b_hz: bias(),
            w_ih, w_hh, b_ih: bias(), b_hh: bias(),
            hidden_size,
            activation,
        }
    }

    pub fn input_size(&self) -> usize {
        self.w_ir.ncols()
    }

    pub fn forward(&self, input: &Array2<f64>, hx: &Array2<f64>) -> Array2<f64> {
        let (hy, _) = self.forward_with_cache(input, hx);
        hy
    }

    pub fn forward_with_cache(&self, input: &Array2<f64>, hx: &Array2<f64>) -> (Array2<f64>, GRUCellCache) {
        let reset_gate = (&self.w_ir.dot(input) + &self.b_ir + &self.w_hr.dot(hx) + &self.b_hr).mapv(sigmoid);
        let update_gate = (&self.w_iz.dot(input) + &self.b_iz + &self.w_hz.dot(hx) + &self.b_hz).mapv(sigmoid);

        let reset_hidden = &reset_gate * hx;

        let new_gate_pre = &self.w_ih.dot(input) + &self.b_ih + &self.w_hh.dot(&reset_hidden) + &self.b_hh;
        let new_gate = self.activation.apply(&new_gate_pre);

        let hy = &update_gate.mapv(|x| 1.0 - x) * hx + &update_gate * &new_gate;

        let cache = GRUCellCache {
            input: input.clone(),
            hx: hx.clone(),
            reset_gate,
            update_gate,
            new_gate_pre,
            new_gate,
            reset_hidden,
        };

        (hy, cache)
    }

    /// Backward pass for one time step
    ///
    /// Returns (parameter_gradients, input_gradient, hidden_gradient)
    pub fn backward(&self, dhy: &Array2<f64>, cache: &GRUCellCache) -> (GRUCellGradients, Array2<f64>, Array2<f64>) {
        let act = self.activation;

        // h_t = (1 - z_t) ⊙ h_{t-1} + z_t ⊙ n_t
        let d_update_gate = dhy * &(&cache.new_gate - &cache.hx);
        let d_new_gate = dhy * &cache.update_gate;
        let dhx_direct = dhy * &cache.update_gate.mapv(|x| 1.0 - x);

        let d_new_raw = d_new_gate * cache.new_gate_pre.mapv(|x| act.derivative(x));

        // reset_hidden = r_t ⊙ h_{t-1}
        let d_reset_hidden = self.w_hh.t().dot(&d_new_raw);
        let d_reset_gate = &d_reset_hidden * &cache.hx;
        let dhx_from_reset = &d_reset_hidden * &cache.reset_gate;

        let d_reset_raw = d_reset_gate * &cache.reset_gate * cache.reset_gate.mapv(|x| 1.0 - x);
        let d_update_raw = d_update_gate * &cache.update_gate * cache.update_gate.mapv(|x| 1.0 - x);

        let input_t = cache.input.t();
        let hx_t = cache.hx.t();
        let gradients = GRUCellGradients {
            w_ir: d_reset_raw.dot(&input_t),
            w_hr: d_reset_raw.dot(&hx_t),
            b_ir: column_sum(&d_reset_raw),
            b_hr: column_sum(&d_reset_raw),
            w_iz: d_update_raw.dot(&input_t),
            w_hz: d_update_raw.dot(&hx_t),
            b_iz: column_sum(&d_update_raw),
            b_hz: column_sum(&d_update_raw),
            w_ih: d_new_raw.dot(&input_t),
            w_hh: d_new_raw.dot(&cache.reset_hidden.t()),
            b_ih: column_sum(&d_new_raw),
            b_hh: column_sum(&d_new_raw),
        };

        let dx = self.w_ir.t().dot(&d_reset_raw)
            + self.w_iz.t().dot(&d_update_raw)
            + self.w_ih.t().dot(&d_new_raw);

        let dhx = dhx_direct
            + dhx_from_reset
            + self.w_hr.t().dot(&d_reset_raw)
            + self.w_hz.t().dot(&d_update_raw);

        (gradients, dx, dhx)
    }

    /// Initialize zero gradients for accumulation
    pub fn zero_gradients(&self) -> GRUCellGradients {
        GRUCellGradients {
            w_ir: Array2::zeros(self.w_ir.raw_dim()),
            w_hr: Array2::zeros(self.w_hr.raw_dim()),
            b_ir: Array2::zeros(self.b_ir.raw_dim()),
            b_hr: Array2::zeros(self.b_hr.raw_dim()),
            w_iz: Array2::zeros(self.w_iz.raw_dim()),
            w_hz: Array2::zeros(self.w_hz.raw_dim()),
            b_iz: Array2::zeros(self.b_iz.raw_dim()),
            b_hz: Array2::zeros(self.b_hz.raw_dim()),
            w_ih: Array2::zeros(self.w_ih.raw_dim()),
            w_hh: Array2::zeros(self.w_hh.raw_dim()),
            b_ih: Array2::zeros(self.b_ih.raw_dim()),
            b_hh: Array2::zeros(self.b_hh.raw_dim()),
        }
    }

    /// Apply gradients using the provided optimizer
    pub fn update_parameters(&mut self, gradients: &GRUCellGradients, optimizer: &mut dyn Optimizer, prefix: &str) {
        optimizer.update(&format!("{}_w_ir", prefix), &mut self.w_ir, &gradients.w_ir);
        optimizer.update(&format!("{}_w_hr", prefix), &mut self.w_hr, &gradients.w_hr);
        optimizer.update(&format!("{}_b_ir", prefix), &mut self.b_ir, &gradients.b_ir);
        optimizer.update(&format!("{}_b_hr", prefix), &mut self.b_hr, &gradients.b_hr);

        optimizer.update(&format!("{}_w_iz", prefix), &mut self.w_iz, &gradients.w_iz);
        optimizer.update(&format!("{}_w_hz", prefix), &mut self.w_hz, &gradients.w_hz);
        optimizer.update(&format!("{}_b_iz", prefix), &mut self.b_iz, &gradients.b_iz);
        optimizer.update(&format!("{}_b_hz", prefix), &mut self.b_hz, &gradients.b_hz);

        optimizer.update(&format!("{}_w_ih", prefix), &mut self.w_ih, &gradients.w_ih);
        optimizer.update(&format!("{}_w_hh", prefix), &mut self.w_hh, &gradients.w_hh);
        optimizer.update(&format!("{}_b_ih", prefix), &mut self.b_ih, &gradients.b_ih);
        optimizer.update(&format!("{}_b_hh", prefix), &mut self.b_hh, &gradients.b_hh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_gru_cell_forward() {
        let cell = GRUCell::new(3, 2, Activation::Tanh);
        let input = arr2(&[[0.5], [0.1], [-0.3]]);
        let hx = arr2(&[[0.0], [0.0]]);

        let hy = cell.forward(&input, &hx);
        assert_eq!(hy.shape(), &[2, 1]);
    }

    #[test]
    fn test_gru_hidden_gradient_matches_finite_difference() {
        let cell = GRUCell::new(2, 3, Activation::Tanh);
        let input = arr2(&[[0.3], [-0.6]]);
        let hx = arr2(&[[0.1], [-0.2], [0.4]]);

        let (_, cache) = cell.forward_with_cache(&input, &hx);
        let (_, _, dhx) = cell.backward(&Array2::ones((3, 1)), &cache);

        let eps = 1e-6;
        for k in 0..3 {
            let mut plus = hx.clone();
            plus[[k, 0]] += eps;
            let mut minus = hx.clone();
            minus[[k, 0]] -= eps;
            let numeric = (cell.forward(&input, &plus).sum() - cell.forward(&input, &minus).sum()) / (2.0 * eps);
            assert!((numeric - dhx[[k, 0]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gru_bias_gradients_sum_over_batch() {
        let cell = GRUCell::new(1, 2, Activation::Tanh);
        let input = Array2::ones((1, 3));
        let hx = Array2::zeros((2, 3));
        let (_, cache) = cell.forward_with_cache(&input, &hx);
        let (gradients, dx, _) = cell.backward(&Array2::ones((2, 3)), &cache);

        assert_eq!(gradients.b_ih.shape(), &[2, 1]);
        assert_eq!(dx.shape(), &[1, 3]);
    }
}
