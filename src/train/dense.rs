//! Fully-connected regression network trained by full-batch gradient
//! descent for a fixed number of iterations.
//!
//! Two shapes are supported:
//!
//! * a single linear layer `x·W + b`;
//! * a hidden ReLU layer over dropped-out inputs, followed by a linear
//!   layer and a constant bias equal to the training label means.
//!
//! Loss is `Σ (output − target)² / 2n` over all outputs.

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Hidden layer with dropout on its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HiddenLayer {
    pub units: usize,
    /// Probability that an input survives dropout during training.
    pub keep_probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenseConfig {
    pub learning_rate: f32,
    pub iterations: usize,
    pub hidden: Option<HiddenLayer>,
    /// Add the training label means to the output.
    pub mean_bias: bool,
    /// Log training and validation loss every this many iterations.
    pub log_every: Option<usize>,
    pub seed: u64,
}

impl DenseConfig {
    /// One linear layer over the first frame of each study.
    pub fn single_frame() -> Self {
        Self {
            learning_rate: 0.001,
            iterations: 200,
            hidden: None,
            mean_bias: false,
            log_every: None,
            seed: 1234,
        }
    }

    /// Hidden layer over the whole time stack of each study.
    pub fn frame_stack() -> Self {
        Self {
            learning_rate: 1e-7,
            iterations: 400,
            hidden: Some(HiddenLayer {
                units: 128,
                keep_probability: 0.2,
            }),
            mean_bias: true,
            log_every: Some(10),
            seed: 1234,
        }
    }

    /// Reject settings training cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be positive, got {}",
            self.learning_rate
        );
        if let Some(hidden) = &self.hidden {
            ensure!(hidden.units > 0, "hidden layer needs at least one unit");
            ensure!(
                hidden.keep_probability > 0.0 && hidden.keep_probability <= 1.0,
                "keep_probability must lie in (0, 1], got {}",
                hidden.keep_probability
            );
        }
        ensure!(self.log_every != Some(0), "log_every must be at least 1");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Layer {
    weights: Array2<f32>,
    biases: Array1<f32>,
}

impl Layer {
    /// Weights from a standard normal truncated at two standard
    /// deviations, zero biases.
    fn new(inputs: usize, outputs: usize, rng: &mut StdRng) -> Self {
        let weights = Array2::from_shape_fn((inputs, outputs), |_| truncated_normal(rng));
        Self {
            weights,
            biases: Array1::zeros(outputs),
        }
    }

    fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weights) + &self.biases
    }

    fn descend(&mut self, inputs: &ArrayView2<f32>, grad_out: &Array2<f32>, learning_rate: f32) {
        let grad_w = inputs.t().dot(grad_out);
        let grad_b = grad_out.sum_axis(Axis(0));
        self.weights.scaled_add(-learning_rate, &grad_w);
        self.biases.scaled_add(-learning_rate, &grad_b);
    }
}

fn truncated_normal(rng: &mut StdRng) -> f32 {
    loop {
        let v: f32 = rng.sample(StandardNormal);
        if v.abs() <= 2.0 {
            return v;
        }
    }
}

// ---------------------------------------------------------------------------
// DenseNetwork
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DenseNetwork {
    hidden: Option<(Layer, f32)>,
    output: Layer,
    output_bias: Array1<f32>,
}

impl DenseNetwork {
    /// Train on `(x, y)`. When `validation` is given, its loss is logged
    /// alongside the training loss every `config.log_every` iterations.
    pub fn train(
        config: &DenseConfig,
        x: ArrayView2<f32>,
        y: ArrayView2<f32>,
        validation: Option<(ArrayView2<f32>, ArrayView2<f32>)>,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let (inputs, outputs) = (x.ncols(), y.ncols());

        let (hidden, output_inputs) = match &config.hidden {
            Some(h) => (Some((Layer::new(inputs, h.units, &mut rng), h.keep_probability)), h.units),
            None => (None, inputs),
        };
        let output_bias = if config.mean_bias {
            y.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(outputs))
        } else {
            Array1::zeros(outputs)
        };

        let mut network = Self {
            hidden,
            output: Layer::new(output_inputs, outputs, &mut rng),
            output_bias,
        };

        for iteration in 0..config.iterations {
            if let Some(every) = config.log_every.filter(|&e| e > 0) {
                if iteration % every == 0 {
                    let training = network.loss(x, y);
                    match validation {
                        Some((vx, vy)) => log::info!(
                            "iteration {iteration}: training loss {training:.2}, validation loss {:.2}",
                            network.loss(vx, vy)
                        ),
                        None => log::info!("iteration {iteration}: training loss {training:.2}"),
                    }
                }
            }
            network.step(x, y, config.learning_rate, &mut rng);
        }

        network
    }

    pub fn predict(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let out = match &self.hidden {
            Some((layer, _)) => {
                let activations = layer.forward(&x).mapv(relu);
                self.output.forward(&activations.view())
            }
            None => self.output.forward(&x),
        };
        out + &self.output_bias
    }

    /// `Σ (prediction − y)² / 2n`, without dropout.
    pub fn loss(&self, x: ArrayView2<f32>, y: ArrayView2<f32>) -> f64 {
        squared_error_loss(&self.predict(x), &y)
    }

    /// One full-batch gradient descent step.
    fn step(&mut self, x: ArrayView2<f32>, y: ArrayView2<f32>, learning_rate: f32, rng: &mut StdRng) {
        let n = x.nrows().max(1) as f32;

        match &mut self.hidden {
            None => {
                let out = self.output.forward(&x) + &self.output_bias;
                let grad_out = (out - &y) / n;
                self.output.descend(&x, &grad_out, learning_rate);
            }
            Some((layer, keep)) => {
                let keep = *keep;
                let dropped = if keep < 1.0 {
                    let scale = 1.0 / keep;
                    let mask = Array2::from_shape_fn(x.dim(), |_| {
                        if rng.gen::<f32>() < keep {
                            scale
                        } else {
                            0.0
                        }
                    });
                    &x * &mask
                } else {
                    x.to_owned()
                };

                let pre_activation = layer.forward(&dropped.view());
                let activations = pre_activation.mapv(relu);
                let out = self.output.forward(&activations.view()) + &self.output_bias;

                let grad_out = (out - &y) / n;
                let mut grad_hidden = grad_out.dot(&self.output.weights.t());
                grad_hidden.zip_mut_with(&pre_activation, |g, &z| {
                    if z <= 0.0 {
                        *g = 0.0;
                    }
                });

                self.output.descend(&activations.view(), &grad_out, learning_rate);
                layer.descend(&dropped.view(), &grad_hidden, learning_rate);
            }
        }
    }
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

/// `Σ (prediction − target)² / 2n`, accumulated in f64.
pub fn squared_error_loss(predictions: &Array2<f32>, targets: &ArrayView2<f32>) -> f64 {
    let n = predictions.nrows().max(1) as f64;
    let sum: f64 = predictions
        .iter()
        .zip(targets.iter())
        .map(|(&p, &t)| (f64::from(p) - f64::from(t)).powi(2))
        .sum();
    sum / (2.0 * n)
}
