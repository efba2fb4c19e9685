use ndarray::{Array, Array1, Array2, Axis, Dimension, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::TrainingConfig;
use crate::dataset::{ClassKey, ClassRecord};

use super::TrainError;
use super::model::{ClassifierModel, MODEL_VERSION, TrainingMetrics};

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-7;
const LOG_EPSILON: f32 = 1e-7;

/// Loss applied to the softmax outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// Mean binary cross-entropy over both outputs; used for exactly two classes.
    Binary,
    Categorical,
}

impl LossKind {
    pub fn for_classes(classes: usize) -> Self {
        if classes == 2 {
            Self::Binary
        } else {
            Self::Categorical
        }
    }

    fn sample_loss(self, probs: &[f32], target: &[f32]) -> f32 {
        let clamp = |p: f32| p.clamp(LOG_EPSILON, 1.0 - LOG_EPSILON);
        match self {
            Self::Categorical => -probs
                .iter()
                .zip(target)
                .map(|(&p, &t)| t * clamp(p).ln())
                .sum::<f32>(),
            Self::Binary => {
                let total: f32 = probs
                    .iter()
                    .zip(target)
                    .map(|(&p, &t)| t * clamp(p).ln() + (1.0 - t) * (1.0 - clamp(p)).ln())
                    .sum();
                -total / probs.len() as f32
            }
        }
    }
}

/// Outcome of one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    /// Epochs completed so far, starting at 1.
    pub epoch: usize,
    pub total_epochs: usize,
    pub loss: f32,
    pub accuracy: f32,
}

impl EpochReport {
    pub fn progress(&self) -> f32 {
        self.epoch as f32 / self.total_epochs.max(1) as f32
    }
}

#[derive(Clone)]
struct DenseParams {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl DenseParams {
    fn glorot(input: usize, hidden: usize, classes: usize, rng: &mut StdRng) -> Self {
        Self {
            w1: glorot_uniform(hidden, input, rng),
            b1: Array1::zeros(hidden),
            w2: glorot_uniform(classes, hidden, rng),
            b2: Array1::zeros(classes),
        }
    }

    fn zeros_like(other: &Self) -> Self {
        Self {
            w1: Array2::zeros(other.w1.raw_dim()),
            b1: Array1::zeros(other.b1.raw_dim()),
            w2: Array2::zeros(other.w2.raw_dim()),
            b2: Array1::zeros(other.b2.raw_dim()),
        }
    }
}

fn glorot_uniform(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    Array2::from_shape_simple_fn((rows, cols), || rng.random_range(-limit..limit))
}

struct Adam {
    learning_rate: f32,
    step: i32,
    first: DenseParams,
    second: DenseParams,
}

impl Adam {
    fn new(params: &DenseParams, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            step: 0,
            first: DenseParams::zeros_like(params),
            second: DenseParams::zeros_like(params),
        }
    }

    fn apply(&mut self, params: &mut DenseParams, grads: &DenseParams) {
        self.step += 1;
        let lr = self.learning_rate;
        let correction1 = 1.0 - ADAM_BETA1.powi(self.step);
        let correction2 = 1.0 - ADAM_BETA2.powi(self.step);
        let update = |param: &mut f32, m: &mut f32, v: &mut f32, g: f32| {
            *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
            *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *param -= lr * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
        };
        adam_zip(&mut params.w1, &mut self.first.w1, &mut self.second.w1, &grads.w1, update);
        adam_zip(&mut params.b1, &mut self.first.b1, &mut self.second.b1, &grads.b1, update);
        adam_zip(&mut params.w2, &mut self.first.w2, &mut self.second.w2, &grads.w2, update);
        adam_zip(&mut params.b2, &mut self.first.b2, &mut self.second.b2, &grads.b2, update);
    }
}

fn adam_zip<D: Dimension>(
    param: &mut Array<f32, D>,
    first: &mut Array<f32, D>,
    second: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    update: impl Fn(&mut f32, &mut f32, &mut f32, f32),
) {
    Zip::from(param)
        .and(first)
        .and(second)
        .and(grad)
        .for_each(|p, m, v, &g| update(p, m, v, g));
}

/// One training run over a stacked, shuffled copy of the dataset.
///
/// Dropping the session releases every intermediate buffer.
pub struct TrainingSession {
    inputs: Array2<f32>,
    targets: Array2<f32>,
    class_keys: Vec<ClassKey>,
    params: DenseParams,
    adam: Adam,
    loss: LossKind,
    rng: StdRng,
    order: Vec<usize>,
    batch_size: usize,
    epochs: usize,
    completed: usize,
    last: Option<EpochReport>,
}

impl TrainingSession {
    /// Stack every class's vectors, shuffle them jointly with their labels and
    /// initialize a fresh head.
    pub fn new(
        records: &[(ClassKey, ClassRecord)],
        config: &TrainingConfig,
    ) -> Result<Self, TrainError> {
        if records.is_empty() {
            return Err(TrainError::NoClasses);
        }
        let input_len = records
            .iter()
            .flat_map(|(_, record)| record.features.first())
            .map(|vector| vector.len())
            .next()
            .unwrap_or(0);
        let mut rows: Vec<(usize, &[f32])> = Vec::new();
        for (label, (key, record)) in records.iter().enumerate() {
            for vector in &record.features {
                if vector.len() != input_len || input_len == 0 {
                    return Err(TrainError::FeatureLength {
                        key: *key,
                        expected: input_len,
                        actual: vector.len(),
                    });
                }
                rows.push((label, vector.as_slice()));
            }
        }
        if rows.is_empty() {
            return Err(TrainError::NoSamples);
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        rows.shuffle(&mut rng);

        let classes = records.len();
        let samples = rows.len();
        let mut inputs = Array2::<f32>::zeros((samples, input_len));
        let mut targets = Array2::<f32>::zeros((samples, classes));
        for (index, (label, values)) in rows.iter().enumerate() {
            inputs
                .row_mut(index)
                .assign(&ndarray::ArrayView1::from(*values));
            targets[[index, *label]] = 1.0;
        }

        let hidden = config.hidden_units.max(1);
        let params = DenseParams::glorot(input_len, hidden, classes, &mut rng);
        let adam = Adam::new(&params, config.learning_rate);
        Ok(Self {
            inputs,
            targets,
            class_keys: records.iter().map(|(key, _)| *key).collect(),
            params,
            adam,
            loss: LossKind::for_classes(classes),
            rng,
            order: (0..samples).collect(),
            batch_size: config.batch_size.max(1),
            epochs: config.epochs.max(1),
            completed: 0,
            last: None,
        })
    }

    pub fn loss_kind(&self) -> LossKind {
        self.loss
    }

    pub fn samples(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn total_epochs(&self) -> usize {
        self.epochs
    }

    pub fn is_finished(&self) -> bool {
        self.completed >= self.epochs
    }

    /// Run one shuffled epoch of mini-batch updates.
    pub fn step_epoch(&mut self) -> EpochReport {
        self.order.shuffle(&mut self.rng);
        let mut loss_sum = 0.0f32;
        let mut correct = 0usize;
        let order = std::mem::take(&mut self.order);
        for batch in order.chunks(self.batch_size) {
            let (batch_loss, batch_correct) = self.train_batch(batch);
            loss_sum += batch_loss;
            correct += batch_correct;
        }
        self.order = order;
        self.completed += 1;
        let samples = self.samples().max(1) as f32;
        let report = EpochReport {
            epoch: self.completed,
            total_epochs: self.epochs,
            loss: loss_sum / samples,
            accuracy: correct as f32 / samples,
        };
        debug!(
            epoch = report.epoch,
            loss = report.loss,
            accuracy = report.accuracy,
            "Classifier epoch finished"
        );
        self.last = Some(report);
        report
    }

    /// Returns the summed loss and correct count for the batch.
    fn train_batch(&mut self, batch: &[usize]) -> (f32, usize) {
        let x = self.inputs.select(Axis(0), batch);
        let t = self.targets.select(Axis(0), batch);
        let p = &self.params;

        let pre = x.dot(&p.w1.t()) + &p.b1;
        let hidden = pre.mapv(|v| v.max(0.0));
        let mut probs = hidden.dot(&p.w2.t()) + &p.b2;
        for mut row in probs.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum().max(f32::MIN_POSITIVE);
            row.mapv_inplace(|v| v / sum);
        }

        let mut loss = 0.0f32;
        let mut correct = 0usize;
        for (prob_row, target_row) in probs.rows().into_iter().zip(t.rows()) {
            let prob_slice = prob_row.to_vec();
            let target_slice = target_row.to_vec();
            loss += self.loss.sample_loss(&prob_slice, &target_slice);
            if argmax(&prob_slice) == argmax(&target_slice) {
                correct += 1;
            }
        }

        let scale = 1.0 / batch.len().max(1) as f32;
        let grad_logits = (&probs - &t) * scale;
        let grad_w2 = grad_logits.t().dot(&hidden);
        let grad_b2 = grad_logits.sum_axis(Axis(0));
        let mut grad_hidden = grad_logits.dot(&p.w2);
        Zip::from(&mut grad_hidden)
            .and(&pre)
            .for_each(|g, &z| {
                if z <= 0.0 {
                    *g = 0.0;
                }
            });
        let grad_w1 = grad_hidden.t().dot(&x);
        let grad_b1 = grad_hidden.sum_axis(Axis(0));

        let grads = DenseParams {
            w1: grad_w1,
            b1: grad_b1,
            w2: grad_w2,
            b2: grad_b2,
        };
        self.adam.apply(&mut self.params, &grads);
        (loss, correct)
    }

    /// Consume the session and export the trained head.
    pub fn into_model(self) -> ClassifierModel {
        let samples = self.samples();
        let metrics = self.last.map(|report| TrainingMetrics {
            epochs: report.epoch,
            samples,
            loss: report.loss,
            accuracy: report.accuracy,
        });
        let DenseParams { w1, b1, w2, b2 } = self.params;
        ClassifierModel {
            model_version: MODEL_VERSION,
            input_len: w1.ncols(),
            hidden_units: w1.nrows(),
            class_keys: self.class_keys,
            weights1: w1.iter().copied().collect(),
            bias1: b1.to_vec(),
            weights2: w2.iter().copied().collect(),
            bias2: b2.to_vec(),
            metrics,
        }
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (index, &v)| {
            if v > best.1 { (index, v) } else { best }
        })
        .0
}
