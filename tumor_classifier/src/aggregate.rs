use crate::{config::OutputActivation, error::InferenceError};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassScore {
    pub label: String,
    /// In [0, 1].
    pub probability: f32,
    /// `probability * 100`, two decimals.
    pub percentage: f64,
    pub is_top: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub top_class: String,
    /// 0–100, two decimals.
    pub confidence: f64,
    /// Highest probability first.
    pub scores: Vec<ClassScore>,
    /// Probabilities in configured class order.
    pub probabilities: Vec<f32>,
    pub inference_time_ms: f64,
    pub preprocess_time_ms: f64,
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&x| x / sum).collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percentage(probability: f32) -> f64 {
    round2(probability as f64 * 100.0)
}

/// Lowest index wins ties.
fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (index, &value)| {
            if value > best.1 {
                (index, value)
            } else {
                best
            }
        })
        .0
}

#[derive(Debug, Clone)]
pub struct ResultAggregator {
    classes: Vec<String>,
    activation: OutputActivation,
}

impl ResultAggregator {
    pub fn new(classes: Vec<String>, activation: OutputActivation) -> Self {
        Self {
            classes,
            activation,
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    fn to_probabilities(&self, raw: &[f32]) -> Vec<f32> {
        let apply_softmax = match self.activation {
            OutputActivation::Softmax => true,
            OutputActivation::Probabilities => false,
            OutputActivation::Auto => raw.iter().any(|v| !(0.0..=1.0).contains(v)),
        };

        if apply_softmax {
            softmax(raw)
        } else {
            raw.to_vec()
        }
    }

    pub fn aggregate(
        &self,
        raw: &[f32],
        inference_time: Duration,
        preprocess_time: Duration,
    ) -> Result<InferenceResult, InferenceError> {
        if raw.len() != self.classes.len() {
            return Err(InferenceError::OutputMismatch {
                expected: self.classes.len(),
                actual: raw.len(),
            });
        }
        if let Some(index) = raw.iter().position(|v| !v.is_finite()) {
            return Err(InferenceError::NonFinite(index));
        }

        let probabilities = self.to_probabilities(raw);
        let top = argmax(&probabilities);

        let mut scores: Vec<ClassScore> = self
            .classes
            .iter()
            .zip(&probabilities)
            .enumerate()
            .map(|(index, (label, &probability))| ClassScore {
                label: label.clone(),
                probability,
                percentage: percentage(probability),
                is_top: index == top,
            })
            .collect();

        // Stable, so equal probabilities keep class order.
        scores.sort_by(|a, b| b.probability.total_cmp(&a.probability));

        Ok(InferenceResult {
            top_class: self.classes[top].clone(),
            confidence: percentage(probabilities[top]),
            scores,
            probabilities,
            inference_time_ms: inference_time.as_secs_f64() * 1000.0,
            preprocess_time_ms: preprocess_time.as_secs_f64() * 1000.0,
        })
    }
}
