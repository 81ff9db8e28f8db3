//! Gradient accumulation windows.

use crate::error::ModelError;
use crate::model::{ForwardBackward, Gradients};
use crate::optim::{ClipOutcome, clip_grad_norm};

/// Sums micro-batch gradients until the window is full.
#[derive(Debug)]
pub struct GradientAccumulator {
    window: usize,
    sum: Option<Gradients>,
    loss_sum: f64,
    count: usize,
}

impl GradientAccumulator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            sum: None,
            loss_sum: 0.0,
            count: 0,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Micro-steps in the current window.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.window
    }

    /// Add one micro-step's output to the window.
    pub fn add(&mut self, out: ForwardBackward) -> Result<(), ModelError> {
        match &mut self.sum {
            Some(sum) => sum.add_assign(&out.gradients)?,
            None => self.sum = Some(out.gradients),
        }
        self.loss_sum += f64::from(out.loss);
        self.count += 1;
        Ok(())
    }

    /// Close a full window, yielding its mean gradients. `None` if the window is not full.
    pub fn take(&mut self) -> Option<AccumulatedGradients> {
        if !self.is_full() {
            return None;
        }
        let mut gradients = self.sum.take()?;
        let micro_steps = self.count;
        gradients.scale(1.0 / micro_steps as f32);
        let mean_loss = self.loss_sum / micro_steps as f64;
        self.loss_sum = 0.0;
        self.count = 0;
        Some(AccumulatedGradients {
            gradients,
            mean_loss,
            micro_steps,
        })
    }

    /// Drop a partial window. Returns how many micro-steps were discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.count;
        self.sum = None;
        self.loss_sum = 0.0;
        self.count = 0;
        dropped
    }
}

/// Mean gradients of one complete accumulation window.
///
/// Only [`GradientAccumulator::take`] constructs these, so an optimizer step
/// can never observe a partial window.
#[derive(Debug, Clone)]
pub struct AccumulatedGradients {
    gradients: Gradients,
    mean_loss: f64,
    micro_steps: usize,
}

impl AccumulatedGradients {
    pub fn gradients(&self) -> &Gradients {
        &self.gradients
    }

    /// Mean micro-batch loss across the window.
    pub fn mean_loss(&self) -> f64 {
        self.mean_loss
    }

    pub fn micro_steps(&self) -> usize {
        self.micro_steps
    }

    /// Clip the window's global gradient norm in place.
    pub fn clip(&mut self, max_norm: f64) -> ClipOutcome {
        clip_grad_norm(&mut self.gradients, max_norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fb(loss: f32, grads: Vec<f32>) -> ForwardBackward {
        ForwardBackward {
            loss,
            gradients: Gradients::new(vec![grads]),
        }
    }

    #[test]
    fn test_window_yields_mean_only_when_full() {
        let mut acc = GradientAccumulator::new(3);
        acc.add(fb(1.0, vec![3.0, 0.0])).unwrap();
        acc.add(fb(2.0, vec![0.0, 6.0])).unwrap();
        assert!(acc.take().is_none());
        assert_eq!(acc.len(), 2);
        acc.add(fb(3.0, vec![0.0, 3.0])).unwrap();
        assert!(acc.is_full());

        let out = acc.take().unwrap();
        assert_eq!(out.micro_steps(), 3);
        assert_eq!(out.mean_loss(), 2.0);
        assert_eq!(out.gradients().shards()[0], vec![1.0, 3.0]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_discard_partial_window() {
        let mut acc = GradientAccumulator::new(4);
        acc.add(fb(1.0, vec![1.0])).unwrap();
        acc.add(fb(1.0, vec![1.0])).unwrap();
        assert_eq!(acc.discard(), 2);
        assert!(acc.is_empty());
        acc.add(fb(5.0, vec![4.0])).unwrap();
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_mismatched_layout_rejected() {
        let mut acc = GradientAccumulator::new(2);
        acc.add(fb(1.0, vec![1.0])).unwrap();
        let bad = ForwardBackward {
            loss: 1.0,
            gradients: Gradients::new(vec![vec![1.0], vec![2.0]]),
        };
        assert!(acc.add(bad).is_err());
    }

    #[test]
    fn test_clip_applies_to_window_mean() {
        let mut acc = GradientAccumulator::new(1);
        acc.add(fb(0.0, vec![30.0, 40.0])).unwrap();
        let mut out = acc.take().unwrap();
        let clip = out.clip(5.0);
        assert_eq!(clip.norm, 50.0);
        assert!(clip.clipped);
        assert!((out.gradients().squared_norm().sqrt() - 5.0).abs() < 1e-5);
    }
}
