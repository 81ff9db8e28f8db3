//! Global gradient-norm clipping.

use crate::model::Gradients;

/// Result of a clipping pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipOutcome {
    /// Global L2 norm before clipping.
    pub norm: f64,
    pub clipped: bool,
}

/// Scale `grads` so their global L2 norm is at most `max_norm`.
///
/// The norm is taken over every shard at once. `max_norm == 0` disables
/// clipping; the norm is still reported.
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f64) -> ClipOutcome {
    let norm = grads.squared_norm().sqrt();
    if max_norm <= 0.0 || !norm.is_finite() || norm <= max_norm {
        return ClipOutcome {
            norm,
            clipped: false,
        };
    }
    let clip_coef = (max_norm / norm) as f32;
    grads.scale(clip_coef);
    ClipOutcome {
        norm,
        clipped: true,
    }
}
