//! Thin `tracing` instrumentation shared by the NEB and preconditioned MEP
//! drivers: one span per optimization step, one event per convergence check.
//! This crate does no logging of its own — no destination is configured
//! here — it only emits spans/events an embedding application can subscribe
//! to.

use tracing::{info_span, Span};

/// Opens a span for one driver step (one `get_forces`/`ode12r` iteration),
/// tagged with the driver name and step index.
pub fn step_span(driver: &'static str, step: usize) -> Span {
    info_span!("mep_step", driver, step)
}

/// Emits a convergence-check event: whether this step's residual fell below
/// the configured `fmax`.
pub fn convergence_event(residual: f64, fmax: f64) {
    if residual <= fmax {
        tracing::info!(residual, fmax, "converged");
    } else {
        tracing::debug!(residual, fmax, "not yet converged");
    }
}
