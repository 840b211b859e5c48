//! The concurrency/communicator abstraction: per-image force/energy
//! evaluation can run serially, in a fork-join thread scope, or across an
//! external MPI-style communicator. `World` models the latter so `Neb` never
//! needs to know which one it is talking to.

use crate::error::{MepError, Result};

/// An MPI-style communicator. A failing rank must still participate in
/// `sum` (contributing `1.0`) before propagating its error, so that ranks
/// which succeeded don't block forever waiting on a reduction that will
/// never arrive.
pub trait World {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn sum(&self, value: f64) -> f64;
    fn broadcast(&self, buf: &mut [f64], root: usize);
}

/// Single-rank stand-in for a communicator, used when no distributed
/// backend is configured (and in tests).
pub struct LocalWorld;

impl World for LocalWorld {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sum(&self, value: f64) -> f64 {
        value
    }

    fn broadcast(&self, _buf: &mut [f64], _root: usize) {}
}

/// How interior-image force/energy evaluation is parallelized.
pub enum ParallelMode {
    Serial,
    /// `std::thread::scope` fork-join: one thread per interior image,
    /// avoiding a thread-pool dependency the teacher crate never pulled in.
    Threaded,
    Distributed(Box<dyn World>),
}

/// Runs a failing step's contribution through the communicator's reduction
/// before surfacing the error, per the rank-reduced error signaling
/// contract.
pub fn signal_failure(world: &dyn World, message: impl Into<String>) -> MepError {
    let _ = world.sum(1.0);
    MepError::ParallelStepFailed(message.into())
}

pub fn check_distributed_divisibility(n_interior: usize, world_size: usize) -> Result<()> {
    if world_size > 1 && n_interior % world_size != 0 {
        return Err(MepError::ConfigError(format!(
            "{n_interior} interior images is not evenly divisible across {world_size} ranks"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_world_sum_is_identity() {
        let w = LocalWorld;
        assert_eq!(w.sum(3.5), 3.5);
    }

    #[test]
    fn rejects_indivisible_distribution() {
        assert!(check_distributed_divisibility(5, 2).is_err());
        assert!(check_distributed_divisibility(6, 2).is_ok());
    }
}
