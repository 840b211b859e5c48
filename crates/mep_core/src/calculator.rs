//! The calculator capability: an injected energy/force oracle for a given
//! geometry. Modeled directly on the teacher's `ContinuationProblem` trait
//! (`continuation/problem.rs`) — a small set of fallible evaluation methods
//! returning `anyhow::Result`, with the concrete numerics supplied by
//! whoever constructs the trait object.

use nalgebra::{Matrix3, Vector3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PotentialProperty {
    Energy,
    Forces,
}

/// An opaque energy/force oracle for a geometry. Implementations must be
/// pure functions of `(positions, cell, pbc)`: repeated calls with unchanged
/// arguments must return identical results.
/// `Send` so that interior images can be evaluated from a fork-join thread
/// scope (`world::ParallelMode::Threaded`) without sharing non-atomic state.
pub trait Calculator: Send {
    fn implemented_properties(&self) -> &'static [PotentialProperty];

    fn get_potential_energy(
        &mut self,
        positions: &[Vector3<f64>],
        cell: &Matrix3<f64>,
        pbc: [bool; 3],
        force_consistent: bool,
    ) -> anyhow::Result<f64>;

    fn get_forces(
        &mut self,
        positions: &[Vector3<f64>],
        cell: &Matrix3<f64>,
        pbc: [bool; 3],
    ) -> anyhow::Result<Vec<Vector3<f64>>>;
}
