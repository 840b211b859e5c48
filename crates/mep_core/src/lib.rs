//! `mep_core` is the engine behind minimum energy path finding for
//! atomistic systems: the standard nudged elastic band (NEB) method in its
//! `aseneb`/`improvedtangent`/`eb` tangent variants with optional climbing
//! image and dynamic relaxation, and a preconditioned MEP driver (NEB and
//! String variants) that reparameterizes the path by arc length in a
//! per-image preconditioned metric.
//!
//! The crate is deliberately narrow: it owns the path representation, the
//! tangent/force/spline math, and the optimization harness that drives a
//! chain to a force-balance fixed point. It does not own file I/O, plotting,
//! or a CLI — those are left to an embedding application, reached through
//! the `Calculator` trait object and the plain settings structs in
//! [`config`].

pub mod calculator;
pub mod chain;
pub mod config;
pub mod configuration;
pub mod error;
pub mod geometry;
pub mod idpp;
pub mod logging;
pub mod neb;
pub mod optim;
pub mod precon;
pub mod precon_mep;
pub mod projector;
pub mod spline;
pub mod tangent;
pub mod world;

pub use calculator::{Calculator, PotentialProperty};
pub use chain::{ImageChain, InterpolationMethod};
pub use configuration::Configuration;
pub use error::{MepError, Result};
pub use neb::Neb;
pub use precon_mep::PreconMep;
pub use tangent::Method;
pub use world::{LocalWorld, ParallelMode, World};
