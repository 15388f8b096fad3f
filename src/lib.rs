//! # Petrosim: Fully-Implicit Reservoir Simulation on Automatic Differentiation
//!
//! A framework for solving the coupled nonlinear PDEs of multiphase flow in
//! porous media (water/oil/gas, with an optional polymer tracer), coupled to
//! well models, using a fully-implicit discretization and an adaptive
//! Newton loop.
//!
//! The hard core is the residual-assembly and Newton machinery:
//!
//! - [`autodiff`]: an AD value type ([`AdVector`](autodiff::AdVector)) that
//!   carries a value array plus one sparse Jacobian block per independent
//!   primary-variable group, so Jacobian assembly stays O(nnz).
//! - [`models`]: per-variant residual assemblers (two-phase water/oil,
//!   three-phase black-oil with dissolved gas and vaporized oil, polymer)
//!   that combine AD primary variables, fluid properties, and discrete grid
//!   operators into named balance equations plus well-coupling residuals.
//! - [`convergence`]: interchangeable convergence checkers (a generic
//!   infinity-norm criterion and the black-oil CNV/MB metrics).
//! - [`solvers`]: the Newton step driver, which assembles, checks
//!   convergence, solves for the increment, limits or line-searches it,
//!   updates the state, and repeats.
//! - [`state`]: the state snapshot and the increment-to-physics mapping
//!   with bound limiting and phase-status-aware variable routing.
//!
//! Grid geometry, deck parsing, PVT table interpolation, and visualization
//! are external collaborators: the grid enters as precomputed discrete
//! operators ([`operators::DiscreteOperators`]), fluids as pure property
//! functions ([`fluid::FluidProperties`]), wells as perforation-to-cell
//! maps ([`wells::WellSet`]).
//!
//! ## Example
//!
//! ```
//! use petrosim::operators::DiscreteOperators;
//! use petrosim::fluid::AnalyticFluid;
//! use petrosim::models::oilwater::OilWaterModel;
//! use petrosim::solvers::{NewtonConfig, NewtonSolver};
//! use petrosim::state::SimulationState;
//! use petrosim::wells::WellSet;
//! use petrosim::DrivingForces;
//!
//! let ops = DiscreteOperators::cartesian_1d(10, 1e-12, 1.0).unwrap();
//! let model = OilWaterModel::new(ops, AnalyticFluid::default(), WellSet::empty());
//! let state = SimulationState::two_phase(10, 200e5, 0.2, 0);
//!
//! let solver = NewtonSolver::new(NewtonConfig::default());
//! let (next, report) = solver
//!     .step(&model, &state, 86400.0, &DrivingForces::without_gravity())
//!     .unwrap();
//! assert!(report.converged);
//! # let _ = next;
//! ```

pub mod autodiff;
pub mod convergence;
pub mod fluid;
pub mod models;
pub mod operators;
pub mod solvers;
pub mod state;
pub mod wells;

// Convenience re-exports of the types nearly every consumer touches.
pub use autodiff::{AdError, AdVector, BlockLayout};
pub use convergence::{ConvergenceCriterion, ConvergenceReport};
pub use models::{AssemblyError, LinearizedProblem, ModelKind, ReservoirModel};
pub use solvers::{NewtonConfig, NewtonSolver, SolverError, StepReport};
pub use state::{PhaseStatus, SimulationState, UpdateLimits};

/// Fluid phases tracked by the simulation models.
///
/// The two-phase model uses `Water`/`Oil`; the black-oil model adds `Gas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Aqueous phase
    Water,
    /// Oleic phase (may carry dissolved gas, Rs)
    Oil,
    /// Gaseous phase (may carry vaporized oil, Rv)
    Gas,
}

impl Phase {
    /// Short lowercase tag used in equation and diagnostic names.
    pub fn tag(&self) -> &'static str {
        match self {
            Phase::Water => "water",
            Phase::Oil => "oil",
            Phase::Gas => "gas",
        }
    }
}

/// External driving forces entering the residual equations.
///
/// Boundary fluxes and source decks are out of scope; gravity is the one
/// force the discretized phase potentials need.
#[derive(Debug, Clone, Copy)]
pub struct DrivingForces {
    /// Gravitational acceleration along increasing cell depth [m/s^2]
    pub gravity: f64,
}

impl DrivingForces {
    /// Creates forces with the given gravitational acceleration.
    pub fn new(gravity: f64) -> Self {
        DrivingForces { gravity }
    }

    /// No gravity; useful for horizontal-only test problems.
    pub fn without_gravity() -> Self {
        DrivingForces { gravity: 0.0 }
    }
}

impl Default for DrivingForces {
    fn default() -> Self {
        DrivingForces { gravity: 9.80665 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_tags() {
        assert_eq!(Phase::Water.tag(), "water");
        assert_eq!(Phase::Oil.tag(), "oil");
        assert_eq!(Phase::Gas.tag(), "gas");
    }

    #[test]
    fn test_driving_forces() {
        let f = DrivingForces::default();
        assert!((f.gravity - 9.80665).abs() < 1e-12);
        assert_eq!(DrivingForces::without_gravity().gravity, 0.0);
    }
}
