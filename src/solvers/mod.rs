//! The Newton step driver.
//!
//! [`NewtonSolver::step`] advances one timestep of any
//! [`ReservoirModel`]: assemble the linearized problem at the current
//! iterate, check convergence, solve the dense LU system for the Newton
//! increment, optionally damp or line-search it, push it through the
//! model's limited state update, and repeat until the criterion passes or
//! the iteration budget runs out.
//!
//! Failure policy: structural assembly errors (unknown variable, wrong
//! grid sizes) abort the step with an `Err`. Everything the outer
//! timestep controller might want to react to instead, a singular or
//! non-finite linear solve and plain non-convergence, is reported in the
//! returned [`StepReport`] with the last consistent state. The driver
//! never retries internally and never cuts the timestep; that policy
//! belongs to the caller.
//!
//! The final assembly of every step (converged or not) runs in
//! residual-only mode so the returned state carries fresh diagnostics
//! without paying for derivatives.

use nalgebra::{DMatrix, DVector};
use sprs::CsMat;

use crate::convergence::{ConvergenceCriterion, ConvergenceReport};
use crate::models::{AssemblyError, AssemblyOptions, LinearizedProblem, ReservoirModel};
use crate::state::SimulationState;
use crate::DrivingForces;

/// Non-structural step failures, carried in the [`StepReport`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolverError {
    /// The linear system was singular or produced non-finite increments
    #[error("linear solver failure: {0}")]
    LinearSolverFailure(String),
    /// The iteration budget ran out before the criterion passed
    #[error("no convergence in {0} iterations")]
    DidNotConverge(usize),
}

/// Knobs of the Newton loop.
#[derive(Debug, Clone, Copy)]
pub struct NewtonConfig {
    /// Iteration ceiling per step
    pub max_iterations: usize,
    /// Updates required before convergence may be declared
    pub min_iterations: usize,
    /// Constant damping factor applied to every increment
    pub relaxation: f64,
    /// Enable backtracking line search on the residual norm
    pub line_search: bool,
    /// Halvings attempted before the line search gives up
    pub max_line_search_steps: usize,
    /// Convergence strategy
    pub criterion: ConvergenceCriterion,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        NewtonConfig {
            max_iterations: 25,
            min_iterations: 1,
            relaxation: 1.0,
            line_search: false,
            max_line_search_steps: 5,
            criterion: ConvergenceCriterion::default(),
        }
    }
}

impl NewtonConfig {
    /// Overrides the iteration ceiling.
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    /// Overrides the minimum update count.
    pub fn with_min_iterations(mut self, n: usize) -> Self {
        self.min_iterations = n;
        self
    }

    /// Overrides the damping factor.
    pub fn with_relaxation(mut self, factor: f64) -> Self {
        self.relaxation = factor;
        self
    }

    /// Enables or disables the backtracking line search.
    pub fn with_line_search(mut self, enabled: bool) -> Self {
        self.line_search = enabled;
        self
    }

    /// Overrides the convergence criterion.
    pub fn with_criterion(mut self, criterion: ConvergenceCriterion) -> Self {
        self.criterion = criterion;
        self
    }
}

/// Outcome of one timestep attempt.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    /// Whether the criterion passed
    pub converged: bool,
    /// State updates performed
    pub iterations: usize,
    /// The failure, when `converged` is false
    pub failure: Option<SolverError>,
    /// Per-iteration equation infinity norms, for the outer controller's
    /// timestep heuristics
    pub residual_history: Vec<Vec<(String, f64)>>,
    /// The last convergence evaluation
    pub convergence: ConvergenceReport,
}

/// Fully-implicit Newton step driver.
#[derive(Debug, Clone, Default)]
pub struct NewtonSolver {
    config: NewtonConfig,
}

impl NewtonSolver {
    /// Creates a driver with the given configuration.
    pub fn new(config: NewtonConfig) -> Self {
        NewtonSolver { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    /// Evaluates the configured criterion against an assembled problem.
    pub fn check_convergence(&self, problem: &LinearizedProblem) -> ConvergenceReport {
        self.config.criterion.evaluate(problem)
    }

    /// Advances one timestep from `prev`.
    ///
    /// Returns the new state (the last consistent iterate, even on
    /// failure) and the step report.
    ///
    /// # Errors
    ///
    /// [`AssemblyError`] for structural assembly problems only;
    /// convergence and linear-solver trouble lands in the report.
    pub fn step<M: ReservoirModel>(
        &self,
        model: &M,
        prev: &SimulationState,
        dt: f64,
        forces: &DrivingForces,
    ) -> Result<(SimulationState, StepReport), AssemblyError> {
        let mut state = prev.clone();
        model.prepare_step(&mut state);
        let mut report = StepReport::default();

        if model.is_linear() {
            return self.linear_step(model, prev, state, dt, forces);
        }

        loop {
            let options = AssemblyOptions { res_only: false, iteration: report.iterations };
            let problem = model.assemble(prev, &mut state, dt, forces, &options)?;
            report.residual_history.push(problem.residual_norms());
            report.convergence = self.config.criterion.evaluate(&problem);
            log::debug!(
                "newton iteration {}: worst residual ratio {:.3e}",
                report.iterations,
                report.convergence.worst_ratio()
            );

            if report.convergence.converged() && report.iterations >= self.config.min_iterations {
                report.converged = true;
                break;
            }
            if report.iterations >= self.config.max_iterations {
                report.failure = Some(SolverError::DidNotConverge(report.iterations));
                break;
            }

            let dx = match self.solve_linear(&problem) {
                Ok(dx) => dx,
                Err(e) => {
                    report.failure = Some(e);
                    break;
                }
            };
            let dx = dx * self.config.relaxation;

            if self.config.line_search {
                state = self.line_searched_update(model, prev, &state, &problem, &dx, dt, forces)?;
            } else {
                let increments = problem.split_increments(&dx)?;
                model.update_state(&mut state, &increments)?;
            }
            report.iterations += 1;
        }

        match &report.failure {
            None => log::info!(
                "newton converged in {} iterations (dt = {:.3e} s)",
                report.iterations,
                dt
            ),
            Some(e) => log::warn!("newton step failed: {e}"),
        }

        // Residual-only pass refreshes the diagnostics on the final state.
        let refresh = AssemblyOptions { res_only: true, iteration: report.iterations };
        model.assemble(prev, &mut state, dt, forces, &refresh)?;
        Ok((state, report))
    }

    /// One solve, one update, no loop: for models that declare themselves
    /// linear in the unknowns.
    fn linear_step<M: ReservoirModel>(
        &self,
        model: &M,
        prev: &SimulationState,
        mut state: SimulationState,
        dt: f64,
        forces: &DrivingForces,
    ) -> Result<(SimulationState, StepReport), AssemblyError> {
        let mut report = StepReport::default();
        let options = AssemblyOptions { res_only: false, iteration: 0 };
        let problem = model.assemble(prev, &mut state, dt, forces, &options)?;
        report.residual_history.push(problem.residual_norms());
        match self.solve_linear(&problem) {
            Ok(dx) => {
                let increments = problem.split_increments(&dx)?;
                model.update_state(&mut state, &increments)?;
                report.iterations = 1;
                report.converged = true;
            }
            Err(e) => {
                report.failure = Some(e);
            }
        }
        let refresh = AssemblyOptions { res_only: true, iteration: 1 };
        let refreshed = model.assemble(prev, &mut state, dt, forces, &refresh)?;
        report.convergence = self.config.criterion.evaluate(&refreshed);
        Ok((state, report))
    }

    /// Solves `J dx = -r` by dense LU.
    fn solve_linear(&self, problem: &LinearizedProblem) -> Result<DVector<f64>, SolverError> {
        let jac = problem
            .jacobian()
            .map_err(|e| SolverError::LinearSolverFailure(e.to_string()))?;
        let rhs = -problem.residual_vector();
        let dx = densify(&jac)
            .lu()
            .solve(&rhs)
            .ok_or_else(|| SolverError::LinearSolverFailure("singular Jacobian".to_string()))?;
        if dx.iter().any(|x| !x.is_finite()) {
            return Err(SolverError::LinearSolverFailure(
                "non-finite Newton increment".to_string(),
            ));
        }
        Ok(dx)
    }

    /// Backtracking line search on the stacked residual infinity norm.
    ///
    /// Halves the increment until the residual-only re-evaluation improves
    /// on the base norm; accepts the last candidate when the budget runs
    /// out, so progress never stalls completely.
    #[allow(clippy::too_many_arguments)]
    fn line_searched_update<M: ReservoirModel>(
        &self,
        model: &M,
        prev: &SimulationState,
        state: &SimulationState,
        problem: &LinearizedProblem,
        dx: &DVector<f64>,
        dt: f64,
        forces: &DrivingForces,
    ) -> Result<SimulationState, AssemblyError> {
        let base_norm = problem.residual_vector().amax();
        let options = AssemblyOptions { res_only: true, iteration: 0 };
        let mut alpha = 1.0;
        let mut last = None;
        for attempt in 0..=self.config.max_line_search_steps {
            let mut trial = state.clone();
            let increments = problem.split_increments(&(dx * alpha))?;
            model.update_state(&mut trial, &increments)?;
            let evaluated = model.assemble(prev, &mut trial, dt, forces, &options)?;
            let norm = evaluated.residual_vector().amax();
            if norm < base_norm {
                if attempt > 0 {
                    log::debug!("line search accepted alpha = {alpha}");
                }
                return Ok(trial);
            }
            last = Some(trial);
            alpha *= 0.5;
        }
        log::debug!("line search exhausted, accepting smallest step");
        Ok(last.unwrap_or_else(|| state.clone()))
    }
}

fn densify(m: &CsMat<f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(m.rows(), m.cols());
    for (v, (i, j)) in m.iter() {
        dense[(i, j)] += *v;
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluid::{AnalyticFluid, FluidProperties};
    use crate::models::oilwater::OilWaterModel;
    use crate::models::{
        EquationKind, Increments, ModelKind, PrimaryVariables, ResidualEquation,
    };
    use crate::operators::DiscreteOperators;
    use crate::wells::{Well, WellControl, WellSet};
    use crate::Phase;
    use approx::assert_relative_eq;
    use num_dual::Dual64;

    fn producer_model(n: usize, bhp: f64) -> OilWaterModel<AnalyticFluid> {
        let ops = DiscreteOperators::cartesian_1d(n, 1e-12, 10.0).unwrap();
        let wells = WellSet::new(
            vec![Well {
                name: "P".to_string(),
                cells: vec![n - 1],
                well_index: vec![5e-13],
                ref_depth: 0.0,
                control: WellControl::Bhp(bhp),
                injection: None,
            }],
            n,
        )
        .unwrap();
        OilWaterModel::new(ops, AnalyticFluid::default(), wells)
    }

    #[test]
    fn test_single_cell_drawdown_converges_fast() {
        let model = producer_model(1, 180e5);
        let prev = SimulationState::two_phase(1, 200e5, 0.3, 1);
        let solver = NewtonSolver::new(
            NewtonConfig::default()
                .with_criterion(ConvergenceCriterion::ResidualNorm { tolerance: 1e-6 }),
        );
        let (next, report) = solver
            .step(&model, &prev, 3600.0, &DrivingForces::without_gravity())
            .unwrap();
        assert!(report.converged, "failure: {:?}", report.failure);
        assert!(report.iterations < 10, "took {} iterations", report.iterations);
        // Production depletes the cell.
        assert!(next.pressure[0] < prev.pressure[0]);
        // Residual shrank from first to last evaluated iterate.
        let worst = |norms: &Vec<(String, f64)>| {
            norms.iter().map(|(_, v)| *v).fold(0.0_f64, f64::max)
        };
        let first = worst(&report.residual_history[0]);
        let last = worst(report.residual_history.last().unwrap());
        assert!(last < first * 1e-3, "first {first}, last {last}");
    }

    #[test]
    fn test_bhp_control_is_exact_after_step() {
        let model = producer_model(3, 170e5);
        let prev = SimulationState::two_phase(3, 200e5, 0.3, 1);
        let solver = NewtonSolver::new(NewtonConfig::default());
        let (next, report) = solver
            .step(&model, &prev, 3600.0, &DrivingForces::without_gravity())
            .unwrap();
        assert!(report.converged);
        assert_eq!(next.wells.bhp[0], 170e5);
    }

    #[test]
    fn test_closed_system_conserves_mass() {
        let ops = DiscreteOperators::cartesian_1d(4, 1e-12, 10.0).unwrap();
        let fluid = AnalyticFluid::default();
        let model = OilWaterModel::new(ops, fluid.clone(), WellSet::empty());
        let mut prev = SimulationState::two_phase(4, 200e5, 0.3, 0);
        prev.pressure[0] = 220e5;
        prev.sw[0] = 0.6;
        let solver = NewtonSolver::new(
            NewtonConfig::default()
                .with_criterion(ConvergenceCriterion::ResidualNorm { tolerance: 1e-10 }),
        );
        let (next, report) = solver
            .step(&model, &prev, 3600.0, &DrivingForces::without_gravity())
            .unwrap();
        assert!(report.converged, "failure: {:?}", report.failure);

        let total_water = |s: &SimulationState| {
            (0..4)
                .map(|i| {
                    let pc = fluid.cap_pressure_ow(Dual64::from(s.sw[i])).re;
                    let b = fluid
                        .recip_fvf(Phase::Water, Dual64::from(s.pressure[i] - pc))
                        .re;
                    10.0 * b * s.sw[i]
                })
                .sum::<f64>()
        };
        assert_relative_eq!(total_water(&next), total_water(&prev), max_relative = 1e-6);
    }

    #[test]
    fn test_budget_exhaustion_is_reported_not_raised() {
        let model = producer_model(2, 120e5);
        let prev = SimulationState::two_phase(2, 200e5, 0.3, 1);
        let solver = NewtonSolver::new(
            NewtonConfig::default()
                .with_max_iterations(1)
                .with_criterion(ConvergenceCriterion::ResidualNorm { tolerance: 1e-14 }),
        );
        let (_, report) = solver
            .step(&model, &prev, 3600.0, &DrivingForces::without_gravity())
            .unwrap();
        assert!(!report.converged);
        assert!(matches!(report.failure, Some(SolverError::DidNotConverge(1))));
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn test_line_search_still_converges() {
        let model = producer_model(3, 160e5);
        let prev = SimulationState::two_phase(3, 200e5, 0.3, 1);
        let solver = NewtonSolver::new(
            NewtonConfig::default()
                .with_line_search(true)
                .with_criterion(ConvergenceCriterion::ResidualNorm { tolerance: 1e-6 }),
        );
        let (next, report) = solver
            .step(&model, &prev, 3600.0, &DrivingForces::without_gravity())
            .unwrap();
        assert!(report.converged, "failure: {:?}", report.failure);
        assert!(next.pressure[2] < 200e5);
    }

    #[test]
    fn test_relaxation_slows_but_does_not_break_convergence() {
        let model = producer_model(2, 180e5);
        let prev = SimulationState::two_phase(2, 200e5, 0.3, 1);
        let solver = NewtonSolver::new(
            NewtonConfig::default()
                .with_relaxation(0.7)
                .with_max_iterations(50)
                .with_criterion(ConvergenceCriterion::ResidualNorm { tolerance: 1e-6 }),
        );
        let (_, report) = solver
            .step(&model, &prev, 3600.0, &DrivingForces::without_gravity())
            .unwrap();
        assert!(report.converged, "failure: {:?}", report.failure);
    }

    /// One cell, one unknown, residual `a * p - b`: linear in the unknown,
    /// so a single solve lands on the root exactly.
    struct LinearDecay {
        coefficient: f64,
        target: f64,
    }

    impl ReservoirModel for LinearDecay {
        fn kind(&self) -> ModelKind {
            ModelKind::OilWater
        }

        fn n_cells(&self) -> usize {
            1
        }

        fn assemble(
            &self,
            _prev: &SimulationState,
            current: &mut SimulationState,
            dt: f64,
            _forces: &DrivingForces,
            options: &AssemblyOptions,
        ) -> Result<LinearizedProblem, AssemblyError> {
            let vars = PrimaryVariables::seed(
                vec![("pressure", current.pressure.clone())],
                options.res_only,
            );
            let p = vars.get("pressure")?;
            let value = &p.scale(self.coefficient) - self.target;
            Ok(LinearizedProblem {
                equations: vec![ResidualEquation {
                    name: "decay".to_string(),
                    kind: EquationKind::CellConservation,
                    phase: None,
                    value,
                }],
                variable_names: vars.names(),
                group_sizes: vars.group_sizes(),
                dt,
                aux: None,
            })
        }

        fn update_state(
            &self,
            state: &mut SimulationState,
            increments: &Increments,
        ) -> Result<(), AssemblyError> {
            state.pressure += increments.get("pressure")?;
            Ok(())
        }

        fn is_linear(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_linear_model_short_circuits_to_one_solve() {
        let model = LinearDecay { coefficient: 2.0, target: 10.0 };
        let prev = SimulationState::two_phase(1, 1.0, 0.3, 0);
        let solver = NewtonSolver::new(
            NewtonConfig::default()
                .with_criterion(ConvergenceCriterion::ResidualNorm { tolerance: 1e-9 }),
        );
        let (next, report) = solver
            .step(&model, &prev, 1.0, &DrivingForces::without_gravity())
            .unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 1);
        assert_relative_eq!(next.pressure[0], 5.0);
        // The trailing residual-only evaluation confirms the exact root.
        assert!(report.convergence.converged());
        assert_eq!(report.residual_history.len(), 1);
    }

    #[test]
    fn test_final_state_carries_diagnostics() {
        let model = producer_model(3, 180e5);
        let prev = SimulationState::two_phase(3, 200e5, 0.3, 1);
        let solver = NewtonSolver::new(NewtonConfig::default());
        let (next, _) = solver
            .step(&model, &prev, 3600.0, &DrivingForces::without_gravity())
            .unwrap();
        // The trailing residual-only assembly filled the caches.
        assert_eq!(next.diagnostics.phase_flux.len(), 2);
        assert_eq!(next.diagnostics.recip_fvf.len(), 2);
        assert_eq!(next.diagnostics.phase_flux[0].1.len(), 2);
    }
}
