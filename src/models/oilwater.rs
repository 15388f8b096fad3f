//! Two-phase water/oil assembler.
//!
//! Conservation is written per cell in *surface volumes*: the conserved
//! density of phase `ph` is `b_ph * s_ph` (inverse formation-volume factor
//! times saturation), fluxes carry `b_ph * kr_ph / mu_ph` upstreamed as one
//! quantity, and well sources arrive directly as surface-volume rates. For
//! phase `ph` in cell `c`:
//!
//! ```text
//! pv_eff/dt * (b s - (b s)_prev) + div( -T * up(b kr / mu) * dpot ) - q = 0
//! ```
//!
//! with `dpot = grad(p_ph) - g * avg(rho_ph) * grad(z)` and the water
//! pressure shifted by capillary pressure, `p_w = p - Pcow(sw)`.
//!
//! Primary variables, in seeding order: cell pressure, water saturation,
//! then (when wells exist) per-well water and oil surface rates and bhp.

use nalgebra::DVector;
use num_dual::Dual64;

use crate::autodiff::AdVector;
use crate::fluid::{lift, FluidProperties};
use crate::models::{
    accumulation, phase_potential_diff, stabilize_degenerate_rows, upstream_flux,
    AssemblyError, AssemblyOptions, ConvergenceAux, EquationKind, Increments,
    LinearizedProblem, ModelKind, PrimaryVariables, ReservoirModel, ResidualEquation,
};
use crate::operators::DiscreteOperators;
use crate::state::{SimulationState, UpdateLimits};
use crate::wells::WellSet;
use crate::{DrivingForces, Phase};

/// Two-phase water/oil reservoir model.
#[derive(Debug, Clone)]
pub struct OilWaterModel<F: FluidProperties> {
    ops: DiscreteOperators,
    fluid: F,
    wells: WellSet,
    limits: UpdateLimits,
    degenerate_eps: f64,
}

impl<F: FluidProperties> OilWaterModel<F> {
    /// Creates the model over a grid, a fluid, and a (possibly empty)
    /// well set.
    pub fn new(ops: DiscreteOperators, fluid: F, wells: WellSet) -> Self {
        OilWaterModel {
            ops,
            fluid,
            wells,
            limits: UpdateLimits::default(),
            degenerate_eps: 1e-8,
        }
    }

    /// Overrides the update limits.
    pub fn with_limits(mut self, limits: UpdateLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Overrides the absent-phase saturation threshold.
    pub fn with_degenerate_eps(mut self, eps: f64) -> Self {
        self.degenerate_eps = eps;
        self
    }

    /// The discrete operators the model assembles over.
    pub fn operators(&self) -> &DiscreteOperators {
        &self.ops
    }

    /// The fluid property backend.
    pub fn fluid(&self) -> &F {
        &self.fluid
    }

    /// The well set.
    pub fn wells(&self) -> &WellSet {
        &self.wells
    }

    fn check_dims(&self, state: &SimulationState) -> Result<(), AssemblyError> {
        if state.n_cells() != self.ops.n_cells() {
            return Err(AssemblyError::DimensionMismatch(format!(
                "state has {} cells, grid has {}",
                state.n_cells(),
                self.ops.n_cells()
            )));
        }
        if state.n_wells() != self.wells.n_wells() {
            return Err(AssemblyError::DimensionMismatch(format!(
                "state has {} wells, well set has {}",
                state.n_wells(),
                self.wells.n_wells()
            )));
        }
        if !self.wells.is_empty() && self.wells.grid_cells() != self.ops.n_cells() {
            return Err(AssemblyError::DimensionMismatch(format!(
                "well set was built over {} cells, grid has {}",
                self.wells.grid_cells(),
                self.ops.n_cells()
            )));
        }
        Ok(())
    }

    /// Previous-timestep surface-volume density `b * s` per phase.
    fn prev_quantity(&self, prev: &SimulationState, phase: Phase) -> DVector<f64> {
        let n = prev.n_cells();
        DVector::from_iterator(
            n,
            (0..n).map(|i| {
                let (p_ph, s) = match phase {
                    Phase::Water => {
                        let pc = self.fluid.cap_pressure_ow(Dual64::from(prev.sw[i])).re;
                        (prev.pressure[i] - pc, prev.sw[i])
                    }
                    _ => (prev.pressure[i], 1.0 - prev.sw[i]),
                };
                self.fluid.recip_fvf(phase, Dual64::from(p_ph)).re * s
            }),
        )
    }
}

impl<F: FluidProperties> ReservoirModel for OilWaterModel<F> {
    fn kind(&self) -> ModelKind {
        ModelKind::OilWater
    }

    fn n_cells(&self) -> usize {
        self.ops.n_cells()
    }

    fn assemble(
        &self,
        prev: &SimulationState,
        current: &mut SimulationState,
        dt: f64,
        forces: &DrivingForces,
        options: &AssemblyOptions,
    ) -> Result<LinearizedProblem, AssemblyError> {
        self.check_dims(current)?;
        self.check_dims(prev)?;
        let has_wells = !self.wells.is_empty();

        let mut fields = vec![
            ("pressure", current.pressure.clone()),
            ("sw", current.sw.clone()),
        ];
        if has_wells {
            fields.push(("qWs", current.wells.water_rate.clone()));
            fields.push(("qOs", current.wells.oil_rate.clone()));
            fields.push(("bhp", current.wells.bhp.clone()));
        }
        let vars = PrimaryVariables::seed(fields, options.res_only);
        let p = vars.get("pressure")?;
        let sw = vars.get("sw")?;
        let so = 1.0 - sw;

        // Phase pressures and properties.
        let pcow = lift(|s| self.fluid.cap_pressure_ow(s), sw)?;
        let pw = p - &pcow;
        let b_w = lift(|pp| self.fluid.recip_fvf(Phase::Water, pp), &pw)?;
        let b_o = lift(|pp| self.fluid.recip_fvf(Phase::Oil, pp), p)?;
        let mu_w = lift(|pp| self.fluid.viscosity(Phase::Water, pp), &pw)?;
        let mu_o = lift(|pp| self.fluid.viscosity(Phase::Oil, pp), p)?;
        let kr_w = lift(|s| self.fluid.rel_perm(Phase::Water, s), sw)?;
        let kr_o = lift(|s| self.fluid.rel_perm(Phase::Oil, s), &so)?;
        let mob_w = &(&b_w * &kr_w) / &mu_w;
        let mob_o = &(&b_o * &kr_o) / &mu_o;

        let pv_mult = lift(|pp| self.fluid.pv_multiplier(pp), p)?;
        let pv = AdVector::constant(self.ops.pore_volume().clone(), &p.layout());
        let pv_eff = &pv * &pv_mult;

        // Gravity-corrected potentials and upstream fluxes.
        let rho_w = b_w.scale(self.fluid.surface_density(Phase::Water));
        let rho_o = b_o.scale(self.fluid.surface_density(Phase::Oil));
        let dpot_w = phase_potential_diff(&self.ops, &pw, &rho_w, forces.gravity)?;
        let dpot_o = phase_potential_diff(&self.ops, p, &rho_o, forces.gravity)?;
        let (flux_w, _) = upstream_flux(&self.ops, &dpot_w, &mob_w)?;
        let (flux_o, _) = upstream_flux(&self.ops, &dpot_o, &mob_o)?;

        // Accumulation + divergence.
        let acc_w = accumulation(&pv_eff, &(&b_w * sw), &self.prev_quantity(prev, Phase::Water), dt)?;
        let acc_o = accumulation(&pv_eff, &(&b_o * &so), &self.prev_quantity(prev, Phase::Oil), dt)?;
        let mut r_w = &acc_w + &self.ops.div(&flux_w)?;
        let mut r_o = &acc_o + &self.ops.div(&flux_o)?;

        // Well sources and closure equations.
        let mut well_equations = Vec::new();
        if has_wells {
            let qws = vars.get("qWs")?;
            let qos = vars.get("qOs")?;
            let bhp = vars.get("bhp")?;
            let density = self.wells.perforation_mixture_density(prev, &self.fluid);
            let head = self.wells.hydrostatic_head(&density, self.ops.depth(), forces.gravity);
            let comp = self.wells.perforation_composition(&prev.wells);
            let sources = self.wells.phase_sources(
                p,
                bhp,
                &head,
                &[(Phase::Water, &mob_w), (Phase::Oil, &mob_o)],
                &comp,
            )?;
            r_w = &r_w - &self.wells.scatter_to_cells(&sources[0].1)?;
            r_o = &r_o - &self.wells.scatter_to_cells(&sources[1].1)?;

            well_equations.push(ResidualEquation {
                name: "well_water_rate".to_string(),
                kind: EquationKind::WellFlux,
                phase: Some(Phase::Water),
                value: qws - &self.wells.sum_perforations(&sources[0].1)?,
            });
            well_equations.push(ResidualEquation {
                name: "well_oil_rate".to_string(),
                kind: EquationKind::WellFlux,
                phase: Some(Phase::Oil),
                value: qos - &self.wells.sum_perforations(&sources[1].1)?,
            });
            well_equations.push(ResidualEquation {
                name: "well_control".to_string(),
                kind: EquationKind::WellControl,
                phase: None,
                value: self.wells.control_equations(bhp, qws, qos, None)?,
            });
        }

        // Absent-phase rows get a trivial equation pinning sw.
        let absent_w = sw.le_scalar(self.degenerate_eps);
        let absent_o = so.le_scalar(self.degenerate_eps);
        r_w = stabilize_degenerate_rows(&r_w, sw, &absent_w)?;
        r_o = stabilize_degenerate_rows(&r_o, sw, &absent_o)?;

        current.diagnostics.phase_flux = vec![
            (Phase::Water, flux_w.values().clone()),
            (Phase::Oil, flux_o.values().clone()),
        ];
        current.diagnostics.recip_fvf = vec![
            (Phase::Water, b_w.values().clone()),
            (Phase::Oil, b_o.values().clone()),
        ];

        let mean_fvf = |b: &AdVector| {
            b.values().iter().map(|x| 1.0 / x).sum::<f64>() / b.len() as f64
        };
        let aux = ConvergenceAux {
            pore_volume: pv_eff.values().clone(),
            avg_fvf: vec![(Phase::Water, mean_fvf(&b_w)), (Phase::Oil, mean_fvf(&b_o))],
        };

        let mut equations = vec![
            ResidualEquation {
                name: "water".to_string(),
                kind: EquationKind::CellConservation,
                phase: Some(Phase::Water),
                value: r_w,
            },
            ResidualEquation {
                name: "oil".to_string(),
                kind: EquationKind::CellConservation,
                phase: Some(Phase::Oil),
                value: r_o,
            },
        ];
        equations.extend(well_equations);

        Ok(LinearizedProblem {
            equations,
            variable_names: vars.names(),
            group_sizes: vars.group_sizes(),
            dt,
            aux: Some(aux),
        })
    }

    fn update_state(
        &self,
        state: &mut SimulationState,
        increments: &Increments,
    ) -> Result<(), AssemblyError> {
        state.apply_pressure_update(increments.get("pressure")?, &self.limits);
        state.apply_sw_update(increments.get("sw")?, &self.limits);
        if !self.wells.is_empty() {
            let dq_w = increments.get("qWs")?.clone();
            let dq_o = increments.get("qOs")?.clone();
            state.apply_well_updates(
                increments.get("bhp")?,
                &[(Phase::Water, &dq_w), (Phase::Oil, &dq_o)],
                &self.wells.controls(),
                &self.limits,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluid::AnalyticFluid;
    use crate::wells::{Well, WellControl};
    use approx::assert_relative_eq;

    fn model_with_wells() -> OilWaterModel<AnalyticFluid> {
        let ops = DiscreteOperators::cartesian_1d(5, 1e-12, 10.0).unwrap();
        let wells = WellSet::new(
            vec![
                Well {
                    name: "I".to_string(),
                    cells: vec![0],
                    well_index: vec![1e-12],
                    ref_depth: 0.0,
                    control: WellControl::Bhp(250e5),
                    injection: Some([1.0, 0.0, 0.0]),
                },
                Well {
                    name: "P".to_string(),
                    cells: vec![4],
                    well_index: vec![1e-12],
                    ref_depth: 0.0,
                    control: WellControl::Bhp(150e5),
                    injection: None,
                },
            ],
            5,
        )
        .unwrap();
        OilWaterModel::new(ops, AnalyticFluid::default(), wells)
    }

    #[test]
    fn test_assembled_system_is_square() {
        let model = model_with_wells();
        let prev = SimulationState::two_phase(5, 200e5, 0.3, 2);
        let mut current = prev.clone();
        let problem = model
            .assemble(&prev, &mut current, 86400.0, &DrivingForces::without_gravity(), &AssemblyOptions::default())
            .unwrap();
        // 2 cell equations x 5 cells + 3 well equations x 2 wells.
        assert_eq!(problem.n_rows(), 16);
        assert_eq!(problem.n_unknowns(), 16);
        let jac = problem.jacobian().unwrap();
        assert_eq!(jac.rows(), 16);
        assert_eq!(jac.cols(), 16);
    }

    #[test]
    fn test_equilibrium_state_has_zero_cell_residual() {
        // Uniform pressure and saturation, no wells: nothing moves.
        let ops = DiscreteOperators::cartesian_1d(4, 1e-12, 10.0).unwrap();
        let model = OilWaterModel::new(ops, AnalyticFluid::default(), WellSet::empty());
        let prev = SimulationState::two_phase(4, 200e5, 0.3, 0);
        let mut current = prev.clone();
        let problem = model
            .assemble(&prev, &mut current, 86400.0, &DrivingForces::without_gravity(), &AssemblyOptions::default())
            .unwrap();
        for eq in &problem.equations {
            assert_relative_eq!(eq.value.inf_norm(), 0.0);
        }
    }

    #[test]
    fn test_residual_only_assembly_is_idempotent() {
        let model = model_with_wells();
        let prev = SimulationState::two_phase(5, 200e5, 0.3, 2);
        let mut s1 = prev.clone();
        let mut s2 = prev.clone();
        // Perturb so residuals are nonzero.
        s1.pressure[2] = 210e5;
        s2.pressure[2] = 210e5;
        let opts = AssemblyOptions { res_only: true, iteration: 0 };
        let forces = DrivingForces::without_gravity();
        let p1 = model.assemble(&prev, &mut s1, 86400.0, &forces, &opts).unwrap();
        let p2 = model.assemble(&prev, &mut s2, 86400.0, &forces, &opts).unwrap();
        let r1 = p1.residual_vector();
        let r2 = p2.residual_vector();
        assert_eq!(r1, r2);
        assert!(p1.equations[0].value.is_residual_only());
    }

    #[test]
    fn test_injector_pushes_water_into_cell() {
        let model = model_with_wells();
        let mut prev = SimulationState::two_phase(5, 200e5, 0.3, 2);
        // Start the bhp unknowns at their targets; a fresh state carries
        // the reservoir pressure, which gives zero drawdown everywhere.
        prev.wells.bhp[0] = 250e5;
        prev.wells.bhp[1] = 150e5;
        let mut current = prev.clone();
        let problem = model
            .assemble(&prev, &mut current, 86400.0, &DrivingForces::without_gravity(), &AssemblyOptions::default())
            .unwrap();
        // Injector bhp 250e5 over 200e5 cell pressure: the water equation
        // in cell 0 sees a positive source, i.e. a negative residual.
        let water = &problem.equations[0];
        assert!(water.value.values()[0] < 0.0);
        // Producer at 150e5 pulls from cell 4: positive residual there.
        assert!(water.value.values()[4] > 0.0);
    }

    #[test]
    fn test_update_state_routes_increments() {
        let model = model_with_wells();
        let mut state = SimulationState::two_phase(5, 200e5, 0.3, 2);
        let prev = state.clone();
        let mut current = state.clone();
        let problem = model
            .assemble(&prev, &mut current, 86400.0, &DrivingForces::without_gravity(), &AssemblyOptions::default())
            .unwrap();
        let dx = DVector::from_element(problem.n_unknowns(), 1e-3);
        let inc = problem.split_increments(&dx).unwrap();
        model.update_state(&mut state, &inc).unwrap();
        assert_relative_eq!(state.pressure[0], 200e5 + 1e-3);
        assert_relative_eq!(state.sw[0], 0.3 + 1e-3);
        // Bhp-controlled wells are pinned back to target.
        assert_relative_eq!(state.wells.bhp[0], 250e5);
        assert_relative_eq!(state.wells.bhp[1], 150e5);
    }
}
