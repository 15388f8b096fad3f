//! Three-phase black-oil assembler with dissolved gas and vaporized oil.
//!
//! Conservation is written per *component* (water, oil, gas) in surface
//! volumes. Gas lives both free and dissolved in oil (ratio `Rs`), oil
//! both free and vaporized in gas (ratio `Rv`), so the oil and gas
//! equations carry cross terms:
//!
//! ```text
//! water: d/dt[pv bW sW]              + div(bW vW)            - qWs
//! oil:   d/dt[pv (bO sO + Rv bG sG)] + div(bO vO + Rv bG vG) - (qOs + Rv qGs)
//! gas:   d/dt[pv (bG sG + Rs bO sO)] + div(bG vG + Rs bO vO) - (qGs + Rs qOs)
//! ```
//!
//! Each cross term is upstreamed with its carrier phase's flow direction.
//!
//! # The shared "x" slot
//!
//! The third cell unknown means different things depending on the cell's
//! lagged [`PhaseStatus`](crate::state::PhaseStatus):
//!
//! - saturated: `x = sg`, and `Rs`/`Rv` sit on their saturated curves
//!   (functions of pressure, differentiated through),
//! - undersaturated oil: `x = Rs` with `sg = 0`,
//! - undersaturated gas: `x = Rv` with `sg = 1 - sw`.
//!
//! The status flags are refreshed once per timestep in
//! [`ReservoirModel::prepare_step`] and never mid-loop, so the meaning of
//! the unknowns is fixed while Newton iterates.

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
use crate::state::{PhaseStatus, SimulationState, UpdateLimits};
use crate::wells::WellSet;
use crate::{DrivingForces, Phase};

/// Three-phase black-oil reservoir model.
#[derive(Debug, Clone)]
pub struct BlackOilModel<F: FluidProperties> {
    ops: DiscreteOperators,
    fluid: F,
    wells: WellSet,
    limits: UpdateLimits,
    degenerate_eps: f64,
}

impl<F: FluidProperties> BlackOilModel<F> {
    /// Creates the model over a grid, a fluid, and a well set.
    pub fn new(ops: DiscreteOperators, fluid: F, wells: WellSet) -> Self {
        BlackOilModel {
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

    /// Overrides the phase-presence threshold used both for the lagged
    /// status refresh and for degenerate-row detection.
    pub fn with_degenerate_eps(mut self, eps: f64) -> Self {
        self.degenerate_eps = eps;
        self
    }

    /// The discrete operators the model assembles over.
    pub fn operators(&self) -> &DiscreteOperators {
        &self.ops
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

    /// The stored value of the x slot per cell, per the lagged status.
    fn x_values(&self, state: &SimulationState) -> DVector<f64> {
        DVector::from_iterator(
            state.n_cells(),
            state.status.iter().enumerate().map(|(i, st)| match st {
                PhaseStatus::Saturated => state.sg[i],
                PhaseStatus::UndersaturatedOil => state.rs[i],
                PhaseStatus::UndersaturatedGas => state.rv[i],
            }),
        )
    }

    /// Previous-timestep component surface-volume densities
    /// (water, oil, gas) per cell.
    fn prev_quantities(&self, prev: &SimulationState) -> [DVector<f64>; 3] {
        let n = prev.n_cells();
        let mut water = DVector::zeros(n);
        let mut oil = DVector::zeros(n);
        let mut gas = DVector::zeros(n);
        for i in 0..n {
            let p = Dual64::from(prev.pressure[i]);
            let pc = self.fluid.cap_pressure_ow(Dual64::from(prev.sw[i])).re;
            let sw = prev.sw[i];
            let sg = prev.sg[i];
            let so = 1.0 - sw - sg;
            let b_w = self.fluid.recip_fvf(Phase::Water, Dual64::from(prev.pressure[i] - pc)).re;
            let b_o = self.fluid.recip_fvf(Phase::Oil, p).re;
            let b_g = self.fluid.recip_fvf(Phase::Gas, p).re;
            water[i] = b_w * sw;
            oil[i] = b_o * so + prev.rv[i] * b_g * sg;
            gas[i] = b_g * sg + prev.rs[i] * b_o * so;
        }
        [water, oil, gas]
    }
}

impl<F: FluidProperties> ReservoirModel for BlackOilModel<F> {
    fn kind(&self) -> ModelKind {
        ModelKind::BlackOil
    }

    fn n_cells(&self) -> usize {
        self.ops.n_cells()
    }

    fn prepare_step(&self, state: &mut SimulationState) {
        state.refresh_phase_status(&self.fluid, self.degenerate_eps);
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
            ("x", self.x_values(current)),
        ];
        if has_wells {
            fields.push(("qWs", current.wells.water_rate.clone()));
            fields.push(("qOs", current.wells.oil_rate.clone()));
            fields.push(("qGs", current.wells.gas_rate.clone()));
            fields.push(("bhp", current.wells.bhp.clone()));
        }
        let vars = PrimaryVariables::seed(fields, options.res_only);
        let p = vars.get("pressure")?;
        let sw = vars.get("sw")?;
        let x = vars.get("x")?;
        let layout = p.layout();

        // Route the x slot by the lagged status.
        let sat: Vec<bool> = current.status.iter().map(|s| *s == PhaseStatus::Saturated).collect();
        let uo: Vec<bool> =
            current.status.iter().map(|s| *s == PhaseStatus::UndersaturatedOil).collect();
        let ug: Vec<bool> =
            current.status.iter().map(|s| *s == PhaseStatus::UndersaturatedGas).collect();

        let zero = AdVector::fill(0.0, p.len(), &layout);
        let rs_sat = lift(|pp| self.fluid.rs_sat(pp), p)?;
        let rv_sat = lift(|pp| self.fluid.rv_sat(pp), p)?;
        let sg = AdVector::select(&sat, x, &AdVector::select(&ug, &(1.0 - sw), &zero)?)?;
        let rs = AdVector::select(&uo, x, &rs_sat)?;
        let rv = AdVector::select(&ug, x, &rv_sat)?;
        let so = &(1.0 - sw) - &sg;

        // Phase pressures and properties.
        let pcow = lift(|s| self.fluid.cap_pressure_ow(s), sw)?;
        let pw = p - &pcow;
        let b_w = lift(|pp| self.fluid.recip_fvf(Phase::Water, pp), &pw)?;
        let b_o = lift(|pp| self.fluid.recip_fvf(Phase::Oil, pp), p)?;
        let b_g = lift(|pp| self.fluid.recip_fvf(Phase::Gas, pp), p)?;
        let mu_w = lift(|pp| self.fluid.viscosity(Phase::Water, pp), &pw)?;
        let mu_o = lift(|pp| self.fluid.viscosity(Phase::Oil, pp), p)?;
        let mu_g = lift(|pp| self.fluid.viscosity(Phase::Gas, pp), p)?;
        let kr_w = lift(|s| self.fluid.rel_perm(Phase::Water, s), sw)?;
        let kr_o = lift(|s| self.fluid.rel_perm(Phase::Oil, s), &so)?;
        let kr_g = lift(|s| self.fluid.rel_perm(Phase::Gas, s), &sg)?;
        let mob_w = &(&b_w * &kr_w) / &mu_w;
        let mob_o = &(&b_o * &kr_o) / &mu_o;
        let mob_g = &(&b_g * &kr_g) / &mu_g;

        let pv_mult = lift(|pp| self.fluid.pv_multiplier(pp), p)?;
        let pv = AdVector::constant(self.ops.pore_volume().clone(), &layout);
        let pv_eff = &pv * &pv_mult;

        // Reservoir densities, including dissolved/vaporized mass.
        let sd_w = self.fluid.surface_density(Phase::Water);
        let sd_o = self.fluid.surface_density(Phase::Oil);
        let sd_g = self.fluid.surface_density(Phase::Gas);
        let rho_w = b_w.scale(sd_w);
        let rho_o = &(&rs.scale(sd_g) + sd_o) * &b_o;
        let rho_g = &(&rv.scale(sd_o) + sd_g) * &b_g;

        // Phase fluxes, each upstreamed by its own potential drop.
        let dpot_w = phase_potential_diff(&self.ops, &pw, &rho_w, forces.gravity)?;
        let dpot_o = phase_potential_diff(&self.ops, p, &rho_o, forces.gravity)?;
        let dpot_g = phase_potential_diff(&self.ops, p, &rho_g, forces.gravity)?;
        let (flux_w, _) = upstream_flux(&self.ops, &dpot_w, &mob_w)?;
        let (flux_o, up_o) = upstream_flux(&self.ops, &dpot_o, &mob_o)?;
        let (flux_g, up_g) = upstream_flux(&self.ops, &dpot_g, &mob_g)?;

        // Cross-term fluxes ride their carrier phase's direction.
        let neg_trans = AdVector::constant(-self.ops.transmissibility(), &dpot_o.layout());
        let rs_mob_face = self.ops.upstream(&up_o, &(&rs * &mob_o))?;
        let rv_mob_face = self.ops.upstream(&up_g, &(&rv * &mob_g))?;
        let flux_rs = &(&rs_mob_face * &dpot_o) * &neg_trans;
        let flux_rv = &(&rv_mob_face * &dpot_g) * &neg_trans;

        // Accumulation + divergence per component.
        let [q_w0, q_o0, q_g0] = self.prev_quantities(prev);
        let water_mass = &b_w * sw;
        let oil_mass = &(&b_o * &so) + &(&(&rv * &b_g) * &sg);
        let gas_mass = &(&b_g * &sg) + &(&(&rs * &b_o) * &so);
        let mut r_w = &accumulation(&pv_eff, &water_mass, &q_w0, dt)? + &self.ops.div(&flux_w)?;
        let mut r_o = &accumulation(&pv_eff, &oil_mass, &q_o0, dt)?
            + &self.ops.div(&(&flux_o + &flux_rv))?;
        let mut r_g = &accumulation(&pv_eff, &gas_mass, &q_g0, dt)?
            + &self.ops.div(&(&flux_g + &flux_rs))?;

        // Well sources and closure equations.
        let mut well_equations = Vec::new();
        if has_wells {
            let qws = vars.get("qWs")?;
            let qos = vars.get("qOs")?;
            let qgs = vars.get("qGs")?;
            let bhp = vars.get("bhp")?;
            let density = self.wells.perforation_mixture_density(prev, &self.fluid);
            let head = self.wells.hydrostatic_head(&density, self.ops.depth(), forces.gravity);
            let comp = self.wells.perforation_composition(&prev.wells);
            let sources = self.wells.phase_sources(
                p,
                bhp,
                &head,
                &[(Phase::Water, &mob_w), (Phase::Oil, &mob_o), (Phase::Gas, &mob_g)],
                &comp,
            )?;
            let rs_perf = self.wells.gather_cells(&rs)?;
            let rv_perf = self.wells.gather_cells(&rv)?;
            let q_w = &sources[0].1;
            let q_o_comp = &sources[1].1 + &(&rv_perf * &sources[2].1);
            let q_g_comp = &sources[2].1 + &(&rs_perf * &sources[1].1);

            r_w = &r_w - &self.wells.scatter_to_cells(q_w)?;
            r_o = &r_o - &self.wells.scatter_to_cells(&q_o_comp)?;
            r_g = &r_g - &self.wells.scatter_to_cells(&q_g_comp)?;

            well_equations.push(ResidualEquation {
                name: "well_water_rate".to_string(),
                kind: EquationKind::WellFlux,
                phase: Some(Phase::Water),
                value: qws - &self.wells.sum_perforations(q_w)?,
            });
            well_equations.push(ResidualEquation {
                name: "well_oil_rate".to_string(),
                kind: EquationKind::WellFlux,
                phase: Some(Phase::Oil),
                value: qos - &self.wells.sum_perforations(&q_o_comp)?,
            });
            well_equations.push(ResidualEquation {
                name: "well_gas_rate".to_string(),
                kind: EquationKind::WellFlux,
                phase: Some(Phase::Gas),
                value: qgs - &self.wells.sum_perforations(&q_g_comp)?,
            });
            well_equations.push(ResidualEquation {
                name: "well_control".to_string(),
                kind: EquationKind::WellControl,
                phase: None,
                value: self.wells.control_equations(bhp, qws, qos, Some(qgs))?,
            });
        }

        // Rows of truly absent components pin the x slot instead.
        let eps = self.degenerate_eps;
        let absent_w = sw.le_scalar(eps);
        let absent_o: Vec<bool> = so
            .values()
            .iter()
            .zip(rv.values().iter())
            .map(|(&s, &r)| s <= eps && r <= eps)
            .collect();
        let absent_g: Vec<bool> = sg
            .values()
            .iter()
            .zip(rs.values().iter())
            .map(|(&s, &r)| s <= eps && r <= eps)
            .collect();
        r_w = stabilize_degenerate_rows(&r_w, sw, &absent_w)?;
        r_o = stabilize_degenerate_rows(&r_o, x, &absent_o)?;
        r_g = stabilize_degenerate_rows(&r_g, x, &absent_g)?;

        current.diagnostics.phase_flux = vec![
            (Phase::Water, flux_w.values().clone()),
            (Phase::Oil, flux_o.values().clone()),
            (Phase::Gas, flux_g.values().clone()),
        ];
        current.diagnostics.recip_fvf = vec![
            (Phase::Water, b_w.values().clone()),
            (Phase::Oil, b_o.values().clone()),
            (Phase::Gas, b_g.values().clone()),
        ];

        let mean_fvf = |b: &AdVector| {
            b.values().iter().map(|v| 1.0 / v).sum::<f64>() / b.len() as f64
        };
        let aux = ConvergenceAux {
            pore_volume: pv_eff.values().clone(),
            avg_fvf: vec![
                (Phase::Water, mean_fvf(&b_w)),
                (Phase::Oil, mean_fvf(&b_o)),
                (Phase::Gas, mean_fvf(&b_g)),
            ],
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
            ResidualEquation {
                name: "gas".to_string(),
                kind: EquationKind::CellConservation,
                phase: Some(Phase::Gas),
                value: r_g,
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
        state.apply_x_update(increments.get("x")?, &self.limits);
        if !self.wells.is_empty() {
            let dq_w = increments.get("qWs")?.clone();
            let dq_o = increments.get("qOs")?.clone();
            let dq_g = increments.get("qGs")?.clone();
            state.apply_well_updates(
                increments.get("bhp")?,
                &[
                    (Phase::Water, &dq_w),
                    (Phase::Oil, &dq_o),
                    (Phase::Gas, &dq_g),
                ],
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

    fn model(n: usize) -> BlackOilModel<AnalyticFluid> {
        let ops = DiscreteOperators::cartesian_1d(n, 1e-12, 10.0).unwrap();
        BlackOilModel::new(ops, AnalyticFluid::default(), WellSet::empty())
    }

    fn equilibrated_state(m: &BlackOilModel<AnalyticFluid>, n: usize) -> SimulationState {
        let mut state = SimulationState::three_phase(n, 200e5, 0.3, 0.1, 0);
        m.prepare_step(&mut state);
        state
    }

    #[test]
    fn test_assembled_system_is_square_with_wells() {
        let ops = DiscreteOperators::cartesian_1d(4, 1e-12, 10.0).unwrap();
        let wells = WellSet::new(
            vec![Well {
                name: "P".to_string(),
                cells: vec![3],
                well_index: vec![1e-12],
                ref_depth: 0.0,
                control: WellControl::Bhp(150e5),
                injection: None,
            }],
            4,
        )
        .unwrap();
        let m = BlackOilModel::new(ops, AnalyticFluid::default(), wells);
        let mut state = SimulationState::three_phase(4, 200e5, 0.3, 0.1, 1);
        m.prepare_step(&mut state);
        let prev = state.clone();
        let problem = m
            .assemble(&prev, &mut state, 3600.0, &DrivingForces::without_gravity(), &AssemblyOptions::default())
            .unwrap();
        // 3 cell equations x 4 cells + (3 rate + 1 control) x 1 well.
        assert_eq!(problem.n_rows(), 16);
        assert_eq!(problem.n_unknowns(), 16);
    }

    #[test]
    fn test_equilibrium_has_zero_residual() {
        let m = model(4);
        let prev = equilibrated_state(&m, 4);
        let mut current = prev.clone();
        let problem = m
            .assemble(&prev, &mut current, 3600.0, &DrivingForces::without_gravity(), &AssemblyOptions::default())
            .unwrap();
        for eq in &problem.equations {
            assert_relative_eq!(eq.value.inf_norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_x_slot_routing_matches_status() {
        let m = model(3);
        let mut state = SimulationState::three_phase(3, 200e5, 0.3, 0.1, 0);
        // Cell 1: no free gas, some dissolved gas below saturation.
        state.sg[1] = 0.0;
        // Cell 2: only water and gas.
        state.sw[2] = 0.35;
        state.sg[2] = 0.65;
        m.prepare_step(&mut state);
        assert_eq!(state.status[0], PhaseStatus::Saturated);
        assert_eq!(state.status[1], PhaseStatus::UndersaturatedOil);
        assert_eq!(state.status[2], PhaseStatus::UndersaturatedGas);
        state.rs[1] = 0.5 * state.rs[0];

        let x = m.x_values(&state);
        assert_relative_eq!(x[0], state.sg[0]);
        assert_relative_eq!(x[1], state.rs[1]);
        assert_relative_eq!(x[2], state.rv[2]);
    }

    #[test]
    fn test_status_unchanged_by_residual_only_assemblies() {
        let m = model(4);
        let prev = equilibrated_state(&m, 4);
        let mut current = prev.clone();
        // Push cell 1 out of equilibrium so the residual is nonzero.
        current.pressure[1] = 215e5;
        let flags = current.status.clone();
        let opts = AssemblyOptions { res_only: true, iteration: 0 };
        let forces = DrivingForces::without_gravity();
        m.assemble(&prev, &mut current, 3600.0, &forces, &opts).unwrap();
        assert_eq!(current.status, flags);
        m.assemble(&prev, &mut current, 3600.0, &forces, &opts).unwrap();
        assert_eq!(current.status, flags);
    }

    #[test]
    fn test_gas_dissolution_couples_gas_equation_to_pressure() {
        // Undersaturated-oil cells: gas exists only as Rs * bO * sO, so
        // the gas accumulation must still respond to the x (= Rs) slot.
        let m = model(2);
        let mut state = SimulationState::three_phase(2, 200e5, 0.3, 0.0, 0);
        m.prepare_step(&mut state);
        assert!(state.status.iter().all(|s| *s == PhaseStatus::UndersaturatedOil));
        state.rs = DVector::from_element(2, 5.0);
        let prev = state.clone();
        let mut current = state.clone();
        let problem = m
            .assemble(&prev, &mut current, 3600.0, &DrivingForces::without_gravity(), &AssemblyOptions::default())
            .unwrap();
        let gas = problem
            .equations
            .iter()
            .find(|e| e.name == "gas")
            .unwrap();
        let jac = gas.value.full_jacobian().unwrap();
        // Columns 2n..3n belong to x; the diagonal there must be live.
        let mut x_diag = 0.0;
        for (v, (i, j)) in jac.iter() {
            if i == 0 && j == 4 {
                x_diag = *v;
            }
        }
        assert!(x_diag.abs() > 0.0);
    }

    #[test]
    fn test_update_state_routes_x_by_status() {
        let m = model(2);
        let mut state = SimulationState::three_phase(2, 200e5, 0.3, 0.1, 0);
        state.sg[1] = 0.0;
        m.prepare_step(&mut state);
        state.rs[1] = 10.0;
        let prev = state.clone();
        let mut current = state.clone();
        let problem = m
            .assemble(&prev, &mut current, 3600.0, &DrivingForces::without_gravity(), &AssemblyOptions::default())
            .unwrap();
        let mut dx = DVector::zeros(problem.n_unknowns());
        dx[4] = 0.05; // x slot, cell 0 (saturated)
        dx[5] = 1.0; // x slot, cell 1 (undersaturated oil)
        let inc = problem.split_increments(&dx).unwrap();
        let sg0 = state.sg[0];
        let rs1 = state.rs[1];
        m.update_state(&mut state, &inc).unwrap();
        assert_relative_eq!(state.sg[0], sg0 + 0.05);
        assert_relative_eq!(state.rs[1], rs1 + 1.0);
        assert_relative_eq!(state.sg[1], 0.0);
    }
}
