//! Polymer extension of the two-phase water/oil equation set.
//!
//! Polymer rides entirely in the water phase. Two changes relative to the
//! plain two-phase model, plus one extra equation:
//!
//! - the water viscosity picks up a concentration-dependent multiplier,
//!   `mu_w_eff = mu_w * (1 + k * c)`,
//! - injectors carry a configured injection concentration,
//! - a tracer conservation equation per cell,
//!
//! ```text
//! pv_eff/dt * (bW sW c - (bW sW c)_prev) + div( up_w(c) * bW vW ) - c* qW
//! ```
//!
//! with the face concentration upstreamed by the *water* flow direction
//! and `c*` the injected concentration on injecting perforations, the
//! cell concentration on producing ones.
//!
//! Primary variables: pressure, sw, polymer concentration, then the well
//! groups.

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

/// Two-phase water/oil model with a water-borne polymer tracer.
#[derive(Debug, Clone)]
pub struct PolymerModel<F: FluidProperties> {
    ops: DiscreteOperators,
    fluid: F,
    wells: WellSet,
    limits: UpdateLimits,
    degenerate_eps: f64,
    /// Linear viscosity-multiplier coefficient k in `1 + k c` [sm3/kg]
    viscosity_coeff: f64,
    /// Concentration carried by injecting perforations [kg/sm3]
    injection_concentration: f64,
}

impl<F: FluidProperties> PolymerModel<F> {
    /// Creates the model over a grid, a fluid, and a well set.
    pub fn new(ops: DiscreteOperators, fluid: F, wells: WellSet) -> Self {
        PolymerModel {
            ops,
            fluid,
            wells,
            limits: UpdateLimits::default(),
            degenerate_eps: 1e-8,
            viscosity_coeff: 0.0,
            injection_concentration: 0.0,
        }
    }

    /// Overrides the update limits.
    pub fn with_limits(mut self, limits: UpdateLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Overrides the viscosity-multiplier coefficient.
    pub fn with_viscosity_coeff(mut self, k: f64) -> Self {
        self.viscosity_coeff = k;
        self
    }

    /// Overrides the injected polymer concentration.
    pub fn with_injection_concentration(mut self, c: f64) -> Self {
        self.injection_concentration = c;
        self
    }

    fn check_dims(&self, state: &SimulationState) -> Result<(), AssemblyError> {
        if state.n_cells() != self.ops.n_cells() || state.polymer.len() != self.ops.n_cells() {
            return Err(AssemblyError::DimensionMismatch(format!(
                "state has {} cells and {} polymer entries, grid has {} cells",
                state.n_cells(),
                state.polymer.len(),
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

    fn prev_quantity(&self, prev: &SimulationState, with_polymer: bool, oil: bool) -> DVector<f64> {
        let n = prev.n_cells();
        DVector::from_iterator(
            n,
            (0..n).map(|i| {
                if oil {
                    let b = self.fluid.recip_fvf(Phase::Oil, Dual64::from(prev.pressure[i])).re;
                    return b * (1.0 - prev.sw[i]);
                }
                let pc = self.fluid.cap_pressure_ow(Dual64::from(prev.sw[i])).re;
                let b = self
                    .fluid
                    .recip_fvf(Phase::Water, Dual64::from(prev.pressure[i] - pc))
                    .re;
                let q = b * prev.sw[i];
                if with_polymer { q * prev.polymer[i] } else { q }
            }),
        )
    }
}

impl<F: FluidProperties> ReservoirModel for PolymerModel<F> {
    fn kind(&self) -> ModelKind {
        ModelKind::Polymer
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
            ("polymer", current.polymer.clone()),
        ];
        if has_wells {
            fields.push(("qWs", current.wells.water_rate.clone()));
            fields.push(("qOs", current.wells.oil_rate.clone()));
            fields.push(("bhp", current.wells.bhp.clone()));
        }
        let vars = PrimaryVariables::seed(fields, options.res_only);
        let p = vars.get("pressure")?;
        let sw = vars.get("sw")?;
        let c = vars.get("polymer")?;
        let so = 1.0 - sw;

        let pcow = lift(|s| self.fluid.cap_pressure_ow(s), sw)?;
        let pw = p - &pcow;
        let b_w = lift(|pp| self.fluid.recip_fvf(Phase::Water, pp), &pw)?;
        let b_o = lift(|pp| self.fluid.recip_fvf(Phase::Oil, pp), p)?;
        let mu_w_base = lift(|pp| self.fluid.viscosity(Phase::Water, pp), &pw)?;
        let mu_o = lift(|pp| self.fluid.viscosity(Phase::Oil, pp), p)?;
        // Polymer thickens the water.
        let mu_w = &mu_w_base * &(&c.scale(self.viscosity_coeff) + 1.0);
        let kr_w = lift(|s| self.fluid.rel_perm(Phase::Water, s), sw)?;
        let kr_o = lift(|s| self.fluid.rel_perm(Phase::Oil, s), &so)?;
        let mob_w = &(&b_w * &kr_w) / &mu_w;
        let mob_o = &(&b_o * &kr_o) / &mu_o;

        let pv_mult = lift(|pp| self.fluid.pv_multiplier(pp), p)?;
        let pv = AdVector::constant(self.ops.pore_volume().clone(), &p.layout());
        let pv_eff = &pv * &pv_mult;

        let rho_w = b_w.scale(self.fluid.surface_density(Phase::Water));
        let rho_o = b_o.scale(self.fluid.surface_density(Phase::Oil));
        let dpot_w = phase_potential_diff(&self.ops, &pw, &rho_w, forces.gravity)?;
        let dpot_o = phase_potential_diff(&self.ops, p, &rho_o, forces.gravity)?;
        let (flux_w, up_w) = upstream_flux(&self.ops, &dpot_w, &mob_w)?;
        let (flux_o, _) = upstream_flux(&self.ops, &dpot_o, &mob_o)?;

        // Tracer flux: concentration upstreamed with the water direction.
        let c_face = self.ops.upstream(&up_w, c)?;
        let flux_c = &c_face * &flux_w;

        let acc_w =
            accumulation(&pv_eff, &(&b_w * sw), &self.prev_quantity(prev, false, false), dt)?;
        let acc_o =
            accumulation(&pv_eff, &(&b_o * &so), &self.prev_quantity(prev, false, true), dt)?;
        let acc_c = accumulation(
            &pv_eff,
            &(&(&b_w * sw) * c),
            &self.prev_quantity(prev, true, false),
            dt,
        )?;
        let mut r_w = &acc_w + &self.ops.div(&flux_w)?;
        let mut r_o = &acc_o + &self.ops.div(&flux_o)?;
        let mut r_c = &acc_c + &self.ops.div(&flux_c)?;

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
            let q_w = &sources[0].1;
            // Injecting perforations carry the configured concentration,
            // producing ones the cell's.
            let injecting = q_w.gt_scalar(0.0);
            let c_inj = AdVector::fill(
                self.injection_concentration,
                self.wells.n_perforations(),
                &q_w.layout(),
            );
            let c_perf = self.wells.gather_cells(c)?;
            let c_star = AdVector::select(&injecting, &c_inj, &c_perf)?;
            let q_c = &c_star * q_w;

            r_w = &r_w - &self.wells.scatter_to_cells(q_w)?;
            r_o = &r_o - &self.wells.scatter_to_cells(&sources[1].1)?;
            r_c = &r_c - &self.wells.scatter_to_cells(&q_c)?;

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
                value: qos - &self.wells.sum_perforations(&sources[1].1)?,
            });
            well_equations.push(ResidualEquation {
                name: "well_control".to_string(),
                kind: EquationKind::WellControl,
                phase: None,
                value: self.wells.control_equations(bhp, qws, qos, None)?,
            });
        }

        let absent_w = sw.le_scalar(self.degenerate_eps);
        let absent_o = so.le_scalar(self.degenerate_eps);
        r_w = stabilize_degenerate_rows(&r_w, sw, &absent_w)?;
        r_o = stabilize_degenerate_rows(&r_o, sw, &absent_o)?;
        // No water, no tracer transport: pin the concentration.
        r_c = stabilize_degenerate_rows(&r_c, c, &absent_w)?;

        current.diagnostics.phase_flux = vec![
            (Phase::Water, flux_w.values().clone()),
            (Phase::Oil, flux_o.values().clone()),
        ];
        current.diagnostics.recip_fvf = vec![
            (Phase::Water, b_w.values().clone()),
            (Phase::Oil, b_o.values().clone()),
        ];

        let mean_fvf = |b: &AdVector| {
            b.values().iter().map(|v| 1.0 / v).sum::<f64>() / b.len() as f64
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
            ResidualEquation {
                name: "polymer".to_string(),
                kind: EquationKind::CellConservation,
                phase: None,
                value: r_c,
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
        state.apply_polymer_update(increments.get("polymer")?);
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
