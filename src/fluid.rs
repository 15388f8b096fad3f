//! Fluid and rock property interfaces.
//!
//! PVT and relative-permeability *tables* are an external collaborator; the
//! simulator only ever sees pure property functions. Each property is a
//! scalar function written once over [`num_dual::Dual64`], so its exact
//! derivative comes for free, and [`lift`] chains the per-cell
//! (value, derivative) pairs onto an [`AdVector`] argument.
//!
//! The black-oil property set:
//!
//! - `b(p)`: inverse formation-volume factor per phase (surface volume per
//!   reservoir volume),
//! - `mu(p)`: phase viscosity,
//! - `kr(s)`: relative permeability per phase,
//! - `Pcow(sw)`: water-oil capillary pressure,
//! - `Rs_sat(p)` / `Rv_sat(p)`: saturated dissolved-gas and vaporized-oil
//!   ratios,
//! - rock pore-volume multiplier for rock compressibility,
//! - surface densities (plain constants).
//!
//! [`AnalyticFluid`] provides exponential-compressibility and Corey-type
//! correlations for tests and demos.

use nalgebra::DVector;
use num_dual::{Dual64, DualNum};

use crate::autodiff::{AdError, AdVector};
use crate::Phase;

/// Pure fluid and rock property functions over dual numbers.
///
/// Implementations must be deterministic and side-effect free; the
/// assembler may evaluate them any number of times per iteration.
pub trait FluidProperties {
    /// Inverse formation-volume factor `b(p) = 1/B(p)` [-].
    fn recip_fvf(&self, phase: Phase, p: Dual64) -> Dual64;

    /// Phase viscosity `mu(p)` [Pa s].
    fn viscosity(&self, phase: Phase, p: Dual64) -> Dual64;

    /// Relative permeability `kr(s)` of a phase at its own saturation [-].
    fn rel_perm(&self, phase: Phase, s: Dual64) -> Dual64;

    /// Water-oil capillary pressure `Pcow(sw) = p_o - p_w` [Pa].
    fn cap_pressure_ow(&self, sw: Dual64) -> Dual64;

    /// Saturated dissolved gas-oil ratio `Rs_sat(p)` [sm3/sm3].
    fn rs_sat(&self, p: Dual64) -> Dual64;

    /// Saturated vaporized oil-gas ratio `Rv_sat(p)` [sm3/sm3].
    fn rv_sat(&self, p: Dual64) -> Dual64;

    /// Phase density at surface conditions [kg/m3].
    fn surface_density(&self, phase: Phase) -> f64;

    /// Rock pore-volume multiplier at pressure `p` [-].
    fn pv_multiplier(&self, p: Dual64) -> Dual64;
}

/// Lifts a scalar `Dual64` property function onto an AD vector.
///
/// Evaluates `f` cell by cell at the argument's values with a unit
/// derivative seed, then chains the resulting (value, derivative) pairs
/// through the argument's Jacobian blocks.
pub fn lift<F>(f: F, x: &AdVector) -> Result<AdVector, AdError>
where
    F: Fn(Dual64) -> Dual64,
{
    let n = x.len();
    let mut values = DVector::zeros(n);
    let mut derivatives = DVector::zeros(n);
    for i in 0..n {
        let y = f(Dual64::from(x.values()[i]).derivative());
        values[i] = y.re;
        derivatives[i] = y.eps;
    }
    x.chain_unary(values, &derivatives)
}

/// Analytic black-oil correlations with sensible waterflood-scale defaults.
///
/// Not a table stand-in for any real fluid; the point is smooth, monotone
/// property curves with exact derivatives for testing the assembly and
/// Newton machinery. All fields are public-by-builder: `with_*` methods
/// override the defaults.
#[derive(Debug, Clone)]
pub struct AnalyticFluid {
    /// Reference pressure for compressibility expansions [Pa]
    pub ref_pressure: f64,
    /// Phase compressibilities (water, oil, gas) [1/Pa]
    pub compressibility: [f64; 3],
    /// Phase viscosities at reference conditions (water, oil, gas) [Pa s]
    pub viscosity: [f64; 3],
    /// Corey exponents (water, oil, gas) [-]
    pub corey_exponent: [f64; 3],
    /// Residual/connate saturations (water, oil, gas) [-]
    pub residual_saturation: [f64; 3],
    /// End-point relative permeabilities (water, oil, gas) [-]
    pub kr_max: [f64; 3],
    /// Linear capillary pressure coefficient: Pcow = coeff * (1 - sw) [Pa]
    pub cap_pressure_coeff: f64,
    /// Slope of Rs_sat(p) [sm3/sm3/Pa]
    pub rs_slope: f64,
    /// Slope of Rv_sat(p) [sm3/sm3/Pa]
    pub rv_slope: f64,
    /// Surface densities (water, oil, gas) [kg/m3]
    pub surface_density: [f64; 3],
    /// Rock compressibility [1/Pa]
    pub rock_compressibility: f64,
}

impl Default for AnalyticFluid {
    fn default() -> Self {
        AnalyticFluid {
            ref_pressure: 200e5,
            compressibility: [4.0e-10, 1.0e-9, 1.0e-7],
            viscosity: [1.0e-3, 5.0e-3, 2.0e-5],
            corey_exponent: [2.0, 2.0, 2.0],
            residual_saturation: [0.0, 0.0, 0.0],
            kr_max: [1.0, 1.0, 1.0],
            cap_pressure_coeff: 0.0,
            rs_slope: 1.0e-6,
            rv_slope: 1.0e-8,
            surface_density: [1000.0, 850.0, 1.2],
            rock_compressibility: 0.0,
        }
    }
}

impl AnalyticFluid {
    fn phase_index(phase: Phase) -> usize {
        match phase {
            Phase::Water => 0,
            Phase::Oil => 1,
            Phase::Gas => 2,
        }
    }

    /// Incompressible variant: flat b-factors, rigid rock, no dissolution.
    pub fn incompressible() -> Self {
        AnalyticFluid {
            compressibility: [0.0; 3],
            rs_slope: 0.0,
            rv_slope: 0.0,
            rock_compressibility: 0.0,
            ..Default::default()
        }
    }

    /// Overrides one phase compressibility [1/Pa].
    pub fn with_compressibility(mut self, phase: Phase, c: f64) -> Self {
        self.compressibility[Self::phase_index(phase)] = c;
        self
    }

    /// Overrides one phase viscosity [Pa s].
    pub fn with_viscosity(mut self, phase: Phase, mu: f64) -> Self {
        self.viscosity[Self::phase_index(phase)] = mu;
        self
    }

    /// Overrides one Corey exponent.
    pub fn with_corey_exponent(mut self, phase: Phase, n: f64) -> Self {
        self.corey_exponent[Self::phase_index(phase)] = n;
        self
    }

    /// Overrides the capillary pressure coefficient [Pa].
    pub fn with_cap_pressure_coeff(mut self, coeff: f64) -> Self {
        self.cap_pressure_coeff = coeff;
        self
    }

    /// Overrides the Rs_sat slope [sm3/sm3/Pa].
    pub fn with_rs_slope(mut self, slope: f64) -> Self {
        self.rs_slope = slope;
        self
    }

    /// Overrides the rock compressibility [1/Pa].
    pub fn with_rock_compressibility(mut self, c: f64) -> Self {
        self.rock_compressibility = c;
        self
    }
}

impl FluidProperties for AnalyticFluid {
    fn recip_fvf(&self, phase: Phase, p: Dual64) -> Dual64 {
        let c = self.compressibility[Self::phase_index(phase)];
        ((p - self.ref_pressure) * c).exp()
    }

    fn viscosity(&self, phase: Phase, _p: Dual64) -> Dual64 {
        Dual64::from(self.viscosity[Self::phase_index(phase)])
    }

    fn rel_perm(&self, phase: Phase, s: Dual64) -> Dual64 {
        let i = Self::phase_index(phase);
        let s_r = self.residual_saturation[i];
        let denom = 1.0 - self.residual_saturation.iter().sum::<f64>();
        let s_eff = (s - s_r) / denom;
        // Clamped outside [0, 1]: flat curve, zero derivative.
        if s_eff.re <= 0.0 {
            Dual64::from(0.0)
        } else if s_eff.re >= 1.0 {
            Dual64::from(self.kr_max[i])
        } else {
            s_eff.powf(self.corey_exponent[i]) * self.kr_max[i]
        }
    }

    fn cap_pressure_ow(&self, sw: Dual64) -> Dual64 {
        (-sw + 1.0) * self.cap_pressure_coeff
    }

    fn rs_sat(&self, p: Dual64) -> Dual64 {
        p * self.rs_slope
    }

    fn rv_sat(&self, p: Dual64) -> Dual64 {
        p * self.rv_slope
    }

    fn surface_density(&self, phase: Phase) -> f64 {
        self.surface_density[Self::phase_index(phase)]
    }

    fn pv_multiplier(&self, p: Dual64) -> Dual64 {
        (p - self.ref_pressure) * self.rock_compressibility + 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at(x: f64) -> Dual64 {
        Dual64::from(x).derivative()
    }

    #[test]
    fn test_recip_fvf_derivative_matches_finite_difference() {
        let fluid = AnalyticFluid::default();
        let p = 250e5;
        let h = 1.0;
        let b = fluid.recip_fvf(Phase::Oil, at(p));
        let fd = (fluid.recip_fvf(Phase::Oil, at(p + h)).re
            - fluid.recip_fvf(Phase::Oil, at(p - h)).re)
            / (2.0 * h);
        assert_relative_eq!(b.eps, fd, max_relative = 1e-6);
        // b increases with pressure.
        assert!(b.eps > 0.0);
        assert_relative_eq!(fluid.recip_fvf(Phase::Oil, at(fluid.ref_pressure)).re, 1.0);
    }

    #[test]
    fn test_corey_rel_perm_clamps_with_flat_derivative() {
        let fluid = AnalyticFluid {
            residual_saturation: [0.1, 0.1, 0.0],
            ..Default::default()
        };
        let below = fluid.rel_perm(Phase::Water, at(0.05));
        assert_eq!(below.re, 0.0);
        assert_eq!(below.eps, 0.0);
        let mid = fluid.rel_perm(Phase::Water, at(0.5));
        assert!(mid.re > 0.0 && mid.re < 1.0);
        assert!(mid.eps > 0.0);
        let above = fluid.rel_perm(Phase::Water, at(0.95));
        assert_eq!(above.re, 1.0);
        assert_eq!(above.eps, 0.0);
    }

    #[test]
    fn test_lift_chains_through_argument_jacobian() {
        let fluid = AnalyticFluid::default();
        let vars = AdVector::seed_groups(vec![DVector::from_vec(vec![210e5, 190e5])]);
        // Lift through 2p so the chain factor is 2, not 1.
        let doubled = vars[0].scale(2.0);
        let b = lift(|p| fluid.recip_fvf(Phase::Water, p), &doubled).unwrap();
        let j = b.full_jacobian().unwrap();
        let scalar = fluid.recip_fvf(Phase::Water, at(2.0 * 210e5));
        assert_relative_eq!(b.values()[0], scalar.re);
        let mut j00 = 0.0;
        for (v, (i, jcol)) in j.iter() {
            if i == 0 && jcol == 0 {
                j00 = *v;
            }
        }
        assert_relative_eq!(j00, 2.0 * scalar.eps, max_relative = 1e-12);
    }

    #[test]
    fn test_pv_multiplier_and_saturated_ratios() {
        let fluid = AnalyticFluid::default()
            .with_rock_compressibility(5e-10)
            .with_rs_slope(2e-6);
        let p = 220e5;
        let m = fluid.pv_multiplier(at(p));
        assert_relative_eq!(m.re, 1.0 + 5e-10 * (p - fluid.ref_pressure));
        assert_relative_eq!(m.eps, 5e-10);
        assert_relative_eq!(fluid.rs_sat(at(p)).re, 2e-6 * p);
        assert_relative_eq!(fluid.rs_sat(at(p)).eps, 2e-6);
    }

    #[test]
    fn test_cap_pressure_slope() {
        let fluid = AnalyticFluid::default().with_cap_pressure_coeff(1e4);
        let pc = fluid.cap_pressure_ow(at(0.3));
        assert_relative_eq!(pc.re, 7e3);
        assert_relative_eq!(pc.eps, -1e4);
    }
}
