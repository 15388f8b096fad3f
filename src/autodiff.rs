//! Automatic differentiation with sparse per-group Jacobian blocks.
//!
//! The fully-implicit discretization needs the Jacobian of every residual
//! equation with respect to every primary variable. Rather than tracking one
//! dense matrix, an [`AdVector`] pairs a value array (one entry per grid
//! cell, face, or well) with one *sparse* Jacobian block per independent
//! primary-variable group ({pressure, sW, x, qWs, ...}). Every arithmetic
//! operation propagates the chain rule block-by-block, so assembling the
//! full system Jacobian is O(nnz) in the number of nonzeros rather than
//! O(n^2).
//!
//! # Example
//!
//! ```
//! use nalgebra::DVector;
//! use petrosim::autodiff::AdVector;
//!
//! // Two independent groups: p (3 cells) and s (3 cells).
//! let seeded = AdVector::seed_groups(vec![
//!     DVector::from_vec(vec![1.0, 2.0, 3.0]),
//!     DVector::from_vec(vec![0.1, 0.2, 0.3]),
//! ]);
//! let p = &seeded[0];
//! let s = &seeded[1];
//!
//! // r = p * s; dr/dp = diag(s), dr/ds = diag(p).
//! let r = p * s;
//! assert_eq!(r.values()[1], 0.4);
//! ```
//!
//! # Value semantics
//!
//! `AdVector` is a pure value type: no operation mutates its operands.
//! Equality and the comparison helpers look at the *values only* and
//! discard derivative information. This is deliberate and load-bearing:
//! predicates like "is this cell undersaturated" or "is the flow direction
//! positive" must yield plain booleans, and the derivative of the selected
//! branch is what ends up in the Jacobian.

use nalgebra::DVector;
use sprs::{CsMat, TriMat};

/// Errors raised by AD value operations.
#[derive(Debug, thiserror::Error)]
pub enum AdError {
    /// Operand lengths or Jacobian block structures are incompatible
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// Indexed extraction past the end of the value array
    #[error("index {index} out of range for AD vector of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    /// Jacobian requested from a residual-only (unseeded) evaluation
    #[error("value carries no Jacobian (residual-only evaluation)")]
    NoJacobian,
}

/// Column counts of the independent primary-variable groups, in order.
///
/// Every [`AdVector`] in one assembly shares a layout; block `k` of any
/// value has exactly `layout.group_size(k)` columns. The *empty* layout is
/// the residual-only mode: values carry no blocks at all and all arithmetic
/// degenerates to plain vector math.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockLayout(Vec<usize>);

impl BlockLayout {
    /// Creates a layout from per-group column counts.
    pub fn new(group_sizes: Vec<usize>) -> Self {
        BlockLayout(group_sizes)
    }

    /// The residual-only layout: no derivative tracking anywhere.
    pub fn empty() -> Self {
        BlockLayout(Vec::new())
    }

    /// Number of independent variable groups.
    pub fn n_groups(&self) -> usize {
        self.0.len()
    }

    /// Column count of group `k`.
    pub fn group_size(&self, k: usize) -> usize {
        self.0[k]
    }

    /// Total unknown count across all groups.
    pub fn total_cols(&self) -> usize {
        self.0.iter().sum()
    }

    /// Per-group sizes as a slice.
    pub fn group_sizes(&self) -> &[usize] {
        &self.0
    }
}

/// A value array with one sparse Jacobian block per primary-variable group.
///
/// Invariants maintained by every constructor and operation:
/// - `jac.len()` equals the layout's group count (zero for residual-only),
/// - block `k` has shape `(val.len(), layout.group_size(k))`,
/// - arithmetic requires both operands to share length and block structure.
#[derive(Debug, Clone)]
pub struct AdVector {
    val: DVector<f64>,
    jac: Vec<CsMat<f64>>,
}

impl AdVector {
    /// Creates a constant (zero-derivative) value against a layout.
    pub fn constant(val: DVector<f64>, layout: &BlockLayout) -> Self {
        let n = val.len();
        let jac = layout.group_sizes().iter().map(|&c| CsMat::zero((n, c))).collect();
        AdVector { val, jac }
    }

    /// Creates a constant filled with `x`.
    pub fn fill(x: f64, len: usize, layout: &BlockLayout) -> Self {
        Self::constant(DVector::from_element(len, x), layout)
    }

    /// Seeds a set of independent variable groups.
    ///
    /// Group `k` receives an identity Jacobian in its own block and zeros
    /// elsewhere; the shared layout is the sequence of group lengths. This
    /// is the single entry point that declares "these are the unknowns".
    pub fn seed_groups(groups: Vec<DVector<f64>>) -> Vec<AdVector> {
        let layout = BlockLayout::new(groups.iter().map(|g| g.len()).collect());
        groups
            .into_iter()
            .enumerate()
            .map(|(k, val)| {
                let n = val.len();
                let jac = layout
                    .group_sizes()
                    .iter()
                    .enumerate()
                    .map(|(j, &c)| if j == k { CsMat::eye(n) } else { CsMat::zero((n, c)) })
                    .collect();
                AdVector { val, jac }
            })
            .collect()
    }

    /// Number of entries in the value array.
    pub fn len(&self) -> usize {
        self.val.len()
    }

    /// True if the value array is empty.
    pub fn is_empty(&self) -> bool {
        self.val.len() == 0
    }

    /// The value array.
    pub fn values(&self) -> &DVector<f64> {
        &self.val
    }

    /// Consumes self, returning the value array.
    pub fn into_values(self) -> DVector<f64> {
        self.val
    }

    /// The Jacobian blocks, one per variable group.
    pub fn jacobian_blocks(&self) -> &[CsMat<f64>] {
        &self.jac
    }

    /// Block layout this value was built against.
    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.jac.iter().map(|b| b.cols()).collect())
    }

    /// True when built in residual-only mode (no derivative tracking).
    pub fn is_residual_only(&self) -> bool {
        self.jac.is_empty()
    }

    /// The full Jacobian row block: all group blocks stacked horizontally.
    ///
    /// # Errors
    ///
    /// [`AdError::NoJacobian`] for residual-only values.
    pub fn full_jacobian(&self) -> Result<CsMat<f64>, AdError> {
        if self.jac.is_empty() {
            return Err(AdError::NoJacobian);
        }
        let views: Vec<_> = self.jac.iter().map(|b| b.view()).collect();
        Ok(sprs::hstack(&views))
    }

    fn check_compatible(&self, rhs: &AdVector, op: &str) -> Result<(), AdError> {
        if self.val.len() != rhs.val.len() {
            return Err(AdError::ShapeMismatch(format!(
                "{} of lengths {} and {}",
                op,
                self.val.len(),
                rhs.val.len()
            )));
        }
        if self.jac.len() != rhs.jac.len() {
            return Err(AdError::ShapeMismatch(format!(
                "{} across different block counts ({} vs {})",
                op,
                self.jac.len(),
                rhs.jac.len()
            )));
        }
        for (k, (a, b)) in self.jac.iter().zip(rhs.jac.iter()).enumerate() {
            if a.cols() != b.cols() {
                return Err(AdError::ShapeMismatch(format!(
                    "{}: block {} has {} vs {} columns",
                    op,
                    k,
                    a.cols(),
                    b.cols()
                )));
            }
        }
        Ok(())
    }

    /// Elementwise sum; Jacobian blocks add.
    pub fn try_add(&self, rhs: &AdVector) -> Result<AdVector, AdError> {
        self.check_compatible(rhs, "add")?;
        let val = &self.val + &rhs.val;
        let jac = self.jac.iter().zip(rhs.jac.iter()).map(|(a, b)| a + b).collect();
        Ok(AdVector { val, jac })
    }

    /// Elementwise difference.
    pub fn try_sub(&self, rhs: &AdVector) -> Result<AdVector, AdError> {
        self.check_compatible(rhs, "sub")?;
        let val = &self.val - &rhs.val;
        let neg = rhs.jac.iter().map(|b| b.map(|x| -x));
        let jac = self.jac.iter().zip(neg).map(|(a, b)| a + &b).collect();
        Ok(AdVector { val, jac })
    }

    /// Elementwise product: d(ab) = diag(b) da + diag(a) db.
    pub fn try_mul(&self, rhs: &AdVector) -> Result<AdVector, AdError> {
        self.check_compatible(rhs, "mul")?;
        let val = self.val.component_mul(&rhs.val);
        let jac = self
            .jac
            .iter()
            .zip(rhs.jac.iter())
            .map(|(a, b)| &scale_rows(&rhs.val, a) + &scale_rows(&self.val, b))
            .collect();
        Ok(AdVector { val, jac })
    }

    /// Elementwise quotient: d(a/b) = diag(1/b) da - diag(a/b^2) db.
    pub fn try_div(&self, rhs: &AdVector) -> Result<AdVector, AdError> {
        self.check_compatible(rhs, "div")?;
        let val = self.val.component_div(&rhs.val);
        let inv_b = rhs.val.map(|x| 1.0 / x);
        let neg_a_over_b2 = self.val.zip_map(&rhs.val, |a, b| -a / (b * b));
        let jac = self
            .jac
            .iter()
            .zip(rhs.jac.iter())
            .map(|(a, b)| &scale_rows(&inv_b, a) + &scale_rows(&neg_a_over_b2, b))
            .collect();
        Ok(AdVector { val, jac })
    }

    /// Elementwise power with a constant exponent: d(a^e) = diag(e a^(e-1)) da.
    pub fn powf(&self, exponent: f64) -> AdVector {
        let val = self.val.map(|x| x.powf(exponent));
        let chain = self.val.map(|x| exponent * x.powf(exponent - 1.0));
        let jac = self.jac.iter().map(|b| scale_rows(&chain, b)).collect();
        AdVector { val, jac }
    }

    /// Multiplies every entry (and every derivative) by `k`.
    pub fn scale(&self, k: f64) -> AdVector {
        AdVector {
            val: &self.val * k,
            jac: self.jac.iter().map(|b| b.map(|x| x * k)).collect(),
        }
    }

    /// Adds a constant `k` to every entry; derivatives unchanged.
    pub fn shift(&self, k: f64) -> AdVector {
        AdVector { val: self.val.add_scalar(k), jac: self.jac.clone() }
    }

    /// Elementwise negation.
    pub fn negate(&self) -> AdVector {
        self.scale(-1.0)
    }

    /// Extracts the rows at `indices`, preserving block structure.
    ///
    /// # Errors
    ///
    /// [`AdError::IndexOutOfRange`] if any index exceeds the length.
    pub fn subset(&self, indices: &[usize]) -> Result<AdVector, AdError> {
        let n = self.val.len();
        for &i in indices {
            if i >= n {
                return Err(AdError::IndexOutOfRange { index: i, len: n });
            }
        }
        let val = DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.val[i]));
        let jac = self.jac.iter().map(|b| select_rows(b, indices)).collect();
        Ok(AdVector { val, jac })
    }

    /// Vertically concatenates values, preserving block structure.
    ///
    /// All parts must share the same layout (column counts per block).
    pub fn concat(parts: &[&AdVector]) -> Result<AdVector, AdError> {
        let first = parts.first().ok_or_else(|| {
            AdError::ShapeMismatch("concat of zero parts".to_string())
        })?;
        let layout = first.layout();
        for p in &parts[1..] {
            if p.layout() != layout {
                return Err(AdError::ShapeMismatch(
                    "concat across different block layouts".to_string(),
                ));
            }
        }
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let val = DVector::from_iterator(
            total,
            parts.iter().flat_map(|p| p.val.iter().copied()),
        );
        let jac = (0..layout.n_groups())
            .map(|k| {
                let views: Vec<_> = parts.iter().map(|p| p.jac[k].view()).collect();
                sprs::vstack(&views)
            })
            .collect();
        Ok(AdVector { val, jac })
    }

    /// Elementwise chooser: row `i` comes from `a` where `mask[i]`, else `b`.
    ///
    /// Both value and derivative rows follow the mask; the mask itself is a
    /// plain boolean array and contributes nothing to the Jacobian.
    pub fn select(mask: &[bool], a: &AdVector, b: &AdVector) -> Result<AdVector, AdError> {
        a.check_compatible(b, "select")?;
        if mask.len() != a.len() {
            return Err(AdError::ShapeMismatch(format!(
                "select mask of length {} over values of length {}",
                mask.len(),
                a.len()
            )));
        }
        let ind_a = DVector::from_iterator(
            mask.len(),
            mask.iter().map(|&m| if m { 1.0 } else { 0.0 }),
        );
        let ind_b = ind_a.map(|x| 1.0 - x);
        let val = ind_a.component_mul(&a.val) + ind_b.component_mul(&b.val);
        let jac = a
            .jac
            .iter()
            .zip(b.jac.iter())
            .map(|(ja, jb)| &scale_rows(&ind_a, ja) + &scale_rows(&ind_b, jb))
            .collect();
        Ok(AdVector { val, jac })
    }

    /// Total over all entries as a length-1 AD value.
    pub fn sum(&self) -> AdVector {
        let total = self.val.sum();
        let jac = self
            .jac
            .iter()
            .map(|b| {
                let mut tri = TriMat::new((1, b.cols()));
                let mut col_sums = vec![0.0; b.cols()];
                for (v, (_, j)) in b.iter() {
                    col_sums[j] += *v;
                }
                for (j, &s) in col_sums.iter().enumerate() {
                    if s != 0.0 {
                        tri.add_triplet(0, j, s);
                    }
                }
                tri.to_csr()
            })
            .collect();
        AdVector { val: DVector::from_element(1, total), jac }
    }

    /// Chains an external elementwise function through this value.
    ///
    /// Given `y[i] = f(self[i])` and `dy[i] = f'(self[i])` computed by some
    /// outside scalar differentiator, produces the AD value of `y` with
    /// blocks `diag(dy) * J_self`. This is how scalar property functions
    /// (written over `num_dual::Dual64`) are lifted onto AD vectors.
    pub fn chain_unary(
        &self,
        values: DVector<f64>,
        derivatives: &DVector<f64>,
    ) -> Result<AdVector, AdError> {
        if values.len() != self.len() || derivatives.len() != self.len() {
            return Err(AdError::ShapeMismatch(format!(
                "chain of {} values / {} derivatives over AD vector of length {}",
                values.len(),
                derivatives.len(),
                self.len()
            )));
        }
        let jac = self.jac.iter().map(|b| scale_rows(derivatives, b)).collect();
        Ok(AdVector { val: values, jac })
    }

    /// Infinity norm of the value array.
    pub fn inf_norm(&self) -> f64 {
        self.val.iter().fold(0.0_f64, |m, &x| m.max(x.abs()))
    }

    /// Value-only comparison against a scalar: `v[i] <= x`.
    pub fn le_scalar(&self, x: f64) -> Vec<bool> {
        self.val.iter().map(|&v| v <= x).collect()
    }

    /// Value-only comparison against a scalar: `v[i] > x`.
    pub fn gt_scalar(&self, x: f64) -> Vec<bool> {
        self.val.iter().map(|&v| v > x).collect()
    }

    /// Value-only elementwise comparison: `self[i] <= rhs[i]`.
    ///
    /// Derivatives on both sides are discarded.
    pub fn le(&self, rhs: &AdVector) -> Vec<bool> {
        self.val.iter().zip(rhs.val.iter()).map(|(a, b)| a <= b).collect()
    }
}

/// Equality compares values only; derivative blocks are ignored.
///
/// Two AD values with identical values but different derivative structure
/// compare equal. Predicates built on top of AD arithmetic are meant to
/// behave exactly like their plain-number counterparts.
impl PartialEq for AdVector {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}

/// Applies a constant sparse matrix to an AD value: `out = m x`.
///
/// Both value and every Jacobian block are premultiplied by `m`; this is
/// how the discrete gradient, divergence, and upstream-selection operators
/// act on AD quantities.
pub fn apply_matrix(m: &CsMat<f64>, x: &AdVector) -> Result<AdVector, AdError> {
    if m.cols() != x.len() {
        return Err(AdError::ShapeMismatch(format!(
            "matrix of {} columns applied to AD vector of length {}",
            m.cols(),
            x.len()
        )));
    }
    let mut val = DVector::zeros(m.rows());
    for (v, (i, j)) in m.iter() {
        val[i] += v * x.values()[j];
    }
    let jac = x.jacobian_blocks().iter().map(|b| m * b).collect();
    Ok(AdVector { val, jac })
}

/// Scales row `i` of `m` by `d[i]`; the diagonal-matrix product diag(d) m.
fn scale_rows(d: &DVector<f64>, m: &CsMat<f64>) -> CsMat<f64> {
    let mut tri = TriMat::new((m.rows(), m.cols()));
    for (v, (i, j)) in m.iter() {
        let scaled = v * d[i];
        if scaled != 0.0 {
            tri.add_triplet(i, j, scaled);
        }
    }
    tri.to_csr()
}

/// Extracts the given rows of a CSR matrix into a new matrix.
fn select_rows(m: &CsMat<f64>, indices: &[usize]) -> CsMat<f64> {
    let mut tri = TriMat::new((indices.len(), m.cols()));
    for (out_row, &i) in indices.iter().enumerate() {
        if let Some(row) = m.outer_view(i) {
            for (j, &v) in row.iter() {
                tri.add_triplet(out_row, j, v);
            }
        }
    }
    tri.to_csr()
}

fn unwrap_op(r: Result<AdVector, AdError>) -> AdVector {
    match r {
        Ok(v) => v,
        Err(e) => panic!("AD arithmetic failed: {e}"),
    }
}

// Operator sugar over the checked arithmetic. Mixing incompatible shapes
// through these panics with the AdError message; fallible call sites use
// the try_* forms instead.
mod op_impls {
    use super::*;
    use std::ops::{Add, Div, Mul, Neg, Sub};

    impl Add for &AdVector {
        type Output = AdVector;
        fn add(self, rhs: &AdVector) -> AdVector {
            unwrap_op(self.try_add(rhs))
        }
    }

    impl Sub for &AdVector {
        type Output = AdVector;
        fn sub(self, rhs: &AdVector) -> AdVector {
            unwrap_op(self.try_sub(rhs))
        }
    }

    impl Mul for &AdVector {
        type Output = AdVector;
        fn mul(self, rhs: &AdVector) -> AdVector {
            unwrap_op(self.try_mul(rhs))
        }
    }

    impl Div for &AdVector {
        type Output = AdVector;
        fn div(self, rhs: &AdVector) -> AdVector {
            unwrap_op(self.try_div(rhs))
        }
    }

    impl Neg for &AdVector {
        type Output = AdVector;
        fn neg(self) -> AdVector {
            self.negate()
        }
    }

    impl Mul<f64> for &AdVector {
        type Output = AdVector;
        fn mul(self, k: f64) -> AdVector {
            self.scale(k)
        }
    }

    impl Mul<&AdVector> for f64 {
        type Output = AdVector;
        fn mul(self, x: &AdVector) -> AdVector {
            x.scale(self)
        }
    }

    impl Add<f64> for &AdVector {
        type Output = AdVector;
        fn add(self, k: f64) -> AdVector {
            self.shift(k)
        }
    }

    impl Sub<f64> for &AdVector {
        type Output = AdVector;
        fn sub(self, k: f64) -> AdVector {
            self.shift(-k)
        }
    }

    impl Sub<&AdVector> for f64 {
        type Output = AdVector;
        fn sub(self, x: &AdVector) -> AdVector {
            x.negate().shift(self)
        }
    }
}
