//! Fixed-dimension linear algebra for the bandit models.
//!
//! Every vector and matrix the critic touches has the compile-time size
//! [`DIM`], so dimension mismatches are unrepresentable once a value is in
//! memory. Variable-length data (persisted records) is converted at the edge
//! with [`vector_from_slice`] / [`matrix_from_rows`].

use crate::error::{EngineError, Result};

/// Context dimensionality.
pub const DIM: usize = 12;

pub type Vector = [f64; DIM];
pub type Matrix = [[f64; DIM]; DIM];

pub fn zeros() -> Vector {
    [0.0; DIM]
}

/// `scale · I`.
pub fn scaled_identity(scale: f64) -> Matrix {
    let mut m = [[0.0; DIM]; DIM];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = scale;
    }
    m
}

pub fn dot(a: &Vector, b: &Vector) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn mat_vec(m: &Matrix, x: &Vector) -> Vector {
    let mut out = zeros();
    for (o, row) in out.iter_mut().zip(m.iter()) {
        *o = dot(row, x);
    }
    out
}

/// `xᵀ M x`.
pub fn quad_form(m: &Matrix, x: &Vector) -> f64 {
    dot(x, &mat_vec(m, x))
}

/// `M ← M + x xᵀ`.
pub fn add_outer(m: &mut Matrix, x: &Vector) {
    for i in 0..DIM {
        for j in 0..DIM {
            m[i][j] += x[i] * x[j];
        }
    }
}

/// Rank-1 inverse update via the Sherman–Morrison identity.
///
/// Given `inv = M⁻¹` for symmetric `M`, rewrites it in place to
/// `(M + x xᵀ)⁻¹ = M⁻¹ − (M⁻¹x)(M⁻¹x)ᵀ / (1 + xᵀM⁻¹x)`. The result is
/// re-symmetrized to keep rounding drift from accumulating.
pub fn sherman_morrison(inv: &mut Matrix, x: &Vector) {
    let u = mat_vec(inv, x);
    let denom = 1.0 + dot(x, &u);
    for i in 0..DIM {
        for j in 0..DIM {
            inv[i][j] -= u[i] * u[j] / denom;
        }
    }
    symmetrize(inv);
}

/// Replace `M` with `(M + Mᵀ) / 2`.
pub fn symmetrize(m: &mut Matrix) {
    for i in 0..DIM {
        for j in (i + 1)..DIM {
            let avg = 0.5 * (m[i][j] + m[j][i]);
            m[i][j] = avg;
            m[j][i] = avg;
        }
    }
}

pub fn is_symmetric(m: &Matrix, tol: f64) -> bool {
    (0..DIM).all(|i| (0..DIM).all(|j| (m[i][j] - m[j][i]).abs() <= tol))
}

/// Lower-triangular Cholesky factor `L` with `M = L Lᵀ`.
///
/// Returns `None` when `M` is not positive-definite.
pub fn cholesky(m: &Matrix) -> Option<Matrix> {
    let mut l = [[0.0; DIM]; DIM];
    for i in 0..DIM {
        for j in 0..=i {
            let mut sum = m[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[i][i] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    Some(l)
}

/// Inverse of a symmetric positive-definite matrix via its Cholesky factor.
pub fn invert_spd(m: &Matrix) -> Option<Matrix> {
    let l = cholesky(m)?;
    let mut inv = [[0.0; DIM]; DIM];
    for col in 0..DIM {
        // Solve L y = e_col.
        let mut y = zeros();
        for i in 0..DIM {
            let mut sum = if i == col { 1.0 } else { 0.0 };
            for k in 0..i {
                sum -= l[i][k] * y[k];
            }
            y[i] = sum / l[i][i];
        }
        // Solve Lᵀ z = y.
        let mut z = zeros();
        for i in (0..DIM).rev() {
            let mut sum = y[i];
            for k in (i + 1)..DIM {
                sum -= l[k][i] * z[k];
            }
            z[i] = sum / l[i][i];
        }
        for (row, zi) in inv.iter_mut().zip(z.iter()) {
            row[col] = *zi;
        }
    }
    symmetrize(&mut inv);
    Some(inv)
}

pub fn vector_from_slice(field: &'static str, v: &[f64]) -> Result<Vector> {
    if v.len() != DIM {
        return Err(EngineError::DimensionMismatch {
            field,
            expected: DIM,
            got: v.len(),
        });
    }
    let mut out = zeros();
    out.copy_from_slice(v);
    Ok(out)
}

pub fn matrix_from_rows(field: &'static str, rows: &[Vec<f64>]) -> Result<Matrix> {
    if rows.len() != DIM {
        return Err(EngineError::DimensionMismatch {
            field,
            expected: DIM,
            got: rows.len(),
        });
    }
    let mut out = [[0.0; DIM]; DIM];
    for (dst, src) in out.iter_mut().zip(rows.iter()) {
        *dst = vector_from_slice(field, src)?;
    }
    Ok(out)
}

pub fn matrix_to_rows(m: &Matrix) -> Vec<Vec<f64>> {
    m.iter().map(|row| row.to_vec()).collect()
}
