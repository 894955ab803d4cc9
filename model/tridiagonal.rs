use crate::dual::Scalar;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TridiagonalError {
    #[error("Cannot solve an empty tridiagonal system.")]
    Empty,

    #[error(
        "Tridiagonal band lengths do not match: sub={sub}, diag={diag}, super={sup}, rhs={rhs}."
    )]
    DimensionMismatch {
        sub: usize,
        diag: usize,
        sup: usize,
        rhs: usize,
    },

    #[error("Tridiagonal system is singular: pivot {pivot} at row {row}.")]
    Singular { row: usize, pivot: f64 },
}

fn check_pivot<S: Scalar>(pivot: &S, row: usize) -> Result<(), TridiagonalError> {
    let value = pivot.value();
    if value == 0.0 || !value.is_finite() {
        return Err(TridiagonalError::Singular { row, pivot: value });
    }
    Ok(())
}

/// Solves `A x = d` for tridiagonal `A` with the Thomas algorithm.
///
/// `sub[i]` is `A[i+1][i]`, `diag[i]` is `A[i][i]` and `sup[i]` is `A[i][i+1]`.
/// There is no pivoting, so the system must be diagonally favorable; a zero or
/// non-finite pivot is reported as [`TridiagonalError::Singular`].
pub fn solve_tridiagonal<S: Scalar>(
    sub: &[S],
    diag: &[S],
    sup: &[S],
    rhs: &[S],
) -> Result<Vec<S>, TridiagonalError> {
    let n = diag.len();
    if n == 0 {
        return Err(TridiagonalError::Empty);
    }
    if rhs.len() != n || sub.len() + 1 != n || sup.len() + 1 != n {
        return Err(TridiagonalError::DimensionMismatch {
            sub: sub.len(),
            diag: n,
            sup: sup.len(),
            rhs: rhs.len(),
        });
    }

    let mut b = diag.to_vec();
    let mut d = rhs.to_vec();

    // Forward elimination of the sub-diagonal.
    for i in 0..n - 1 {
        check_pivot(&b[i], i)?;
        let w = sub[i].clone() / b[i].clone();
        d[i + 1] = d[i + 1].clone() - w.clone() * d[i].clone();
        b[i + 1] = b[i + 1].clone() - w * sup[i].clone();
    }
    check_pivot(&b[n - 1], n - 1)?;

    // Back substitution.
    let mut x = d;
    x[n - 1] = x[n - 1].clone() / b[n - 1].clone();
    for i in (0..n - 1).rev() {
        x[i] = (x[i].clone() - sup[i].clone() * x[i + 1].clone()) / b[i].clone();
    }
    Ok(x)
}
