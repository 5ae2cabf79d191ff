use anyhow::{anyhow, Result};
use faer::{prelude::*, solvers::PartialPivLu, Mat};

/// Pivots smaller than this are treated as a singular matrix.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// A factorization of a square matrix `A` that can be reused for several
/// right-hand sides, both for `A x = b` and `Aᵀ x = b`.
pub trait LuFactors: Send {
    fn dim(&self) -> usize;

    /// Overwrite `rhs` with the solution of `A x = rhs`.
    fn solve_in_place(&self, rhs: &mut [f64]) -> Result<()>;

    /// Overwrite `rhs` with the solution of `Aᵀ x = rhs`.
    fn solve_transposed_in_place(&self, rhs: &mut [f64]) -> Result<()>;
}

/// Trait for factorizing dense linear systems (Ax = b).
///
/// The Newton solver factorizes once per iteration and solves against the
/// factors, so the backend hands out an [`LuFactors`] rather than solving
/// directly.
pub trait LinearSystemBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn factorize(&self, matrix: &[Vec<f64>]) -> Result<Box<dyn LuFactors>>;

    /// Solve the linear system Ax = b
    fn solve(&self, matrix: &[Vec<f64>], rhs: &[f64]) -> Result<Vec<f64>> {
        let factors = self.factorize(matrix)?;
        let mut solution = rhs.to_vec();
        factors.solve_in_place(&mut solution)?;
        Ok(solution)
    }
}

fn check_square(matrix: &[Vec<f64>]) -> Result<usize> {
    let n = matrix.len();
    if matrix.iter().any(|row| row.len() != n) {
        return Err(anyhow!("matrix must be square"));
    }
    Ok(n)
}

fn check_rhs(n: usize, rhs: &[f64]) -> Result<()> {
    if rhs.len() != n {
        return Err(anyhow!(
            "rhs length ({}) does not match matrix dimension {}",
            rhs.len(),
            n
        ));
    }
    Ok(())
}

fn check_finite(solution: &[f64]) -> Result<()> {
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("singular matrix (non-finite solution)"));
    }
    Ok(())
}

/// Hand-rolled LU with partial pivoting.
#[derive(Debug, Clone, Default)]
pub struct GaussSolver;

/// `P A = L U` with unit lower `L`, both packed into `lu`.
#[derive(Debug, Clone)]
struct GaussFactors {
    lu: Vec<Vec<f64>>,
    /// Row `i` of `P A` is row `perm[i]` of `A`.
    perm: Vec<usize>,
}

impl LinearSystemBackend for GaussSolver {
    fn name(&self) -> &'static str {
        "gauss"
    }

    fn factorize(&self, matrix: &[Vec<f64>]) -> Result<Box<dyn LuFactors>> {
        let n = check_square(matrix)?;
        let mut a = matrix.to_vec();
        let mut perm: Vec<usize> = (0..n).collect();

        for i in 0..n {
            let mut pivot = i;
            for row in i + 1..n {
                if a[row][i].abs() > a[pivot][i].abs() {
                    pivot = row;
                }
            }
            if pivot != i {
                a.swap(i, pivot);
                perm.swap(i, pivot);
            }

            let diag = a[i][i];
            if !diag.is_finite() || diag.abs() < PIVOT_TOLERANCE {
                return Err(anyhow!("singular matrix (pivot {} at column {})", diag, i));
            }

            let pivot_segment = a[i][i + 1..].to_vec();
            for row in a.iter_mut().skip(i + 1) {
                let factor = row[i] / diag;
                row[i] = factor;
                if factor == 0.0 {
                    continue;
                }
                for (target, &p) in row[i + 1..].iter_mut().zip(pivot_segment.iter()) {
                    *target -= factor * p;
                }
            }
        }

        Ok(Box::new(GaussFactors { lu: a, perm }))
    }
}

impl LuFactors for GaussFactors {
    fn dim(&self) -> usize {
        self.perm.len()
    }

    fn solve_in_place(&self, rhs: &mut [f64]) -> Result<()> {
        let n = self.dim();
        check_rhs(n, rhs)?;

        let mut y: Vec<f64> = self.perm.iter().map(|&p| rhs[p]).collect();
        for i in 0..n {
            let mut sum = y[i];
            for j in 0..i {
                sum -= self.lu[i][j] * y[j];
            }
            y[i] = sum;
        }
        for i in (0..n).rev() {
            let mut sum = y[i];
            for j in i + 1..n {
                sum -= self.lu[i][j] * y[j];
            }
            y[i] = sum / self.lu[i][i];
        }

        rhs.copy_from_slice(&y);
        check_finite(rhs)
    }

    fn solve_transposed_in_place(&self, rhs: &mut [f64]) -> Result<()> {
        // Aᵀ = Uᵀ Lᵀ P
        let n = self.dim();
        check_rhs(n, rhs)?;

        let mut w = rhs.to_vec();
        for i in 0..n {
            let mut sum = w[i];
            for j in 0..i {
                sum -= self.lu[j][i] * w[j];
            }
            w[i] = sum / self.lu[i][i];
        }
        for i in (0..n).rev() {
            let mut sum = w[i];
            for j in i + 1..n {
                sum -= self.lu[j][i] * w[j];
            }
            w[i] = sum;
        }

        for (i, &p) in self.perm.iter().enumerate() {
            rhs[p] = w[i];
        }
        check_finite(rhs)
    }
}

/// faer partial-pivoting LU.
#[derive(Debug, Clone, Default)]
pub struct FaerSolver;

struct FaerFactors {
    dim: usize,
    lu: PartialPivLu<f64>,
    lu_transposed: PartialPivLu<f64>,
}

impl LinearSystemBackend for FaerSolver {
    fn name(&self) -> &'static str {
        "faer"
    }

    fn factorize(&self, matrix: &[Vec<f64>]) -> Result<Box<dyn LuFactors>> {
        let n = check_square(matrix)?;
        if matrix.iter().flatten().any(|v| !v.is_finite()) {
            return Err(anyhow!("matrix contains non-finite entries"));
        }

        let mat = Mat::from_fn(n, n, |i, j| matrix[i][j]);
        let mat_t = Mat::from_fn(n, n, |i, j| matrix[j][i]);
        Ok(Box::new(FaerFactors {
            dim: n,
            lu: PartialPivLu::new(mat.as_ref()),
            lu_transposed: PartialPivLu::new(mat_t.as_ref()),
        }))
    }
}

impl FaerFactors {
    fn solve_with(lu: &PartialPivLu<f64>, n: usize, rhs: &mut [f64]) -> Result<()> {
        check_rhs(n, rhs)?;
        if n == 0 {
            return Ok(());
        }
        let rhs_mat = Mat::from_fn(n, 1, |i, _| rhs[i]);
        let sol = lu.solve(&rhs_mat);
        for (i, value) in rhs.iter_mut().enumerate() {
            *value = sol.read(i, 0);
        }
        check_finite(rhs)
    }
}

impl LuFactors for FaerFactors {
    fn dim(&self) -> usize {
        self.dim
    }

    fn solve_in_place(&self, rhs: &mut [f64]) -> Result<()> {
        Self::solve_with(&self.lu, self.dim, rhs)
    }

    fn solve_transposed_in_place(&self, rhs: &mut [f64]) -> Result<()> {
        Self::solve_with(&self.lu_transposed, self.dim, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Vec<f64>> {
        vec![
            vec![0.0, 2.0, 1.0],
            vec![4.0, 1.0, 0.0],
            vec![1.0, 0.0, 3.0],
        ]
    }

    fn multiply(matrix: &[Vec<f64>], x: &[f64], transposed: bool) -> Vec<f64> {
        let n = matrix.len();
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if transposed { matrix[j][i] } else { matrix[i][j] } * x[j])
                    .sum()
            })
            .collect()
    }

    fn check_backend(backend: &dyn LinearSystemBackend) {
        let a = sample();
        let b = vec![1.0, -2.0, 0.5];
        let factors = backend.factorize(&a).unwrap();

        let mut x = b.clone();
        factors.solve_in_place(&mut x).unwrap();
        for (lhs, rhs) in multiply(&a, &x, false).iter().zip(&b) {
            assert!((lhs - rhs).abs() < 1e-10, "{}: A x != b", backend.name());
        }

        let mut xt = b.clone();
        factors.solve_transposed_in_place(&mut xt).unwrap();
        for (lhs, rhs) in multiply(&a, &xt, true).iter().zip(&b) {
            assert!((lhs - rhs).abs() < 1e-10, "{}: Aᵀ x != b", backend.name());
        }
    }

    #[test]
    fn gauss_solves_plain_and_transposed_systems() {
        check_backend(&GaussSolver);
    }

    #[test]
    fn faer_solves_plain_and_transposed_systems() {
        check_backend(&FaerSolver);
    }

    #[test]
    fn gauss_reports_singular_matrix() {
        let singular = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        assert!(GaussSolver.factorize(&singular).is_err());
    }

    #[test]
    fn faer_reports_singular_matrix_on_solve() {
        let singular = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        let result = FaerSolver
            .factorize(&singular)
            .and_then(|f| {
                let mut rhs = vec![1.0, 1.0];
                f.solve_in_place(&mut rhs)
            });
        assert!(result.is_err());
    }

    #[test]
    fn rhs_length_is_checked() {
        let factors = GaussSolver.factorize(&sample()).unwrap();
        let mut rhs = vec![1.0];
        assert!(factors.solve_in_place(&mut rhs).is_err());
    }
}
