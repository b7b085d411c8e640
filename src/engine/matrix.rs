/// Small dense square matrix over f64, sized by the number of predictors in a
/// settlement run (tens at most). Flat row-major storage with explicit
/// dimension bookkeeping; no external linear algebra dependency.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

/// Pivots smaller than this are treated as zero during inversion. The
/// determinant check itself is exact (== 0.0); the regularization loop in the
/// prediction engine nudges the matrix away from that before inverting.
const PIVOT_EPS: f64 = 1e-12;

impl Matrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.data[i * self.n + j] = v;
    }

    pub fn add(&mut self, i: usize, j: usize, dv: f64) {
        self.data[i * self.n + j] += dv;
    }

    /// Determinant via Gaussian elimination with partial pivoting. Returns
    /// exactly 0.0 when a pivot column is entirely zero.
    pub fn determinant(&self) -> f64 {
        let n = self.n;
        if n == 0 {
            return 1.0;
        }
        let mut a = self.clone();
        let mut det = 1.0;

        for col in 0..n {
            // Largest remaining pivot in this column.
            let mut pivot_row = col;
            for row in col + 1..n {
                if a.get(row, col).abs() > a.get(pivot_row, col).abs() {
                    pivot_row = row;
                }
            }
            let pivot = a.get(pivot_row, col);
            if pivot == 0.0 {
                return 0.0;
            }
            if pivot_row != col {
                a.swap_rows(pivot_row, col);
                det = -det;
            }
            det *= pivot;
            for row in col + 1..n {
                let factor = a.get(row, col) / pivot;
                for j in col..n {
                    let v = a.get(row, j) - factor * a.get(col, j);
                    a.set(row, j, v);
                }
            }
        }
        det
    }

    /// Gauss-Jordan inverse. None when a pivot collapses below `PIVOT_EPS`.
    pub fn inverse(&self) -> Option<Matrix> {
        let n = self.n;
        let mut a = self.clone();
        let mut inv = Matrix::identity(n);

        for col in 0..n {
            let mut pivot_row = col;
            for row in col + 1..n {
                if a.get(row, col).abs() > a.get(pivot_row, col).abs() {
                    pivot_row = row;
                }
            }
            if a.get(pivot_row, col).abs() < PIVOT_EPS {
                return None;
            }
            if pivot_row != col {
                a.swap_rows(pivot_row, col);
                inv.swap_rows(pivot_row, col);
            }
            let pivot = a.get(col, col);
            for j in 0..n {
                a.set(col, j, a.get(col, j) / pivot);
                inv.set(col, j, inv.get(col, j) / pivot);
            }
            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = a.get(row, col);
                if factor == 0.0 {
                    continue;
                }
                for j in 0..n {
                    let av = a.get(row, j) - factor * a.get(col, j);
                    a.set(row, j, av);
                    let iv = inv.get(row, j) - factor * inv.get(col, j);
                    inv.set(row, j, iv);
                }
            }
        }
        Some(inv)
    }

    pub fn row_sums(&self) -> Vec<f64> {
        (0..self.n)
            .map(|i| (0..self.n).map(|j| self.get(i, j)).sum())
            .collect()
    }

    fn swap_rows(&mut self, r1: usize, r2: usize) {
        for j in 0..self.n {
            self.data.swap(r1 * self.n + j, r2 * self.n + j);
        }
    }
}

/// Population covariance (dividing by the sample count, not count-1) of two
/// paired series. None when the series is empty.
pub fn population_covariance(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;
    let cov = pairs
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum::<f64>()
        / n;
    Some(cov)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_rows(rows: &[&[f64]]) -> Matrix {
        let n = rows.len();
        let mut m = Matrix::zeros(n);
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                m.set(i, j, *v);
            }
        }
        m
    }

    #[test]
    fn determinant_of_known_matrices() {
        assert!((Matrix::identity(3).determinant() - 1.0).abs() < 1e-12);
        let m = from_rows(&[&[2.0, 1.0], &[1.0, 3.0]]);
        assert!((m.determinant() - 5.0).abs() < 1e-12);
        // Linearly dependent rows.
        let m = from_rows(&[&[1.0, 2.0], &[2.0, 4.0]]);
        assert_eq!(m.determinant(), 0.0);
    }

    #[test]
    fn inverse_of_two_by_two() {
        let m = from_rows(&[&[4.0, 7.0], &[2.0, 6.0]]);
        let inv = m.inverse().unwrap();
        // Known inverse: 1/10 * [6 -7; -2 4]
        assert!((inv.get(0, 0) - 0.6).abs() < 1e-9);
        assert!((inv.get(0, 1) + 0.7).abs() < 1e-9);
        assert!((inv.get(1, 0) + 0.2).abs() < 1e-9);
        assert!((inv.get(1, 1) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn inverse_times_original_is_identity() {
        let m = from_rows(&[
            &[2.0, 0.5, 0.1],
            &[0.5, 1.5, 0.2],
            &[0.1, 0.2, 1.0],
        ]);
        let inv = m.inverse().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let cell: f64 = (0..3).map(|k| m.get(i, k) * inv.get(k, j)).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((cell - expected).abs() < 1e-9, "cell ({i},{j}) = {cell}");
            }
        }
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        let m = from_rows(&[&[1.0, 2.0], &[2.0, 4.0]]);
        assert!(m.inverse().is_none());
    }

    #[test]
    fn covariance_population_formula() {
        // var of [0,1] around mean 0.5 with /n is 0.25
        let cov = population_covariance(&[(0.0, 0.0), (1.0, 1.0)]).unwrap();
        assert!((cov - 0.25).abs() < 1e-12);
        // Anti-correlated pair.
        let cov = population_covariance(&[(0.0, 1.0), (1.0, 0.0)]).unwrap();
        assert!((cov + 0.25).abs() < 1e-12);
        assert_eq!(population_covariance(&[]), None);
    }

    #[test]
    fn row_sums_sum_rows() {
        let m = from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]);
        assert_eq!(m.row_sums(), vec![3.0, 7.0]);
    }
}
