use crate::LinalgError;

/// Pivot magnitude below which elimination treats a matrix as singular.
const PIVOT_EPS: f64 = 1e-12;

/// Dense matrix of `f64` stored row-major in a single contiguous buffer.
///
/// Sized for the small systems of this crate (covariances, normal
/// equations of a few dozen parameters); all access is bounds checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Allocate a `rows` x `cols` matrix filled with zeros.
    ///
    /// Fails with [`LinalgError::ZeroDimension`] when either dimension is
    /// zero.
    pub fn zeros(rows: usize, cols: usize) -> Result<Self, LinalgError> {
        if rows == 0 || cols == 0 {
            return Err(LinalgError::ZeroDimension { rows, cols });
        }
        Ok(Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        })
    }

    /// Build the `n` x `n` identity matrix.
    pub fn identity(n: usize) -> Result<Self, LinalgError> {
        let mut m = Self::zeros(n, n)?;
        for i in 0..n {
            m[(i, i)] = 1.0;
        }
        Ok(m)
    }

    /// Build a matrix from a row-major slice.
    ///
    /// Fails when the slice length does not equal `rows * cols`.
    pub fn from_slice(rows: usize, cols: usize, values: &[f64]) -> Result<Self, LinalgError> {
        if rows == 0 || cols == 0 {
            return Err(LinalgError::ZeroDimension { rows, cols });
        }
        if values.len() != rows * cols {
            return Err(LinalgError::IncompatibleDimensions {
                op: "from_slice",
                lhs_rows: rows,
                lhs_cols: cols,
                rhs_rows: 1,
                rhs_cols: values.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            data: values.to_vec(),
        })
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The underlying row-major buffer.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Borrow row `r` as a slice.
    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Write `a * b` into `dst`.
    ///
    /// Requires `a.cols == b.rows`, `dst.rows == a.rows` and
    /// `dst.cols == b.cols`; fails with
    /// [`LinalgError::IncompatibleDimensions`] otherwise and leaves `dst`
    /// untouched.
    pub fn mul_into(dst: &mut Matrix, a: &Matrix, b: &Matrix) -> Result<(), LinalgError> {
        if a.cols != b.rows {
            return Err(LinalgError::IncompatibleDimensions {
                op: "mul",
                lhs_rows: a.rows,
                lhs_cols: a.cols,
                rhs_rows: b.rows,
                rhs_cols: b.cols,
            });
        }
        if dst.rows != a.rows || dst.cols != b.cols {
            return Err(LinalgError::IncompatibleDimensions {
                op: "mul destination",
                lhs_rows: dst.rows,
                lhs_cols: dst.cols,
                rhs_rows: a.rows,
                rhs_cols: b.cols,
            });
        }
        for i in 0..a.rows {
            for j in 0..b.cols {
                let mut acc = 0.0;
                for k in 0..a.cols {
                    acc += a.data[i * a.cols + k] * b.data[k * b.cols + j];
                }
                dst.data[i * dst.cols + j] = acc;
            }
        }
        Ok(())
    }

    /// Multiply by `rhs`, allocating the result.
    pub fn mul(&self, rhs: &Matrix) -> Result<Matrix, LinalgError> {
        if self.cols != rhs.rows {
            return Err(LinalgError::IncompatibleDimensions {
                op: "mul",
                lhs_rows: self.rows,
                lhs_cols: self.cols,
                rhs_rows: rhs.rows,
                rhs_cols: rhs.cols,
            });
        }
        let mut dst = Matrix::zeros(self.rows, rhs.cols)?;
        Matrix::mul_into(&mut dst, self, rhs)?;
        Ok(dst)
    }

    /// Return the transpose.
    pub fn transpose(&self) -> Matrix {
        let mut t = Matrix {
            rows: self.cols,
            cols: self.rows,
            data: vec![0.0; self.data.len()],
        };
        for i in 0..self.rows {
            for j in 0..self.cols {
                t.data[j * t.cols + i] = self.data[i * self.cols + j];
            }
        }
        t
    }

    /// Invert in place by Gauss-Jordan elimination with partial pivoting.
    ///
    /// Fails with [`LinalgError::NotSquare`] on a non-square matrix and
    /// [`LinalgError::Singular`] when a pivot falls below tolerance; the
    /// matrix is left unchanged on failure.
    pub fn invert(&mut self) -> Result<(), LinalgError> {
        let inv = self.inverse()?;
        *self = inv;
        Ok(())
    }

    /// Return the inverse, leaving `self` untouched.
    pub fn inverse(&self) -> Result<Matrix, LinalgError> {
        if self.rows != self.cols {
            return Err(LinalgError::NotSquare {
                rows: self.rows,
                cols: self.cols,
            });
        }
        let n = self.rows;
        let mut work = self.data.clone();
        let mut inv = Matrix::identity(n)?;

        for col in 0..n {
            // partial pivoting: largest magnitude in the remaining column
            let mut pivot_row = col;
            let mut pivot_mag = work[col * n + col].abs();
            for r in (col + 1)..n {
                let mag = work[r * n + col].abs();
                if mag > pivot_mag {
                    pivot_row = r;
                    pivot_mag = mag;
                }
            }
            if pivot_mag < PIVOT_EPS {
                return Err(LinalgError::Singular);
            }
            if pivot_row != col {
                for j in 0..n {
                    work.swap(col * n + j, pivot_row * n + j);
                    inv.data.swap(col * n + j, pivot_row * n + j);
                }
            }

            let pivot = work[col * n + col];
            for j in 0..n {
                work[col * n + j] /= pivot;
                inv.data[col * n + j] /= pivot;
            }

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work[r * n + col];
                if factor == 0.0 {
                    continue;
                }
                for j in 0..n {
                    work[r * n + j] -= factor * work[col * n + j];
                    inv.data[r * n + j] -= factor * inv.data[col * n + j];
                }
            }
        }
        Ok(inv)
    }

    /// Determinant via LU-style elimination with partial pivoting.
    ///
    /// A singular matrix yields `0.0`; only a non-square input is an
    /// error.
    pub fn determinant(&self) -> Result<f64, LinalgError> {
        if self.rows != self.cols {
            return Err(LinalgError::NotSquare {
                rows: self.rows,
                cols: self.cols,
            });
        }
        let n = self.rows;
        let mut work = self.data.clone();
        let mut det = 1.0;

        for col in 0..n {
            let mut pivot_row = col;
            let mut pivot_mag = work[col * n + col].abs();
            for r in (col + 1)..n {
                let mag = work[r * n + col].abs();
                if mag > pivot_mag {
                    pivot_row = r;
                    pivot_mag = mag;
                }
            }
            if pivot_mag < PIVOT_EPS {
                return Ok(0.0);
            }
            if pivot_row != col {
                for j in 0..n {
                    work.swap(col * n + j, pivot_row * n + j);
                }
                det = -det;
            }
            let pivot = work[col * n + col];
            det *= pivot;
            for r in (col + 1)..n {
                let factor = work[r * n + col] / pivot;
                if factor == 0.0 {
                    continue;
                }
                for j in col..n {
                    work[r * n + j] -= factor * work[col * n + j];
                }
            }
        }
        Ok(det)
    }
}

impl std::ops::Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        assert!(r < self.rows && c < self.cols, "matrix index out of bounds");
        &self.data[r * self.cols + c]
    }
}

impl std::ops::IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        assert!(r < self.rows && c < self.cols, "matrix index out of bounds");
        &mut self.data[r * self.cols + c]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_zeros_rejects_zero_dimension() {
        assert_eq!(
            Matrix::zeros(0, 3),
            Err(LinalgError::ZeroDimension { rows: 0, cols: 3 })
        );
        assert_eq!(
            Matrix::zeros(3, 0),
            Err(LinalgError::ZeroDimension { rows: 3, cols: 0 })
        );
    }

    #[test]
    fn test_mul_dimension_mismatch() -> Result<(), Box<dyn std::error::Error>> {
        let a = Matrix::zeros(2, 3)?;
        let b = Matrix::zeros(2, 3)?;
        assert!(matches!(
            a.mul(&b),
            Err(LinalgError::IncompatibleDimensions { op: "mul", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_mul_into_checks_destination() -> Result<(), Box<dyn std::error::Error>> {
        let a = Matrix::zeros(2, 3)?;
        let b = Matrix::zeros(3, 4)?;
        let mut dst = Matrix::zeros(2, 3)?;
        assert!(matches!(
            Matrix::mul_into(&mut dst, &a, &b),
            Err(LinalgError::IncompatibleDimensions {
                op: "mul destination",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_mul_matches_faer() -> Result<(), Box<dyn std::error::Error>> {
        let a_values = (0..6 * 5).map(|_| rand::random::<f64>()).collect::<Vec<_>>();
        let b_values = (0..5 * 4).map(|_| rand::random::<f64>()).collect::<Vec<_>>();
        let a = Matrix::from_slice(6, 5, &a_values)?;
        let b = Matrix::from_slice(5, 4, &b_values)?;
        let c = a.mul(&b)?;

        let a_ref = faer::mat::from_row_major_slice(&a_values, 6, 5);
        let b_ref = faer::mat::from_row_major_slice(&b_values, 5, 4);
        let mut c_ref = faer::Mat::<f64>::zeros(6, 4);
        faer::linalg::matmul::matmul(
            c_ref.as_mut(),
            a_ref,
            b_ref,
            None,
            1.0,
            faer::Parallelism::None,
        );

        for i in 0..6 {
            for j in 0..4 {
                assert_relative_eq!(c[(i, j)], c_ref.read(i, j), epsilon = 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn test_transpose() -> Result<(), Box<dyn std::error::Error>> {
        let m = Matrix::from_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        let t = m.transpose();
        assert_eq!(t.rows(), 3);
        assert_eq!(t.cols(), 2);
        for i in 0..2 {
            for j in 0..3 {
                assert_eq!(m[(i, j)], t[(j, i)]);
            }
        }
        Ok(())
    }

    #[test]
    fn test_inverse_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let m = Matrix::from_slice(3, 3, &[4.0, 7.0, 2.0, 3.0, 6.0, 1.0, 2.0, 5.0, 3.0])?;
        let inv = m.inverse()?;
        let prod = m.mul(&inv)?;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(prod[(i, j)], expected, epsilon = 1e-10);
            }
        }
        Ok(())
    }

    #[test]
    fn test_invert_in_place_random() -> Result<(), Box<dyn std::error::Error>> {
        // diagonally dominant, guaranteed invertible
        let n = 6;
        let mut m = Matrix::zeros(n, n)?;
        for i in 0..n {
            for j in 0..n {
                m[(i, j)] = rand::random::<f64>();
            }
            m[(i, i)] += n as f64;
        }
        let original = m.clone();
        m.invert()?;
        let prod = original.mul(&m)?;
        for i in 0..n {
            for j in 0..n {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(prod[(i, j)], expected, epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn test_singular_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let m = Matrix::from_slice(2, 2, &[1.0, 2.0, 2.0, 4.0])?;
        assert_eq!(m.inverse(), Err(LinalgError::Singular));
        assert_relative_eq!(m.determinant()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_determinant() -> Result<(), Box<dyn std::error::Error>> {
        let m = Matrix::from_slice(3, 3, &[2.0, 0.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 4.0])?;
        assert_relative_eq!(m.determinant()?, 24.0, epsilon = 1e-12);

        let m = Matrix::from_slice(2, 2, &[0.0, 1.0, 1.0, 0.0])?;
        assert_relative_eq!(m.determinant()?, -1.0, epsilon = 1e-12);

        let m = Matrix::zeros(2, 3)?;
        assert!(matches!(m.determinant(), Err(LinalgError::NotSquare { .. })));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "matrix index out of bounds")]
    fn test_index_out_of_bounds_panics() {
        let m = Matrix::zeros(2, 2).unwrap();
        let _ = m[(2, 0)];
    }
}
