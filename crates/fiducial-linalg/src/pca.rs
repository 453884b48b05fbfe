use crate::{LinalgError, Matrix};

/// Sweep budget per eigenvalue in the QL iteration.
const MAX_QL_SWEEPS: usize = 30;

/// Result of a principal component analysis.
#[derive(Debug, Clone)]
pub struct Pca {
    /// Eigenvectors of the covariance as rows, sorted to match
    /// `eigenvalues`. Row 0 is the principal axis.
    pub eigenvectors: Matrix,
    /// Covariance eigenvalues in descending order.
    pub eigenvalues: Vec<f64>,
    /// Mean of the input rows.
    pub mean: Vec<f64>,
}

/// Reduce a symmetric matrix to tridiagonal form by Householder
/// reflections, in place.
///
/// On return `a` holds the accumulated orthogonal transform (column `k`
/// feeds eigenvector `k` through [`tridiagonal_eigen`]), and the returned
/// pair is `(diagonal, off_diagonal)` with the off-diagonal in indices
/// `1..n`.
///
/// PRECONDITION: `a` is symmetric; only the lower triangle is read.
pub fn tridiagonalize(a: &mut Matrix) -> Result<(Vec<f64>, Vec<f64>), LinalgError> {
    if a.rows() != a.cols() {
        return Err(LinalgError::NotSquare {
            rows: a.rows(),
            cols: a.cols(),
        });
    }
    let n = a.rows();
    let mut d = vec![0.0; n];
    let mut e = vec![0.0; n];

    if n == 1 {
        d[0] = a[(0, 0)];
        a[(0, 0)] = 1.0;
        return Ok((d, e));
    }

    for i in (1..n).rev() {
        let l = i - 1;
        let mut h = 0.0;
        if l > 0 {
            let mut scale = 0.0;
            for k in 0..=l {
                scale += a[(i, k)].abs();
            }
            if scale == 0.0 {
                // row already reduced
                e[i] = a[(i, l)];
            } else {
                for k in 0..=l {
                    a[(i, k)] /= scale;
                    h += a[(i, k)] * a[(i, k)];
                }
                let f = a[(i, l)];
                let g = if f >= 0.0 { -h.sqrt() } else { h.sqrt() };
                e[i] = scale * g;
                h -= f * g;
                a[(i, l)] = f - g;
                let mut f_acc = 0.0;
                for j in 0..=l {
                    a[(j, i)] = a[(i, j)] / h;
                    let mut g_acc = 0.0;
                    for k in 0..=j {
                        g_acc += a[(j, k)] * a[(i, k)];
                    }
                    for k in (j + 1)..=l {
                        g_acc += a[(k, j)] * a[(i, k)];
                    }
                    e[j] = g_acc / h;
                    f_acc += e[j] * a[(i, j)];
                }
                let hh = f_acc / (h + h);
                for j in 0..=l {
                    let f = a[(i, j)];
                    let g = e[j] - hh * f;
                    e[j] = g;
                    for k in 0..=j {
                        let delta = f * e[k] + g * a[(i, k)];
                        a[(j, k)] -= delta;
                    }
                }
            }
        } else {
            e[i] = a[(i, l)];
        }
        d[i] = h;
    }
    d[0] = 0.0;
    e[0] = 0.0;

    // accumulate the orthogonal transform
    for i in 0..n {
        if d[i] != 0.0 {
            for j in 0..i {
                let mut g = 0.0;
                for k in 0..i {
                    g += a[(i, k)] * a[(k, j)];
                }
                for k in 0..i {
                    let delta = g * a[(k, i)];
                    a[(k, j)] -= delta;
                }
            }
        }
        d[i] = a[(i, i)];
        a[(i, i)] = 1.0;
        for j in 0..i {
            a[(j, i)] = 0.0;
            a[(i, j)] = 0.0;
        }
    }

    Ok((d, e))
}

/// Eigen-decompose a symmetric tridiagonal matrix by QL iteration with
/// implicit shifts.
///
/// `d` holds the diagonal and is replaced by the eigenvalues (unsorted);
/// `e` holds the off-diagonal in indices `1..n` and is destroyed. `z`
/// must be the transform accumulated by [`tridiagonalize`] (or the
/// identity for a matrix already tridiagonal); its column `k` is replaced
/// by the eigenvector for `d[k]`.
pub fn tridiagonal_eigen(
    d: &mut [f64],
    e: &mut [f64],
    z: &mut Matrix,
) -> Result<(), LinalgError> {
    let n = d.len();
    if e.len() != n || z.rows() != n || z.cols() != n {
        return Err(LinalgError::IncompatibleDimensions {
            op: "tridiagonal_eigen",
            lhs_rows: n,
            lhs_cols: e.len(),
            rhs_rows: z.rows(),
            rhs_cols: z.cols(),
        });
    }
    if n == 0 {
        return Err(LinalgError::ZeroDimension { rows: 0, cols: 0 });
    }

    for i in 1..n {
        e[i - 1] = e[i];
    }
    e[n - 1] = 0.0;

    for l in 0..n {
        let mut sweeps = 0;
        loop {
            // locate a negligible off-diagonal element
            let mut m = l;
            while m + 1 < n {
                let dd = d[m].abs() + d[m + 1].abs();
                if e[m].abs() <= f64::EPSILON * dd {
                    break;
                }
                m += 1;
            }
            if m == l {
                break;
            }
            sweeps += 1;
            if sweeps > MAX_QL_SWEEPS {
                return Err(LinalgError::EigenNotConverged {
                    max_sweeps: MAX_QL_SWEEPS,
                });
            }

            // implicit shift from the 2x2 at the bottom of the block
            let mut g = (d[l + 1] - d[l]) / (2.0 * e[l]);
            let mut r = g.hypot(1.0);
            let sign_r = if g >= 0.0 { r.abs() } else { -r.abs() };
            g = d[m] - d[l] + e[l] / (g + sign_r);
            let mut s = 1.0;
            let mut c = 1.0;
            let mut p = 0.0;
            let mut underflow = false;

            for i in (l..m).rev() {
                let mut f = s * e[i];
                let b = c * e[i];
                r = f.hypot(g);
                e[i + 1] = r;
                if r == 0.0 {
                    d[i + 1] -= p;
                    e[m] = 0.0;
                    underflow = true;
                    break;
                }
                s = f / r;
                c = g / r;
                g = d[i + 1] - p;
                r = (d[i] - g) * s + 2.0 * c * b;
                p = s * r;
                d[i + 1] = g + p;
                g = c * r - b;

                for k in 0..n {
                    f = z[(k, i + 1)];
                    z[(k, i + 1)] = s * z[(k, i)] + c * f;
                    z[(k, i)] = c * z[(k, i)] - s * f;
                }
            }
            if underflow {
                continue;
            }
            d[l] -= p;
            e[l] = g;
            e[m] = 0.0;
        }
    }
    Ok(())
}

/// Principal component analysis of the rows of `input`.
///
/// Computes the mean row, the covariance normalized by the sample count,
/// and its eigen-decomposition via Householder tridiagonalization and QL
/// iteration. Eigenpairs come back sorted by descending eigenvalue with
/// eigenvectors as rows, so row 0 of `eigenvectors` is the direction of
/// largest variance and the last row the direction of least.
pub fn pca(input: &Matrix) -> Result<Pca, LinalgError> {
    let n = input.rows();
    let m = input.cols();
    if n < 2 {
        return Err(LinalgError::TooFewSamples { rows: n });
    }

    let mut mean = vec![0.0; m];
    for i in 0..n {
        for (j, mj) in mean.iter_mut().enumerate() {
            *mj += input[(i, j)];
        }
    }
    for mj in mean.iter_mut() {
        *mj /= n as f64;
    }

    let mut cov = Matrix::zeros(m, m)?;
    for i in 0..n {
        for j in 0..m {
            let dj = input[(i, j)] - mean[j];
            for k in 0..=j {
                let dk = input[(i, k)] - mean[k];
                cov[(j, k)] += dj * dk;
            }
        }
    }
    for j in 0..m {
        for k in 0..=j {
            let v = cov[(j, k)] / n as f64;
            cov[(j, k)] = v;
            cov[(k, j)] = v;
        }
    }

    if m == 1 {
        let mut eigenvectors = Matrix::zeros(1, 1)?;
        eigenvectors[(0, 0)] = 1.0;
        return Ok(Pca {
            eigenvalues: vec![cov[(0, 0)]],
            eigenvectors,
            mean,
        });
    }

    let (mut d, mut e) = tridiagonalize(&mut cov)?;
    tridiagonal_eigen(&mut d, &mut e, &mut cov)?;

    let mut order = (0..m).collect::<Vec<_>>();
    order.sort_by(|&a, &b| d[b].partial_cmp(&d[a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut eigenvectors = Matrix::zeros(m, m)?;
    let mut eigenvalues = Vec::with_capacity(m);
    for (row, &src) in order.iter().enumerate() {
        eigenvalues.push(d[src]);
        for k in 0..m {
            eigenvectors[(row, k)] = cov[(k, src)];
        }
    }

    Ok(Pca {
        eigenvectors,
        eigenvalues,
        mean,
    })
}
