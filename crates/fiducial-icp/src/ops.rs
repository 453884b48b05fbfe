//! Crate-private Gauss-Newton building blocks: projection with its
//! homogeneous coordinates kept around, the analytic reprojection
//! Jacobian, and normal-equation accumulation solved through the dense
//! kernel.

use fiducial_linalg::Matrix;

use crate::geometry::Mat34;
use crate::IcpError;

/// Homogeneous depth below which a projection is degenerate. Mirrors the
/// public check in `geometry::project_point`.
const DEGENERATE_DEPTH: f64 = 1e-10;

/// A projected point with its homogeneous coordinates retained for
/// Jacobian evaluation.
pub(crate) struct Projection {
    pub u: f64,
    pub v: f64,
    pub h: [f64; 3],
}

/// Project an already-transformed 3D point through a 3x4 camera matrix.
pub(crate) fn project_h(camera: &Mat34, point: &[f64; 3]) -> Result<Projection, IcpError> {
    let h = [
        camera[0][0] * point[0] + camera[0][1] * point[1] + camera[0][2] * point[2] + camera[0][3],
        camera[1][0] * point[0] + camera[1][1] * point[1] + camera[1][2] * point[2] + camera[1][3],
        camera[2][0] * point[0] + camera[2][1] * point[1] + camera[2][2] * point[2] + camera[2][3],
    ];
    if h[2] < DEGENERATE_DEPTH {
        return Err(IcpError::DegenerateProjection);
    }
    Ok(Projection {
        u: h[0] / h[2],
        v: h[1] / h[2],
        h,
    })
}

/// 2x6 Jacobian of the projected image point with respect to a
/// right-applied rotation-vector + translation increment.
///
/// `b` is the product of the camera's 3x3 block with every rotation
/// sitting left of the increment in the projection chain; `x` is the
/// point the increment acts on (the world point for a pose increment,
/// the left-camera point for an extrinsic increment).
pub(crate) fn point_jacobian(
    b: &[[f64; 3]; 3],
    x: &[f64; 3],
    proj: &Projection,
) -> [[f64; 6]; 2] {
    // columns of d(increment ∘ x)/d(rotation vector) at zero: e_k × x
    let rot_cols = [
        [0.0, -x[2], x[1]],
        [x[2], 0.0, -x[0]],
        [-x[1], x[0], 0.0],
    ];

    let mut jac = [[0.0; 6]; 2];
    let inv_w = 1.0 / proj.h[2];
    for k in 0..6 {
        // dh/d(param k), first three rotation then three translation
        let dir = if k < 3 {
            rot_cols[k]
        } else {
            [b[0][k - 3], b[1][k - 3], b[2][k - 3]]
        };
        let dh = if k < 3 {
            [
                b[0][0] * dir[0] + b[0][1] * dir[1] + b[0][2] * dir[2],
                b[1][0] * dir[0] + b[1][1] * dir[1] + b[1][2] * dir[2],
                b[2][0] * dir[0] + b[2][1] * dir[1] + b[2][2] * dir[2],
            ]
        } else {
            dir
        };
        jac[0][k] = (dh[0] - proj.u * dh[2]) * inv_w;
        jac[1][k] = (dh[1] - proj.v * dh[2]) * inv_w;
    }
    jac
}

/// Accumulate one scalar residual row into the weighted normal equations.
pub(crate) fn accumulate(
    jtj: &mut Matrix,
    jtr: &mut Matrix,
    row: &[f64],
    residual: f64,
    weight: f64,
) {
    for (j, &rj) in row.iter().enumerate() {
        if rj == 0.0 {
            continue;
        }
        jtr[(j, 0)] += weight * rj * residual;
        for (k, &rk) in row.iter().enumerate() {
            if rk == 0.0 {
                continue;
            }
            jtj[(j, k)] += weight * rj * rk;
        }
    }
}

/// Solve the accumulated normal equations for the parameter increment.
///
/// A singular system (degenerate correspondence geometry) surfaces as
/// [`fiducial_linalg::LinalgError::Singular`] through the `From`
/// conversion.
pub(crate) fn solve_normal_equations(jtj: &Matrix, jtr: &Matrix) -> Result<Vec<f64>, IcpError> {
    let inv = jtj.inverse()?;
    let delta = inv.mul(jtr)?;
    Ok((0..delta.rows()).map(|i| delta[(i, 0)]).collect())
}

/// First six entries of a parameter slice as a pose increment.
pub(crate) fn take_delta6(d: &[f64]) -> [f64; 6] {
    [d[0], d[1], d[2], d[3], d[4], d[5]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{rotation_block, transform_point, Mat34, MAT34_IDENTITY};
    use approx::assert_relative_eq;

    #[test]
    fn test_point_jacobian_matches_finite_differences() -> Result<(), Box<dyn std::error::Error>>
    {
        let camera: Mat34 = [
            [120.0, 0.0, 80.0, 0.0],
            [0.0, 110.0, 60.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
        let pose: Mat34 = [
            [1.0, 0.0, 0.0, 0.3],
            [0.0, 1.0, 0.0, -0.1],
            [0.0, 0.0, 1.0, 8.0],
        ];
        let world = [0.7, -0.4, 0.2];

        let pc = transform_point(&pose, &world);
        let proj = project_h(&camera, &pc)?;
        let b = crate::geometry::matmul33(&rotation_block(&camera), &rotation_block(&pose));
        let jac = point_jacobian(&b, &world, &proj);

        let eps = 1e-7;
        for k in 0..6 {
            let mut d = [0.0; 6];
            d[k] = eps;
            let plus = crate::geometry::compose(&pose, &crate::geometry::delta_transform(&d));
            d[k] = -eps;
            let minus = crate::geometry::compose(&pose, &crate::geometry::delta_transform(&d));

            let pp = project_h(&camera, &transform_point(&plus, &world))?;
            let pm = project_h(&camera, &transform_point(&minus, &world))?;

            assert_relative_eq!(jac[0][k], (pp.u - pm.u) / (2.0 * eps), epsilon = 1e-4);
            assert_relative_eq!(jac[1][k], (pp.v - pm.v) / (2.0 * eps), epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_accumulate_and_solve_identity_system() -> Result<(), Box<dyn std::error::Error>> {
        let mut jtj = Matrix::zeros(3, 3)?;
        let mut jtr = Matrix::zeros(3, 1)?;
        accumulate(&mut jtj, &mut jtr, &[1.0, 0.0, 0.0], 2.0, 1.0);
        accumulate(&mut jtj, &mut jtr, &[0.0, 1.0, 0.0], -3.0, 1.0);
        accumulate(&mut jtj, &mut jtr, &[0.0, 0.0, 1.0], 0.5, 1.0);
        let delta = solve_normal_equations(&jtj, &jtr)?;
        assert_relative_eq!(delta[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(delta[1], -3.0, epsilon = 1e-12);
        assert_relative_eq!(delta[2], 0.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_projection_degenerate_depth() {
        let proj = project_h(&MAT34_IDENTITY, &[0.0, 0.0, 0.0]);
        assert!(matches!(proj, Err(IcpError::DegenerateProjection)));
    }
}
