use fiducial_linalg::Matrix;

use crate::geometry::{
    compose, delta_transform, matmul33, rotation_block, transform_point, Mat34,
};
use crate::mono::{check_correspondences, StopReason};
use crate::ops::{accumulate, point_jacobian, project_h, solve_normal_equations, take_delta6};
use crate::IcpError;

/// Default iteration budget for batch calibration.
pub const CALIB_MAX_LOOP_DEFAULT: usize = 100;
/// Default error threshold for batch calibration.
pub const CALIB_BREAK_LOOP_ERROR_THRESH_DEFAULT: f64 = 0.001;
/// Default error-ratio threshold for batch calibration.
pub const CALIB_BREAK_LOOP_ERROR_RATIO_THRESH_DEFAULT: f64 = 0.99;

/// One stereo calibration observation: a board/marker seen in both views
/// with a per-set initial pose guess relative to the left camera.
#[derive(Debug, Clone)]
pub struct StereoCalibSet {
    /// 3D points observed in the left view.
    pub world_left: Vec<[f64; 3]>,
    /// Ideal image coordinates matching `world_left`.
    pub image_left: Vec<[f64; 2]>,
    /// 3D points observed in the right view.
    pub world_right: Vec<[f64; 3]>,
    /// Ideal image coordinates matching `world_right`.
    pub image_right: Vec<[f64; 2]>,
    /// Initial guess for this set's pose relative to the left camera.
    pub initial_pose: Mat34,
}

/// Parameters controlling batch stereo calibration.
#[derive(Debug, Clone)]
pub struct StereoCalibParams {
    /// Maximum number of joint Gauss-Newton updates.
    pub max_loop: usize,
    /// Error threshold under which calibration stops as converged.
    pub break_loop_error_thresh: f64,
    /// Error-ratio threshold above which successive errors count as a
    /// plateau.
    pub break_loop_error_ratio_thresh: f64,
}

impl Default for StereoCalibParams {
    fn default() -> Self {
        Self {
            max_loop: CALIB_MAX_LOOP_DEFAULT,
            break_loop_error_thresh: CALIB_BREAK_LOOP_ERROR_THRESH_DEFAULT,
            break_loop_error_ratio_thresh: CALIB_BREAK_LOOP_ERROR_RATIO_THRESH_DEFAULT,
        }
    }
}

impl StereoCalibParams {
    /// Create default calibration parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the iteration budget.
    pub fn with_max_loop(mut self, max_loop: usize) -> Self {
        self.max_loop = max_loop;
        self
    }

    /// Set the error threshold.
    pub fn with_break_loop_error_thresh(mut self, thresh: f64) -> Self {
        self.break_loop_error_thresh = thresh;
        self
    }

    /// Set the error-ratio threshold.
    pub fn with_break_loop_error_ratio_thresh(mut self, thresh: f64) -> Self {
        self.break_loop_error_ratio_thresh = thresh;
        self
    }
}

/// Result of batch stereo calibration.
#[derive(Debug, Clone)]
pub struct StereoCalibResult {
    /// Calibrated rigid transform from left-camera to right-camera space.
    pub right_from_left: Mat34,
    /// Refined per-set poses relative to the left camera.
    pub poses: Vec<Mat34>,
    /// Final mean squared residual across all sets and both views.
    pub err: f64,
    /// Number of joint updates applied.
    pub iterations: usize,
    /// Which termination rule fired.
    pub stop: StopReason,
}

/// Estimate the stereo extrinsic transform jointly consistent with all
/// calibration sets.
///
/// One Gauss-Newton system per iteration covers `6 + 6K` parameters: the
/// shared left-to-right extrinsic plus one pose per set. Left-view
/// residuals constrain only their set's pose; right-view residuals
/// constrain the pose and the extrinsic together. Termination follows
/// the refinement cores, with the plateau rule gated on the error ratio
/// alone.
///
/// # Errors
///
/// [`IcpError::NoCalibrationData`] on an empty set list; per-set
/// contract checks as in [`crate::IcpStereoHandle::refine`]; degenerate
/// projections and singular systems as numerical failures.
pub fn calibrate_stereo(
    camera_left: &Mat34,
    camera_right: &Mat34,
    initial_right_from_left: &Mat34,
    sets: &[StereoCalibSet],
    params: &StereoCalibParams,
) -> Result<StereoCalibResult, IcpError> {
    if sets.is_empty() {
        return Err(IcpError::NoCalibrationData);
    }
    let mut total_count = 0;
    for set in sets {
        check_correspondences(&set.world_left, &set.image_left)?;
        check_correspondences(&set.world_right, &set.image_right)?;
        total_count += set.world_left.len() + set.world_right.len();
    }

    let n_params = 6 + 6 * sets.len();
    let mut right_from_left = *initial_right_from_left;
    let mut poses = sets.iter().map(|s| s.initial_pose).collect::<Vec<_>>();
    let mut prev_err = 0.0;
    let mut updates = 0;
    let mut err;

    let stop = loop {
        err = 0.0;
        for (set, pose) in sets.iter().zip(poses.iter()) {
            let right_pose = compose(&right_from_left, pose);
            for (pw, pi) in set.world_left.iter().zip(set.image_left.iter()) {
                let proj = project_h(camera_left, &transform_point(pose, pw))?;
                let du = pi[0] - proj.u;
                let dv = pi[1] - proj.v;
                err += du * du + dv * dv;
            }
            for (pw, pi) in set.world_right.iter().zip(set.image_right.iter()) {
                let proj = project_h(camera_right, &transform_point(&right_pose, pw))?;
                let du = pi[0] - proj.u;
                let dv = pi[1] - proj.v;
                err += du * du + dv * dv;
            }
        }
        err /= total_count as f64;

        if err < params.break_loop_error_thresh {
            break StopReason::ErrorBelowThreshold;
        }
        if updates > 0 && err / prev_err > params.break_loop_error_ratio_thresh {
            break StopReason::Plateau;
        }
        if updates == params.max_loop {
            break StopReason::MaxIterations;
        }
        prev_err = err;

        let mut jtj = Matrix::zeros(n_params, n_params)?;
        let mut jtr = Matrix::zeros(n_params, 1)?;
        let mut row = vec![0.0; n_params];

        let b_extrinsic_base = matmul33(
            &rotation_block(camera_right),
            &rotation_block(&right_from_left),
        );

        for (set_idx, (set, pose)) in sets.iter().zip(poses.iter()).enumerate() {
            let offset = 6 + 6 * set_idx;
            let right_pose = compose(&right_from_left, pose);

            // left view: only this set's pose block
            let b_left = matmul33(&rotation_block(camera_left), &rotation_block(pose));
            for (pw, pi) in set.world_left.iter().zip(set.image_left.iter()) {
                let proj = project_h(camera_left, &transform_point(pose, pw))?;
                let jac = point_jacobian(&b_left, pw, &proj);
                for (coord, jac_row) in jac.iter().enumerate() {
                    row[offset..offset + 6].copy_from_slice(jac_row);
                    let residual = pi[coord] - if coord == 0 { proj.u } else { proj.v };
                    accumulate(&mut jtj, &mut jtr, &row, residual, 1.0);
                }
                row[offset..offset + 6].fill(0.0);
            }

            // right view: the pose block and the shared extrinsic block
            let b_pose = matmul33(
                &rotation_block(camera_right),
                &rotation_block(&right_pose),
            );
            for (pw, pi) in set.world_right.iter().zip(set.image_right.iter()) {
                let left_point = transform_point(pose, pw);
                let proj = project_h(camera_right, &transform_point(&right_pose, pw))?;
                let jac_pose = point_jacobian(&b_pose, pw, &proj);
                let jac_extrinsic = point_jacobian(&b_extrinsic_base, &left_point, &proj);
                for coord in 0..2 {
                    row[0..6].copy_from_slice(&jac_extrinsic[coord]);
                    row[offset..offset + 6].copy_from_slice(&jac_pose[coord]);
                    let residual = pi[coord] - if coord == 0 { proj.u } else { proj.v };
                    accumulate(&mut jtj, &mut jtr, &row, residual, 1.0);
                }
                row[0..6].fill(0.0);
                row[offset..offset + 6].fill(0.0);
            }
        }

        let delta = solve_normal_equations(&jtj, &jtr)?;
        right_from_left = compose(&right_from_left, &delta_transform(&take_delta6(&delta)));
        for (set_idx, pose) in poses.iter_mut().enumerate() {
            let offset = 6 + 6 * set_idx;
            *pose = compose(pose, &delta_transform(&take_delta6(&delta[offset..])));
        }
        updates += 1;
        log::debug!("calibration update {}: err {}", updates, err);
    };

    Ok(StereoCalibResult {
        right_from_left,
        poses,
        err,
        iterations: updates,
        stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{is_rotation_orthonormal, project_point, rotation_vector_to_matrix};
    use approx::assert_relative_eq;

    fn camera_matrix(fx: f64, fy: f64, cx: f64, cy: f64) -> Mat34 {
        [
            [fx, 0.0, cx, 0.0],
            [0.0, fy, cy, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ]
    }

    fn pose_from(w: &[f64; 3], t: &[f64; 3]) -> Mat34 {
        let r = rotation_vector_to_matrix(w);
        [
            [r[0][0], r[0][1], r[0][2], t[0]],
            [r[1][0], r[1][1], r[1][2], t[1]],
            [r[2][0], r[2][1], r[2][2], t[2]],
        ]
    }

    fn board() -> Vec<[f64; 3]> {
        vec![
            [-1.0, -1.0, 0.0],
            [1.0, -1.0, 0.0],
            [1.0, 1.0, 0.0],
            [-1.0, 1.0, 0.0],
            [0.0, -1.0, 0.0],
            [0.0, 1.0, 0.0],
        ]
    }

    fn make_set(
        camera_left: &Mat34,
        camera_right: &Mat34,
        right_from_left: &Mat34,
        truth: &Mat34,
        initial: Mat34,
    ) -> StereoCalibSet {
        let world = board();
        let image_left = world
            .iter()
            .map(|p| project_point(camera_left, truth, p).unwrap())
            .collect();
        let right_pose = compose(right_from_left, truth);
        let image_right = world
            .iter()
            .map(|p| project_point(camera_right, &right_pose, p).unwrap())
            .collect();
        StereoCalibSet {
            world_left: world.clone(),
            image_left,
            world_right: world,
            image_right,
            initial_pose: initial,
        }
    }

    #[test]
    fn test_calibrate_recovers_extrinsic() -> Result<(), Box<dyn std::error::Error>> {
        let camera_left = camera_matrix(100.0, 100.0, 160.0, 120.0);
        let camera_right = camera_matrix(98.0, 98.0, 158.0, 122.0);
        let truth_extrinsic = pose_from(&[0.0, -0.03, 0.01], &[-0.5, 0.02, 0.01]);

        let truths = [
            pose_from(&[0.1, 0.0, 0.0], &[0.0, 0.0, 10.0]),
            pose_from(&[-0.1, 0.2, 0.0], &[1.0, -0.5, 12.0]),
            pose_from(&[0.0, -0.15, 0.25], &[-0.8, 0.3, 9.0]),
        ];
        let initials = [
            pose_from(&[0.08, 0.01, 0.0], &[0.1, 0.0, 9.5]),
            pose_from(&[-0.12, 0.18, 0.02], &[0.9, -0.4, 12.5]),
            pose_from(&[0.02, -0.13, 0.22], &[-0.7, 0.25, 9.3]),
        ];
        let sets = truths
            .iter()
            .zip(initials.iter())
            .map(|(truth, initial)| {
                make_set(
                    &camera_left,
                    &camera_right,
                    &truth_extrinsic,
                    truth,
                    *initial,
                )
            })
            .collect::<Vec<_>>();

        let initial_extrinsic = pose_from(&[0.0, -0.01, 0.0], &[-0.45, 0.0, 0.0]);
        let result = calibrate_stereo(
            &camera_left,
            &camera_right,
            &initial_extrinsic,
            &sets,
            &StereoCalibParams::default(),
        )?;

        assert!(result.iterations < CALIB_MAX_LOOP_DEFAULT);
        assert!(is_rotation_orthonormal(&result.right_from_left, 1e-6));
        for i in 0..3 {
            for j in 0..4 {
                assert_relative_eq!(
                    result.right_from_left[i][j],
                    truth_extrinsic[i][j],
                    epsilon = 1e-4
                );
            }
        }
        for (pose, truth) in result.poses.iter().zip(truths.iter()) {
            for i in 0..3 {
                for j in 0..4 {
                    assert_relative_eq!(pose[i][j], truth[i][j], epsilon = 1e-4);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_calibrate_rejects_empty_input() {
        let camera = camera_matrix(100.0, 100.0, 0.0, 0.0);
        let result = calibrate_stereo(
            &camera,
            &camera,
            &crate::geometry::MAT34_IDENTITY,
            &[],
            &StereoCalibParams::default(),
        );
        assert_eq!(result.unwrap_err(), IcpError::NoCalibrationData);
    }

    #[test]
    fn test_calibrate_checks_each_set() {
        let camera = camera_matrix(100.0, 100.0, 0.0, 0.0);
        let set = StereoCalibSet {
            world_left: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            image_left: vec![[0.0, 0.0], [0.1, 0.0]],
            world_right: vec![],
            image_right: vec![],
            initial_pose: crate::geometry::MAT34_IDENTITY,
        };
        let result = calibrate_stereo(
            &camera,
            &camera,
            &crate::geometry::MAT34_IDENTITY,
            &[set],
            &StereoCalibParams::default(),
        );
        assert_eq!(
            result.unwrap_err(),
            IcpError::InsufficientCorrespondences {
                required: 3,
                actual: 2
            }
        );
    }
}
