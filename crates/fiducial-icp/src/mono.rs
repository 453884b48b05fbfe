use fiducial_linalg::Matrix;

use crate::geometry::{
    compose, delta_transform, matmul33, rotation_block, transform_point, Mat34,
};
use crate::ops::{accumulate, point_jacobian, project_h, solve_normal_equations, take_delta6};
use crate::IcpError;

/// Default iteration budget.
pub const MAX_LOOP_DEFAULT: usize = 10;
/// Default primary error threshold (mean squared ideal-coordinate
/// distance) under which refinement stops as converged.
pub const BREAK_LOOP_ERROR_THRESH_DEFAULT: f64 = 0.1;
/// Default secondary error threshold gating the plateau rule.
pub const BREAK_LOOP_ERROR_THRESH2_DEFAULT: f64 = 4.0;
/// Default error-ratio threshold above which successive errors count as a
/// plateau.
pub const BREAK_LOOP_ERROR_RATIO_THRESH_DEFAULT: f64 = 0.99;
/// Default probability that a correspondence is an inlier, used by the
/// robust variants.
pub const INLIER_PROBABILITY_DEFAULT: f64 = 0.5;

/// Scale applied to the inlier-quantile residual to form the robust
/// rejection threshold.
const K2_FACTOR: f64 = 4.0;
/// Lower clamp on the robust rejection threshold, in squared ideal
/// coordinates.
const K2_MIN: f64 = 16.0;

/// Why the refinement loop stopped.
///
/// The three exits are evaluated in a fixed order (absolute threshold,
/// then plateau, then budget); the reported reason is whichever fired
/// first. Exhausting the budget is the normal path for a slowly
/// converging set, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The mean squared error fell below the primary threshold.
    ErrorBelowThreshold,
    /// The error stopped decreasing meaningfully while under the
    /// secondary threshold.
    Plateau,
    /// The iteration budget was exhausted; the best pose so far is
    /// returned.
    MaxIterations,
}

/// Result of a pose refinement.
#[derive(Debug, Clone)]
pub struct IcpResult {
    /// Refined pose, world to camera.
    pub pose: Mat34,
    /// Final mean squared residual in ideal image coordinates.
    pub err: f64,
    /// Number of Gauss-Newton updates applied.
    pub iterations: usize,
    /// Which termination rule fired.
    pub stop: StopReason,
}

/// Configuration handle for monocular pose refinement.
///
/// Owns the camera projection matrix and the loop thresholds; reused
/// across frames. Not internally synchronized: share between threads only
/// behind external locking, or give each thread its own handle.
#[derive(Debug, Clone)]
pub struct IcpHandle {
    camera: Mat34,
    max_loop: usize,
    break_loop_error_thresh: f64,
    break_loop_error_thresh2: f64,
    break_loop_error_ratio_thresh: f64,
    inlier_probability: f64,
}

impl IcpHandle {
    /// Create a handle for the given camera projection matrix with
    /// default loop configuration.
    pub fn new(camera: Mat34) -> Self {
        Self {
            camera,
            max_loop: MAX_LOOP_DEFAULT,
            break_loop_error_thresh: BREAK_LOOP_ERROR_THRESH_DEFAULT,
            break_loop_error_thresh2: BREAK_LOOP_ERROR_THRESH2_DEFAULT,
            break_loop_error_ratio_thresh: BREAK_LOOP_ERROR_RATIO_THRESH_DEFAULT,
            inlier_probability: INLIER_PROBABILITY_DEFAULT,
        }
    }

    /// The camera projection matrix.
    pub fn camera(&self) -> &Mat34 {
        &self.camera
    }

    /// Replace the camera projection matrix (re-calibration).
    pub fn set_camera(&mut self, camera: Mat34) {
        self.camera = camera;
    }

    /// Iteration budget.
    pub fn max_loop(&self) -> usize {
        self.max_loop
    }

    /// Set the iteration budget.
    pub fn set_max_loop(&mut self, max_loop: usize) {
        self.max_loop = max_loop;
    }

    /// Primary error threshold.
    pub fn break_loop_error_thresh(&self) -> f64 {
        self.break_loop_error_thresh
    }

    /// Set the primary error threshold.
    pub fn set_break_loop_error_thresh(&mut self, thresh: f64) {
        self.break_loop_error_thresh = thresh;
    }

    /// Secondary error threshold gating the plateau rule.
    pub fn break_loop_error_thresh2(&self) -> f64 {
        self.break_loop_error_thresh2
    }

    /// Set the secondary error threshold.
    pub fn set_break_loop_error_thresh2(&mut self, thresh: f64) {
        self.break_loop_error_thresh2 = thresh;
    }

    /// Error-ratio threshold of the plateau rule.
    pub fn break_loop_error_ratio_thresh(&self) -> f64 {
        self.break_loop_error_ratio_thresh
    }

    /// Set the error-ratio threshold.
    pub fn set_break_loop_error_ratio_thresh(&mut self, thresh: f64) {
        self.break_loop_error_ratio_thresh = thresh;
    }

    /// Assumed inlier probability for the robust variant.
    pub fn inlier_probability(&self) -> f64 {
        self.inlier_probability
    }

    /// Set the assumed inlier probability.
    pub fn set_inlier_probability(&mut self, prob: f64) {
        self.inlier_probability = prob;
    }

    /// Refine a pose from 2D-3D correspondences by Gauss-Newton
    /// iteration.
    ///
    /// `world` and `image` are parallel slices; `image` holds ideal
    /// (distortion corrected) coordinates. The initial guess is refined
    /// until one of the three termination rules fires; see
    /// [`StopReason`].
    ///
    /// # Errors
    ///
    /// [`IcpError::MismatchedArrayLengths`] and
    /// [`IcpError::InsufficientCorrespondences`] (fewer than 3 points)
    /// are contract violations. [`IcpError::DegenerateProjection`] and a
    /// singular normal-equations system are numerical failures; skip the
    /// marker for this frame and retry on fresh correspondences.
    pub fn refine(
        &self,
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        initial: &Mat34,
    ) -> Result<IcpResult, IcpError> {
        check_correspondences(world, image)?;

        let n = world.len();
        let mut pose = *initial;
        let mut prev_err = 0.0;
        let mut updates = 0;
        let mut err;

        let stop = loop {
            let mut residuals = Vec::with_capacity(n);
            err = 0.0;
            for (pw, pi) in world.iter().zip(image.iter()) {
                let pc = transform_point(&pose, pw);
                let proj = project_h(&self.camera, &pc)?;
                let du = pi[0] - proj.u;
                let dv = pi[1] - proj.v;
                err += du * du + dv * dv;
                residuals.push((proj, du, dv));
            }
            err /= n as f64;

            if err < self.break_loop_error_thresh {
                break StopReason::ErrorBelowThreshold;
            }
            if updates > 0
                && err < self.break_loop_error_thresh2
                && err / prev_err > self.break_loop_error_ratio_thresh
            {
                break StopReason::Plateau;
            }
            if updates == self.max_loop {
                break StopReason::MaxIterations;
            }
            prev_err = err;

            let b = matmul33(&rotation_block(&self.camera), &rotation_block(&pose));
            let mut jtj = Matrix::zeros(6, 6)?;
            let mut jtr = Matrix::zeros(6, 1)?;
            for (pw, (proj, du, dv)) in world.iter().zip(residuals.iter()) {
                let jac = point_jacobian(&b, pw, proj);
                accumulate(&mut jtj, &mut jtr, &jac[0], *du, 1.0);
                accumulate(&mut jtj, &mut jtr, &jac[1], *dv, 1.0);
            }
            let delta = solve_normal_equations(&jtj, &jtr)?;
            pose = compose(&pose, &delta_transform(&take_delta6(&delta)));
            updates += 1;
            log::debug!("refine update {}: err {}", updates, err);
        };

        Ok(IcpResult {
            pose,
            err,
            iterations: updates,
            stop,
        })
    }

    /// Robust pose refinement that down-weights and rejects outlier
    /// correspondences.
    ///
    /// Each iteration sorts the per-point squared residuals, takes the
    /// value at the configured inlier quantile, scales it into a
    /// rejection threshold, and re-solves the weighted system with
    /// points above the threshold excluded and the rest weighted by a
    /// redescending kernel.
    ///
    /// # Errors
    ///
    /// In addition to the errors of [`IcpHandle::refine`], fails with
    /// [`IcpError::InsufficientCorrespondences`] when fewer than 3
    /// inliers survive the rejection threshold.
    pub fn refine_robust(
        &self,
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        initial: &Mat34,
    ) -> Result<IcpResult, IcpError> {
        check_correspondences(world, image)?;

        let n = world.len();
        let mut pose = *initial;
        let mut prev_err = 0.0;
        let mut updates = 0;
        let mut err;

        let stop = loop {
            let mut residuals = Vec::with_capacity(n);
            for (pw, pi) in world.iter().zip(image.iter()) {
                let pc = transform_point(&pose, pw);
                let proj = project_h(&self.camera, &pc)?;
                let du = pi[0] - proj.u;
                let dv = pi[1] - proj.v;
                residuals.push((proj, du, dv, du * du + dv * dv));
            }

            let k2 = rejection_threshold(
                residuals.iter().map(|r| r.3),
                n,
                self.inlier_probability,
            );
            let mut weight_sum = 0.0;
            let mut inliers = 0;
            let mut weights = Vec::with_capacity(n);
            err = 0.0;
            for r in &residuals {
                let w = redescending_weight(r.3, k2);
                if w > 0.0 {
                    inliers += 1;
                }
                err += w * r.3;
                weight_sum += w;
                weights.push(w);
            }
            if inliers < 3 {
                return Err(IcpError::InsufficientCorrespondences {
                    required: 3,
                    actual: inliers,
                });
            }
            err /= weight_sum;

            if err < self.break_loop_error_thresh {
                break StopReason::ErrorBelowThreshold;
            }
            if updates > 0
                && err < self.break_loop_error_thresh2
                && err / prev_err > self.break_loop_error_ratio_thresh
            {
                break StopReason::Plateau;
            }
            if updates == self.max_loop {
                break StopReason::MaxIterations;
            }
            prev_err = err;

            let b = matmul33(&rotation_block(&self.camera), &rotation_block(&pose));
            let mut jtj = Matrix::zeros(6, 6)?;
            let mut jtr = Matrix::zeros(6, 1)?;
            for ((pw, (proj, du, dv, _)), w) in
                world.iter().zip(residuals.iter()).zip(weights.iter())
            {
                if *w == 0.0 {
                    continue;
                }
                let jac = point_jacobian(&b, pw, proj);
                accumulate(&mut jtj, &mut jtr, &jac[0], *du, *w);
                accumulate(&mut jtj, &mut jtr, &jac[1], *dv, *w);
            }
            let delta = solve_normal_equations(&jtj, &jtr)?;
            pose = compose(&pose, &delta_transform(&take_delta6(&delta)));
            updates += 1;
            log::debug!("robust refine update {}: err {} inliers {}", updates, err, inliers);
        };

        Ok(IcpResult {
            pose,
            err,
            iterations: updates,
            stop,
        })
    }
}

/// Contract checks shared by the refinement entry points.
pub(crate) fn check_correspondences(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
) -> Result<(), IcpError> {
    if world.len() != image.len() {
        return Err(IcpError::MismatchedArrayLengths {
            left_name: "world points",
            left_len: world.len(),
            right_name: "image points",
            right_len: image.len(),
        });
    }
    if world.len() < 3 {
        return Err(IcpError::InsufficientCorrespondences {
            required: 3,
            actual: world.len(),
        });
    }
    Ok(())
}

/// Robust rejection threshold: the squared residual at the inlier
/// quantile, scaled and clamped from below.
pub(crate) fn rejection_threshold(
    squared_residuals: impl Iterator<Item = f64>,
    n: usize,
    inlier_probability: f64,
) -> f64 {
    let mut sorted = squared_residuals.collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((n as f64 * inlier_probability) as usize).min(n - 1);
    (sorted[idx] * K2_FACTOR).max(K2_MIN)
}

/// Redescending weight: zero beyond the threshold, `(1 - e2/k2)^2`
/// within it.
pub(crate) fn redescending_weight(e2: f64, k2: f64) -> f64 {
    if e2 > k2 {
        0.0
    } else {
        let t = 1.0 - e2 / k2;
        t * t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{is_rotation_orthonormal, project_point, rotation_vector_to_matrix};
    use approx::assert_relative_eq;

    /// Pinhole projection matrix from intrinsics.
    fn camera_matrix(fx: f64, fy: f64, cx: f64, cy: f64) -> Mat34 {
        [
            [fx, 0.0, cx, 0.0],
            [0.0, fy, cy, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ]
    }

    /// Identity-intrinsics camera: ideal coordinates are x/z, y/z.
    fn identity_camera() -> Mat34 {
        camera_matrix(1.0, 1.0, 0.0, 0.0)
    }

    fn pose_from(w: &[f64; 3], t: &[f64; 3]) -> Mat34 {
        let r = rotation_vector_to_matrix(w);
        [
            [r[0][0], r[0][1], r[0][2], t[0]],
            [r[1][0], r[1][1], r[1][2], t[1]],
            [r[2][0], r[2][1], r[2][2], t[2]],
        ]
    }

    fn square_marker() -> Vec<[f64; 3]> {
        vec![
            [-1.0, -1.0, 0.0],
            [1.0, -1.0, 0.0],
            [1.0, 1.0, 0.0],
            [-1.0, 1.0, 0.0],
        ]
    }

    fn observe(camera: &Mat34, pose: &Mat34, world: &[[f64; 3]]) -> Vec<[f64; 2]> {
        world
            .iter()
            .map(|p| project_point(camera, pose, p).unwrap())
            .collect()
    }

    #[test]
    fn test_refine_square_marker_converges() -> Result<(), Box<dyn std::error::Error>> {
        let camera = identity_camera();
        let truth = pose_from(&[0.0, 0.0, 0.0], &[0.0, 0.0, 10.0]);
        let world = square_marker();
        let image = observe(&camera, &truth, &world);

        let mut handle = IcpHandle::new(camera);
        handle.set_break_loop_error_thresh(1e-10);
        handle.set_break_loop_error_thresh2(0.0);

        let initial = pose_from(&[0.0, 0.0, 0.0], &[0.0, 0.0, 8.0]);
        let result = handle.refine(&world, &image, &initial)?;

        assert!(result.iterations <= 10);
        for i in 0..3 {
            for j in 0..4 {
                assert_relative_eq!(result.pose[i][j], truth[i][j], epsilon = 1e-4);
            }
        }
        assert!(result.err < 1e-10);
        Ok(())
    }

    #[test]
    fn test_refine_is_idempotent_at_convergence() -> Result<(), Box<dyn std::error::Error>> {
        let camera = camera_matrix(100.0, 100.0, 160.0, 120.0);
        let truth = pose_from(&[0.1, -0.2, 0.05], &[0.5, -0.3, 12.0]);
        let world = square_marker();
        let image = observe(&camera, &truth, &world);

        let mut handle = IcpHandle::new(camera);
        handle.set_break_loop_error_thresh(1e-10);
        handle.set_break_loop_error_thresh2(0.0);

        let initial = pose_from(&[0.08, -0.22, 0.0], &[0.4, -0.2, 11.0]);
        let first = handle.refine(&world, &image, &initial)?;
        assert_eq!(first.stop, StopReason::ErrorBelowThreshold);

        let second = handle.refine(&world, &image, &first.pose)?;
        assert!(second.iterations <= 1);
        assert!((second.err - first.err).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_refine_rejects_two_correspondences() {
        let handle = IcpHandle::new(identity_camera());
        let world = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        let image = [[0.0, 0.0], [0.1, 0.0]];
        let result = handle.refine(&world, &image, &crate::geometry::MAT34_IDENTITY);
        assert_eq!(
            result.unwrap_err(),
            IcpError::InsufficientCorrespondences {
                required: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_refine_rejects_mismatched_lengths() {
        let handle = IcpHandle::new(identity_camera());
        let world = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let image = [[0.0, 0.0], [0.1, 0.0]];
        assert!(matches!(
            handle.refine(&world, &image, &crate::geometry::MAT34_IDENTITY),
            Err(IcpError::MismatchedArrayLengths { .. })
        ));
    }

    #[test]
    fn test_refined_rotation_stays_orthonormal() -> Result<(), Box<dyn std::error::Error>> {
        let camera = camera_matrix(100.0, 100.0, 0.0, 0.0);
        let truth = pose_from(&[0.3, 0.2, -0.4], &[1.0, -0.5, 15.0]);
        let world = square_marker();
        let image = observe(&camera, &truth, &world);

        let mut handle = IcpHandle::new(camera);
        handle.set_break_loop_error_thresh(1e-10);
        handle.set_break_loop_error_thresh2(0.0);

        let initial = pose_from(&[0.25, 0.15, -0.35], &[0.8, -0.4, 14.0]);
        let result = handle.refine(&world, &image, &initial)?;
        assert!(is_rotation_orthonormal(&result.pose, 1e-6));
        Ok(())
    }

    #[test]
    fn test_plateau_termination_before_budget() -> Result<(), Box<dyn std::error::Error>> {
        let camera = camera_matrix(100.0, 100.0, 0.0, 0.0);
        let truth = pose_from(&[0.05, -0.1, 0.02], &[0.2, 0.1, 10.0]);
        let world = vec![
            [-1.0, -1.0, 0.0],
            [1.0, -1.0, 0.0],
            [1.0, 1.0, 0.0],
            [-1.0, 1.0, 0.0],
            [-0.5, -0.5, 0.0],
            [0.5, -0.5, 0.0],
            [0.5, 0.5, 0.0],
            [-0.5, 0.5, 0.0],
        ];
        // deterministic noise the pose parameters cannot absorb, so the
        // error settles on a floor between the two thresholds
        let noise = [
            [0.7, -0.7],
            [-0.7, 0.7],
            [0.7, 0.7],
            [-0.7, -0.7],
            [-0.7, 0.7],
            [0.7, -0.7],
            [-0.7, -0.7],
            [0.7, 0.7],
        ];
        let image = observe(&camera, &truth, &world)
            .iter()
            .zip(noise.iter())
            .map(|(uv, n)| [uv[0] + n[0], uv[1] + n[1]])
            .collect::<Vec<_>>();

        let handle = IcpHandle::new(camera);
        let initial = pose_from(&[0.0, 0.0, 0.0], &[0.0, 0.0, 9.0]);
        let result = handle.refine(&world, &image, &initial)?;

        assert_eq!(result.stop, StopReason::Plateau);
        assert!(result.iterations < handle.max_loop());
        assert!(result.err > handle.break_loop_error_thresh());
        assert!(result.err < handle.break_loop_error_thresh2());
        Ok(())
    }

    #[test]
    fn test_refine_robust_ignores_outliers() -> Result<(), Box<dyn std::error::Error>> {
        let camera = camera_matrix(100.0, 100.0, 160.0, 120.0);
        let truth = pose_from(&[0.1, 0.05, -0.1], &[0.3, -0.2, 12.0]);
        let world = vec![
            [-1.0, -1.0, 0.0],
            [1.0, -1.0, 0.0],
            [1.0, 1.0, 0.0],
            [-1.0, 1.0, 0.0],
            [-0.6, 0.2, 0.0],
            [0.6, -0.2, 0.0],
            [0.2, 0.6, 0.0],
            [-0.2, -0.6, 0.0],
        ];
        let mut image = observe(&camera, &truth, &world);
        // two gross outliers
        image[2][0] += 35.0;
        image[5][1] -= 40.0;

        let mut handle = IcpHandle::new(camera);
        handle.set_break_loop_error_thresh(1e-8);
        handle.set_break_loop_error_thresh2(0.0);
        handle.set_max_loop(20);
        handle.set_inlier_probability(0.7);

        let initial = pose_from(&[0.05, 0.0, -0.05], &[0.2, -0.1, 11.0]);
        let result = handle.refine_robust(&world, &image, &initial)?;

        for i in 0..3 {
            for j in 0..4 {
                assert_relative_eq!(result.pose[i][j], truth[i][j], epsilon = 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn test_budget_exhaustion_is_not_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let camera = camera_matrix(100.0, 100.0, 0.0, 0.0);
        let truth = pose_from(&[0.0, 0.0, 0.0], &[0.0, 0.0, 10.0]);
        let world = square_marker();
        let image = observe(&camera, &truth, &world);

        let mut handle = IcpHandle::new(camera);
        handle.set_max_loop(0);
        handle.set_break_loop_error_thresh(0.0);
        handle.set_break_loop_error_thresh2(0.0);

        let initial = pose_from(&[0.0, 0.0, 0.0], &[0.0, 0.0, 9.0]);
        let result = handle.refine(&world, &image, &initial)?;
        assert_eq!(result.stop, StopReason::MaxIterations);
        assert_eq!(result.iterations, 0);
        Ok(())
    }
}
