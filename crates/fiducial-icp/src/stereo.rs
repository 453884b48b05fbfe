use fiducial_linalg::Matrix;

use crate::geometry::{
    compose, delta_transform, matmul33, rotation_block, transform_point, Mat34,
};
use crate::mono::{
    check_correspondences, redescending_weight, rejection_threshold, IcpResult, StopReason,
    BREAK_LOOP_ERROR_RATIO_THRESH_DEFAULT, BREAK_LOOP_ERROR_THRESH2_DEFAULT,
    BREAK_LOOP_ERROR_THRESH_DEFAULT, INLIER_PROBABILITY_DEFAULT, MAX_LOOP_DEFAULT,
};
use crate::ops::{accumulate, point_jacobian, project_h, solve_normal_equations, take_delta6};
use crate::IcpError;

/// Configuration handle for stereo pose refinement.
///
/// Owns both camera projection matrices and the rigid transform from
/// left-camera space to right-camera space. The extrinsic is a
/// calibrated constant: it changes only through [`set_right_from_left`]
/// (or a fresh handle), never during refinement.
///
/// [`set_right_from_left`]: IcpStereoHandle::set_right_from_left
#[derive(Debug, Clone)]
pub struct IcpStereoHandle {
    camera_left: Mat34,
    camera_right: Mat34,
    right_from_left: Mat34,
    max_loop: usize,
    break_loop_error_thresh: f64,
    break_loop_error_thresh2: f64,
    break_loop_error_ratio_thresh: f64,
    inlier_probability: f64,
}

impl IcpStereoHandle {
    /// Create a handle from both camera projections and the left-to-right
    /// extrinsic transform, with default loop configuration.
    pub fn new(camera_left: Mat34, camera_right: Mat34, right_from_left: Mat34) -> Self {
        Self {
            camera_left,
            camera_right,
            right_from_left,
            max_loop: MAX_LOOP_DEFAULT,
            break_loop_error_thresh: BREAK_LOOP_ERROR_THRESH_DEFAULT,
            break_loop_error_thresh2: BREAK_LOOP_ERROR_THRESH2_DEFAULT,
            break_loop_error_ratio_thresh: BREAK_LOOP_ERROR_RATIO_THRESH_DEFAULT,
            inlier_probability: INLIER_PROBABILITY_DEFAULT,
        }
    }

    /// The left camera projection matrix.
    pub fn camera_left(&self) -> &Mat34 {
        &self.camera_left
    }

    /// Replace the left camera projection matrix.
    pub fn set_camera_left(&mut self, camera: Mat34) {
        self.camera_left = camera;
    }

    /// The right camera projection matrix.
    pub fn camera_right(&self) -> &Mat34 {
        &self.camera_right
    }

    /// Replace the right camera projection matrix.
    pub fn set_camera_right(&mut self, camera: Mat34) {
        self.camera_right = camera;
    }

    /// The rigid transform from left-camera to right-camera space.
    pub fn right_from_left(&self) -> &Mat34 {
        &self.right_from_left
    }

    /// Replace the stereo extrinsic transform (re-calibration).
    pub fn set_right_from_left(&mut self, right_from_left: Mat34) {
        self.right_from_left = right_from_left;
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

    /// Refine the pose relative to the left camera from correspondences
    /// in both views.
    ///
    /// Residuals from both views are accumulated into one six-parameter
    /// Gauss-Newton solve per iteration; the right view projects through
    /// `camera_right ∘ right_from_left ∘ pose`. Termination rules and
    /// result semantics match [`crate::IcpHandle::refine`].
    ///
    /// # Errors
    ///
    /// Fails distinctly when either view has fewer than 3
    /// correspondences or mismatched slice lengths, and on degenerate
    /// projections or a singular system as in the monocular core.
    pub fn refine(
        &self,
        world_left: &[[f64; 3]],
        image_left: &[[f64; 2]],
        world_right: &[[f64; 3]],
        image_right: &[[f64; 2]],
        initial: &Mat34,
    ) -> Result<IcpResult, IcpError> {
        check_correspondences(world_left, image_left)?;
        check_correspondences(world_right, image_right)?;
        self.run(
            world_left,
            image_left,
            world_right,
            image_right,
            initial,
            false,
        )
    }

    /// Robust stereo refinement.
    ///
    /// The rejection threshold is drawn from the combined residual set of
    /// both views, so a view dominated by outliers cannot hide behind the
    /// other; weighting follows [`crate::IcpHandle::refine_robust`].
    pub fn refine_robust(
        &self,
        world_left: &[[f64; 3]],
        image_left: &[[f64; 2]],
        world_right: &[[f64; 3]],
        image_right: &[[f64; 2]],
        initial: &Mat34,
    ) -> Result<IcpResult, IcpError> {
        check_correspondences(world_left, image_left)?;
        check_correspondences(world_right, image_right)?;
        self.run(
            world_left,
            image_left,
            world_right,
            image_right,
            initial,
            true,
        )
    }

    fn run(
        &self,
        world_left: &[[f64; 3]],
        image_left: &[[f64; 2]],
        world_right: &[[f64; 3]],
        image_right: &[[f64; 2]],
        initial: &Mat34,
        robust: bool,
    ) -> Result<IcpResult, IcpError> {
        let n = world_left.len() + world_right.len();
        let mut pose = *initial;
        let mut prev_err = 0.0;
        let mut updates = 0;
        let mut err;

        let stop = loop {
            // residual pass over both views
            let right_pose = compose(&self.right_from_left, &pose);
            let mut residuals = Vec::with_capacity(n);
            for (pw, pi) in world_left.iter().zip(image_left.iter()) {
                let pc = transform_point(&pose, pw);
                let proj = project_h(&self.camera_left, &pc)?;
                let du = pi[0] - proj.u;
                let dv = pi[1] - proj.v;
                residuals.push((proj, du, dv, du * du + dv * dv));
            }
            for (pw, pi) in world_right.iter().zip(image_right.iter()) {
                let pc = transform_point(&right_pose, pw);
                let proj = project_h(&self.camera_right, &pc)?;
                let du = pi[0] - proj.u;
                let dv = pi[1] - proj.v;
                residuals.push((proj, du, dv, du * du + dv * dv));
            }

            let weights = if robust {
                let k2 = rejection_threshold(
                    residuals.iter().map(|r| r.3),
                    n,
                    self.inlier_probability,
                );
                let w = residuals
                    .iter()
                    .map(|r| redescending_weight(r.3, k2))
                    .collect::<Vec<_>>();
                let inliers = w.iter().filter(|&&x| x > 0.0).count();
                if inliers < 3 {
                    return Err(IcpError::InsufficientCorrespondences {
                        required: 3,
                        actual: inliers,
                    });
                }
                w
            } else {
                vec![1.0; n]
            };

            let weight_sum = weights.iter().sum::<f64>();
            err = residuals
                .iter()
                .zip(weights.iter())
                .map(|(r, w)| w * r.3)
                .sum::<f64>()
                / weight_sum;

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

            // joint Gauss-Newton step
            let b_left = matmul33(&rotation_block(&self.camera_left), &rotation_block(&pose));
            let b_right = matmul33(
                &rotation_block(&self.camera_right),
                &rotation_block(&right_pose),
            );
            let mut jtj = Matrix::zeros(6, 6)?;
            let mut jtr = Matrix::zeros(6, 1)?;
            let mut res_iter = residuals.iter().zip(weights.iter());
            for (pw, (res, w)) in world_left.iter().zip(res_iter.by_ref()) {
                if *w == 0.0 {
                    continue;
                }
                let jac = point_jacobian(&b_left, pw, &res.0);
                accumulate(&mut jtj, &mut jtr, &jac[0], res.1, *w);
                accumulate(&mut jtj, &mut jtr, &jac[1], res.2, *w);
            }
            for (pw, (res, w)) in world_right.iter().zip(res_iter) {
                if *w == 0.0 {
                    continue;
                }
                let jac = point_jacobian(&b_right, pw, &res.0);
                accumulate(&mut jtj, &mut jtr, &jac[0], res.1, *w);
                accumulate(&mut jtj, &mut jtr, &jac[1], res.2, *w);
            }
            let delta = solve_normal_equations(&jtj, &jtr)?;
            pose = compose(&pose, &delta_transform(&take_delta6(&delta)));
            updates += 1;
            log::debug!("stereo refine update {}: err {}", updates, err);
        };

        Ok(IcpResult {
            pose,
            err,
            iterations: updates,
            stop,
        })
    }
}
