use glam::{DMat3, DQuat, DVec3};

use fiducial_icp::Mat34;

use crate::TrackError;

/// Quaternion dot product above which SLERP falls back to normalized
/// linear blending to avoid dividing by a vanishing `sin`.
const SLERP_LINEAR_THRESHOLD: f64 = 0.9995;

/// Tolerance on the rotation block's orthonormality when decomposing a
/// pose into a quaternion.
const ROTATION_TOL: f64 = 1e-2;

/// Single-pole low-pass filter over a stream of rigid transforms.
///
/// Internally keeps the previous filtered rotation as a unit quaternion
/// and the previous filtered position; each call blends the new
/// observation in with factor `alpha = dt / (dt + rc)` where
/// `dt = 1/sample_rate` and `rc = 1/cutoff_frequency`. Rotation blends by
/// spherical linear interpolation along the shorter arc, translation by
/// plain linear interpolation with the same factor.
#[derive(Debug, Clone)]
pub struct PoseFilter {
    q: DQuat,
    p: DVec3,
    sample_rate: f64,
    cutoff_frequency: f64,
    alpha: f64,
    initialized: bool,
}

impl PoseFilter {
    /// Create a filter for the given sample rate and cutoff frequency,
    /// both in Hz.
    pub fn new(sample_rate: f64, cutoff_frequency: f64) -> Result<Self, TrackError> {
        let alpha = derive_alpha(sample_rate, cutoff_frequency)?;
        Ok(Self {
            q: DQuat::IDENTITY,
            p: DVec3::ZERO,
            sample_rate,
            cutoff_frequency,
            alpha,
            initialized: false,
        })
    }

    /// The configured sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// The configured cutoff frequency in Hz.
    pub fn cutoff_frequency(&self) -> f64 {
        self.cutoff_frequency
    }

    /// The derived interpolation factor.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Re-tune the sample rate, re-deriving the interpolation factor.
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> Result<(), TrackError> {
        self.alpha = derive_alpha(sample_rate, self.cutoff_frequency)?;
        self.sample_rate = sample_rate;
        Ok(())
    }

    /// Re-tune the cutoff frequency, re-deriving the interpolation
    /// factor.
    pub fn set_cutoff_frequency(&mut self, cutoff_frequency: f64) -> Result<(), TrackError> {
        self.alpha = derive_alpha(self.sample_rate, cutoff_frequency)?;
        self.cutoff_frequency = cutoff_frequency;
        Ok(())
    }

    /// Filter one observed pose.
    ///
    /// With `reset` set (marker lost in the previous frame) or on the
    /// first call, the filter state adopts the observation directly so no
    /// smoothing happens across a tracking discontinuity. Otherwise the
    /// observation is blended into the state and the filtered pose is
    /// returned.
    ///
    /// # Errors
    ///
    /// [`TrackError::DegenerateRotation`] when the pose's rotation block
    /// is not orthonormal within tolerance.
    pub fn filter(&mut self, pose: &Mat34, reset: bool) -> Result<Mat34, TrackError> {
        let (q_obs, p_obs) = decompose(pose)?;

        if reset || !self.initialized {
            log::debug!("pose filter adopting observation unfiltered");
            self.q = q_obs;
            self.p = p_obs;
            self.initialized = true;
            return Ok(compose_pose(&self.q, &self.p));
        }

        // shortest arc: keep the observed quaternion in the state's
        // hemisphere
        let mut q_obs = q_obs;
        let mut dot = self.q.dot(q_obs);
        if dot < 0.0 {
            q_obs = -q_obs;
            dot = -dot;
        }

        let alpha = self.alpha;
        let q_f = if dot > SLERP_LINEAR_THRESHOLD {
            blend(&self.q, &q_obs, 1.0 - alpha, alpha)
        } else {
            let omega = dot.clamp(-1.0, 1.0).acos();
            let sin_omega = omega.sin();
            blend(
                &self.q,
                &q_obs,
                ((1.0 - alpha) * omega).sin() / sin_omega,
                (alpha * omega).sin() / sin_omega,
            )
        }
        .normalize();
        let p_f = self.p.lerp(p_obs, alpha);

        self.q = q_f;
        self.p = p_f;
        Ok(compose_pose(&q_f, &p_f))
    }
}

fn derive_alpha(sample_rate: f64, cutoff_frequency: f64) -> Result<f64, TrackError> {
    if sample_rate <= 0.0 || cutoff_frequency <= 0.0 {
        return Err(TrackError::InvalidFilterParams {
            sample_rate,
            cutoff_frequency,
        });
    }
    let dt = 1.0 / sample_rate;
    let rc = 1.0 / cutoff_frequency;
    Ok(dt / (dt + rc))
}

/// Split a pose into a unit quaternion and a position, validating that
/// the rotation block is orthonormal.
fn decompose(pose: &Mat34) -> Result<(DQuat, DVec3), TrackError> {
    let r = DMat3::from_cols(
        DVec3::new(pose[0][0], pose[1][0], pose[2][0]),
        DVec3::new(pose[0][1], pose[1][1], pose[2][1]),
        DVec3::new(pose[0][2], pose[1][2], pose[2][2]),
    );

    if (r.determinant() - 1.0).abs() > ROTATION_TOL {
        return Err(TrackError::DegenerateRotation);
    }
    let cols = [r.x_axis, r.y_axis, r.z_axis];
    for i in 0..3 {
        for j in i..3 {
            let expected = if i == j { 1.0 } else { 0.0 };
            if (cols[i].dot(cols[j]) - expected).abs() > ROTATION_TOL {
                return Err(TrackError::DegenerateRotation);
            }
        }
    }

    let q = DQuat::from_mat3(&r).normalize();
    let p = DVec3::new(pose[0][3], pose[1][3], pose[2][3]);
    Ok((q, p))
}

/// Rebuild a 3x4 pose from a unit quaternion and a position.
fn compose_pose(q: &DQuat, p: &DVec3) -> Mat34 {
    let r = DMat3::from_quat(*q);
    [
        [r.x_axis.x, r.y_axis.x, r.z_axis.x, p.x],
        [r.x_axis.y, r.y_axis.y, r.z_axis.y, p.y],
        [r.x_axis.z, r.y_axis.z, r.z_axis.z, p.z],
    ]
}

/// Weighted component-wise blend of two quaternions.
fn blend(a: &DQuat, b: &DQuat, wa: f64, wb: f64) -> DQuat {
    DQuat::from_xyzw(
        wa * a.x + wb * b.x,
        wa * a.y + wb * b.y,
        wa * a.z + wb * b.z,
        wa * a.w + wb * b.w,
    )
}
