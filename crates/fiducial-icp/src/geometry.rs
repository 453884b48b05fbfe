use crate::IcpError;

/// 3x4 rigid transform or camera projection matrix, row-major.
///
/// A pose maps marker/world coordinates into camera coordinates; a camera
/// projection maps homogeneous camera coordinates to ideal (distortion
/// corrected) image coordinates.
pub type Mat34 = [[f64; 4]; 3];

/// The identity rigid transform.
pub const MAT34_IDENTITY: Mat34 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Homogeneous depth below which a projection is degenerate (point at or
/// behind the camera plane).
const DEGENERATE_DEPTH: f64 = 1e-10;

/// Rotation angle below which the exponential switches to its series
/// expansion.
const SMALL_ANGLE: f64 = 1e-8;

/// Compose two rigid transforms: `a` applied after `b`.
pub fn compose(a: &Mat34, b: &Mat34) -> Mat34 {
    let mut out = [[0.0; 4]; 3];
    for i in 0..3 {
        for j in 0..4 {
            let mut acc = 0.0;
            for k in 0..3 {
                acc += a[i][k] * b[k][j];
            }
            out[i][j] = acc;
        }
        out[i][3] += a[i][3];
    }
    out
}

/// Apply a rigid transform to a 3D point.
pub fn transform_point(m: &Mat34, p: &[f64; 3]) -> [f64; 3] {
    [
        m[0][0] * p[0] + m[0][1] * p[1] + m[0][2] * p[2] + m[0][3],
        m[1][0] * p[0] + m[1][1] * p[1] + m[1][2] * p[2] + m[1][3],
        m[2][0] * p[0] + m[2][1] * p[1] + m[2][2] * p[2] + m[2][3],
    ]
}

/// The 3x3 rotation (or intrinsic) block of a 3x4 matrix.
pub fn rotation_block(m: &Mat34) -> [[f64; 3]; 3] {
    [
        [m[0][0], m[0][1], m[0][2]],
        [m[1][0], m[1][1], m[1][2]],
        [m[2][0], m[2][1], m[2][2]],
    ]
}

/// Multiply two 3x3 matrices.
pub(crate) fn matmul33(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    out
}

/// Rotation matrix from a rotation vector (axis scaled by angle).
///
/// Rodrigues' formula, with the `sin(t)/t` and `(1-cos(t))/t^2`
/// coefficients replaced by their series expansions near zero so the
/// identity falls out of a zero vector.
pub fn rotation_vector_to_matrix(w: &[f64; 3]) -> [[f64; 3]; 3] {
    let theta2 = w[0] * w[0] + w[1] * w[1] + w[2] * w[2];
    let theta = theta2.sqrt();

    let (k1, k2) = if theta < SMALL_ANGLE {
        (1.0 - theta2 / 6.0, 0.5 - theta2 / 24.0)
    } else {
        (theta.sin() / theta, (1.0 - theta.cos()) / theta2)
    };

    let (wx, wy, wz) = (w[0], w[1], w[2]);
    [
        [
            1.0 - k2 * (wy * wy + wz * wz),
            -k1 * wz + k2 * wx * wy,
            k1 * wy + k2 * wx * wz,
        ],
        [
            k1 * wz + k2 * wx * wy,
            1.0 - k2 * (wx * wx + wz * wz),
            -k1 * wx + k2 * wy * wz,
        ],
        [
            -k1 * wy + k2 * wx * wz,
            k1 * wx + k2 * wy * wz,
            1.0 - k2 * (wx * wx + wy * wy),
        ],
    ]
}

/// Rigid transform from a 6-vector increment: rotation vector followed by
/// translation.
pub fn delta_transform(d: &[f64; 6]) -> Mat34 {
    let r = rotation_vector_to_matrix(&[d[0], d[1], d[2]]);
    [
        [r[0][0], r[0][1], r[0][2], d[3]],
        [r[1][0], r[1][1], r[1][2], d[4]],
        [r[2][0], r[2][1], r[2][2], d[5]],
    ]
}

/// Whether the rotation block is orthonormal with positive determinant,
/// within `tol`.
pub fn is_rotation_orthonormal(m: &Mat34, tol: f64) -> bool {
    let r = rotation_block(m);
    for i in 0..3 {
        for j in i..3 {
            let dot = r[0][i] * r[0][j] + r[1][i] * r[1][j] + r[2][i] * r[2][j];
            let expected = if i == j { 1.0 } else { 0.0 };
            if (dot - expected).abs() > tol {
                return false;
            }
        }
    }
    let det = r[0][0] * (r[1][1] * r[2][2] - r[1][2] * r[2][1])
        - r[0][1] * (r[1][0] * r[2][2] - r[1][2] * r[2][0])
        + r[0][2] * (r[1][0] * r[2][1] - r[1][1] * r[2][0]);
    (det - 1.0).abs() <= 3.0 * tol
}

/// Project a world point through `camera ∘ pose` to ideal image
/// coordinates.
///
/// Fails with [`IcpError::DegenerateProjection`] when the homogeneous
/// depth is not positive (point at or behind the camera plane, or at
/// infinity).
pub fn project_point(
    camera: &Mat34,
    pose: &Mat34,
    world: &[f64; 3],
) -> Result<[f64; 2], IcpError> {
    let pc = transform_point(pose, world);
    let h = [
        camera[0][0] * pc[0] + camera[0][1] * pc[1] + camera[0][2] * pc[2] + camera[0][3],
        camera[1][0] * pc[0] + camera[1][1] * pc[1] + camera[1][2] * pc[2] + camera[1][3],
        camera[2][0] * pc[0] + camera[2][1] * pc[1] + camera[2][2] * pc[2] + camera[2][3],
    ];
    if h[2] < DEGENERATE_DEPTH {
        return Err(IcpError::DegenerateProjection);
    }
    Ok([h[0] / h[2], h[1] / h[2]])
}

/// Convert a 3x4 pose to the column-major 4x4 layout consumed by
/// OpenGL-style rendering backends.
pub fn to_column_major_4x4(m: &Mat34) -> [f64; 16] {
    [
        m[0][0], m[1][0], m[2][0], 0.0, //
        m[0][1], m[1][1], m[2][1], 0.0, //
        m[0][2], m[1][2], m[2][2], 0.0, //
        m[0][3], m[1][3], m[2][3], 1.0,
    ]
}
