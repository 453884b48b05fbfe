use fiducial_linalg::{pca, Matrix};

use crate::TrackError;

/// Cross-term magnitude under which two fitted edge lines count as
/// parallel.
pub const NEARLY_PARALLEL_EPSILON: f64 = 0.0001;

/// Fraction of each contour segment trimmed from both ends before
/// fitting, to keep corner pixels out of the edge estimate.
const EDGE_TRIM_RATIO: f64 = 0.05;

/// Implicit 2D line `a*x + b*y + c = 0` with unit normal `(a, b)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    /// x coefficient of the unit normal.
    pub a: f64,
    /// y coefficient of the unit normal.
    pub b: f64,
    /// Offset term.
    pub c: f64,
}

impl Line {
    /// Signed distance from a point to the line.
    pub fn distance(&self, x: f64, y: f64) -> f64 {
        self.a * x + self.b * y + self.c
    }
}

/// Fit a sub-pixel line through one marker edge segment.
///
/// The segment is `contour[start..=end]` in integer pixel coordinates. A
/// symmetric margin proportional to the segment length is trimmed from
/// both ends, the surviving pixels are mapped to ideal coordinates
/// through `undistort`, and a line is fitted by principal component
/// analysis: the minor eigenvector of the sample covariance is the edge
/// normal.
///
/// `undistort` is the observed-to-ideal mapping of the camera's
/// distortion model; return `None` to signal an unmappable pixel.
///
/// PRECONDITION: `start <= end < contour.len()`.
///
/// # Errors
///
/// [`TrackError::TooFewContourPoints`] when fewer than 2 samples survive
/// the trim, [`TrackError::UndistortFailed`] when the mapping fails.
pub fn fit_edge_line<F>(
    contour: &[[i32; 2]],
    start: usize,
    end: usize,
    undistort: F,
) -> Result<Line, TrackError>
where
    F: Fn(f64, f64) -> Option<(f64, f64)>,
{
    let span = end - start + 1;
    let margin = (span as f64 * EDGE_TRIM_RATIO + 0.5) as usize;
    let st = start + margin;
    let ed = end.saturating_sub(margin);
    let surviving = if ed >= st { ed - st + 1 } else { 0 };
    if surviving < 2 {
        return Err(TrackError::TooFewContourPoints {
            required: 2,
            actual: surviving,
        });
    }

    let mut samples = Matrix::zeros(surviving, 2)?;
    for (row, pixel) in contour[st..=ed].iter().enumerate() {
        let (ox, oy) = (pixel[0] as f64, pixel[1] as f64);
        let (ix, iy) = undistort(ox, oy).ok_or(TrackError::UndistortFailed { x: ox, y: oy })?;
        samples[(row, 0)] = ix;
        samples[(row, 1)] = iy;
    }

    let fit = pca(&samples)?;
    let a = fit.eigenvectors[(1, 0)];
    let b = fit.eigenvectors[(1, 1)];
    let c = -(a * fit.mean[0] + b * fit.mean[1]);
    Ok(Line { a, b, c })
}

/// Intersect two edge lines.
///
/// # Errors
///
/// [`TrackError::NearlyParallelLines`] when the cross term of the two
/// normals falls below [`NEARLY_PARALLEL_EPSILON`].
pub fn intersect(l1: &Line, l2: &Line) -> Result<[f64; 2], TrackError> {
    let d = l1.a * l2.b - l2.a * l1.b;
    if d.abs() < NEARLY_PARALLEL_EPSILON {
        return Err(TrackError::NearlyParallelLines);
    }
    Ok([
        (l1.b * l2.c - l2.b * l1.c) / d,
        (l2.a * l1.c - l1.a * l2.c) / d,
    ])
}

/// Fit all four edge lines of a marker contour and intersect adjacent
/// pairs into sub-pixel corners.
///
/// `vertex` holds five ascending indices into `contour`: the four
/// detected corner positions plus the closing index, so side `i` runs
/// from `vertex[i]` to `vertex[i + 1]`. Corner `i` is the intersection
/// of side `i - 1` (wrapping) with side `i`.
///
/// PRECONDITION: the vertex indices are ascending and within the
/// contour.
pub fn marker_corners<F>(
    contour: &[[i32; 2]],
    vertex: &[usize; 5],
    undistort: F,
) -> Result<([Line; 4], [[f64; 2]; 4]), TrackError>
where
    F: Fn(f64, f64) -> Option<(f64, f64)>,
{
    let mut lines = [Line {
        a: 0.0,
        b: 0.0,
        c: 0.0,
    }; 4];
    for (i, line) in lines.iter_mut().enumerate() {
        *line = fit_edge_line(contour, vertex[i], vertex[i + 1], &undistort)?;
    }

    let mut corners = [[0.0; 2]; 4];
    for (i, corner) in corners.iter_mut().enumerate() {
        *corner = intersect(&lines[(i + 3) % 4], &lines[i])?;
    }
    Ok((lines, corners))
}
