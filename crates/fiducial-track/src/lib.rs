#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod error;
pub use error::TrackError;

/// Temporal low-pass filtering of pose streams.
pub mod filter;
pub use filter::PoseFilter;

/// Sub-pixel marker edge lines and corner intersections.
pub mod line;
pub use line::{fit_edge_line, intersect, marker_corners, Line};
