#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod error;
pub use error::IcpError;

/// Rigid-transform and projection helpers shared by the solvers.
pub mod geometry;
pub use geometry::Mat34;

/// Monocular pose refinement.
pub mod mono;
pub use mono::{IcpHandle, IcpResult, StopReason};

/// Stereo pose refinement.
pub mod stereo;
pub use stereo::IcpStereoHandle;

/// Batch stereo extrinsic calibration.
pub mod calib;
pub use calib::{calibrate_stereo, StereoCalibParams, StereoCalibResult, StereoCalibSet};

mod ops;
