#![doc = env!("CARGO_PKG_DESCRIPTION")]

#[doc(inline)]
pub use fiducial_linalg as linalg;

#[doc(inline)]
pub use fiducial_icp as icp;

#[doc(inline)]
pub use fiducial_track as track;
