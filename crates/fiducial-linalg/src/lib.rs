#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod error;
pub use error::LinalgError;

/// Dense row-major matrix type and primitive operations.
pub mod matrix;
pub use matrix::Matrix;

/// Symmetric eigen-decomposition and principal component analysis.
pub mod pca;
pub use pca::{pca, tridiagonal_eigen, tridiagonalize, Pca};
