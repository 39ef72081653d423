//! # BResNet-1D
//!
//! Bottleneck residual network (ResNet-D family) for 1D sequences, built on
//! `ndarray` with channels-last tensors `(batch, length, channels)`.
//!
//! ## Features
//!
//! - `Layer` trait with lazy, shape-driven build
//! - Conv1d, batch normalization, ReLU and pooling layers
//! - `BottleneckResidual1D` block with identity or projected skip connection
//! - `BResNet1D` network assembly with Keras-style summaries
//! - TOML model configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use bresnet1d::{BResNet1D, BResNetConfig, Shape};
//!
//! fn main() -> anyhow::Result<()> {
//!     bresnet1d::utils::init_logging("info");
//!
//!     let mut model = BResNet1D::new(BResNetConfig::bresnet161())?;
//!     model.build(Shape::new(None, 128, 32))?;
//!     println!("{}", model.summary()?);
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod model;
pub mod utils;

pub use error::{LayerError, Result};
pub use model::{BResNet1D, BResNetConfig, BottleneckResidual1D, Layer, LayerConfig, Shape};
