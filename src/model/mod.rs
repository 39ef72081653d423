//! BResNet model module
//!
//! Layer capability, primitive layers, the bottleneck residual block and the
//! assembled network.

mod blocks;
mod config;
mod layer;
mod layers;
mod resnet;

pub use blocks::{BottleneckLayers, BottleneckResidual1D, Shortcut};
pub use config::BResNetConfig;
pub use layer::{Layer, LayerConfig, Sequential, Shape};
pub use layers::{
    BatchNorm1d, BatchNormParams, Conv1d, Conv1dParams, Linear, Padding, Pool1d, PoolMode, ReLU,
};
pub use resnet::{global_average_pool, softmax, BResNet1D};
