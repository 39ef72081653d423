//! Primitive layers over channels-last tensors `(batch, length, channels)`

use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::layer::{check_input, check_rebuild, Layer, LayerConfig, Shape};
use crate::error::{LayerError, Result};

/// Padding mode for convolutions and pooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// No padding
    Valid,
    /// Pad so that the output length is `ceil(length / stride)`
    Same,
}

impl Padding {
    /// Output length, `None` if the input is shorter than the window
    pub fn output_length(&self, length: usize, window: usize, stride: usize) -> Option<usize> {
        match self {
            Padding::Same => Some((length + stride - 1) / stride),
            Padding::Valid if length >= window => Some((length - window) / stride + 1),
            Padding::Valid => None,
        }
    }

    /// Zero positions inserted before the first element
    ///
    /// Odd totals put the extra position on the right.
    pub fn left_pad(&self, length: usize, window: usize, stride: usize) -> usize {
        match self {
            Padding::Valid => 0,
            Padding::Same => {
                let out_len = (length + stride - 1) / stride;
                let total = ((out_len.max(1) - 1) * stride + window).saturating_sub(length);
                total / 2
            }
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Padding::Valid => "valid",
            Padding::Same => "same",
        }
    }
}

fn window_output_length(
    name: &str,
    padding: Padding,
    input_shape: Shape,
    window: usize,
    stride: usize,
) -> Result<usize> {
    padding
        .output_length(input_shape.length, window, stride)
        .ok_or_else(|| LayerError::InvalidShape {
            shape: input_shape.to_string(),
            reason: format!(
                "length {} is shorter than the window {} of '{}'",
                input_shape.length, window, name
            ),
        })
}

fn he_normal(fan_in: usize) -> Result<Normal<f32>> {
    // Kaiming/He initialization
    let std = (2.0 / fan_in as f32).sqrt();
    Normal::new(0.0, std).map_err(|e| LayerError::Initialization(e.to_string()))
}

/// Convolution weights, allocated at build time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv1dParams {
    /// Kernel tensor [kernel_size, in_channels, filters]
    pub kernel: Array3<f32>,
    /// Bias vector [filters]
    pub bias: Option<Array1<f32>>,
}

/// 1D convolutional layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv1d {
    /// Layer name
    pub name: String,
    /// Output channels
    pub filters: usize,
    /// Kernel size
    pub kernel_size: usize,
    /// Stride
    pub stride: usize,
    /// Padding mode
    pub padding: Padding,
    /// Whether a bias vector is added
    pub use_bias: bool,
    /// Weights, `None` until built
    pub params: Option<Conv1dParams>,
}

impl Conv1d {
    /// Create an unbuilt Conv1d layer
    pub fn new(
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        use_bias: bool,
    ) -> Result<Self> {
        if filters == 0 {
            return Err(LayerError::InvalidFilters(filters));
        }
        if kernel_size == 0 {
            return Err(LayerError::InvalidKernelSize(kernel_size));
        }
        if stride == 0 {
            return Err(LayerError::InvalidStrides {
                strides: vec![stride],
                arity: 1,
            });
        }

        Ok(Self {
            name: "conv1d".to_string(),
            filters,
            kernel_size,
            stride,
            padding,
            use_bias,
            params: None,
        })
    }

    /// Set the layer name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Input channels the layer was built for
    pub fn in_channels(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.kernel.dim().1)
    }
}

impl Layer for Conv1d {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "Conv1D"
    }

    fn is_built(&self) -> bool {
        self.params.is_some()
    }

    fn build(&mut self, input_shape: Shape) -> Result<()> {
        input_shape.validate()?;
        if let Some(in_channels) = self.in_channels() {
            return check_rebuild(&self.name, in_channels, input_shape);
        }
        self.compute_output_shape(input_shape)?;

        let in_channels = input_shape.channels;
        let normal = he_normal(in_channels * self.kernel_size)?;
        let mut rng = rand::thread_rng();

        let kernel = Array3::from_shape_fn((self.kernel_size, in_channels, self.filters), |_| {
            rng.sample(normal)
        });
        let bias = if self.use_bias {
            Some(Array1::zeros(self.filters))
        } else {
            None
        };

        debug!(layer = %self.name, input = %input_shape, filters = self.filters, "built conv1d");
        self.params = Some(Conv1dParams { kernel, bias });
        Ok(())
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| LayerError::NotBuilt(self.name.clone()))?;
        let in_channels = params.kernel.dim().1;
        check_input(&self.name, in_channels, input)?;

        let (batch_size, in_len, _) = input.dim();
        let out_len = window_output_length(
            &self.name,
            self.padding,
            Shape::of(input),
            self.kernel_size,
            self.stride,
        )?;
        let pad = self.padding.left_pad(in_len, self.kernel_size, self.stride) as isize;

        let mut output = Array3::zeros((batch_size, out_len, self.filters));

        for b in 0..batch_size {
            let x = input.index_axis(Axis(0), b);
            let mut out = Array2::<f32>::zeros((out_len, self.filters));

            // One matrix product per kernel tap over the shifted input rows
            for k in 0..self.kernel_size {
                let mut rows = Array2::<f32>::zeros((out_len, in_channels));
                for ol in 0..out_len {
                    let idx = (ol * self.stride + k) as isize - pad;
                    if idx >= 0 && (idx as usize) < in_len {
                        rows.row_mut(ol).assign(&x.row(idx as usize));
                    }
                }
                out += &rows.dot(&params.kernel.index_axis(Axis(0), k));
            }

            if let Some(ref bias) = params.bias {
                out += bias;
            }

            output.index_axis_mut(Axis(0), b).assign(&out);
        }

        Ok(output)
    }

    fn compute_output_shape(&self, input_shape: Shape) -> Result<Shape> {
        let length = window_output_length(
            &self.name,
            self.padding,
            input_shape,
            self.kernel_size,
            self.stride,
        )?;
        Ok(input_shape.with_length(length).with_channels(self.filters))
    }

    fn get_config(&self) -> LayerConfig {
        let mut config = LayerConfig::new();
        config.insert("name".to_string(), json!(self.name));
        config.insert("filters".to_string(), json!(self.filters));
        config.insert("kernel_size".to_string(), json!([self.kernel_size]));
        config.insert("strides".to_string(), json!([self.stride]));
        config.insert("padding".to_string(), json!(self.padding.as_str()));
        config.insert("use_bias".to_string(), json!(self.use_bias));
        config
    }

    fn num_params(&self) -> usize {
        self.params
            .as_ref()
            .map(|p| p.kernel.len() + p.bias.as_ref().map_or(0, |b| b.len()))
            .unwrap_or(0)
    }
}

/// Batch normalization state, allocated at build time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNormParams {
    /// Scale parameter
    pub gamma: Array1<f32>,
    /// Shift parameter
    pub beta: Array1<f32>,
    /// Moving mean
    pub moving_mean: Array1<f32>,
    /// Moving variance
    pub moving_variance: Array1<f32>,
}

/// Batch normalization over the channel axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm1d {
    /// Layer name
    pub name: String,
    /// Small constant for numerical stability
    pub epsilon: f32,
    /// Momentum for the moving statistics
    pub momentum: f32,
    /// Use batch statistics instead of the moving ones
    pub training: bool,
    /// State, `None` until built
    pub params: Option<BatchNormParams>,
}

impl Default for BatchNorm1d {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchNorm1d {
    /// Create an unbuilt BatchNorm1d layer in inference mode
    pub fn new() -> Self {
        Self {
            name: "batch_normalization".to_string(),
            epsilon: 1e-3,
            momentum: 0.99,
            training: false,
            params: None,
        }
    }

    /// Set the layer name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of normalized channels
    pub fn num_features(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.gamma.len())
    }
}

impl Layer for BatchNorm1d {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "BatchNormalization"
    }

    fn is_built(&self) -> bool {
        self.params.is_some()
    }

    fn build(&mut self, input_shape: Shape) -> Result<()> {
        input_shape.validate()?;
        if let Some(features) = self.num_features() {
            return check_rebuild(&self.name, features, input_shape);
        }

        let channels = input_shape.channels;
        debug!(layer = %self.name, input = %input_shape, "built batch norm");
        self.params = Some(BatchNormParams {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            moving_mean: Array1::zeros(channels),
            moving_variance: Array1::ones(channels),
        });
        Ok(())
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| LayerError::NotBuilt(self.name.clone()))?;
        check_input(&self.name, params.gamma.len(), input)?;

        let (mean, var) = if self.training {
            // Batch statistics over (batch, length)
            let empty = || LayerError::InvalidShape {
                shape: Shape::of(input).to_string(),
                reason: "batch statistics need a non-empty input".to_string(),
            };
            let mean = input
                .mean_axis(Axis(0))
                .and_then(|m| m.mean_axis(Axis(0)))
                .ok_or_else(empty)?;
            let centered = input - &mean;
            let var = centered
                .mapv(|x| x * x)
                .mean_axis(Axis(0))
                .and_then(|m| m.mean_axis(Axis(0)))
                .ok_or_else(empty)?;
            (mean, var)
        } else {
            (params.moving_mean.clone(), params.moving_variance.clone())
        };

        let scale = &params.gamma / &var.mapv(|v| (v + self.epsilon).sqrt());
        let shift = &params.beta - &(&mean * &scale);

        Ok(input * &scale + &shift)
    }

    fn compute_output_shape(&self, input_shape: Shape) -> Result<Shape> {
        Ok(input_shape)
    }

    fn get_config(&self) -> LayerConfig {
        let mut config = LayerConfig::new();
        config.insert("name".to_string(), json!(self.name));
        config.insert("axis".to_string(), json!(-1));
        config.insert("epsilon".to_string(), json!(self.epsilon));
        config.insert("momentum".to_string(), json!(self.momentum));
        config
    }

    fn num_params(&self) -> usize {
        self.num_features().map_or(0, |c| c * 4)
    }

    fn num_trainable_params(&self) -> usize {
        self.num_features().map_or(0, |c| c * 2)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// ReLU activation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReLU {
    /// Layer name
    pub name: String,
    built: bool,
}

impl Default for ReLU {
    fn default() -> Self {
        Self::new()
    }
}

impl ReLU {
    /// Create a new ReLU layer
    pub fn new() -> Self {
        Self {
            name: "activation".to_string(),
            built: false,
        }
    }

    /// Set the layer name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stateless application, usable without a build step
    pub fn apply(input: &Array3<f32>) -> Array3<f32> {
        input.mapv(|x| x.max(0.0))
    }
}

impl Layer for ReLU {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "Activation"
    }

    fn is_built(&self) -> bool {
        self.built
    }

    fn build(&mut self, input_shape: Shape) -> Result<()> {
        input_shape.validate()?;
        self.built = true;
        Ok(())
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if !self.built {
            return Err(LayerError::NotBuilt(self.name.clone()));
        }
        Ok(Self::apply(input))
    }

    fn compute_output_shape(&self, input_shape: Shape) -> Result<Shape> {
        Ok(input_shape)
    }

    fn get_config(&self) -> LayerConfig {
        let mut config = LayerConfig::new();
        config.insert("name".to_string(), json!(self.name));
        config.insert("activation".to_string(), json!("relu"));
        config
    }

    fn num_params(&self) -> usize {
        0
    }
}

/// Reduction applied over each pooling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolMode {
    /// Maximum of the window
    Max,
    /// Mean of the valid (non-padded) positions of the window
    Average,
}

/// 1D pooling layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool1d {
    /// Layer name
    pub name: String,
    /// Reduction
    pub mode: PoolMode,
    /// Window size
    pub pool_size: usize,
    /// Stride
    pub stride: usize,
    /// Padding
    pub padding: Padding,
    built: bool,
}

impl Pool1d {
    /// Create a new pooling layer
    pub fn new(mode: PoolMode, pool_size: usize, stride: usize, padding: Padding) -> Result<Self> {
        if pool_size == 0 {
            return Err(LayerError::InvalidKernelSize(pool_size));
        }
        if stride == 0 {
            return Err(LayerError::InvalidStrides {
                strides: vec![stride],
                arity: 1,
            });
        }

        let name = match mode {
            PoolMode::Max => "max_pooling1d",
            PoolMode::Average => "average_pooling1d",
        };

        Ok(Self {
            name: name.to_string(),
            mode,
            pool_size,
            stride,
            padding,
            built: false,
        })
    }

    /// Max pooling
    pub fn max(pool_size: usize, stride: usize, padding: Padding) -> Result<Self> {
        Self::new(PoolMode::Max, pool_size, stride, padding)
    }

    /// Average pooling
    pub fn average(pool_size: usize, stride: usize, padding: Padding) -> Result<Self> {
        Self::new(PoolMode::Average, pool_size, stride, padding)
    }

    /// Set the layer name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Layer for Pool1d {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        match self.mode {
            PoolMode::Max => "MaxPooling1D",
            PoolMode::Average => "AveragePooling1D",
        }
    }

    fn is_built(&self) -> bool {
        self.built
    }

    fn build(&mut self, input_shape: Shape) -> Result<()> {
        input_shape.validate()?;
        self.compute_output_shape(input_shape)?;
        self.built = true;
        Ok(())
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if !self.built {
            return Err(LayerError::NotBuilt(self.name.clone()));
        }

        let (batch_size, in_len, channels) = input.dim();
        let out_len = window_output_length(
            &self.name,
            self.padding,
            Shape::of(input),
            self.pool_size,
            self.stride,
        )?;
        let pad = self.padding.left_pad(in_len, self.pool_size, self.stride) as isize;

        let mut output = Array3::zeros((batch_size, out_len, channels));

        for b in 0..batch_size {
            for ol in 0..out_len {
                let start = (ol * self.stride) as isize - pad;
                let lo = start.max(0) as usize;
                let hi = ((start + self.pool_size as isize).max(0) as usize).min(in_len);
                let window = input.slice(s![b, lo..hi, ..]);

                let reduced = match self.mode {
                    PoolMode::Max => {
                        window.fold_axis(Axis(0), f32::NEG_INFINITY, |&acc, &x| acc.max(x))
                    }
                    PoolMode::Average => window.mean_axis(Axis(0)).ok_or_else(|| {
                        LayerError::InvalidShape {
                            shape: Shape::of(input).to_string(),
                            reason: format!("empty pooling window in '{}'", self.name),
                        }
                    })?,
                };

                output.slice_mut(s![b, ol, ..]).assign(&reduced);
            }
        }

        Ok(output)
    }

    fn compute_output_shape(&self, input_shape: Shape) -> Result<Shape> {
        let length = window_output_length(
            &self.name,
            self.padding,
            input_shape,
            self.pool_size,
            self.stride,
        )?;
        Ok(input_shape.with_length(length))
    }

    fn get_config(&self) -> LayerConfig {
        let mut config = LayerConfig::new();
        config.insert("name".to_string(), json!(self.name));
        config.insert("pool_size".to_string(), json!([self.pool_size]));
        config.insert("strides".to_string(), json!([self.stride]));
        config.insert("padding".to_string(), json!(self.padding.as_str()));
        config
    }

    fn num_params(&self) -> usize {
        0
    }
}

/// Linear (fully connected) layer over `(batch, features)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    /// Layer name
    pub name: String,
    /// Output features
    pub units: usize,
    /// Weight matrix [in_features, units], `None` until built
    pub weight: Option<Array2<f32>>,
    /// Bias vector [units]
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    /// Create an unbuilt Linear layer
    pub fn new(units: usize) -> Result<Self> {
        if units == 0 {
            return Err(LayerError::InvalidFilters(units));
        }
        Ok(Self {
            name: "dense".to_string(),
            units,
            weight: None,
            bias: None,
        })
    }

    /// Set the layer name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_built(&self) -> bool {
        self.weight.is_some()
    }

    /// Allocate weights for `in_features` inputs
    pub fn build(&mut self, in_features: usize) -> Result<()> {
        if let Some(ref weight) = self.weight {
            if weight.dim().0 != in_features {
                return Err(LayerError::ShapeMismatch {
                    layer: self.name.clone(),
                    expected: format!("{} features", weight.dim().0),
                    got: format!("{} features", in_features),
                });
            }
            return Ok(());
        }
        if in_features == 0 {
            return Err(LayerError::InvalidShape {
                shape: format!("(None, {})", in_features),
                reason: "features must be positive".to_string(),
            });
        }

        let mut rng = rand::thread_rng();
        let std = (1.0 / in_features as f32).sqrt();
        let normal =
            Normal::new(0.0, std).map_err(|e| LayerError::Initialization(e.to_string()))?;

        self.weight = Some(Array2::from_shape_fn((in_features, self.units), |_| {
            rng.sample(normal)
        }));
        self.bias = Some(Array1::zeros(self.units));
        Ok(())
    }

    /// Forward pass
    /// Input shape: [batch, in_features]
    /// Output shape: [batch, units]
    pub fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        let weight = self
            .weight
            .as_ref()
            .ok_or_else(|| LayerError::NotBuilt(self.name.clone()))?;
        if input.dim().1 != weight.dim().0 {
            return Err(LayerError::ShapeMismatch {
                layer: self.name.clone(),
                expected: format!("{} features", weight.dim().0),
                got: format!("{} features", input.dim().1),
            });
        }

        let mut output = input.dot(weight);
        if let Some(ref bias) = self.bias {
            output += bias;
        }
        Ok(output)
    }

    /// Get number of parameters
    pub fn num_params(&self) -> usize {
        self.weight.as_ref().map_or(0, |w| w.len()) + self.bias.as_ref().map_or(0, |b| b.len())
    }
}
