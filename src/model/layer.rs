//! Layer capability shared by primitive layers, residual blocks and containers
//!
//! Every layer follows a two-phase life cycle: a cheap constructor that only
//! records configuration, then a `build` step that allocates the
//! shape-dependent weights once the input shape is known. `call` triggers the
//! build on first use.

use std::fmt;

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{LayerError, Result};

/// Serializable configuration of a layer, keyed by constructor parameter name
pub type LayerConfig = Map<String, Value>;

/// Shape of a channels-last sequence tensor `(batch, length, channels)`
///
/// A `None` batch leaves the batch dimension unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    /// Batch size, `None` when unconstrained
    pub batch: Option<usize>,
    /// Sequence length
    pub length: usize,
    /// Number of channels (features)
    pub channels: usize,
}

impl Shape {
    /// Create a new shape
    pub fn new(batch: Option<usize>, length: usize, channels: usize) -> Self {
        Self {
            batch,
            length,
            channels,
        }
    }

    /// Shape of a concrete tensor
    pub fn of(tensor: &Array3<f32>) -> Self {
        let (batch, length, channels) = tensor.dim();
        Self::new(Some(batch), length, channels)
    }

    /// Same shape with another channel count
    pub fn with_channels(self, channels: usize) -> Self {
        Self { channels, ..self }
    }

    /// Same shape with another sequence length
    pub fn with_length(self, length: usize) -> Self {
        Self { length, ..self }
    }

    /// Reject shapes with an empty channel axis
    ///
    /// An empty length is allowed; windows that need input reject it themselves.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(LayerError::InvalidShape {
                shape: self.to_string(),
                reason: "channels must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl From<(Option<usize>, usize, usize)> for Shape {
    fn from((batch, length, channels): (Option<usize>, usize, usize)) -> Self {
        Self::new(batch, length, channels)
    }
}

impl From<[usize; 3]> for Shape {
    fn from([batch, length, channels]: [usize; 3]) -> Self {
        Self::new(Some(batch), length, channels)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.batch {
            Some(batch) => write!(f, "({}, {}, {})", batch, self.length, self.channels),
            None => write!(f, "(None, {}, {})", self.length, self.channels),
        }
    }
}

/// Common capability set of every layer
pub trait Layer: fmt::Debug + Send {
    /// Instance name
    fn name(&self) -> &str;

    /// Layer type name, as shown in summaries
    fn class_name(&self) -> &'static str;

    /// Whether `build` has run
    fn is_built(&self) -> bool;

    /// Allocate the shape-dependent state
    ///
    /// Building again with the same channel count is a no-op.
    fn build(&mut self, input_shape: Shape) -> Result<()>;

    /// Forward pass on a built layer
    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>>;

    /// Output shape for a given input shape, available before build
    fn compute_output_shape(&self, input_shape: Shape) -> Result<Shape>;

    /// Configuration sufficient to reconstruct an unbuilt copy of this layer
    fn get_config(&self) -> LayerConfig;

    /// Number of weights, including non-trainable statistics
    fn num_params(&self) -> usize;

    /// Number of trainable weights
    fn num_trainable_params(&self) -> usize {
        self.num_params()
    }

    /// Switch between training and inference behaviour
    fn set_training(&mut self, _training: bool) {}

    /// Build from the input shape if needed, then run the forward pass
    fn call(&mut self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if !self.is_built() {
            self.build(Shape::of(input))?;
        }
        self.forward(input)
    }
}

/// Check a rebuild against the channel count the layer was built with
pub(crate) fn check_rebuild(name: &str, built_channels: usize, input_shape: Shape) -> Result<()> {
    if built_channels != input_shape.channels {
        return Err(LayerError::ShapeMismatch {
            layer: name.to_string(),
            expected: format!("{} channels", built_channels),
            got: input_shape.to_string(),
        });
    }
    Ok(())
}

/// Check a forward input against the channel count the layer was built with
pub(crate) fn check_input(name: &str, built_channels: usize, input: &Array3<f32>) -> Result<()> {
    let channels = input.dim().2;
    if channels != built_channels {
        return Err(LayerError::ShapeMismatch {
            layer: name.to_string(),
            expected: format!("{} channels", built_channels),
            got: Shape::of(input).to_string(),
        });
    }
    Ok(())
}

/// Read a required positive integer entry from a config
pub(crate) fn config_usize(config: &LayerConfig, key: &str) -> Result<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| LayerError::InvalidConfig(format!("missing or non-integer '{}'", key)))
}

/// Read a required list of integers from a config
pub(crate) fn config_usize_list(config: &LayerConfig, key: &str) -> Result<Vec<usize>> {
    let values = config
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| LayerError::InvalidConfig(format!("missing or non-list '{}'", key)))?;

    values
        .iter()
        .map(|v| {
            v.as_u64().map(|v| v as usize).ok_or_else(|| {
                LayerError::InvalidConfig(format!("non-integer entry in '{}'", key))
            })
        })
        .collect()
}

/// Read an optional string entry from a config
pub(crate) fn config_str<'a>(config: &'a LayerConfig, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

/// Ordered stack of layers behaving as a single layer
#[derive(Debug)]
pub struct Sequential {
    name: String,
    layers: Vec<Box<dyn Layer>>,
    built: bool,
}

impl Sequential {
    /// Create an empty stack
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
            built: false,
        }
    }

    /// Append a layer
    pub fn push<L: Layer + 'static>(&mut self, layer: L) {
        self.layers.push(Box::new(layer));
        self.built = false;
    }

    /// Builder-style append
    pub fn with<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.push(layer);
        self
    }

    /// Child layers in order
    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "Sequential"
    }

    fn is_built(&self) -> bool {
        self.built
    }

    fn build(&mut self, input_shape: Shape) -> Result<()> {
        input_shape.validate()?;

        let mut shape = input_shape;
        for layer in self.layers.iter_mut() {
            layer.build(shape)?;
            shape = layer.compute_output_shape(shape)?;
        }

        debug!(layer = %self.name, input = %input_shape, output = %shape, "built sequential");
        self.built = true;
        Ok(())
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        if !self.built {
            return Err(LayerError::NotBuilt(self.name.clone()));
        }

        let mut out = input.clone();
        for layer in &self.layers {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn compute_output_shape(&self, input_shape: Shape) -> Result<Shape> {
        self.layers
            .iter()
            .try_fold(input_shape, |shape, layer| layer.compute_output_shape(shape))
    }

    fn get_config(&self) -> LayerConfig {
        let layers: Vec<Value> = self
            .layers
            .iter()
            .map(|layer| {
                json!({
                    "class_name": layer.class_name(),
                    "config": Value::Object(layer.get_config()),
                })
            })
            .collect();

        let mut config = LayerConfig::new();
        config.insert("name".to_string(), json!(self.name));
        config.insert("layers".to_string(), Value::Array(layers));
        config
    }

    fn num_params(&self) -> usize {
        self.layers.iter().map(|l| l.num_params()).sum()
    }

    fn num_trainable_params(&self) -> usize {
        self.layers.iter().map(|l| l.num_trainable_params()).sum()
    }

    fn set_training(&mut self, training: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_display() {
        assert_eq!(Shape::new(None, 128, 32).to_string(), "(None, 128, 32)");
        assert_eq!(Shape::from([1, 1, 4]).to_string(), "(1, 1, 4)");
    }

    #[test]
    fn test_shape_of_tensor() {
        let x = Array3::<f32>::zeros((2, 7, 3));
        assert_eq!(Shape::of(&x), Shape::new(Some(2), 7, 3));
    }

    #[test]
    fn test_shape_validate() {
        assert!(Shape::new(None, 1, 1).validate().is_ok());
        assert!(Shape::new(None, 0, 3).validate().is_ok());
        assert!(Shape::new(None, 3, 0).validate().is_err());
    }

    #[test]
    fn test_empty_sequential_is_identity() {
        let mut seq = Sequential::new("empty");
        let x = Array3::from_elem((1, 4, 2), 1.5f32);
        let out = seq.call(&x).unwrap();
        assert_eq!(out, x);
        assert!(seq.is_built());
        assert_eq!(seq.num_params(), 0);
    }

    #[test]
    fn test_config_helpers() {
        let mut config = LayerConfig::new();
        config.insert("filters".to_string(), json!(8));
        config.insert("strides".to_string(), json!([2]));
        config.insert("name".to_string(), json!("block"));

        assert_eq!(config_usize(&config, "filters").unwrap(), 8);
        assert_eq!(config_usize_list(&config, "strides").unwrap(), vec![2]);
        assert_eq!(config_str(&config, "name"), Some("block"));
        assert!(config_usize(&config, "missing").is_err());
        assert!(config_usize_list(&config, "filters").is_err());
    }
}
