//! Bottleneck residual block for 1D sequences

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::layer::{
    check_input, check_rebuild, config_str, config_usize, config_usize_list, Layer, LayerConfig,
    Shape,
};
use super::layers::{BatchNorm1d, Conv1d, Padding, Pool1d, ReLU};
use crate::error::{LayerError, Result};

/// Projection applied to the skip connection when shapes differ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shortcut {
    /// Average-pool downsampling, present when the stride exceeds 1
    pub pool: Option<Pool1d>,
    /// 1x1 projection to the expanded channel count
    pub conv: Conv1d,
    /// Batch norm after the projection
    pub bn: BatchNorm1d,
}

impl Shortcut {
    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let projected = match &self.pool {
            Some(pool) => self.conv.forward(&pool.forward(input)?)?,
            None => self.conv.forward(input)?,
        };
        self.bn.forward(&projected)
    }

    fn num_params(&self) -> usize {
        self.conv.num_params() + self.bn.num_params()
    }

    fn num_trainable_params(&self) -> usize {
        self.conv.num_trainable_params() + self.bn.num_trainable_params()
    }
}

/// Sub-layers of a built block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckLayers {
    /// 1x1 convolution (reduce)
    pub conv1: Conv1d,
    /// First batch norm
    pub bn1: BatchNorm1d,
    /// 3-tap strided convolution (process)
    pub conv2: Conv1d,
    /// Second batch norm
    pub bn2: BatchNorm1d,
    /// 1x1 convolution (expand)
    pub conv3: Conv1d,
    /// Third batch norm
    pub bn3: BatchNorm1d,
    /// ReLU activation
    pub relu: ReLU,
    /// Skip projection, `None` for an identity skip
    pub shortcut: Option<Shortcut>,
}

impl BottleneckLayers {
    fn batch_norms_mut(&mut self) -> impl Iterator<Item = &mut BatchNorm1d> {
        let shortcut_bn = self.shortcut.as_mut().map(|s| &mut s.bn);
        [&mut self.bn1, &mut self.bn2, &mut self.bn3]
            .into_iter()
            .chain(shortcut_bn)
    }
}

/// Bottleneck residual block with 1x1, 3-tap, 1x1 convolutions
///
/// The output has `filters * EXPANSION` channels and `ceil(length / stride)`
/// steps. Sub-layers are created on the first `build` or `call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawBottleneck")]
pub struct BottleneckResidual1D {
    /// Layer name
    pub name: String,
    filters: usize,
    strides: Vec<usize>,
    /// Sub-layers, `None` until built
    pub layers: Option<BottleneckLayers>,
    input_channels: Option<usize>,
}

/// Serialized form of a block, checked by `TryFrom` before use
#[derive(Deserialize)]
struct RawBottleneck {
    name: String,
    filters: usize,
    strides: Vec<usize>,
    layers: Option<BottleneckLayers>,
    input_channels: Option<usize>,
}

impl TryFrom<RawBottleneck> for BottleneckResidual1D {
    type Error = LayerError;

    fn try_from(raw: RawBottleneck) -> Result<Self> {
        let mut block = Self::new(raw.filters, &raw.strides)?.with_name(raw.name);
        if raw.layers.is_some() != raw.input_channels.is_some() {
            return Err(LayerError::InvalidConfig(
                "sub-layers and input channels must be set together".to_string(),
            ));
        }
        block.layers = raw.layers;
        block.input_channels = raw.input_channels;
        Ok(block)
    }
}

impl BottleneckResidual1D {
    /// Expansion factor of the output channels
    pub const EXPANSION: usize = 4;

    /// Create an unbuilt block
    ///
    /// # Arguments
    ///
    /// * `filters` - Channels of the bottleneck; the output has four times as many
    /// * `strides` - Stride of the 3-tap convolution, exactly one value
    pub fn new(filters: usize, strides: &[usize]) -> Result<Self> {
        if filters == 0 {
            return Err(LayerError::InvalidFilters(filters));
        }
        if strides.len() != 1 || strides.contains(&0) {
            return Err(LayerError::InvalidStrides {
                strides: strides.to_vec(),
                arity: 1,
            });
        }

        Ok(Self {
            name: "bottleneck_residual1d".to_string(),
            filters,
            strides: strides.to_vec(),
            layers: None,
            input_channels: None,
        })
    }

    /// Reconstruct an unbuilt block from `get_config` output
    pub fn from_config(config: &LayerConfig) -> Result<Self> {
        let filters = config_usize(config, "filters")?;
        let strides = config_usize_list(config, "strides")?;
        let block = Self::new(filters, &strides)?;

        Ok(match config_str(config, "name") {
            Some(name) => block.with_name(name),
            None => block,
        })
    }

    /// Set the layer name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Bottleneck channel count
    pub fn filters(&self) -> usize {
        self.filters
    }

    /// Strides as given to the constructor
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Stride of the 3-tap convolution
    pub fn stride(&self) -> usize {
        self.strides[0]
    }

    /// Channels produced by the block
    pub fn output_channels(&self) -> usize {
        self.filters * Self::EXPANSION
    }

    /// Whether the skip connection needs a projection for this input
    pub fn needs_projection(&self, in_channels: usize) -> bool {
        self.stride() != 1 || in_channels != self.output_channels()
    }

    /// Whether the built block projects its skip connection
    pub fn has_projection(&self) -> Option<bool> {
        self.layers.as_ref().map(|l| l.shortcut.is_some())
    }

    fn sublayer_name(&self, suffix: &str) -> String {
        format!("{}_{}", self.name, suffix)
    }

    fn build_shortcut(&self, input_shape: Shape) -> Result<Option<Shortcut>> {
        if !self.needs_projection(input_shape.channels) {
            return Ok(None);
        }

        let stride = self.stride();
        let mut shape = input_shape;

        let pool = if stride > 1 {
            let mut pool = Pool1d::average(stride, stride, Padding::Same)?
                .with_name(self.sublayer_name("shortcut_pool"));
            pool.build(shape)?;
            shape = pool.compute_output_shape(shape)?;
            Some(pool)
        } else {
            None
        };

        let mut conv = Conv1d::new(self.output_channels(), 1, 1, Padding::Same, false)?
            .with_name(self.sublayer_name("shortcut_conv"));
        conv.build(shape)?;
        shape = conv.compute_output_shape(shape)?;

        let mut bn = BatchNorm1d::new().with_name(self.sublayer_name("shortcut_bn"));
        bn.build(shape)?;

        Ok(Some(Shortcut { pool, conv, bn }))
    }
}

impl Layer for BottleneckResidual1D {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "BottleneckResidual1D"
    }

    fn is_built(&self) -> bool {
        self.layers.is_some()
    }

    fn build(&mut self, input_shape: Shape) -> Result<()> {
        input_shape.validate()?;
        if let Some(channels) = self.input_channels {
            return check_rebuild(&self.name, channels, input_shape);
        }

        let mut shape = input_shape;

        // 1x1 reduce
        let mut conv1 = Conv1d::new(self.filters, 1, 1, Padding::Same, false)?
            .with_name(self.sublayer_name("conv1"));
        conv1.build(shape)?;
        shape = conv1.compute_output_shape(shape)?;
        let mut bn1 = BatchNorm1d::new().with_name(self.sublayer_name("bn1"));
        bn1.build(shape)?;

        // 3-tap process
        let mut conv2 = Conv1d::new(self.filters, 3, self.stride(), Padding::Same, false)?
            .with_name(self.sublayer_name("conv2"));
        conv2.build(shape)?;
        shape = conv2.compute_output_shape(shape)?;
        let mut bn2 = BatchNorm1d::new().with_name(self.sublayer_name("bn2"));
        bn2.build(shape)?;

        // 1x1 expand
        let mut conv3 = Conv1d::new(self.output_channels(), 1, 1, Padding::Same, false)?
            .with_name(self.sublayer_name("conv3"));
        conv3.build(shape)?;
        shape = conv3.compute_output_shape(shape)?;
        let mut bn3 = BatchNorm1d::new().with_name(self.sublayer_name("bn3"));
        bn3.build(shape)?;

        let mut relu = ReLU::new().with_name(self.sublayer_name("relu"));
        relu.build(shape)?;

        let shortcut = self.build_shortcut(input_shape)?;

        debug!(
            layer = %self.name,
            input = %input_shape,
            output = %shape,
            projection = shortcut.is_some(),
            "built bottleneck block"
        );

        self.layers = Some(BottleneckLayers {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            relu,
            shortcut,
        });
        self.input_channels = Some(input_shape.channels);
        Ok(())
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let (layers, channels) = match (&self.layers, self.input_channels) {
            (Some(layers), Some(channels)) => (layers, channels),
            _ => return Err(LayerError::NotBuilt(self.name.clone())),
        };
        check_input(&self.name, channels, input)?;

        // 1x1 reduce
        let mut out = layers.conv1.forward(input)?;
        out = layers.bn1.forward(&out)?;
        out = layers.relu.forward(&out)?;

        // 3-tap process
        out = layers.conv2.forward(&out)?;
        out = layers.bn2.forward(&out)?;
        out = layers.relu.forward(&out)?;

        // 1x1 expand
        out = layers.conv3.forward(&out)?;
        out = layers.bn3.forward(&out)?;

        // Skip connection
        match &layers.shortcut {
            Some(shortcut) => out += &shortcut.forward(input)?,
            None => out += input,
        }

        layers.relu.forward(&out)
    }

    fn compute_output_shape(&self, input_shape: Shape) -> Result<Shape> {
        input_shape.validate()?;
        let length = Padding::Same
            .output_length(input_shape.length, 3, self.stride())
            .unwrap_or(input_shape.length);
        Ok(input_shape
            .with_length(length)
            .with_channels(self.output_channels()))
    }

    fn get_config(&self) -> LayerConfig {
        let mut config = LayerConfig::new();
        config.insert("name".to_string(), json!(self.name));
        config.insert("filters".to_string(), json!(self.filters));
        config.insert("strides".to_string(), json!(self.strides));
        config
    }

    fn num_params(&self) -> usize {
        self.layers.as_ref().map_or(0, |l| {
            l.conv1.num_params()
                + l.bn1.num_params()
                + l.conv2.num_params()
                + l.bn2.num_params()
                + l.conv3.num_params()
                + l.bn3.num_params()
                + l.shortcut.as_ref().map_or(0, Shortcut::num_params)
        })
    }

    fn num_trainable_params(&self) -> usize {
        self.layers.as_ref().map_or(0, |l| {
            l.conv1.num_trainable_params()
                + l.bn1.num_trainable_params()
                + l.conv2.num_trainable_params()
                + l.bn2.num_trainable_params()
                + l.conv3.num_trainable_params()
                + l.bn3.num_trainable_params()
                + l.shortcut.as_ref().map_or(0, Shortcut::num_trainable_params)
        })
    }

    fn set_training(&mut self, training: bool) {
        if let Some(layers) = self.layers.as_mut() {
            for bn in layers.batch_norms_mut() {
                bn.set_training(training);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;
    use rand_distr::StandardNormal;

    fn random_normal(shape: (usize, usize, usize)) -> Array3<f32> {
        let mut rng = rand::thread_rng();
        Array3::from_shape_fn(shape, |_| rng.sample(StandardNormal))
    }

    #[test]
    fn test_creation_is_a_layer() {
        let block = BottleneckResidual1D::new(1, &[1]).unwrap();
        let layer: &dyn Layer = &block;
        assert!(!layer.is_built());
        assert_eq!(layer.class_name(), "BottleneckResidual1D");
    }

    #[test]
    fn test_build_sets_built() {
        let mut block = BottleneckResidual1D::new(1, &[1]).unwrap();
        block.build(Shape::new(None, 1, 3)).unwrap();
        assert!(block.is_built());
    }

    #[test]
    fn test_output_channels_expanded() {
        let filters = 1;
        let input = random_normal((1, 1, 3));
        let output = BottleneckResidual1D::new(filters, &[1])
            .unwrap()
            .call(&input)
            .unwrap();
        assert_eq!(output.shape(), &[1, 1, filters * 4]);
    }

    #[test]
    fn test_compute_output_shape_matches_call() {
        let mut block = BottleneckResidual1D::new(1, &[1]).unwrap();
        let input = random_normal((1, 1, 3));
        let output = block.call(&input).unwrap();
        let output_shape = block.compute_output_shape(Shape::of(&input)).unwrap();
        assert_eq!(Shape::of(&output), output_shape);
        assert_eq!(output_shape, Shape::from([1, 1, 4]));
    }

    #[test]
    fn test_compute_output_shape_before_build() {
        let block = BottleneckResidual1D::new(16, &[2]).unwrap();
        let shape = block.compute_output_shape(Shape::new(None, 128, 32)).unwrap();
        assert_eq!(shape, Shape::new(None, 64, 64));
        assert!(!block.is_built());
    }

    #[test]
    fn test_get_config_has_constructor_params() {
        let block = BottleneckResidual1D::new(1, &[1]).unwrap();
        let config = block.get_config();
        for key in ["filters", "strides"] {
            assert!(config.contains_key(key), "missing '{}' in get_config", key);
        }
    }

    #[test]
    fn test_from_config_round_trip() {
        let block = BottleneckResidual1D::new(8, &[2]).unwrap().with_name("stage2_block1");
        let restored = BottleneckResidual1D::from_config(&block.get_config()).unwrap();
        assert_eq!(restored.get_config(), block.get_config());
        assert!(!restored.is_built());
    }

    #[test]
    fn test_from_config_rejects_missing_keys() {
        let mut config = BottleneckResidual1D::new(8, &[1]).unwrap().get_config();
        config.remove("strides");
        assert!(matches!(
            BottleneckResidual1D::from_config(&config),
            Err(LayerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_arguments_fail_fast() {
        assert!(matches!(
            BottleneckResidual1D::new(0, &[1]),
            Err(LayerError::InvalidFilters(0))
        ));
        for strides in [&[][..], &[1, 1][..], &[0][..]] {
            assert!(matches!(
                BottleneckResidual1D::new(4, strides),
                Err(LayerError::InvalidStrides { .. })
            ));
        }
    }

    #[test]
    fn test_empty_sequence_builds_and_calls() {
        let mut block = BottleneckResidual1D::new(1, &[1]).unwrap();
        block.build(Shape::new(None, 0, 3)).unwrap();
        assert!(block.is_built());

        let output = block.call(&Array3::zeros((1, 0, 3))).unwrap();
        assert_eq!(output.shape(), &[1, 0, 4]);
        assert_eq!(
            block.compute_output_shape(Shape::new(Some(1), 0, 3)).unwrap(),
            Shape::of(&output)
        );

        let mut strided = BottleneckResidual1D::new(2, &[2]).unwrap();
        let output = strided.call(&Array3::zeros((2, 0, 5))).unwrap();
        assert_eq!(output.shape(), &[2, 0, 8]);
    }

    #[test]
    fn test_deserialize_rejects_invalid_block() {
        for json in [
            r#"{"name":"b","filters":0,"strides":[1],"layers":null,"input_channels":null}"#,
            r#"{"name":"b","filters":1,"strides":[],"layers":null,"input_channels":null}"#,
            r#"{"name":"b","filters":1,"strides":[1],"layers":null,"input_channels":3}"#,
        ] {
            assert!(serde_json::from_str::<BottleneckResidual1D>(json).is_err());
        }
    }

    #[test]
    fn test_serde_round_trip_keeps_weights() {
        let mut block = BottleneckResidual1D::new(2, &[2]).unwrap().with_name("saved");
        let input = random_normal((1, 6, 3));
        let expected = block.call(&input).unwrap();

        let json = serde_json::to_string(&block).unwrap();
        let restored: BottleneckResidual1D = serde_json::from_str(&json).unwrap();
        assert!(restored.is_built());
        assert_eq!(restored.stride(), 2);
        let output = restored.forward(&input).unwrap();
        for (got, want) in output.iter().zip(expected.iter()) {
            assert_relative_eq!(*got, *want, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_build_rejects_empty_channels() {
        let mut block = BottleneckResidual1D::new(1, &[1]).unwrap();
        assert!(block.build(Shape::new(None, 4, 0)).is_err());
        assert!(!block.is_built());
    }

    #[test]
    fn test_identity_skip_when_shapes_match() {
        let mut block = BottleneckResidual1D::new(4, &[1]).unwrap();
        block.build(Shape::new(None, 8, 16)).unwrap();
        assert_eq!(block.has_projection(), Some(false));
    }

    #[test]
    fn test_projection_for_channels_and_stride() {
        let mut widen = BottleneckResidual1D::new(4, &[1]).unwrap();
        widen.build(Shape::new(None, 8, 3)).unwrap();
        assert_eq!(widen.has_projection(), Some(true));
        let pool = widen.layers.as_ref().and_then(|l| l.shortcut.as_ref()).map(|s| s.pool.is_some());
        assert_eq!(pool, Some(false));

        let mut strided = BottleneckResidual1D::new(4, &[2]).unwrap();
        let input = random_normal((2, 9, 16));
        let output = strided.call(&input).unwrap();
        assert_eq!(strided.has_projection(), Some(true));
        assert_eq!(output.shape(), &[2, 5, 16]);
    }

    #[test]
    fn test_identity_skip_passes_input_through() {
        let mut block = BottleneckResidual1D::new(1, &[1]).unwrap();
        block.build(Shape::new(None, 5, 4)).unwrap();
        // Zero expand weights leave only the skip connection
        block.layers.as_mut().unwrap().conv3.params.as_mut().unwrap().kernel.fill(0.0);

        let input = random_normal((2, 5, 4));
        let output = block.forward(&input).unwrap();
        for (got, x) in output.iter().zip(input.iter()) {
            assert_relative_eq!(*got, x.max(0.0), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_output_is_non_negative() {
        let mut block = BottleneckResidual1D::new(2, &[2]).unwrap();
        let output = block.call(&random_normal((3, 10, 5))).unwrap();
        assert!(output.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn test_repeated_calls_are_deterministic() {
        let mut block = BottleneckResidual1D::new(2, &[1]).unwrap();
        let input = random_normal((2, 6, 3));
        let first = block.call(&input).unwrap();
        let second = block.call(&input).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rebuild_and_call_with_other_channels() {
        let mut block = BottleneckResidual1D::new(2, &[1]).unwrap();
        block.build(Shape::new(None, 6, 3)).unwrap();
        assert!(block.build(Shape::new(None, 12, 3)).is_ok());
        assert!(matches!(
            block.build(Shape::new(None, 6, 5)),
            Err(LayerError::ShapeMismatch { .. })
        ));
        assert!(block.call(&random_normal((1, 6, 5))).is_err());
    }

    #[test]
    fn test_forward_before_build() {
        let block = BottleneckResidual1D::new(2, &[1]).unwrap();
        assert!(matches!(
            block.forward(&random_normal((1, 4, 8))),
            Err(LayerError::NotBuilt(_))
        ));
    }

    #[test]
    fn test_num_params() {
        let mut block = BottleneckResidual1D::new(1, &[1]).unwrap();
        assert_eq!(block.num_params(), 0);
        block.build(Shape::new(None, 1, 3)).unwrap();
        // conv1 3*1, conv2 3*1*1, conv3 1*4, bn 4*(1 + 1 + 4),
        // shortcut conv 3*4 and bn 4*4
        assert_eq!(block.num_params(), 3 + 3 + 4 + 24 + 12 + 16);
        assert_eq!(block.num_trainable_params(), 3 + 3 + 4 + 12 + 12 + 8);
    }

    #[test]
    fn test_training_mode_reaches_batch_norms() {
        let mut block = BottleneckResidual1D::new(1, &[2]).unwrap();
        block.build(Shape::new(None, 4, 2)).unwrap();
        block.set_training(true);
        let layers = block.layers.as_ref().unwrap();
        assert!(layers.bn1.training && layers.bn2.training && layers.bn3.training);
        assert!(layers.shortcut.as_ref().unwrap().bn.training);
    }
}
