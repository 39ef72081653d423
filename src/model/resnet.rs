//! BResNet-1D: bottleneck ResNet-D for sequences

use ndarray::{Array2, Array3, Axis};
use tracing::info;

use super::blocks::BottleneckResidual1D;
use super::config::BResNetConfig;
use super::layer::{Layer, Sequential, Shape};
use super::layers::{BatchNorm1d, Conv1d, Linear, Padding, Pool1d, ReLU};
use crate::error::{LayerError, Result};

const SUMMARY_WIDTH: usize = 84;

/// Deep stem, four stages of bottleneck blocks, global average pooling and an
/// optional classifier
#[derive(Debug)]
pub struct BResNet1D {
    /// Model configuration
    pub config: BResNetConfig,
    /// Three convolutions and a max pool
    stem: Sequential,
    /// One stack of blocks per stage
    stages: Vec<Sequential>,
    /// Classifier, present when `num_classes` is set
    head: Option<Linear>,
    /// Shape given to `build`
    input_shape: Option<Shape>,
}

impl BResNet1D {
    /// Create an unbuilt model
    pub fn new(config: BResNetConfig) -> Result<Self> {
        config.validate()?;

        let stem = Self::make_stem(&config.stem_filters)?;

        let stages = config
            .stage_blocks
            .iter()
            .zip(&config.stage_filters)
            .enumerate()
            .map(|(i, (&num_blocks, &filters))| {
                // Every stage after the first halves the length
                let stride = if i == 0 { 1 } else { 2 };
                Self::make_stage(i + 1, filters, num_blocks, stride)
            })
            .collect::<Result<Vec<_>>>()?;

        let head = config
            .num_classes
            .map(|classes| Linear::new(classes).map(|l| l.with_name("classifier")))
            .transpose()?;

        Ok(Self {
            config,
            stem,
            stages,
            head,
            input_shape: None,
        })
    }

    fn make_stem(filters: &[usize]) -> Result<Sequential> {
        let mut stem = Sequential::new("stem");

        for (i, &f) in filters.iter().enumerate() {
            let stride = if i == 0 { 2 } else { 1 };
            stem.push(
                Conv1d::new(f, 3, stride, Padding::Same, false)?
                    .with_name(format!("stem_conv{}", i + 1)),
            );
            stem.push(BatchNorm1d::new().with_name(format!("stem_bn{}", i + 1)));
            stem.push(ReLU::new().with_name(format!("stem_relu{}", i + 1)));
        }
        stem.push(Pool1d::max(3, 2, Padding::Same)?.with_name("stem_pool"));

        Ok(stem)
    }

    fn make_stage(
        index: usize,
        filters: usize,
        num_blocks: usize,
        stride: usize,
    ) -> Result<Sequential> {
        let mut stage = Sequential::new(format!("stage{}", index));

        // First block may have stride and change dimensions
        stage.push(
            BottleneckResidual1D::new(filters, &[stride])?
                .with_name(format!("stage{}_block1", index)),
        );

        for b in 1..num_blocks {
            stage.push(
                BottleneckResidual1D::new(filters, &[1])?
                    .with_name(format!("stage{}_block{}", index, b + 1)),
            );
        }

        Ok(stage)
    }

    pub fn is_built(&self) -> bool {
        self.input_shape.is_some()
    }

    /// Shape the model was built with
    pub fn input_shape(&self) -> Option<Shape> {
        self.input_shape
    }

    pub fn stem(&self) -> &Sequential {
        &self.stem
    }

    pub fn stages(&self) -> &[Sequential] {
        &self.stages
    }

    /// Allocate every layer for inputs of `input_shape`
    pub fn build(&mut self, input_shape: impl Into<Shape>) -> Result<()> {
        let input_shape = input_shape.into();
        input_shape.validate()?;
        if input_shape.length == 0 {
            return Err(LayerError::InvalidShape {
                shape: input_shape.to_string(),
                reason: "global pooling needs a non-empty sequence".to_string(),
            });
        }

        let mut shape = input_shape;
        self.stem.build(shape)?;
        shape = self.stem.compute_output_shape(shape)?;

        for stage in self.stages.iter_mut() {
            stage.build(shape)?;
            shape = stage.compute_output_shape(shape)?;
        }

        if let Some(head) = self.head.as_mut() {
            head.build(shape.channels)?;
        }

        self.input_shape = Some(input_shape);
        info!(
            input = %input_shape,
            blocks = self.config.num_blocks(),
            params = self.num_params(),
            "built BResNet1D"
        );
        Ok(())
    }

    /// Shape after the last stage, before pooling
    pub fn feature_shape(&self, input_shape: Shape) -> Result<Shape> {
        let shape = self.stem.compute_output_shape(input_shape)?;
        self.stages
            .iter()
            .try_fold(shape, |shape, stage| stage.compute_output_shape(shape))
    }

    /// Output shape `(batch, units)` for a given input shape
    pub fn output_shape(&self, input_shape: Shape) -> Result<(Option<usize>, usize)> {
        let features = self.feature_shape(input_shape)?;
        let units = self.config.num_classes.unwrap_or(features.channels);
        Ok((features.batch, units))
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape [batch, length, channels]
    ///
    /// # Returns
    ///
    /// Pooled features [batch, 4 * last stage filters], or logits
    /// [batch, num_classes] when a classifier is configured
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array2<f32>> {
        if !self.is_built() {
            return Err(LayerError::NotBuilt("bresnet1d".to_string()));
        }

        let mut out = self.stem.forward(x)?;
        for stage in &self.stages {
            out = stage.forward(&out)?;
        }

        let pooled = global_average_pool(&out)?;
        match &self.head {
            Some(head) => head.forward(&pooled),
            None => Ok(pooled),
        }
    }

    /// Build from the input shape if needed, then run the forward pass
    pub fn call(&mut self, x: &Array3<f32>) -> Result<Array2<f32>> {
        if !self.is_built() {
            self.build(Shape::of(x))?;
        }
        self.forward(x)
    }

    /// Predict class probabilities using softmax
    pub fn predict_proba(&self, x: &Array3<f32>) -> Result<Array2<f32>> {
        if self.head.is_none() {
            return Err(LayerError::InvalidConfig(
                "predictions need num_classes to be set".to_string(),
            ));
        }
        let logits = self.forward(x)?;
        Ok(softmax(&logits))
    }

    /// Predict class labels
    pub fn predict(&self, x: &Array3<f32>) -> Result<Vec<usize>> {
        let probs = self.predict_proba(x)?;

        Ok(probs
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.total_cmp(b))
                    .map(|(idx, _)| idx)
                    .unwrap_or(0)
            })
            .collect())
    }

    /// Switch batch norms between training and inference statistics
    pub fn set_training(&mut self, training: bool) {
        self.stem.set_training(training);
        for stage in self.stages.iter_mut() {
            stage.set_training(training);
        }
    }

    /// Get total number of parameters
    pub fn num_params(&self) -> usize {
        self.stem.num_params()
            + self.stages.iter().map(|s| s.num_params()).sum::<usize>()
            + self.head.as_ref().map_or(0, Linear::num_params)
    }

    /// Parameters updated by training (excludes batch norm moving statistics)
    pub fn num_trainable_params(&self) -> usize {
        self.stem.num_trainable_params()
            + self
                .stages
                .iter()
                .map(|s| s.num_trainable_params())
                .sum::<usize>()
            + self.head.as_ref().map_or(0, Linear::num_params)
    }

    /// Get model summary
    pub fn summary(&self) -> Result<String> {
        let input_shape = self
            .input_shape
            .ok_or_else(|| LayerError::NotBuilt("bresnet1d".to_string()))?;

        let mut s = String::new();
        s.push_str("Model: \"bresnet1d\"\n");
        s.push_str(&format!("{:_<w$}\n", "", w = SUMMARY_WIDTH));
        s.push_str(&summary_row("Layer (type)", "Output Shape", "Param #"));
        s.push_str(&format!("{:=<w$}\n", "", w = SUMMARY_WIDTH));

        let mut shape = input_shape;
        for layer in self
            .stem
            .layers()
            .iter()
            .chain(self.stages.iter().flat_map(|stage| stage.layers().iter()))
        {
            shape = layer.compute_output_shape(shape)?;
            s.push_str(&summary_row(
                &format!("{} ({})", layer.name(), layer.class_name()),
                &shape.to_string(),
                &layer.num_params().to_string(),
            ));
        }

        let batch = match shape.batch {
            Some(b) => b.to_string(),
            None => "None".to_string(),
        };
        s.push_str(&summary_row(
            "global_average_pooling1d (GlobalAveragePooling1D)",
            &format!("({}, {})", batch, shape.channels),
            "0",
        ));
        if let Some(head) = &self.head {
            s.push_str(&summary_row(
                &format!("{} (Dense)", head.name),
                &format!("({}, {})", batch, head.units),
                &head.num_params().to_string(),
            ));
        }

        let total = self.num_params();
        let trainable = self.num_trainable_params();
        s.push_str(&format!("{:=<w$}\n", "", w = SUMMARY_WIDTH));
        s.push_str(&format!("Total params: {}\n", total));
        s.push_str(&format!("Trainable params: {}\n", trainable));
        s.push_str(&format!("Non-trainable params: {}\n", total - trainable));
        s.push_str(&format!("{:_<w$}\n", "", w = SUMMARY_WIDTH));

        Ok(s)
    }
}

fn summary_row(layer: &str, shape: &str, params: &str) -> String {
    format!(" {:<52}{:<20}{:>10}\n", layer, shape, params)
}

/// Mean over the length axis: [batch, length, channels] -> [batch, channels]
pub fn global_average_pool(x: &Array3<f32>) -> Result<Array2<f32>> {
    x.mean_axis(Axis(1)).ok_or_else(|| LayerError::InvalidShape {
        shape: Shape::of(x).to_string(),
        reason: "cannot pool an empty sequence".to_string(),
    })
}

/// Softmax function for probability conversion
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();

    for mut row in probs.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exp_sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();

        for val in row.iter_mut() {
            *val = (*val - max).exp() / exp_sum;
        }
    }

    probs
}
