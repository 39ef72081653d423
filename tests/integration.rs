//! Integration tests for the BResNet-1D library

use bresnet1d::model::{BatchNorm1d, Conv1d, Padding, Sequential};
use bresnet1d::{BResNet1D, BResNetConfig, BottleneckResidual1D, Layer, LayerError, Shape};
use ndarray::Array3;

fn setup() {
    bresnet1d::utils::init_logging("warn");
}

fn ramp(shape: (usize, usize, usize)) -> Array3<f32> {
    Array3::from_shape_fn(shape, |(b, l, c)| ((b * 7 + l * 3 + c) as f32 * 0.37).sin())
}

/// Build the full network the way the demo does and render the summary
#[test]
fn test_bresnet161_build_and_summary() {
    setup();
    let mut model = BResNet1D::new(BResNetConfig::bresnet161()).unwrap();
    model.build(Shape::new(None, 128, 32)).unwrap();

    assert!(model.is_built());
    assert_eq!(model.output_shape(Shape::new(None, 128, 32)).unwrap(), (None, 2048));
    assert_eq!(model.stages().iter().map(|s| s.len()).sum::<usize>(), 53);

    let summary = model.summary().unwrap();
    assert!(summary.contains("stage3_block36 (BottleneckResidual1D)"));
    assert!(summary.contains("(None, 4, 2048)"));
    assert!(model.num_trainable_params() < model.num_params());
}

#[test]
fn test_bresnet50_forward_matches_output_shape() {
    setup();
    let mut model = BResNet1D::new(BResNetConfig::bresnet50().with_classes(3)).unwrap();
    let input = ramp((2, 64, 8));
    let output = model.call(&input).unwrap();

    let (batch, units) = model.output_shape(Shape::of(&input)).unwrap();
    assert_eq!(output.dim(), (batch.unwrap(), units));
    assert!(output.iter().all(|v| v.is_finite()));
}

/// The block is usable wherever a layer is expected
#[test]
fn test_block_inside_sequential() {
    setup();
    let mut stack = Sequential::new("stack")
        .with(
            Conv1d::new(8, 3, 1, Padding::Same, true)
                .unwrap()
                .with_name("entry_conv"),
        )
        .with(BatchNorm1d::new())
        .with(BottleneckResidual1D::new(2, &[2]).unwrap().with_name("block_a"))
        .with(BottleneckResidual1D::new(2, &[1]).unwrap().with_name("block_b"));

    let input = ramp((3, 15, 4));
    let output = stack.call(&input).unwrap();

    assert_eq!(output.shape(), &[3, 8, 8]);
    assert_eq!(
        stack.compute_output_shape(Shape::of(&input)).unwrap(),
        Shape::of(&output)
    );
    assert!(stack.layers().iter().all(|l| l.is_built()));

    let config = stack.get_config();
    let layers = config["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 4);
    assert_eq!(layers[2]["class_name"], "BottleneckResidual1D");
    assert_eq!(layers[2]["config"]["strides"], serde_json::json!([2]));
}

#[test]
fn test_block_output_shape_property() {
    setup();
    for &(filters, stride, length, channels) in &[
        (1, 1, 1, 3),
        (2, 2, 7, 1),
        (4, 3, 10, 16),
        (3, 1, 5, 12),
    ] {
        let mut block = BottleneckResidual1D::new(filters, &[stride]).unwrap();
        let input = ramp((2, length, channels));
        let output = block.call(&input).unwrap();

        assert!(block.is_built());
        assert_eq!(output.dim().2, filters * 4);
        assert_eq!(
            block.compute_output_shape(Shape::of(&input)).unwrap(),
            Shape::of(&output)
        );
    }
}

#[test]
fn test_block_config_round_trip_rebuilds() {
    let mut original = BottleneckResidual1D::new(3, &[2]).unwrap().with_name("blk");
    original.build(Shape::new(None, 9, 5)).unwrap();

    let json = serde_json::to_string(&original.get_config()).unwrap();
    let config: bresnet1d::LayerConfig = serde_json::from_str(&json).unwrap();
    let mut copy = BottleneckResidual1D::from_config(&config).unwrap();

    assert!(!copy.is_built());
    copy.build(Shape::new(None, 9, 5)).unwrap();
    assert_eq!(copy.num_params(), original.num_params());
    assert_eq!(copy.name(), "blk");
}

#[test]
fn test_invalid_block_arguments() {
    assert!(matches!(
        BottleneckResidual1D::new(0, &[1]),
        Err(LayerError::InvalidFilters(0))
    ));
    assert!(matches!(
        BottleneckResidual1D::new(1, &[1, 1]),
        Err(LayerError::InvalidStrides { .. })
    ));
}

#[test]
fn test_training_mode_changes_statistics() {
    setup();
    let mut model = BResNet1D::new(BResNetConfig::tiny()).unwrap();
    let input = ramp((4, 32, 3)).mapv(|v| v * 10.0 + 5.0);
    let inference = model.call(&input).unwrap();

    model.set_training(true);
    let training = model.forward(&input).unwrap();
    assert_eq!(inference.dim(), training.dim());
    assert_ne!(inference, training);

    model.set_training(false);
    assert_eq!(model.forward(&input).unwrap(), inference);
}
