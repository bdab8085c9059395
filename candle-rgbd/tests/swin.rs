use anyhow::Result;
use candle::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_rgbd::models::swin::{SwinConfig, SwinEncoder};

fn tiny() -> SwinConfig {
    SwinConfig {
        embed_dim: 8,
        depths: vec![2, 2, 2, 2],
        num_heads: vec![1, 2, 2, 4],
        window_size: 4,
        ..SwinConfig::tiny_224()
    }
}

#[test]
fn pyramid_widths_and_strides() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let cfg = tiny();
    let encoder = SwinEncoder::new(&cfg, 64, vb)?;
    let xs = Tensor::randn(0f32, 1., (2, 3, 64, 64), &dev)?;
    let features = encoder.forward_features(&xs)?;
    let dims: Vec<Vec<usize>> = features.iter().map(|f| f.dims().to_vec()).collect();
    assert_eq!(
        dims,
        [
            vec![2, 8, 16, 16],
            vec![2, 16, 8, 8],
            vec![2, 32, 4, 4],
            vec![2, 64, 2, 2],
            vec![2, 64, 2, 2],
        ]
    );
    assert_eq!(cfg.feature_channels(), vec![8, 16, 32, 64, 64]);
    assert_eq!(cfg.max_stride(), 32);
    assert_eq!(encoder.forward(&xs)?.dims(), &[2, 64, 2, 2]);
    Ok(())
}

#[test]
fn inputs_off_the_nominal_size_are_padded() -> Result<()> {
    let dev = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &dev);
    let encoder = SwinEncoder::new(&tiny(), 64, vb)?;
    // 96x80 gives token grids that are not multiples of the window size.
    let xs = Tensor::zeros((1, 3, 96, 80), DType::F32, &dev)?;
    let features = encoder.forward_features(&xs)?;
    assert_eq!(features[0].dims(), &[1, 8, 24, 20]);
    assert_eq!(features[4].dims(), &[1, 64, 3, 3]);
    Ok(())
}

#[test]
fn checkpoint_layout() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    SwinEncoder::new(&tiny(), 64, vb)?;
    let data = varmap.data().lock().unwrap();
    assert_eq!(
        data["layers.0.blocks.1.attn.relative_position_bias_table"].dims(),
        &[49, 1]
    );
    // The last stage sees a 2x2 grid, its windows shrink accordingly.
    assert_eq!(
        data["layers.3.blocks.0.attn.relative_position_bias_table"].dims(),
        &[9, 4]
    );
    assert_eq!(data["layers.1.downsample.reduction.weight"].dims(), &[32, 64]);
    assert_eq!(data["layers.1.downsample.norm.weight"].dims(), &[64]);
    assert!(!data.contains_key("layers.3.downsample.reduction.weight"));
    assert_eq!(data["norm.weight"].dims(), &[64]);
    Ok(())
}

#[test]
fn config_validation() {
    assert!(SwinConfig::base_384().validate().is_ok());
    assert!(SwinConfig::tiny_224().validate().is_ok());
    let uneven = SwinConfig {
        num_heads: vec![3, 2, 2, 4],
        ..tiny()
    };
    assert!(uneven.validate().is_err());
    let mismatched = SwinConfig {
        depths: vec![2, 2],
        ..tiny()
    };
    assert!(mismatched.validate().is_err());
}
