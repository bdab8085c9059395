use anyhow::Result;
use candle::{test_utils, DType, Device, Module, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_rgbd::models::layers::{
    instance_norm, upsample, Aspp, BasicConv2d, CaLayer, Classifier, Drb, EcaLayer, EdgeModule,
    FusionStage, NormKind, Rcab, RcabConfig, ResidualBlock, ResidualStage, SeparableConv2d,
    PREDICTION_DILATIONS, PROJECTION_DILATIONS,
};

fn randn(shape: &[usize], dev: &Device) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1., shape, dev)?)
}

#[test]
fn classifier_sums_its_branches() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let classifier = Classifier::with_dilations(&[1, 2, 3], 4, 6, vb)?;
    assert_eq!(classifier.branches().len(), 3);

    let xs = randn(&[2, 6, 9, 9], &dev)?;
    let ys = classifier.forward(&xs)?;
    assert_eq!(ys.dims(), &[2, 4, 9, 9]);

    // Rebuild each dilated branch as a plain convolution from its weights.
    let mut expected = Tensor::zeros((2, 4, 9, 9), DType::F32, &dev)?;
    for (branch, dilation) in classifier.branches().iter().zip([1, 2, 3]) {
        let cfg = candle_nn::Conv2dConfig {
            padding: dilation,
            dilation,
            ..Default::default()
        };
        let conv = candle_nn::Conv2d::new(
            branch.weight().clone(),
            branch.bias().cloned(),
            cfg,
        );
        assert!(branch.bias().is_some());
        expected = (expected + conv.forward(&xs)?)?;
    }
    assert_eq!(
        test_utils::to_vec1_round(&ys.flatten_all()?, 4)?,
        test_utils::to_vec1_round(&expected.flatten_all()?, 4)?
    );
    Ok(())
}

#[test]
fn classifier_keeps_spatial_size_for_every_preset() -> Result<()> {
    let dev = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &dev);
    let xs = randn(&[1, 8, 5, 7], &dev)?;
    let project = Classifier::with_dilations(&PROJECTION_DILATIONS, 16, 8, vb.pp("project"))?;
    assert_eq!(project.forward(&xs)?.dims(), &[1, 16, 5, 7]);
    let predict = Classifier::with_dilations(&PREDICTION_DILATIONS, 1, 8, vb.pp("predict"))?;
    assert_eq!(predict.forward(&xs)?.dims(), &[1, 1, 5, 7]);
    Ok(())
}

#[test]
fn classifier_rejects_bad_dilation_lists() -> Result<()> {
    let dev = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &dev);
    assert!(Classifier::new(&[], &[], 1, 4, vb.clone()).is_err());
    assert!(Classifier::new(&[1, 2], &[1], 1, 4, vb).is_err());
    Ok(())
}

#[test]
fn channel_attention_preserves_shape() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    for (channels, h, w) in [(16, 3, 5), (32, 8, 8), (48, 1, 1)] {
        let xs = randn(&[2, channels, h, w], &dev)?;
        let ca = CaLayer::new(channels, 16, vb.pp(format!("ca{channels}")))?;
        assert_eq!(ca.forward(&xs)?.dims(), &[2, channels, h, w]);
        let eca = EcaLayer::new(channels, 3, vb.pp(format!("eca{channels}")))?;
        assert_eq!(eca.forward(&xs)?.dims(), &[2, channels, h, w]);
        let rcab = Rcab::new(channels, vb.pp(format!("rcab{channels}")))?;
        assert_eq!(rcab.forward(&xs)?.dims(), &[2, channels, h, w]);
    }
    Ok(())
}

#[test]
fn channel_attention_with_zero_weights_halves_the_input() -> Result<()> {
    // Zero convs give a gate of sigmoid(0) = 0.5 everywhere.
    let dev = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &dev);
    let ca = CaLayer::new(16, 16, vb.pp("ca"))?;
    let eca = EcaLayer::new(16, 5, vb.pp("eca"))?;
    let xs = Tensor::ones((1, 16, 2, 2), DType::F32, &dev)?;
    let expected = vec![0.5f32; 64];
    assert_eq!(test_utils::to_vec1_round(&ca.forward(&xs)?.flatten_all()?, 4)?, expected);
    assert_eq!(test_utils::to_vec1_round(&eca.forward(&xs)?.flatten_all()?, 4)?, expected);
    Ok(())
}

#[test]
fn rcab_with_zero_body_is_identity() -> Result<()> {
    let dev = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &dev);
    let rcab = Rcab::new_with_config(
        32,
        RcabConfig {
            bias: false,
            ..Default::default()
        },
        vb,
    )?;
    let xs = randn(&[1, 32, 4, 4], &dev)?;
    let ys = rcab.forward(&xs)?;
    assert_eq!(
        test_utils::to_vec1_round(&ys.flatten_all()?, 4)?,
        test_utils::to_vec1_round(&xs.flatten_all()?, 4)?
    );
    Ok(())
}

#[test]
fn attention_rejects_bad_settings() -> Result<()> {
    let dev = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &dev);
    assert!(CaLayer::new(8, 16, vb.clone()).is_err());
    assert!(CaLayer::new(8, 0, vb.clone()).is_err());
    assert!(EcaLayer::new(8, 4, vb).is_err());
    Ok(())
}

#[test]
fn residual_block_strides_and_norms() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let xs = randn(&[2, 16, 8, 8], &dev)?;
    for (i, norm) in [NormKind::Group, NormKind::Batch, NormKind::Instance, NormKind::None]
        .into_iter()
        .enumerate()
    {
        let block = ResidualBlock::new(16, 32, norm, 2, vb.pp(format!("down{i}")))?;
        assert_eq!(block.forward_t(&xs, false)?.dims(), &[2, 32, 4, 4]);
        let block = ResidualBlock::new(16, 16, norm, 1, vb.pp(format!("same{i}")))?;
        let ys = block.forward_t(&xs, true)?;
        assert_eq!(ys.dims(), &[2, 16, 8, 8]);
        // Final ReLU.
        assert!(ys.flatten_all()?.min(0)?.to_scalar::<f32>()? >= 0.);
    }
    let stage = ResidualStage::new(16, 32, NormKind::Batch, 2, vb.pp("stage"))?;
    assert_eq!(stage.forward_t(&xs, false)?.dims(), &[2, 32, 4, 4]);
    Ok(())
}

#[test]
fn residual_block_parameter_names() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    ResidualStage::new(8, 16, NormKind::Batch, 2, vb.pp("depth_layer2"))?;
    let data = varmap.data().lock().unwrap();
    for name in [
        "depth_layer2.0.conv1.weight",
        "depth_layer2.0.norm1.running_mean",
        "depth_layer2.0.downsample.0.weight",
        "depth_layer2.0.downsample.1.running_var",
        "depth_layer2.1.conv2.bias",
    ] {
        assert!(data.contains_key(name), "missing {name}");
    }
    assert!(!data.contains_key("depth_layer2.1.downsample.0.weight"));
    Ok(())
}

#[test]
fn instance_norm_centers_each_plane() -> Result<()> {
    let dev = Device::Cpu;
    let xs = Tensor::new(&[1f32, 2., 3., 4., 10., 10., 10., 10.], &dev)?.reshape((1, 2, 2, 2))?;
    let ys = instance_norm(&xs, 1e-5)?;
    let means = ys.mean_keepdim((2, 3))?.flatten_all()?;
    assert_eq!(test_utils::to_vec1_round(&means, 4)?, [0., 0.]);
    assert_eq!(
        test_utils::to_vec1_round(&ys.flatten_all()?, 3)?,
        [-1.342, -0.447, 0.447, 1.342, 0., 0., 0., 0.]
    );
    Ok(())
}

#[test]
fn drb_preserves_shape() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let drb = Drb::new(32, vb)?;
    let img = randn(&[2, 32, 6, 6], &dev)?;
    let depth = randn(&[2, 32, 6, 6], &dev)?;
    assert_eq!(drb.forward(&img, &depth)?.dims(), &[2, 32, 6, 6]);
    assert_eq!(drb.forward_t(&img, &depth, true)?.dims(), &[2, 32, 6, 6]);
    Ok(())
}

#[test]
fn separable_conv_and_basic_conv() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let xs = randn(&[1, 20, 6, 6], &dev)?;
    let sep = SeparableConv2d::new(20, 16, 3, 1, false, vb.pp("sep"))?;
    let ys = sep.forward_t(&xs, false)?;
    assert_eq!(ys.dims(), &[1, 16, 6, 6]);
    assert!(ys.flatten_all()?.min(0)?.to_scalar::<f32>()? >= 0.);
    let sep = SeparableConv2d::new(20, 16, 3, 2, true, vb.pp("sep_dilated"))?;
    assert_eq!(sep.forward_t(&xs, false)?.dims(), &[1, 16, 6, 6]);
    let basic = BasicConv2d::pointwise(20, 8, vb.pp("reformat"))?;
    assert_eq!(basic.forward_t(&xs, false)?.dims(), &[1, 8, 6, 6]);
    Ok(())
}

#[test]
fn fusion_stage_predicts_and_carries() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let fused = randn(&[1, 32, 2, 3], &dev)?;
    let stage = FusionStage::new(32, Some(16), 8, vb.pp("racb"), vb.pp("pred"), vb.pp("re"))?;
    let (prediction, carried) = stage.forward_t(&fused, false)?;
    assert_eq!(prediction.dims(), &[1, 1, 16, 24]);
    assert_eq!(carried.map(|c| c.dims().to_vec()), Some(vec![1, 16, 2, 3]));

    let last = FusionStage::new(32, None, 4, vb.pp("racb_l"), vb.pp("pred_l"), vb.pp("re_l"))?;
    let (prediction, carried) = last.forward_t(&fused, false)?;
    assert_eq!(prediction.dims(), &[1, 1, 8, 12]);
    assert!(carried.is_none());
    Ok(())
}

#[test]
fn upsample_aligns_corners() -> Result<()> {
    let dev = Device::Cpu;
    let xs = Tensor::new(&[0f32, 3.], &dev)?.reshape((1, 1, 1, 2))?;
    let ys = upsample(&xs, 2)?;
    assert_eq!(ys.dims(), &[1, 1, 2, 4]);
    assert_eq!(
        test_utils::to_vec1_round(&ys.flatten_all()?, 4)?,
        [0., 1., 2., 3., 0., 1., 2., 3.]
    );
    Ok(())
}

#[test]
fn edge_module_and_aspp() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let x2 = randn(&[1, 16, 16, 16], &dev)?;
    let x4 = randn(&[1, 64, 4, 4], &dev)?;
    let x5 = randn(&[1, 64, 2, 2], &dev)?;
    let edge_module = EdgeModule::new([16, 64, 64], 32, vb.pp("edge"))?;
    let edge = edge_module.forward(&x2, &x4, &x5)?;
    assert_eq!(edge.dims(), &[1, 1, 16, 16]);

    let aspp = Aspp::new(64, 8, 16, &[6, 12, 18], vb.pp("aspp"))?;
    assert_eq!(aspp.forward(&x4, &edge)?.dims(), &[1, 48, 4, 4]);
    let aspp = Aspp::new(64, 8, 8, &[6, 12, 18], vb.pp("aspp8"))?;
    assert_eq!(aspp.forward(&x4, &edge)?.dims(), &[1, 48, 4, 4]);
    assert!(Aspp::new(64, 8, 32, &[6, 12, 18], vb.pp("aspp32")).is_err());
    Ok(())
}
