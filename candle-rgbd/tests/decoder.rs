use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_rgbd::models::decoder::{
    Decoder, DecoderConfig, DecoderKind, RcabDecoder, TransformerDecoder, VisionTransformer,
    VitConfig,
};
use candle_rgbd::models::swin::SwinConfig;
use candle_rgbd::models::swin_saliency::{self, SwinSaliency};

/// Five maps as a Swin encoder would produce them for a 64x64 image.
fn pyramid(batch: usize, channels: usize, dev: &Device) -> Result<Vec<Tensor>> {
    [16, 8, 4, 2, 2]
        .into_iter()
        .map(|size| Ok(Tensor::randn(0f32, 1., (batch, channels, size, size), dev)?))
        .collect()
}

fn assert_five_maps(outputs: &[Tensor], batch: usize) {
    assert_eq!(outputs.len(), 5);
    for output in outputs.iter() {
        assert_eq!(output.dims(), &[batch, 1, 64, 64]);
    }
}

fn tiny_vit(channels: usize) -> VitConfig {
    VitConfig {
        input_dim: channels,
        embed_dim: channels,
        depth: 2,
        num_heads: 4,
        mlp_ratio: 3.0,
        decoder_feat_hw: 4,
    }
}

#[test]
fn decoder_kind_parsing() -> Result<()> {
    assert_eq!("rcab".parse::<DecoderKind>()?, DecoderKind::Rcab);
    assert_eq!("RCAB".parse::<DecoderKind>()?, DecoderKind::Rcab);
    assert_eq!("trans".parse::<DecoderKind>()?, DecoderKind::Trans);
    assert_eq!("Trans".parse::<DecoderKind>()?, DecoderKind::Trans);
    assert!("unet".parse::<DecoderKind>().is_err());
    assert!("".parse::<DecoderKind>().is_err());
    assert_eq!(DecoderKind::Trans.to_string(), "trans");
    Ok(())
}

#[test]
fn decoder_config_from_json() -> Result<()> {
    let cfg: DecoderConfig = serde_json::from_str(r#"{"decoder": "TRANS", "neck_channel": 32}"#)?;
    assert_eq!(cfg.decoder, DecoderKind::Trans);
    assert_eq!(cfg.vit_config().embed_dim, 32);
    assert_eq!(cfg.vit_config().decoder_feat_hw, 144);
    cfg.validate()?;

    let unknown = serde_json::from_str::<DecoderConfig>(r#"{"decoder": "fpn", "neck_channel": 32}"#);
    assert!(unknown.is_err());
    Ok(())
}

#[test]
fn decoder_config_validation() -> Result<()> {
    let cfg = |decoder, neck_channel| DecoderConfig {
        decoder,
        neck_channel,
    };
    assert!(cfg(DecoderKind::Rcab, 0).validate().is_err());
    assert!(cfg(DecoderKind::Rcab, 4).validate().is_err());
    assert!(cfg(DecoderKind::Rcab, 8).validate().is_ok());
    // Not divisible by the four transformer heads.
    assert!(cfg(DecoderKind::Trans, 18).validate().is_err());
    assert!(cfg(DecoderKind::Trans, 16).validate().is_ok());
    Ok(())
}

#[test]
fn rcab_decoder_returns_five_maps() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let decoder = RcabDecoder::new(16, vb)?;
    let features = pyramid(2, 16, &dev)?;
    assert_five_maps(&decoder.forward(&features)?, 2);
    assert_five_maps(&decoder.forward_t(&features, true)?, 2);

    assert!(decoder.forward(&features[..4]).is_err());
    let wrong_width = pyramid(1, 8, &dev)?;
    assert!(decoder.forward(&wrong_width).is_err());
    Ok(())
}

#[test]
fn vision_transformer_attention_maps() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let cfg = tiny_vit(16);
    let vit = VisionTransformer::new(&cfg, vb)?;

    // Native 2x2 grid, then a resized positional embedding.
    for (h, w) in [(2, 2), (3, 5)] {
        let xs = Tensor::randn(0f32, 1., (2, 16, h, w), &dev)?;
        let (feat, attns) = vit.forward(&xs)?;
        assert_eq!(feat.dims(), &[2, 16, h, w]);
        assert_eq!(attns.len(), cfg.depth);
        for attn in attns.iter() {
            assert_eq!(attn.dims(), &[2, 1, 4, h * w]);
        }
    }
    Ok(())
}

#[test]
fn vit_config_rejects_non_square_grids() {
    let cfg = VitConfig {
        decoder_feat_hw: 12,
        ..tiny_vit(16)
    };
    assert!(cfg.validate().is_err());
    assert_eq!(tiny_vit(16).pos_grid().ok(), Some(2));
}

#[test]
fn transformer_decoder_returns_five_maps() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let decoder = TransformerDecoder::new(&tiny_vit(16), 16, 16, vb)?;
    let features = pyramid(2, 16, &dev)?;
    assert_five_maps(&decoder.forward(&features)?, 2);
    assert!(decoder.forward(&features[1..]).is_err());
    {
        let data = varmap.data().lock().unwrap();
        for name in [
            "transformer.vit.hybrid_embed.proj.weight",
            "transformer.vit.cls_token",
            "transformer.vit.pos_embed",
            "transformer.vit.cls_embed",
            "transformer.vit.blocks.1.attn.qkv.weight",
            "transformer.vit.decoder.0.attn.fc_kv.weight",
            "transformer.vit.decoder.1.norm1_clsembed.weight",
            "lay5.block.depthwise.weight",
            "lay4.block.bn_point.running_mean",
            "decoder.racb_3.body.2.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    let mismatched = TransformerDecoder::new(&tiny_vit(16), 16, 8, VarBuilder::zeros(DType::F32, &dev));
    assert!(mismatched.is_err());
    Ok(())
}

#[test]
fn factory_builds_both_kinds() -> Result<()> {
    let dev = Device::Cpu;
    let vb = VarBuilder::zeros(DType::F32, &dev);
    let features = pyramid(1, 16, &dev)?;
    for kind in [DecoderKind::Rcab, DecoderKind::Trans] {
        let cfg = DecoderConfig {
            decoder: kind,
            neck_channel: 16,
        };
        let decoder = Decoder::new(&cfg, vb.pp(kind.as_str()))?;
        assert_eq!(decoder.kind(), kind);
        assert_five_maps(&decoder.forward(&features)?, 1);
    }
    let bad = DecoderConfig {
        decoder: DecoderKind::Trans,
        neck_channel: 6,
    };
    assert!(Decoder::new(&bad, vb).is_err());
    Ok(())
}

#[test]
fn swin_saliency_end_to_end() -> Result<()> {
    let dev = Device::Cpu;
    let encoder = SwinConfig {
        embed_dim: 16,
        depths: vec![2, 2, 2, 2],
        num_heads: vec![1, 2, 4, 8],
        window_size: 4,
        ..SwinConfig::base_384()
    };
    for kind in [DecoderKind::Rcab, DecoderKind::Trans] {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = swin_saliency::Config {
            img_size: 64,
            encoder: encoder.clone(),
            decoder: DecoderConfig {
                decoder: kind,
                neck_channel: 16,
            },
        };
        let model = SwinSaliency::new(&cfg, vb)?;
        assert_eq!(model.decoder().kind(), kind);
        let xs = Tensor::randn(0f32, 1., (1, 3, 64, 64), &dev)?;
        assert_five_maps(&model.forward(&xs)?, 1);
    }
    Ok(())
}
