//! Edge prediction and atrous spatial pyramid pooling blocks.

use candle::{Module, Result, Tensor};
use candle_nn::{Conv2dConfig, VarBuilder};

use super::attention::Rcab;
use crate::models::with_tracing::{conv2d, conv2d_no_bias, Conv2d};

/// Predicts a single-channel edge map from three encoder scales.
///
/// Each scale is squeezed to `mid_fea` channels, refined by a 3x3 conv,
/// resized to the finest scale, concatenated, gated by an [`Rcab`] and
/// classified.
#[derive(Debug, Clone)]
pub struct EdgeModule {
    squeeze: [Conv2d; 3],
    refine: [Conv2d; 3],
    rcab: Rcab,
    classifier: Conv2d,
}

impl EdgeModule {
    pub fn new(in_fea: [usize; 3], mid_fea: usize, vb: VarBuilder) -> Result<Self> {
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let squeeze = [
            conv2d(in_fea[0], mid_fea, 1, Default::default(), vb.pp("conv2"))?,
            conv2d(in_fea[1], mid_fea, 1, Default::default(), vb.pp("conv4"))?,
            conv2d(in_fea[2], mid_fea, 1, Default::default(), vb.pp("conv5"))?,
        ];
        let refine = [
            conv2d(mid_fea, mid_fea, 3, pad1, vb.pp("conv5_2"))?,
            conv2d(mid_fea, mid_fea, 3, pad1, vb.pp("conv5_4"))?,
            conv2d(mid_fea, mid_fea, 3, pad1, vb.pp("conv5_5"))?,
        ];
        let rcab = Rcab::new(mid_fea * 3, vb.pp("rcab"))?;
        let classifier = conv2d(mid_fea * 3, 1, 3, pad1, vb.pp("classifer"))?;
        Ok(Self {
            squeeze,
            refine,
            rcab,
            classifier,
        })
    }

    pub fn forward(&self, x2: &Tensor, x4: &Tensor, x5: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x2.dims4()?;
        let mut edges = Vec::with_capacity(3);
        for (i, xs) in [x2, x4, x5].into_iter().enumerate() {
            let edge = self.squeeze[i].forward(xs)?.relu()?;
            let edge = self.refine[i].forward(&edge)?.relu()?;
            let edge = if i == 0 {
                edge
            } else {
                edge.upsample_bilinear2d(h, w, true)?
            };
            edges.push(edge);
        }
        let edge = Tensor::cat(&edges, 1)?;
        let edge = self.rcab.forward(&edge)?;
        self.classifier.forward(&edge)
    }
}

/// Atrous spatial pyramid pooling with an extra edge-guided branch.
///
/// Output channels: `reduction_dim * (2 + 1 + rates.len())`, ordered as image
/// pooling, edge, 1x1, then one dilated branch per rate.
#[derive(Debug, Clone)]
pub struct Aspp {
    features: Vec<Conv2d>,
    img_conv: Conv2d,
    edge_conv: Conv2d,
}

impl Aspp {
    pub fn new(
        in_dim: usize,
        reduction_dim: usize,
        output_stride: usize,
        rates: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let rates: Vec<usize> = match output_stride {
            8 => rates.iter().map(|r| 2 * r).collect(),
            16 => rates.to_vec(),
            _ => candle::bail!("output stride of {output_stride} not supported"),
        };
        let vb_features = vb.pp("features");
        let mut features = Vec::with_capacity(rates.len() + 1);
        features.push(conv2d_no_bias(
            in_dim,
            reduction_dim,
            1,
            Default::default(),
            vb_features.pp("0").pp("0"),
        )?);
        for (i, &rate) in rates.iter().enumerate() {
            let cfg = Conv2dConfig {
                padding: rate,
                dilation: rate,
                ..Default::default()
            };
            features.push(conv2d_no_bias(
                in_dim,
                reduction_dim,
                3,
                cfg,
                vb_features.pp(i + 1).pp("0"),
            )?);
        }
        let img_conv = conv2d_no_bias(
            in_dim,
            reduction_dim,
            1,
            Default::default(),
            vb.pp("img_conv.0"),
        )?;
        let edge_conv = conv2d_no_bias(
            1,
            reduction_dim,
            1,
            Default::default(),
            vb.pp("edge_conv.0"),
        )?;
        Ok(Self {
            features,
            img_conv,
            edge_conv,
        })
    }

    pub fn forward(&self, xs: &Tensor, edge: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        let img_features = xs.mean_keepdim((2, 3))?;
        let img_features = self.img_conv.forward(&img_features)?.relu()?;
        let img_features = img_features.upsample_bilinear2d(h, w, true)?;

        let edge_features = edge.upsample_bilinear2d(h, w, true)?;
        let edge_features = self.edge_conv.forward(&edge_features)?.relu()?;

        let mut out = vec![img_features, edge_features];
        for f in self.features.iter() {
            out.push(f.forward(xs)?.relu()?);
        }
        Tensor::cat(&out, 1)
    }
}
