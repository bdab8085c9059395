//! A small vision transformer with a query decoder, working on an existing
//! feature map instead of image patches.
use candle::{IndexOp, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::models::with_tracing::{conv2d, layer_norm, linear, linear_b, Conv2d, LayerNorm, Linear};

const LAYER_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VitConfig {
    pub input_dim: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    /// Number of tokens the positional embedding was learned for, a square.
    pub decoder_feat_hw: usize,
}

impl VitConfig {
    /// Grid side of the learned positional embedding.
    pub fn pos_grid(&self) -> Result<usize> {
        let side = (self.decoder_feat_hw as f64).sqrt().round() as usize;
        if side * side != self.decoder_feat_hw {
            candle::bail!(
                "decoder_feat_hw {} is not a square token count",
                self.decoder_feat_hw
            )
        }
        Ok(side)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 || self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            candle::bail!(
                "embed_dim {} is not divisible by {} heads",
                self.embed_dim,
                self.num_heads
            )
        }
        if self.depth == 0 {
            candle::bail!("the vision transformer needs at least one block")
        }
        self.pos_grid()?;
        Ok(())
    }

    fn mlp_hidden(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }
}

fn split_heads(xs: &Tensor, num_heads: usize) -> Result<Tensor> {
    let (b, n, c) = xs.dims3()?;
    xs.reshape((b, n, num_heads, c / num_heads))?
        .transpose(1, 2)?
        .contiguous()
}

#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(dim, hidden, vb.pp("fc1"))?;
        let fc2 = linear(hidden, dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let qkv = linear_b(dim, dim * 3, false, vb.pp("qkv"))?;
        let proj = linear(dim, dim, vb.pp("proj"))?;
        let scale = 1. / ((dim / num_heads) as f64).sqrt();
        Ok(Self {
            qkv,
            proj,
            num_heads,
            scale,
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .permute((2, 0, 3, 1, 4))?;
        let q = (qkv.i(0)?.contiguous()? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        let attn = candle_nn::ops::softmax_last_dim(&q.matmul(&k.t()?)?)?;
        let xs = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&xs)
    }
}

#[derive(Debug, Clone)]
struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let norm1 = layer_norm(dim, LAYER_NORM_EPS, vb.pp("norm1"))?;
        let attn = Attention::new(dim, cfg.num_heads, vb.pp("attn"))?;
        let norm2 = layer_norm(dim, LAYER_NORM_EPS, vb.pp("norm2"))?;
        let mlp = Mlp::new(dim, cfg.mlp_hidden(), vb.pp("mlp"))?;
        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?)?)?;
        let mlp_out = self.mlp.forward(&self.norm2.forward(&xs)?)?;
        xs + mlp_out
    }
}

/// Queries attending to the encoded tokens.
#[derive(Debug, Clone)]
struct QueryAttention {
    fc_q: Linear,
    fc_kv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl QueryAttention {
    fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let fc_q = linear_b(dim, dim, false, vb.pp("fc_q"))?;
        let fc_kv = linear_b(dim, dim * 2, false, vb.pp("fc_kv"))?;
        let proj = linear(dim, dim, vb.pp("proj"))?;
        let scale = 1. / ((dim / num_heads) as f64).sqrt();
        Ok(Self {
            fc_q,
            fc_kv,
            proj,
            num_heads,
            scale,
        })
    }

    /// `query`: `(b, q, c)`, `tokens`: `(b, n, c)`. Returns the attended
    /// queries and the scaled logits as `(b, q, heads, n)`.
    fn forward(&self, query: &Tensor, tokens: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, num_queries, c) = query.dims3()?;
        let q = split_heads(&self.fc_q.forward(query)?, self.num_heads)?;
        let kv = self.fc_kv.forward(tokens)?;
        let k = split_heads(&kv.narrow(D::Minus1, 0, c)?, self.num_heads)?;
        let v = split_heads(&kv.narrow(D::Minus1, c, c)?, self.num_heads)?;

        let logits = (q.matmul(&k.t()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&logits)?;
        let xs = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, num_queries, c))?;
        Ok((self.proj.forward(&xs)?, logits.transpose(1, 2)?.contiguous()?))
    }
}

#[derive(Debug, Clone)]
struct DecoderBlock {
    norm1: LayerNorm,
    norm1_clsembed: LayerNorm,
    attn: QueryAttention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl DecoderBlock {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let norm1 = layer_norm(dim, LAYER_NORM_EPS, vb.pp("norm1"))?;
        let norm1_clsembed = layer_norm(dim, LAYER_NORM_EPS, vb.pp("norm1_clsembed"))?;
        let attn = QueryAttention::new(dim, cfg.num_heads, vb.pp("attn"))?;
        let norm2 = layer_norm(dim, LAYER_NORM_EPS, vb.pp("norm2"))?;
        let mlp = Mlp::new(dim, cfg.mlp_hidden(), vb.pp("mlp"))?;
        Ok(Self {
            norm1,
            norm1_clsembed,
            attn,
            norm2,
            mlp,
        })
    }

    fn forward(&self, query: &Tensor, tokens: &Tensor) -> Result<(Tensor, Tensor)> {
        let (attended, logits) = self.attn.forward(
            &self.norm1_clsembed.forward(query)?,
            &self.norm1.forward(tokens)?,
        )?;
        let query = (query + attended)?;
        let mlp_out = self.mlp.forward(&self.norm2.forward(&query)?)?;
        Ok(((query + mlp_out)?, logits))
    }
}

#[derive(Debug, Clone)]
pub struct VisionTransformer {
    hybrid_embed: Conv2d,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    cls_embed: Tensor,
    decoder: Vec<DecoderBlock>,
    pos_grid: usize,
    span: tracing::Span,
}

impl VisionTransformer {
    pub fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let pos_grid = cfg.pos_grid()?;
        let dim = cfg.embed_dim;
        let hybrid_embed = conv2d(
            cfg.input_dim,
            dim,
            1,
            Default::default(),
            vb.pp("hybrid_embed").pp("proj"),
        )?;
        let trunc = Init::Randn {
            mean: 0.,
            stdev: 0.02,
        };
        let cls_token = vb.get_with_hints((1, 1, dim), "cls_token", trunc)?;
        let pos_embed = vb.get_with_hints((1, 1 + cfg.decoder_feat_hw, dim), "pos_embed", trunc)?;
        let cls_embed = vb.get_with_hints((1, 1, dim), "cls_embed", trunc)?;
        let blocks = (0..cfg.depth)
            .map(|i| Block::new(cfg, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let decoder = (0..cfg.depth)
            .map(|i| DecoderBlock::new(cfg, vb.pp(format!("decoder.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = layer_norm(dim, LAYER_NORM_EPS, vb.pp("norm"))?;
        let span = tracing::span!(tracing::Level::TRACE, "vit");
        Ok(Self {
            hybrid_embed,
            cls_token,
            pos_embed,
            blocks,
            norm,
            cls_embed,
            decoder,
            pos_grid,
            span,
        })
    }

    /// Positional embedding for an `h x w` token grid, class slot first.
    fn pos_embed_for(&self, h: usize, w: usize) -> Result<Tensor> {
        if h == self.pos_grid && w == self.pos_grid {
            return Ok(self.pos_embed.clone());
        }
        let dim = self.pos_embed.dim(D::Minus1)?;
        let cls = self.pos_embed.narrow(1, 0, 1)?;
        let grid = self
            .pos_embed
            .narrow(1, 1, self.pos_grid * self.pos_grid)?
            .reshape((1, self.pos_grid, self.pos_grid, dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?
            .upsample_bilinear2d(h, w, false)?
            .permute((0, 2, 3, 1))?
            .reshape((1, h * w, dim))?;
        Tensor::cat(&[&cls, &grid], 1)
    }

    /// Returns the normalized patch tokens `(b, h*w, c)`, the class token dropped.
    pub fn forward_encoder(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _, h, w) = xs.dims4()?;
        let tokens = self
            .hybrid_embed
            .forward(xs)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let dim = tokens.dim(D::Minus1)?;
        let cls = self.cls_token.broadcast_as((b, 1, dim))?;
        let tokens = Tensor::cat(&[&cls, &tokens], 1)?;
        let mut tokens = tokens.broadcast_add(&self.pos_embed_for(h, w)?)?;
        for block in self.blocks.iter() {
            tokens = block.forward(&tokens)?;
        }
        self.norm.forward(&tokens)?.narrow(1, 1, h * w)?.contiguous()
    }

    /// Pre-softmax attention maps `(b, 1, heads, n)`, one per decoder block.
    pub fn forward_decoder(&self, tokens: &Tensor) -> Result<Vec<Tensor>> {
        let (b, _, dim) = tokens.dims3()?;
        let cls_embed = self.cls_embed.broadcast_as((b, 1, dim))?.contiguous()?;
        let mut query = cls_embed.clone();
        let mut attns = Vec::with_capacity(self.decoder.len());
        for (i, block) in self.decoder.iter().enumerate() {
            if i > 0 {
                query = (query + &cls_embed)?;
            }
            let (next, attn) = block.forward(&query, tokens)?;
            query = next;
            attns.push(attn);
        }
        Ok(attns)
    }

    /// Encoded features as a `(b, c, h, w)` map and the decoder attention maps.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let _enter = self.span.enter();
        let (b, _, h, w) = xs.dims4()?;
        let tokens = self.forward_encoder(xs)?;
        let attns = self.forward_decoder(&tokens)?;
        let dim = tokens.dim(D::Minus1)?;
        let feat = tokens
            .reshape((b, h, w, dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        Ok((feat, attns))
    }
}
