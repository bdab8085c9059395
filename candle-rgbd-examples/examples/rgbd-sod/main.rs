//! RGB-D salient object detection with the Swin/RCAB fusion network.
//!
//! ```bash
//! cargo run --example rgbd-sod --release -- \
//!     --rgb image.jpg --depth depth.png \
//!     --weights swin_rcab_cross.safetensors \
//!     --output saliency.png
//! ```
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anyhow::Result;
use candle::DType;
use candle_nn::VarMap;
use candle_rgbd::models::swin_rcab_cross::{Config, SwinRcabCross};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The RGB input image.
    #[arg(long)]
    rgb: PathBuf,

    /// The depth map matching the RGB image.
    #[arg(long)]
    depth: PathBuf,

    /// Safetensors file(s) holding every model parameter.
    #[arg(long)]
    weights: Vec<PathBuf>,

    /// Backbone checkpoint merged into a randomly initialized model when no
    /// weights are given.
    #[arg(long)]
    pretrain: Option<PathBuf>,

    /// JSON model configuration, Swin-B 384 by default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Side of the square network input, a multiple of 32.
    #[arg(long)]
    size: Option<usize>,

    /// Where to write the finest saliency map.
    #[arg(long, default_value = "saliency.png")]
    output: PathBuf,

    /// Also write the four coarser maps next to the output.
    #[arg(long)]
    all_scales: bool,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

fn scale_path(output: &std::path::Path, index: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("saliency");
    let ext = output
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("png");
    output.with_file_name(format!("{stem}_{index}.{ext}"))
}

pub fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
        None
    };

    let device = candle_rgbd_examples::device(args.cpu)?;
    let mut config = match &args.config {
        Some(path) => serde_json::from_slice::<Config>(&std::fs::read(path)?)?,
        None => Config::swin_b_384(),
    };
    if let Some(size) = args.size {
        config.img_size = size;
    }
    if args.pretrain.is_some() {
        config.pretrain = args.pretrain.clone();
    }
    config.validate()?;
    let size = config.img_size;

    let start = std::time::Instant::now();
    let model = if args.weights.is_empty() {
        if config.pretrain.is_none() {
            println!("no --weights or --pretrain given, running with random parameters");
        }
        let varmap = VarMap::new();
        SwinRcabCross::new_trainable(config, &varmap, DType::F32, &device)?
    } else {
        SwinRcabCross::load(config, &args.weights, DType::F32, &device)?
    };
    println!("loaded the model in {:?}", start.elapsed());

    let (rgb, width, height) = candle_rgbd_examples::load_image(&args.rgb, size, &device)?;
    let (depth, depth_width, depth_height) =
        candle_rgbd_examples::load_image(&args.depth, size, &device)?;
    if (width, height) != (depth_width, depth_height) {
        println!(
            "depth is {depth_width}x{depth_height} while rgb is {width}x{height}, both are resized to {size}x{size}"
        );
    }

    let start = std::time::Instant::now();
    let outputs = model.forward(&rgb, &depth)?;
    println!("ran the model in {:?}", start.elapsed());

    let Some(finest) = outputs.last() else {
        anyhow::bail!("the model returned no predictions")
    };
    candle_rgbd_examples::save_mask(finest, &args.output, width, height)?;
    println!("saliency map written to {}", args.output.display());
    if args.all_scales {
        for (i, output) in outputs.iter().enumerate().take(outputs.len() - 1) {
            let path = scale_path(&args.output, i + 1);
            candle_rgbd_examples::save_mask(output, &path, width, height)?;
            println!("scale {} written to {}", i + 1, path.display());
        }
    }
    Ok(())
}
