use candle::{DType, Device, Result, Tensor};
use image::{DynamicImage, ImageBuffer};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Loads an image as a `(1, 3, size, size)` tensor normalized with the
/// ImageNet statistics. Single-channel depth maps are replicated over the
/// three channels. Returns the original width and height too.
pub fn load_image<P: AsRef<std::path::Path>>(
    path: P,
    size: usize,
    device: &Device,
) -> Result<(Tensor, u32, u32)> {
    let img = image::ImageReader::open(path)?
        .decode()
        .map_err(candle::Error::wrap)?;
    let (width, height) = (img.width(), img.height());
    let img = img
        .resize_exact(
            size as u32,
            size as u32,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();
    let data: Vec<f32> = img
        .pixels()
        .flat_map(|p| {
            p.0.iter()
                .enumerate()
                .map(|(c, &v)| (v as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c])
        })
        .collect();
    let tensor = Tensor::from_vec(data, (size, size, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?;
    Ok((tensor, width, height))
}

/// Saves a `(1, 1, h, w)` logit map as a grayscale mask resized to `width x height`.
pub fn save_mask<P: AsRef<std::path::Path>>(
    logits: &Tensor,
    path: P,
    width: u32,
    height: u32,
) -> Result<()> {
    let (_, _, h, w) = logits.dims4()?;
    let mask = candle_nn::ops::sigmoid(logits)?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?;
    let pixels = (mask * 255.)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .to_vec1::<u8>()?;
    let Some(buffer) = ImageBuffer::<image::Luma<u8>, Vec<u8>>::from_raw(w as u32, h as u32, pixels)
    else {
        candle::bail!("mask buffer does not match {w}x{h}")
    };
    DynamicImage::ImageLuma8(buffer)
        .resize_exact(width, height, image::imageops::FilterType::Triangle)
        .save(path)
        .map_err(candle::Error::wrap)?;
    Ok(())
}
