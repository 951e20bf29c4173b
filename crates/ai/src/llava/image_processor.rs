use anyhow::bail;
use candle_core::{DType, Device, Result, Tensor};
use candle_transformers::models::llava::config::LLaVAConfig;
use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `preprocessor_config.json` as written by transformers' `CLIPImageProcessor`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HFPreProcessorConfig {
    #[serde(default)]
    pub crop_size: HashMap<String, usize>,
    #[serde(default = "default_true")]
    pub do_center_crop: bool,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_image_mean")]
    pub image_mean: Vec<f32>,
    #[serde(default = "default_image_std")]
    pub image_std: Vec<f32>,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default)]
    pub size: HashMap<String, f32>,
}

// CLIP-style preprocessing as LLaVA uses it, not a full port of CLIPImageProcessor.
// Resampling is CatmullRom, the closest match to PIL bicubic.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImageProcessor {
    /// shortest edge after resize
    pub size: u32,
    pub do_resize: bool,
    pub do_center_crop: bool,
    /// square crop edge
    pub crop_size: u32,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: Vec<f32>,
    pub image_std: Vec<f32>,
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_image_mean() -> Vec<f32> {
    vec![0.48145466, 0.4578275, 0.40821073]
}

fn default_image_std() -> Vec<f32> {
    vec![0.26862954, 0.2613026, 0.2757771]
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self::clip_vit_large_patch14_336()
    }
}

impl ImageProcessor {
    /// The vision tower every LLaVA 1.5/1.6 checkpoint ships with.
    pub fn clip_vit_large_patch14_336() -> Self {
        Self {
            size: 336,
            do_resize: true,
            do_center_crop: true,
            crop_size: 336,
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: default_image_mean(),
            image_std: default_image_std(),
        }
    }

    pub fn from_hf_preprocessor_config(
        hf_preprocessor_config: &HFPreProcessorConfig,
    ) -> anyhow::Result<Self> {
        let size = match hf_preprocessor_config.size.get("shortest_edge") {
            Some(v) => *v as u32,
            None => bail!("preprocessor config has no size.shortest_edge"),
        };
        let crop_size = match hf_preprocessor_config.crop_size.get("height") {
            Some(v) => *v as u32,
            None => size,
        };
        if hf_preprocessor_config.image_mean.len() != 3 || hf_preprocessor_config.image_std.len() != 3
        {
            bail!("image_mean and image_std must have 3 channels");
        }
        Ok(Self {
            size,
            do_resize: hf_preprocessor_config.do_resize,
            do_center_crop: hf_preprocessor_config.do_center_crop,
            crop_size,
            do_rescale: hf_preprocessor_config.do_rescale,
            rescale_factor: hf_preprocessor_config.rescale_factor,
            do_normalize: hf_preprocessor_config.do_normalize,
            image_mean: hf_preprocessor_config.image_mean.clone(),
            image_std: hf_preprocessor_config.image_std.clone(),
        })
    }

    ///shortest edge to self.size, other edge is resized to maintain aspect ratio
    pub fn resize(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let size = self.size;
        if width == size && height == size {
            image.clone()
        } else {
            let (new_width, new_height) = if width < height {
                (
                    size,
                    (((size * height) as f32) / width as f32).ceil() as u32,
                )
            } else {
                (
                    (((size * width) as f32) / height as f32).ceil() as u32,
                    size,
                )
            };
            image.resize_exact(new_width, new_height, FilterType::CatmullRom)
        }
    }

    pub fn center_crop(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = image.dimensions();
        let crop_size = self.crop_size;
        let (left, top) = calculate_middle((width, height), (crop_size, crop_size));
        image.crop_imm(left, top, crop_size, crop_size)
    }

    pub fn to_tensor(&self, image: &DynamicImage) -> Result<Tensor> {
        let img = image.to_rgb8().into_raw();
        let (width, height) = image.dimensions();
        Tensor::from_vec(img, (height as usize, width as usize, 3), &Device::Cpu)?
            .to_dtype(DType::F32) // only for internal compute
    }

    pub fn rescale(&self, tensor: &Tensor) -> Result<Tensor> {
        tensor.affine(self.rescale_factor as f64, 0.0)
    }

    pub fn normalize(&self, tensor: &Tensor) -> Result<Tensor> {
        let mean = Tensor::from_slice(&self.image_mean, (3,), &Device::Cpu)?;
        let std = Tensor::from_slice(&self.image_std, (3,), &Device::Cpu)?;
        tensor.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    pub fn to_channel_dimension_format(&self, tensor: &Tensor) -> Result<Tensor> {
        tensor.permute((2, 0, 1))
    }

    /// Returns a `(3, crop_size, crop_size)` f32 tensor on the cpu.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let image = if self.do_resize {
            self.resize(image)
        } else {
            image.clone()
        };
        let image = if self.do_center_crop {
            self.center_crop(&image)
        } else {
            image
        };
        let tensor = self.to_tensor(&image)?;
        let tensor = if self.do_rescale {
            self.rescale(&tensor)?
        } else {
            tensor
        };
        let tensor = if self.do_normalize {
            self.normalize(&tensor)?
        } else {
            tensor
        };
        self.to_channel_dimension_format(&tensor)
    }

    fn mean_color(&self) -> Rgb<u8> {
        let channel = |i: usize| (self.image_mean[i] * 255.0) as u8;
        Rgb([channel(0), channel(1), channel(2)])
    }
}

/// Dispatches on `image_aspect_ratio`; the result always has a leading patch dimension.
pub fn process_image(
    image: &DynamicImage,
    processor: &ImageProcessor,
    llava_config: &LLaVAConfig,
) -> anyhow::Result<Tensor> {
    let tensor = match llava_config.image_aspect_ratio.as_str() {
        "square" => processor.preprocess(image)?.unsqueeze(0)?,
        "pad" => {
            let image = expand2square(image, processor.mean_color());
            processor.preprocess(&image)?.unsqueeze(0)?
        }
        "anyres" => process_anyres_image(image, processor, &llava_config.image_grid_pinpoints)?,
        other => bail!("unsupported image aspect ratio: {}", other),
    };
    Ok(tensor)
}

fn process_anyres_image(
    image: &DynamicImage,
    processor: &ImageProcessor,
    grid_pinpoints: &[(u32, u32)],
) -> anyhow::Result<Tensor> {
    let best_resolution = match select_best_resolution(image.dimensions(), grid_pinpoints) {
        Some(v) => v,
        None => bail!("anyres requires image_grid_pinpoints"),
    };
    let image_padded = resize_and_pad_image(image, best_resolution);
    let image_original_resize =
        image.resize_exact(processor.size, processor.size, FilterType::CatmullRom);

    let mut patches = vec![image_original_resize];
    patches.extend(divide_to_patches(&image_padded, processor.crop_size));

    let tensors = patches
        .iter()
        .map(|patch| processor.preprocess(patch))
        .collect::<Result<Vec<Tensor>>>()?;
    Ok(Tensor::stack(&tensors, 0)?)
}

/// Pads to a square canvas filled with `background`, keeping the image centred.
pub fn expand2square(image: &DynamicImage, background: Rgb<u8>) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width == height {
        return image.clone();
    }
    let edge = width.max(height);
    let mut canvas = RgbImage::from_pixel(edge, edge, background);
    let (x, y) = if width > height {
        (0, (width - height) / 2)
    } else {
        ((height - width) / 2, 0)
    };
    image::imageops::overlay(&mut canvas, &image.to_rgb8(), x as i64, y as i64);
    DynamicImage::ImageRgb8(canvas)
}

/// Picks the grid resolution that keeps the most of the original pixels, preferring
/// the least padding on ties.
pub fn select_best_resolution(
    original_size: (u32, u32),
    possible_resolutions: &[(u32, u32)],
) -> Option<(u32, u32)> {
    let (original_width, original_height) = original_size;
    let mut best_fit = None;
    let mut max_effective_resolution = 0;
    let mut min_wasted_resolution = u32::MAX;
    for &(width, height) in possible_resolutions {
        let scale = f64::min(
            width as f64 / original_width as f64,
            height as f64 / original_height as f64,
        );
        let downscaled_width = (original_width as f64 * scale) as u32;
        let downscaled_height = (original_height as f64 * scale) as u32;
        let effective_resolution = u32::min(
            downscaled_width * downscaled_height,
            original_width * original_height,
        );
        let wasted_resolution = width * height - effective_resolution;
        if effective_resolution > max_effective_resolution
            || (effective_resolution == max_effective_resolution
                && wasted_resolution < min_wasted_resolution)
        {
            max_effective_resolution = effective_resolution;
            min_wasted_resolution = wasted_resolution;
            best_fit = Some((width, height));
        }
    }
    best_fit
}

pub fn resize_and_pad_image(image: &DynamicImage, target_resolution: (u32, u32)) -> DynamicImage {
    let (original_width, original_height) = image.dimensions();
    let (target_width, target_height) = target_resolution;
    let scale_w = target_width as f64 / original_width as f64;
    let scale_h = target_height as f64 / original_height as f64;
    let (new_width, new_height) = if scale_w < scale_h {
        (
            target_width,
            u32::min(
                (original_height as f64 * scale_w).ceil() as u32,
                target_height,
            ),
        )
    } else {
        (
            u32::min(
                (original_width as f64 * scale_h).ceil() as u32,
                target_width,
            ),
            target_height,
        )
    };
    let resized = image.resize_exact(new_width, new_height, FilterType::CatmullRom);
    let mut canvas = RgbImage::new(target_width, target_height);
    let (x, y) = ((target_width - new_width) / 2, (target_height - new_height) / 2);
    image::imageops::overlay(&mut canvas, &resized.to_rgb8(), x as i64, y as i64);
    DynamicImage::ImageRgb8(canvas)
}

pub fn divide_to_patches(image: &DynamicImage, patch_size: u32) -> Vec<DynamicImage> {
    let (width, height) = image.dimensions();
    let mut patches = Vec::new();
    for y in (0..height).step_by(patch_size as usize) {
        for x in (0..width).step_by(patch_size as usize) {
            patches.push(image.crop_imm(x, y, patch_size, patch_size));
        }
    }
    patches
}

pub fn calculate_middle(image_size: (u32, u32), center_size: (u32, u32)) -> (u32, u32) {
    let (width, height) = image_size;
    let (center_width, center_height) = center_size;
    let left = if width <= center_width {
        0
    } else {
        ((width as f32 - center_width as f32) / 2.0).ceil() as u32
    };
    let top = if height <= center_height {
        0
    } else {
        ((height as f32 - center_height as f32) / 2.0).ceil() as u32
    };
    (left, top)
}
