mod generation;
mod image_processor;
mod loader;
mod tokenizer;

pub use image_processor::{HFPreProcessorConfig, ImageProcessor};
pub use loader::{LLaVALoadOptions, LoadMode, ModelFiles, ModelRepo};
pub use tokenizer::{join_prompt_chunks, tokenizer_image_token};

use crate::{
    device::{effective_dtype, parse_dtype},
    traits::{GenerationConfig, VisionLanguageModel},
};
use anyhow::bail;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{
    clip::vision_model::ClipVisionConfig,
    llama::{self, Cache},
    llava::{
        config::{
            HFGenerationConfig, HFLLaVAConfig, HFPreProcessorConfig as HFLLaVAPreProcessorConfig,
            LLaVAConfig,
        },
        LLaVA,
    },
};
use image::DynamicImage;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// LLaVA (llama language model + CLIP vision tower) running on candle.
pub struct LLaVAModel {
    llava: LLaVA,
    tokenizer: Tokenizer,
    image_processor: ImageProcessor,
    config: LLaVAConfig,
    llama_config: llama::Config,
    device: Device,
    dtype: DType,
}

impl LLaVAModel {
    pub fn load(options: &LLaVALoadOptions) -> anyhow::Result<Self> {
        let files = ModelFiles::resolve(options)?;
        debug!("resolved model files: {:?}", files);

        let hf_preprocessor_config = match &files.preprocessor_config {
            Some(path) => Some(serde_json::from_slice::<HFPreProcessorConfig>(
                &std::fs::read(path)?,
            )?),
            None => None,
        };
        let image_processor = match &hf_preprocessor_config {
            Some(v) => ImageProcessor::from_hf_preprocessor_config(v)?,
            None => ImageProcessor::clip_vit_large_patch14_336(),
        };

        let (config, clip_vision_config) = read_llava_config(&files)?;
        let llama_config = config.to_llama_config();

        let device = options.device.clone();
        let dtype = match options.dtype {
            Some(dtype) => dtype,
            None => parse_dtype(&config.torch_dtype).unwrap_or(DType::F32),
        };
        let dtype = effective_dtype(dtype, &device);

        info!(
            "loading {} weight files as {:?} on {:?}",
            files.weights.len(),
            dtype,
            device
        );
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let llava = LLaVA::load(vb, &config, clip_vision_config)?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(anyhow::Error::msg)?;
        info!(
            "model loaded, image_aspect_ratio={} mm_use_im_start_end={}",
            config.image_aspect_ratio, config.mm_use_im_start_end
        );

        Ok(Self {
            llava,
            tokenizer,
            image_processor,
            config,
            llama_config,
            device,
            dtype,
        })
    }
}

/// Transformers-layout checkpoints (llava-hf) nest the language model config under
/// `text_config` and need the generation and preprocessor configs to be complete.
fn read_llava_config(
    files: &ModelFiles,
) -> anyhow::Result<(LLaVAConfig, Option<ClipVisionConfig>)> {
    let raw = std::fs::read(&files.config)?;
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    if value.get("text_config").is_none() {
        return Ok((serde_json::from_value(value)?, None));
    }

    let hf_config: HFLLaVAConfig = serde_json::from_value(value)?;
    let generation_config: HFGenerationConfig =
        serde_json::from_slice(&std::fs::read(required(&files.generation_config, "generation")?)?)?;
    let preprocessor_config: HFLLaVAPreProcessorConfig = serde_json::from_slice(
        &std::fs::read(required(&files.preprocessor_config, "preprocessor")?)?,
    )?;
    let config = hf_config.to_llava_config(&generation_config, &preprocessor_config);
    Ok((config, Some(hf_config.to_clip_vision_config())))
}

fn required<'a>(path: &'a Option<std::path::PathBuf>, name: &str) -> anyhow::Result<&'a Path> {
    match path {
        Some(path) => Ok(path.as_path()),
        None => bail!("hf llava checkpoint has no {} config", name),
    }
}

impl VisionLanguageModel for LLaVAModel {
    type ImageInput = Tensor;

    fn use_im_start_end(&self) -> bool {
        self.config.mm_use_im_start_end
    }

    fn validate_generation_config(&self, config: &GenerationConfig) -> anyhow::Result<()> {
        if config.num_beams != 1 {
            bail!(
                "num_beams={} is not supported, only single hypothesis decoding is available",
                config.num_beams
            );
        }
        if let Some(top_p) = config.top_p {
            if !(top_p > 0. && top_p <= 1.) {
                bail!("top_p must be in (0, 1], got {}", top_p);
            }
        }
        Ok(())
    }

    fn tokenize_prompt(&self, prompt: &str) -> anyhow::Result<Vec<i64>> {
        tokenizer_image_token(
            prompt,
            &self.tokenizer,
            self.config.bos_token_id as i64,
            self.config.image_token_index as i64,
        )
    }

    fn preprocess_image(&self, image: &DynamicImage) -> anyhow::Result<Tensor> {
        let tensor = image_processor::process_image(image, &self.image_processor, &self.config)?;
        Ok(tensor.to_dtype(self.dtype)?.to_device(&self.device)?)
    }

    fn generate(
        &mut self,
        input_ids: &[i64],
        image: &Tensor,
        image_size: (u32, u32),
        config: &GenerationConfig,
    ) -> anyhow::Result<Vec<u32>> {
        let input_ids = Tensor::from_slice(input_ids, (1, input_ids.len()), &Device::Cpu)?;
        let input_embeds = self.llava.prepare_inputs_labels_for_multimodal(
            &input_ids,
            &[image.clone()],
            &[image_size],
        )?;
        let mut cache = Cache::new(config.use_cache, self.dtype, &self.llama_config, &self.device)?;
        generation::generate(
            &self.llava,
            input_embeds,
            &mut cache,
            self.config.eos_token_id as u32,
            config,
            &self.device,
        )
    }

    fn decode(&self, token_ids: &[u32]) -> anyhow::Result<String> {
        self.tokenizer
            .decode(token_ids, true)
            .map_err(anyhow::Error::msg)
    }
}
