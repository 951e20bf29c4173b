mod generation;

pub use generation::*;

use image::DynamicImage;

/// A loaded multimodal model together with its tokenizer and image preprocessor.
///
/// Calls follow the order of one question: `tokenize_prompt` and
/// `preprocess_image`, then `generate`, then `decode`.
pub trait VisionLanguageModel {
    /// Preprocessed image in whatever layout `generate` consumes.
    type ImageInput;

    /// Whether the image placeholder must be wrapped in `<im_start>`/`<im_end>`.
    fn use_im_start_end(&self) -> bool;

    /// Rejects options the backend cannot honour, before any item is processed.
    fn validate_generation_config(&self, _config: &GenerationConfig) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tokenizes a rendered prompt, putting the image sentinel id in place of every
    /// `<image>` placeholder.
    fn tokenize_prompt(&self, prompt: &str) -> anyhow::Result<Vec<i64>>;

    fn preprocess_image(&self, image: &DynamicImage) -> anyhow::Result<Self::ImageInput>;

    /// Returns the generated token ids, prompt excluded.
    fn generate(
        &mut self,
        input_ids: &[i64],
        image: &Self::ImageInput,
        image_size: (u32, u32),
        config: &GenerationConfig,
    ) -> anyhow::Result<Vec<u32>>;

    /// Decodes generated ids, skipping special tokens.
    fn decode(&self, token_ids: &[u32]) -> anyhow::Result<String>;
}
