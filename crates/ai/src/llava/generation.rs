use crate::traits::GenerationConfig;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::{
    generation::LogitsProcessor,
    models::{llama::Cache, llava::LLaVA},
};
use tracing::debug;

/// Autoregressive decoding over precomputed multimodal input embeddings.
///
/// Returns the sampled ids without the prompt and without the EOS token.
#[tracing::instrument(level = "info", name = "LLaVA::generate", skip_all, fields(max_new_tokens = config.max_new_tokens))]
pub fn generate(
    llava: &LLaVA,
    input_embeds: Tensor,
    cache: &mut Cache,
    eos_token_id: u32,
    config: &GenerationConfig,
    device: &Device,
) -> anyhow::Result<Vec<u32>> {
    let mut logits_processor = LogitsProcessor::from_sampling(
        config.seed.unwrap_or_else(rand::random),
        config.sampling(),
    );

    let mut token_ids = vec![];
    let mut index_pos = 0;
    let mut input_embeds = input_embeds;

    for index in 0..config.max_new_tokens {
        let (_, input_embeds_len, _) = input_embeds.dims3()?;
        let (context_size, context_index) = if cache.use_kv_cache && index > 0 {
            (1, index_pos)
        } else {
            (input_embeds_len, 0)
        };
        let input = input_embeds.i((.., input_embeds_len.saturating_sub(context_size).., ..))?;
        let logits = llava.forward(&input, context_index, cache)?;
        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        let (_, input_len, _) = input.dims3()?;
        index_pos += input_len;

        let next_token = logits_processor.sample(&logits)?;
        if next_token == eos_token_id {
            debug!("eos after {} tokens", token_ids.len());
            break;
        }
        token_ids.push(next_token);

        let next_token_tensor = Tensor::from_vec(vec![next_token], 1, device)?;
        let next_embeds = llava.llama.embed(&next_token_tensor)?.unsqueeze(0)?;
        input_embeds = Tensor::cat(&[input_embeds, next_embeds], 1)?;
    }

    Ok(token_ids)
}
