use crate::{
    chunk::ChunkAssignment,
    error::{EvalError, EvalResult},
    prompt::resolve_template,
    utils::{expand_home, model_name_from_path},
};
use ai::{
    llava::{LLaVALoadOptions, LoadMode},
    parse_dtype, DType, Device, GenerationConfig, DEFAULT_MAX_NEW_TOKENS,
};
use clap::Parser;
use std::path::PathBuf;
use strum_macros::{Display, EnumString};
use tracing::warn;

/// What to do when one question cannot be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the run with the error.
    Abort,
    /// Write a failure record and go on with the next question.
    #[default]
    Skip,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "model-vqa",
    about = "Answer a chunk of visual questions with a LLaVA-family model"
)]
pub struct Args {
    /// Base language model, a local directory or a hub repository
    #[arg(long)]
    pub model_base: String,

    /// Fine-tuned model, or the directory holding the llava config in pretrained mode
    #[arg(long)]
    pub model_path: String,

    #[arg(long, default_value_t = LoadMode::Finetuned)]
    pub mode: LoadMode,

    /// Projector weights, required in pretrained mode
    #[arg(long)]
    pub projector_path: Option<PathBuf>,

    #[arg(long, default_value = "aya")]
    pub conv_mode: String,

    #[arg(long, default_value = "tables/question.jsonl")]
    pub question_file: PathBuf,

    /// Image paths in the question file are relative to this folder
    #[arg(long)]
    pub image_folder: Option<PathBuf>,

    #[arg(long, default_value = "answer.jsonl")]
    pub answers_file: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub num_chunks: usize,

    #[arg(long, default_value_t = 0)]
    pub chunk_idx: usize,

    #[arg(long, default_value_t = 0.2)]
    pub temperature: f64,

    #[arg(long = "top_p")]
    pub top_p: Option<f64>,

    #[arg(long = "num_beams", default_value_t = 1)]
    pub num_beams: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_NEW_TOKENS)]
    pub max_new_tokens: usize,

    /// Sampling seed, random when unset
    #[arg(long)]
    pub seed: Option<u64>,

    /// Run on cpu even if an accelerator is available
    #[arg(long)]
    pub cpu: bool,

    /// f32, f16 or bf16; defaults to the model's torch_dtype
    #[arg(long)]
    pub dtype: Option<String>,

    #[arg(long, default_value_t = FailurePolicy::Skip)]
    pub on_error: FailurePolicy,

    /// Append to the answers file, skipping questions it already answers
    #[arg(long)]
    pub resume: bool,

    /// Append logs to a per-chunk file in this directory instead of stdout
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Args {
    /// `model-vqa.0-of-4.log`, one file per chunk so parallel processes can share a log dir.
    pub fn log_file_name(&self) -> String {
        format!("model-vqa.{}-of-{}.log", self.chunk_idx, self.num_chunks)
    }
}

/// Validated, immutable settings of one run.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub model_base: String,
    pub model_path: String,
    pub mode: LoadMode,
    pub projector_path: Option<PathBuf>,
    pub model_id: String,
    pub conv_mode: String,
    pub question_file: PathBuf,
    pub image_folder: PathBuf,
    pub answers_file: PathBuf,
    pub chunk: ChunkAssignment,
    pub generation: GenerationConfig,
    pub on_error: FailurePolicy,
    pub resume: bool,
    pub cpu: bool,
    pub dtype: Option<DType>,
}

impl EvalConfig {
    /// Sidecar for failure records, `answer.jsonl` -> `answer.failures.jsonl`.
    pub fn failures_file(&self) -> PathBuf {
        self.answers_file.with_extension("failures.jsonl")
    }

    pub fn load_options(&self, device: Device) -> LLaVALoadOptions {
        LLaVALoadOptions {
            model_base: self.model_base.clone(),
            model_path: self.model_path.clone(),
            projector_path: self.projector_path.clone(),
            mode: self.mode,
            device,
            dtype: self.dtype,
        }
    }
}

impl TryFrom<Args> for EvalConfig {
    type Error = EvalError;

    fn try_from(args: Args) -> EvalResult<Self> {
        let projector_path = match (args.mode, args.projector_path) {
            (LoadMode::Pretrained, None) => {
                return Err(EvalError::Configuration(
                    "pretrained mode requires --projector-path".to_string(),
                ))
            }
            (LoadMode::Pretrained, Some(path)) => Some(expand_home(&path)),
            (LoadMode::Finetuned, Some(path)) => {
                warn!(
                    "ignoring projector {} in finetuned mode",
                    path.display()
                );
                None
            }
            (LoadMode::Finetuned, None) => None,
        };

        resolve_template(&args.conv_mode)?;
        let chunk = ChunkAssignment::new(args.num_chunks, args.chunk_idx)?;

        if !(args.temperature.is_finite() && args.temperature >= 0.) {
            return Err(EvalError::InvalidArgument(format!(
                "temperature must be a non-negative number, got {}",
                args.temperature
            )));
        }
        if args.num_beams == 0 {
            return Err(EvalError::InvalidArgument(
                "num_beams must be at least 1".to_string(),
            ));
        }
        if args.max_new_tokens == 0 {
            return Err(EvalError::InvalidArgument(
                "max_new_tokens must be at least 1".to_string(),
            ));
        }

        let dtype = args
            .dtype
            .as_deref()
            .map(parse_dtype)
            .transpose()
            .map_err(|e| EvalError::Configuration(e.to_string()))?;

        let model_path = expand_home(&PathBuf::from(&args.model_path))
            .to_string_lossy()
            .to_string();

        Ok(Self {
            model_id: model_name_from_path(&model_path),
            model_base: expand_home(&PathBuf::from(&args.model_base))
                .to_string_lossy()
                .to_string(),
            model_path,
            mode: args.mode,
            projector_path,
            conv_mode: args.conv_mode,
            question_file: expand_home(&args.question_file),
            image_folder: expand_home(&args.image_folder.unwrap_or_default()),
            answers_file: expand_home(&args.answers_file),
            chunk,
            generation: GenerationConfig {
                temperature: args.temperature,
                top_p: args.top_p,
                num_beams: args.num_beams,
                max_new_tokens: args.max_new_tokens,
                use_cache: true,
                seed: args.seed,
            },
            on_error: args.on_error,
            resume: args.resume,
            cpu: args.cpu,
            dtype,
        })
    }
}
