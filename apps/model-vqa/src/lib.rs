//! Batch visual question answering over one chunk of a question file.

pub mod chunk;
pub mod config;
pub mod driver;
pub mod error;
pub mod prompt;
pub mod record;
pub mod utils;
pub mod writer;

pub use chunk::{get_chunk, split_list, ChunkAssignment};
pub use config::{Args, EvalConfig, FailurePolicy};
pub use driver::{InferenceDriver, ItemOutcome, RunSummary, Stage};
pub use error::{EvalError, EvalResult};

use ai::{llava::LLaVAModel, VisionLanguageModel};
use record::{answered_question_ids, read_questions};
use std::{collections::HashSet, path::Path};
use tracing::info;
use writer::JsonLinesWriter;

/// Loads the LLaVA model described by `config` and answers this process's chunk.
pub fn eval_model(config: &EvalConfig) -> EvalResult<RunSummary> {
    let device = ai::device(config.cpu)?;
    info!(
        "loading {} ({} mode) on {:?}",
        config.model_path, config.mode, device
    );
    let mut model = LLaVAModel::load(&config.load_options(device))?;
    eval_with_model(config, &mut model)
}

pub fn eval_with_model<M: VisionLanguageModel>(
    config: &EvalConfig,
    model: &mut M,
) -> EvalResult<RunSummary> {
    model
        .validate_generation_config(&config.generation)
        .map_err(|e| EvalError::Configuration(format!("{:#}", e)))?;

    let questions = read_questions(&config.question_file)?;
    let chunk = config.chunk.select(&questions);
    info!(
        "chunk {}/{}: {} of {} questions",
        config.chunk.chunk_idx,
        config.chunk.num_chunks,
        chunk.len(),
        questions.len()
    );

    let answered = if config.resume {
        answered_question_ids(&config.answers_file)?
    } else {
        HashSet::new()
    };
    let answers = JsonLinesWriter::create(&config.answers_file, config.resume)?;
    if !config.resume {
        remove_stale_failures(&config.failures_file())?;
    }
    info!("writing answers to {}", answers.path().display());

    InferenceDriver::new(model, config, answers)?.run(chunk, &answered)
}

/// Failures left by an earlier run do not describe the answers file that was just truncated.
fn remove_stale_failures(path: &Path) -> EvalResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("removed failures from a previous run at {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EvalError::io(path, e)),
    }
}
