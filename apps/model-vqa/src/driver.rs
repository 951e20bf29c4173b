use crate::{
    config::{EvalConfig, FailurePolicy},
    error::{EvalError, EvalResult},
    prompt::{Prompt, PromptBuilder},
    record::{question_key, AnswerRecord, FailureRecord, QuestionRecord},
    utils::short_uuid,
    writer::JsonLinesWriter,
};
use ai::{
    image::{DynamicImage, ImageReader},
    VisionLanguageModel,
};
use std::{collections::HashSet, path::Path};
use strum_macros::Display;
use tracing::{debug, error, info};

/// Step of one question that an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Preprocess,
    Generate,
    Serialize,
}

#[derive(Debug)]
pub enum ItemOutcome {
    Answered(AnswerRecord),
    Failed { stage: Stage, error: EvalError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub answered: usize,
    pub skipped: usize,
    /// already in the answers file when the run started
    pub resumed: usize,
}

/// Answers questions one at a time and streams the records to the answers file.
pub struct InferenceDriver<'a, M: VisionLanguageModel> {
    model: &'a mut M,
    config: &'a EvalConfig,
    prompt_builder: PromptBuilder,
    answers: JsonLinesWriter,
    failures: Option<JsonLinesWriter>,
}

impl<'a, M: VisionLanguageModel> InferenceDriver<'a, M> {
    pub fn new(
        model: &'a mut M,
        config: &'a EvalConfig,
        answers: JsonLinesWriter,
    ) -> EvalResult<Self> {
        let prompt_builder = PromptBuilder::new(&config.conv_mode, model.use_im_start_end())?;
        Ok(Self {
            model,
            config,
            prompt_builder,
            answers,
            failures: None,
        })
    }

    /// Questions whose key is in `answered` are not asked again.
    pub fn run(
        mut self,
        questions: &[QuestionRecord],
        answered: &HashSet<String>,
    ) -> EvalResult<RunSummary> {
        let mut summary = RunSummary::default();

        for question in questions {
            if answered.contains(&question_key(&question.question_id)) {
                debug!("question {} already answered", question.question_id);
                summary.resumed += 1;
                continue;
            }

            match self.process(question) {
                ItemOutcome::Answered(_) => summary.answered += 1,
                ItemOutcome::Failed { stage, error } => match self.config.on_error {
                    FailurePolicy::Abort => return Err(error),
                    FailurePolicy::Skip => {
                        error!(
                            "question {} failed during {}: {}",
                            question.question_id, stage, error
                        );
                        self.record_failure(question, stage, &error)?;
                        summary.skipped += 1;
                    }
                },
            }
        }

        self.answers.close()?;
        if let Some(failures) = self.failures {
            failures.close()?;
        }
        info!(
            "done: {} answered, {} skipped, {} already answered",
            summary.answered, summary.skipped, summary.resumed
        );
        Ok(summary)
    }

    pub fn process(&mut self, question: &QuestionRecord) -> ItemOutcome {
        let prompt = self.prompt_builder.build(&question.text);
        debug!("prompt: {:?}", prompt.rendered);

        let (input_ids, image_input, image_size) = match self.preprocess(question, &prompt) {
            Ok(v) => v,
            Err(error) => {
                return ItemOutcome::Failed {
                    stage: Stage::Preprocess,
                    error,
                }
            }
        };

        let output_ids = match self.model.generate(
            &input_ids,
            &image_input,
            image_size,
            &self.config.generation,
        ) {
            Ok(v) => v,
            Err(e) => {
                return ItemOutcome::Failed {
                    stage: Stage::Generate,
                    error: e.into(),
                }
            }
        };

        match self.serialize(question, &output_ids) {
            Ok(record) => ItemOutcome::Answered(record),
            Err(error) => ItemOutcome::Failed {
                stage: Stage::Serialize,
                error,
            },
        }
    }

    fn preprocess(
        &self,
        question: &QuestionRecord,
        prompt: &Prompt,
    ) -> EvalResult<(Vec<i64>, M::ImageInput, (u32, u32))> {
        let image = read_image(&self.config.image_folder.join(&question.image))?;
        let image_size = (image.width(), image.height());
        let input_ids = self.model.tokenize_prompt(&prompt.rendered)?;
        let image_input = self.model.preprocess_image(&image)?;
        Ok((input_ids, image_input, image_size))
    }

    fn serialize(
        &mut self,
        question: &QuestionRecord,
        output_ids: &[u32],
    ) -> EvalResult<AnswerRecord> {
        let output = self.model.decode(output_ids)?;
        let output = output.trim();
        info!(
            "question_id={} Q: {} A: {}",
            question.question_id, question.text, output
        );

        let record = AnswerRecord {
            question_id: question.question_id.clone(),
            prompt: question.text.clone(),
            text: output.to_string(),
            answer_id: short_uuid(),
            model_id: self.config.model_id.clone(),
            metadata: Default::default(),
        };
        self.answers.write(&record)?;
        Ok(record)
    }

    fn record_failure(
        &mut self,
        question: &QuestionRecord,
        stage: Stage,
        error: &EvalError,
    ) -> EvalResult<()> {
        let failures = match self.failures.take() {
            Some(writer) => writer,
            None => JsonLinesWriter::create(self.config.failures_file(), self.config.resume)?,
        };
        let failures = self.failures.insert(failures);
        failures.write(&FailureRecord {
            question_id: question.question_id.clone(),
            image: question.image.clone(),
            stage: stage.to_string(),
            error: error.to_string(),
        })
    }
}

/// Decodes by content rather than extension and converts to RGB.
pub fn read_image(path: &Path) -> EvalResult<DynamicImage> {
    let image = ImageReader::open(path)
        .map_err(|e| EvalError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| EvalError::io(path, e))?
        .decode()
        .map_err(|source| EvalError::Image {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}
