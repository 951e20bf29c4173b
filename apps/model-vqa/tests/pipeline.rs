//! End-to-end runs of the question pipeline against an in-memory model.
//!
//! Images are tiny PNGs written to a temporary directory; the model echoes
//! the prompt it was given so prompt building can be checked from the output.

use ai::{
    image::{DynamicImage, RgbImage},
    GenerationConfig, VisionLanguageModel,
};
use clap::Parser;
use model_vqa::{
    eval_with_model, record::AnswerRecord, Args, EvalConfig, EvalError, FailurePolicy,
};
use serde_json::{json, Value};
use std::path::Path;

struct PromptEchoModel {
    use_im_start_end: bool,
    /// generation fails for prompts containing this text
    fail_on: Option<String>,
}

impl PromptEchoModel {
    fn new() -> Self {
        Self {
            use_im_start_end: false,
            fail_on: None,
        }
    }
}

impl VisionLanguageModel for PromptEchoModel {
    type ImageInput = (u32, u32);

    fn use_im_start_end(&self) -> bool {
        self.use_im_start_end
    }

    fn validate_generation_config(&self, config: &GenerationConfig) -> anyhow::Result<()> {
        anyhow::ensure!(config.num_beams == 1, "beam search is not supported");
        Ok(())
    }

    fn tokenize_prompt(&self, prompt: &str) -> anyhow::Result<Vec<i64>> {
        Ok(prompt.chars().map(|c| c as i64).collect())
    }

    fn preprocess_image(&self, image: &DynamicImage) -> anyhow::Result<(u32, u32)> {
        Ok((image.width(), image.height()))
    }

    fn generate(
        &mut self,
        input_ids: &[i64],
        _image: &(u32, u32),
        _image_size: (u32, u32),
        _config: &GenerationConfig,
    ) -> anyhow::Result<Vec<u32>> {
        let prompt = input_ids
            .iter()
            .filter_map(|id| char::from_u32(*id as u32))
            .collect::<String>();
        if let Some(fail_on) = &self.fail_on {
            anyhow::ensure!(!prompt.contains(fail_on.as_str()), "out of memory");
        }
        Ok(input_ids.iter().map(|id| *id as u32).collect())
    }

    fn decode(&self, token_ids: &[u32]) -> anyhow::Result<String> {
        Ok(token_ids.iter().filter_map(|id| char::from_u32(*id)).collect())
    }
}

fn write_questions(dir: &Path, count: usize) {
    RgbImage::new(8, 6).save(dir.join("image.png")).unwrap();
    let lines = (0..count)
        .map(|i| {
            json!({
                "question_id": i,
                "image": "image.png",
                "text": format!("question {i}"),
            })
            .to_string()
        })
        .collect::<Vec<_>>();
    std::fs::write(dir.join("question.jsonl"), lines.join("\n")).unwrap();
}

fn eval_config(dir: &Path, answers_file: &str, extra: &[&str]) -> Result<EvalConfig, EvalError> {
    let question_file = dir.join("question.jsonl");
    let answers_file = dir.join(answers_file);
    let mut argv = vec![
        "model-vqa".to_string(),
        "--model-base".to_string(),
        "base".to_string(),
        "--model-path".to_string(),
        "checkpoints/maya".to_string(),
        "--conv-mode".to_string(),
        "vicuna_v1".to_string(),
        "--question-file".to_string(),
        question_file.to_string_lossy().to_string(),
        "--image-folder".to_string(),
        dir.to_string_lossy().to_string(),
        "--answers-file".to_string(),
        answers_file.to_string_lossy().to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    EvalConfig::try_from(Args::try_parse_from(argv).unwrap())
}

fn read_answers(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test_log::test]
fn test_one_answer_per_question_in_order() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 5);
    let config = eval_config(dir.path(), "answers/answer.jsonl", &[]).unwrap();

    let summary = eval_with_model(&config, &mut PromptEchoModel::new()).unwrap();
    assert_eq!(summary.answered, 5);

    let content = std::fs::read_to_string(&config.answers_file).unwrap();
    for line in content.lines() {
        let positions = ["question_id", "prompt", "text", "answer_id", "model_id", "metadata"]
            .iter()
            .map(|key| line.find(&format!("\"{key}\":")).unwrap())
            .collect::<Vec<_>>();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{line}");
    }

    let answers = read_answers(&config.answers_file);
    assert_eq!(answers.len(), 5);
    for (i, answer) in answers.iter().enumerate() {
        assert_eq!(answer.as_object().unwrap().len(), 6);
        assert_eq!(answer["question_id"], json!(i));
        assert_eq!(answer["prompt"], json!(format!("question {i}")));
        assert_eq!(answer["model_id"], json!("maya"));
        assert_eq!(answer["metadata"], json!({}));
    }

    let first: AnswerRecord = serde_json::from_value(answers[0].clone()).unwrap();
    assert!(first.text.contains("USER: <image>\nquestion 0 ASSISTANT:"));
}

#[test_log::test]
fn test_im_start_end_markers_reach_the_model() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 1);
    let config = eval_config(dir.path(), "answer.jsonl", &[]).unwrap();

    let mut model = PromptEchoModel {
        use_im_start_end: true,
        fail_on: None,
    };
    eval_with_model(&config, &mut model).unwrap();
    let answers = read_answers(&config.answers_file);
    assert!(answers[0]["text"]
        .as_str()
        .unwrap()
        .contains("<im_start><image><im_end>\nquestion 0"));
}

#[test_log::test]
fn test_chunks_concatenate_to_single_run() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 10);

    let single = eval_config(dir.path(), "single.jsonl", &[]).unwrap();
    eval_with_model(&single, &mut PromptEchoModel::new()).unwrap();
    let expected = read_answers(&single.answers_file)
        .iter()
        .map(|answer| answer["question_id"].clone())
        .collect::<Vec<_>>();

    let mut chunked = vec![];
    let mut sizes = vec![];
    for k in 0..4 {
        let config = eval_config(
            dir.path(),
            &format!("chunks/{k}.jsonl"),
            &["--num-chunks", "4", "--chunk-idx", &k.to_string()],
        )
        .unwrap();
        eval_with_model(&config, &mut PromptEchoModel::new()).unwrap();
        let answers = read_answers(&config.answers_file);
        sizes.push(answers.len());
        chunked.extend(answers.iter().map(|answer| answer["question_id"].clone()));
    }

    assert_eq!(sizes, vec![3, 3, 3, 1]);
    assert_eq!(chunked, expected);
}

#[test_log::test]
fn test_pretrained_without_projector_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 2);

    let err = eval_config(dir.path(), "answer.jsonl", &["--mode", "pretrained"]).unwrap_err();
    assert!(matches!(err, EvalError::Configuration(_)));
    assert!(!dir.path().join("answer.jsonl").exists());
}

#[test_log::test]
fn test_unsupported_generation_option_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 2);
    let config = eval_config(dir.path(), "answer.jsonl", &["--num_beams", "4"]).unwrap();

    let err = eval_with_model(&config, &mut PromptEchoModel::new()).unwrap_err();
    assert!(matches!(err, EvalError::Configuration(_)));
    assert!(!config.answers_file.exists());
}

#[test_log::test]
fn test_skip_policy_continues_past_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 4);
    let config = eval_config(dir.path(), "answer.jsonl", &[]).unwrap();
    assert_eq!(config.on_error, FailurePolicy::Skip);

    let mut model = PromptEchoModel {
        use_im_start_end: false,
        fail_on: Some("question 2".to_string()),
    };
    let summary = eval_with_model(&config, &mut model).unwrap();
    assert_eq!(summary.answered, 3);
    assert_eq!(summary.skipped, 1);

    let ids = read_answers(&config.answers_file)
        .iter()
        .map(|answer| answer["question_id"].clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![json!(0), json!(1), json!(3)]);

    let failures = read_answers(&config.failures_file());
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["question_id"], json!(2));
    assert_eq!(failures[0]["stage"], json!("generate"));
    assert!(failures[0]["error"]
        .as_str()
        .unwrap()
        .contains("out of memory"));
}

#[test_log::test]
fn test_abort_policy_keeps_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 4);
    let config = eval_config(dir.path(), "answer.jsonl", &["--on-error", "abort"]).unwrap();

    let mut model = PromptEchoModel {
        use_im_start_end: false,
        fail_on: Some("question 2".to_string()),
    };
    let err = eval_with_model(&config, &mut model).unwrap_err();
    assert!(matches!(err, EvalError::Model(_)));
    assert_eq!(read_answers(&config.answers_file).len(), 2);
}

#[test_log::test]
fn test_resume_answers_only_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 4);
    let config = eval_config(dir.path(), "answer.jsonl", &["--on-error", "abort"]).unwrap();
    let mut model = PromptEchoModel {
        use_im_start_end: false,
        fail_on: Some("question 2".to_string()),
    };
    assert!(eval_with_model(&config, &mut model).is_err());

    let config = eval_config(dir.path(), "answer.jsonl", &["--resume"]).unwrap();
    let summary = eval_with_model(&config, &mut PromptEchoModel::new()).unwrap();
    assert_eq!(summary.resumed, 2);
    assert_eq!(summary.answered, 2);

    let ids = read_answers(&config.answers_file)
        .iter()
        .map(|answer| answer["question_id"].clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![json!(0), json!(1), json!(2), json!(3)]);
}

#[test_log::test]
fn test_resume_after_unfinished_line() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 3);
    let answers_file = dir.path().join("answer.jsonl");
    std::fs::write(
        &answers_file,
        concat!(
            r#"{"question_id":0,"prompt":"question 0","text":"a","answer_id":"x","model_id":"maya","metadata":{}}"#,
            "\n",
            r#"{"question_id":1,"prom"#
        ),
    )
    .unwrap();

    let config = eval_config(dir.path(), "answer.jsonl", &["--resume"]).unwrap();
    let summary = eval_with_model(&config, &mut PromptEchoModel::new()).unwrap();
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.answered, 2);

    // every line parses, and the cut-off question was answered again
    let ids = read_answers(&answers_file)
        .iter()
        .map(|answer| answer["question_id"].clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![json!(0), json!(1), json!(2)]);

    let config = eval_config(dir.path(), "answer.jsonl", &["--resume"]).unwrap();
    let summary = eval_with_model(&config, &mut PromptEchoModel::new()).unwrap();
    assert_eq!(summary.resumed, 3);
    assert_eq!(summary.answered, 0);
}

#[test_log::test]
fn test_fresh_run_clears_previous_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 2);
    let config = eval_config(dir.path(), "answer.jsonl", &[]).unwrap();
    std::fs::write(
        config.failures_file(),
        r#"{"question_id":0,"image":"image.png","stage":"generate","error":"old"}"#,
    )
    .unwrap();

    let summary = eval_with_model(&config, &mut PromptEchoModel::new()).unwrap();
    assert_eq!(summary.skipped, 0);
    assert!(!config.failures_file().exists());
}

#[test_log::test]
fn test_resume_keeps_previous_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_questions(dir.path(), 2);
    let mut model = PromptEchoModel {
        use_im_start_end: false,
        fail_on: Some("question 1".to_string()),
    };
    let config = eval_config(dir.path(), "answer.jsonl", &[]).unwrap();
    eval_with_model(&config, &mut model).unwrap();
    assert_eq!(read_answers(&config.failures_file()).len(), 1);

    let config = eval_config(dir.path(), "answer.jsonl", &["--resume"]).unwrap();
    let summary = eval_with_model(&config, &mut model).unwrap();
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(read_answers(&config.failures_file()).len(), 2);
}
