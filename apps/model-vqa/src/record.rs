use crate::error::{EvalError, EvalResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashSet,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use tracing::{debug, warn};

/// One line of the question file. Extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuestionRecord {
    /// number or string, kept as-is in the answer
    pub question_id: Value,
    /// relative to the image folder
    pub image: String,
    pub text: String,
}

/// One line of the answers file; field order is the on-disk key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: Value,
    /// question before the image placeholder was added
    pub prompt: String,
    pub text: String,
    pub answer_id: String,
    pub model_id: String,
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub question_id: Value,
    pub image: String,
    pub stage: String,
    pub error: String,
}

pub fn read_questions(path: &Path) -> EvalResult<Vec<QuestionRecord>> {
    let file = File::open(path).map_err(|e| EvalError::io(path, e))?;
    let mut questions = vec![];
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| EvalError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| EvalError::Json {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        questions.push(record);
    }
    debug!("read {} questions from {}", questions.len(), path.display());
    Ok(questions)
}

/// Canonical form of a question id, so `1` and `"1"` stay distinct.
pub fn question_key(question_id: &Value) -> String {
    question_id.to_string()
}

/// Question ids already present in an answers file. A missing file has none.
///
/// Lines that do not parse, such as one cut short by a crash, are skipped.
pub fn answered_question_ids(path: &Path) -> EvalResult<HashSet<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(EvalError::io(path, e)),
    };

    #[derive(Deserialize)]
    struct Answered {
        question_id: Value,
    }

    let mut ids = HashSet::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| EvalError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Answered>(&line) {
            Ok(answered) => {
                ids.insert(question_key(&answered.question_id));
            }
            Err(e) => warn!("ignoring line {} of {}: {}", index + 1, path.display(), e),
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_log::test]
    fn test_read_questions_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("question.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"question_id": 1, "image": "a.jpg", "text": "What?", "category": "x"}"#,
                "\n\n",
                r#"{"question_id": "q2", "image": "b.jpg", "text": "Why?"}"#,
                "\n"
            ),
        )
        .unwrap();

        let questions = read_questions(&path).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].question_id, json!(1));
        assert_eq!(questions[1].question_id, json!("q2"));
        assert_eq!(questions[1].image, "b.jpg");
    }

    #[test_log::test]
    fn test_malformed_line_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("question.jsonl");
        std::fs::write(
            &path,
            "{\"question_id\": 1, \"image\": \"a.jpg\", \"text\": \"What?\"}\n{\"question_id\": 2}\n",
        )
        .unwrap();

        match read_questions(&path) {
            Err(EvalError::Json { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test_log::test]
    fn test_missing_question_file() {
        let err = read_questions(Path::new("/nonexistent/question.jsonl")).unwrap_err();
        assert!(matches!(err, EvalError::Io { .. }));
    }

    #[test_log::test]
    fn test_answer_key_order() {
        let record = AnswerRecord {
            question_id: json!(7),
            prompt: "What?".into(),
            text: "A cat.".into(),
            answer_id: "abc".into(),
            model_id: "maya".into(),
            metadata: Default::default(),
        };
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"question_id":7,"prompt":"What?","text":"A cat.","answer_id":"abc","model_id":"maya","metadata":{}}"#
        );
    }

    #[test_log::test]
    fn test_answered_question_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answer.jsonl");
        assert!(answered_question_ids(&path).unwrap().is_empty());

        std::fs::write(
            &path,
            "{\"question_id\": 1, \"text\": \"a\"}\n{\"question_id\": \"1\", \"text\": \"b\"}\n{\"question_",
        )
        .unwrap();
        let ids = answered_question_ids(&path).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&question_key(&json!(1))));
        assert!(ids.contains(&question_key(&json!("1"))));
    }
}
