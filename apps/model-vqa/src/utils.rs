use std::path::{Path, PathBuf};

const SHORT_UUID_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const SHORT_UUID_LENGTH: usize = 22;

/// A random v4 uuid in base57, 22 characters, unambiguous alphabet.
pub fn short_uuid() -> String {
    encode_short_uuid(uuid::Uuid::new_v4())
}

fn encode_short_uuid(id: uuid::Uuid) -> String {
    let base = SHORT_UUID_ALPHABET.len() as u128;
    let mut number = id.as_u128();
    let mut digits = Vec::with_capacity(SHORT_UUID_LENGTH);
    while number > 0 {
        digits.push(SHORT_UUID_ALPHABET[(number % base) as usize]);
        number /= base;
    }
    while digits.len() < SHORT_UUID_LENGTH {
        digits.push(SHORT_UUID_ALPHABET[0]);
    }
    digits.iter().rev().map(|c| *c as char).collect()
}

/// `.../llava-v1.5-7b` -> `llava-v1.5-7b`, `.../run/checkpoint-500` -> `run_checkpoint-500`
pub fn model_name_from_path(model_path: &str) -> String {
    let parts = model_path
        .trim_matches('/')
        .split('/')
        .collect::<Vec<&str>>();
    match parts.as_slice() {
        [.., parent, last] if last.starts_with("checkpoint-") => format!("{parent}_{last}"),
        [.., last] => last.to_string(),
        [] => String::new(),
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_short_uuid() {
        let id = short_uuid();
        assert_eq!(id.len(), 22);
        assert!(id.bytes().all(|c| SHORT_UUID_ALPHABET.contains(&c)));
        assert_ne!(short_uuid(), id);
    }

    #[test_log::test]
    fn test_short_uuid_padding() {
        assert_eq!(encode_short_uuid(uuid::Uuid::nil()), "2".repeat(22));
        assert_eq!(
            encode_short_uuid(uuid::Uuid::from_u128(57)),
            format!("{}32", "2".repeat(20))
        );
    }

    #[test_log::test]
    fn test_model_name_from_path() {
        assert_eq!(model_name_from_path("nahidalam/maya_full_ft"), "maya_full_ft");
        assert_eq!(
            model_name_from_path("/models/llava-v1.5-7b/"),
            "llava-v1.5-7b"
        );
        assert_eq!(
            model_name_from_path("runs/maya/checkpoint-1200"),
            "maya_checkpoint-1200"
        );
        assert_eq!(model_name_from_path("checkpoint-5"), "checkpoint-5");
    }

    #[test_log::test]
    fn test_expand_home() {
        assert_eq!(
            expand_home(Path::new("answers/a.jsonl")),
            PathBuf::from("answers/a.jsonl")
        );
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/a.jsonl")), home.join("a.jsonl"));
        }
    }
}
