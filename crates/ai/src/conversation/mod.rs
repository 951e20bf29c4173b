//! Named conversation templates.
//!
//! A template turns an ordered list of `(role, message)` turns into the exact prompt
//! string a checkpoint was trained on. An empty assistant turn (`None`) marks the
//! point where generation starts.

use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SeparatorStyle {
    /// `system###Human: msg###Assistant:`
    Single,
    /// `system USER: msg ASSISTANT: answer</s>`
    Two,
    /// `<|im_start|>system...<|im_end|><|im_start|>user\nmsg<|im_end|>`
    Mpt,
    /// messages only, no role tags
    Plain,
    /// `[INST] <<SYS>>...<</SYS>> msg [/INST]`
    Llama2,
    /// Cohere turn tokens
    Aya,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub system: String,
    pub roles: (String, String),
    pub messages: Vec<(String, Option<String>)>,
    pub sep_style: SeparatorStyle,
    pub sep: String,
    pub sep2: Option<String>,
    pub version: String,
}

const LLAVA_SYSTEM: &str = "A chat between a curious human and an artificial intelligence assistant. The assistant gives helpful, detailed, and polite answers to the human's questions.";

const AYA_START_OF_TURN: &str = "<|START_OF_TURN_TOKEN|>";
const AYA_SYSTEM_ROLE: &str = "<|SYSTEM_TOKEN|>";

impl Conversation {
    fn new(
        system: &str,
        roles: (&str, &str),
        sep_style: SeparatorStyle,
        sep: &str,
        sep2: Option<&str>,
        version: &str,
    ) -> Self {
        Self {
            system: system.to_string(),
            roles: (roles.0.to_string(), roles.1.to_string()),
            messages: vec![],
            sep_style,
            sep: sep.to_string(),
            sep2: sep2.map(|v| v.to_string()),
            version: version.to_string(),
        }
    }

    pub fn conv_vicuna_v1() -> Self {
        Self::new(
            LLAVA_SYSTEM,
            ("USER", "ASSISTANT"),
            SeparatorStyle::Two,
            " ",
            Some("</s>"),
            "v1",
        )
    }

    pub fn conv_llava_v0() -> Self {
        Self::new(
            LLAVA_SYSTEM,
            ("Human", "Assistant"),
            SeparatorStyle::Single,
            "###",
            None,
            "v0",
        )
    }

    pub fn conv_llava_plain() -> Self {
        Self::new("", ("", ""), SeparatorStyle::Plain, "\n", None, "plain")
    }

    pub fn conv_llava_llama_2() -> Self {
        Self::new(
            "You are a helpful language and vision assistant. You are able to understand the visual content that the user provides, and assist the user with a variety of tasks using natural language.",
            ("USER", "ASSISTANT"),
            SeparatorStyle::Llama2,
            "<s>",
            Some("</s>"),
            "llama_v2",
        )
    }

    pub fn conv_mistral_instruct() -> Self {
        Self::new(
            "",
            ("USER", "ASSISTANT"),
            SeparatorStyle::Llama2,
            "",
            Some("</s>"),
            "llama_v2",
        )
    }

    pub fn conv_mpt() -> Self {
        Self::new(
            "<|im_start|>system\nA conversation between a user and an LLM-based AI assistant. The assistant gives helpful and honest answers.",
            ("<|im_start|>user\n", "<|im_start|>assistant\n"),
            SeparatorStyle::Mpt,
            "<|im_end|>",
            None,
            "mpt",
        )
    }

    pub fn conv_chatml_direct() -> Self {
        Self::new(
            "<|im_start|>system\nAnswer the questions.",
            ("<|im_start|>user\n", "<|im_start|>assistant\n"),
            SeparatorStyle::Mpt,
            "<|im_end|>",
            None,
            "mpt",
        )
    }

    pub fn conv_aya() -> Self {
        Self::new(
            "",
            ("<|USER_TOKEN|>", "<|CHATBOT_TOKEN|>"),
            SeparatorStyle::Aya,
            "<|END_OF_TURN_TOKEN|>",
            Some("<|END_OF_TURN_TOKEN|>"),
            "aya",
        )
    }

    pub fn append_message(&mut self, role: String, message: Option<&str>) {
        self.messages.push((role, message.map(|v| v.to_string())));
    }

    pub fn append_user_message(&mut self, message: Option<&str>) {
        self.append_message(self.roles.0.clone(), message);
    }

    pub fn append_assistant_message(&mut self, message: Option<&str>) {
        self.append_message(self.roles.1.clone(), message);
    }

    fn sep2(&self) -> &str {
        self.sep2.as_deref().unwrap_or(&self.sep)
    }

    pub fn get_prompt(&self) -> String {
        match self.sep_style {
            SeparatorStyle::Single => {
                let mut ret = format!("{}{}", self.system, self.sep);
                for (role, message) in &self.messages {
                    match message {
                        Some(message) => ret.push_str(&format!("{role}: {message}{}", self.sep)),
                        None => ret.push_str(&format!("{role}:")),
                    }
                }
                ret
            }
            SeparatorStyle::Two => {
                let seps = [self.sep.as_str(), self.sep2()];
                let mut ret = format!("{}{}", self.system, seps[0]);
                for (i, (role, message)) in self.messages.iter().enumerate() {
                    match message {
                        Some(message) => {
                            ret.push_str(&format!("{role}: {message}{}", seps[i % 2]))
                        }
                        None => ret.push_str(&format!("{role}:")),
                    }
                }
                ret
            }
            SeparatorStyle::Mpt => {
                let mut ret = format!("{}{}", self.system, self.sep);
                for (role, message) in &self.messages {
                    match message {
                        Some(message) => ret.push_str(&format!("{role}{message}{}", self.sep)),
                        None => ret.push_str(role),
                    }
                }
                ret
            }
            SeparatorStyle::Plain => {
                let seps = [self.sep.as_str(), self.sep2()];
                let mut ret = self.system.clone();
                for (i, (_, message)) in self.messages.iter().enumerate() {
                    if let Some(message) = message {
                        ret.push_str(&format!("{message}{}", seps[i % 2]));
                    }
                }
                ret
            }
            SeparatorStyle::Llama2 => {
                let mut ret = String::new();
                for (i, (_, message)) in self.messages.iter().enumerate() {
                    let Some(message) = message else {
                        continue;
                    };
                    let message = if i == 0 && !self.system.is_empty() {
                        format!("<<SYS>>\n{}\n<</SYS>>\n\n{message}", self.system)
                    } else {
                        message.clone()
                    };
                    if i % 2 == 0 {
                        ret.push_str(&format!("{}[INST] {message} [/INST]", self.sep));
                    } else {
                        ret.push_str(&format!(" {message} {}", self.sep2()));
                    }
                }
                ret.strip_prefix(self.sep.as_str())
                    .map(|v| v.to_string())
                    .unwrap_or(ret)
            }
            SeparatorStyle::Aya => {
                // BOS is added by the tokenizer, not by the template
                let mut ret = String::new();
                if !self.system.is_empty() {
                    ret.push_str(&format!(
                        "{AYA_START_OF_TURN}{AYA_SYSTEM_ROLE}{}{}",
                        self.system, self.sep
                    ));
                }
                for (i, (role, message)) in self.messages.iter().enumerate() {
                    let sep = if i % 2 == 0 { self.sep.as_str() } else { self.sep2() };
                    match message {
                        Some(message) => {
                            ret.push_str(&format!("{AYA_START_OF_TURN}{role}{message}{sep}"))
                        }
                        None => ret.push_str(&format!("{AYA_START_OF_TURN}{role}")),
                    }
                }
                ret
            }
        }
    }
}

/// Names accepted by [`conv_template`].
pub const CONV_TEMPLATE_NAMES: &[&str] = &[
    "default",
    "v0",
    "v1",
    "vicuna_v1",
    "llava_v0",
    "llava_v1",
    "llava_llama_2",
    "mistral_instruct",
    "chatml_direct",
    "mistral_direct",
    "mpt",
    "plain",
    "aya",
];

/// Looks up a fresh copy of the template registered under `name`.
pub fn conv_template(name: &str) -> Option<Conversation> {
    let conv = match name {
        "default" | "v0" | "llava_v0" => Conversation::conv_llava_v0(),
        "v1" | "vicuna_v1" | "llava_v1" => Conversation::conv_vicuna_v1(),
        "llava_llama_2" => Conversation::conv_llava_llama_2(),
        "mistral_instruct" => Conversation::conv_mistral_instruct(),
        "chatml_direct" | "mistral_direct" => Conversation::conv_chatml_direct(),
        "mpt" => Conversation::conv_mpt(),
        "plain" => Conversation::conv_llava_plain(),
        "aya" => Conversation::conv_aya(),
        _ => return None,
    };
    Some(conv)
}
