use crate::error::{EvalError, EvalResult};
use ai::{
    conversation::{conv_template, Conversation, CONV_TEMPLATE_NAMES},
    DEFAULT_IMAGE_TOKEN, DEFAULT_IM_END_TOKEN, DEFAULT_IM_START_TOKEN,
};

/// Puts the image placeholder in front of the question, the way the model was trained.
pub fn decorate_question(question: &str, use_im_start_end: bool) -> String {
    if use_im_start_end {
        format!("{DEFAULT_IM_START_TOKEN}{DEFAULT_IMAGE_TOKEN}{DEFAULT_IM_END_TOKEN}\n{question}")
    } else {
        format!("{DEFAULT_IMAGE_TOKEN}\n{question}")
    }
}

pub fn resolve_template(conv_mode: &str) -> EvalResult<Conversation> {
    conv_template(conv_mode).ok_or_else(|| {
        EvalError::Configuration(format!(
            "unknown conversation template '{}', expected one of: {}",
            conv_mode,
            CONV_TEMPLATE_NAMES.join(", ")
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// question with the image placeholder prepended
    pub decorated: String,
    /// full templated prompt handed to the tokenizer
    pub rendered: String,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: Conversation,
    use_im_start_end: bool,
}

impl PromptBuilder {
    pub fn new(conv_mode: &str, use_im_start_end: bool) -> EvalResult<Self> {
        Ok(Self {
            template: resolve_template(conv_mode)?,
            use_im_start_end,
        })
    }

    pub fn build(&self, question: &str) -> Prompt {
        let decorated = decorate_question(question, self.use_im_start_end);
        let mut conv = self.template.clone();
        conv.append_user_message(Some(&decorated));
        conv.append_assistant_message(None);
        Prompt {
            rendered: conv.get_prompt(),
            decorated,
        }
    }
}
