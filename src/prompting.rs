use std::path::Path;

use anyhow::{anyhow, Result};
use minijinja::{context, Environment, ErrorKind, Value};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::TextTokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

impl PromptFamily {
    pub fn from_model_path(path: &Path) -> Self {
        let lowered = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_lowercase();
        if lowered.contains("llama") {
            PromptFamily::Llama
        } else if lowered.contains("qwen") {
            PromptFamily::Qwen
        } else if lowered.contains("mistral") || lowered.contains("mixtral") {
            PromptFamily::Mistral
        } else {
            PromptFamily::Unknown
        }
    }

    /// Candidate end-of-sequence markers, most specific first.
    pub fn eos_markers(self) -> &'static [&'static str] {
        match self {
            PromptFamily::Llama => &["<|eot_id|>", "<|end_of_text|>", "</s>"],
            PromptFamily::Qwen => &["<|im_end|>", "<|endoftext|>", "</s>"],
            PromptFamily::Mistral => &["</s>", "<|end_of_text|>"],
            PromptFamily::Unknown => &["<|end_of_text|>", "</s>", "<|endoftext|>"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            seed: Some(299_792_458),
        }
    }
}

impl GenerationConfig {
    pub fn defaults_for(family: PromptFamily) -> Self {
        match family {
            PromptFamily::Mistral => Self {
                top_p: 0.92,
                ..Self::default()
            },
            PromptFamily::Llama | PromptFamily::Qwen | PromptFamily::Unknown => Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err("temperature must be in [0.0, 2.0]".to_string());
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err("top_p must be in [0.0, 1.0]".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Jinja chat template as shipped in a HuggingFace `tokenizer_config.json`.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    source: String,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>, bos_token: Option<String>, eos_token: Option<String>) -> Self {
        Self {
            source: source.into(),
            bos_token: bos_token.unwrap_or_default(),
            eos_token: eos_token.unwrap_or_default(),
        }
    }

    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let mut env = Environment::new();
        env.add_function("raise_exception", |msg: String| -> Result<String, minijinja::Error> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
        });
        env.add_template("chat", &self.source)
            .map_err(|e| anyhow!("chat template does not compile: {}", e))?;
        let tmpl = env
            .get_template("chat")
            .map_err(|e| anyhow!("chat template missing: {}", e))?;

        let messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                context! {
                    role => m.role.clone(),
                    content => m.content.clone(),
                }
            })
            .collect();

        tmpl.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
            bos_token => self.bos_token.clone(),
            eos_token => self.eos_token.clone(),
        })
        .map_err(|e| anyhow!("chat template render failed: {}", e))
    }
}

pub fn format_instruct(prompt: &str) -> String {
    format!("[INST] {} [/INST]", prompt)
}

/// How a user prompt becomes the token sequence fed to prefill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStrategy {
    ChatTemplate,
    Instruct,
}

impl PromptStrategy {
    /// One side-effect-free probe render against the tokenizer's template.
    pub fn probe(tokenizer: &dyn TextTokenizer) -> Self {
        let Some(template) = tokenizer.chat_template() else {
            debug!("tokenizer ships no chat template, using instruct format");
            return PromptStrategy::Instruct;
        };

        match template.render(&[ChatMessage::user("test")], false) {
            Ok(_) => PromptStrategy::ChatTemplate,
            Err(e) => {
                debug!(error = %e, "chat template probe failed, using instruct format");
                PromptStrategy::Instruct
            }
        }
    }

    pub fn encode(self, tokenizer: &dyn TextTokenizer, prompt: &str) -> Result<Vec<u32>> {
        if self == PromptStrategy::ChatTemplate {
            if let Some(template) = tokenizer.chat_template() {
                match template.render(&[ChatMessage::user(prompt)], true) {
                    Ok(text) => return tokenizer.encode(&text, false),
                    Err(e) => warn!(error = %e, "chat template failed for prompt, degrading to instruct format"),
                }
            }
        }
        tokenizer.encode(&format_instruct(prompt), true)
    }
}
