use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Error as E, Result};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::info;

use crate::prompting::{ChatTemplate, PromptFamily};

/// Tokenizer collaborator seen by the decode controller.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
    fn eos_token_id(&self) -> u32;
    /// Explicit capability query for the structured chat path.
    fn chat_template(&self) -> Option<&ChatTemplate>;
}

pub struct HfTokenizer {
    inner: Tokenizer,
    eos_token_id: u32,
    template: Option<ChatTemplate>,
}

impl HfTokenizer {
    pub fn load(path: &Path, family: PromptFamily) -> Result<Self> {
        let inner = Tokenizer::from_file(path).map_err(E::msg)?;
        let config = TokenizerConfig::next_to(path)?;

        let eos_text = config.as_ref().and_then(|c| c.eos_token.as_ref().map(|t| t.text()));
        let eos_token_id = match eos_text.and_then(|t| inner.token_to_id(t)) {
            Some(id) => id,
            None => resolve_eos_token(&inner, family).map_err(E::msg)?,
        };

        let template = config.and_then(|c| {
            let source = c.chat_template?;
            Some(ChatTemplate::new(
                source,
                c.bos_token.map(|t| t.text().to_string()),
                c.eos_token.map(|t| t.text().to_string()),
            ))
        });

        info!(
            eos_token_id,
            chat_template = template.is_some(),
            "tokenizer loaded from {}",
            path.display()
        );

        Ok(Self {
            inner,
            eos_token_id,
            template,
        })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        Ok(self
            .inner
            .encode(text, add_special_tokens)
            .map_err(E::msg)?
            .get_ids()
            .to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner.decode(ids, skip_special_tokens).map_err(E::msg)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn chat_template(&self) -> Option<&ChatTemplate> {
        self.template.as_ref()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Added { content: String },
}

impl SpecialToken {
    fn text(&self) -> &str {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Added { content } => content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenizerConfig {
    chat_template: Option<String>,
    bos_token: Option<SpecialToken>,
    eos_token: Option<SpecialToken>,
}

impl TokenizerConfig {
    fn next_to(tokenizer_path: &Path) -> Result<Option<Self>> {
        let path = tokenizer_path
            .parent()
            .unwrap_or(Path::new("."))
            .join("tokenizer_config.json");
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        // Some configs ship the template as a list of named templates; treat those as absent.
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let config = TokenizerConfig {
            chat_template: value
                .get("chat_template")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            bos_token: value
                .get("bos_token")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            eos_token: value
                .get("eos_token")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        };
        Ok(Some(config))
    }
}

const TOKENIZER_FILE: &str = "tokenizer.json";

/// First existing candidate: `tokenizer_path`, beside `model_path`, the
/// working directory, then `models/`.
pub(super) fn resolve_tokenizer_path(model_path: &Path, tokenizer_path: Option<&Path>) -> Option<PathBuf> {
    let beside_model = model_path
        .parent()
        .unwrap_or(Path::new("."))
        .join(TOKENIZER_FILE);
    tokenizer_path
        .map(Path::to_path_buf)
        .into_iter()
        .chain([
            beside_model,
            PathBuf::from(TOKENIZER_FILE),
            Path::new("models").join(TOKENIZER_FILE),
        ])
        .find(|candidate| candidate.exists())
}

pub(super) fn resolve_eos_token(tokenizer: &Tokenizer, family: PromptFamily) -> Result<u32, String> {
    let markers = family.eos_markers();
    markers
        .iter()
        .find_map(|m| tokenizer.token_to_id(m))
        .or(if family == PromptFamily::Unknown { Some(2) } else { None })
        .ok_or_else(|| {
            format!(
                "tokenizer has no end-of-sequence token for family {:?} (looked for {}); check `family`",
                family,
                markers.join(", ")
            )
        })
}

/// Turns a growing list of generated ids into text deltas whose concatenation
/// always equals a one-pass decode of the same ids.
pub struct IncrementalDecoder {
    tokenizer: Arc<dyn TextTokenizer>,
    ids: Vec<u32>,
    prefix_offset: usize,
    read_offset: usize,
}

impl IncrementalDecoder {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>) -> Self {
        Self {
            tokenizer,
            ids: Vec::new(),
            prefix_offset: 0,
            read_offset: 0,
        }
    }

    pub fn push(&mut self, id: u32) -> Result<String> {
        self.ids.push(id);
        let prefix = self
            .tokenizer
            .decode(&self.ids[self.prefix_offset..self.read_offset], true)?;
        let full = self.tokenizer.decode(&self.ids[self.prefix_offset..], true)?;

        if full.len() > prefix.len() && !full.ends_with('\u{FFFD}') && full.is_char_boundary(prefix.len()) {
            let delta = full[prefix.len()..].to_string();
            self.prefix_offset = self.read_offset;
            self.read_offset = self.ids.len();
            Ok(delta)
        } else {
            Ok(String::new())
        }
    }

    /// Text still held back (an incomplete multi-byte sequence at end of generation).
    pub fn flush(&mut self) -> Result<String> {
        if self.read_offset >= self.ids.len() {
            return Ok(String::new());
        }
        let prefix = self
            .tokenizer
            .decode(&self.ids[self.prefix_offset..self.read_offset], true)?;
        let full = self.tokenizer.decode(&self.ids[self.prefix_offset..], true)?;
        self.prefix_offset = self.read_offset;
        self.read_offset = self.ids.len();
        if full.len() > prefix.len() && full.is_char_boundary(prefix.len()) {
            Ok(full[prefix.len()..].to_string())
        } else {
            Ok(String::new())
        }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }
}
