//! Scripted collaborators used by unit and router tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::backend::InferencePipeline;
use crate::engine::TextTokenizer;
use crate::prompting::ChatTemplate;

pub const BOS: u32 = 1;
pub const EOS: u32 = 2;
const OFFSET: u32 = 3;

/// One id per `char`, with BOS/EOS specials below the char range.
#[derive(Default)]
pub struct CharTokenizer {
    template: Option<ChatTemplate>,
}

impl CharTokenizer {
    pub fn new() -> Self {
        Self { template: None }
    }

    pub fn with_template(template: ChatTemplate) -> Self {
        Self {
            template: Some(template),
        }
    }

    pub fn id_of(c: char) -> u32 {
        c as u32 + OFFSET
    }
}

impl TextTokenizer for CharTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special_tokens {
            ids.push(BOS);
        }
        ids.extend(text.chars().map(Self::id_of));
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut out = String::new();
        for &id in ids {
            match id {
                BOS | EOS | 0 if skip_special_tokens => {}
                BOS => out.push_str("<s>"),
                EOS => out.push_str("</s>"),
                0 => out.push_str("<unk>"),
                _ => match char::from_u32(id - OFFSET) {
                    Some(c) => out.push(c),
                    None => bail!("id {} is outside the vocabulary", id),
                },
            }
        }
        Ok(out)
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }

    fn chat_template(&self) -> Option<&ChatTemplate> {
        self.template.as_ref()
    }
}

/// One id per UTF-8 byte; decoding is lossy like a byte-level BPE.
pub struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + OFFSET).collect())
    }

    fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id >= OFFSET)
            .map(|&id| (id - OFFSET) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }

    fn chat_template(&self) -> Option<&ChatTemplate> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineCall {
    Prefill(usize),
    Step(usize),
}

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<PipelineCall>>>);

impl CallLog {
    fn push(&self, call: PipelineCall) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<PipelineCall> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn step_positions(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PipelineCall::Step(p) => Some(p),
                PipelineCall::Prefill(_) => None,
            })
            .collect()
    }
}

enum Mode {
    /// Steps return these ids in order, then `filler` forever.
    Script { ids: Vec<u32>, filler: u32 },
    /// Steps replay the prefilled input (minus BOS), then EOS.
    Echo,
}

pub struct ScriptedPipeline {
    mode: Mode,
    prefilled: Vec<u32>,
    prefill_len: usize,
    steps: usize,
    fail_at_step: Option<usize>,
    fail_prefill: bool,
    step_delay: Duration,
    log: CallLog,
}

impl ScriptedPipeline {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            prefilled: Vec::new(),
            prefill_len: 0,
            steps: 0,
            fail_at_step: None,
            fail_prefill: false,
            step_delay: Duration::ZERO,
            log: CallLog::default(),
        }
    }

    pub fn script(ids: Vec<u32>, filler: u32) -> Self {
        Self::with_mode(Mode::Script { ids, filler })
    }

    /// Emits `text` one char per step, then EOS.
    pub fn speaking(text: &str) -> Self {
        let mut ids: Vec<u32> = text.chars().map(CharTokenizer::id_of).collect();
        ids.push(EOS);
        Self::script(ids, EOS)
    }

    pub fn echo() -> Self {
        Self::with_mode(Mode::Echo)
    }

    pub fn never_ending() -> Self {
        Self::script(Vec::new(), CharTokenizer::id_of('z'))
    }

    pub fn failing_at_step(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    pub fn failing_prefill(mut self) -> Self {
        self.fail_prefill = true;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

impl InferencePipeline for ScriptedPipeline {
    fn prefill(&mut self, tokens: &[u32]) -> Result<usize> {
        self.log.push(PipelineCall::Prefill(tokens.len()));
        if self.fail_prefill {
            bail!("scripted prefill failure");
        }
        self.prefilled = tokens.to_vec();
        self.prefill_len = tokens.len();
        self.steps = 0;
        Ok(tokens.len())
    }

    fn step(&mut self, tokens: &[u32], position: usize) -> Result<u32> {
        self.log.push(PipelineCall::Step(position));
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }

        let step = self.steps;
        self.steps += 1;
        let result = if self.fail_at_step == Some(step) {
            Err(anyhow::anyhow!("scripted failure at step {}", step))
        } else if position > tokens.len() {
            Err(anyhow::anyhow!("position {} past committed tokens {}", position, tokens.len()))
        } else {
            Ok(match &self.mode {
                Mode::Script { ids, filler } => ids.get(step).copied().unwrap_or(*filler),
                Mode::Echo => {
                    let body: Vec<u32> = self.prefilled.iter().copied().filter(|&t| t != BOS).collect();
                    position
                        .checked_sub(self.prefill_len)
                        .and_then(|i| body.get(i).copied())
                        .unwrap_or(EOS)
                }
            })
        };

        result
    }
}
