//! Request-serialized decode loop.
//!
//! [`DecodeController`] owns the single loaded [`Engine`] behind one mutex.
//! [`DecodeController::begin`] takes that lock, formats and prefills the
//! prompt, and returns a [`DecodeStream`] that performs one decode step per
//! `next()`. The guard lives inside the stream, so the lock covers the whole
//! request and is released whenever the stream is dropped: normal completion,
//! error, or a consumer that stops iterating.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::anyhow;
use tracing::{debug, error, info, trace, warn};

use crate::engine::{Engine, IncrementalDecoder};
use crate::errors::{DecodeError, DecodeResult};

/// Per-request cooperative cancellation, checked once per decode step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token produced.
    Stop,
    /// Cursor reached `context_length - 1`.
    Length,
    /// Shutdown or client cancellation observed.
    Cancelled,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub token_text: String,
    pub is_final: bool,
    pub finish_reason: Option<FinishReason>,
}

impl DecodedEvent {
    fn token(token_text: String) -> Self {
        Self {
            token_text,
            is_final: false,
            finish_reason: None,
        }
    }

    fn terminal(token_text: String, reason: FinishReason) -> Self {
        Self {
            token_text,
            is_final: true,
            finish_reason: Some(reason),
        }
    }
}

pub struct DecodeController {
    slot: Mutex<Option<Engine>>,
    ready: AtomicBool,
    context_length: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

impl DecodeController {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            slot: Mutex::new(None),
            ready: AtomicBool::new(false),
            context_length: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// Installs the loaded engine. Waits for any in-flight request first.
    pub fn install(&self, engine: Engine) {
        let context_length = engine.context_length();
        *self.lock() = Some(engine);
        self.context_length.store(context_length, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn context_length(&self) -> Option<usize> {
        self.is_ready()
            .then(|| self.context_length.load(Ordering::SeqCst))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Engine>> {
        self.slot.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("decode lock poisoned by an earlier panic; session is reset per request");
            poisoned.into_inner()
        })
    }

    /// Starts one generation. Blocks while another request holds the pipeline.
    pub fn begin(&self, prompt: &str, cancel: CancelToken) -> DecodeResult<DecodeStream<'_>> {
        if prompt.trim().is_empty() {
            return Err(DecodeError::validation("Prompt is required"));
        }
        if !self.is_ready() {
            return Err(DecodeError::NotReady);
        }

        let mut guard = self.lock();
        let engine = guard.as_mut().ok_or(DecodeError::NotReady)?;
        let started = Instant::now();

        let input = engine
            .strategy
            .encode(engine.tokenizer.as_ref(), prompt)
            .map_err(|e| DecodeError::Generation(e.context("tokenizing prompt")))?;
        if input.is_empty() {
            return Err(DecodeError::validation("Prompt encodes to no tokens"));
        }
        let max_cursor = engine.session.max_cursor();
        if input.len() > max_cursor {
            return Err(DecodeError::Validation(format!(
                "Prompt is {} tokens; context allows at most {}",
                input.len(),
                max_cursor
            )));
        }

        engine.session.load_prompt(&input);
        let position = engine
            .pipeline
            .prefill(engine.session.tokens())
            .map_err(|e| DecodeError::Generation(e.context("prefill")))?;
        engine
            .session
            .start_at(position)
            .map_err(|msg| DecodeError::Generation(anyhow!(msg)))?;

        info!(
            prompt_tokens = input.len(),
            position,
            strategy = ?engine.strategy,
            prefill_ms = started.elapsed().as_millis() as u64,
            "prefill complete"
        );

        let decoder = IncrementalDecoder::new(engine.tokenizer.clone());
        let eos_token_id = engine.tokenizer.eos_token_id();
        Ok(DecodeStream {
            guard,
            shutdown: &self.shutdown,
            cancel,
            decoder,
            eos_token_id,
            state: StreamState::Decoding,
            generated: 0,
            started,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Decoding,
    Finishing(FinishReason),
    Done,
}

/// Lazy sequence of decoded events for one request; holds the pipeline lock.
pub struct DecodeStream<'a> {
    guard: MutexGuard<'a, Option<Engine>>,
    shutdown: &'a AtomicBool,
    cancel: CancelToken,
    decoder: IncrementalDecoder,
    eos_token_id: u32,
    state: StreamState,
    generated: usize,
    started: Instant,
}

impl DecodeStream<'_> {
    pub fn cursor(&self) -> usize {
        self.guard.as_ref().map(|e| e.session.cursor()).unwrap_or(0)
    }

    /// Ids produced by decode steps so far, in order.
    pub fn generated_ids(&self) -> &[u32] {
        self.decoder.ids()
    }

    pub fn committed_tokens(&self) -> &[u32] {
        self.guard.as_ref().map(|e| e.session.tokens()).unwrap_or(&[])
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    fn step(&mut self) -> DecodeResult<DecodedEvent> {
        let engine = self.guard.as_mut().ok_or(DecodeError::NotReady)?;
        if !engine.session.has_room() {
            return self.finish(FinishReason::Length);
        }
        if self.cancelled() {
            return self.finish(FinishReason::Cancelled);
        }

        let engine = self.guard.as_mut().ok_or(DecodeError::NotReady)?;
        let position = engine.session.cursor();
        let token = engine
            .pipeline
            .step(engine.session.tokens(), position)
            .map_err(|e| DecodeError::Generation(e.context(format!("decode step at position {}", position))))?;
        if engine.session.commit(token) {
            trace!(position, token, "rewrote provisional prompt slot");
        }
        engine.session.advance();

        let text = self.decoder.push(token).map_err(DecodeError::Generation)?;
        self.generated += 1;
        trace!(position, token, text = %text, "decoded");

        if token == self.eos_token_id {
            self.state = StreamState::Finishing(FinishReason::Stop);
        }
        Ok(DecodedEvent::token(text))
    }

    fn finish(&mut self, reason: FinishReason) -> DecodeResult<DecodedEvent> {
        self.state = StreamState::Done;
        let rest = self.decoder.flush().map_err(DecodeError::Generation)?;

        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        info!(
            generated = self.generated,
            cursor = self.cursor(),
            reason = reason.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            tokens_per_sec = if secs > 0.0 { self.generated as f64 / secs } else { 0.0 },
            "generation complete"
        );
        Ok(DecodedEvent::terminal(rest, reason))
    }
}

impl Iterator for DecodeStream<'_> {
    type Item = DecodeResult<DecodedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = match self.state {
            StreamState::Done => return None,
            StreamState::Finishing(reason) => self.finish(reason),
            StreamState::Decoding => self.step(),
        };
        if let Err(e) = &result {
            error!(error = %e, generated = self.generated, "generation failed");
            self.state = StreamState::Done;
        }
        Some(result)
    }
}

impl Drop for DecodeStream<'_> {
    fn drop(&mut self) {
        if self.state != StreamState::Done {
            debug!(generated = self.generated, "decode stream dropped before completion");
        }
    }
}
