mod lifecycle;
mod tokenizer;

use std::sync::Arc;

use crate::backend::InferencePipeline;
use crate::prompting::PromptStrategy;
use crate::session::SessionState;

pub use lifecycle::Lifecycle;
pub use tokenizer::{HfTokenizer, IncrementalDecoder, TextTokenizer};

/// Everything the decode loop mutates, installed once per process.
pub struct Engine {
    pub(crate) pipeline: Box<dyn InferencePipeline>,
    pub(crate) tokenizer: Arc<dyn TextTokenizer>,
    pub(crate) strategy: PromptStrategy,
    pub(crate) session: SessionState,
}

impl Engine {
    pub fn new(
        pipeline: Box<dyn InferencePipeline>,
        tokenizer: Arc<dyn TextTokenizer>,
        context_length: usize,
    ) -> Self {
        let strategy = PromptStrategy::probe(tokenizer.as_ref());
        Self {
            pipeline,
            tokenizer,
            strategy,
            session: SessionState::new(context_length),
        }
    }

    pub fn strategy(&self) -> PromptStrategy {
        self.strategy
    }

    pub fn context_length(&self) -> usize {
        self.session.context_length()
    }
}
