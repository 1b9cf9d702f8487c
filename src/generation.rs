//! Seams between the revision engine and the model backends.

use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;

/// One item of a batch generation response.
///
/// Backends answer with a bare string, a `{"generated_text": ...}` record, or a
/// one-element list wrapping either.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum GenerationOutput {
    Text(String),
    Record { generated_text: String },
    Batch(Vec<GenerationOutput>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("generation wrapper was empty")]
    EmptyWrapper,
    #[error("generation wrapper held {0} items, expected one")]
    AmbiguousWrapper(usize),
    #[error("generation wrappers nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("no generation returned for prompt {0}")]
    Missing(usize),
}

const MAX_WRAPPER_DEPTH: usize = 4;

impl GenerationOutput {
    pub fn into_text(self) -> Result<String, ExtractError> {
        let mut current = self;
        for _ in 0..MAX_WRAPPER_DEPTH {
            current = match current {
                GenerationOutput::Text(text) => return Ok(text),
                GenerationOutput::Record { generated_text } => return Ok(generated_text),
                GenerationOutput::Batch(items) => {
                    let count = items.len();
                    let mut items = items.into_iter();
                    match (items.next(), count) {
                        (Some(inner), 1) => inner,
                        (None, _) => return Err(ExtractError::EmptyWrapper),
                        (Some(_), n) => return Err(ExtractError::AmbiguousWrapper(n)),
                    }
                }
            };
        }
        Err(ExtractError::TooDeep(MAX_WRAPPER_DEPTH))
    }
}

impl From<String> for GenerationOutput {
    fn from(text: String) -> Self {
        GenerationOutput::Text(text)
    }
}

/// Batch text generation. Errors mean the whole batch failed; per-item problems
/// show up as unusable outputs instead.
#[allow(async_fn_in_trait)]
pub trait Generator {
    async fn generate(
        &self,
        prompts: &[String],
        max_new_tokens: usize,
        temperature: f32,
    ) -> Result<Vec<GenerationOutput>>;
}

pub trait TokenCounter {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Counts whitespace-separated words as tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenCounter;

impl TokenCounter for WhitespaceTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}
