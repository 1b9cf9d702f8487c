use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::config::RevisionConfig;
use crate::generation::{ExtractError, GenerationOutput, Generator, TokenCounter};
use crate::models::{ChapterMetrics, ChapterRevision, DangerousCleanup, Provenance, RevisionResult};
use crate::prompt::build_revision_prompt;
use crate::sanitize::{Cleaned, Sanitizer};

/// Revises a chapter's blocks in two batched passes.
///
/// Every block goes out in one first-pass batch. Blocks whose answer fails the
/// quality gate are sent once more at the retry temperature, and anything still
/// failing keeps its original text.
pub struct RevisionEngine<G, T> {
    generator: G,
    tokens: T,
    sanitizer: Sanitizer,
    config: RevisionConfig,
}

enum Verdict {
    Accepted(String),
    Rejected(&'static str),
}

#[derive(Default)]
struct Resolved {
    results: BTreeMap<usize, RevisionResult>,
    cleanups: Vec<DangerousCleanup>,
    empty_generations: usize,
}

impl Resolved {
    fn accept(&mut self, index: usize, provenance: Provenance, text: String) {
        self.results.insert(index, RevisionResult { provenance, text });
    }

    fn keep_original(&mut self, index: usize, block: &str) {
        self.accept(index, Provenance::KeptOriginal, block.to_string());
    }
}

impl<G: Generator, T: TokenCounter> RevisionEngine<G, T> {
    pub fn new(generator: G, tokens: T, config: RevisionConfig) -> Self {
        Self {
            generator,
            tokens,
            sanitizer: Sanitizer::new(config.marker_policy),
            config,
        }
    }

    /// Replaces the sanitizer built from the config's marker policy.
    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn config(&self) -> &RevisionConfig {
        &self.config
    }

    /// Generation budget shared by both passes, derived from the longest block.
    pub fn max_new_tokens(&self, blocks: &[String]) -> usize {
        generation_budget(blocks, &self.tokens, &self.config)
    }

    pub async fn revise(&self, blocks: &[String]) -> Result<ChapterRevision> {
        let started = Instant::now();
        if blocks.is_empty() {
            return Ok(ChapterRevision::default());
        }

        let input_tokens: usize = blocks
            .iter()
            .filter(|block| !block.trim().is_empty())
            .map(|block| self.tokens.count_tokens(block))
            .sum();
        let max_new_tokens = self.max_new_tokens(blocks);

        tracing::info!(
            blocks = blocks.len(),
            input_tokens,
            max_new_tokens,
            "sending first revision pass"
        );
        let prompts: Vec<String> = blocks.iter().map(|b| build_revision_prompt(b)).collect();
        let responses = self
            .generator
            .generate(&prompts, max_new_tokens, self.config.first_pass_temperature)
            .await
            .context("first revision pass failed")?;

        let mut resolved = Resolved::default();
        let mut retry = Vec::new();
        let mut responses = responses.into_iter();
        for (index, block) in blocks.iter().enumerate() {
            let response = responses.next().ok_or(ExtractError::Missing(index));
            match self.judge(index, block, response, &mut resolved) {
                Verdict::Accepted(text) => resolved.accept(index, Provenance::RevisedFirstTry, text),
                Verdict::Rejected(reason) => {
                    tracing::debug!(block = index, reason, "queued for retry");
                    retry.push(index);
                }
            }
        }

        if !retry.is_empty() {
            self.retry_pass(blocks, &retry, max_new_tokens, &mut resolved)
                .await;
        }

        let results: Vec<RevisionResult> = blocks
            .iter()
            .enumerate()
            .map(|(index, block)| {
                let result = resolved.results.remove(&index).unwrap_or_else(|| RevisionResult {
                    provenance: Provenance::KeptOriginal,
                    text: block.clone(),
                });
                tracing::debug!(block = index, provenance = result.provenance.as_str(), "block resolved");
                result
            })
            .collect();

        let metrics = self.metrics(&results, input_tokens, resolved.empty_generations, started);
        tracing::info!(
            first_try = metrics.first_try,
            second_try = metrics.second_try,
            kept_original = metrics.kept_original,
            empty_generations = metrics.empty_generations,
            output_tokens = metrics.output_tokens,
            "chapter revised"
        );

        Ok(ChapterRevision {
            results,
            metrics,
            cleanups: resolved.cleanups,
        })
    }

    async fn retry_pass(
        &self,
        blocks: &[String],
        retry: &[usize],
        max_new_tokens: usize,
        resolved: &mut Resolved,
    ) {
        tracing::info!(blocks = retry.len(), "sending retry pass");
        let prompts: Vec<String> = retry
            .iter()
            .map(|&index| build_revision_prompt(&blocks[index]))
            .collect();

        let responses = match self
            .generator
            .generate(&prompts, max_new_tokens, self.config.retry_temperature)
            .await
        {
            Ok(responses) => responses,
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::warn!(error = %reason, blocks = retry.len(), "retry pass failed; keeping originals");
                for &index in retry {
                    resolved.keep_original(index, &blocks[index]);
                }
                return;
            }
        };

        let mut responses = responses.into_iter();
        for (position, &index) in retry.iter().enumerate() {
            let block = &blocks[index];
            let response = responses.next().ok_or(ExtractError::Missing(position));
            match self.judge(index, block, response, resolved) {
                Verdict::Accepted(text) => {
                    resolved.accept(index, Provenance::RevisedSecondTry, text)
                }
                Verdict::Rejected(reason) => {
                    tracing::debug!(block = index, reason, "keeping original text");
                    resolved.keep_original(index, block);
                }
            }
        }
    }

    /// Extracts, sanitizes and length-gates one response.
    fn judge(
        &self,
        index: usize,
        block: &str,
        response: Result<GenerationOutput, ExtractError>,
        resolved: &mut Resolved,
    ) -> Verdict {
        let raw = match response.and_then(GenerationOutput::into_text) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(block = index, error = %err, "unusable generation response");
                return Verdict::Rejected("extraction failed");
            }
        };

        let text = match self.sanitizer.clean(&raw) {
            Cleaned::Revised(text) => text,
            Cleaned::MissingMarker => return Verdict::Rejected("role marker missing"),
            Cleaned::NothingGenerated => {
                resolved.empty_generations += 1;
                tracing::debug!(block = index, raw = %raw, "nothing generated after role marker");
                return Verdict::Rejected("empty generation");
            }
            Cleaned::Discarded => {
                resolved.cleanups.push(DangerousCleanup {
                    block_index: index,
                    before: raw,
                    after: String::new(),
                });
                return Verdict::Rejected("sanitizer removed everything");
            }
        };

        if passes_length_gate(&text, block, self.config.min_length_ratio) {
            Verdict::Accepted(text)
        } else {
            Verdict::Rejected("revision too short")
        }
    }

    fn metrics(
        &self,
        results: &[RevisionResult],
        input_tokens: usize,
        empty_generations: usize,
        started: Instant,
    ) -> ChapterMetrics {
        let count = |provenance: Provenance| {
            results
                .iter()
                .filter(|result| result.provenance == provenance)
                .count()
        };
        let kept_original = count(Provenance::KeptOriginal);
        ChapterMetrics {
            blocks: results.len(),
            input_tokens,
            output_tokens: results
                .iter()
                .filter(|result| !result.text.trim().is_empty())
                .map(|result| self.tokens.count_tokens(&result.text))
                .sum(),
            fallbacks: kept_original,
            first_try: count(Provenance::RevisedFirstTry),
            second_try: count(Provenance::RevisedSecondTry),
            kept_original,
            empty_generations,
            elapsed: started.elapsed(),
        }
    }
}

/// Token count of the longest non-blank block, with a margin for long blocks,
/// clamped to the configured bounds.
pub fn generation_budget<T: TokenCounter>(blocks: &[String], tokens: &T, config: &RevisionConfig) -> usize {
    let longest = blocks
        .iter()
        .filter(|block| !block.trim().is_empty())
        .map(|block| tokens.count_tokens(block))
        .max()
        .unwrap_or(0);
    let margin = if longest > config.long_block_tokens {
        f64::from(config.long_block_margin)
    } else {
        1.0
    };
    let scaled = (longest as f64 * margin) as usize;
    scaled.max(config.min_new_tokens).min(config.max_new_tokens)
}

fn passes_length_gate(revised: &str, original: &str, min_ratio: f32) -> bool {
    let revised_words = revised.split_whitespace().count();
    let original_words = original.split_whitespace().count();
    revised_words > 0 && revised_words as f64 >= original_words as f64 * f64::from(min_ratio)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use proptest::prelude::*;

    use super::*;
    use crate::generation::WhitespaceTokenCounter;
    use crate::sanitize::{RewriteRule, ROLE_MARKER};

    /// Replays scripted batch answers and records every call.
    struct ScriptedGenerator {
        batches: RefCell<Vec<Result<Vec<GenerationOutput>>>>,
        calls: RefCell<Vec<(Vec<String>, usize, f32)>>,
    }

    impl ScriptedGenerator {
        fn new(batches: Vec<Result<Vec<GenerationOutput>>>) -> Self {
            Self {
                batches: RefCell::new(batches.into_iter().rev().collect()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Generator for ScriptedGenerator {
        async fn generate(
            &self,
            prompts: &[String],
            max_new_tokens: usize,
            temperature: f32,
        ) -> Result<Vec<GenerationOutput>> {
            self.calls
                .borrow_mut()
                .push((prompts.to_vec(), max_new_tokens, temperature));
            self.batches
                .borrow_mut()
                .pop()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted batch left")))
        }
    }

    /// Answers every prompt with the prompt itself.
    struct EchoGenerator;

    impl Generator for EchoGenerator {
        async fn generate(
            &self,
            prompts: &[String],
            _max_new_tokens: usize,
            _temperature: f32,
        ) -> Result<Vec<GenerationOutput>> {
            Ok(prompts.iter().cloned().map(GenerationOutput::from).collect())
        }
    }

    fn answer(block: &str, revision: &str) -> GenerationOutput {
        GenerationOutput::Record {
            generated_text: format!("{}{revision}<|im_end|>", build_revision_prompt(block)),
        }
    }

    fn engine<G: Generator>(generator: G) -> RevisionEngine<G, WhitespaceTokenCounter> {
        RevisionEngine::new(generator, WhitespaceTokenCounter, RevisionConfig::default())
    }

    fn blocks(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let generator = ScriptedGenerator::new(vec![]);
        let engine = engine(generator);
        let revision = engine.revise(&[]).await.unwrap();
        assert!(revision.results.is_empty());
        assert_eq!(revision.metrics.blocks, 0);
        assert_eq!(revision.metrics.input_tokens, 0);
        assert_eq!(revision.metrics.output_tokens, 0);
        assert_eq!(revision.metrics.fallbacks, 0);
        assert!(engine.generator.calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn both_blocks_accepted_on_first_try() {
        let input = blocks(&["Alice said hello to Bob.", "Bob waved back at her."]);
        let generator = ScriptedGenerator::new(vec![Ok(vec![
            answer(&input[0], "Alice said hello to Bob."),
            GenerationOutput::Batch(vec![answer(&input[1], "Bob waved back to her.")]),
        ])]);
        let engine = engine(generator);

        let revision = engine.revise(&input).await.unwrap();
        assert_eq!(revision.results.len(), 2);
        assert!(revision
            .results
            .iter()
            .all(|r| r.provenance == Provenance::RevisedFirstTry));
        assert_eq!(revision.results[0].text, "Alice said hello to Bob.");
        assert_eq!(revision.results[1].text, "Bob waved back to her.");
        assert_eq!(revision.metrics.first_try, 2);
        assert_eq!(revision.metrics.second_try, 0);
        assert_eq!(revision.metrics.input_tokens, 10);
        assert_eq!(revision.metrics.output_tokens, 10);
        assert_eq!(engine.generator.calls.borrow().len(), 1);
    }

    #[tokio::test]
    async fn echo_generator_keeps_every_original() {
        let input = blocks(&["The sect master frowned.", "Snow fell on the peak."]);
        let revision = engine(EchoGenerator).revise(&input).await.unwrap();
        assert!(revision
            .results
            .iter()
            .all(|r| r.provenance == Provenance::KeptOriginal));
        assert_eq!(revision.results[0].text, input[0]);
        assert_eq!(revision.results[1].text, input[1]);
        assert_eq!(revision.metrics.fallbacks, 2);
        assert_eq!(revision.metrics.empty_generations, 4);
        assert!(revision.cleanups.is_empty());
    }

    #[tokio::test]
    async fn custom_sanitizer_rules_apply_to_answers() {
        let input = blocks(&["The bell rang twice."]);
        let generator = ScriptedGenerator::new(vec![Ok(vec![answer(
            &input[0],
            "The bell rang twice. [TN: temple bell]",
        )])]);
        let rule = RewriteRule::new("translator_notes", r"[ \t]*\[TN:[^\]]*\]", "").unwrap();
        let engine = engine(generator).with_sanitizer(Sanitizer::default().with_rule(rule));

        let revision = engine.revise(&input).await.unwrap();
        assert_eq!(revision.results[0].provenance, Provenance::RevisedFirstTry);
        assert_eq!(revision.results[0].text, "The bell rang twice.");
    }

    #[tokio::test]
    async fn retry_resolves_only_failed_blocks_in_order() {
        let input = blocks(&[
            "One two three four.",
            "Five six seven eight.",
            "Nine ten eleven twelve.",
        ]);
        let generator = ScriptedGenerator::new(vec![
            Ok(vec![
                answer(&input[0], "One two three four."),
                answer(&input[1], "Five."),
                GenerationOutput::Batch(vec![]),
            ]),
            Ok(vec![
                answer(&input[1], "Five six seven eight!"),
                answer(&input[2], "Nine."),
            ]),
        ]);
        let engine = engine(generator);

        let revision = engine.revise(&input).await.unwrap();
        let provenance: Vec<Provenance> = revision.results.iter().map(|r| r.provenance).collect();
        assert_eq!(
            provenance,
            vec![
                Provenance::RevisedFirstTry,
                Provenance::RevisedSecondTry,
                Provenance::KeptOriginal,
            ]
        );
        assert_eq!(revision.results[1].text, "Five six seven eight!");
        assert_eq!(revision.results[2].text, input[2]);
        assert_eq!(
            (revision.metrics.first_try, revision.metrics.second_try, revision.metrics.kept_original),
            (1, 1, 1)
        );

        let calls = engine.generator.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, vec![build_revision_prompt(&input[1]), build_revision_prompt(&input[2])]);
        assert_eq!(calls[0].1, calls[1].1);
        assert!(calls[1].2 < calls[0].2);
    }

    #[tokio::test]
    async fn first_pass_failure_propagates() {
        let generator = ScriptedGenerator::new(vec![Err(anyhow::anyhow!("connection refused"))]);
        let err = engine(generator)
            .revise(&blocks(&["A block."]))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
    }

    #[tokio::test]
    async fn retry_pass_failure_keeps_originals() {
        let input = blocks(&["Short one here.", "Another short one."]);
        let generator = ScriptedGenerator::new(vec![
            Ok(vec![answer(&input[0], "Short one here."), answer(&input[1], "")]),
            Err(anyhow::anyhow!("out of memory")),
        ]);
        let revision = engine(generator).revise(&input).await.unwrap();
        assert_eq!(revision.results[0].provenance, Provenance::RevisedFirstTry);
        assert_eq!(revision.results[1].provenance, Provenance::KeptOriginal);
        assert_eq!(revision.results[1].text, input[1]);
    }

    #[tokio::test]
    async fn missing_responses_are_retried() {
        let input = blocks(&["First block.", "Second block."]);
        let generator = ScriptedGenerator::new(vec![
            Ok(vec![answer(&input[0], "First block.")]),
            Ok(vec![answer(&input[1], "Second block.")]),
        ]);
        let revision = engine(generator).revise(&input).await.unwrap();
        assert_eq!(revision.results[1].provenance, Provenance::RevisedSecondTry);
    }

    #[tokio::test]
    async fn dangerous_cleanup_is_recorded() {
        let input = blocks(&["The lake was still."]);
        let raw = format!("{}(No changes needed.)", build_revision_prompt(&input[0]));
        let generator = ScriptedGenerator::new(vec![
            Ok(vec![GenerationOutput::Text(raw.clone())]),
            Ok(vec![answer(&input[0], "The lake was still.")]),
        ]);
        let revision = engine(generator).revise(&input).await.unwrap();
        assert_eq!(revision.results[0].provenance, Provenance::RevisedSecondTry);
        assert_eq!(revision.cleanups.len(), 1);
        assert_eq!(revision.cleanups[0].block_index, 0);
        assert_eq!(revision.cleanups[0].before, raw);
        assert!(revision.cleanups[0].after.is_empty());
    }

    #[test]
    fn token_budget_is_clamped_with_margin_for_long_blocks() {
        let engine = engine(EchoGenerator);
        assert_eq!(engine.max_new_tokens(&[]), 128);
        assert_eq!(engine.max_new_tokens(&blocks(&["a b c"])), 128);
        assert_eq!(engine.max_new_tokens(&[vec!["w"; 150].join(" ")]), 150);
        assert_eq!(engine.max_new_tokens(&[vec!["w"; 200].join(" ")]), 200);
        assert_eq!(engine.max_new_tokens(&[vec!["w"; 300].join(" ")]), 360);
        assert_eq!(engine.max_new_tokens(&[vec!["w"; 1000].join(" ")]), 768);
    }

    #[test]
    fn length_gate_needs_half_the_words() {
        assert!(passes_length_gate("a b", "a b c d", 0.5));
        assert!(!passes_length_gate("a", "a b c d", 0.5));
        assert!(!passes_length_gate("", "", 0.5));
        assert!(passes_length_gate("a", "", 0.5));
    }

    proptest! {
        #[test]
        fn every_block_resolves_in_its_own_position(
            script in prop::collection::vec((any::<bool>(), any::<bool>()), 1..8)
        ) {
            let input: Vec<String> = (0..script.len())
                .map(|i| format!("Block number {i} stays put."))
                .collect();
            let first: Vec<GenerationOutput> = input
                .iter()
                .zip(&script)
                .map(|(block, &(first_ok, _))| answer(block, if first_ok { block.as_str() } else { "" }))
                .collect();
            let second: Vec<GenerationOutput> = input
                .iter()
                .zip(&script)
                .filter(|(_, step)| !step.0)
                .map(|(block, &(_, second_ok))| answer(block, if second_ok { block.as_str() } else { "" }))
                .collect();
            let generator = ScriptedGenerator::new(vec![Ok(first), Ok(second)]);
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let revision = runtime.block_on(engine(generator).revise(&input)).unwrap();

            prop_assert_eq!(revision.results.len(), input.len());
            prop_assert_eq!(revision.metrics.blocks, input.len());
            for ((result, block), &(first_ok, second_ok)) in revision.results.iter().zip(&input).zip(&script) {
                let expected = match (first_ok, second_ok) {
                    (true, _) => Provenance::RevisedFirstTry,
                    (false, true) => Provenance::RevisedSecondTry,
                    (false, false) => Provenance::KeptOriginal,
                };
                prop_assert_eq!(result.provenance, expected);
                prop_assert_eq!(&result.text, block);
            }
        }
    }

    #[test]
    fn marker_is_part_of_scripted_answers() {
        let GenerationOutput::Record { generated_text } = answer("x", "y") else {
            panic!("expected record");
        };
        assert!(generated_text.contains(ROLE_MARKER));
    }
}
