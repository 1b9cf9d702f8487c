use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::generation::{Generator, TokenCounter};
use crate::manuscript::DocumentStore;
use crate::models::{RevisedChapter, RunSummary};
use crate::revise::RevisionEngine;
use crate::run_log::RunLog;
use crate::segment::segment;

#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub output: PathBuf,
    pub summary: RunSummary,
}

/// Runs every chapter of one manuscript through the revision engine.
pub struct Reviser<G, T> {
    engine: RevisionEngine<G, T>,
}

impl<G: Generator, T: TokenCounter> Reviser<G, T> {
    pub fn new(engine: RevisionEngine<G, T>) -> Self {
        Self { engine }
    }

    /// Revises the manuscript behind `store`, logging into `log`.
    ///
    /// A failed first pass aborts the document before anything is written; the
    /// log keeps the entries of the chapters finished so far.
    pub async fn revise_document<S, W>(&self, store: &S, mut log: RunLog<W>) -> Result<DocumentReport>
    where
        S: DocumentStore,
        W: Write,
    {
        let started = Instant::now();
        let chapters = store.read_chapters()?;
        tracing::info!(chapters = chapters.len(), "chapters identified");

        let max_lines = self.engine.config().max_lines;
        let mut revised = Vec::with_capacity(chapters.len());
        for (number, chapter) in chapters.iter().enumerate() {
            tracing::info!(
                chapter = number + 1,
                of = chapters.len(),
                title = %chapter.title,
                elapsed_secs = started.elapsed().as_secs(),
                "revising chapter"
            );

            let blocks = segment(&chapter.text(), max_lines);
            let revision = self
                .engine
                .revise(&blocks)
                .await
                .with_context(|| format!("chapter {:?} could not be revised", chapter.title))?;

            for cleanup in &revision.cleanups {
                log.record_dangerous_cleanup(cleanup.block_index, &cleanup.before, &cleanup.after)?;
            }
            log.record_chapter(&chapter.title, &revision.metrics)?;

            revised.push(RevisedChapter {
                title: chapter.title.clone(),
                lines: revision.lines(),
            });
        }

        let output = store.write_document(&revised)?;
        let summary = log.finalize()?;
        tracing::info!(
            output = %output.display(),
            elapsed_secs = started.elapsed().as_secs(),
            fallbacks = summary.fallbacks,
            "revision complete"
        );

        Ok(DocumentReport { output, summary })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use chrono::Local;

    use super::*;
    use crate::config::RevisionConfig;
    use crate::generation::{GenerationOutput, WhitespaceTokenCounter};
    use crate::models::Chapter;

    struct MemoryStore {
        chapters: Vec<Chapter>,
        written: RefCell<Option<Vec<RevisedChapter>>>,
    }

    impl DocumentStore for MemoryStore {
        fn read_chapters(&self) -> Result<Vec<Chapter>> {
            Ok(self.chapters.clone())
        }

        fn write_document(&self, chapters: &[RevisedChapter]) -> Result<PathBuf> {
            *self.written.borrow_mut() = Some(chapters.to_vec());
            Ok(PathBuf::from("memory.docx"))
        }
    }

    /// Uppercases each block; fails every call after `fail_after` calls.
    struct ShoutingGenerator {
        calls: Cell<usize>,
        fail_after: usize,
    }

    impl Generator for ShoutingGenerator {
        async fn generate(
            &self,
            prompts: &[String],
            _max_new_tokens: usize,
            _temperature: f32,
        ) -> Result<Vec<GenerationOutput>> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            if call >= self.fail_after {
                anyhow::bail!("backend offline");
            }
            Ok(prompts
                .iter()
                .map(|prompt| {
                    let block = prompt
                        .split("<start>\n")
                        .nth(1)
                        .and_then(|rest| rest.split("\n<end>").next())
                        .unwrap_or_default();
                    GenerationOutput::Text(format!("{prompt}{}<|im_end|>", block.to_uppercase()))
                })
                .collect())
        }
    }

    fn reviser(fail_after: usize) -> Reviser<ShoutingGenerator, WhitespaceTokenCounter> {
        let generator = ShoutingGenerator {
            calls: Cell::new(0),
            fail_after,
        };
        Reviser::new(RevisionEngine::new(
            generator,
            WhitespaceTokenCounter,
            RevisionConfig {
                max_lines: 2,
                ..RevisionConfig::default()
            },
        ))
    }

    fn store() -> MemoryStore {
        MemoryStore {
            chapters: vec![
                Chapter::new(
                    "Chapter 1",
                    vec![
                        "The gate opened.".to_string(),
                        "A cold wind blew.".to_string(),
                        "He stepped in.".to_string(),
                    ],
                ),
                Chapter::new("Chapter 2", vec!["Silence.".to_string()]),
            ],
            written: RefCell::new(None),
        }
    }

    #[tokio::test]
    async fn revises_and_writes_every_chapter() {
        let store = store();
        let log = RunLog::open(Vec::new(), "memory", Local::now()).unwrap();
        let report = reviser(usize::MAX).revise_document(&store, log).await.unwrap();

        assert_eq!(report.output, PathBuf::from("memory.docx"));
        assert_eq!(report.summary.chapters, 2);
        assert_eq!(report.summary.blocks, 3);
        assert_eq!(report.summary.first_try, 3);

        let written = store.written.borrow().clone().unwrap();
        assert_eq!(written[0].title, "Chapter 1");
        assert_eq!(
            written[0].lines,
            vec!["THE GATE OPENED.", "A COLD WIND BLEW.", "HE STEPPED IN."]
        );
        assert_eq!(written[1].lines, vec!["SILENCE."]);
    }

    #[tokio::test]
    async fn first_pass_outage_aborts_without_writing() {
        let store = store();
        let log = RunLog::open(Vec::new(), "memory", Local::now()).unwrap();
        let err = reviser(1).revise_document(&store, log).await.unwrap_err();

        assert!(format!("{err:#}").contains("Chapter 2"));
        assert!(format!("{err:#}").contains("backend offline"));
        assert!(store.written.borrow().is_none());
    }
}
