use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A heading-delimited section of a manuscript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub paragraphs: Vec<String>,
}

impl Chapter {
    pub fn new(title: impl Into<String>, paragraphs: Vec<String>) -> Self {
        Self {
            title: title.into(),
            paragraphs,
        }
    }

    /// Chapter body as the segmenter expects it: one paragraph per line.
    pub fn text(&self) -> String {
        self.paragraphs.join("\n").trim().to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    RevisedFirstTry,
    RevisedSecondTry,
    KeptOriginal,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::RevisedFirstTry => "revised_first_try",
            Provenance::RevisedSecondTry => "revised_second_try",
            Provenance::KeptOriginal => "kept_original",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionResult {
    pub provenance: Provenance,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMetrics {
    pub blocks: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub fallbacks: usize,
    pub first_try: usize,
    pub second_try: usize,
    pub kept_original: usize,
    /// Answers with nothing after the role marker, across both passes.
    pub empty_generations: usize,
    pub elapsed: Duration,
}

/// Audit record for a generation that had content before sanitizing and none after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerousCleanup {
    pub block_index: usize,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChapterRevision {
    pub results: Vec<RevisionResult>,
    pub metrics: ChapterMetrics,
    pub cleanups: Vec<DangerousCleanup>,
}

impl ChapterRevision {
    /// Output lines in block order, one document paragraph each.
    pub fn lines(&self) -> Vec<String> {
        self.results
            .iter()
            .flat_map(|result| result.text.split('\n'))
            .map(|line| line.trim().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisedChapter {
    pub title: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub chapters: usize,
    pub blocks: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub fallbacks: usize,
    pub first_try: usize,
    pub second_try: usize,
    pub kept_original: usize,
    pub empty_generations: usize,
    pub total_elapsed: Duration,
    pub average_chapter: Duration,
}
