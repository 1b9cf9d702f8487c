//! Human-readable per-run log: one entry per chapter plus a closing summary.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::models::{ChapterMetrics, RunSummary};

pub struct RunLog<W: Write> {
    sink: W,
    started_at: DateTime<Local>,
    chapters: Vec<ChapterMetrics>,
}

impl RunLog<BufWriter<File>> {
    /// Creates `log_<source>_<timestamp>.txt` under `log_dir`, truncating any previous file.
    pub fn create(log_dir: &Path, source_name: &str) -> Result<(Self, PathBuf)> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let started_at = Local::now();
        let path = log_dir.join(format!(
            "log_{source_name}_{}.txt",
            started_at.format("%Y-%m-%d_%H-%M")
        ));
        let file = File::create(&path)
            .with_context(|| format!("failed to create run log {}", path.display()))?;
        let log = Self::open(BufWriter::new(file), source_name, started_at)?;
        Ok((log, path))
    }
}

impl<W: Write> RunLog<W> {
    pub fn open(sink: W, source_name: &str, started_at: DateTime<Local>) -> Result<Self> {
        let mut log = Self {
            sink,
            started_at,
            chapters: Vec::new(),
        };
        log.append(&format!(
            "[doc] File: {source_name}.docx\n[start] Started: {}\n\n",
            started_at.format("%Y-%m-%d %H:%M:%S")
        ))?;
        Ok(log)
    }

    pub fn record_source_digest(&mut self, sha256: &str) -> Result<()> {
        self.append(&format!("[sha256] {sha256}\n\n"))
    }

    pub fn record_chapter(&mut self, title: &str, metrics: &ChapterMetrics) -> Result<()> {
        let entry = format!(
            "-- {title} --\n\
             Blocks: {}\n\
             Tokens (input): {}\n\
             Tokens (output): {}\n\
             Fallbacks: {}\n\
             Empty generations: {}\n\
             Revised (try 1): {}\n\
             Revised (try 2): {}\n\
             Kept original: {}\n\
             Time: {}\n\n",
            metrics.blocks,
            group_thousands(metrics.input_tokens),
            group_thousands(metrics.output_tokens),
            metrics.fallbacks,
            metrics.empty_generations,
            metrics.first_try,
            metrics.second_try,
            metrics.kept_original,
            minutes_seconds(metrics.elapsed),
        );
        self.chapters.push(metrics.clone());
        self.append(&entry)
    }

    pub fn record_dangerous_cleanup(&mut self, block_index: usize, before: &str, after: &str) -> Result<()> {
        self.append(&format!(
            "[!] Block #{block_index} emptied by cleanup\n\
             >>> BEFORE CLEANUP:\n{before}\n\
             >>> AFTER CLEANUP:\n{after}\n\
             {}\n",
            "=".repeat(100)
        ))
    }

    pub fn chapters_recorded(&self) -> usize {
        self.chapters.len()
    }

    /// Writes the grand totals and closes the sink.
    pub fn finalize(mut self) -> Result<RunSummary> {
        let finished_at = Local::now();
        let summary = summarize(
            &self.chapters,
            (finished_at - self.started_at).to_std().unwrap_or_default(),
        );

        let entry = format!(
            "[done] Finished: {}\n\
             Total chapters: {}\n\
             Total blocks: {}\n\
             Total tokens (input): {}\n\
             Total tokens (output): {}\n\
             Total fallbacks: {}\n\
             Total empty generations: {}\n\
             Total revised (try 1): {}\n\
             Total revised (try 2): {}\n\
             Total kept original: {}\n\
             Total time: {}\n\
             Average time per chapter: {}\n",
            finished_at.format("%Y-%m-%d %H:%M:%S"),
            summary.chapters,
            summary.blocks,
            group_thousands(summary.input_tokens),
            group_thousands(summary.output_tokens),
            summary.fallbacks,
            summary.empty_generations,
            summary.first_try,
            summary.second_try,
            summary.kept_original,
            hours_minutes_seconds(summary.total_elapsed),
            minutes_seconds(summary.average_chapter),
        );
        self.append(&entry)?;
        Ok(summary)
    }

    fn append(&mut self, text: &str) -> Result<()> {
        self.sink
            .write_all(text.as_bytes())
            .context("failed to write run log")?;
        self.sink.flush().context("failed to flush run log")
    }

    #[cfg(test)]
    fn into_sink(self) -> W {
        self.sink
    }
}

fn summarize(chapters: &[ChapterMetrics], total_elapsed: Duration) -> RunSummary {
    let chapter_time: Duration = chapters.iter().map(|c| c.elapsed).sum();
    let average_chapter = match u32::try_from(chapters.len()) {
        Ok(0) | Err(_) => Duration::ZERO,
        Ok(count) => chapter_time / count,
    };

    RunSummary {
        chapters: chapters.len(),
        blocks: chapters.iter().map(|c| c.blocks).sum(),
        input_tokens: chapters.iter().map(|c| c.input_tokens).sum(),
        output_tokens: chapters.iter().map(|c| c.output_tokens).sum(),
        fallbacks: chapters.iter().map(|c| c.fallbacks).sum(),
        first_try: chapters.iter().map(|c| c.first_try).sum(),
        second_try: chapters.iter().map(|c| c.second_try).sum(),
        kept_original: chapters.iter().map(|c| c.kept_original).sum(),
        empty_generations: chapters.iter().map(|c| c.empty_generations).sum(),
        total_elapsed,
        average_chapter,
    }
}

fn group_thousands(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn minutes_seconds(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}

fn hours_minutes_seconds(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
