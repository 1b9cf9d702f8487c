pub mod docx;

use std::path::PathBuf;

use anyhow::Result;

use crate::models::{Chapter, RevisedChapter};

pub use docx::DocxStore;

/// A paragraph as read from the source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceParagraph {
    pub text: String,
    pub is_heading: bool,
}

impl SourceParagraph {
    pub fn body(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_heading: false,
        }
    }

    pub fn heading(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_heading: true,
        }
    }
}

pub trait DocumentStore {
    fn read_chapters(&self) -> Result<Vec<Chapter>>;

    /// Writes the revised manuscript and returns where it went.
    fn write_document(&self, chapters: &[RevisedChapter]) -> Result<PathBuf>;
}

/// Splits a paragraph stream into chapters at heading paragraphs.
///
/// Blank paragraphs and body paragraphs repeating the current title are
/// dropped. Text before the first heading becomes an untitled chapter.
pub fn group_chapters(paragraphs: impl IntoIterator<Item = SourceParagraph>) -> Vec<Chapter> {
    let mut chapters = Vec::new();
    let mut current: Option<Chapter> = None;

    for paragraph in paragraphs {
        let text = paragraph.text.trim();
        if paragraph.is_heading {
            if text.is_empty() {
                continue;
            }
            chapters.extend(current.take());
            current = Some(Chapter::new(text, Vec::new()));
            continue;
        }

        let chapter = current.get_or_insert_with(|| Chapter::new("", Vec::new()));
        if text.is_empty() || text == chapter.title {
            continue;
        }
        chapter.paragraphs.push(text.to_string());
    }

    chapters.extend(current);
    chapters
        .into_iter()
        .filter(|chapter| !chapter.title.is_empty() || !chapter.paragraphs.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_split_chapters_and_drop_repeated_titles() {
        let chapters = group_chapters(vec![
            SourceParagraph::heading("Chapter 1"),
            SourceParagraph::body("Chapter 1"),
            SourceParagraph::body("The wind rose."),
            SourceParagraph::body("   "),
            SourceParagraph::heading("Chapter 2"),
            SourceParagraph::body("Night fell."),
        ]);
        assert_eq!(
            chapters,
            vec![
                Chapter::new("Chapter 1", vec!["The wind rose.".to_string()]),
                Chapter::new("Chapter 2", vec!["Night fell.".to_string()]),
            ]
        );
    }

    #[test]
    fn front_matter_becomes_untitled_chapter() {
        let chapters = group_chapters(vec![
            SourceParagraph::body("Translator's note."),
            SourceParagraph::heading("Chapter 1"),
            SourceParagraph::body("Body."),
        ]);
        assert_eq!(chapters[0], Chapter::new("", vec!["Translator's note.".to_string()]));
        assert_eq!(chapters[1].title, "Chapter 1");
    }

    #[test]
    fn empty_heading_keeps_its_chapter() {
        let chapters = group_chapters(vec![
            SourceParagraph::heading("Volume One"),
            SourceParagraph::heading("Chapter 1"),
            SourceParagraph::body("Body."),
        ]);
        assert_eq!(chapters.len(), 2);
        assert!(chapters[0].paragraphs.is_empty());
        assert_eq!(chapters[1].paragraphs, vec!["Body.".to_string()]);
    }

    #[test]
    fn blank_document_has_no_chapters() {
        assert!(group_chapters(vec![SourceParagraph::body(" ")]).is_empty());
    }
}
