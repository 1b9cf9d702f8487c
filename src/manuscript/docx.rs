use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use roxmltree::Document;
use zip::write::SimpleFileOptions;
use zip::result::ZipError;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{group_chapters, DocumentStore, SourceParagraph};
use crate::models::{Chapter, RevisedChapter};

const HEADING_STYLES: &[&str] = &["heading1", "heading2"];

/// Reads chapters from one DOCX file and writes the revision to another.
#[derive(Debug, Clone)]
pub struct DocxStore {
    input: PathBuf,
    output: PathBuf,
}

impl DocxStore {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// `<output_dir>/<stem>_revised.docx` for the given input.
    pub fn with_output_dir(input: impl Into<PathBuf>, output_dir: &Path) -> Self {
        let input = input.into();
        let output = output_dir.join(format!("{}_revised.docx", source_stem(&input)));
        Self { input, output }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl DocumentStore for DocxStore {
    fn read_chapters(&self) -> Result<Vec<Chapter>> {
        let paragraphs = read_paragraphs(&self.input)?;
        Ok(group_chapters(paragraphs))
    }

    fn write_document(&self, chapters: &[RevisedChapter]) -> Result<PathBuf> {
        if let Some(parent) = self.output.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = File::create(&self.output)
            .with_context(|| format!("failed to create DOCX: {}", self.output.display()))?;
        write_docx(chapters, file)
            .with_context(|| format!("failed to write DOCX: {}", self.output.display()))?;
        Ok(self.output.clone())
    }
}

pub fn source_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manuscript".to_string())
}

pub fn read_paragraphs(path: &Path) -> Result<Vec<SourceParagraph>> {
    let file =
        File::open(path).with_context(|| format!("failed to open DOCX: {}", path.display()))?;
    let mut archive = ZipArchive::new(file).context("DOCX is not a valid ZIP archive")?;

    let document_xml = read_entry(&mut archive, "word/document.xml")?
        .context("DOCX missing word/document.xml")?;
    let style_names = match read_entry(&mut archive, "word/styles.xml")? {
        Some(styles_xml) => parse_style_names(&styles_xml)?,
        None => HashMap::new(),
    };

    parse_document_xml(&document_xml, &style_names)
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<String>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to open {name}")),
    };
    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .with_context(|| format!("failed to read {name}"))?;
    Ok(Some(xml))
}

/// Maps each paragraph styleId to its display name. Localized Word
/// documents keep the `heading 1` name while the id is translated.
fn parse_style_names(xml: &str) -> Result<HashMap<String, String>> {
    let doc = Document::parse(xml).context("failed to parse DOCX styles XML")?;

    let names = doc
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "style")
        .filter_map(|style| {
            let id = style
                .attributes()
                .find(|attr| attr.name() == "styleId")?
                .value()
                .to_string();
            let name = style
                .children()
                .find(|node| node.is_element() && node.tag_name().name() == "name")?
                .attributes()
                .find(|attr| attr.name() == "val")?
                .value()
                .to_string();
            Some((id, name))
        })
        .collect();

    Ok(names)
}

fn parse_document_xml(xml: &str, style_names: &HashMap<String, String>) -> Result<Vec<SourceParagraph>> {
    let doc = Document::parse(xml).context("failed to parse DOCX XML")?;

    let paragraphs = doc
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "p")
        .map(|paragraph| {
            let style = paragraph
                .descendants()
                .find(|node| node.is_element() && node.tag_name().name() == "pStyle")
                .and_then(|node| {
                    node.attributes()
                        .find(|attr| attr.name() == "val")
                        .map(|attr| attr.value().to_string())
                });

            let text: String = paragraph
                .descendants()
                .filter(|node| node.is_element())
                .filter_map(|node| match node.tag_name().name() {
                    "t" => node.text(),
                    "tab" => Some("\t"),
                    "br" | "cr" => Some("\n"),
                    _ => None,
                })
                .collect();

            let is_heading = style.as_deref().is_some_and(|id| {
                style_names.get(id).is_some_and(|name| is_heading_style(name)) || is_heading_style(id)
            });

            SourceParagraph {
                text: normalize_text(&text),
                is_heading,
            }
        })
        .collect();

    Ok(paragraphs)
}

fn is_heading_style(style: &str) -> bool {
    let compact: String = style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    HEADING_STYLES.contains(&compact.as_str())
}

/// Soft line breaks stay as `\n`; every line is trimmed.
fn normalize_text(input: &str) -> String {
    input
        .replace('\u{00A0}', " ")
        .split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

pub fn write_docx<W: Write + Seek>(chapters: &[RevisedChapter], writer: W) -> Result<()> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("[Content_Types].xml", options)?;
    zip.write_all(CONTENT_TYPES_XML.as_bytes())?;
    zip.start_file("_rels/.rels", options)?;
    zip.write_all(PACKAGE_RELS_XML.as_bytes())?;
    zip.start_file("word/_rels/document.xml.rels", options)?;
    zip.write_all(DOCUMENT_RELS_XML.as_bytes())?;
    zip.start_file("word/styles.xml", options)?;
    zip.write_all(STYLES_XML.as_bytes())?;
    zip.start_file("word/document.xml", options)?;
    zip.write_all(generate_document_xml(chapters).as_bytes())?;

    zip.finish()?;
    Ok(())
}

fn generate_document_xml(chapters: &[RevisedChapter]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
<w:body>
"#,
    );

    for (index, chapter) in chapters.iter().enumerate() {
        if index > 0 {
            xml.push_str("<w:p><w:r><w:br w:type=\"page\"/></w:r></w:p>\n");
        }
        if !chapter.title.is_empty() {
            xml.push_str(&format!(
                "<w:p><w:pPr><w:pStyle w:val=\"Heading1\"/></w:pPr>{}</w:p>\n",
                text_run(&chapter.title)
            ));
        }
        for line in &chapter.lines {
            let line = line.trim();
            if line.is_empty() {
                xml.push_str("<w:p/>\n");
            } else {
                xml.push_str(&format!("<w:p>{}</w:p>\n", text_run(line)));
            }
        }
    }

    xml.push_str("</w:body>\n</w:document>\n");
    xml
}

fn text_run(text: &str) -> String {
    format!(
        "<w:r><w:t xml:space=\"preserve\">{}</w:t></w:r>",
        escape_xml(text)
    )
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
  <Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
  <Default Extension="xml" ContentType="application/xml"/>
  <Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>
  <Override PartName="/word/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml"/>
</Types>"#;

const PACKAGE_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>
</Relationships>"#;

const DOCUMENT_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>
</Relationships>"#;

const STYLES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:styles xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:style w:type="paragraph" w:default="1" w:styleId="Normal">
    <w:name w:val="Normal"/>
  </w:style>
  <w:style w:type="paragraph" w:styleId="Heading1">
    <w:name w:val="heading 1"/>
    <w:basedOn w:val="Normal"/>
    <w:next w:val="Normal"/>
    <w:qFormat/>
    <w:pPr><w:keepNext/><w:spacing w:before="480" w:after="240"/><w:outlineLvl w:val="0"/></w:pPr>
    <w:rPr><w:b/><w:sz w:val="32"/></w:rPr>
  </w:style>
</w:styles>"#;
