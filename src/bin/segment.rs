use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use reviser::config::AppConfig;
use reviser::generation::{TokenCounter, WhitespaceTokenCounter};
use reviser::manuscript::{DocumentStore, DocxStore};
use reviser::revise::generation_budget;
use reviser::segment::segment;

#[derive(Parser, Debug)]
#[command(name = "segment")]
#[command(about = "Show how a manuscript splits into chapters and blocks without calling a model")]
struct Cli {
    docx: PathBuf,
    #[arg(long)]
    max_lines: Option<usize>,
    #[arg(long, default_value_t = false)]
    show_blocks: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(max_lines) = cli.max_lines {
        config.revision.max_lines = max_lines;
    }

    let store = DocxStore::new(&cli.docx, config.output_dir());
    let chapters = store.read_chapters()?;
    let tokens = WhitespaceTokenCounter;

    let mut total_blocks = 0usize;
    for (number, chapter) in chapters.iter().enumerate() {
        let blocks = segment(&chapter.text(), config.revision.max_lines);
        let input_tokens: usize = blocks.iter().map(|b| tokens.count_tokens(b)).sum();
        total_blocks += blocks.len();

        println!(
            "[{}] {} paragraphs={} blocks={} tokens={} max_new_tokens={}",
            number + 1,
            if chapter.title.is_empty() { "(untitled)" } else { chapter.title.as_str() },
            chapter.paragraphs.len(),
            blocks.len(),
            input_tokens,
            generation_budget(&blocks, &tokens, &config.revision),
        );

        if cli.show_blocks {
            for (index, block) in blocks.iter().enumerate() {
                println!("  --- block {index} ({} lines)", block.lines().count());
                for line in block.lines() {
                    println!("  | {line}");
                }
            }
        }
    }

    println!("Chapters: {} Blocks: {}", chapters.len(), total_blocks);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
