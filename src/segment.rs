/// Splits chapter text into blocks of roughly `max_lines` non-blank lines.
///
/// A block closes once it holds at least `max_lines` lines and the current line
/// ends a sentence, so blocks can run long but never stop mid-sentence. Blank
/// lines always close the current block and are themselves dropped.
pub fn segment(text: &str, max_lines: usize) -> Vec<String> {
    let max_lines = max_lines.max(1);
    let mut blocks = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut buffer, &mut blocks);
            continue;
        }

        buffer.push(line);
        if buffer.len() >= max_lines && ends_sentence(line) {
            flush(&mut buffer, &mut blocks);
        }
    }

    flush(&mut buffer, &mut blocks);
    blocks
}

fn flush(buffer: &mut Vec<&str>, blocks: &mut Vec<String>) {
    if !buffer.is_empty() {
        blocks.push(buffer.join("\n"));
        buffer.clear();
    }
}

/// `.`, `!` or `?`, optionally followed by one closing quote.
fn ends_sentence(line: &str) -> bool {
    let mut chars = line.chars().rev();
    match chars.next() {
        Some('.' | '!' | '?') => true,
        Some('"' | '\'' | '\u{201D}' | '\u{2019}') => matches!(chars.next(), Some('.' | '!' | '?')),
        _ => false,
    }
}
