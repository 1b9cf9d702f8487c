//! Cleans raw generations down to the revised text.
//!
//! The model output echoes the ChatML prompt and tends to pad the answer with
//! control tokens, role labels and editorial chatter. Cleaning is an ordered
//! list of named rewrite rules so new artifact patterns can be added without
//! touching the control flow in [`Sanitizer::clean`].

use std::sync::LazyLock;

use regex::Regex;

pub const ROLE_MARKER: &str = "<|im_start|>assistant";

const SUMMARY_VOCABULARY: &[&str] = &[
    "clarity",
    "tone",
    "structure",
    "preserved",
    "corrections",
    "fixed",
    "capitalization",
    "rephrased",
    "edited",
    "punctuation",
    "grammar",
    "no further edits",
    "already clear",
    "no edits needed",
];

static PUNCTUATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid punctuation pattern"));
static CLOSING_REMARK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s*_~\-()\[\]]*(?:the end|to be continued)[\s.!*_~\-()\[\]]*$")
        .expect("valid closing remark pattern")
});

/// What to do when the generation lacks the role-transition marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerPolicy {
    /// No marker means the model produced nothing new; the output is unusable.
    #[default]
    Require,
    /// Clean the whole generation and rely on the rewrite rules.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleaned {
    Revised(String),
    MissingMarker,
    /// Nothing but whitespace and control markup followed the marker.
    NothingGenerated,
    /// Real text followed the marker but the commentary rules removed all of it.
    Discarded,
}

impl Cleaned {
    pub fn into_text(self) -> String {
        match self {
            Cleaned::Revised(text) => text,
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    name: &'static str,
    pattern: Regex,
    replacement: &'static str,
}

impl RewriteRule {
    pub fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(pattern)?,
            replacement,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, text: &str) -> String {
        self.pattern.replace_all(text, self.replacement).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    policy: MarkerPolicy,
    markup_rules: Vec<RewriteRule>,
    commentary_rules: Vec<RewriteRule>,
    header_rules: Vec<RewriteRule>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(MarkerPolicy::default())
    }
}

impl Sanitizer {
    pub fn new(policy: MarkerPolicy) -> Self {
        Self {
            policy,
            markup_rules: builtin(&[
                ("chatml_tokens", r"<\|[^|<>]*\|>", ""),
                ("start_sentinel", r"<start>\n?", ""),
                ("end_sentinel", r"\n?<end>", ""),
                ("sequence_tokens", r"</?s>|</?pad>|\[(?:PAD|PAUSE)\]", ""),
                ("code_fences", r"(?m)^[ \t]*```[A-Za-z]*[ \t]*$", ""),
                ("role_labels", r"(?mi)^[ \t]*(?:user|assistant|system):[ \t]*", ""),
            ]),
            commentary_rules: builtin(&[(
                "no_changes_needed",
                r"(?i)\(?[ \t]*no (?:further )?(?:changes|edits|corrections|revisions) (?:are |were )?(?:needed|required|necessary)[ \t]*\.?[ \t]*\)?",
                "",
            )]),
            header_rules: builtin(&[(
                "editorial_headers",
                r"(?mi)^[ \t]*(?:corrected|edited|fixes|changes|modifications)[ \t]*:.*$",
                "",
            )]),
        }
    }

    /// Appends a markup rule, applied after the built-in ones.
    pub fn with_rule(mut self, rule: RewriteRule) -> Self {
        self.markup_rules.push(rule);
        self
    }

    pub fn sanitize(&self, raw: &str) -> String {
        self.clean(raw).into_text()
    }

    pub fn clean(&self, raw: &str) -> Cleaned {
        let raw = raw.replace("\r\n", "\n").replace('\r', "\n");
        let candidate = match raw.rfind(ROLE_MARKER) {
            Some(at) => &raw[at + ROLE_MARKER.len()..],
            None if self.policy == MarkerPolicy::Lenient => raw.as_str(),
            None => return Cleaned::MissingMarker,
        };
        let text = collapse_blank_lines(&apply_rules(&self.markup_rules, candidate));
        if text.trim().is_empty() {
            return Cleaned::NothingGenerated;
        }
        let text = apply_rules(&self.commentary_rules, &text);
        let text = apply_rules(&self.header_rules, &drop_trailing_remarks(&text));
        let text = collapse_blank_lines(&text).trim().to_string();

        if text.is_empty() {
            tracing::warn!(
                before_chars = candidate.len(),
                "sanitizer removed every line of a non-empty generation"
            );
            return Cleaned::Discarded;
        }
        Cleaned::Revised(text)
    }
}

fn builtin(rules: &[(&'static str, &str, &'static str)]) -> Vec<RewriteRule> {
    let mut compiled = Vec::with_capacity(rules.len());
    for &(name, pattern, replacement) in rules {
        match RewriteRule::new(name, pattern, replacement) {
            Ok(rule) => compiled.push(rule),
            Err(err) => tracing::error!(rule = name, %err, "skipping invalid sanitizer rule"),
        }
    }
    compiled
}

fn apply_rules(rules: &[RewriteRule], text: &str) -> String {
    let mut text = text.to_string();
    for rule in rules {
        let rewritten = rule.apply(&text);
        if rewritten != text {
            tracing::trace!(rule = rule.name(), "rewrite rule matched");
        }
        text = rewritten;
    }
    text
}

fn collapse_blank_lines(text: &str) -> String {
    text.split('\n')
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn drop_trailing_remarks(text: &str) -> String {
    let mut lines: Vec<&str> = text.trim_end().lines().collect();
    while let Some(last) = lines.last() {
        if CLOSING_REMARK_RE.is_match(last) || is_editorial_summary(last) {
            lines.pop();
            while lines.last().is_some_and(|line| line.trim().is_empty()) {
                lines.pop();
            }
        } else {
            break;
        }
    }
    lines.join("\n")
}

fn is_editorial_summary(line: &str) -> bool {
    let lowered = line.to_lowercase();
    let stripped = PUNCTUATION_RE.replace_all(&lowered, "");
    let padded = format!(" {} ", stripped.split_whitespace().collect::<Vec<_>>().join(" "));
    SUMMARY_VOCABULARY
        .iter()
        .filter(|term| padded.contains(&format!(" {term} ")))
        .count()
        >= 2
}
