//! Post-processing: deterministic cleanup of raw model output.
//!
//! Even well-prompted models wrap JSON in ```` ```json ```` fences, prepend a
//! byte-order mark, or sprinkle zero-width spaces through OCR text. These
//! rules fix such quirks without touching content, so the prompt can stay
//! focused on *what to extract*. Each rule is a pure `&str → String` pass.
//!
//! ## Rule Order
//!
//! Invisible characters go first, so a BOM in front of the opening fence
//! does not hide the fence from the fence rule.

use once_cell::sync::Lazy;
use regex::Regex;

/// Prepare a structured-extraction response for JSON parsing.
///
/// 1. Strip invisible Unicode (BOM, zero-width spaces, soft hyphens)
/// 2. Strip an outer markdown fence (```` ```json ````, ```` ``` ````)
/// 3. Trim surrounding whitespace
pub fn clean_json_response(input: &str) -> String {
    let s = remove_invisible_chars(input);
    let s = strip_code_fences(&s);
    s.trim().to_string()
}

/// Normalise OCR fallback text for display in the review UI.
///
/// 1. Strip invisible Unicode
/// 2. Strip an outer fence (models sometimes fence plain text too)
/// 3. Normalise line endings (CRLF → LF)
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ consecutive blank lines down to 2
/// 6. Trim leading and trailing blank lines
pub fn clean_ocr_text(input: &str) -> String {
    let s = remove_invisible_chars(input);
    let s = strip_code_fences(&s);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

// ── Rule: Strip outer code fences ───────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap()
});

fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule: Normalise line endings ────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule: Trim trailing whitespace per line ─────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule: Collapse excessive blank lines ────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule: Remove invisible Unicode characters ───────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}
