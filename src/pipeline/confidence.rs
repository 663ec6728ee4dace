//! Confidence scoring and field validation.
//!
//! Runs after a structured extraction passed the schema check (or after a
//! reviewer submitted fields by hand). It never fails: a value that does
//! not look like what its label promises keeps its text, gains an issue
//! string, and has its confidence pushed below [`LOW_CONFIDENCE_THRESHOLD`]
//! so the UI highlights it.

use crate::pipeline::schema::{FieldCandidate, RawExtraction};
use crate::session::{ExtractedData, ExtractedField};
use chrono::{DateTime, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

/// Confidence assigned when the model did not report one.
pub const DEFAULT_CONFIDENCE: f32 = 0.75;

/// Fields below this are flagged for attention.
pub const LOW_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Ceiling applied to blank values and failed checks.
pub const ISSUE_CONFIDENCE_CAP: f32 = 0.49;

const DATE_KEYWORDS: &[&str] = &["date", "datum"];
const DATE_WEAK_KEYWORDS: &[&str] = &["due", "issued"];
const AMOUNT_KEYWORDS: &[&str] = &[
    "total", "amount", "sum", "subtotal", "net", "gross", "balance", "price",
];
const TAX_KEYWORDS: &[&str] = &["tax", "vat", "gst", "mwst", "ust"];
const CURRENCY_KEYWORDS: &[&str] = &["currency", "währung", "devise"];
const TOTAL_KEYWORDS: &[&str] = &["total", "gesamt", "grand"];
const NET_MARKERS: &[&str] = &["sub", "subtotal", "zwischensumme", "net", "netto"];
/// Words that say a tax is included in the amount ("Total incl. VAT").
const INCLUSIVE_MARKERS: &[&str] = &["incl", "inkl", "including", "inclusive", "gross", "brutto"];
/// Tokens marking identifiers ("VAT No.", "Tax ID"), which are not amounts.
const IDENTIFIER_TOKENS: &[&str] = &["id", "no", "nr", "number", "reg", "registration"];

const CURRENCY_SYMBOLS: &[&str] = &[
    "$", "€", "£", "¥", "₹", "₽", "₩", "₺", "₪", "₫", "₱", "฿", "₴", "₦", "R$", "US$", "A$",
    "C$", "NZ$", "HK$", "S$", "kr", "zł", "Fr.", "Kč", "Ft", "lei",
];

/// What a label says its value should look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Date,
    Amount,
    Tax,
    Currency,
    Other,
}

fn tokens(label: &str) -> Vec<String> {
    label
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_keyword(tokens: &[String], keywords: &[&str]) -> bool {
    tokens.iter().any(|t| {
        keywords.iter().any(|k| {
            // Short keywords must match whole tokens ("net" is not "internet").
            if k.chars().count() <= 3 {
                t == k
            } else {
                t.contains(k)
            }
        })
    })
}

/// Classify a field by its label.
///
/// Explicit date words win; then gross totals (so "Total incl. VAT" is an
/// amount, not a tax); then taxes and amounts (so "Amount Due" is an
/// amount); then the weaker date words; then currency.
pub fn classify_label(label: &str) -> FieldKind {
    let t = tokens(label);
    if has_keyword(&t, DATE_KEYWORDS) {
        return FieldKind::Date;
    }
    if has_keyword(&t, IDENTIFIER_TOKENS) {
        return FieldKind::Other;
    }
    if is_gross_total(&t) {
        return FieldKind::Amount;
    }
    if has_keyword(&t, TAX_KEYWORDS) {
        return FieldKind::Tax;
    }
    if has_keyword(&t, AMOUNT_KEYWORDS) {
        return FieldKind::Amount;
    }
    if has_keyword(&t, DATE_WEAK_KEYWORDS) {
        return FieldKind::Date;
    }
    if has_keyword(&t, CURRENCY_KEYWORDS) {
        return FieldKind::Currency;
    }
    FieldKind::Other
}

// ── Amounts ─────────────────────────────────────────────────────────────────

static RE_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<neg>-)?\s*(?P<pre>[\p{Sc}\p{L}]{0,3}\.?)\s*(?P<sign>[-+])?\s*(?P<num>\d(?:[\d.,' \u{a0}]*\d)?)\s*(?P<post>[\p{Sc}\p{L}%]{0,3}\.?)$",
    )
    .unwrap()
});

/// Parse a monetary amount, tolerating currency markers and thousand
/// separators in either the `1,234.56` or `1.234,56` convention.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let s = raw.trim();
    let (paren_neg, s) = match s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => (true, inner.trim()),
        None => (false, s),
    };

    let caps = RE_AMOUNT.captures(s)?;
    let negative = paren_neg
        || caps.name("neg").is_some()
        || caps.name("sign").is_some_and(|m| m.as_str() == "-");
    let digits: String = caps["num"]
        .chars()
        .filter(|c| !matches!(c, ' ' | '\'' | '\u{a0}'))
        .collect();

    let normalised = normalise_separators(&digits)?;
    let value: f64 = normalised.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

fn normalise_separators(digits: &str) -> Option<String> {
    let last_dot = digits.rfind('.');
    let last_comma = digits.rfind(',');
    match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            let (decimal, thousands) = if d > c { ('.', ',') } else { (',', '.') };
            let head = &digits[..d.max(c)];
            if head.contains(decimal) {
                return None;
            }
            let tail = &digits[d.max(c) + 1..];
            Some(format!("{}.{}", head.replace(thousands, ""), tail))
        }
        (None, Some(_)) => {
            let parts: Vec<&str> = digits.split(',').collect();
            if parts.len() == 2 && parts[1].len() <= 2 {
                Some(format!("{}.{}", parts[0], parts[1]))
            } else {
                Some(digits.replace(',', ""))
            }
        }
        (Some(_), None) => {
            if digits.matches('.').count() > 1 {
                Some(digits.replace('.', ""))
            } else {
                Some(digits.to_string())
            }
        }
        (None, None) => Some(digits.to_string()),
    }
}

// ── Dates ───────────────────────────────────────────────────────────────────

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%d.%m.%Y", "%d/%m/%Y", "%d-%m-%Y", "%m/%d/%Y",
    "%m-%d-%Y", "%d.%m.%y", "%d/%m/%y", "%m/%d/%y", "%B %d, %Y", "%B %d %Y", "%d %B %Y",
    "%d. %B %Y", "%d-%b-%Y", "%b %d, %Y", "%d %b %Y",
];

static RE_ORDINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)(?:st|nd|rd|th)\b").unwrap());

/// Parse a calendar date in ISO, European, US or month-name form.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim().trim_end_matches('.');
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    let s = RE_ORDINAL.replace_all(s, "$1");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&s, fmt).ok())
}

// ── Currency ────────────────────────────────────────────────────────────────

pub fn is_currency(raw: &str) -> bool {
    let s = raw.trim();
    // ISO 4217 codes are upper case.
    (s.len() == 3 && s.chars().all(|c| c.is_ascii_uppercase()))
        || CURRENCY_SYMBOLS.iter().any(|sym| sym.eq_ignore_ascii_case(s))
}

// ── Scoring ─────────────────────────────────────────────────────────────────

fn initial_confidence(provided: Option<f32>) -> f32 {
    match provided {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

fn flag(field: &mut ExtractedField, issue: String) {
    field.issues.push(issue);
    field.confidence = field.confidence.min(ISSUE_CONFIDENCE_CAP);
}

/// Score and check one field in isolation.
pub fn score_field(candidate: FieldCandidate) -> ExtractedField {
    let mut field = ExtractedField::new(
        candidate.label,
        candidate.value,
        initial_confidence(candidate.confidence),
    );

    if field.is_blank() {
        flag(&mut field, "value is missing".into());
        return field;
    }
    let value = field.value.clone().unwrap_or_default();

    match classify_label(&field.label) {
        FieldKind::Date if parse_date(&value).is_none() => {
            flag(&mut field, format!("'{value}' is not a recognisable date"));
        }
        FieldKind::Amount | FieldKind::Tax if parse_amount(&value).is_none() => {
            flag(&mut field, format!("'{value}' is not a valid amount"));
        }
        FieldKind::Currency if !is_currency(&value) => {
            flag(
                &mut field,
                format!("'{value}' is not a currency code or symbol"),
            );
        }
        _ => {}
    }
    field
}

/// A total that may include tax. "Total VAT" names a tax, "Total incl.
/// VAT" does not.
fn is_gross_total(tokens: &[String]) -> bool {
    has_keyword(tokens, TOTAL_KEYWORDS)
        && !has_keyword(tokens, NET_MARKERS)
        && (!has_keyword(tokens, TAX_KEYWORDS) || has_keyword(tokens, INCLUSIVE_MARKERS))
}

fn is_total_label(label: &str) -> bool {
    let t = tokens(label);
    has_keyword(&t, TOTAL_KEYWORDS) && !has_keyword(&t, &["sub", "subtotal", "zwischensumme"])
}

fn is_rate(field: &ExtractedField) -> bool {
    let l = field.label.to_lowercase();
    l.contains("rate") || l.contains('%') || field.value.as_deref().is_some_and(|v| v.contains('%'))
}

/// Flag tax amounts that exceed the invoice total.
fn cross_check(fields: &mut [ExtractedField]) {
    let largest = fields
        .iter()
        .enumerate()
        .filter(|(_, f)| is_total_label(&f.label) && classify_label(&f.label) == FieldKind::Amount)
        .filter_map(|(i, f)| f.value.as_deref().and_then(parse_amount).map(|v| (i, v)))
        .fold(None, |acc: Option<(usize, f64)>, (i, v)| match acc {
            Some((_, best)) if best >= v => acc,
            _ => Some((i, v)),
        });
    let Some((total_index, total)) = largest else {
        return;
    };

    for (i, field) in fields.iter_mut().enumerate() {
        if i == total_index || classify_label(&field.label) != FieldKind::Tax || is_rate(field) {
            continue;
        }
        if let Some(tax) = field.value.as_deref().and_then(parse_amount) {
            if tax > total {
                flag(field, format!("tax amount {tax} exceeds total {total}"));
            }
        }
    }
}

/// Score every field and run the cross-field checks.
pub fn score_fields(candidates: Vec<FieldCandidate>) -> Vec<ExtractedField> {
    let mut fields: Vec<ExtractedField> = candidates.into_iter().map(score_field).collect();
    cross_check(&mut fields);
    fields
}

/// Turn a schema-checked response into the stored result.
pub fn score(raw: RawExtraction) -> ExtractedData {
    ExtractedData {
        fields: score_fields(raw.fields),
        line_items: raw.line_items,
    }
}

pub fn is_low_confidence(field: &ExtractedField) -> bool {
    field.confidence < LOW_CONFIDENCE_THRESHOLD
}
