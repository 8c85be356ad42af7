//! Text normalization and medical-core extraction
//!
//! Bill rows arrive as OCR free text: serial numbers, doctor attributions,
//! inventory codes, lot/batch/expiry markers and dates all wrapped around the
//! name that actually matters. Normalization strips the wrapping in a fixed
//! order and lowercases the remainder; when the text carries a recognized
//! strength pattern, a compact "medical core" (`substance strength`) is
//! extracted alongside.
//!
//! All rules are generic. No hospital- or drug-specific patterns exist here,
//! and every function is pure and deterministic.

use regex::Regex;
use std::sync::LazyLock;

/// Leading serial markers: `1.`, `23)`, `a.`, `(4)`
static SERIAL_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\(?\d{1,3}\s*[.)\]]|\(?[A-Za-z]\s*[.)])\s+").unwrap()
});

/// Inline doctor tokens with optional initials: `Dr. A. Kumar`, `Prof Y`
static DOCTOR_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:dr|prof|professor)\.?\s+(?:[a-z]\.\s*)*[a-z]+(?:\s+[a-z]+)?").unwrap()
});

/// Credential strings that mark a segment as a doctor attribution
static CREDENTIALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:mbbs|md|ms|dnb|mch|dm|frcs|mrcp|bds|mds)\b").unwrap()
});

/// Lot / batch / expiry / manufacture markers plus their value token
static LOT_BATCH_EXPIRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:lot|batch|b\.?\s*no|exp(?:iry)?|mfg|mfd)\b\s*[:.#-]?\s*\S*").unwrap()
});

/// Numeric dates: `12/03/2024`, `3-4-24`, `2024-03-12`
static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{4}-\d{2}-\d{2})\b").unwrap()
});

/// Dosage strength inside normalized text: `5mg`, `2.5 ml`, `0.9%`
static STRENGTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(mg|mcg|ml|g|iu|%)(?:\s|$)").unwrap()
});

/// A whole token that is a dosage strength (`1000mg`, `0.9%`)
static TOKEN_STRENGTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\d+(?:\.\d+)?(?:mg|mcg|ml|g|iu|%)$").unwrap());

/// Alphanumeric inventory / HSN-style code shape: length ≥ 6
static CODE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z0-9]{6,}$").unwrap());

static PURE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)?$").unwrap());

/// Dosage-form words dropped when assembling the medical core
const FORM_WORDS: &[&str] = &[
    "tab", "tabs", "tablet", "tablets", "cap", "caps", "capsule", "capsules", "inj", "injection",
    "syrup", "susp", "suspension", "drops", "cream", "gel", "ointment", "strip", "vial", "amp",
    "ampoule", "sachet",
];

/// Normalized rendition of one bill or catalog text
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedText {
    /// Full normalized form: lowercased, separator-free, marker-free
    pub normalized: String,

    /// `substance strength` when a strength pattern was present and the
    /// core differs from the normalized form
    pub medical_core: Option<String>,
}

/// Run the full normalization pipeline on one text.
pub fn normalize_item(text: &str) -> NormalizedText {
    let normalized = normalize(text);
    let medical_core = medical_core(&normalized).filter(|core| *core != normalized);
    NormalizedText {
        normalized,
        medical_core,
    }
}

/// Stage 1: strip serials, doctor attributions, codes, dates and markers,
/// convert separators to spaces, lowercase and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let text = SERIAL_PREFIX.replace(text, "");

    // Segments after `|` or ` - ` that read as doctor attributions are
    // dropped whole; other segments are kept and cleaned inline.
    let mut kept: Vec<String> = Vec::new();
    for segment in split_segments(&text) {
        if is_doctor_segment(&segment) {
            continue;
        }
        let seg = DOCTOR_TOKEN.replace_all(&segment, " ");
        let seg = CREDENTIALS.replace_all(&seg, " ");
        let seg = LOT_BATCH_EXPIRY.replace_all(&seg, " ");
        let seg = DATE.replace_all(&seg, " ");
        kept.push(seg.into_owned());
    }
    let joined = kept.join(" ");

    // Remaining separators become spaces before token-level cleanup.
    let spaced: String = joined
        .chars()
        .map(|c| match c {
            '|' | '-' | ':' => ' ',
            _ => c,
        })
        .collect();

    let lowered = spaced.to_lowercase();
    lowered
        .split_whitespace()
        .filter_map(|raw| {
            let tok = raw.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '%');
            if tok.is_empty() || is_code_token(tok) {
                None
            } else {
                Some(tok)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stage 2: extract `substance strength` when a strength pattern exists.
///
/// `nicorandil 5 mg tab` → `nicorandil 5mg`. Returns `None` when no strength
/// is present or no substance word precedes it.
pub fn medical_core(normalized: &str) -> Option<String> {
    let caps = STRENGTH.captures(normalized)?;
    let whole = caps.get(0)?;
    let number = caps.get(1)?.as_str();
    let unit = caps.get(2)?.as_str().to_lowercase();

    let substance: Vec<&str> = normalized[..whole.start()]
        .split_whitespace()
        .filter(|tok| {
            tok.chars().all(|c| c.is_ascii_alphabetic()) && !FORM_WORDS.contains(tok)
        })
        .collect();
    if substance.is_empty() {
        return None;
    }
    Some(format!("{} {}{}", substance.join(" "), number, unit))
}

/// Case-insensitive, whitespace-collapsed key for exact catalog lookups.
pub fn lookup_key(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// True for tokens that read as inventory/HSN codes: long alphanumeric runs
/// containing at least one digit. Dosage strengths are never codes.
pub fn is_code_token(token: &str) -> bool {
    CODE_TOKEN.is_match(token)
        && token.chars().any(|c| c.is_ascii_digit())
        && !TOKEN_STRENGTH.is_match(token)
}

/// True when the whole text is a bare number.
pub fn is_pure_number(text: &str) -> bool {
    PURE_NUMBER.is_match(text.trim())
}

/// True when the text still carries a lot/batch/expiry marker.
pub fn has_lot_batch_marker(text: &str) -> bool {
    LOT_BATCH_EXPIRY.is_match(text)
}

fn split_segments(text: &str) -> Vec<String> {
    // `|` always separates; ` - ` separates only with surrounding spaces so
    // hyphenated names survive.
    let mut segments = Vec::new();
    for part in text.split('|') {
        for sub in part.split(" - ") {
            let trimmed = sub.trim();
            if !trimmed.is_empty() {
                segments.push(trimmed.to_string());
            }
        }
    }
    segments
}

fn is_doctor_segment(segment: &str) -> bool {
    let lower = segment.trim_start().to_lowercase();
    lower.starts_with("dr.")
        || lower.starts_with("dr ")
        || lower.starts_with("prof.")
        || lower.starts_with("prof ")
        || lower.starts_with("professor ")
        || CREDENTIALS.is_match(segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_prefix_removed() {
        assert_eq!(normalize("1. CONSULTATION"), "consultation");
        assert_eq!(normalize("23) Dressing Large"), "dressing large");
        assert_eq!(normalize("a. Room Rent"), "room rent");
    }

    #[test]
    fn test_doctor_attribution_segment_dropped() {
        assert_eq!(
            normalize("1. CONSULTATION - FIRST VISIT | Dr. A. Kumar"),
            "consultation first visit"
        );
        assert_eq!(normalize("MRI BRAIN | Dr. X"), "mri brain");
        assert_eq!(normalize("Consultation - Dr. Mehta MBBS MD"), "consultation");
    }

    #[test]
    fn test_inline_doctor_token_removed() {
        let out = normalize("Visit charges Dr. Ramesh Gupta ward 3");
        assert!(!out.contains("ramesh"));
        assert!(out.contains("visit charges"));
    }

    #[test]
    fn test_lot_batch_expiry_and_dates_removed() {
        let out = normalize("PARACETAMOL 500MG TAB BATCH: AX12345 EXP 12/2026");
        assert!(out.contains("paracetamol"));
        assert!(!out.contains("ax12345"));
        assert!(!out.contains("batch"));

        let out = normalize("Dressing done on 12/03/2024");
        assert!(!out.contains("12/03/2024"));
    }

    #[test]
    fn test_long_codes_removed_but_strengths_kept() {
        let out = normalize("AMOXYCILLIN 500mg HSN30049099");
        assert!(out.contains("500mg"));
        assert!(!out.contains("hsn30049099"));

        // A six-character strength token is not a code.
        let out = normalize("VITAMIN D3 1000iu");
        assert!(out.contains("1000iu"));
    }

    #[test]
    fn test_separators_become_spaces() {
        assert_eq!(normalize("X-RAY: CHEST PA"), "x ray chest pa");
    }

    #[test]
    fn test_medical_core_extraction() {
        let n = normalize_item("NICORANDIL 5MG TAB");
        assert_eq!(n.normalized, "nicorandil 5mg tab");
        assert_eq!(n.medical_core.as_deref(), Some("nicorandil 5mg"));
    }

    #[test]
    fn test_medical_core_percent_unit() {
        let n = normalize_item("SODIUM CHLORIDE 0.9% 100ml IV");
        assert_eq!(n.medical_core.as_deref(), Some("sodium chloride 0.9%"));
    }

    #[test]
    fn test_medical_core_absent_without_strength() {
        let n = normalize_item("CONSULTATION");
        assert_eq!(n.medical_core, None);
    }

    #[test]
    fn test_medical_core_equal_to_normalized_is_dropped() {
        let n = normalize_item("nicorandil 5mg");
        assert_eq!(n.normalized, "nicorandil 5mg");
        assert_eq!(n.medical_core, None);
    }

    #[test]
    fn test_lookup_key_collapses_case_and_space() {
        assert_eq!(lookup_key("  Apollo   HOSPITAL "), "apollo hospital");
    }

    #[test]
    fn test_predicates() {
        assert!(is_pure_number("12345"));
        assert!(is_pure_number("12.5"));
        assert!(!is_pure_number("a12"));
        assert!(is_code_token("hsn30049099"));
        assert!(!is_code_token("consultation"));
        assert!(!is_code_token("1000mg"));
        assert!(has_lot_batch_marker("batch AX1"));
    }

    #[test]
    fn test_deterministic() {
        let a = normalize("2) INJ. MONOCEF 1g | Dr. S. Rao B.NO X99887");
        let b = normalize("2) INJ. MONOCEF 1g | Dr. S. Rao B.NO X99887");
        assert_eq!(a, b);
    }
}
