//! Identifier classification and phone-number variant expansion
//!
//! North American numbers (10 digits, or 11 with a leading 1) expand to the
//! E.164, dashed, parenthesized and bare-digit forms. Longer international
//! numbers expand to `+digits` and `digits` only.

use serde::{Deserialize, Serialize};

/// Shape of a configured or observed identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Phone,
    Email,
    Alias,
}

const MIN_PHONE_DIGITS: usize = 10;

/// Classify a raw identifier
pub fn classify(raw: &str) -> IdentifierKind {
    let token = strip_scheme(raw.trim());
    if token.contains('@') {
        return IdentifierKind::Email;
    }
    let only_phone_chars = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '(' | ')' | '-' | '.' | ' '));
    if only_phone_chars && digits(token).len() >= MIN_PHONE_DIGITS {
        IdentifierKind::Phone
    } else {
        IdentifierKind::Alias
    }
}

/// Lowercased, whitespace-collapsed lookup key
pub fn normalize_key(raw: &str) -> String {
    strip_scheme(raw.trim())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// E.164-style canonical form, if the token is phone-like
pub fn canonical_phone(raw: &str) -> Option<String> {
    if classify(raw) != IdentifierKind::Phone {
        return None;
    }
    let d = digits(raw);
    match d.len() {
        10 => Some(format!("+1{}", d)),
        _ => Some(format!("+{}", d)),
    }
}

/// All lookup variants for a phone identifier, canonical form first
pub fn phone_variants(raw: &str) -> Vec<String> {
    let d = digits(raw);
    let national = match d.len() {
        10 => Some(d.clone()),
        11 if d.starts_with('1') => Some(d[1..].to_string()),
        _ => None,
    };

    let mut variants = Vec::new();
    match national {
        Some(n) => {
            let (area, prefix, line) = (&n[0..3], &n[3..6], &n[6..10]);
            variants.push(format!("+1{}", n));
            variants.push(format!("1{}", n));
            variants.push(n.clone());
            variants.push(format!("{}-{}-{}", area, prefix, line));
            variants.push(format!("({}) {}-{}", area, prefix, line));
            variants.push(format!("{}.{}.{}", area, prefix, line));
        }
        None => {
            variants.push(format!("+{}", d));
            variants.push(d);
        }
    }

    let original = normalize_key(raw);
    if !variants.contains(&original) {
        variants.push(original);
    }
    variants
}

fn digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn strip_scheme(token: &str) -> &str {
    for scheme in ["tel:", "mailto:", "TEL:", "MAILTO:"] {
        if let Some(rest) = token.strip_prefix(scheme) {
            return rest;
        }
    }
    token
}
