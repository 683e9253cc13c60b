//! Markup to plain text for message bodies
//!
//! Tags are dropped and character references decoded. Block-level breaks
//! (`<br>`, `</p>`, `</div>`) become newlines so multi-paragraph bodies keep
//! their shape.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>").expect("break pattern must compile")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag pattern must compile"));
static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]+);").expect("entity pattern must compile")
});

/// Plain text of an HTML fragment, trimmed
pub fn to_text(html: &str) -> String {
    let broken = BREAK.replace_all(html, "\n");
    let stripped = TAG.replace_all(&broken, "");
    unescape(&stripped).trim().to_string()
}

/// Decode character references; unknown names are left as written
pub fn unescape(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures<'_>| {
            let name = &caps[1];
            let decoded = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse().ok().and_then(char::from_u32)
            } else {
                named(name)
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}

fn named(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        "hellip" => '\u{2026}',
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_dropped_and_breaks_kept() {
        assert_eq!(
            to_text("<p>See you <b>at 5</b></p><p>ok?</p>"),
            "See you at 5\nok?"
        );
        assert_eq!(to_text("line one<br/>line two"), "line one\nline two");
    }

    #[test]
    fn test_references_decoded() {
        assert_eq!(unescape("Tom &amp; Jerry &lt;3 &#39;hi&#x27;"), "Tom & Jerry <3 'hi'");
        assert_eq!(unescape("&bogus; stays"), "&bogus; stays");
    }

    #[test]
    fn test_escaped_markup_is_not_stripped() {
        assert_eq!(to_text("&lt;b&gt;literal&lt;/b&gt;"), "<b>literal</b>");
    }
}
