//! Title sanitization.
//!
//! Titles arrive from extracted metadata and are untrusted. The result of
//! [`sanitize_title`] is safe to embed in a single path component, is bounded
//! both in characters and in UTF-8 bytes, and is never empty.

/// Characters no common filesystem accepts inside a file name.
pub const ILLEGAL_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Look-alike and metadata characters that break downstream rendering or
/// quoting. Full-width forms of the illegal set, the solidus substitutes some
/// extractors emit in place of `/` and `\`, pipe variants, `@` and `#`.
pub const PROBLEM_CHARS: [char; 15] = [
    '\u{FF1C}', // ＜
    '\u{FF1E}', // ＞
    '\u{FF1A}', // ：
    '\u{FF02}', // ＂
    '\u{FF0F}', // ／
    '\u{FF3C}', // ＼
    '\u{FF5C}', // ｜
    '\u{FF1F}', // ？
    '\u{FF0A}', // ＊
    '\u{29F8}', // ⧸
    '\u{29F9}', // ⧹
    '\u{2502}', // │
    '\u{00A6}', // ¦
    '@',
    '#',
];

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_TITLE_BYTES: usize = 200;
pub const FALLBACK_TITLE: &str = "video";

fn is_stripped(character: char) -> bool {
    character.is_control() || ILLEGAL_CHARS.contains(&character) || PROBLEM_CHARS.contains(&character)
}

/// Turns an arbitrary title into a bounded, path-safe file name fragment.
///
/// Stripped characters become spaces before whitespace is collapsed, so
/// `My/Video` reads `My Video` rather than `MyVideo`. The function is pure and
/// idempotent.
pub fn sanitize_title(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|character| if is_stripped(character) { ' ' } else { character })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut bounded: String = collapsed.chars().take(MAX_TITLE_CHARS).collect();
    while bounded.len() > MAX_TITLE_BYTES {
        bounded.pop();
    }

    let trimmed = bounded.trim_end();
    if trimmed.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}
