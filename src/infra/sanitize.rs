//! Text sanitizer - strips terminal control sequences and known banner noise
//!
//! Removes:
//! - CSI sequences: `\x1b[...m` (colours, cursor movement)
//! - OSC sequences: `\x1b]...(\x07|\x1b\\)` (terminal titles)
//! - Simple two-byte escapes and stray C0 control characters
//! - Whole lines matching a per-backend allow-list of benign banners
//!
//! Literal brackets in prose are never touched; only sequences introduced by
//! an actual ESC byte are stripped. Sanitizing twice yields the same text.

use regex::Regex;
use std::sync::LazyLock;

use crate::adapter::Backend;

/// Banner lines the Gemini CLI prints on stdout before any reply
static GEMINI_NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^Loaded cached credentials\.?$",
        r"^Data collection is disabled\.?$",
        r"^Using cached credentials.*$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Banner lines Qwen Code prints on stdout before any reply
static QWEN_NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^Loaded cached credentials\.?$",
        r"^Loaded cached Qwen credentials\.?$",
        r"^Data collection is disabled\.?$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static NO_NOISE: LazyLock<Vec<Regex>> = LazyLock::new(Vec::new);

/// Backend-aware sanitizer
#[derive(Clone, Copy)]
pub struct Sanitizer {
    noise: &'static LazyLock<Vec<Regex>>,
}

impl Sanitizer {
    pub fn for_backend(backend: Backend) -> Self {
        let noise = match backend {
            Backend::Gemini => &GEMINI_NOISE,
            Backend::Qwen => &QWEN_NOISE,
            Backend::Claude | Backend::Codex => &NO_NOISE,
        };
        Self { noise }
    }

    /// Sanitize a raw chunk of subprocess output.
    pub fn sanitize(&self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        let stripped = strip_ansi_codes(&text);
        stripped
            .split('\n')
            .map(collapse_carriage_returns)
            .filter(|line| !self.is_noise(line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Sanitize one already-split line. `None` when the whole line is noise.
    pub fn clean_line(&self, line: &str) -> Option<String> {
        let stripped = strip_ansi_codes(line);
        let cleaned = collapse_carriage_returns(stripped.trim_end_matches('\n'));
        if self.is_noise(&cleaned) {
            None
        } else {
            Some(cleaned)
        }
    }

    pub fn is_noise(&self, line: &str) -> bool {
        let trimmed = line.trim();
        !trimmed.is_empty() && self.noise.iter().any(|re| re.is_match(trimmed))
    }
}

/// Sanitize without any backend noise list.
pub fn sanitize(raw: &[u8]) -> String {
    Sanitizer { noise: &NO_NOISE }.sanitize(raw)
}

/// Strip ANSI escape codes and stray control characters from a string.
pub fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\x1b' => match chars.peek() {
                Some('[') => {
                    // CSI: parameters and intermediates, then one final byte in @..~
                    chars.next();
                    while let Some(&c) = chars.peek() {
                        chars.next();
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') | Some('P') | Some('_') | Some('^') => {
                    // OSC / DCS / APC / PM: terminated by BEL or ST
                    chars.next();
                    while let Some(&c) = chars.peek() {
                        if c == '\x07' {
                            chars.next();
                            break;
                        }
                        if c == '\x1b' {
                            chars.next();
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                        chars.next();
                    }
                }
                Some('(') | Some(')') => {
                    // charset designation takes one more byte
                    chars.next();
                    chars.next();
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\n' | '\t' | '\r' => result.push(ch),
            c if c.is_control() => {}
            c => result.push(c),
        }
    }

    result
}

/// Apply terminal carriage-return semantics to one line: the last non-empty
/// segment after a `\r` is what the terminal ends up showing.
fn collapse_carriage_returns(line: &str) -> String {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if !line.contains('\r') {
        return line.to_string();
    }
    line.rsplit('\r')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
        .to_string()
}
