//! Handler descriptors and description scraping.
//!
//! A handler may describe itself in a leading block comment:
//!
//! ```text
//! #!/bin/sh
//! /*
//!  * Mirrors kitchen readings to the hallway display.
//!  */
//! ```
//!
//! Only the first block comment within the first [`DESCRIPTION_SCAN_LINES`]
//! lines is considered.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Number of leading lines searched for a description.
pub const DESCRIPTION_SCAN_LINES: usize = 20;

/// Upper bound on bytes read while scanning, so binaries without newlines
/// are not slurped whole.
const DESCRIPTION_SCAN_BYTES: u64 = 16 * 1024;

/// One executable found under the handlers root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    /// Absolute filesystem path.
    pub full_path: String,
    /// Directory relative to the handlers root (`""` at the root, else `/a/b`).
    pub path: String,
    /// File name.
    pub script: String,
    /// Text from the leading block comment, or empty.
    pub description: String,
}

/// Read a handler's description. Unreadable files describe as `""`.
pub fn read_description(path: &Path) -> String {
    let Ok(file) = File::open(path) else {
        return String::new();
    };
    let head: Vec<String> = BufReader::new(file.take(DESCRIPTION_SCAN_BYTES))
        .lines()
        .map_while(Result::ok)
        .take(DESCRIPTION_SCAN_LINES)
        .collect();
    extract_description(&head.join("\n"))
}

/// Extract the body of the first `/* ... */` comment in the first
/// [`DESCRIPTION_SCAN_LINES`] lines of `text`.
///
/// Leading `*` decoration is stripped from each line and the remaining
/// pieces are joined with single spaces. An unterminated comment yields
/// whatever was collected before the scan limit.
pub fn extract_description(text: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut in_comment = false;

    for line in text.lines().take(DESCRIPTION_SCAN_LINES) {
        if !in_comment {
            let Some(start) = line.find("/*") else {
                continue;
            };
            let rest = &line[start + 2..];
            if let Some(end) = rest.find("*/") {
                push_part(&mut parts, &rest[..end]);
                break;
            }
            push_part(&mut parts, rest);
            in_comment = true;
            continue;
        }

        if let Some(end) = line.find("*/") {
            push_part(&mut parts, strip_decoration(&line[..end]));
            break;
        }
        push_part(&mut parts, strip_decoration(line));
    }

    parts.join(" ")
}

fn strip_decoration(line: &str) -> &str {
    let trimmed = line.trim_start();
    trimmed.strip_prefix('*').unwrap_or(trimmed)
}

fn push_part<'a>(parts: &mut Vec<&'a str>, piece: &'a str) {
    let piece = piece.trim();
    if !piece.is_empty() && !piece.chars().all(|c| c == '*') {
        parts.push(piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_decorated_block() {
        let text = "#!/bin/sh\n/*\n * Mirrors kitchen readings\n * to the hallway.\n */\necho hi\n";
        assert_eq!(
            extract_description(text),
            "Mirrors kitchen readings to the hallway."
        );
    }

    #[test]
    fn test_single_line_comment() {
        let text = "#!/usr/bin/env node\n/* Notify on door events */\n";
        assert_eq!(extract_description(text), "Notify on door events");
    }

    #[test]
    fn test_javadoc_opener_and_plain_lines() {
        let text = "/**\n  Plain body line\n **/\n";
        assert_eq!(extract_description(text), "Plain body line");
    }

    #[test]
    fn test_only_first_block_used() {
        let text = "/* first */\n/* second */\n";
        assert_eq!(extract_description(text), "first");
    }

    #[test]
    fn test_comment_after_scan_limit_ignored() {
        let mut text = "echo\n".repeat(DESCRIPTION_SCAN_LINES);
        text.push_str("/* too late */\n");
        assert_eq!(extract_description(&text), "");
    }

    #[test]
    fn test_no_comment_is_empty() {
        assert_eq!(extract_description("#!/bin/sh\n# shell comment\necho 1\n"), "");
        assert_eq!(extract_description(""), "");
    }

    #[test]
    fn test_unterminated_comment_keeps_collected_text() {
        let text = "/*\n * dangling\n";
        assert_eq!(extract_description(text), "dangling");
    }

    #[test]
    fn test_read_description_missing_file() {
        assert_eq!(read_description(Path::new("/nonexistent/handler")), "");
    }

    #[test]
    fn test_read_description_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("h.sh");
        std::fs::write(&path, "#!/bin/sh\n/*\n * Logs every write\n */\n").unwrap();
        assert_eq!(read_description(&path), "Logs every write");
    }
}
