//! Escaping for text sent to the multiplexer.
//!
//! All literal text reaches tmux through `send-keys -l` as a single argv
//! element, so the shell never sees it. The remaining hazard is tmux's own
//! command parser, which treats backslashes and semicolons specially inside
//! arguments; both are escaped here. Quotes and control bytes pass through
//! untouched — `-l` delivers them verbatim to the pane.

/// Escape `text` for use as the argument of `send-keys -l`.
#[must_use]
pub fn escape_send_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            ';' => escaped.push_str("\\;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Translate a client key name to the multiplexer's key token.
///
/// Only the interactive-prompt keys are allowed; `S-Tab` maps to the
/// back-tab token.
#[must_use]
pub fn key_token(key: &str) -> Option<&'static str> {
    match key {
        "Enter" => Some("Enter"),
        "C-c" => Some("C-c"),
        "C-d" => Some("C-d"),
        "y" => Some("y"),
        "n" => Some("n"),
        "S-Tab" => Some("BTab"),
        "Escape" => Some("Escape"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(escape_send_text("ls -la"), "ls -la");
        assert_eq!(escape_send_text(""), "");
    }

    #[test]
    fn single_quotes_pass_through() {
        assert_eq!(escape_send_text("echo 'hi there'"), "echo 'hi there'");
        assert_eq!(escape_send_text("don't"), "don't");
    }

    #[test]
    fn double_quotes_pass_through() {
        assert_eq!(escape_send_text(r#"echo "hi""#), r#"echo "hi""#);
    }

    #[test]
    fn backslashes_are_doubled() {
        assert_eq!(escape_send_text(r"a\b"), r"a\\b");
        assert_eq!(escape_send_text(r"\\"), r"\\\\");
    }

    #[test]
    fn semicolons_are_escaped() {
        assert_eq!(escape_send_text("ls; whoami"), r"ls\; whoami");
        assert_eq!(escape_send_text(";"), r"\;");
    }

    #[test]
    fn control_bytes_pass_through() {
        assert_eq!(escape_send_text("\u{3}"), "\u{3}");
        assert_eq!(escape_send_text("line\nnext"), "line\nnext");
        assert_eq!(escape_send_text("tab\there"), "tab\there");
    }

    #[test]
    fn mixed_payload() {
        assert_eq!(
            escape_send_text(r#"git commit -m 'x; \y'"#),
            r#"git commit -m 'x\; \\y'"#
        );
    }

    #[test]
    fn key_allow_list() {
        assert_eq!(key_token("Enter"), Some("Enter"));
        assert_eq!(key_token("C-c"), Some("C-c"));
        assert_eq!(key_token("C-d"), Some("C-d"));
        assert_eq!(key_token("y"), Some("y"));
        assert_eq!(key_token("n"), Some("n"));
        assert_eq!(key_token("S-Tab"), Some("BTab"));
        assert_eq!(key_token("Escape"), Some("Escape"));
        assert_eq!(key_token("C-z"), None);
        assert_eq!(key_token("rm -rf"), None);
        assert_eq!(key_token(""), None);
    }
}
