//! Console text sanitizer.
//!
//! Strips the CI server's hidden console annotations (`ESC[8m ... ESC[0m`,
//! which may span several lines), every other terminal control sequence and
//! carriage returns. Text is always cleaned before it is cached or sent to a
//! viewer, so replays never carry escape codes.

use regex::Regex;
use std::sync::OnceLock;

fn hidden_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\x1b\[8m.*?\x1b\[0m").expect("hidden block pattern"))
}

fn control_sequence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // CSI sequences plus the two-byte ESC forms.
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b[@-Z\\-_]").expect("control sequence pattern")
    })
}

fn single_pass(raw: &str) -> String {
    let text = hidden_block().replace_all(raw, "");
    let text = control_sequence().replace_all(&text, "");
    text.replace('\r', "")
}

/// Remove hidden blocks, control sequences and carriage returns.
///
/// Removing one sequence can splice its neighbours into a new one, so the
/// passes repeat until the text stops changing. Every productive pass
/// shrinks the text, which bounds the loop and makes the result a fixpoint:
/// `clean(clean(x)) == clean(x)`.
pub fn clean(raw: &str) -> String {
    let mut current = single_pass(raw);
    loop {
        let next = single_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hidden_annotation() {
        let raw = "\x1b[8mha:////4PmQ3AAAA\x1b[0m[Pipeline] stage\n";
        assert_eq!(clean(raw), "[Pipeline] stage\n");
    }

    #[test]
    fn strips_hidden_block_spanning_lines() {
        let raw = "before\n\x1b[8mha:line1\nline2\x1b[0mafter\n";
        assert_eq!(clean(raw), "before\nafter\n");
    }

    #[test]
    fn strips_color_codes() {
        let raw = "\x1b[31mERROR\x1b[0m: \x1b[1;32mok\x1b[m\n";
        assert_eq!(clean(raw), "ERROR: ok\n");
    }

    #[test]
    fn strips_carriage_returns() {
        assert_eq!(clean("line one\r\nline two\r\n"), "line one\nline two\n");
    }

    #[test]
    fn plain_text_is_untouched() {
        let raw = "+ cargo build --release\n   Compiling foo v0.1.0\n";
        assert_eq!(clean(raw), raw);
    }

    #[test]
    fn unterminated_hidden_marker_is_dropped_as_control_sequence() {
        assert_eq!(clean("a\x1b[8mb\n"), "ab\n");
    }

    #[test]
    fn spliced_sequences_are_removed() {
        // Dropping the inner sequence leaves `ESC[31m`, which must go too.
        let raw = "x\x1b\x1b[1m[31my";
        assert_eq!(clean(raw), "xy");
        let raw = "x\x1b\r[0my";
        assert_eq!(clean(raw), "xy");
    }

    #[test]
    fn clean_is_idempotent() {
        let samples = [
            "",
            "plain\n",
            "\x1b[8mha:abc\x1b[0mvisible\r\n",
            "\x1b[\x1b[8mX\x1b[0m31mred\x1b[0m",
            "\x1b[8\x1b[1mm hidden?\x1b[0m tail",
            "\r\r\x1b\x1b[2K[1mbold",
            "[Pipeline] { (Build)\n\x1b[Kdone\n",
        ];
        for sample in samples {
            let once = clean(sample);
            assert_eq!(clean(&once), once, "not idempotent for {:?}", sample);
        }
    }
}
