//! Fit a run summary into a chat platform's message size limit.

/// Slack's `text` field limit.
pub const SLACK_MAX_CHARS: usize = 40_000;
/// Discord's `content` field limit.
pub const DISCORD_MAX_CHARS: usize = 2_000;

const MARKER: &str = "[...truncated...]\n";

/// Join `header` and `log` into at most `max_chars` characters.
///
/// The header is kept intact and the log loses its beginning, since the end
/// of a job's output is usually where the failure is.
pub fn fit_message(header: &str, log: &str, max_chars: usize) -> String {
    let header_len = header.chars().count();
    let log_len = log.chars().count();

    if header_len + log_len <= max_chars {
        return format!("{header}{log}");
    }

    let marker_len = MARKER.chars().count();
    if header_len + marker_len >= max_chars {
        return header.chars().take(max_chars).collect();
    }

    let keep = max_chars - header_len - marker_len;
    let tail: String = log.chars().skip(log_len - keep).collect();
    format!("{header}{MARKER}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_untouched() {
        assert_eq!(fit_message("job (exitcode 0):\n", "ok\n", 100), "job (exitcode 0):\nok\n");
    }

    #[test]
    fn long_log_keeps_tail() {
        let log = format!("{}THE END", "x".repeat(5_000));
        let msg = fit_message("hdr\n", &log, DISCORD_MAX_CHARS);
        assert_eq!(msg.chars().count(), DISCORD_MAX_CHARS);
        assert!(msg.starts_with("hdr\n[...truncated...]\n"));
        assert!(msg.ends_with("THE END"));
    }

    #[test]
    fn counts_chars_not_bytes() {
        let log = "é".repeat(3_000);
        let msg = fit_message("h:", &log, DISCORD_MAX_CHARS);
        assert_eq!(msg.chars().count(), DISCORD_MAX_CHARS);
    }

    #[test]
    fn oversized_header_is_cut() {
        let header = "n".repeat(50);
        let msg = fit_message(&header, "log", 10);
        assert_eq!(msg, "n".repeat(10));
    }
}
