/// Redact sensitive tokens (API keys, passwords, etc.) from a message before it
/// reaches logs, failure signals or the audit trail.
#[must_use]
pub fn redact_sensitive(message: &str) -> String {
    message
        .lines()
        .map(|line| {
            line.split_whitespace()
                .map(redact_token)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[must_use]
fn redact_token(token: &str) -> String {
    token.split_once('=').map_or_else(
        || token.to_string(),
        |(key, _)| {
            let normalized = key.to_ascii_lowercase();
            if ["token", "password", "secret", "api_key", "database_url"]
                .iter()
                .any(|sensitive| normalized.contains(sensitive))
            {
                format!("{key}=<redacted>")
            } else {
                token.to_string()
            }
        },
    )
}

/// Truncate to at most `max_chars` characters, marking the cut.
#[must_use]
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let kept: String = message.chars().take(max_chars).collect();
    format!("{kept}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_sensitive_tokens_when_redacting_then_secret_values_are_removed() {
        let input = "token=abc password=123 ok=value";
        assert_eq!(
            redact_sensitive(input),
            "token=<redacted> password=<redacted> ok=value"
        );
    }

    #[test]
    fn given_mixed_case_sensitive_keys_when_redacting_then_values_are_removed() {
        let input = "API_KEY=topsecret\nDataBase_Url=postgres://localhost safe=yes";
        assert_eq!(
            redact_sensitive(input),
            "API_KEY=<redacted>\nDataBase_Url=<redacted> safe=yes"
        );
    }

    #[test]
    fn given_message_without_key_value_tokens_when_redacting_then_message_is_unchanged() {
        let input = "plain text without assignments";
        assert_eq!(redact_sensitive(input), input);
    }

    #[test]
    fn truncate_keeps_short_messages_and_marks_long_ones() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("abcdefgh", 3), "abc…");
    }
}
