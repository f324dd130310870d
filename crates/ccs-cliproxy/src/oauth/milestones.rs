/// Milestones recognized in the sidecar's login output. The stream is plain
/// text meant for humans; parsing is deliberately forgiving about casing and
/// surrounding prose.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Milestone {
    /// The authorization URL the user must open.
    AuthUrl(String),
    /// The local callback server is up and waiting.
    CallbackReady,
    /// A device-code pairing code was issued.
    UserCode(String),
    /// The verification URL for a device-code flow.
    VerificationUrl(String),
    /// The provider wants a GCP project picked.
    ProjectPrompt(String),
    Completed,
    Failed(String),
}

pub fn parse_milestone(line: &str) -> Option<Milestone> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();

    if lower.contains("authentication successful")
        || lower.contains("login successful")
        || lower.contains("credentials saved")
        || lower.contains("token saved")
    {
        return Some(Milestone::Completed);
    }
    if lower.contains("authentication failed")
        || lower.contains("login failed")
        || lower.starts_with("error:")
        || lower.starts_with("error ")
    {
        return Some(Milestone::Failed(trimmed.to_string()));
    }
    if lower.contains("select a project") || lower.contains("choose a project") {
        return Some(Milestone::ProjectPrompt(trimmed.to_string()));
    }
    if lower.contains("callback") && (lower.contains("listening") || lower.contains("ready"))
        || lower.contains("waiting for authentication")
        || lower.contains("waiting for callback")
    {
        return Some(Milestone::CallbackReady);
    }
    if let Some(code) = parse_user_code(trimmed) {
        return Some(Milestone::UserCode(code));
    }
    if let Some(url) = first_http_token(trimmed) {
        if lower.contains("verification") || lower.contains("device") {
            return Some(Milestone::VerificationUrl(url));
        }
        if lower.contains("auth")
            || lower.contains("login")
            || lower.contains("visit")
            || lower.contains("open")
            || lower.contains("browser")
        {
            return Some(Milestone::AuthUrl(url));
        }
    }
    None
}

/// First `http(s)://` token on the line, trimmed of trailing punctuation.
pub fn first_http_token(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(|token| token.trim_end_matches([')', ']', '.', ',', ';']).to_string())
}

/// A pairing code like `ABCD-1234` on a line that mentions "code".
fn parse_user_code(line: &str) -> Option<String> {
    if !line.to_lowercase().contains("code") {
        return None;
    }
    line.split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-'))
        .find(|token| {
            let groups: Vec<&str> = token.split('-').collect();
            groups.len() >= 2
                && groups.iter().all(|group| {
                    group.len() >= 3
                        && group
                            .chars()
                            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                })
        })
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_url_is_extracted_from_prose() {
        let line = "Please open the following URL to log in: https://accounts.google.com/o/oauth2/v2/auth?client_id=x";
        match parse_milestone(line) {
            Some(Milestone::AuthUrl(url)) => {
                assert!(url.starts_with("https://accounts.google.com"))
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn callback_ready_variants() {
        for line in [
            "Callback server listening on 127.0.0.1:8085",
            "Waiting for authentication...",
            "callback ready",
        ] {
            assert_eq!(parse_milestone(line), Some(Milestone::CallbackReady), "{line}");
        }
    }

    #[test]
    fn device_code_and_verification_url() {
        assert_eq!(
            parse_milestone("Enter the code: WDJB-MJHT"),
            Some(Milestone::UserCode("WDJB-MJHT".to_string()))
        );
        assert_eq!(
            parse_milestone("Device verification: https://github.com/login/device"),
            Some(Milestone::VerificationUrl(
                "https://github.com/login/device".to_string()
            ))
        );
    }

    #[test]
    fn completion_failure_and_project_prompt() {
        assert_eq!(
            parse_milestone("Authentication successful! You may close this window."),
            Some(Milestone::Completed)
        );
        assert!(matches!(
            parse_milestone("Error: invalid_grant while exchanging code"),
            Some(Milestone::Failed(_))
        ));
        assert!(matches!(
            parse_milestone("Select a project to continue:"),
            Some(Milestone::ProjectPrompt(_))
        ));
    }

    #[test]
    fn plain_chatter_is_ignored()  {
        for line in ["", "Starting up...", "v3.1.4", "listening on port 9"] {
            assert_eq!(parse_milestone(line), None, "{line}");
        }
    }
}
