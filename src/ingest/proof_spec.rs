//! `PROOF OF WORK:` directive parsing.
//!
//! The first directive line in a step body defines the step's challenge;
//! absence means the step advances freely. The grammar is closed:
//!
//! ```text
//! PROOF OF WORK: timeout <N>s [expect="<substring>"] <cmd…>
//! PROOF OF WORK: mcp <tool_name> [expected=<json>]
//! PROOF OF WORK: user_input "<prompt>"
//! PROOF OF WORK: comment min=<N>
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::proof::ProofOfWork;

static DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*PROOF OF WORK:\s*(.+)$").expect("directive regex"));

static SHELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^timeout\s+(\d+)s\s+(?:expect="([^"]*)"\s+)?(.+)$"#).expect("shell regex")
});

static MCP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^mcp\s+(\S+)(?:\s+expected=(.+))?$").expect("mcp regex"));

static USER_INPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^user_input\s+"([^"]*)"$"#).expect("user_input regex"));

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^comment\s+min=(\d+)$").expect("comment regex"));

/// Extract the challenge defined by the first directive in `body`, if any.
pub fn parse(body: &str) -> Option<ProofOfWork> {
    let tail = DIRECTIVE.captures(body)?.get(1)?.as_str().trim().to_string();
    match parse_form(&tail) {
        Some(spec) => Some(spec),
        None => {
            warn!(directive = %tail, "unrecognized proof-of-work form, step will advance freely");
            None
        }
    }
}

fn parse_form(tail: &str) -> Option<ProofOfWork> {
    if let Some(caps) = SHELL.captures(tail) {
        return Some(ProofOfWork::Shell {
            timeout_seconds: caps[1].parse().ok()?,
            expected_stdout: caps.get(2).map(|m| m.as_str().to_string()),
            cmd: caps[3].trim().to_string(),
        });
    }
    if let Some(caps) = MCP.captures(tail) {
        let expected_result = match caps.get(2) {
            Some(raw) => Some(serde_json::from_str(raw.as_str().trim()).ok()?),
            None => None,
        };
        return Some(ProofOfWork::Mcp {
            tool_name: caps[1].to_string(),
            expected_result,
        });
    }
    if let Some(caps) = USER_INPUT.captures(tail) {
        return Some(ProofOfWork::UserInput {
            prompt: caps[1].to_string(),
        });
    }
    if let Some(caps) = COMMENT.captures(tail) {
        return Some(ProofOfWork::Comment {
            min_length: caps[1].parse().ok()?,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_shell_form() {
        let spec = parse("intro\nPROOF OF WORK: timeout 5s echo ok\ntail").unwrap();
        assert_eq!(
            spec,
            ProofOfWork::Shell {
                cmd: "echo ok".into(),
                timeout_seconds: 5,
                expected_stdout: None,
            }
        );
    }

    #[test]
    fn parses_shell_form_with_expect() {
        let spec = parse(r#"PROOF OF WORK: timeout 30s expect="PASS" make test"#).unwrap();
        assert_eq!(
            spec,
            ProofOfWork::Shell {
                cmd: "make test".into(),
                timeout_seconds: 30,
                expected_stdout: Some("PASS".into()),
            }
        );
    }

    #[test]
    fn parses_mcp_form() {
        let spec = parse("PROOF OF WORK: mcp fetch_logs").unwrap();
        assert_eq!(
            spec,
            ProofOfWork::Mcp {
                tool_name: "fetch_logs".into(),
                expected_result: None,
            }
        );

        let spec = parse(r#"PROOF OF WORK: mcp fetch_logs expected={"lines": 0}"#).unwrap();
        assert_eq!(
            spec,
            ProofOfWork::Mcp {
                tool_name: "fetch_logs".into(),
                expected_result: Some(json!({"lines": 0})),
            }
        );
    }

    #[test]
    fn parses_user_input_form() {
        let spec = parse(r#"PROOF OF WORK: user_input "Ready to continue?""#).unwrap();
        assert_eq!(
            spec,
            ProofOfWork::UserInput {
                prompt: "Ready to continue?".into(),
            }
        );
    }

    #[test]
    fn parses_comment_form() {
        let spec = parse("PROOF OF WORK: comment min=40").unwrap();
        assert_eq!(spec, ProofOfWork::Comment { min_length: 40 });
    }

    #[test]
    fn directive_is_case_insensitive() {
        assert!(parse("proof of work: timeout 5s echo hi").is_some());
        assert!(parse("Proof Of Work: comment min=1").is_some());
    }

    #[test]
    fn only_first_directive_counts() {
        let spec = parse(
            "PROOF OF WORK: comment min=1\nPROOF OF WORK: timeout 5s echo ok",
        )
        .unwrap();
        assert_eq!(spec, ProofOfWork::Comment { min_length: 1 });
    }

    #[test]
    fn absence_means_no_challenge() {
        assert!(parse("just a body\nwith lines").is_none());
    }

    #[test]
    fn unrecognized_form_means_no_challenge() {
        assert!(parse("PROOF OF WORK: dance for me").is_none());
        assert!(parse("PROOF OF WORK: timeout 5 echo missing-suffix").is_none());
    }
}
