//! Readiness verdict parsing from the ready-phase agent output.
//!
//! The agent reports its decision with line-oriented markers:
//! - `VERDICT: READY | CORRECTED | NOT_READY | NEEDS_REVIEW | CLOSE`
//! - `REASON: <text>` for not-ready and close verdicts
//! - `CLOSE_STATUS: <text>` for close verdicts
//! - `CORRECTIONS:` followed by `- item` bullets
//!
//! Markers are matched case-insensitively and may carry markdown decoration.
//! When several verdict lines appear, the last one wins.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static VERDICT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s#>*_`-]*verdict[\s*_`]*:[\s*_`]*(ready|corrected|not[_ ]ready|needs[_ ]review|close)\b")
        .expect("Invalid regex pattern")
});

static REASON_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s#>*_`-]*reason[\s*_`]*:[\s*_`]*(.+?)\s*$").expect("Invalid regex pattern")
});

static CLOSE_STATUS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s#>*_`-]*close[_ ]status[\s*_`]*:[\s*_`]*(.+?)\s*$")
        .expect("Invalid regex pattern")
});

static CORRECTIONS_HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s#>*_`-]*corrections(?: made)?[\s*_`]*:?[\s*_`]*$")
        .expect("Invalid regex pattern")
});

pub const DEFAULT_CLOSE_STATUS: &str = "Closed - Invalid";

/// The ready phase's decision about an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Ready {
        was_corrected: bool,
        corrections: Vec<String>,
    },
    NotReady {
        reason: String,
    },
    Close {
        reason: String,
        status: String,
    },
}

impl Verdict {
    pub fn is_ready(&self) -> bool {
        matches!(self, Verdict::Ready { .. })
    }
}

/// Parse agent output into a [`Verdict`]. Output without a verdict line is
/// treated as not ready.
pub fn parse_verdict(output: &str) -> Verdict {
    let Some(keyword) = VERDICT_REGEX
        .captures_iter(output)
        .last()
        .map(|caps| caps[1].to_lowercase().replace(' ', "_"))
    else {
        return Verdict::NotReady {
            reason: "agent output contained no verdict".to_string(),
        };
    };

    let reason = last_capture(&REASON_REGEX, output);
    match keyword.as_str() {
        "ready" | "corrected" => {
            let corrections = parse_corrections(output);
            Verdict::Ready {
                was_corrected: keyword == "corrected" || !corrections.is_empty(),
                corrections,
            }
        }
        "close" => Verdict::Close {
            reason: reason.unwrap_or_else(|| "closed by readiness check".to_string()),
            status: last_capture(&CLOSE_STATUS_REGEX, output)
                .unwrap_or_else(|| DEFAULT_CLOSE_STATUS.to_string()),
        },
        "needs_review" => Verdict::NotReady {
            reason: reason.unwrap_or_else(|| "issue needs manual review".to_string()),
        },
        _ => Verdict::NotReady {
            reason: reason.unwrap_or_else(|| "issue is not ready".to_string()),
        },
    }
}

fn last_capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures_iter(text)
        .last()
        .map(|caps| caps[1].trim_end_matches(['*', '_', '`']).trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Bullets following a `CORRECTIONS:` header, up to the first non-bullet line.
fn parse_corrections(output: &str) -> Vec<String> {
    let mut corrections = Vec::new();
    let mut inside = false;
    for line in output.lines() {
        if CORRECTIONS_HEADER_REGEX.is_match(line) {
            inside = true;
            corrections.clear();
            continue;
        }
        if !inside {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        {
            Some(item) if !item.trim().is_empty() => corrections.push(item.trim().to_string()),
            _ => inside = false,
        }
    }
    corrections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready() {
        assert_eq!(
            parse_verdict("checked everything\nVERDICT: READY\n"),
            Verdict::Ready {
                was_corrected: false,
                corrections: vec![]
            }
        );
    }

    #[test]
    fn test_corrected_with_bullets() {
        let output = "## VERDICT: CORRECTED\n\nCORRECTIONS:\n- Fixed line number in repro\n- Updated file path\n\nDone.\n";
        match parse_verdict(output) {
            Verdict::Ready {
                was_corrected,
                corrections,
            } => {
                assert!(was_corrected);
                assert_eq!(
                    corrections,
                    vec!["Fixed line number in repro", "Updated file path"]
                );
            }
            other => panic!("Expected Ready, got {:?}", other),
        }
    }

    #[test]
    fn test_not_ready_with_reason() {
        let output = "**VERDICT:** NOT_READY\n**REASON:** referenced function no longer exists\n";
        assert_eq!(
            parse_verdict(output),
            Verdict::NotReady {
                reason: "referenced function no longer exists".into()
            }
        );
    }

    #[test]
    fn test_close_with_status() {
        let output = "VERDICT: CLOSE\nREASON: already fixed upstream\nCLOSE_STATUS: Closed - Already Fixed\n";
        assert_eq!(
            parse_verdict(output),
            Verdict::Close {
                reason: "already fixed upstream".into(),
                status: "Closed - Already Fixed".into()
            }
        );
    }

    #[test]
    fn test_close_default_status() {
        match parse_verdict("verdict: close\n") {
            Verdict::Close { status, .. } => assert_eq!(status, DEFAULT_CLOSE_STATUS),
            other => panic!("Expected Close, got {:?}", other),
        }
    }

    #[test]
    fn test_needs_review_is_not_ready() {
        assert!(matches!(
            parse_verdict("VERDICT: NEEDS_REVIEW"),
            Verdict::NotReady { .. }
        ));
    }

    #[test]
    fn test_missing_verdict_is_not_ready() {
        match parse_verdict("I looked at the issue and it seems fine.") {
            Verdict::NotReady { reason } => assert!(reason.contains("no verdict")),
            other => panic!("Expected NotReady, got {:?}", other),
        }
    }

    #[test]
    fn test_last_verdict_wins() {
        let output = "Respond with VERDICT: lines.\nVERDICT: NOT_READY\n...\nVERDICT: READY\n";
        assert!(parse_verdict(output).is_ready());
    }
}
