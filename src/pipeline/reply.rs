//! Reply parsing: model text → typed step output.
//!
//! Models asked for "only JSON" still wrap it in fences, prepend a sentence,
//! or leave a trailing comma. These passes undo exactly those quirks and
//! nothing else, then hand the text to serde. Anything serde still rejects is
//! a [`StepError`], which the workflow turns into a `null` step output.
//!
//! Passes, in order:
//! 1. Strip a ```` ```json ```` fence around the payload
//! 2. Drop invisible Unicode (BOM, zero-width spaces)
//! 3. Cut to the outermost JSON object or array
//! 4. Only if serde fails: remove trailing commas before `}` / `]`

use crate::error::StepError;
use crate::workflow::Step;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Parse `content` as `T`, tolerating the usual model wrapping.
pub fn parse_reply<T: DeserializeOwned>(step: Step, content: &str) -> Result<T, StepError> {
    let s = strip_fences(content);
    let s = remove_invisible_chars(&s);
    let payload = outermost_json(&s).unwrap_or(s.trim());

    match serde_json::from_str::<T>(payload) {
        Ok(v) => Ok(v),
        Err(first) => {
            let relaxed = remove_trailing_commas(payload);
            serde_json::from_str::<T>(&relaxed).map_err(|_| {
                debug!("{}: rejected reply: {}", step, truncate(content, 200));
                StepError::UnparsableReply {
                    step,
                    detail: first.to_string(),
                }
            })
        }
    }
}

// ── Pass 1: fences ───────────────────────────────────────────────────────────

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)\n?```").unwrap());

fn strip_fences(input: &str) -> String {
    match RE_FENCE.captures(input) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Pass 2: invisible characters ─────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}'))
        .collect()
}

// ── Pass 3: outermost JSON value ─────────────────────────────────────────────

/// Slice from the first `{` or `[` to its matching closer, skipping brackets
/// inside strings.
fn outermost_json(input: &str) -> Option<&str> {
    let start = input.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in input[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&input[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Pass 4: trailing commas ──────────────────────────────────────────────────

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").unwrap());

fn remove_trailing_commas(input: &str) -> String {
    RE_TRAILING_COMMA.replace_all(input, "$1").to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AreasOfInterest, BoundingBox, ExtractedSummary};

    #[test]
    fn plain_json() {
        let s: ExtractedSummary = parse_reply(
            Step::ExtractSummaryData,
            r#"{"total_amount": {"value": 12.5}, "tax_amount": null}"#,
        )
        .unwrap();
        assert_eq!(s.total_amount.unwrap().value, 12.5);
    }

    #[test]
    fn fenced_json_with_prose() {
        let reply = "Here are the areas:\n```json\n{\"header_area\": [0, 0, 1000, 200]}\n```\nDone.";
        let areas: AreasOfInterest = parse_reply(Step::DecideAoi, reply).unwrap();
        assert_eq!(areas.header_area, Some(BoundingBox::new(0, 0, 1000, 200)));
    }

    #[test]
    fn prose_without_fence() {
        let reply = "Sure! {\"summary_area\": {\"x1\": 600, \"y1\": 800, \"x2\": 1000, \"y2\": 950}} Hope this helps.";
        let areas: AreasOfInterest = parse_reply(Step::DecideAoi, reply).unwrap();
        assert_eq!(areas.summary_area, Some(BoundingBox::new(600, 800, 1000, 950)));
    }

    #[test]
    fn trailing_commas_are_forgiven() {
        let reply = r#"{"total_amount": {"value": 3, "bbox": [1, 2, 3, 4],},}"#;
        let s: ExtractedSummary = parse_reply(Step::ExtractSummaryData, reply).unwrap();
        assert_eq!(s.total_amount.unwrap().bbox, Some(BoundingBox::new(1, 2, 3, 4)));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_cut() {
        assert_eq!(
            outermost_json(r#"x {"a": "}{", "b": [1]} y"#),
            Some(r#"{"a": "}{", "b": [1]}"#)
        );
    }

    #[test]
    fn bom_is_removed() {
        let s: ExtractedSummary =
            parse_reply(Step::ExtractSummaryData, "\u{FEFF}{\"tax_amount\": 1}").unwrap();
        assert_eq!(s.tax_amount.unwrap().value, 1.0);
    }

    #[test]
    fn garbage_is_a_step_error() {
        let err = parse_reply::<ExtractedSummary>(Step::ExtractSummaryData, "I cannot read this")
            .unwrap_err();
        assert!(err.to_string().contains("extract_summary_data"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("ééé", 2), "éé");
        assert_eq!(truncate("ab", 5), "ab");
    }
}
