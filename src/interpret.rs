//! Turning raw generative text into the payload stored and returned.
//!
//! The service is asked for JSON but does not always comply. Every parser
//! here is total: text that can't be read yields a canned, degraded payload
//! rather than an error, so a chatty reply never fails a task.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::divination::SymbolicResult;

/// Structured reading for a divination question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default)]
    pub direct_answer: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub colloquial_explanation: String,
    #[serde(default)]
    pub advice: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Set when the reply could not be parsed and this is the canned reading.
    #[serde(default)]
    pub degraded: bool,
}

impl Reading {
    /// The fallback reading, built only from the cast itself.
    pub fn canned(cast: &SymbolicResult) -> Self {
        Self {
            direct_answer: String::new(),
            summary: format!(
                "本卦{}，变卦{}，{}指向收敛与观察。",
                cast.primary_form, cast.secondary_form, cast.changing_line
            ),
            colloquial_explanation: String::new(),
            advice: vec!["放慢节奏".into(), "先稳后动".into(), "留意细节".into()],
            warnings: vec!["避免冲动".into(), "勿轻信承诺".into()],
            keywords: vec!["守".into(), "缓".into(), "静".into()],
            degraded: true,
        }
    }
}

/// Pull the JSON object out of a reply that may be fenced or wrapped in
/// prose. Returns the trimmed input when no `{...}` span is found.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if end > start => &unfenced[start..=end],
        _ => unfenced,
    }
}

/// Parse a divination reply, falling back to [`Reading::canned`].
pub fn parse_reading(raw: &str, cast: &SymbolicResult) -> Reading {
    match serde_json::from_str::<Reading>(extract_json(raw)) {
        Ok(mut reading) if !reading.summary.is_empty() || !reading.direct_answer.is_empty() => {
            reading.degraded = false;
            reading
        }
        Ok(_) => {
            tracing::warn!("reading has neither summary nor answer, using canned reading");
            Reading::canned(cast)
        }
        Err(e) => {
            tracing::warn!(error = %e, "unparseable reading, using canned reading");
            Reading::canned(cast)
        }
    }
}

/// Parse a compatibility reply into a JSON object, falling back to a canned
/// object that keeps the raw text for reference.
pub fn parse_compatibility(raw: &str) -> (Value, bool) {
    match serde_json::from_str::<Value>(extract_json(raw)) {
        Ok(value @ Value::Object(_)) => (value, false),
        _ => {
            tracing::warn!("unparseable compatibility analysis, using canned analysis");
            (
                json!({
                    "score": 0,
                    "keyword": "天机难测",
                    "bazi_analysis": "服务器解析异常，请重试",
                    "hexagram_analysis": raw,
                    "story_interpretation": "...",
                    "advice": [],
                    "poem": "道可道非常道",
                }),
                true,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::divination::generate;
    use chrono::NaiveDate;

    fn cast() -> SymbolicResult {
        let now = NaiveDate::from_ymd_opt(2024, 6, 10)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap();
        generate("今日运势", now)
    }

    #[test]
    fn extract_json_plain() {
        assert_eq!(extract_json(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_with_json_fence() {
        let input = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(input), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_with_plain_fence() {
        let input = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(input), r#"{"a": 1}"#);
    }

    #[test]
    fn extract_json_from_prose() {
        let input = "好的，以下是解读：{\"a\": {\"b\": 2}} 祝好";
        assert_eq!(extract_json(input), r#"{"a": {"b": 2}}"#);
    }

    #[test]
    fn extract_json_without_braces_returns_trimmed() {
        assert_eq!(extract_json("  just words \n"), "just words");
    }

    #[test]
    fn parses_full_reading() {
        let raw = r#"{"direct_answer":"静待","summary":"乾卦刚健","advice":["早起"],"keywords":["健"]}"#;
        let reading = parse_reading(raw, &cast());
        assert!(!reading.degraded);
        assert_eq!(reading.direct_answer, "静待");
        assert_eq!(reading.advice, vec!["早起".to_string()]);
        assert!(reading.warnings.is_empty());
    }

    #[test]
    fn degrades_on_prose() {
        let reading = parse_reading("the stars are unclear", &cast());
        assert!(reading.degraded);
        assert!(reading.summary.contains("本卦乾"));
        assert!(reading.summary.contains("变卦履"));
        assert!(reading.summary.contains("动爻3"));
    }

    #[test]
    fn degrades_on_empty_object() {
        assert!(parse_reading("{}", &cast()).degraded);
    }

    #[test]
    fn degraded_flag_in_reply_is_ignored() {
        let reading = parse_reading(r#"{"summary":"ok","degraded":true}"#, &cast());
        assert!(!reading.degraded);
    }

    #[test]
    fn compatibility_object_passes_through() {
        let (value, degraded) = parse_compatibility("```json\n{\"score\": 88}\n```");
        assert!(!degraded);
        assert_eq!(value["score"], 88);
    }

    #[test]
    fn compatibility_falls_back_and_keeps_raw() {
        let (value, degraded) = parse_compatibility("no json here");
        assert!(degraded);
        assert_eq!(value["score"], 0);
        assert_eq!(value["hexagram_analysis"], "no json here");
    }
}
