use std::collections::BTreeSet;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::analysis::{AnalysisResult, Intention, Sentiment};

pub const DEFAULT_MAX_KEYWORDS: usize = 10;
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "get", "had", "has",
    "have", "hello", "hi", "how", "i", "if", "in", "is", "it", "its", "just", "me", "my", "no",
    "not", "of", "on", "or", "our", "please", "so", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "to", "us", "was", "we", "were", "what", "when", "where",
    "which", "who", "why", "will", "with", "would", "you", "your",
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AnalysisParseError {
    #[error("response contained no JSON object")]
    MissingJson,
    #[error("response JSON did not match the analysis schema: {0}")]
    Schema(String),
    #[error("unknown intention `{0}`")]
    UnknownIntention(String),
    #[error("unknown sentiment `{0}`")]
    UnknownSentiment(String),
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnalysis {
    intentions: Vec<String>,
    confidence: f64,
    sentiment: String,
    #[serde(default)]
    keywords: Vec<String>,
}

/// Constrained prompt asking the model for the fixed analysis schema.
pub fn analysis_prompt(text: &str, max_keywords: usize) -> String {
    let intentions =
        Intention::ALL.iter().map(Intention::as_str).collect::<Vec<_>>().join(", ");
    format!(
        "Analyze the customer message below and answer with ONLY a JSON object of the form \
         {{\"intentions\": [..], \"confidence\": 0.0, \"sentiment\": \"..\", \"keywords\": [..]}}.\n\
         - intentions: one or more of [{intentions}]\n\
         - confidence: number between 0 and 1\n\
         - sentiment: one of positive, negative, neutral\n\
         - keywords: at most {max_keywords} short keywords\n\n\
         Message:\n\"\"\"\n{text}\n\"\"\""
    )
}

/// Parses a model answer against the analysis schema. Markdown fences or
/// prose around the object are tolerated; the object itself is not.
pub fn parse_analysis(
    raw: &str,
    max_keywords: usize,
) -> Result<AnalysisResult, AnalysisParseError> {
    let json = extract_json_object(raw).ok_or(AnalysisParseError::MissingJson)?;
    let parsed: RawAnalysis = serde_json::from_str(json)
        .map_err(|error| AnalysisParseError::Schema(error.to_string()))?;

    if !(0.0..=1.0).contains(&parsed.confidence) || parsed.confidence.is_nan() {
        return Err(AnalysisParseError::ConfidenceOutOfRange(parsed.confidence.to_string()));
    }

    let mut intentions = Vec::new();
    for value in &parsed.intentions {
        let intention = Intention::parse(value)
            .ok_or_else(|| AnalysisParseError::UnknownIntention(value.clone()))?;
        if !intentions.contains(&intention) {
            intentions.push(intention);
        }
    }
    if intentions.is_empty() {
        return Err(AnalysisParseError::Schema("intentions must not be empty".to_string()));
    }

    let sentiment = Sentiment::parse(&parsed.sentiment)
        .ok_or_else(|| AnalysisParseError::UnknownSentiment(parsed.sentiment.clone()))?;

    let mut seen = BTreeSet::new();
    let keywords = parsed
        .keywords
        .into_iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty() && seen.insert(keyword.clone()))
        .take(max_keywords)
        .collect();

    Ok(AnalysisResult { intentions, confidence: parsed.confidence, sentiment, keywords })
}

/// Minimal rule-based analysis used whenever the model path fails.
pub fn fallback_analysis(text: &str, max_keywords: usize) -> AnalysisResult {
    AnalysisResult {
        intentions: vec![Intention::Other],
        confidence: FALLBACK_CONFIDENCE,
        sentiment: Sentiment::Neutral,
        keywords: extract_keywords(text, max_keywords),
    }
}

pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.split(|ch: char| !ch.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|word| word.chars().count() > 2)
        .filter(|word| !STOP_WORDS.contains(&word.as_str()))
        .filter(|word| seen.insert(word.clone()))
        .take(max_keywords)
        .collect()
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::{
        analysis_prompt, extract_keywords, fallback_analysis, parse_analysis, AnalysisParseError,
    };
    use crate::domain::analysis::{Intention, Sentiment};

    #[test]
    fn parses_fenced_json_answer() {
        let raw = "```json\n{\"intentions\":[\"SALES\",\"sales\"],\"confidence\":0.8,\
                   \"sentiment\":\"Positive\",\"keywords\":[\"Pricing\",\"pricing\",\"plan\"]}\n```";
        let result = parse_analysis(raw, 10).expect("valid analysis");

        assert_eq!(result.intentions, vec![Intention::Sales]);
        assert_eq!(result.sentiment, Sentiment::Positive);
        assert_eq!(result.keywords, vec!["pricing", "plan"]);
    }

    #[test]
    fn rejects_intentions_outside_the_enumeration() {
        let raw = r#"{"intentions":["PURCHASE"],"confidence":0.5,"sentiment":"neutral"}"#;
        assert_eq!(
            parse_analysis(raw, 10),
            Err(AnalysisParseError::UnknownIntention("PURCHASE".to_string()))
        );
    }

    #[test]
    fn rejects_out_of_range_confidence_and_unknown_fields() {
        let raw = r#"{"intentions":["SUPPORT"],"confidence":1.5,"sentiment":"neutral"}"#;
        assert!(matches!(
            parse_analysis(raw, 10),
            Err(AnalysisParseError::ConfidenceOutOfRange(_))
        ));

        let raw = r#"{"intentions":["SUPPORT"],"confidence":0.5,"sentiment":"neutral","mood":1}"#;
        assert!(matches!(parse_analysis(raw, 10), Err(AnalysisParseError::Schema(_))));
    }

    #[test]
    fn missing_json_is_reported() {
        assert_eq!(parse_analysis("I think it is sales", 10), Err(AnalysisParseError::MissingJson));
    }

    #[test]
    fn keywords_are_capped() {
        let raw = r#"{"intentions":["INFORMATION"],"confidence":0.4,"sentiment":"neutral",
                     "keywords":["a1","b2","c3","d4"]}"#;
        assert_eq!(parse_analysis(raw, 2).expect("valid").keywords, vec!["a1", "b2"]);
    }

    #[test]
    fn fallback_is_low_confidence_other() {
        let result = fallback_analysis("Hello, I want the PRICE of the premium plan please", 10);

        assert_eq!(result.intentions, vec![Intention::Other]);
        assert_eq!(result.sentiment, Sentiment::Neutral);
        assert!((result.confidence - 0.1).abs() < f64::EPSILON);
        assert_eq!(result.keywords, vec!["want", "price", "premium", "plan"]);
    }

    #[test]
    fn keyword_extraction_dedupes() {
        assert_eq!(extract_keywords("refund refund REFUND now", 10), vec!["refund", "now"]);
    }

    #[test]
    fn prompt_lists_the_closed_intention_set() {
        let prompt = analysis_prompt("hi", 10);
        assert!(prompt.contains("CANCELLATION"));
        assert!(prompt.contains("at most 10"));
    }
}
