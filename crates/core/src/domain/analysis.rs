use serde::{Deserialize, Serialize};

/// Closed set of intentions the analyzer may report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intention {
    Sales,
    Support,
    Billing,
    Complaint,
    Information,
    Scheduling,
    Cancellation,
    Greeting,
    Other,
}

impl Intention {
    pub const ALL: [Intention; 9] = [
        Self::Sales,
        Self::Support,
        Self::Billing,
        Self::Complaint,
        Self::Information,
        Self::Scheduling,
        Self::Cancellation,
        Self::Greeting,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sales => "SALES",
            Self::Support => "SUPPORT",
            Self::Billing => "BILLING",
            Self::Complaint => "COMPLAINT",
            Self::Information => "INFORMATION",
            Self::Scheduling => "SCHEDULING",
            Self::Cancellation => "CANCELLATION",
            Self::Greeting => "GREETING",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|intention| intention.as_str().eq_ignore_ascii_case(value))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub intentions: Vec<Intention>,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub sentiment: Sentiment,
    pub keywords: Vec<String>,
}

impl AnalysisResult {
    pub fn has_intention(&self, intention: Intention) -> bool {
        self.intentions.contains(&intention)
    }
}
