//! Pure condition evaluation for automation rules.
//!
//! Conditions inside a rule are AND-ed; there is no OR across conditions. A
//! rule without conditions always matches. Nothing here reads the clock or any
//! store, so the same context always yields the same answer.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};

use crate::domain::analysis::AnalysisResult;
use crate::domain::automation::{AutomationRule, Condition, KeywordMode, RuleCondition};

#[derive(Clone, Debug)]
pub struct EvaluationContext<'a> {
    pub content: &'a str,
    pub analysis: &'a AnalysisResult,
    pub sender_is_vip: bool,
    pub conversation_message_count: u32,
    pub now: DateTime<Utc>,
}

pub fn rule_matches(rule: &AutomationRule, context: &EvaluationContext<'_>) -> bool {
    rule.conditions.iter().all(|condition| condition_holds(condition, context))
}

pub fn condition_holds(condition: &RuleCondition, context: &EvaluationContext<'_>) -> bool {
    evaluate(&condition.condition, context) != condition.negate
}

fn evaluate(condition: &Condition, context: &EvaluationContext<'_>) -> bool {
    match condition {
        Condition::IntentionMatch { intentions } => {
            intentions.iter().any(|intention| context.analysis.has_intention(*intention))
        }
        Condition::KeywordMatch { keywords, mode } => {
            keyword_match(context.content, keywords, *mode)
        }
        Condition::SenderIsVip => context.sender_is_vip,
        Condition::FirstMessage => context.conversation_message_count <= 1,
        Condition::TimeWindow { start, end, weekdays, utc_offset_minutes } => in_time_window(
            context.now,
            *start,
            *end,
            weekdays.as_deref(),
            *utc_offset_minutes,
        ),
    }
}

pub fn keyword_match(content: &str, keywords: &[String], mode: KeywordMode) -> bool {
    let haystack = content.to_lowercase();
    let mut needles = keywords
        .iter()
        .map(|keyword| keyword.trim().to_lowercase())
        .filter(|keyword| !keyword.is_empty())
        .peekable();

    if needles.peek().is_none() {
        return false;
    }

    match mode {
        KeywordMode::Any => needles.any(|needle| haystack.contains(&needle)),
        KeywordMode::All => needles.all(|needle| haystack.contains(&needle)),
        KeywordMode::Exact => {
            let trimmed = haystack.trim();
            needles.any(|needle| trimmed == needle)
        }
    }
}

/// `[start, end)` in local time. `start > end` is never satisfied: overnight
/// windows must be configured as two rules.
pub fn in_time_window(
    now: DateTime<Utc>,
    start: NaiveTime,
    end: NaiveTime,
    weekdays: Option<&[Weekday]>,
    utc_offset_minutes: i32,
) -> bool {
    let local = now.naive_utc() + Duration::minutes(i64::from(utc_offset_minutes));

    if let Some(days) = weekdays {
        if !days.is_empty() && !days.contains(&local.weekday()) {
            return false;
        }
    }

    let time = local.time();
    start <= time && time < end
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, TimeZone, Utc, Weekday};

    use super::{condition_holds, in_time_window, keyword_match, rule_matches, EvaluationContext};
    use crate::domain::analysis::{AnalysisResult, Intention, Sentiment};
    use crate::domain::automation::{
        Action, AutomationRule, Condition, KeywordMode, RuleCondition, RuleId, RuleStats,
    };
    use crate::domain::tenant::TenantId;

    fn analysis(intentions: Vec<Intention>) -> AnalysisResult {
        AnalysisResult {
            intentions,
            confidence: 0.8,
            sentiment: Sentiment::Neutral,
            keywords: vec![],
        }
    }

    fn rule(conditions: Vec<RuleCondition>) -> AutomationRule {
        AutomationRule {
            id: RuleId("r-1".to_string()),
            tenant_id: TenantId::new("t-1"),
            name: "rule".to_string(),
            priority: 1,
            active: true,
            conditions,
            actions: vec![Action::AddTag { tag: "Lead".to_string() }],
            stats: RuleStats::default(),
            created_at: Utc::now(),
        }
    }

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).expect("valid time")
    }

    #[test]
    fn sales_and_not_vip_matches_non_vip_sales_message() {
        let analysis = analysis(vec![Intention::Sales]);
        let rule = rule(vec![
            RuleCondition::new(Condition::IntentionMatch { intentions: vec![Intention::Sales] }),
            RuleCondition::negated(Condition::SenderIsVip),
        ]);
        let mut context = EvaluationContext {
            content: "how much is the pro plan?",
            analysis: &analysis,
            sender_is_vip: false,
            conversation_message_count: 3,
            now: Utc::now(),
        };

        assert!(rule_matches(&rule, &context));
        context.sender_is_vip = true;
        assert!(!rule_matches(&rule, &context));
    }

    #[test]
    fn rule_without_conditions_always_matches() {
        let analysis = analysis(vec![Intention::Other]);
        let context = EvaluationContext {
            content: "",
            analysis: &analysis,
            sender_is_vip: false,
            conversation_message_count: 10,
            now: Utc::now(),
        };
        assert!(rule_matches(&rule(vec![]), &context));
    }

    #[test]
    fn keyword_modes() {
        let keywords = vec!["Refund".to_string(), "order".to_string()];
        assert!(keyword_match("I want a REFUND", &keywords, KeywordMode::Any));
        assert!(!keyword_match("I want a REFUND", &keywords, KeywordMode::All));
        assert!(keyword_match("refund my order", &keywords, KeywordMode::All));
        assert!(keyword_match("  Refund ", &keywords, KeywordMode::Exact));
        assert!(!keyword_match("refund please", &keywords, KeywordMode::Exact));
        assert!(!keyword_match("anything", &[], KeywordMode::Any));
    }

    #[test]
    fn first_message_condition_counts_current_message() {
        let analysis = analysis(vec![]);
        let condition = RuleCondition::new(Condition::FirstMessage);
        let mut context = EvaluationContext {
            content: "hi",
            analysis: &analysis,
            sender_is_vip: false,
            conversation_message_count: 1,
            now: Utc::now(),
        };
        assert!(condition_holds(&condition, &context));
        context.conversation_message_count = 2;
        assert!(!condition_holds(&condition, &context));
    }

    #[test]
    fn time_window_is_half_open_and_honors_weekdays() {
        // 2026-01-05 is a Monday.
        let monday_nine = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().expect("time");
        let monday_five = Utc.with_ymd_and_hms(2026, 1, 5, 17, 0, 0).single().expect("time");

        assert!(in_time_window(monday_nine, time(9, 0), time(17, 0), None, 0));
        assert!(!in_time_window(monday_five, time(9, 0), time(17, 0), None, 0));
        assert!(!in_time_window(
            monday_nine,
            time(9, 0),
            time(17, 0),
            Some(&[Weekday::Sat, Weekday::Sun]),
            0
        ));
    }

    #[test]
    fn time_window_applies_utc_offset() {
        let utc_noon = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).single().expect("time");
        // UTC-05:00 makes it 07:00 local.
        assert!(!in_time_window(utc_noon, time(9, 0), time(17, 0), None, -300));
        assert!(in_time_window(utc_noon, time(6, 0), time(8, 0), None, -300));
    }

    #[test]
    fn overnight_window_never_matches() {
        let late = Utc.with_ymd_and_hms(2026, 1, 5, 23, 30, 0).single().expect("time");
        let early = Utc.with_ymd_and_hms(2026, 1, 6, 1, 0, 0).single().expect("time");
        assert!(!in_time_window(late, time(22, 0), time(6, 0), None, 0));
        assert!(!in_time_window(early, time(22, 0), time(6, 0), None, 0));
    }
}
