//! Core types for the filtered stream.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Server-assigned identifier of a filter rule.
///
/// The upstream API reports rule ids as JSON strings on some endpoints and as
/// integers on others. Both forms normalize to the same decimal string here, so
/// identity comparisons never depend on which endpoint produced the id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        RuleId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleId({})", self.0)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        RuleId(s.to_string())
    }
}

impl From<u64> for RuleId {
    fn from(n: u64) -> Self {
        RuleId(n.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRuleId {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl RawRuleId {
    fn normalize(self) -> String {
        match self {
            RawRuleId::Text(s) => s,
            RawRuleId::Unsigned(n) => n.to_string(),
            RawRuleId::Signed(n) => n.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for RuleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(RuleId(RawRuleId::deserialize(deserializer)?.normalize()))
    }
}

/// An empty id string means "not assigned yet".
fn deserialize_optional_rule_id<'de, D>(deserializer: D) -> Result<Option<RuleId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawRuleId>::deserialize(deserializer)?;
    Ok(raw
        .map(RawRuleId::normalize)
        .filter(|s| !s.is_empty())
        .map(RuleId))
}

/// A server-side filter rule.
///
/// Rules built locally have no id until the server assigns one. A rule
/// without an id never matches stream output.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_rule_id"
    )]
    pub id: Option<RuleId>,

    /// The filter expression, e.g. `cats has:images`.
    #[serde(rename = "value")]
    pub expression: String,
}

impl Rule {
    /// A rule that has not been registered upstream yet.
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            id: None,
            expression: expression.into(),
        }
    }

    /// A rule as reported by the server.
    pub fn with_id(id: impl Into<RuleId>, expression: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            expression: expression.into(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} ({})", self.expression, id),
            None => write!(f, "{} (unregistered)", self.expression),
        }
    }
}

/// Author of a post.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub handle: String,
    pub picture: String,
    pub verified: bool,
    pub id: String,
}

/// One possible answer of a poll.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub position: u32,
    pub label: String,
    pub votes: u64,
}

/// A decoded post from the stream, enriched with author, media and poll data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub text: String,
    pub author: Author,
    pub created: String,
    pub images: Vec<String>,
    pub retweets: u64,
    pub replies: u64,
    pub likes: u64,
    pub quotes: u64,

    /// Rules the server reports as matched for this post.
    #[serde(rename = "ruleIds", default)]
    pub rule_ids: Vec<RuleId>,

    #[serde(rename = "hasVideo")]
    pub has_video: bool,

    #[serde(rename = "videoPreviewURL", default, skip_serializing_if = "Option::is_none")]
    pub video_preview_url: Option<String>,

    pub sensitive: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poll: Vec<PollOption>,
}

impl Event {
    /// Whether the server tagged this event with the given rule.
    pub fn matches(&self, rule_id: &RuleId) -> bool {
        self.rule_ids.iter().any(|id| id == rule_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_id_normalizes_numbers_and_strings() {
        let from_int: RuleId = serde_json::from_str("1234567890123").unwrap();
        let from_str: RuleId = serde_json::from_str("\"1234567890123\"").unwrap();
        assert_eq!(from_int, from_str);
        assert_eq!(from_int.as_str(), "1234567890123");
    }

    #[test]
    fn test_rule_empty_id_is_unassigned() {
        let rule: Rule = serde_json::from_str(r#"{"id": "", "value": "cats"}"#).unwrap();
        assert_eq!(rule.id, None);
        assert!(!rule.is_registered());

        let rule: Rule = serde_json::from_str(r#"{"value": "cats"}"#).unwrap();
        assert_eq!(rule, Rule::new("cats"));
    }

    #[test]
    fn test_unregistered_rule_serializes_without_id() {
        let json = serde_json::to_value(Rule::new("dogs -is:retweet")).unwrap();
        assert_eq!(json, serde_json::json!({"value": "dogs -is:retweet"}));
    }

    #[test]
    fn test_event_matches() {
        let event = Event {
            rule_ids: vec![RuleId::from(1u64), RuleId::from("3")],
            ..Default::default()
        };
        assert!(event.matches(&RuleId::from("1")));
        assert!(!event.matches(&RuleId::from("2")));
        assert!(event.matches(&RuleId::from(3u64)));
    }
}
