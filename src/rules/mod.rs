//! Server-side filter rules.
//!
//! A rule is a filter expression registered with the stream endpoint. The
//! server tags every streamed post with the ids of the rules it matched,
//! which is what subscriptions are keyed on.

mod registry;

pub use registry::RuleRegistry;

/// Only match posts that have an image attached.
pub const IMAGE_FILTER: &str = "has:images";

/// Exclude retweets.
pub const EXCLUDE_RETWEETS_FILTER: &str = "-is:retweet";

/// Join filter terms into a rule expression.
///
/// Every term is written after a single space, as given; nothing is quoted,
/// escaped or trimmed. The server ignores the leading space.
pub fn rule_expression<I, S>(terms: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut expression = String::new();
    for term in terms {
        expression.push(' ');
        expression.push_str(term.as_ref());
    }
    expression
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_expression_joins_with_spaces() {
        assert_eq!(
            rule_expression(["cats", IMAGE_FILTER, EXCLUDE_RETWEETS_FILTER]),
            " cats has:images -is:retweet"
        );
        assert_eq!(rule_expression(["\"exact phrase\"", "#tag"]), " \"exact phrase\" #tag");
        assert_eq!(rule_expression(Vec::<String>::new()), "");
    }

    #[test]
    fn test_rule_expression_keeps_empty_terms() {
        assert_eq!(rule_expression(["", "x"]), "  x");
        assert_eq!(rule_expression(["x", ""]), " x ");
    }
}
