//! Client-side view of the server's filter rules.

use crate::error::{Result, StreamError};
use crate::transport::{RawResponse, Transport};
use crate::types::{Rule, RuleId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Body of an add request: `{"add": [{"value": ...}]}`.
#[derive(Serialize)]
struct AddRequest<'a> {
    add: Vec<NewRule<'a>>,
}

#[derive(Serialize)]
struct NewRule<'a> {
    value: &'a str,
}

/// Body of a delete request: `{"delete": {"ids": [...]}}`.
#[derive(Serialize)]
struct DeleteRequest<'a> {
    delete: DeleteIds<'a>,
}

#[derive(Serialize)]
struct DeleteIds<'a> {
    ids: Vec<&'a RuleId>,
}

/// Response of the rule endpoint, for both listing and mutation.
#[derive(Debug, Default, Deserialize)]
struct RuleResponse {
    #[serde(default)]
    data: Vec<Rule>,
    #[serde(default)]
    meta: RuleMeta,
    /// Rules the server refused; a duplicate shows up here with its id.
    #[serde(default)]
    errors: Vec<RuleProblem>,
}

#[derive(Debug, Default, Deserialize)]
struct RuleMeta {
    #[serde(default)]
    summary: RuleSummary,
}

#[derive(Debug, Default, Deserialize)]
struct RuleSummary {
    #[serde(default)]
    created: u64,
    #[serde(default)]
    not_created: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RuleProblem {
    #[serde(default)]
    id: Option<RuleId>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

impl RuleResponse {
    fn parse(response: &RawResponse) -> Result<Self> {
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// The already-registered rule for `expression`, if the server refused to
    /// create it as a duplicate.
    fn duplicate_of(&self, expression: &str) -> Option<Rule> {
        if self.meta.summary.created == 1 {
            return None;
        }
        self.errors.iter().find_map(|problem| {
            let id = problem.id.clone()?;
            match problem.value.as_deref() {
                Some(value) if value == expression => Some(Rule::with_id(id, value)),
                _ => None,
            }
        })
    }
}

/// Creates, lists and deletes stream rules through a [`Transport`].
pub struct RuleRegistry {
    transport: Arc<dyn Transport>,
}

impl RuleRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// All rules currently registered upstream.
    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        let response = self.transport.get_rules()?;
        if !response.is_success() {
            return Err(StreamError::RuleListingFailed {
                status: response.status,
                body: response.body_text(),
            });
        }
        Ok(RuleResponse::parse(&response)?.data)
    }

    /// Register a rule for `expression`.
    ///
    /// Creation is idempotent: if the server already has a rule with this
    /// expression, that rule is returned instead of an error.
    pub fn create_rule(&self, expression: &str) -> Result<Rule> {
        let request = AddRequest {
            add: vec![NewRule { value: expression }],
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| StreamError::Serialization(e.to_string()))?;

        let response = self.transport.post_rules(&body)?;
        if !response.is_success() {
            return Err(StreamError::RuleCreationFailed {
                status: response.status,
                body: response.body_text(),
            });
        }

        let parsed = RuleResponse::parse(&response)?;
        if let Some(existing) = parsed.duplicate_of(expression) {
            debug!(rule = %existing, "rule already exists");
            return Ok(existing);
        }

        match parsed.data.into_iter().next() {
            Some(rule) if rule.is_registered() => {
                info!(rule = %rule, "created stream rule");
                Ok(rule)
            }
            _ if parsed.meta.summary.not_created > 0 => {
                let reason = parsed
                    .errors
                    .first()
                    .and_then(|p| p.title.clone())
                    .unwrap_or_else(|| "rule not created".to_string());
                warn!(expression, %reason, "server refused rule");
                Err(StreamError::RuleCreationFailed {
                    status: response.status,
                    body: response.body_text(),
                })
            }
            _ => Err(StreamError::MalformedResponse(format!(
                "no rule returned for expression {:?}",
                expression
            ))),
        }
    }

    /// Register a rule built from filter terms, see [`rule_expression`](super::rule_expression).
    pub fn create_rule_from_terms<I, S>(&self, terms: I) -> Result<Rule>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.create_rule(&super::rule_expression(terms))
    }

    /// Remove a single rule upstream.
    pub fn delete_rule(&self, rule: &Rule) -> Result<()> {
        self.delete_rules(std::slice::from_ref(rule))
    }

    /// Remove rules upstream by id.
    ///
    /// Rules that were never registered are skipped; if none is left, no
    /// request is made.
    pub fn delete_rules(&self, rules: &[Rule]) -> Result<()> {
        let ids: Vec<&RuleId> = rules.iter().filter_map(|r| r.id.as_ref()).collect();
        if ids.is_empty() {
            debug!("no registered rules to delete");
            return Ok(());
        }

        let request = DeleteRequest {
            delete: DeleteIds { ids },
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| StreamError::Serialization(e.to_string()))?;

        let response = self.transport.post_rules(&body)?;
        if !response.is_success() {
            return Err(StreamError::RuleDeletionFailed {
                status: response.status,
                body: response.body_text(),
            });
        }

        debug!(count = request.delete.ids.len(), "deleted stream rules");
        Ok(())
    }

    /// Delete an orphaned rule on a background thread.
    ///
    /// Failures are logged and never reported back.
    pub fn delete_in_background(self: &Arc<Self>, rule: Rule) {
        if !rule.is_registered() {
            debug!(rule = %rule, "orphaned rule was never registered, nothing to delete");
            return;
        }

        let registry = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("stream-rule-cleanup".to_string())
            .spawn(move || {
                info!(rule = %rule, "removing orphaned rule");
                if let Err(e) = registry.delete_rule(&rule) {
                    warn!(rule = %rule, error = %e, "failed to remove orphaned rule");
                }
            });

        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn rule cleanup thread");
        }
    }
}
