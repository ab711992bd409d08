//! A small reference rule evaluator.
//!
//! Production deployments plug in their host platform's logic engine via
//! the [`RuleEvaluator`] trait; this one covers the common trigger shape:
//! `[field] = 'value'` terms (optionally `[event][field]`) joined by `and`.

use async_trait::async_trait;
use ema_core::error::{EmaError, Result};
use ema_core::project::{ProjectContext, RecordSnapshot};
use ema_core::traits::{RecordStore, RuleEvaluator};
use std::sync::Arc;

pub struct SimpleRuleEvaluator {
    records: Arc<dyn RecordStore>,
    project: ProjectContext,
}

impl SimpleRuleEvaluator {
    pub fn new(records: Arc<dyn RecordStore>, project: ProjectContext) -> Self {
        Self { records, project }
    }

    fn eval_term(&self, snapshot: &RecordSnapshot, term: &str) -> Result<bool> {
        let (lhs, rhs) = term
            .split_once('=')
            .ok_or_else(|| EmaError::Rule(format!("unsupported rule term '{term}'")))?;
        let expected = rhs.trim().trim_matches('\'').trim_matches('"');

        // [event][field] or [field]
        let refs: Vec<&str> = lhs
            .split(['[', ']'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let (event_id, field) = match refs.as_slice() {
            [field] => (self.project.default_event()?, *field),
            [event, field] => {
                let event_id = self
                    .project
                    .resolve_event_id(&ema_core::EventRef::parse(event))?;
                (event_id, *field)
            }
            _ => return Err(EmaError::Rule(format!("unsupported rule term '{term}'"))),
        };

        let actual = snapshot
            .get(&event_id)
            .and_then(|fields| fields.get(field))
            .map(String::as_str)
            .unwrap_or("");
        Ok(actual == expected)
    }

    fn eval(&self, snapshot: &RecordSnapshot, rule: &str) -> Result<bool> {
        for term in rule.split(" and ") {
            if !self.eval_term(snapshot, term.trim())? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl RuleEvaluator for SimpleRuleEvaluator {
    async fn evaluate(&self, rule: &str, project_id: u64, record: &str) -> Result<bool> {
        if rule.trim().is_empty() {
            return Ok(true);
        }
        let snapshot = self.records.record_snapshot(project_id, record, &[]).await?;
        self.eval(&snapshot, rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    fn evaluator(store: Arc<MemoryStore>) -> SimpleRuleEvaluator {
        SimpleRuleEvaluator::new(store, ProjectContext::default())
    }

    #[tokio::test]
    async fn test_single_term() {
        let store = Arc::new(MemoryStore::new());
        store.set_field("1001", 1, "consented", "1");
        let rules = evaluator(store);
        assert!(rules.evaluate("[consented] = '1'", 0, "1001").await.unwrap());
        assert!(!rules.evaluate("[consented] = '0'", 0, "1001").await.unwrap());
    }

    #[tokio::test]
    async fn test_conjunction() {
        let store = Arc::new(MemoryStore::new());
        store.set_field("1001", 1, "consented", "1");
        store.set_field("1001", 1, "enrolled", "yes");
        let rules = evaluator(store);
        assert!(
            rules
                .evaluate("[consented] = '1' and [enrolled] = 'yes'", 0, "1001")
                .await
                .unwrap()
        );
        assert!(
            !rules
                .evaluate("[consented] = '1' and [enrolled] = 'no'", 0, "1001")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_rule_passes() {
        let store = Arc::new(MemoryStore::new());
        let rules = evaluator(store);
        assert!(rules.evaluate("  ", 0, "1001").await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_term_errors() {
        let store = Arc::new(MemoryStore::new());
        let rules = evaluator(store);
        assert!(rules.evaluate("[consented] > 1", 0, "1001").await.is_err());
    }
}
