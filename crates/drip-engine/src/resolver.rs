//! Audience resolution: send spec -> deduplicated set of contact ids.
//!
//! Suppressed, unsubscribed and bounced contacts are excluded
//! unconditionally, whatever the rules say. Resolution failures abort
//! the whole send before a single ledger row exists; an audience that
//! merely comes up empty is signalled distinctly.

use std::collections::BTreeSet;
use std::sync::Arc;

use drip_core::{ContactStatus, SendSpec, evaluate};
use drip_db::DripDb;

use crate::error::{EngineError, Result};

pub struct AudienceResolver {
    db: Arc<DripDb>,
}

impl AudienceResolver {
    pub fn new(db: Arc<DripDb>) -> Self {
        Self { db }
    }

    pub async fn resolve(&self, spec: &SendSpec) -> Result<Vec<i64>> {
        if spec.is_empty() {
            return Err(EngineError::EmptySendSpec);
        }

        let now = chrono::Utc::now().timestamp();
        let mut audience = BTreeSet::new();

        if spec.send_to_all {
            for contact in self.db.list_active_contacts().await? {
                audience.insert(contact.id);
            }
        } else {
            if !spec.contact_ids.is_empty() {
                for contact in self.db.get_contacts_by_ids(&spec.contact_ids).await? {
                    if contact.status() == ContactStatus::Active {
                        audience.insert(contact.id);
                    }
                }
            }

            if !spec.segment_ids.is_empty() {
                // Load each tree once, then sweep the active candidates.
                let mut trees = Vec::with_capacity(spec.segment_ids.len());
                for &segment_id in &spec.segment_ids {
                    let segment = self.db.get_segment(segment_id).await?;
                    let tree = segment.tree().map_err(|source| EngineError::SegmentInvalid {
                        id: segment_id,
                        source,
                    })?;
                    trees.push(tree);
                }

                let candidates = self.db.list_active_contacts().await?;
                for contact in &candidates {
                    let snapshot = contact.snapshot(now);
                    if trees.iter().any(|tree| evaluate(tree, &snapshot)) {
                        audience.insert(contact.id);
                    }
                }
            }
        }

        if audience.is_empty() {
            return Err(EngineError::EmptyAudience);
        }
        Ok(audience.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_core::{Combinator, ConditionNode};
    use drip_db::NewContact;
    use serde_json::json;

    async fn db() -> Arc<DripDb> {
        Arc::new(DripDb::in_memory().await.unwrap())
    }

    async fn add_contact(db: &DripDb, email: &str, status: ContactStatus, spent: f64, orders: i64) -> i64 {
        db.insert_contact(&NewContact {
            email: Some(email.into()),
            status: Some(status),
            total_spent: spent,
            total_orders: orders,
            ..NewContact::default()
        })
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn send_to_all_returns_exactly_the_active_contacts() {
        let db = db().await;
        let mut active = Vec::new();
        for i in 0..4 {
            active.push(add_contact(&db, &format!("a{i}@x.com"), ContactStatus::Active, 0.0, 0).await);
        }
        add_contact(&db, "u@x.com", ContactStatus::Unsubscribed, 0.0, 0).await;
        add_contact(&db, "s@x.com", ContactStatus::Suppressed, 0.0, 0).await;
        add_contact(&db, "b@x.com", ContactStatus::Bounced, 0.0, 0).await;

        let resolver = AudienceResolver::new(db);
        let audience = resolver.resolve(&SendSpec::to_all()).await.unwrap();
        assert_eq!(audience, active);
    }

    #[tokio::test]
    async fn explicit_ids_drop_ineligible_contacts() {
        let db = db().await;
        let a = add_contact(&db, "a@x.com", ContactStatus::Active, 0.0, 0).await;
        let u = add_contact(&db, "u@x.com", ContactStatus::Unsubscribed, 0.0, 0).await;

        let resolver = AudienceResolver::new(db);
        let audience = resolver
            .resolve(&SendSpec::to_contacts(vec![a, u]))
            .await
            .unwrap();
        assert_eq!(audience, vec![a]);
    }

    #[tokio::test]
    async fn segment_rules_select_matching_actives_only() {
        let db = db().await;
        // spent > 1000 AND orders > 3
        let tree = ConditionNode::Group {
            operator: Combinator::And,
            rules: vec![
                ConditionNode::Rule {
                    field: "total_spent".into(),
                    operator: "greater_than".into(),
                    value: json!(1000),
                },
                ConditionNode::Rule {
                    field: "total_orders".into(),
                    operator: "greater_than".into(),
                    value: json!(3),
                },
            ],
        };
        let segment = db.insert_segment("loyal", &tree, false).await.unwrap();

        let a = add_contact(&db, "a@x.com", ContactStatus::Active, 1200.0, 4).await;
        let _b = add_contact(&db, "b@x.com", ContactStatus::Active, 1200.0, 2).await;
        // Would match, but not active.
        add_contact(&db, "c@x.com", ContactStatus::Bounced, 5000.0, 9).await;

        let resolver = AudienceResolver::new(db);
        let audience = resolver
            .resolve(&SendSpec::to_segments(vec![segment.id]))
            .await
            .unwrap();
        assert_eq!(audience, vec![a]);
    }

    #[tokio::test]
    async fn overlapping_sources_deduplicate() {
        let db = db().await;
        let tree = ConditionNode::Rule {
            field: "total_spent".into(),
            operator: "greater_or_equal".into(),
            value: json!(0),
        };
        let segment = db.insert_segment("everyone", &tree, false).await.unwrap();
        let a = add_contact(&db, "a@x.com", ContactStatus::Active, 10.0, 1).await;
        let b = add_contact(&db, "b@x.com", ContactStatus::Active, 20.0, 1).await;

        let resolver = AudienceResolver::new(db);
        let spec = SendSpec {
            contact_ids: vec![a, a, b],
            segment_ids: vec![segment.id],
            ..SendSpec::default()
        };
        let audience = resolver.resolve(&spec).await.unwrap();
        assert_eq!(audience, vec![a, b]);
    }

    #[tokio::test]
    async fn empty_results_are_distinct_from_errors() {
        let db = db().await;
        add_contact(&db, "u@x.com", ContactStatus::Unsubscribed, 0.0, 0).await;
        let resolver = AudienceResolver::new(db.clone());

        // Nobody eligible: distinct signal.
        let err = resolver
            .resolve(&SendSpec::to_all())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyAudience));

        // Nothing requested at all: a malformed request, not an empty one.
        let err = resolver.resolve(&SendSpec::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptySendSpec));

        // Unknown segment: a resolver error, surfaced before any job.
        let err = resolver
            .resolve(&SendSpec::to_segments(vec![999]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Db(_)));
    }
}
