//! End-to-end scenarios over the public surface.

use engram_e2e_tests::{at, backdate, force_decay_state, fresh_store, put};

use engram_core::{
    ConsolidationEngine, Filter, Horizon, MetaValue, OpCtx, RecallTarget, StoreInput,
    TagMode,
};
use std::sync::Arc;

#[test]
fn dedup_and_tag_merge() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();

    let first = store
        .store(
            StoreInput {
                content: "alpha beta".to_string(),
                tags: vec!["x".to_string()],
                ..Default::default()
            },
            &ctx,
        )
        .unwrap();
    assert!(!first.duplicate);

    let second = store
        .store(
            StoreInput {
                content: "alpha beta".to_string(),
                tags: vec!["y".to_string()],
                ..Default::default()
            },
            &ctx,
        )
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(first.content_hash, second.content_hash);

    let memory = store.get_by_hash(&first.content_hash, false, &ctx).unwrap();
    assert_eq!(memory.tags, vec!["x".to_string(), "y".to_string()]);
}

#[test]
fn recall_with_time_phrase() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let now = at("2025-02-10T12:00:00Z");

    let hash = put(&store, "db decision", &["decision"]);
    backdate(&store, &hash, at("2025-02-05T09:00:00Z"));

    let results = store
        .recall(
            "decisions last week",
            10,
            &Filter::default(),
            RecallTarget::Created,
            Some(now),
            &ctx,
        )
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].memory.content_hash, hash);

    let err = store
        .recall(
            "decisions tomorrow",
            10,
            &Filter::default(),
            RecallTarget::Created,
            Some(now),
            &ctx,
        )
        .unwrap_err();
    assert_eq!(err.kind(), "invalid");
}

#[test]
fn compound_phrase_union_ordering() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let now = at("2025-02-10T12:00:00Z");

    let a = put(&store, "A", &[]);
    backdate(&store, &a, at("2025-02-03T08:00:00Z"));
    let b = put(&store, "B", &[]);
    backdate(&store, &b, at("2024-12-15T08:00:00Z"));

    let results = store
        .recall(
            "last week and December 2024",
            10,
            &Filter::default(),
            RecallTarget::Created,
            Some(now),
            &ctx,
        )
        .unwrap();
    assert_eq!(results.len(), 2);
    // created_at descending: A (February) before B (December).
    assert_eq!(results[0].memory.content_hash, a);
    assert_eq!(results[1].memory.content_hash, b);
}

#[test]
fn consolidation_daily_idempotent_over_quiescent_store() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let engine = ConsolidationEngine::new(store.clone(), None);

    for i in 0..100 {
        put(&store, &format!("consolidation subject {i}"), &[]);
    }

    // Reference instant after the stores so every age is positive.
    let now = chrono::Utc::now() + chrono::Duration::days(5);

    engine.run_pass(Horizon::Daily, now, &ctx).unwrap();
    let first_scores: Vec<(String, f64)> = store
        .scan(Filter::default(), 200)
        .map(|p| p.unwrap())
        .flatten()
        .map(|m| (m.content_hash, m.relevance_score))
        .collect();

    let outcome = engine.run_pass(Horizon::Daily, now, &ctx).unwrap();
    assert_eq!(outcome.counts["updated"], 0, "second pass changed scores");

    let second_scores: Vec<(String, f64)> = store
        .scan(Filter::default(), 200)
        .map(|p| p.unwrap())
        .flatten()
        .map(|m| (m.content_hash, m.relevance_score))
        .collect();
    assert_eq!(first_scores, second_scores);

    // Weekly pass twice: second run discovers nothing new.
    engine.run_pass(Horizon::Weekly, now, &ctx).unwrap();
    let second = engine.run_pass(Horizon::Weekly, now, &ctx).unwrap();
    assert_eq!(second.counts["inserted"], 0);
}

#[test]
fn archival_preserves_originals() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let engine = ConsolidationEngine::new(store.clone(), None);

    let hash = store
        .store(
            StoreInput {
                content: "ephemeral scratchpad idea".to_string(),
                tags: vec!["scratch".to_string()],
                metadata: [(
                    "retention_class".to_string(),
                    MetaValue::String("temporary".to_string()),
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            },
            &ctx,
        )
        .unwrap()
        .content_hash;

    // 120 days stale, relevance 0.05: archival-eligible.
    force_decay_state(
        &store,
        &hash,
        0.05,
        chrono::Utc::now() - chrono::Duration::days(120),
    );

    engine.run_pass(Horizon::Quarterly, chrono::Utc::now(), &ctx).unwrap();

    // Excluded from default queries.
    assert_eq!(
        store.get_by_hash(&hash, false, &ctx).unwrap_err().kind(),
        "not_found"
    );

    // Fully preserved under include_archived, vector and all.
    let archived = store.get_by_hash(&hash, true, &ctx).unwrap();
    assert!(archived.archived);
    assert_eq!(archived.content, "ephemeral scratchpad idea");
    assert_eq!(archived.tags, vec!["scratch".to_string()]);
    assert_eq!(
        archived.metadata.get("retention_class"),
        Some(&MetaValue::String("temporary".to_string()))
    );

    // Reversible.
    let restored = store.unarchive(&hash, &ctx).unwrap();
    assert!(!restored.archived);
}

#[test]
fn compression_pipeline_produces_summary() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let engine = ConsolidationEngine::new(store.clone(), None);

    for i in 0..10 {
        put(
            &store,
            &format!("incident review: api gateway 502 spike case {i}"),
            &["incident"],
        );
    }

    engine.run_pass(Horizon::Monthly, chrono::Utc::now(), &ctx).unwrap();

    let summaries = store
        .search_by_tag(
            &["consolidated".to_string()],
            TagMode::Any,
            &Filter::default(),
            &ctx,
        )
        .unwrap();
    assert!(!summaries.is_empty(), "monthly pass should compress the cluster");

    let summary = &summaries[0];
    let parents = summary.consolidated_from();
    assert!(parents.len() >= 5);
    // Every parent still exists (invariant: compression preserves originals).
    for parent in &parents {
        assert!(store.get_by_hash(parent, true, &ctx).is_ok());
    }
}

#[test]
fn events_flow_for_store_and_consolidation() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let engine = Arc::new(ConsolidationEngine::new(store.clone(), None));
    let mut rx = store.events().subscribe();

    put(&store, "event producer", &[]);
    engine.run_pass(Horizon::Daily, chrono::Utc::now(), &ctx).unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
    }
    assert!(kinds.contains(&"created".to_string()));
    assert!(kinds.contains(&"consolidationRun".to_string()));
}
