//! Invariant and boundary properties over the public surface.

use engram_e2e_tests::{fresh_store, fresh_store_with, put, DIM};

use engram_core::{
    Config, ContentHash, Embedder, Filter, HashingEmbedder, OpCtx, StoreInput, TagMode,
};

#[test]
fn content_hash_is_sha256_of_nfc_content() {
    let (store, _dir) = fresh_store();
    let hash = put(&store, "alpha beta", &[]);
    assert_eq!(hash, ContentHash::of_content("alpha beta").to_hex());
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn hash_hex_round_trip() {
    let hash = ContentHash::of_content("round trip subject");
    let decoded = ContentHash::from_hex(&hash.to_hex()).unwrap();
    assert_eq!(hash, decoded);
}

#[test]
fn nfc_nfd_forms_stored_once() {
    let (store, _dir) = fresh_store();
    let nfc = put(&store, "entrée caf\u{00e9}", &[]);
    let nfd = put(&store, "entre\u{0301}e cafe\u{0301}", &[]);
    assert_eq!(nfc, nfd);
    assert_eq!(store.stats().unwrap().live_memories, 1);
}

#[test]
fn delete_removes_memory_and_embedding() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let hash = put(&store, "to be deleted", &["gone"]);

    assert!(store.delete(&hash, &ctx).unwrap());
    assert_eq!(store.get_by_hash(&hash, true, &ctx).unwrap_err().kind(), "not_found");

    // Semantic search no longer surfaces it.
    let results = store
        .retrieve("to be deleted", 5, 0.0, &Filter::default(), &ctx)
        .unwrap();
    assert!(results.is_empty());

    // Tag index parity: the tag returns nothing.
    let err = store
        .search_by_tag(&["gone".to_string()], TagMode::Any, &Filter::default(), &ctx)
        .unwrap();
    assert!(err.is_empty());
}

#[test]
fn knn_top_one_is_the_stored_memory() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();

    // A non-degenerate store with several distinct topics.
    put(&store, "rust borrow checker lifetimes guide", &[]);
    put(&store, "sourdough starter hydration schedule", &[]);
    put(&store, "kubernetes liveness probe configuration", &[]);
    let target = put(
        &store,
        "quarterly revenue forecast for the emea region",
        &[],
    );

    let results = store
        .retrieve(
            "quarterly revenue forecast for the emea region",
            1,
            0.0,
            &Filter::default(),
            &ctx,
        )
        .unwrap();
    assert_eq!(results[0].memory.content_hash, target);
}

#[test]
fn tag_index_parity_and_subset() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();

    let both = put(&store, "carries both", &["p", "q"]);
    let only_p = put(&store, "carries p", &["p"]);

    // Parity: membership in search_by_tag(ANY) iff the tag is carried.
    for (hash, tag, expected) in [
        (&both, "p", true),
        (&both, "q", true),
        (&only_p, "p", true),
        (&only_p, "q", false),
    ] {
        let hits = store
            .search_by_tag(&[tag.to_string()], TagMode::Any, &Filter::default(), &ctx)
            .unwrap();
        assert_eq!(hits.iter().any(|m| &m.content_hash == hash), expected);
    }

    // ALL ⊆ ANY.
    let tags = vec!["p".to_string(), "q".to_string()];
    let all = store
        .search_by_tag(&tags, TagMode::All, &Filter::default(), &ctx)
        .unwrap();
    let any = store
        .search_by_tag(&tags, TagMode::Any, &Filter::default(), &ctx)
        .unwrap();
    assert!(all.iter().all(|m| any.iter().any(|n| n.content_hash == m.content_hash)));
    assert_eq!(all.len(), 1);
    assert_eq!(any.len(), 2);
}

#[test]
fn store_with_tags_found_by_all_mode() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let hash = put(&store, "tagged pair", &["a", "b"]);
    let hits = store
        .search_by_tag(
            &["a".to_string(), "b".to_string()],
            TagMode::All,
            &Filter::default(),
            &ctx,
        )
        .unwrap();
    assert!(hits.iter().any(|m| m.content_hash == hash));
}

#[test]
fn empty_store_boundaries() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();

    let embedder = HashingEmbedder::new(DIM);
    let query = embedder.embed("anything at all").unwrap();
    assert!(store.knn(&query, 5, 0.0, &Filter::default(), &ctx).unwrap().is_empty());

    let stats = store.stats().unwrap();
    assert_eq!(stats.live_memories, 0);
    assert_eq!(stats.archived_memories, 0);
    assert_eq!(stats.distinct_tags, 0);
}

#[test]
fn tag_length_boundaries() {
    let config = Config::default();
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();

    let at_limit = "t".repeat(config.max_tag_len);
    store
        .store(
            StoreInput {
                content: "boundary tag".to_string(),
                tags: vec![at_limit],
                ..Default::default()
            },
            &ctx,
        )
        .unwrap();

    let over_limit = "t".repeat(config.max_tag_len + 1);
    let err = store
        .store(
            StoreInput {
                content: "overflow tag".to_string(),
                tags: vec![over_limit],
                ..Default::default()
            },
            &ctx,
        )
        .unwrap_err();
    assert_eq!(err.kind(), "invalid");
}

#[test]
fn k_clamped_not_rejected() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    put(&store, "single entry", &[]);

    let results = store
        .retrieve("single entry", 1_000_000, 0.0, &Filter::default(), &ctx)
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[test]
fn no_operation_shrinks_live_set_except_deletes() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();

    put(&store, "survivor one", &["keep"]);
    put(&store, "survivor two", &["keep"]);
    let before = store.stats().unwrap().live_memories;

    // A read, an update, a failed store, a health check.
    let _ = store.retrieve("survivor", 10, 0.0, &Filter::default(), &ctx);
    let _ = store.store(
        StoreInput {
            content: "   ".to_string(),
            ..Default::default()
        },
        &ctx,
    );
    store.health_check(true).unwrap();

    assert_eq!(store.stats().unwrap().live_memories, before);

    // Deletes do shrink it.
    store
        .delete_by_tags(&["keep".to_string()], TagMode::Any, &ctx)
        .unwrap();
    assert_eq!(store.stats().unwrap().live_memories, 0);
}

#[test]
fn timestamps_are_ordered() {
    let (store, _dir) = fresh_store();
    let ctx = OpCtx::new();
    let hash = put(&store, "timestamp subject", &[]);

    let memory = store.get_by_hash(&hash, false, &ctx).unwrap();
    assert!(memory.created_at <= memory.updated_at);
    assert!(memory.updated_at <= memory.last_accessed_at);

    let updated = store
        .update(
            &hash,
            engram_core::UpdateInput {
                add_tags: vec!["later".to_string()],
                ..Default::default()
            },
            &ctx,
        )
        .unwrap();
    assert!(updated.created_at <= updated.updated_at);
    assert!(updated.updated_at <= updated.last_accessed_at);
}

#[test]
fn strict_health_blocks_writes_until_repair() {
    let (store, dir) = fresh_store_with(Config {
        strict_health: true,
        ..Config::default()
    });
    let ctx = OpCtx::new();
    put(&store, "will lose vector", &[]);

    // Corrupt through a separate raw connection, then re-check.
    {
        let conn = rusqlite::Connection::open(dir.path().join("memory.db")).unwrap();
        conn.execute("DELETE FROM embeddings", []).unwrap();
    }
    let report = store.health_check(false).unwrap();
    assert!(!report.ok);

    let err = store
        .store(
            StoreInput {
                content: "rejected while unhealthy".to_string(),
                ..Default::default()
            },
            &ctx,
        )
        .unwrap_err();
    assert_eq!(err.kind(), "corruption");

    // Repair unblocks writes.
    let report = store.health_check(true).unwrap();
    assert!(report.ok);
    store
        .store(
            StoreInput {
                content: "accepted after repair".to_string(),
                ..Default::default()
            },
            &ctx,
        )
        .unwrap();
}
