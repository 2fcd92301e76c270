//! End-to-end finalize scenarios through the gate.

use canon_core::testing::{assert_level, fact_draft, JudgeReply, ScriptedJudge, TestEngine};
use canon_core::{
    Assertion, Atomicity, BatchLedger, BatchResult, CanonError, CanonLevel, DerivedIndex,
    EngineConfig, ExclusiveKeeper, FactId, GuardedGate, JudgeError, OpenAccess, PartitionKey,
    Principal, ProposalDraft, ProposalStatus, ProvenanceLedger, RetconChain, RetryPolicy, ScopeId,
};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_gm_low_confidence_accepted_with_provenance() {
    let engine = TestEngine::new();
    let id = engine
        .submit(fact_draft("scene-1", "gm", 0.5, "Old Mill", "burned down last winter"))
        .await
        .unwrap();

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 1);
    assert!(result.rejected_proposal_ids.is_empty());

    let fact_id = result.accepted_fact_ids[0];
    assert_level(&engine, fact_id, CanonLevel::Canon).await;

    let proposal = engine.proposals.get(id).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Accepted);
    assert_eq!(proposal.canonical_fact, Some(fact_id));

    let edges = ProvenanceLedger::new(engine.canon.clone())
        .evidence_for(fact_id)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].evidence.to_string(), "document:transcript:scene-1");
}

#[tokio::test]
async fn test_uncertain_player_claim_goes_to_judge() {
    let judge = Arc::new(ScriptedJudge::new(JudgeReply::Reject));
    let engine = TestEngine::new().with_judge(judge.clone());
    let id = engine
        .submit(fact_draft("scene-1", "player", 0.6, "Mira", "is secretly a dragon"))
        .await
        .unwrap();

    let result = engine.finalize("scene-1").await.unwrap();
    assert!(result.accepted_fact_ids.is_empty());
    assert_eq!(result.rejected_proposal_ids, vec![id]);
    assert_eq!(judge.calls(), 1);

    let proposal = engine.proposals.get(id).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Rejected);
    assert!(proposal.canonical_fact.is_none());
    assert_eq!(engine.fact_count().await, 0);
}

#[tokio::test]
async fn test_deferred_without_judge_is_rejected() {
    let engine = TestEngine::new();
    let id = engine
        .submit(fact_draft("scene-1", "system", 1.0, "Mira", "levelled up"))
        .await
        .unwrap();

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.rejected_proposal_ids, vec![id]);
}

#[tokio::test]
async fn test_two_accepted_one_rejected() {
    let judge = Arc::new(ScriptedJudge::new(JudgeReply::Reject));
    let engine = TestEngine::new().with_judge(judge.clone());

    let gm = engine
        .submit(fact_draft("scene-2", "gm", 0.5, "Riverside", "is flooded"))
        .await
        .unwrap();
    let confident = engine
        .submit(fact_draft("scene-2", "player", 0.9, "Mira", "owes the guild 40 gold"))
        .await
        .unwrap();
    let doubtful = engine
        .submit(fact_draft("scene-2", "player", 0.3, "Mira", "is royalty"))
        .await
        .unwrap();

    let result = engine.finalize("scene-2").await.unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 2);
    assert_eq!(result.rejected_proposal_ids, vec![doubtful]);
    assert_eq!(judge.calls(), 1);
    assert_eq!(engine.fact_count().await, 2);

    for (proposal, fact) in [gm, confident].into_iter().zip(&result.accepted_fact_ids) {
        let p = engine.proposals.get(proposal).await.unwrap();
        assert_eq!(p.canonical_fact, Some(*fact));
    }
    assert!(engine
        .proposals
        .pending_for(&ScopeId::new("scene-2"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_source_record_is_authoritative_and_never_retconned() {
    let engine = TestEngine::new();
    engine
        .submit(fact_draft("lore", "source", 0.95, "Waterdeep", "is the City of Splendors"))
        .await
        .unwrap();
    let lore = engine.finalize("lore").await.unwrap();
    let source_fact = lore.accepted_fact_ids[0];
    assert_level(&engine, source_fact, CanonLevel::Authoritative).await;

    let challenger = engine
        .submit(
            fact_draft("scene-3", "gm", 1.0, "Waterdeep", "is a ruin").superseding(source_fact),
        )
        .await
        .unwrap();
    let err = engine.finalize("scene-3").await.unwrap_err();
    assert!(matches!(err, CanonError::BatchAborted { .. }));
    assert!(matches!(err.root(), CanonError::Validation { .. }));

    assert_level(&engine, source_fact, CanonLevel::Authoritative).await;
    assert!(engine.proposals.get(challenger).await.unwrap().is_pending());
    assert!(engine
        .ledger
        .get(&ScopeId::new("scene-3"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_supersession_retcons_the_old_fact() {
    let engine = TestEngine::new();
    engine
        .submit(
            ProposalDraft::new(
                "scene-1",
                "gm",
                Assertion::StateTransition {
                    entity: "Gate".into(),
                    attribute: "status".into(),
                    from: None,
                    to: "closed".into(),
                },
            )
            .citing("transcript:scene-1"),
        )
        .await
        .unwrap();
    let first = engine.finalize("scene-1").await.unwrap().accepted_fact_ids[0];

    engine
        .submit(
            ProposalDraft::new(
                "scene-2",
                "gm",
                Assertion::StateTransition {
                    entity: "Gate".into(),
                    attribute: "status".into(),
                    from: Some("closed".into()),
                    to: "open".into(),
                },
            )
            .citing("transcript:scene-2")
            .superseding(first),
        )
        .await
        .unwrap();
    let second = engine.finalize("scene-2").await.unwrap().accepted_fact_ids[0];

    assert_level(&engine, first, CanonLevel::Retconned).await;
    assert_level(&engine, second, CanonLevel::Canon).await;

    let chain = RetconChain::new(engine.canon.clone());
    assert_eq!(chain.current(first).await.unwrap().id, second);
    let history: Vec<_> = chain.history_of(second).try_collect().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!((history[0].old_fact, history[0].new_fact), (first, second));

    let stale = engine.index.stale_partitions().await.unwrap();
    assert!(stale.contains(&PartitionKey::for_entity("Gate")));
}

#[tokio::test]
async fn test_one_fact_superseded_twice_in_a_batch() {
    let engine = TestEngine::new();
    engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Gate", "is closed"))
        .await
        .unwrap();
    let old = engine.finalize("scene-1").await.unwrap().accepted_fact_ids[0];

    for statement in ["is open", "is broken"] {
        engine
            .submit(fact_draft("scene-2", "gm", 1.0, "Gate", statement).superseding(old))
            .await
            .unwrap();
    }
    let err = engine.finalize("scene-2").await.unwrap_err();
    assert!(matches!(err.root(), CanonError::Validation { .. }));
    assert_level(&engine, old, CanonLevel::Canon).await;
    assert_eq!(engine.fact_count().await, 1);
}

#[tokio::test]
async fn test_superseding_unknown_fact() {
    let engine = TestEngine::new();
    engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Gate", "is open").superseding(FactId::new()))
        .await
        .unwrap();
    let err = engine.finalize("scene-1").await.unwrap_err();
    assert!(matches!(err.root(), CanonError::NotFound { .. }));
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let engine = TestEngine::new();
    engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();

    let first = engine.finalize("scene-1").await.unwrap();
    let second = engine.finalize("scene-1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.canon.writes(), 1);

    // Late proposals do not reopen a finalized scope.
    let late = engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "left town"))
        .await
        .unwrap();
    assert_eq!(engine.finalize("scene-1").await.unwrap(), first);
    assert!(engine.proposals.get(late).await.unwrap().is_pending());
    assert_eq!(engine.fact_count().await, 1);
}

#[tokio::test]
async fn test_empty_scope() {
    let engine = TestEngine::new();
    let err = engine.finalize("quiet-scene").await.unwrap_err();
    assert!(matches!(err, CanonError::EmptyBatch(ref s) if s.as_str() == "quiet-scene"));

    let guarded = GuardedGate::new(Arc::new(engine.gate.clone()), Arc::new(OpenAccess));
    let scope = ScopeId::new("quiet-scene");
    let result = guarded
        .complete_scene(&Principal::new("narrator"), &scope)
        .await
        .unwrap();
    assert_eq!(result, BatchResult::empty(scope));
}

#[tokio::test]
async fn test_only_the_keeper_may_finalize() {
    let engine = TestEngine::new();
    let id = engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();
    let guarded = GuardedGate::new(
        Arc::new(engine.gate.clone()),
        Arc::new(ExclusiveKeeper::new(Principal::new("canon-keeper"))),
    );
    let scope = ScopeId::new("scene-1");

    let err = guarded
        .finalize_scope(&Principal::new("narrator"), &scope)
        .await
        .unwrap_err();
    assert!(matches!(err, CanonError::Unauthorized { .. }));
    assert!(engine.proposals.get(id).await.unwrap().is_pending());

    let result = guarded
        .complete_scene(&Principal::new("canon-keeper"), &scope)
        .await
        .unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_judge_timeout_rejects() {
    let judge = Arc::new(ScriptedJudge::new(JudgeReply::Hang));
    let engine = TestEngine::new()
        .with_judge(judge.clone())
        .with_config(EngineConfig::default().with_judge_timeout(Duration::from_millis(50)));
    let id = engine
        .submit(fact_draft("scene-1", "player", 0.2, "Mira", "can fly"))
        .await
        .unwrap();

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.rejected_proposal_ids, vec![id]);
    assert_eq!(judge.calls(), 1);
}

#[tokio::test]
async fn test_unavailable_judge_is_retried() {
    let judge = Arc::new(ScriptedJudge::new(JudgeReply::Reject));
    judge
        .script(
            "Mira: can fly",
            vec![
                JudgeReply::Fail(JudgeError::Unavailable("overloaded".into())),
                JudgeReply::Accept,
            ],
        )
        .await;
    let engine = TestEngine::new()
        .with_judge(judge.clone())
        .with_config(EngineConfig::default().with_judge_retries(1));
    engine
        .submit(fact_draft("scene-1", "player", 0.2, "Mira", "can fly"))
        .await
        .unwrap();

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 1);
    assert_eq!(judge.calls(), 2);
}

#[tokio::test]
async fn test_unreadable_judgment_rejects_without_retry() {
    let judge = Arc::new(ScriptedJudge::new(JudgeReply::Fail(JudgeError::Malformed(
        "maybe?".into(),
    ))));
    let engine = TestEngine::new()
        .with_judge(judge.clone())
        .with_config(EngineConfig::default().with_judge_retries(3));
    let id = engine
        .submit(fact_draft("scene-1", "player", 0.2, "Mira", "can fly"))
        .await
        .unwrap();

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.rejected_proposal_ids, vec![id]);
    assert_eq!(judge.calls(), 1);
}

#[tokio::test]
async fn test_index_outage_does_not_fail_the_batch() {
    let engine = TestEngine::with_failing_index(Atomicity::Transactional);
    engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();
    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_judge_is_retried_with_backoff() {
    let judge = Arc::new(ScriptedJudge::new(JudgeReply::Fail(JudgeError::Unavailable(
        "503".into(),
    ))));
    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 100,
        max_backoff_ms: 1_000,
    };
    let engine = TestEngine::new().with_judge(judge.clone()).with_config(
        EngineConfig::default()
            .with_retry(retry)
            .with_judge_retries(3),
    );
    let id = engine
        .submit(fact_draft("scene-1", "player", 0.2, "Mira", "can fly"))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let result = engine.finalize("scene-1").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.rejected_proposal_ids, vec![id]);
    assert_eq!(judge.calls(), 4);
    // 100 + 200 + 400 ms between the four attempts.
    assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_busy_index_is_signalled_after_retry() {
    let engine = TestEngine::with_flaky_index(2);
    engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();

    let result = engine.finalize("scene-1").await.unwrap();
    let fact = engine
        .fact(result.accepted_fact_ids[0])
        .await
        .unwrap()
        .unwrap();
    let stale = engine.index.stale_partitions().await.unwrap();
    assert!(!fact.partitions().is_empty());
    for partition in fact.partitions() {
        assert!(stale.contains(&partition), "{partition:?} not marked stale");
    }
}

#[tokio::test]
async fn test_empty_evidence_never_reaches_the_coordinator() {
    let engine = TestEngine::new();
    let draft = ProposalDraft::new(
        "scene-1",
        "gm",
        Assertion::Fact {
            subject: "Mira".into(),
            statement: "is a spy".into(),
        },
    );
    let err = engine.submit(draft).await.unwrap_err();
    assert!(matches!(err, CanonError::Validation { .. }));
    assert!(matches!(
        engine.finalize("scene-1").await,
        Err(CanonError::EmptyBatch(_))
    ));
}
