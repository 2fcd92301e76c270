//! Store failures, aborted batches and resumption of interrupted commits.

use canon_core::commit::{CommitPlan, PlannedFact};
use canon_core::testing::{assert_level, fact_draft, JudgeReply, ScriptedJudge, TestEngine};
use canon_core::{
    Atomicity, BatchLedger, CanonError, CanonLevel, CanonicalFact, CanonicalStore,
    CanonizationGate, CommitCoordinator, Evaluator, FactId, JsonBatchLedger, MemoryCanonStore,
    MemoryIndex, MemoryStagingStore, ProposalId, ProposalStatus, ProposalStore,
    ProvenanceLedger, ScopeBatch, ScopeId, StoreError,
};
use chrono::Utc;
use std::sync::Arc;

/// What the coordinator would have planned for an accepted proposal.
async fn planned(proposals: &ProposalStore, id: ProposalId) -> PlannedFact {
    let p = proposals.get(id).await.unwrap();
    let fact_id = FactId::new();
    let edges = ProvenanceLedger::edges(fact_id, Some(p.id), &p.evidence).unwrap();
    PlannedFact {
        proposal: p.id,
        fact: CanonicalFact {
            id: fact_id,
            statement: p.payload.assertion.statement(),
            assertion: p.payload.assertion.clone(),
            authority: p.authority,
            confidence: p.confidence,
            level: CanonLevel::Canon,
            evidence: edges.iter().map(|e| e.id).collect(),
            scope: p.scope.clone(),
            origin: p.id,
            created_at: Utc::now(),
            superseded_by: None,
        },
        edges,
        retcon: None,
        retired_partitions: Vec::new(),
    }
}

async fn interrupted_plan(engine: &TestEngine, scope: &str) -> (CommitPlan, ProposalId, ProposalId) {
    let kept = engine
        .submit(fact_draft(scope, "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();
    let dropped = engine
        .submit(fact_draft(scope, "player", 0.1, "Mira", "is a goose"))
        .await
        .unwrap();
    let plan = CommitPlan {
        accepted: vec![planned(&engine.proposals, kept).await],
        rejected: vec![dropped],
    };
    engine
        .ledger
        .put(&ScopeBatch::committing(ScopeId::new(scope), plan.clone()))
        .await
        .unwrap();
    (plan, kept, dropped)
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let engine = TestEngine::new();
    engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();
    engine.canon.fail_next(2);

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 1);
    assert_eq!(engine.canon.writes(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_abort_and_a_later_finalize_succeeds() {
    let engine = TestEngine::new();
    let id = engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();
    // Three attempts per finalize; the first finalize uses up three failures.
    engine.canon.fail_next(5);

    let err = engine.finalize("scene-1").await.unwrap_err();
    assert!(err.is_transient());
    match &err {
        CanonError::BatchAborted {
            scope, in_flight, ..
        } => {
            assert_eq!(scope.as_str(), "scene-1");
            assert_eq!(in_flight, &vec![id]);
        }
        other => panic!("expected an aborted batch, got {other:?}"),
    }
    assert!(engine.proposals.get(id).await.unwrap().is_pending());
    assert_eq!(engine.fact_count().await, 0);
    assert!(engine.ledger.get(&ScopeId::new("scene-1")).await.unwrap().is_none());

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 1);
}

#[tokio::test]
async fn test_permanent_failure_resolves_nothing() {
    let engine = TestEngine::new();
    let a = engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();
    let b = engine
        .submit(fact_draft("scene-1", "system", 1.0, "Mira", "rolled a 20"))
        .await
        .unwrap();
    engine.canon.fail_writes(true);

    let err = engine.finalize("scene-1").await.unwrap_err();
    assert!(matches!(
        err.root(),
        CanonError::Store(StoreError::Permanent(_))
    ));
    assert!(!err.is_transient());
    for id in [a, b] {
        assert_eq!(
            engine.proposals.get(id).await.unwrap().status,
            ProposalStatus::Pending
        );
    }

    engine.canon.fail_writes(false);
    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 1);
    assert_eq!(result.rejected_proposal_ids, vec![b]);
}

#[tokio::test]
async fn test_status_flip_store_commits_in_two_phases() {
    let engine = TestEngine::with_atomicity(Atomicity::StatusFlip);
    engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Gate", "is closed"))
        .await
        .unwrap();
    let old = engine.finalize("scene-1").await.unwrap().accepted_fact_ids[0];

    engine
        .submit(fact_draft("scene-2", "gm", 1.0, "Gate", "is open").superseding(old))
        .await
        .unwrap();
    let new = engine.finalize("scene-2").await.unwrap().accepted_fact_ids[0];

    assert_eq!(engine.canon.writes(), 2);
    assert_eq!(engine.canon.flips(), 2);
    assert_level(&engine, old, CanonLevel::Retconned).await;
    assert_level(&engine, new, CanonLevel::Canon).await;
    assert_eq!(engine.canon.inner().retcons().await.len(), 1);
}

#[tokio::test]
async fn test_failed_flip_discards_staged_facts() {
    let engine = TestEngine::with_atomicity(Atomicity::StatusFlip);
    let id = engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();
    engine.canon.fail_flips(true);

    let err = engine.finalize("scene-1").await.unwrap_err();
    assert!(matches!(err, CanonError::BatchAborted { .. }));
    assert_eq!(engine.fact_count().await, 0);
    assert!(engine.proposals.get(id).await.unwrap().is_pending());
}

#[tokio::test]
async fn test_resume_when_crash_preceded_the_write() {
    let engine = TestEngine::new();
    let (plan, kept, dropped) = interrupted_plan(&engine, "scene-1").await;
    let fact_id = plan.accepted[0].fact.id;

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids, vec![fact_id]);
    assert_eq!(result.rejected_proposal_ids, vec![dropped]);
    assert_eq!(engine.canon.writes(), 1);
    assert_level(&engine, fact_id, CanonLevel::Canon).await;

    let p = engine.proposals.get(kept).await.unwrap();
    assert_eq!(p.canonical_fact, Some(fact_id));
    let marker = engine.ledger.get(&ScopeId::new("scene-1")).await.unwrap().unwrap();
    assert_eq!(marker.result(), Some(&result));
}

#[tokio::test]
async fn test_resume_does_not_consult_the_judge() {
    let judge = Arc::new(ScriptedJudge::new(JudgeReply::Accept));
    let engine = TestEngine::new().with_judge(judge.clone());
    let (_, _, dropped) = interrupted_plan(&engine, "scene-1").await;

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(judge.calls(), 0);
    assert_eq!(result.rejected_proposal_ids, vec![dropped]);
}

#[tokio::test]
async fn test_resume_when_crash_followed_the_write() {
    let engine = TestEngine::new();
    let (plan, kept, dropped) = interrupted_plan(&engine, "scene-1").await;
    engine
        .canon
        .inner()
        .write(&plan.transactional_ops())
        .await
        .unwrap();
    // One decision was recorded before the crash.
    engine
        .proposals
        .mark_resolved(dropped, ProposalStatus::Rejected, None)
        .await
        .unwrap();

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids, vec![plan.accepted[0].fact.id]);
    assert_eq!(engine.canon.writes(), 0);
    assert_eq!(engine.fact_count().await, 1);
    assert_eq!(
        engine.proposals.get(kept).await.unwrap().status,
        ProposalStatus::Accepted
    );
}

#[tokio::test]
async fn test_resume_discards_staged_leftovers() {
    let engine = TestEngine::with_atomicity(Atomicity::StatusFlip);
    let (plan, _, _) = interrupted_plan(&engine, "scene-1").await;
    engine.canon.inner().write(&plan.stage_ops()).await.unwrap();
    let fact_id = plan.accepted[0].fact.id;
    assert_level(&engine, fact_id, CanonLevel::PendingCommit).await;

    engine.finalize("scene-1").await.unwrap();
    assert_level(&engine, fact_id, CanonLevel::Canon).await;
    assert_eq!(engine.canon.flips(), 1);
    assert_eq!(engine.fact_count().await, 1);
}

#[tokio::test]
async fn test_json_ledger_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batches.json");
    let scope = ScopeId::new("scene-7");

    let canon = Arc::new(MemoryCanonStore::transactional());
    let proposals = ProposalStore::new(Arc::new(MemoryStagingStore::new()));
    let id = proposals
        .submit(fact_draft("scene-7", "gm", 1.0, "Old Mill", "burned down"))
        .await
        .unwrap();
    let plan = CommitPlan {
        accepted: vec![planned(&proposals, id).await],
        rejected: Vec::new(),
    };
    {
        let ledger = JsonBatchLedger::open(&path).await.unwrap();
        ledger
            .put(&ScopeBatch::committing(scope.clone(), plan.clone()))
            .await
            .unwrap();
    }

    let ledger = Arc::new(JsonBatchLedger::open(&path).await.unwrap());
    let coordinator = CommitCoordinator::new(
        canon.clone(),
        proposals.clone(),
        Arc::new(MemoryIndex::new()),
        ledger,
    );
    let gate = CanonizationGate::new(proposals.clone(), Evaluator::default(), coordinator);
    let result = gate.finalize_scope(&scope).await.unwrap();
    assert_eq!(result.accepted_fact_ids, vec![plan.accepted[0].fact.id]);

    let reopened = JsonBatchLedger::open(&path).await.unwrap();
    let marker = reopened.get(&scope).await.unwrap().unwrap();
    assert_eq!(marker.result(), Some(&result));
    assert_eq!(gate.finalize_scope(&scope).await.unwrap(), result);
}
