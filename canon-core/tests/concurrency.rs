//! Concurrent finalizes, bounded judge fan-out and cancellation.

use canon_core::testing::{fact_draft, JudgeReply, ScriptedJudge, TestEngine};
use canon_core::{BatchLedger, EngineConfig, ProposalStatus, RetryPolicy, ScopeId};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_finalizes_of_one_scope_commit_once() {
    let engine = Arc::new(TestEngine::new());
    for i in 0..5 {
        engine
            .submit(fact_draft("scene-1", "gm", 1.0, "Mira", &format!("clue {i}")))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.finalize("scene-1").await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(results[0].accepted_fact_ids.len(), 5);
    assert!(results.iter().all(|r| r == &results[0]));
    assert_eq!(engine.canon.writes(), 1);
    assert_eq!(engine.fact_count().await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_scopes_commit_independently() {
    let engine = Arc::new(TestEngine::new());
    let scopes: Vec<String> = (0..6).map(|i| format!("scene-{i}")).collect();
    for scope in &scopes {
        engine
            .submit(fact_draft(scope, "gm", 1.0, scope, "took place"))
            .await
            .unwrap();
    }

    let handles: Vec<_> = scopes
        .iter()
        .cloned()
        .map(|scope| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.finalize(&scope).await })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.accepted_fact_ids.len(), 1);
    }
    assert_eq!(engine.canon.writes(), scopes.len());
    assert_eq!(engine.fact_count().await, scopes.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_finalizes_consult_the_judge_once() {
    let judge = Arc::new(
        ScriptedJudge::new(JudgeReply::Accept).with_delay(Duration::from_millis(50)),
    );
    let engine = Arc::new(TestEngine::new().with_judge(judge.clone()));
    engine
        .submit(fact_draft("scene-1", "player", 0.4, "Mira", "knows the password"))
        .await
        .unwrap();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.finalize("scene-1").await })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(judge.calls(), 1);
    assert_eq!(results[0].accepted_fact_ids.len(), 1);
    assert!(results.iter().all(|r| r == &results[0]));
}

#[tokio::test]
async fn test_scope_locks_are_released() {
    let engine = Arc::new(TestEngine::new());
    for i in 0..20 {
        let scope = format!("scene-{i}");
        engine
            .submit(fact_draft(&scope, "gm", 1.0, "Mira", "was here"))
            .await
            .unwrap();
        engine.finalize(&scope).await.unwrap();
    }
    assert_eq!(engine.coordinator.tracked_scopes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_judge_fan_out_is_bounded() {
    let judge = Arc::new(
        ScriptedJudge::new(JudgeReply::Accept).with_delay(Duration::from_millis(200)),
    );
    let engine = TestEngine::new()
        .with_judge(judge.clone())
        .with_config(EngineConfig::default().with_judge_concurrency(2));
    for i in 0..6 {
        engine
            .submit(fact_draft("scene-1", "player", 0.4, "Mira", &format!("rumour {i}")))
            .await
            .unwrap();
    }

    let result = engine.finalize("scene-1").await.unwrap();
    assert_eq!(result.accepted_fact_ids.len(), 6);
    assert_eq!(judge.calls(), 6);
    assert!(judge.peak_concurrency() <= 2);
    assert!(judge.peak_concurrency() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_finalize_still_completes_its_batch() {
    let slow_retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 100,
        max_backoff_ms: 100,
    };
    let engine = TestEngine::new().with_config(EngineConfig::default().with_retry(slow_retry));
    let id = engine
        .submit(fact_draft("scene-1", "gm", 1.0, "Mira", "is a spy"))
        .await
        .unwrap();
    // The first write fails, so the commit is still backing off when the
    // caller gives up.
    engine.canon.fail_next(1);

    let outcome =
        tokio::time::timeout(Duration::from_millis(50), engine.finalize("scene-1")).await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(engine.canon.writes(), 1);
    assert_eq!(engine.fact_count().await, 1);
    let proposal = engine.proposals.get(id).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Accepted);
    let marker = engine
        .ledger
        .get(&ScopeId::new("scene-1"))
        .await
        .unwrap()
        .unwrap();
    assert!(marker.is_finalized());

    let replay = engine.finalize("scene-1").await.unwrap();
    assert_eq!(Some(&replay), marker.result());
}
