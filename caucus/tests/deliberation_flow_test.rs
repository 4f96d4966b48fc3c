//! End-to-end flow tests for the deliberation core.
//!
//! Drives complete deliberations through the real machine, worker, and
//! mock pipeline: opinions → generated candidates → rankings → critique →
//! feedback, including the multi-round loop-back and the stage-gating
//! rejections at every boundary.

use std::time::Duration;

use caucus::{Caucus, CaucusConfig, Stage, SubmitError};

const WAIT: Duration = Duration::from_secs(10);

fn quick_config() -> CaucusConfig {
    CaucusConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..Default::default()
    }
}

/// Rotate a ranking so each participant submits a distinct permutation.
fn rotated(ids: &[String], by: usize) -> Vec<String> {
    let mut order = ids.to_vec();
    order.rotate_left(by % ids.len().max(1));
    order
}

#[tokio::test]
async fn test_full_single_round_deliberation() {
    let caucus = Caucus::with_mocks(quick_config());
    let d = caucus
        .create_deliberation("Should the town square be car-free?", 3, Some(1))
        .await
        .unwrap();

    // Ranking before any candidates exist is a stage error.
    let err = caucus
        .submit_ranking(&d.id, "p0", 0, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::WrongStage { .. }));

    for (name, opinion) in [
        ("p0", "Cars make the square unsafe for children"),
        ("p1", "Shops need delivery access by car"),
        ("p2", "A weekend trial closure would settle it"),
    ] {
        caucus.submit_opinion(&d.id, name, opinion).await.unwrap();
    }

    // Capacity-th opinion triggered the cycle; stage becomes Ranking with
    // the configured 16 candidates.
    let status = caucus.wait_for_stage(&d.id, Stage::Ranking, WAIT).await.unwrap();
    assert_eq!(status.round, 0);
    assert_eq!(status.participants, 3);
    let candidates = caucus.candidates(&d.id, 0).await.unwrap();
    assert_eq!(candidates.len(), 16);
    assert!(candidates.iter().all(|c| c.rank.is_none()));
    assert!(candidates.iter().all(|c| c.provenance.predicted_rank >= 1));

    // A fourth participant cannot join once capacity is reached.
    let err = caucus
        .submit_opinion(&d.id, "p3", "too late")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SubmitError::DeliberationFull { .. } | SubmitError::WrongStage { .. }
    ));

    let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
    caucus
        .submit_ranking(&d.id, "p0", 0, rotated(&ids, 0))
        .await
        .unwrap();
    caucus
        .submit_ranking(&d.id, "p1", 0, rotated(&ids, 1))
        .await
        .unwrap();

    // Duplicate before completion.
    let err = caucus
        .submit_ranking(&d.id, "p0", 0, rotated(&ids, 2))
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::DuplicateSubmission("p0".to_string()));

    caucus
        .submit_ranking(&d.id, "p2", 0, rotated(&ids, 0))
        .await
        .unwrap();

    // Aggregation ran inside the completion step: stage is Critique and
    // exactly one candidate holds rank 1, ranks unique 1..=16.
    let status = caucus.wait_for_stage(&d.id, Stage::Critique, WAIT).await.unwrap();
    assert_eq!(status.round, 0);
    let ranked = caucus.candidates(&d.id, 0).await.unwrap();
    let mut ranks: Vec<u32> = ranked.iter().filter_map(|c| c.rank).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, (1..=16).collect::<Vec<u32>>());
    assert_eq!(ranked.iter().filter(|c| c.rank == Some(1)).count(), 1);

    // A late ranking fails loudly instead of being dropped.
    let err = caucus
        .submit_ranking(&d.id, "p1", 0, rotated(&ids, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::WrongStage { .. }));

    // Feedback is not accepted yet.
    let err = caucus
        .submit_feedback(&d.id, "p0", 5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::WrongStage { .. }));

    for name in ["p0", "p1", "p2"] {
        caucus
            .submit_critique(&d.id, name, 0, "the statement glosses over parking")
            .await
            .unwrap();
    }

    // One configured critique round: concluded, not looped.
    let status = caucus.wait_for_stage(&d.id, Stage::Concluded, WAIT).await.unwrap();
    assert!(status.final_statement_id.is_some());
    let final_statement = caucus.final_statement(&d.id).await.unwrap().unwrap();
    assert_eq!(final_statement.rank, Some(1));

    for (name, score) in [("p0", 5), ("p1", 3), ("p2", 4)] {
        caucus
            .submit_feedback(&d.id, name, score, Some("ok".to_string()))
            .await
            .unwrap();
    }
    let status = caucus.wait_for_stage(&d.id, Stage::Finalized, WAIT).await.unwrap();
    assert_eq!(status.stage, Stage::Finalized);

    // The single committed cycle carries per-participant provenance.
    let records = caucus.machine().cycle_records(&d.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].predictor_outcomes.len(), 3);
    assert!(records[0].predictor_outcomes.iter().all(|o| !o.fallback));
    assert_eq!(records[0].predicted_order.len(), 16);

    // Terminal: nothing further is accepted.
    let err = caucus
        .submit_feedback(&d.id, "p0", 5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::WrongStage { .. }));

    caucus.abort();
}

#[tokio::test]
async fn test_two_round_deliberation_loops_back() {
    let caucus = Caucus::with_mocks(CaucusConfig {
        num_candidates: 4,
        ..quick_config()
    });
    let d = caucus
        .create_deliberation("How should the budget surplus be spent?", 2, Some(2))
        .await
        .unwrap();

    caucus
        .submit_opinion(&d.id, "p0", "Fix the roads first")
        .await
        .unwrap();
    caucus
        .submit_opinion(&d.id, "p1", "Invest in the library")
        .await
        .unwrap();

    // Round 0.
    caucus.wait_for_stage(&d.id, Stage::Ranking, WAIT).await.unwrap();
    let ids: Vec<String> = caucus
        .candidates(&d.id, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    for (name, by) in [("p0", 0), ("p1", 1)] {
        caucus
            .submit_ranking(&d.id, name, 0, rotated(&ids, by))
            .await
            .unwrap();
    }
    caucus.wait_for_stage(&d.id, Stage::Critique, WAIT).await.unwrap();
    for name in ["p0", "p1"] {
        caucus
            .submit_critique(&d.id, name, 0, "too vague about amounts")
            .await
            .unwrap();
    }

    // Rounds remain: loop back through generation into Ranking round 1.
    let status = caucus.wait_for_stage(&d.id, Stage::Ranking, WAIT).await.unwrap();
    assert_eq!(status.round, 1);
    let round1: Vec<String> = caucus
        .candidates(&d.id, 1)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(round1.len(), 4);

    // A ranking for the finished round is a round error now.
    let err = caucus
        .submit_ranking(&d.id, "p0", 0, rotated(&ids, 0))
        .await
        .unwrap_err();
    assert_eq!(err, SubmitError::WrongRound { expected: 1, got: 0 });

    for (name, by) in [("p0", 1), ("p1", 0)] {
        caucus
            .submit_ranking(&d.id, name, 1, rotated(&round1, by))
            .await
            .unwrap();
    }
    caucus.wait_for_stage(&d.id, Stage::Critique, WAIT).await.unwrap();
    for name in ["p0", "p1"] {
        caucus
            .submit_critique(&d.id, name, 1, "better")
            .await
            .unwrap();
    }

    // Second round was the last: conclude.
    caucus.wait_for_stage(&d.id, Stage::Concluded, WAIT).await.unwrap();
    let final_statement = caucus.final_statement(&d.id).await.unwrap().unwrap();
    assert_eq!(final_statement.round, 1);

    // Both rounds have a unique winner.
    for round in [0, 1] {
        let winners = caucus
            .candidates(&d.id, round)
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.rank == Some(1))
            .count();
        assert_eq!(winners, 1, "round {} winner count", round);
    }

    caucus.abort();
}

#[tokio::test]
async fn test_independent_deliberations_do_not_interfere() {
    let caucus = Caucus::with_mocks(CaucusConfig {
        num_candidates: 4,
        ..quick_config()
    });
    let a = caucus
        .create_deliberation("Question A", 2, Some(1))
        .await
        .unwrap();
    let b = caucus
        .create_deliberation("Question B", 2, Some(1))
        .await
        .unwrap();

    caucus.submit_opinion(&a.id, "p0", "alpha").await.unwrap();
    caucus.submit_opinion(&b.id, "p0", "bravo").await.unwrap();
    caucus.submit_opinion(&a.id, "p1", "alfa").await.unwrap();

    // A advances while B still collects opinions.
    caucus.wait_for_stage(&a.id, Stage::Ranking, WAIT).await.unwrap();
    let status_b = caucus.status(&b.id).await.unwrap();
    assert_eq!(status_b.stage, Stage::Opinion);
    assert_eq!(status_b.submissions_in_stage, 1);

    caucus.submit_opinion(&b.id, "p1", "beta").await.unwrap();
    caucus.wait_for_stage(&b.id, Stage::Ranking, WAIT).await.unwrap();

    caucus.abort();
}
