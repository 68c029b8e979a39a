//! Leader election: campaigning, leadership queries, resume and observe.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tether_coordination::CoordinationError;
use tether_coordination::ElectionState;
use tether_coordination::Session;
use tether_coordination::SessionConfig;
use tether_testing::DeterministicKeyValueStore;
use tether_testing::init_tracing;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

const PREFIX: &str = "elections/scheduler";

async fn open(store: &Arc<DeterministicKeyValueStore>) -> Session<DeterministicKeyValueStore> {
    Session::open(store.clone()).await.unwrap()
}

async fn wait_for_candidates(store: &DeterministicKeyValueStore, count: usize) {
    while store.keys("elections/scheduler/").await.len() < count {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn campaign_leader_resign_round_trip() {
    init_tracing();
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut election = session.new_election(PREFIX);
    assert_eq!(election.state(), ElectionState::Idle);

    election.campaign("10.0.0.1:7000", None).await.unwrap();

    assert!(election.is_leader());
    assert_eq!(election.state(), ElectionState::Leading);
    let leader = election.leader().await.unwrap();
    assert_eq!(leader.key, election.key());
    assert_eq!(leader.value, "10.0.0.1:7000");
    assert_eq!(leader.create_revision, election.rev());

    election.resign().await.unwrap();

    assert_eq!(election.state(), ElectionState::Resigned);
    assert_eq!(election.key(), "");
    assert!(matches!(election.leader().await, Err(CoordinationError::NoLeader { .. })));
}

#[tokio::test]
async fn leader_on_an_empty_prefix_is_no_leader() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let election = session.new_election(PREFIX);

    match election.leader().await {
        Err(CoordinationError::NoLeader { prefix }) => assert_eq!(prefix, "elections/scheduler/"),
        other => panic!("expected NoLeader, got {other:?}"),
    }
}

#[tokio::test]
async fn exactly_one_leader_at_a_time_and_everyone_agrees() {
    init_tracing();
    const CANDIDATES: usize = 4;
    let store = DeterministicKeyValueStore::new();
    let (won_tx, mut won_rx) = mpsc::unbounded_channel();
    let mut releases = Vec::new();
    let mut sessions = Vec::new();

    for id in 0..CANDIDATES {
        let session = open(&store).await;
        sessions.push(session.clone());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        releases.push(Some(release_tx));
        let won_tx = won_tx.clone();
        tokio::spawn(async move {
            let mut election = session.new_election(PREFIX);
            election.campaign(format!("node-{id}"), None).await.unwrap();
            won_tx.send(id).unwrap();
            let _ = release_rx.await;
            election.resign().await.unwrap();
        });
        wait_for_candidates(&store, id + 1).await;
    }

    for expected in 0..CANDIDATES {
        let winner = won_rx.recv().await.unwrap();
        assert_eq!(winner, expected);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(won_rx.try_recv().is_err(), "second leader elected while {winner} leads");

        for session in &sessions {
            let leader = session.new_election(PREFIX).leader().await.unwrap();
            assert_eq!(leader.value, format!("node-{winner}"));
        }

        if let Some(release) = releases[winner].take() {
            release.send(()).unwrap();
        }
    }
}

#[tokio::test]
async fn campaigning_again_while_leading_proclaims() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut election = session.new_election(PREFIX);

    election.campaign("v1", None).await.unwrap();
    let key = election.key().to_string();
    let rev = election.rev();
    election.campaign("v2", None).await.unwrap();

    assert_eq!(election.key(), key);
    assert_eq!(election.rev(), rev);
    assert_eq!(election.leader().await.unwrap().value, "v2");
    assert_eq!(store.keys("elections/scheduler/").await.len(), 1);
}

#[tokio::test]
async fn proclaim_updates_the_value_only_for_the_leader() {
    let store = DeterministicKeyValueStore::new();
    let leader_session = open(&store).await;
    let mut leader = leader_session.new_election(PREFIX);
    leader.campaign("v1", None).await.unwrap();

    leader.proclaim("v2").await.unwrap();
    let record = leader.leader().await.unwrap();
    assert_eq!(record.value, "v2");
    assert_eq!(record.create_revision, leader.rev());

    let follower_session = open(&store).await;
    let mut follower = follower_session.new_election(PREFIX);
    assert!(matches!(follower.proclaim("hijack").await, Err(CoordinationError::NotLeader { .. })));
    assert_eq!(leader.leader().await.unwrap().value, "v2");
}

#[tokio::test]
async fn resign_when_not_leading_is_a_no_op() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut election = session.new_election(PREFIX);

    election.resign().await.unwrap();

    assert_eq!(election.state(), ElectionState::Idle);
}

#[tokio::test]
async fn resume_with_valid_state_keeps_leadership() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut original = session.new_election(PREFIX);
    original.campaign("v1", None).await.unwrap();

    let mut resumed = session.resume_election(PREFIX, original.key(), original.rev());
    assert_eq!(resumed.state(), ElectionState::Resumed);

    resumed.proclaim("v2").await.unwrap();

    assert_eq!(resumed.state(), ElectionState::Leading);
    assert_eq!(resumed.leader().await.unwrap().value, "v2");
    resumed.ensure_leader().await.unwrap();
    resumed.resign().await.unwrap();
    assert!(matches!(resumed.leader().await, Err(CoordinationError::NoLeader { .. })));
}

#[tokio::test]
async fn resume_with_stale_revision_reports_leader_changed() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut original = session.new_election(PREFIX);
    original.campaign("v1", None).await.unwrap();

    let mut stale = session.resume_election(PREFIX, original.key(), original.rev() + 100);

    match stale.ensure_leader().await {
        Err(CoordinationError::LeaderChanged { key, revision, .. }) => {
            assert_eq!(key, original.key());
            assert_eq!(revision, original.rev() + 100);
        }
        other => panic!("expected LeaderChanged, got {other:?}"),
    }
    assert_eq!(stale.state(), ElectionState::Idle);
    assert!(matches!(stale.proclaim("v2").await, Err(CoordinationError::NotLeader { .. })));
    assert_eq!(original.leader().await.unwrap().value, "v1");
}

#[tokio::test]
async fn resume_after_the_leader_resigned_reports_leader_changed() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut original = session.new_election(PREFIX);
    original.campaign("v1", None).await.unwrap();
    let (key, rev) = (original.key().to_string(), original.rev());
    original.resign().await.unwrap();

    let mut stale = session.resume_election(PREFIX, key.clone(), rev);
    assert!(matches!(stale.resign().await, Err(CoordinationError::LeaderChanged { .. })));

    let mut stale = session.resume_election(PREFIX, key, rev);
    assert!(matches!(stale.proclaim("v2").await, Err(CoordinationError::LeaderChanged { .. })));
    assert!(matches!(stale.leader().await, Err(CoordinationError::NoLeader { .. })));
}

#[tokio::test(start_paused = true)]
async fn campaign_timeout_withdraws_the_candidate() {
    let store = DeterministicKeyValueStore::new();
    let leader_session = open(&store).await;
    let mut leader = leader_session.new_election(PREFIX);
    leader.campaign("incumbent", None).await.unwrap();

    let challenger_session = open(&store).await;
    let mut challenger = challenger_session.new_election(PREFIX);
    let err = challenger.campaign("challenger", Some(Duration::from_secs(2))).await.unwrap_err();

    assert!(matches!(err, CoordinationError::CampaignTimeout { timeout_ms: 2000, .. }));
    assert_eq!(challenger.state(), ElectionState::Idle);
    assert_eq!(store.keys("elections/scheduler/").await, vec![leader.key().to_string()]);
    assert_eq!(challenger.leader().await.unwrap().value, "incumbent");
}

#[tokio::test(start_paused = true)]
async fn session_loss_while_campaigning_expires_the_election() {
    let store = DeterministicKeyValueStore::new();
    let leader_session = open(&store).await;
    let mut leader = leader_session.new_election(PREFIX);
    leader.campaign("incumbent", None).await.unwrap();

    let challenger_session = open(&store).await;
    let handle = challenger_session.clone();
    let challenger = tokio::spawn(async move {
        let mut election = challenger_session.new_election(PREFIX);
        let result = election.campaign("challenger", None).await;
        (result, election.state())
    });
    wait_for_candidates(&store, 2).await;

    handle.orphan();

    let (result, state) = challenger.await.unwrap();
    assert!(matches!(result, Err(CoordinationError::SessionExpired { .. })));
    assert_eq!(state, ElectionState::Expired);
    assert_eq!(store.keys("elections/scheduler/").await, vec![leader.key().to_string()]);
}

#[tokio::test(start_paused = true)]
async fn leadership_passes_when_the_leader_lease_expires() {
    let store = DeterministicKeyValueStore::new();
    let dying = Session::open_with_config(store.clone(), SessionConfig::default().with_ttl(2)).await.unwrap();
    let mut old_leader = dying.new_election(PREFIX);
    old_leader.campaign("old", None).await.unwrap();
    dying.orphan();

    let session = open(&store).await;
    let mut next = session.new_election(PREFIX);
    next.campaign("new", Some(Duration::from_secs(10))).await.unwrap();

    assert!(next.is_leader());
    assert!(next.rev() > old_leader.rev());
    assert_eq!(next.leader().await.unwrap().value, "new");
}

#[tokio::test]
async fn observe_reports_proclamations_and_handover() {
    init_tracing();
    let store = DeterministicKeyValueStore::new();
    let first_session = open(&store).await;
    let mut first = first_session.new_election(PREFIX);
    first.campaign("a", None).await.unwrap();

    let watcher_session = open(&store).await;
    let mut observer = watcher_session.new_election(PREFIX).observe();

    let initial = observer.next().await.unwrap();
    assert_eq!(initial.value, "a");
    assert_eq!(initial.key, first.key());

    first.proclaim("b").await.unwrap();
    let proclaimed = observer.next().await.unwrap();
    assert_eq!(proclaimed.value, "b");
    assert_eq!(proclaimed.create_revision, initial.create_revision);

    let second_session = open(&store).await;
    let second = tokio::spawn(async move {
        let mut election = second_session.new_election(PREFIX);
        election.campaign("c", None).await.unwrap();
        election
    });
    wait_for_candidates(&store, 2).await;
    first.resign().await.unwrap();

    let handed_over = observer.next_leader().await.unwrap();
    assert_eq!(handed_over.value, "c");
    assert!(handed_over.create_revision > initial.create_revision);
    let second = second.await.unwrap();
    assert_eq!(handed_over.key, second.key());
}

#[tokio::test]
async fn observer_ends_when_its_session_closes() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut election = session.new_election(PREFIX);
    election.campaign("a", None).await.unwrap();

    let mut observer = election.observe();
    assert_eq!(observer.next().await.unwrap().value, "a");

    session.close().await;

    assert!(observer.next().await.is_none());
}

#[tokio::test]
async fn campaign_after_resuming_a_resigned_leader_reports_leader_changed() {
    let store = DeterministicKeyValueStore::new();
    let old_session = open(&store).await;
    let mut original = old_session.new_election(PREFIX);
    original.campaign("v1", None).await.unwrap();
    let (key, rev) = (original.key().to_string(), original.rev());
    original.resign().await.unwrap();

    let session = open(&store).await;
    let mut stale = session.resume_election(PREFIX, key.clone(), rev);

    match stale.campaign("v2", None).await {
        Err(CoordinationError::LeaderChanged { key: stale_key, revision, .. }) => {
            assert_eq!(stale_key, key);
            assert_eq!(revision, rev);
        }
        other => panic!("expected LeaderChanged, got {other:?}"),
    }
    assert_eq!(stale.state(), ElectionState::Idle);
    assert!(store.keys("elections/scheduler/").await.is_empty());

    // A fresh campaign runs under this session's own lease.
    stale.campaign("v2", None).await.unwrap();
    assert!(stale.key().contains(&format!("{:x}_", session.lease_id())));
}

#[tokio::test]
async fn campaign_after_resuming_with_the_wrong_revision_reports_leader_changed() {
    let store = DeterministicKeyValueStore::new();
    let leader_session = open(&store).await;
    let mut leader = leader_session.new_election(PREFIX);
    leader.campaign("v1", None).await.unwrap();

    let session = open(&store).await;
    let mut stale = session.resume_election(PREFIX, leader.key(), leader.rev() + 100);

    assert!(matches!(stale.campaign("hijack", None).await, Err(CoordinationError::LeaderChanged { .. })));
    assert!(!stale.is_leader());
    let record = leader.leader().await.unwrap();
    assert_eq!(record.value, "v1");
    assert_eq!(record.key, leader.key());
    assert_eq!(store.keys("elections/scheduler/").await, vec![leader.key().to_string()]);
}

#[tokio::test]
async fn campaign_after_a_valid_resume_proclaims() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut original = session.new_election(PREFIX);
    original.campaign("v1", None).await.unwrap();

    let mut resumed = session.resume_election(PREFIX, original.key(), original.rev());
    resumed.campaign("v2", None).await.unwrap();

    assert_eq!(resumed.state(), ElectionState::Leading);
    assert_eq!(resumed.key(), original.key());
    assert_eq!(resumed.rev(), original.rev());
    assert_eq!(resumed.leader().await.unwrap().value, "v2");
}

#[tokio::test]
async fn leader_and_observe_after_resume_leave_the_election_unchecked() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut original = session.new_election(PREFIX);
    original.campaign("v1", None).await.unwrap();

    let stale = session.resume_election(PREFIX, "elections/scheduler/gone", 42);
    let leader = stale.leader().await.unwrap();
    assert_eq!(leader.key, original.key());
    assert_eq!(stale.state(), ElectionState::Resumed);

    let mut observer = stale.observe();
    assert_eq!(observer.next().await.unwrap().value, "v1");
    assert_eq!(stale.state(), ElectionState::Resumed);
}

#[tokio::test]
async fn failed_campaign_while_leading_keeps_leadership() {
    let store = DeterministicKeyValueStore::new();
    let session = open(&store).await;
    let mut election = session.new_election(PREFIX);
    election.campaign("v1", None).await.unwrap();

    store.set_unavailable(true);
    assert!(matches!(election.campaign("v2", None).await, Err(CoordinationError::Connection { .. })));
    store.set_unavailable(false);

    assert!(election.is_leader());
    assert_eq!(election.leader().await.unwrap().value, "v1");
    election.resign().await.unwrap();
    assert!(store.keys("elections/scheduler/").await.is_empty());
}
