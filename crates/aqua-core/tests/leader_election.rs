//! Leader election scenarios, including cross-connection races.

use chrono::{Duration, Utc};
use rusqlite::params;

use aqua_core::coordinator::Coordinator;
use aqua_core::store::Store;
use aqua_core::{NewAgent, leader, util};

fn expire_lease(store: &Store) {
    let past = util::to_rfc3339(Utc::now() - Duration::seconds(120));
    store
        .conn()
        .execute("UPDATE leader SET lease_expires_at = ?1", params![past])
        .unwrap();
}

#[test]
fn first_join_becomes_leader_second_does_not() {
    let dir = tempfile::tempdir().unwrap();
    Store::create(dir.path()).unwrap();

    let mut session_a = Coordinator::open_with_session(dir.path(), "tty-a").unwrap();
    let joined_a = session_a
        .join(NewAgent {
            name: "a".into(),
            ..Default::default()
        })
        .unwrap();
    assert!(joined_a.is_leader);
    assert_eq!(joined_a.term, 1);

    let mut session_b = Coordinator::open_with_session(dir.path(), "tty-b").unwrap();
    let joined_b = session_b
        .join(NewAgent {
            name: "b".into(),
            ..Default::default()
        })
        .unwrap();
    assert!(!joined_b.is_leader);
    assert_eq!(joined_b.term, 0);

    let store = Store::open(dir.path()).unwrap();
    let row = leader::get(store.conn()).unwrap().unwrap();
    assert_eq!(row.agent_id, joined_a.agent.id);
}

#[test]
fn concurrent_election_has_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    Store::create(dir.path()).unwrap();

    let root = dir.path().to_path_buf();
    let handles: Vec<_> = (0..5)
        .map(|i| {
            let root = root.clone();
            std::thread::spawn(move || {
                let mut store = Store::open(&root).unwrap();
                let agent_id = format!("agent-{i}");
                store
                    .with_tx(|tx| leader::try_acquire(tx, &agent_id, 30))
                    .unwrap()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter(|r| r.is_leader).collect();
    assert_eq!(winners.len(), 1, "exactly one election winner");
    assert_eq!(winners[0].term, 1);
    assert!(
        results
            .iter()
            .filter(|r| !r.is_leader)
            .all(|r| r.term == 0)
    );
}

#[test]
fn expired_lease_is_taken_over_at_next_term() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::create(dir.path()).unwrap();

    store
        .with_tx(|tx| leader::try_acquire(tx, "agent-a", 30))
        .unwrap();
    expire_lease(&store);

    let result = store
        .with_tx(|tx| leader::try_acquire(tx, "agent-b", 30))
        .unwrap();
    assert!(result.is_leader);
    assert_eq!(result.term, 2);
}

#[test]
fn terms_increase_monotonically_across_takeovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::create(dir.path()).unwrap();

    for (expected_term, agent) in [(1, "agent-a"), (2, "agent-b"), (3, "agent-c")] {
        let result = store
            .with_tx(|tx| leader::try_acquire(tx, agent, 30))
            .unwrap();
        assert!(result.is_leader);
        assert_eq!(result.term, expected_term);
        expire_lease(&store);
    }
}

#[test]
fn deposed_leader_observes_fencing() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::create(dir.path()).unwrap();

    // L1 wins term 1, the lease lapses, L2 takes term 2.
    let first = store
        .with_tx(|tx| leader::try_acquire(tx, "l1", 30))
        .unwrap();
    assert_eq!(first.term, 1);
    expire_lease(&store);
    let second = store
        .with_tx(|tx| leader::try_acquire(tx, "l2", 30))
        .unwrap();
    assert_eq!(second.term, 2);

    // L1's guarded write, carrying its stale term, lands on zero rows.
    let still_leader = store
        .with_tx(|tx| leader::renew_fenced(tx, "l1", first.term, 30))
        .unwrap();
    assert!(!still_leader);

    let row = leader::get(store.conn()).unwrap().unwrap();
    assert_eq!(row.agent_id, "l2");
    assert_eq!(row.term, 2);
}

#[test]
fn claim_records_the_observed_term_for_audit() {
    let dir = tempfile::tempdir().unwrap();
    Store::create(dir.path()).unwrap();

    let mut session = Coordinator::open_with_session(dir.path(), "tty-a").unwrap();
    session
        .join(NewAgent {
            name: "worker".into(),
            ..Default::default()
        })
        .unwrap();
    session
        .add_task(
            aqua_core::NewTask {
                title: "audited work".into(),
                ..Default::default()
            },
            &[],
        )
        .unwrap();

    match session.claim(None).unwrap() {
        aqua_core::ClaimOutcome::Claimed { task } => {
            // The worker elected itself on join, so the claim carries term 1.
            assert_eq!(task.claim_term, Some(1));
        },
        other => panic!("expected a claim, got {other:?}"),
    }
}
