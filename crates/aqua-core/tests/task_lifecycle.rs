//! End-to-end task lifecycle scenarios: claim races, dependencies, orphan
//! recovery, ask/reply, and checkpoint serialization.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rusqlite::{OptionalExtension, params};

use aqua_core::coordinator::Coordinator;
use aqua_core::store::Store;
use aqua_core::{ClaimOutcome, Error, NewAgent, NewTask, TaskStatus, task, util};

/// A pid no live process can have.
const DEAD_PID: i64 = 0x3fff_ffff;

fn init_project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    Store::create(dir.path()).unwrap();
    dir
}

fn join_as(dir: &std::path::Path, session: &str, name: &str) -> Coordinator {
    let mut coordinator = Coordinator::open_with_session(dir, session).unwrap();
    coordinator
        .join(NewAgent {
            name: name.into(),
            ..Default::default()
        })
        .unwrap();
    coordinator
}

fn titled(title: &str, priority: i64) -> NewTask {
    NewTask {
        title: title.into(),
        priority,
        ..Default::default()
    }
}

#[test]
fn concurrent_claims_of_one_task_have_one_winner() {
    let dir = init_project();
    let mut seed = Store::open(dir.path()).unwrap();
    let task_id = seed
        .with_tx(|tx| {
            task::add(
                tx,
                &NewTask {
                    title: "contested".into(),
                    priority: 8,
                    max_retries: 3,
                    ..Default::default()
                },
            )
        })
        .unwrap()
        .id;
    for i in 0..4 {
        seed.conn()
            .execute(
                "INSERT INTO agents (id, name, last_heartbeat_at, registered_at)
                 VALUES (?1, ?1, ?2, ?2)",
                params![format!("racer-{i}"), util::now_rfc3339()],
            )
            .unwrap();
    }

    let root = dir.path().to_path_buf();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let root = root.clone();
            let task_id = task_id.clone();
            std::thread::spawn(move || {
                let mut store = Store::open(&root).unwrap();
                let agent_id = format!("racer-{i}");
                store.with_tx(|tx| task::claim_specific(tx, &task_id, &agent_id, 0))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one concurrent claim succeeds");
    for loss in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            loss,
            Err(Error::TaskClaimed { .. } | Error::RaceLost { .. })
        ));
    }

    // Exactly one row claimed, and the winner's assignment is set.
    let store = Store::open(dir.path()).unwrap();
    let claimed: i64 = store
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'claimed'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(claimed, 1);

    let assigned: i64 = store
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM agents WHERE current_task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(assigned, 1);
}

#[test]
fn dependent_task_waits_for_its_parent() {
    let dir = init_project();
    let mut worker = join_as(dir.path(), "tty-w", "worker");

    let parent = worker.add_task(titled("parent", 5), &[]).unwrap();
    let child = worker
        .add_task(titled("child", 5), &[parent.id.clone()])
        .unwrap();

    // The parent is the only claimable candidate.
    let first = worker.claim(None).unwrap();
    let ClaimOutcome::Claimed { task } = first else {
        panic!("expected a claim");
    };
    assert_eq!(task.id, parent.id);

    worker.done(None, Some("parent finished")).unwrap();

    let second = worker.claim(None).unwrap();
    let ClaimOutcome::Claimed { task } = second else {
        panic!("expected a claim");
    };
    assert_eq!(task.id, child.id);
}

#[test]
fn orphan_recovery_returns_the_task_to_the_queue() {
    let dir = init_project();

    // Agent X claims a task and takes a lock, then "crashes": its
    // heartbeat is rewound past the threshold and its pid is dead.
    let mut session_x = join_as(dir.path(), "tty-x", "agent-x");
    let victim = session_x.add_task(titled("orphaned", 5), &[]).unwrap();
    let ClaimOutcome::Claimed { task } = session_x.claim(Some(&victim.id)).unwrap() else {
        panic!("expected a claim");
    };
    session_x.lock("src/main.rs").unwrap();

    let store = Store::open(dir.path()).unwrap();
    let x_id = session_x.require_agent().unwrap().id;
    let stale = util::to_rfc3339(Utc::now() - Duration::seconds(301));
    store
        .conn()
        .execute(
            "UPDATE agents SET last_heartbeat_at = ?1, pid = ?2 WHERE id = ?3",
            params![stale, DEAD_PID, x_id],
        )
        .unwrap();
    drop(store);

    // Any other agent's sweep declares X dead and reclaims everything.
    let mut session_y = join_as(dir.path(), "tty-y", "agent-y");
    let report = session_y.recover_now().unwrap();
    assert_eq!(report.dead_agents, vec![x_id.clone()]);
    assert_eq!(report.requeued_tasks, 1);

    let store = Store::open(dir.path()).unwrap();
    let reclaimed = task::get(store.conn(), &task.id).unwrap().unwrap();
    assert_eq!(reclaimed.status, TaskStatus::Pending);
    assert_eq!(reclaimed.retry_count, 1);
    assert_eq!(reclaimed.error.as_deref(), Some("agent died"));

    let locks: i64 = store
        .conn()
        .query_row("SELECT COUNT(*) FROM file_locks", [], |row| row.get(0))
        .unwrap();
    assert_eq!(locks, 0);
    drop(store);

    // The reclaimed task is claimable by the survivor.
    let ClaimOutcome::Claimed { task: retried } = session_y.claim(None).unwrap() else {
        panic!("expected a claim");
    };
    assert_eq!(retried.id, task.id);
}

#[test]
fn join_then_leave_round_trips_session_state() {
    let dir = init_project();

    let mut session = Coordinator::open_with_session(dir.path(), "tty-a").unwrap();
    assert!(matches!(session.claim(None), Err(Error::NotJoined)));

    let joined = session
        .join(NewAgent {
            name: "fleeting".into(),
            ..Default::default()
        })
        .unwrap();
    assert!(!joined.already_joined);

    // A second join in the same session is a no-op bind.
    let rejoined = session.join(NewAgent::default()).unwrap();
    assert!(rejoined.already_joined);
    assert_eq!(rejoined.agent.id, joined.agent.id);

    session.lock("README.md").unwrap();
    let left = session.leave(false).unwrap();
    assert_eq!(left.name, "fleeting");
    assert_eq!(left.released_locks, 1);

    // The session is unbound and the agent row is gone.
    assert!(session.current_agent().unwrap().is_none());
    let store = Store::open(dir.path()).unwrap();
    let agents: i64 = store
        .conn()
        .query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))
        .unwrap();
    assert_eq!(agents, 0);
}

#[test]
fn leave_with_claimed_task_requires_force_and_requeues() {
    let dir = init_project();
    let mut session = join_as(dir.path(), "tty-a", "deserter");

    let task = session.add_task(titled("left behind", 5), &[]).unwrap();
    session.claim(Some(&task.id)).unwrap();

    assert!(matches!(
        session.leave(false),
        Err(Error::PermissionDenied { .. })
    ));

    let left = session.leave(true).unwrap();
    assert_eq!(left.returned_task.as_deref(), Some(task.id.as_str()));

    // The task is back in the queue with one retry burned.
    let store = Store::open(dir.path()).unwrap();
    let returned = task::get(store.conn(), &task.id).unwrap().unwrap();
    assert_eq!(returned.status, TaskStatus::Pending);
    assert_eq!(returned.retry_count, 1);
    assert!(returned.claimed_by.is_none());
}

#[test]
fn ask_receives_reply_from_another_session() {
    let dir = init_project();
    let mut asker = join_as(dir.path(), "tty-a", "asker");
    let mut answerer = join_as(dir.path(), "tty-b", "answerer");

    let root = dir.path().to_path_buf();
    let asking = std::thread::spawn(move || {
        asker.ask(Some("answerer"), "ready?", StdDuration::from_secs(5))
    });

    // Wait for the request to land, then answer it from this side.
    let request_id = loop {
        let store = Store::open(&root).unwrap();
        let found: Option<i64> = store
            .conn()
            .query_row(
                "SELECT id FROM messages WHERE message_type = 'request' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .unwrap();
        if let Some(id) = found {
            break id;
        }
        std::thread::sleep(StdDuration::from_millis(50));
    };
    answerer.reply(request_id, "yes").unwrap();

    let response = asking.join().unwrap().unwrap();
    assert_eq!(response.content, "yes");
    assert_eq!(response.reply_to, Some(request_id));

    // The delivered reply was consumed: the answer does not show up again
    // as unread mail for the asker.
    let store = Store::open(dir.path()).unwrap();
    let unread_replies: i64 = store
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM messages
             WHERE message_type = 'response' AND read_at IS NULL",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(unread_replies, 0);
}

#[test]
fn ask_without_reply_times_out_and_request_survives() {
    let dir = init_project();
    let mut asker = join_as(dir.path(), "tty-a", "lonely");

    let result = asker.ask(None, "anyone?", StdDuration::from_millis(100));
    assert!(matches!(result, Err(Error::Timeout { .. })));

    let store = Store::open(dir.path()).unwrap();
    let requests: i64 = store
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM messages WHERE message_type = 'request'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(requests, 1);
}

#[test]
fn serialize_threads_pending_tasks_with_checkpoints() {
    let dir = init_project();
    let mut session = join_as(dir.path(), "tty-a", "planner");

    let t1 = session.add_task(titled("t1", 9), &[]).unwrap();
    std::thread::sleep(StdDuration::from_millis(5));
    let t2 = session
        .add_task(titled("t2", 8), &[t1.id.clone()])
        .unwrap();
    std::thread::sleep(StdDuration::from_millis(5));
    let t3 = session.add_task(titled("t3", 8), &[]).unwrap();

    let outcome = session.serialize(1).unwrap();
    assert_eq!(outcome.checkpoints_added, 2);
    assert_eq!(
        outcome.chain.len(),
        5,
        "t1 -> c1 -> t2 -> c2 -> t3"
    );
    assert_eq!(outcome.chain[0], t1.id);
    assert_eq!(outcome.chain[2], t2.id);
    assert_eq!(outcome.chain[4], t3.id);

    // Applying the same stride again changes nothing.
    let again = session.serialize(1).unwrap();
    assert_eq!(again.checkpoints_added, 0);
    assert_eq!(again.chain, outcome.chain);

    // Claiming walks the chain in order, checkpoints included.
    for expected in &outcome.chain {
        let ClaimOutcome::Claimed { task } = session.claim(None).unwrap() else {
            panic!("expected a claim for {expected}");
        };
        assert_eq!(&task.id, expected);
        session.done(None, None).unwrap();
    }
    let ClaimOutcome::NoneAvailable { counts } = session.claim(None).unwrap() else {
        panic!("queue should be drained");
    };
    assert_eq!(counts.done, 5);
}
