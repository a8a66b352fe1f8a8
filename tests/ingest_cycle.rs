//! End-to-end poll cycles against the scripted mail server.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{
    FakeServer, FlakyRepository, Harness, LastRowClash, build_service, email, email_with_header,
    test_config, thread_email,
};
use mail_ingest::error::{DatabaseError, IngestError, Phase};
use mail_ingest::health::{HealthReporter, HealthStatus};
use mail_ingest::ingest::model::{CycleOutcome, CycleState, Direction, RejectReason};
use mail_ingest::ingest::policy::{NoopClassifier, RuleSpamClassifier};
use mail_ingest::store::{CursorStore, InMemoryStore, MessageRepository};

fn three_messages() -> Arc<FakeServer> {
    FakeServer::with_messages(vec![
        (101, email("m101@test", "alice@example.com", "first")),
        (102, email("m102@test", "bob@example.com", "second")),
        (103, email("m103@test", "carol@example.com", "third")),
    ])
}

#[tokio::test]
async fn capped_cycles_walk_the_cursor_forward() {
    let mut config = test_config();
    config.poll.page_size = 2;
    config.poll.max_messages_per_poll = 2;
    let h = Harness::new(config, three_messages());
    h.set_cursor(100).await;

    let first = h.service.run_cycle().await;
    assert!(first.outcome.is_completed());
    assert_eq!(first.found, 3);
    assert_eq!(first.deferred, 1);
    assert_eq!(first.persisted, 2);
    assert_eq!(first.cursor_after, 102);
    assert_eq!(h.cursor().await, Some(102));

    let second = h.service.run_cycle().await;
    assert!(second.outcome.is_completed());
    assert_eq!(second.persisted, 1);
    assert_eq!(second.cursor_after, 103);

    let third = h.service.run_cycle().await;
    assert!(third.outcome.is_completed());
    assert_eq!(third.found, 0);
    assert_eq!(third.persisted, 0);
    assert_eq!(third.cursor_after, 103);

    assert_eq!(h.store.len().await, 3);
    // One connection serves all three cycles.
    assert_eq!(h.server.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repoll_of_unchanged_mailbox_creates_no_duplicates() {
    let config = test_config();
    let server = three_messages();
    let h = Harness::new(config.clone(), Arc::clone(&server));
    assert_eq!(h.service.run_cycle().await.persisted, 3);

    // Same repository, forgotten cursor: everything is fetched again.
    let fresh_cursors = Arc::new(InMemoryStore::new());
    let again = build_service(
        config,
        &server,
        h.store.clone(),
        fresh_cursors,
        Arc::new(NoopClassifier),
    );
    let report = again.run_cycle().await;
    assert!(report.outcome.is_completed());
    assert_eq!(report.fetched, 3);
    assert_eq!(report.duplicates, 3);
    assert_eq!(report.persisted, 0);
    assert_eq!(h.store.len().await, 3);
}

#[tokio::test]
async fn failed_commit_leaves_cursor_and_repository_untouched() {
    let server = three_messages();
    let repo = Arc::new(FlakyRepository::default());
    repo.fail_batches.store(true, Ordering::SeqCst);
    let cursors = Arc::new(InMemoryStore::new());
    let cancel = CancellationToken::new();
    cursors
        .save_cursor(
            &mail_ingest::ingest::model::MailboxCursor::new("INBOX", 100),
            &cancel,
        )
        .await
        .unwrap();
    let service = build_service(
        test_config(),
        &server,
        repo.clone(),
        cursors.clone(),
        Arc::new(NoopClassifier),
    );

    let report = service.run_cycle().await;
    match &report.outcome {
        CycleOutcome::Aborted { state, error } => {
            assert_eq!(*state, CycleState::Committing);
            assert_eq!(error.kind(), "repository");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.cursor_after, 100);
    assert_eq!(report.persisted, 0);
    assert_eq!(
        cursors.load_cursor("INBOX", &cancel).await.unwrap().unwrap().last_seen_uid,
        100
    );
    assert!(repo.inner.is_empty().await);
    assert!(server.seen.lock().unwrap().is_empty());

    // Next tick starts over and lands the whole batch.
    repo.fail_batches.store(false, Ordering::SeqCst);
    let retry = service.run_cycle().await;
    assert!(retry.outcome.is_completed());
    assert_eq!(retry.persisted, 3);
    assert_eq!(retry.cursor_after, 103);
}

#[tokio::test]
async fn batch_failing_on_last_row_commits_nothing() {
    let server = three_messages();
    let repo = Arc::new(LastRowClash {
        inner: mail_ingest::store::LibSqlStore::new_memory().await.unwrap(),
    });
    let cancel = CancellationToken::new();
    let mut config = test_config();
    config.policy.blocked_senders = vec!["carol@example.com".into()];
    let cursors = Arc::new(mail_ingest::store::LibSqlStore::new_memory().await.unwrap());
    cursors
        .save_cursor(
            &mail_ingest::ingest::model::MailboxCursor::new("INBOX", 100),
            &cancel,
        )
        .await
        .unwrap();
    let service = build_service(
        config,
        &server,
        repo.clone(),
        cursors.clone(),
        Arc::new(NoopClassifier),
    );

    let report = service.run_cycle().await;
    match &report.outcome {
        CycleOutcome::Aborted { state, error } => {
            assert_eq!(*state, CycleState::Committing);
            assert!(matches!(
                error.root(),
                IngestError::Repository(DatabaseError::Constraint(_))
            ));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.cursor_after, 100);
    assert_eq!(report.persisted, 0);
    // The blocked sender is re-evaluated next cycle, so it is not reported now.
    assert!(report.rejected.is_empty());

    assert_eq!(
        cursors.load_cursor("INBOX", &cancel).await.unwrap().unwrap().last_seen_uid,
        100
    );
    for pid in ["m101@test", "m102@test"] {
        assert!(
            repo.find_by_protocol_message_id(pid, &cancel)
                .await
                .unwrap()
                .is_none()
        );
    }
    assert!(repo.find_unprocessed(10, &cancel).await.unwrap().is_empty());
    assert!(server.seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_login_times_out_per_phase_and_exhausts_retries() {
    let mut config = test_config();
    config.timeouts.login = Duration::from_secs(1);
    config.timeouts.operation = Duration::from_secs(60);
    config.retry.max_retries = 2;
    let server = three_messages();
    *server.login_delay.lock().unwrap() = Some(Duration::from_secs(5));
    let h = Harness::new(config, server);

    let report = h.service.run_cycle().await;
    let CycleOutcome::Aborted { state, error } = &report.outcome else {
        panic!("cycle should abort, got {:?}", report.outcome);
    };
    assert_eq!(*state, CycleState::Connecting);
    match error.as_ref() {
        IngestError::RetriesExhausted { attempts, source } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(
                source.as_ref(),
                IngestError::Timeout { phase: Phase::Login, .. }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.server.logins.load(Ordering::SeqCst), 3);
    assert_eq!(report.retries, 2);
    assert!(!h.service.session().is_connected());
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let server = three_messages();
    server.reject_login.store(true, Ordering::SeqCst);
    let h = Harness::new(test_config(), server);

    let report = h.service.run_cycle().await;
    let error = report.outcome.error().expect("cycle should abort");
    assert!(matches!(error, IngestError::Auth { .. }));
    assert!(error.is_fatal());
    assert_eq!(h.server.logins.load(Ordering::SeqCst), 1);
    assert_eq!(h.cursor().await, None);
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn oversize_message_is_rejected_once_and_never_refetched() {
    let mut big = email("big@test", "alice@example.com", "attachment");
    big.extend(std::iter::repeat_n(b'x', 4096));
    let server = FakeServer::with_messages(vec![
        (1, email("small@test", "alice@example.com", "hi")),
        (2, big),
        (3, email("after@test", "bob@example.com", "later")),
    ]);
    let mut config = test_config();
    config.policy.max_message_size = 1024;
    let h = Harness::new(config, server);

    let report = h.service.run_cycle().await;
    assert!(report.outcome.is_completed());
    assert_eq!(report.persisted, 2);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].uid, 2);
    assert!(matches!(
        report.rejected[0].reason,
        RejectReason::Oversize { limit: 1024, .. }
    ));
    assert_eq!(report.cursor_after, 3);

    h.server.add(4, email("new@test", "carol@example.com", "new"));
    let next = h.service.run_cycle().await;
    assert_eq!(next.persisted, 1);
    assert_eq!(h.server.fetch_count(2), 1);

    let cancel = CancellationToken::new();
    assert!(
        h.store
            .find_by_protocol_message_id("big@test", &cancel)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn sender_lists_reject_without_stalling_the_cursor() {
    let server = FakeServer::with_messages(vec![
        (1, email("ok@test", "alice@example.com", "hi")),
        (2, email("blocked@test", "bob@spammer.example", "buy")),
    ]);
    let mut config = test_config();
    config.policy.blocked_senders = vec!["spammer.example".into()];
    let h = Harness::new(config, server);

    let report = h.service.run_cycle().await;
    assert_eq!(report.persisted, 1);
    assert_eq!(
        report.rejected[0].reason,
        RejectReason::BlockedSender {
            sender: "bob@spammer.example".into()
        }
    );
    assert_eq!(report.cursor_after, 2);
}

#[tokio::test]
async fn reply_threads_resolve_in_declared_order() {
    let server = FakeServer::with_messages(vec![
        (1, email("a@test", "alice@example.com", "A")),
        (2, email("b@test", "bob@example.com", "B")),
        (3, thread_email("c@test", "carol@example.com", "Re: A", Some("a@test"), &[])),
        (4, thread_email("d@test", "dave@example.com", "Re:", None, &["a@test", "b@test"])),
        (5, thread_email("e@test", "erin@example.com", "Re:", None, &["b@test", "a@test"])),
        (6, thread_email("f@test", "frank@example.com", "Re:", None, &["ghost@test", "c@test"])),
    ]);
    let h = Harness::new(test_config(), server);
    assert_eq!(h.service.run_cycle().await.persisted, 6);

    let cancel = CancellationToken::new();
    let thread_of = |id: &'static str| {
        let store = h.store.clone();
        let cancel = cancel.clone();
        async move {
            store
                .find_by_protocol_message_id(id, &cancel)
                .await
                .unwrap()
                .unwrap()
                .thread_id
                .unwrap()
        }
    };
    assert_eq!(thread_of("a@test").await, "a@test");
    assert_eq!(thread_of("b@test").await, "b@test");
    assert_eq!(thread_of("c@test").await, "a@test");
    assert_eq!(thread_of("d@test").await, "a@test");
    assert_eq!(thread_of("e@test").await, "b@test");
    assert_eq!(thread_of("f@test").await, "a@test");

    // A reply arriving in a later cycle finds its parent in the repository.
    h.server.add(
        7,
        thread_email("g@test", "bob@example.com", "Re: B", Some("e@test"), &[]),
    );
    assert_eq!(h.service.run_cycle().await.persisted, 1);
    assert_eq!(thread_of("g@test").await, "b@test");
}

#[tokio::test]
async fn read_only_mode_persists_but_leaves_flags_alone() {
    let mut config = test_config();
    config.policy.read_only_mode = true;
    let h = Harness::new(config, three_messages());

    let report = h.service.run_cycle().await;
    assert_eq!(report.persisted, 3);
    assert!(h.server.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn committed_messages_are_marked_seen() {
    let server = three_messages();
    server.ghosts.lock().unwrap().push(110);
    let h = Harness::new(test_config(), server);

    let report = h.service.run_cycle().await;
    assert!(report.outcome.is_completed());
    assert_eq!(report.vanished, vec![110]);
    assert_eq!(report.cursor_after, 110);
    let mut seen = h.server.seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![101, 102, 103]);
}

#[tokio::test]
async fn read_only_mailbox_suppresses_mark_seen() {
    let server = three_messages();
    server.read_only_mailbox.store(true, Ordering::SeqCst);
    let h = Harness::new(test_config(), server);

    assert_eq!(h.service.run_cycle().await.persisted, 3);
    assert!(h.server.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn transient_fetch_failure_is_retried_within_the_cycle() {
    let server = three_messages();
    server.failing_fetches.store(1, Ordering::SeqCst);
    let h = Harness::new(test_config(), server);

    let report = h.service.run_cycle().await;
    assert!(report.outcome.is_completed());
    assert_eq!(report.persisted, 3);
    assert_eq!(report.retries, 1);
}

#[tokio::test]
async fn persistent_fetch_failure_aborts_paging_with_chunk_bounds() {
    let server = three_messages();
    server.failing_fetches.store(100, Ordering::SeqCst);
    let h = Harness::new(test_config(), server);
    h.set_cursor(100).await;

    let report = h.service.run_cycle().await;
    let CycleOutcome::Aborted { state, error } = &report.outcome else {
        panic!("cycle should abort, got {:?}", report.outcome);
    };
    assert_eq!(*state, CycleState::Paging);
    match error.root() {
        IngestError::Fetch {
            chunk,
            first_uid,
            last_uid,
            ..
        } => {
            assert_eq!((*chunk, *first_uid, *last_uid), (0, 101, 102));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.cursor().await, Some(100));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn spam_is_quarantined_and_skipped() {
    let server = FakeServer::with_messages(vec![
        (1, email("ham@test", "alice@example.com", "meeting notes")),
        (
            2,
            email_with_header("spam@test", "promo@bulk.example", "offer", "X-Spam-Flag: YES"),
        ),
    ]);
    let mut config = test_config();
    config.policy.spam_filter = true;
    let store = Arc::new(InMemoryStore::new());
    let h = Harness::with_store(
        config,
        server,
        store,
        Arc::new(RuleSpamClassifier::default_rules()),
    );

    let report = h.service.run_cycle().await;
    assert_eq!(report.persisted, 1);
    assert_eq!(report.quarantined.len(), 1);
    assert_eq!(report.quarantined[0].protocol_message_id, "spam@test");
    assert_eq!(report.cursor_after, 2);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test]
async fn auto_reply_lists_incoming_messages_only() {
    let server = FakeServer::with_messages(vec![
        (1, email("in@test", "alice@example.com", "question")),
        (2, email("out@test", "support@example.com", "answer")),
    ]);
    let mut config = test_config();
    config.policy.auto_reply = true;
    config.policy.own_addresses = vec!["support@example.com".into()];
    let h = Harness::new(config, server);

    let report = h.service.run_cycle().await;
    assert_eq!(report.reply_candidates.len(), 1);
    assert_eq!(report.reply_candidates[0].protocol_message_id, "in@test");

    let cancel = CancellationToken::new();
    let outgoing = h
        .store
        .find_by_protocol_message_id("out@test", &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outgoing.direction, Direction::Outgoing);
}

#[tokio::test]
async fn messages_without_message_id_get_stable_synthetic_ids() {
    let raw = b"From: alice@example.com\r\nSubject: no id\r\n\r\nbody\r\n".to_vec();
    let server = FakeServer::with_messages(vec![(1, raw)]);
    let config = test_config();
    let h = Harness::new(config.clone(), Arc::clone(&server));
    assert_eq!(h.service.run_cycle().await.persisted, 1);

    let stored = h.store.all().await;
    assert!(stored[0].envelope.synthetic_id);
    assert_eq!(stored[0].protocol_message_id, "synthetic.inbox.7.1@mail-ingest");

    let again = build_service(
        config,
        &server,
        h.store.clone(),
        Arc::new(InMemoryStore::new()),
        Arc::new(NoopClassifier),
    );
    assert_eq!(again.run_cycle().await.duplicates, 1);
    assert_eq!(h.store.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_tick_is_skipped() {
    let mut config = test_config();
    config.timeouts.login = Duration::from_secs(5);
    let server = three_messages();
    *server.login_delay.lock().unwrap() = Some(Duration::from_secs(2));
    let h = Harness::new(config, server);

    let mut state = h.service.subscribe_state();
    let running = {
        let service = Arc::clone(&h.service);
        tokio::spawn(async move { service.run_cycle().await })
    };
    state
        .wait_for(|s| *s == CycleState::Connecting)
        .await
        .unwrap();

    let skipped = h.service.run_cycle().await;
    assert!(matches!(skipped.outcome, CycleOutcome::Skipped));

    let finished = running.await.unwrap();
    assert!(finished.outcome.is_completed());
    assert_eq!(finished.persisted, 3);
    assert_eq!(h.service.subscribe_history().borrow().cycles, 1);
}

#[tokio::test]
async fn health_goes_down_after_repeated_auth_failures() {
    let server = three_messages();
    server.reject_login.store(true, Ordering::SeqCst);
    let config = test_config();
    let health_config = config.health;
    let h = Harness::new(config, server);
    let reporter = HealthReporter::new(
        h.service.session().clone(),
        h.service.subscribe_history(),
        health_config,
    );

    assert_eq!(reporter.sample().status, HealthStatus::Degraded);
    for _ in 0..health_config.down_after {
        h.service.run_cycle().await;
    }
    let sample = reporter.sample();
    assert_eq!(sample.status, HealthStatus::Down);
    assert!(!sample.session.connected);

    // Credentials fixed: the next good cycle brings it back up.
    h.server.reject_login.store(false, Ordering::SeqCst);
    assert!(h.service.run_cycle().await.outcome.is_completed());
    assert_eq!(reporter.sample().status, HealthStatus::Up);
}

#[tokio::test]
async fn libsql_store_backs_a_full_cycle() {
    let store = Arc::new(mail_ingest::store::LibSqlStore::new_memory().await.unwrap());
    let server = three_messages();
    let service = build_service(
        test_config(),
        &server,
        store.clone(),
        store.clone(),
        Arc::new(NoopClassifier),
    );

    let report = service.run_cycle().await;
    assert!(report.outcome.is_completed());
    assert_eq!(report.persisted, 3);

    let cancel = CancellationToken::new();
    assert_eq!(
        store.load_cursor("INBOX", &cancel).await.unwrap().unwrap().last_seen_uid,
        103
    );
    assert_eq!(store.find_unprocessed(10, &cancel).await.unwrap().len(), 3);
    assert_eq!(service.run_cycle().await.persisted, 0);
}
