mod common;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use common::*;
use tracing_subscriber::layer::SubscriberExt;
use txtree_transaction::{
    Callback, CallbackMode, CallbackOptions, TransactionError, TransactionStatus,
};

// ========== DISPATCH ORDER ==========

#[test]
fn test_rollback_dispatch_order() {
    let f = fixture();
    let log = EventLog::default();
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    for (mode, label) in [
        (CallbackMode::AFTER, "after"),
        (CallbackMode::AFTER_MASTER, "after-master"),
        (CallbackMode::AFTER_MASTER_ROLLBACK, "after-master-rollback"),
        (CallbackMode::AFTER_ROLLBACK, "after-rollback"),
        (CallbackMode::BEFORE_MASTER_ROLLBACK, "before-master-rollback"),
        (CallbackMode::BEFORE_MASTER, "before-master"),
        (CallbackMode::BEFORE_ROLLBACK, "before-rollback"),
        (CallbackMode::BEFORE, "before"),
        (CallbackMode::AFTER_COMMIT, "after-commit"),
    ] {
        m.on(mode, log.recorder(label)).unwrap();
    }
    f.registry.rollback(m_guard).unwrap();

    let expected: Vec<_> = [
        "before",
        "before-rollback",
        "before-master",
        "before-master-rollback",
        "after-rollback",
        "after-master-rollback",
        "after-master",
        "after",
    ]
    .iter()
    .map(|label| format!("{label}:{}", m.id()))
    .collect();
    assert_eq!(log.events(), expected);
}

#[test]
fn test_nested_save_dispatch() {
    let f = fixture();
    let log = EventLog::default();
    let (_m, _m_guard) = f.registry.begin(&f.kind).unwrap();
    let (a, a_guard) = f.registry.begin(&f.kind).unwrap();
    a.on(CallbackMode::BEFORE_SAVE, log.recorder("before-save")).unwrap();
    a.on(CallbackMode::AFTER_SAVE, log.recorder("after-save")).unwrap();
    a.on(CallbackMode::AFTER_COMMIT, log.recorder("after-commit")).unwrap();

    f.registry.commit(a_guard).unwrap();
    assert_eq!(log.events(), vec![
        format!("before-save:{}", a.id()),
        format!("after-save:{}", a.id())
    ]);
    // a saved transaction can still be rolled back, but no longer saved
    assert!(matches!(
        a.on(CallbackMode::AFTER_SAVE, |_| {}),
        Err(TransactionError::UnreachableMode { .. })
    ));
    assert!(a.on(CallbackMode::AFTER_ROLLBACK, |_| {}).is_ok());
}

#[test]
fn test_before_commit_runs_on_saved_descendants() {
    let f = fixture();
    let log = EventLog::default();
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    let (saved, saved_guard) = f.registry.begin(&f.kind).unwrap();
    saved.on(CallbackMode::BEFORE_COMMIT, log.recorder("before-commit")).unwrap();
    f.registry.commit(saved_guard).unwrap();
    let (rolled_back, rb_guard) = f.registry.begin(&f.kind).unwrap();
    rolled_back
        .on(CallbackMode::BEFORE_COMMIT, log.recorder("before-commit"))
        .unwrap();
    f.registry.rollback(rb_guard).unwrap();
    m.on(CallbackMode::BEFORE_COMMIT, log.recorder("before-commit")).unwrap();

    f.registry.commit(m_guard).unwrap();
    assert_eq!(log.events(), vec![
        format!("before-commit:{}", saved.id()),
        format!("before-commit:{}", m.id())
    ]);
}

#[test]
fn test_master_relative_callbacks_follow_the_master() {
    let f = fixture();
    let log = EventLog::default();
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    let (a, a_guard) = f.registry.begin(&f.kind).unwrap();
    a.on(CallbackMode::AFTER_MASTER_COMMIT, log.recorder("master-commit")).unwrap();
    a.on(CallbackMode::AFTER_MASTER_ROLLBACK, log.recorder("master-rollback")).unwrap();
    a.on(CallbackMode::AFTER_COMMIT, log.recorder("commit")).unwrap();

    // the nested transaction fails, the master still commits
    f.registry.rollback(a_guard).unwrap();
    assert_eq!(a.status(), TransactionStatus::RolledBack);
    f.registry.commit(m_guard).unwrap();

    assert_eq!(m.status(), TransactionStatus::Committed);
    assert_eq!(log.events(), vec![format!("master-commit:{}", a.id())]);
}

#[test]
fn test_callback_registered_during_dispatch_for_later_phase() {
    let f = fixture();
    let log = EventLog::default();
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    let inner_log = log.clone();
    m.on(CallbackMode::BEFORE_COMMIT, move |txn| {
        txn.on(CallbackMode::AFTER_COMMIT, inner_log.recorder("late"))
            .unwrap();
    })
    .unwrap();
    f.registry.commit(m_guard).unwrap();
    assert_eq!(log.events(), vec![format!("late:{}", m.id())]);
}

#[test]
fn test_removed_callback_does_not_fire() {
    let f = fixture();
    let log = EventLog::default();
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    let handle = m.on(CallbackMode::AFTER, log.recorder("after")).unwrap();
    assert_eq!(handle.mode(), CallbackMode::AFTER);
    assert!(m.callbacks().remove(handle));
    f.registry.commit(m_guard).unwrap();
    assert!(log.events().is_empty());
}

#[test]
fn test_unreachable_callback_is_not_stored() {
    let f = fixture();
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    f.registry.rollback(m_guard).unwrap();

    assert!(matches!(
        m.on(CallbackMode::AFTER_COMMIT, |_| {}),
        Err(TransactionError::UnreachableMode {
            status: TransactionStatus::RolledBack,
            ..
        })
    ));
    assert!(m.callbacks().is_empty());
    assert!(m.callbacks().get(CallbackMode::AFTER_COMMIT).is_empty());
}

#[test]
fn test_invalid_mode_is_rejected() {
    let f = fixture();
    let (m, _guard) = f.registry.begin(&f.kind).unwrap();
    let mode = CallbackMode::AFTER_COMMIT.in_worker();
    assert_eq!(
        m.on(mode, |_| {}).unwrap_err(),
        TransactionError::InvalidMode(mode)
    );
}

// ========== DEFERRED CALLBACKS ==========

#[test]
fn test_in_worker_callback_runs_on_another_thread() {
    let f = fixture();
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    m.on(CallbackMode::AFTER_MASTER_COMMIT.in_worker(), move |txn| {
        let _ = tx.lock().send((txn.id(), thread::current().id()));
    })
    .unwrap();

    f.registry.commit(m_guard).unwrap();
    let (id, worker) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(id, m.id());
    assert_ne!(worker, thread::current().id());
}

#[test]
fn test_controller_and_shutdown_queues() {
    let f = fixture();
    let log = EventLog::default();
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    let (a, a_guard) = f.registry.begin(&f.kind).unwrap();
    a.on(CallbackMode::AFTER_MASTER.after_controller(), log.recorder("controller"))
        .unwrap();
    m.on(CallbackMode::AFTER_MASTER_ROLLBACK.in_shutdown(), log.recorder("shutdown"))
        .unwrap();
    m.on(CallbackMode::AFTER_MASTER_COMMIT.in_shutdown(), log.recorder("never"))
        .unwrap();
    f.registry.commit(a_guard).unwrap();
    f.registry.rollback(m_guard).unwrap();
    assert!(log.events().is_empty());

    assert_eq!(f.registry.run_controller_deferred(), 1);
    assert_eq!(log.events(), vec![format!("controller:{}", a.id())]);
    assert_eq!(f.registry.run_controller_deferred(), 0);

    assert_eq!(f.registry.shutdown(), 1);
    assert_eq!(log.events().last(), Some(&format!("shutdown:{}", m.id())));
}

// ========== CONTEXT PRESERVATION ==========

fn current_span_name() -> Option<&'static str> {
    tracing::Span::current().metadata().map(|m| m.name())
}

#[test]
fn test_callback_reenters_registration_span() {
    let subscriber = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new("trace"));
    let _default = tracing::subscriber::set_default(subscriber);

    let f = fixture();
    let (tx, rx) = mpsc::channel();
    let (m, m_guard) = f.registry.begin(&f.kind).unwrap();
    {
        let span = tracing::info_span!("request");
        let _entered = span.enter();
        let preserved = parking_lot::Mutex::new(tx.clone());
        m.on(CallbackMode::AFTER_COMMIT, move |_| {
            let _ = preserved.lock().send(("preserved", current_span_name()));
        })
        .unwrap();
        let plain = parking_lot::Mutex::new(tx);
        m.add_callback(
            Callback::new(move |_| {
                let _ = plain.lock().send(("plain", current_span_name()));
            }),
            CallbackMode::AFTER_COMMIT,
            CallbackOptions {
                preserve_context: false,
                ..CallbackOptions::default()
            },
        )
        .unwrap();
    }
    assert_eq!(current_span_name(), None);

    f.registry.commit(m_guard).unwrap();
    let seen: Vec<_> = rx.try_iter().collect();
    assert_eq!(seen, vec![("preserved", Some("request")), ("plain", None)]);
}
