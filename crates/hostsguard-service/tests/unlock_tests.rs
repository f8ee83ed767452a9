mod common;

use common::TestGuard;
use hostsguard_core::policy::Classification;
use hostsguard_core::schema::FileFormat;
use hostsguard_core::session::{self, EnforcementState, UnlockSession};
use hostsguard_core::GuardError;
use hostsguard_service::enforcement::attr::AttributeGuard;
use std::time::Instant;

const HOSTS: &[u8] = b"0.0.0.0 ads.example.com\n0.0.0.0 tracker.example.com\n";

#[test]
fn adding_a_blocked_domain_applies_immediately() {
    let guard = TestGuard::builder().lenient_delay_secs(60).build();
    guard.enforcer.enforce(&guard.file).unwrap();
    let flow = guard.flow();

    let started = Instant::now();
    let report = flow
        .unlock_with(&guard.file, |wc| {
            let mut content = std::fs::read(wc)?;
            content.extend_from_slice(b"0.0.0.0 malware.example.com\n");
            std::fs::write(wc, content)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(report.classification, Some(Classification::Stricter));
    assert_eq!(report.delayed_secs, 0);
    assert!(started.elapsed().as_secs() < 5, "stricter changes must not wait");

    let canonical = String::from_utf8(guard.canonical_content()).unwrap();
    assert!(canonical.contains("malware.example.com"));
    assert_eq!(guard.live_content(), guard.canonical_content());
    assert!(guard.enforcer.is_enforced(&guard.file));
    assert!(session::load_session(&guard.state_dir, "hosts").unwrap().is_none());
}

#[test]
fn removing_a_blocked_domain_waits_out_the_delay() {
    let guard = TestGuard::builder().lenient_delay_secs(2).build();
    guard.enforcer.enforce(&guard.file).unwrap();
    let flow = guard.flow();

    let started = Instant::now();
    let report = flow
        .unlock_with(&guard.file, |wc| {
            std::fs::write(wc, b"0.0.0.0 ads.example.com\n")?;
            Ok(())
        })
        .unwrap();

    assert_eq!(report.classification, Some(Classification::Lenient));
    assert_eq!(report.delayed_secs, 2);
    assert!(started.elapsed().as_secs() >= 2, "the delay is mandatory");

    let canonical = String::from_utf8(guard.canonical_content()).unwrap();
    assert!(!canonical.contains("tracker.example.com"));
    assert!(guard.enforcer.is_enforced(&guard.file));
}

#[test]
fn removals_dominate_additions_in_one_session() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();

    // One edit that both adds and removes entries: the net effect is
    // classified by its most permissive part.
    let report = guard
        .flow()
        .unlock_with(&guard.file, |wc| {
            std::fs::write(
                wc,
                b"0.0.0.0 ads.example.com\n0.0.0.0 malware.example.com\n",
            )?;
            Ok(())
        })
        .unwrap();

    assert_eq!(report.classification, Some(Classification::Lenient));
}

#[test]
fn earlier_shutdown_is_immediate_later_shutdown_waits() {
    let guard = TestGuard::builder()
        .format(FileFormat::KeyValue)
        .content(b"SHUTDOWN_HOUR=23\n")
        .lenient_delay_secs(1)
        .build();
    guard.enforcer.enforce(&guard.file).unwrap();
    let flow = guard.flow();

    let report = flow
        .unlock_with(&guard.file, |wc| {
            std::fs::write(wc, b"SHUTDOWN_HOUR=22\n")?;
            Ok(())
        })
        .unwrap();
    assert_eq!(report.classification, Some(Classification::Stricter));
    assert_eq!(report.delayed_secs, 0);
    assert_eq!(guard.canonical_content(), b"SHUTDOWN_HOUR=22\n");

    let started = Instant::now();
    let report = flow
        .unlock_with(&guard.file, |wc| {
            std::fs::write(wc, b"SHUTDOWN_HOUR=23\n")?;
            Ok(())
        })
        .unwrap();
    assert_eq!(report.classification, Some(Classification::Lenient));
    assert!(started.elapsed().as_secs() >= 1);
    assert_eq!(guard.canonical_content(), b"SHUTDOWN_HOUR=23\n");
    assert!(guard.enforcer.is_enforced(&guard.file));
}

#[test]
fn forbidden_change_aborts_the_whole_session() {
    let guard = TestGuard::builder()
        .format(FileFormat::KeyValue)
        .content(b"SHUTDOWN_HOUR=23\nWINDOW_END_HOUR=7\n")
        .build();
    guard.enforcer.enforce(&guard.file).unwrap();
    let canonical_before = guard.canonical_content();

    // SHUTDOWN_HOUR 23 -> 22 is stricter on its own, but it is bundled
    // with a forbidden widening, so nothing applies.
    let err = guard
        .flow()
        .unlock_with(&guard.file, |wc| {
            std::fs::write(wc, b"SHUTDOWN_HOUR=22\nWINDOW_END_HOUR=5\n")?;
            Ok(())
        })
        .unwrap_err();

    match err {
        GuardError::ForbiddenChange { field, .. } => assert_eq!(field, "WINDOW_END_HOUR"),
        other => panic!("expected ForbiddenChange, got {other}"),
    }
    assert_eq!(guard.canonical_content(), canonical_before);
    assert_eq!(guard.live_content(), canonical_before);
    assert!(guard.enforcer.is_enforced(&guard.file));
    assert!(guard.event_types().contains(&"UNLOCK_REJECTED".to_string()));
}

#[test]
fn rejected_edits_survive_in_the_working_copy() {
    let guard = TestGuard::builder()
        .format(FileFormat::KeyValue)
        .content(b"WINDOW_END_HOUR=7\n")
        .build();
    guard.enforcer.enforce(&guard.file).unwrap();

    let _ = guard
        .flow()
        .unlock_with(&guard.file, |wc| {
            std::fs::write(wc, b"WINDOW_END_HOUR=5\n")?;
            Ok(())
        })
        .unwrap_err();

    let copies: Vec<_> = std::fs::read_dir(&guard.work_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(copies.len(), 1);
    assert_eq!(std::fs::read(copies[0].path()).unwrap(), b"WINDOW_END_HOUR=5\n");
}

#[test]
fn untouched_working_copy_is_a_no_op() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();
    let canonical_before = guard.canonical_content();

    let report = guard.flow().unlock_with(&guard.file, |_| Ok(())).unwrap();

    assert_eq!(report.classification, None);
    assert!(report.changes.is_empty());
    assert_eq!(guard.canonical_content(), canonical_before);
    assert!(guard.enforcer.is_enforced(&guard.file));
}

#[test]
fn editor_failure_still_restores_protection() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();

    let err = guard
        .flow()
        .unlock_with(&guard.file, |_| {
            Err(GuardError::Io(std::io::Error::other("editor crashed")))
        })
        .unwrap_err();

    assert!(matches!(err, GuardError::Io(_)));
    assert!(guard.enforcer.is_enforced(&guard.file));
    assert!(session::load_session(&guard.state_dir, "hosts").unwrap().is_none());
}

#[test]
fn pending_delay_cannot_be_reset_by_a_second_unlock() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();

    // Countdown left behind by a process that died mid-delay.
    let mut pending = UnlockSession::open("hosts", None);
    pending.state = EnforcementState::ReApplying;
    pending.pid = (i32::MAX - 1) as u32;
    pending.not_before = Some(chrono::Utc::now() + chrono::Duration::seconds(30));
    session::save_session(&guard.state_dir, &pending).unwrap();

    let err = guard
        .flow()
        .unlock_with(&guard.file, |_| Ok(()))
        .unwrap_err();

    match err {
        GuardError::DelayPending { remaining_secs } => {
            assert!(remaining_secs > 0 && remaining_secs <= 30)
        }
        other => panic!("expected DelayPending, got {other}"),
    }
}

#[test]
fn concurrent_unlock_of_the_same_file_is_rejected() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();

    // Session owned by this (alive) process.
    let open = UnlockSession::open("hosts", None);
    session::save_session(&guard.state_dir, &open).unwrap();

    let err = guard
        .flow()
        .unlock_with(&guard.file, |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, GuardError::SessionOpen { .. }));
}

#[test]
fn trusted_caller_window_opens_and_adopts_on_enforce() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();
    let flow = guard.flow();

    flow.unlock_trusted(&guard.file, "pacman-hook").unwrap();
    assert!(!guard.attr.is_immutable(&guard.file.live_path));
    let open = session::load_session(&guard.state_dir, "hosts")
        .unwrap()
        .unwrap();
    assert_eq!(open.state, EnforcementState::Unlocked);
    assert_eq!(open.caller.as_deref(), Some("pacman-hook"));

    // The package manager rewrites the file while the window is open.
    std::fs::write(&guard.file.live_path, b"0.0.0.0 vendor-update.example.com\n").unwrap();

    assert!(flow.finalize_trusted_if_open(&guard.file).unwrap());
    guard.enforcer.enforce(&guard.file).unwrap();

    assert_eq!(
        guard.canonical_content(),
        b"0.0.0.0 vendor-update.example.com\n"
    );
    assert!(guard.enforcer.is_enforced(&guard.file));
    assert!(session::load_session(&guard.state_dir, "hosts").unwrap().is_none());
}

#[test]
fn unlock_cannot_steal_a_trusted_window() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();
    let flow = guard.flow();

    flow.unlock_trusted(&guard.file, "pacman-hook").unwrap();

    // The hook process is long gone; the window is still not stale.
    let mut open = session::load_session(&guard.state_dir, "hosts")
        .unwrap()
        .unwrap();
    open.pid = (i32::MAX - 1) as u32; // no such process
    session::save_session(&guard.state_dir, &open).unwrap();
    std::fs::write(&guard.file.live_path, b"127.0.0.1 localhost\n").unwrap();

    let err = flow
        .unlock_with(&guard.file, |_| Ok(()))
        .unwrap_err();
    assert!(matches!(err, GuardError::SessionOpen { .. }));
    assert_eq!(guard.live_content(), b"127.0.0.1 localhost\n");
    assert!(session::load_session(&guard.state_dir, "hosts")
        .unwrap()
        .is_some());
}

#[test]
fn unknown_callers_are_rejected() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();

    let err = guard
        .flow()
        .unlock_trusted(&guard.file, "random-script")
        .unwrap_err();
    assert!(matches!(err, GuardError::UntrustedCaller(_)));
    assert!(guard.enforcer.is_enforced(&guard.file));
}

#[test]
fn relock_aborts_an_open_session() {
    let guard = TestGuard::builder().build();
    guard.enforcer.enforce(&guard.file).unwrap();
    let flow = guard.flow();

    flow.unlock_trusted(&guard.file, "pacman-hook").unwrap();
    std::fs::write(&guard.file.live_path, b"half-written vendor file").unwrap();

    flow.relock(&guard.file).unwrap();

    assert!(session::load_session(&guard.state_dir, "hosts").unwrap().is_none());
    assert_eq!(guard.live_content(), guard.canonical_content());
    assert!(guard.enforcer.is_enforced(&guard.file));
    assert!(guard.event_types().contains(&"UNLOCK_ABORTED".to_string()));
}
