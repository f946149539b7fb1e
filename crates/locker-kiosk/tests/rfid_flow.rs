//! Card scans, locker selection and the opens they queue.

mod common;

use std::time::Duration;

use common::{Harness, card, locker};
use locker_core::{CommandStatus, ErrorKind, LockerStatus, Owner};
use locker_kiosk::{CardAction, KioskError, SessionConfig};

#[tokio::test]
async fn test_scan_select_and_rescan_releases() {
    let h = Harness::new(4).await;
    let dispatcher = h.dispatcher();
    let alice = card("04a1b2c3");

    let scan = h.service.handle_card(&h.kiosk, &alice).await.unwrap();
    assert_eq!(scan.action, CardAction::ShowLockers);
    assert_eq!(scan.timeout_seconds, 30);
    assert_eq!(
        scan.lockers.unwrap(),
        vec![locker(1), locker(2), locker(3), locker(4)]
    );
    let session_id = scan.session_id.unwrap();

    let selected = h
        .service
        .select_locker(&h.kiosk, &session_id, locker(2))
        .await
        .unwrap();
    assert_eq!(selected.locker_id, locker(2));
    assert_eq!(h.status(2).await, LockerStatus::Opening);
    assert!(!h.service.session_status(&h.kiosk).await.unwrap().has_session);

    assert_eq!(dispatcher.run_once().await.unwrap(), 1);
    let assigned = h.locker(2).await;
    assert_eq!(assigned.status, LockerStatus::Owned);
    assert_eq!(assigned.owner, Some(Owner::rfid(&alice)));
    assert_eq!(h.pulses(2), 1);

    let rescan = h.service.handle_card(&h.kiosk, &alice).await.unwrap();
    assert_eq!(rescan.action, CardAction::OpenLocker);
    assert_eq!(rescan.locker_id, Some(locker(2)));
    assert_eq!(rescan.timeout_seconds, 0);
    assert!(rescan.command_id.is_some());
    assert!(rescan.session_id.is_none());
    assert_eq!(h.status(2).await, LockerStatus::Opening);

    // A nervous second tap while the open is queued adds nothing.
    let again = h.service.handle_card(&h.kiosk, &alice).await.unwrap();
    assert_eq!(again.action, CardAction::OpenLocker);
    assert!(again.command_id.is_none());

    assert_eq!(dispatcher.run_once().await.unwrap(), 1);
    let released = h.locker(2).await;
    assert_eq!(released.status, LockerStatus::Free);
    assert!(released.owner.is_none());
    assert!(released.assigned_at.is_none());
    assert_eq!(h.pulses(2), 2);
}

#[tokio::test]
async fn test_rescan_before_first_open_still_releases() {
    let h = Harness::new(4).await;
    let alice = card("AAA111");

    let scan = h.service.handle_card(&h.kiosk, &alice).await.unwrap();
    let selected = h
        .service
        .select_locker(&h.kiosk, &scan.session_id.unwrap(), locker(2))
        .await
        .unwrap();

    // The owner changes their mind before the assign open has run.
    let rescan = h.service.handle_card(&h.kiosk, &alice).await.unwrap();
    assert_eq!(rescan.action, CardAction::OpenLocker);
    assert_eq!(rescan.locker_id, Some(locker(2)));
    let release_id = rescan.command_id.unwrap();
    assert_ne!(release_id, selected.command_id);

    let again = h.service.handle_card(&h.kiosk, &alice).await.unwrap();
    assert!(again.command_id.is_none());

    assert_eq!(h.dispatcher().run_once().await.unwrap(), 1);
    let released = h.locker(2).await;
    assert_eq!(released.status, LockerStatus::Free);
    assert!(released.owner.is_none());
    assert_eq!(h.pulses(2), 1);

    let assign = h.service.command(&selected.command_id).await.unwrap();
    assert_eq!(assign.status, CommandStatus::Cancelled);
    let release = h.service.command(&release_id).await.unwrap();
    assert_eq!(release.status, CommandStatus::Completed);
}

#[tokio::test]
async fn test_new_scan_supersedes_session() {
    let h = Harness::new(4).await;

    let first = h.service.handle_card(&h.kiosk, &card("AAA111")).await.unwrap();
    let second = h.service.handle_card(&h.kiosk, &card("BBB222")).await.unwrap();
    assert_ne!(first.session_id, second.session_id);

    let error = h
        .service
        .select_locker(&h.kiosk, &first.session_id.unwrap(), locker(1))
        .await
        .unwrap_err();
    assert!(matches!(error, KioskError::SessionExpired));
    assert_eq!(h.status(1).await, LockerStatus::Free);

    let status = h.service.session_status(&h.kiosk).await.unwrap();
    assert!(status.has_session);
    assert_eq!(status.session_id, second.session_id);
}

#[tokio::test]
async fn test_session_times_out() {
    let sessions = SessionConfig::default().with_timeout(Duration::from_secs(1));
    let h = Harness::with_sessions(4, sessions).await;

    let scan = h.service.handle_card(&h.kiosk, &card("AAA111")).await.unwrap();
    assert_eq!(scan.timeout_seconds, 1);
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let status = h.service.session_status(&h.kiosk).await.unwrap();
    assert!(!status.has_session);
    assert_eq!(status.remaining_seconds, 0);

    let error = h
        .service
        .select_locker(&h.kiosk, &scan.session_id.unwrap(), locker(1))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::SessionExpired);
}

#[tokio::test]
async fn test_failed_select_keeps_session() {
    let h = Harness::new(4).await;
    let scan = h.service.handle_card(&h.kiosk, &card("AAA111")).await.unwrap();
    let session_id = scan.session_id.unwrap();

    // Taken by an admin between the scan and the pick.
    h.service.block_locker(&h.kiosk, locker(1)).await.unwrap();
    let error = h
        .service
        .select_locker(&h.kiosk, &session_id, locker(1))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::AssignmentConflict);

    let error = h
        .service
        .select_locker(&h.kiosk, &session_id, locker(9))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidParameters);

    assert!(h.service.session_status(&h.kiosk).await.unwrap().has_session);
    h.service
        .select_locker(&h.kiosk, &session_id, locker(3))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_scan_without_free_lockers() {
    let h = Harness::new(2).await;
    h.service.block_locker(&h.kiosk, locker(1)).await.unwrap();
    h.service.block_locker(&h.kiosk, locker(2)).await.unwrap();

    let error = h
        .service
        .handle_card(&h.kiosk, &card("AAA111"))
        .await
        .unwrap_err();
    assert!(matches!(error, KioskError::NoLockersAvailable));
    assert!(!h.service.session_status(&h.kiosk).await.unwrap().has_session);
}

#[tokio::test]
async fn test_cancel_session() {
    let h = Harness::new(2).await;
    let scan = h.service.handle_card(&h.kiosk, &card("AAA111")).await.unwrap();

    assert!(h.service.cancel_session(&h.kiosk).await.unwrap());
    assert!(!h.service.cancel_session(&h.kiosk).await.unwrap());

    let error = h
        .service
        .select_locker(&h.kiosk, &scan.session_id.unwrap(), locker(1))
        .await
        .unwrap_err();
    assert!(matches!(error, KioskError::SessionExpired));
}

#[tokio::test]
async fn test_assignment_is_broadcast() {
    let h = Harness::new(2).await;
    let mut events = h.service.subscribe();
    let alice = card("AAA111");

    let scan = h.service.handle_card(&h.kiosk, &alice).await.unwrap();
    h.service
        .select_locker(&h.kiosk, &scan.session_id.unwrap(), locker(1))
        .await
        .unwrap();

    let assigned = events.recv().await.unwrap();
    assert_eq!(assigned.locker_id, locker(1));
    assert_eq!(assigned.from, LockerStatus::Free);
    assert_eq!(assigned.to, LockerStatus::Owned);
    assert_eq!(assigned.owner, Some(Owner::rfid(&alice)));

    let opening = events.recv().await.unwrap();
    assert_eq!(opening.to, LockerStatus::Opening);
}

#[tokio::test]
async fn test_unknown_kiosk_is_not_found() {
    let h = Harness::new(2).await;
    let other = locker_core::KioskId::new("basement").unwrap();

    let error = h.service.handle_card(&other, &card("AAA111")).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert!(h.service.health(&other).is_err());
}
