//! Locker persistence and compare-and-set transitions.

use locker_core::{KioskId, LockerId, LockerStatus, Owner, OwnerType};
use locker_storage::{Database, LockerRepository, SqliteLockerRepository, StorageError};

fn kiosk() -> KioskId {
    KioskId::new("k1").unwrap()
}

fn locker(id: u16) -> LockerId {
    LockerId::new(id).unwrap()
}

fn card(id: &str) -> Owner {
    Owner::new(OwnerType::Rfid, id)
}

async fn setup(count: u16) -> (Database, SqliteLockerRepository) {
    let db = Database::in_memory().await.unwrap();
    let repo = SqliteLockerRepository::new(db.pool().clone());
    repo.provision(&kiosk(), count).await.unwrap();
    (db, repo)
}

#[tokio::test]
async fn test_provision_is_additive() {
    let (_db, repo) = setup(4).await;

    assert_eq!(repo.provision(&kiosk(), 6).await.unwrap(), 2);
    assert_eq!(repo.provision(&kiosk(), 6).await.unwrap(), 0);

    let lockers = repo.list(&kiosk()).await.unwrap();
    assert_eq!(lockers.len(), 6);
    assert!(lockers.iter().all(|l| l.status == LockerStatus::Free));
    assert!(lockers.iter().all(|l| l.owner.is_none()));
    assert_eq!(lockers[0].locker_id, locker(1));
}

#[tokio::test]
async fn test_provision_rejects_bad_count() {
    let (_db, repo) = setup(1).await;
    assert!(matches!(
        repo.provision(&kiosk(), 0).await,
        Err(StorageError::Validation(_))
    ));
    assert!(matches!(
        repo.provision(&kiosk(), 3953).await,
        Err(StorageError::Validation(_))
    ));
}

#[tokio::test]
async fn test_assign_and_release() {
    let (_db, repo) = setup(4).await;
    let owner = card("04ABCDEF");

    let owned = repo
        .transition(&kiosk(), locker(2), LockerStatus::Free, LockerStatus::Owned, Some(&owner))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(owned.status, LockerStatus::Owned);
    assert!(owned.is_owned_by(&owner));
    assert!(owned.assigned_at.is_some());

    // Opening keeps the owner and the assignment time.
    let opening = repo
        .transition(&kiosk(), locker(2), LockerStatus::Owned, LockerStatus::Opening, None)
        .await
        .unwrap()
        .unwrap();
    assert!(opening.is_owned_by(&owner));
    assert_eq!(opening.assigned_at, owned.assigned_at);

    let found = repo.find_by_owner(&kiosk(), &owner).await.unwrap().unwrap();
    assert_eq!(found.locker_id, locker(2));

    let free = repo
        .transition(&kiosk(), locker(2), LockerStatus::Opening, LockerStatus::Free, None)
        .await
        .unwrap()
        .unwrap();
    assert!(free.owner.is_none());
    assert!(free.assigned_at.is_none());
    assert!(repo.find_by_owner(&kiosk(), &owner).await.unwrap().is_none());
}

#[tokio::test]
async fn test_transition_is_compare_and_set() {
    let (_db, repo) = setup(2).await;
    let first = card("AAA111");
    let second = card("BBB222");

    assert!(
        repo.transition(&kiosk(), locker(1), LockerStatus::Free, LockerStatus::Owned, Some(&first))
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        repo.transition(&kiosk(), locker(1), LockerStatus::Free, LockerStatus::Owned, Some(&second))
            .await
            .unwrap()
            .is_none()
    );

    let stored = repo.get(&kiosk(), locker(1)).await.unwrap().unwrap();
    assert!(stored.is_owned_by(&first));
}

#[tokio::test]
async fn test_owner_required_for_owned_status() {
    let (_db, repo) = setup(1).await;
    let error = repo
        .transition(&kiosk(), locker(1), LockerStatus::Free, LockerStatus::Owned, None)
        .await
        .unwrap_err();
    assert!(matches!(error, StorageError::Database(_)));

    let stored = repo.get(&kiosk(), locker(1)).await.unwrap().unwrap();
    assert_eq!(stored.status, LockerStatus::Free);
}

#[tokio::test]
async fn test_list_by_status() {
    let (_db, repo) = setup(3).await;
    repo.transition(&kiosk(), locker(3), LockerStatus::Free, LockerStatus::Blocked, None)
        .await
        .unwrap();

    let free: Vec<u16> = repo
        .list_by_status(&kiosk(), LockerStatus::Free)
        .await
        .unwrap()
        .iter()
        .map(|l| l.locker_id.get())
        .collect();
    assert_eq!(free, vec![1, 2]);

    let blocked = repo
        .list_by_status(&kiosk(), LockerStatus::Blocked)
        .await
        .unwrap();
    assert_eq!(blocked.len(), 1);
}

#[tokio::test]
async fn test_kiosks_are_isolated() {
    let (_db, repo) = setup(2).await;
    let other = KioskId::new("k2").unwrap();

    assert!(repo.get(&other, locker(1)).await.unwrap().is_none());
    assert!(
        repo.transition(&other, locker(1), LockerStatus::Free, LockerStatus::Blocked, None)
            .await
            .unwrap()
            .is_none()
    );
}
