//! Lease lifecycle under time: heartbeat renewal, loss detection, and
//! expiry reaping.

use std::time::Duration;

use chrono::Utc;

use ftl_controller::error::Error;
use ftl_controller::leases::{LeaseKey, Leaser, MIN_LEASE_TTL};
use ftl_controller::storage::Database;

/// The heartbeat keeps a lease alive well past its original TTL.
#[tokio::test(start_paused = true)]
async fn heartbeat_outlives_the_ttl() {
    let db = Database::new();
    let leaser = Leaser::new(db.clone());
    let key = LeaseKey::system(["scheduler"]);
    let handle = leaser
        .acquire(key.clone(), MIN_LEASE_TTL, None)
        .await
        .unwrap();

    // Three TTLs later the lease is still held and not expirable.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(leaser.expire_leases().await.unwrap(), 0);
    let err = leaser.acquire(key, MIN_LEASE_TTL, None).await.unwrap_err();
    assert!(matches!(err, Error::LeaseHeld { .. }));

    handle.release().await.unwrap();
}

/// Losing the lease row cancels the holder's context and surfaces the
/// loss on release.
#[tokio::test(start_paused = true)]
async fn losing_the_lease_cancels_the_holder() {
    let db = Database::new();
    let leaser = Leaser::new(db.clone());
    let key = LeaseKey::system(["scheduler"]);
    let handle = leaser
        .acquire(key.clone(), MIN_LEASE_TTL, None)
        .await
        .unwrap();
    let context = handle.context();

    // Another node reaped the row; the next heartbeat finds nothing.
    let mut tx = db.begin().await;
    tx.tables_mut().leases.remove(&key.to_string());
    tx.commit().unwrap();

    context.cancelled().await;
    let err = handle.release().await.unwrap_err();
    assert!(err.is_conflict());
}

/// Dropping a handle without release stops the heartbeat: nothing
/// renews the row, so it expires and the key becomes free again.
#[tokio::test(start_paused = true)]
async fn dropped_handle_lets_the_lease_expire() {
    let db = Database::new();
    let leaser = Leaser::new(db.clone());
    let key = LeaseKey::system(["abandoned"]);
    let handle = leaser
        .acquire(key.clone(), MIN_LEASE_TTL, None)
        .await
        .unwrap();
    drop(handle);

    // Several heartbeat periods pass; a surviving loop would renew.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let mut tx = db.begin().await;
    tx.tables_mut()
        .leases
        .get_mut(&key.to_string())
        .unwrap()
        .expires_at = Utc::now() - Duration::from_secs(1);
    tx.commit().unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(leaser.expire_leases().await.unwrap(), 1);
    let handle = leaser.acquire(key, MIN_LEASE_TTL, None).await.unwrap();
    handle.release().await.unwrap();
}

/// Expiry reaping removes only rows whose expiry has passed.
#[tokio::test]
async fn expire_leases_removes_only_stale_rows() {
    let db = Database::new();
    // Leaking handles leave their row behind on release.
    let leaser = Leaser::new(db.clone()).leaking();
    let key = LeaseKey::system(["stale"]);
    let handle = leaser
        .acquire(key.clone(), MIN_LEASE_TTL, None)
        .await
        .unwrap();
    handle.release().await.unwrap();

    // Still within its TTL.
    assert_eq!(leaser.expire_leases().await.unwrap(), 0);

    let mut tx = db.begin().await;
    let row = tx.tables_mut().leases.get_mut(&key.to_string()).unwrap();
    row.expires_at = Utc::now() - Duration::from_secs(1);
    tx.commit().unwrap();

    assert_eq!(leaser.expire_leases().await.unwrap(), 1);
    // The key is free again.
    let handle = leaser.acquire(key, MIN_LEASE_TTL, None).await.unwrap();
    handle.release().await.unwrap();
}

/// A lease re-acquired after expiry is never extended or deleted by
/// the previous holder.
#[tokio::test]
async fn stale_holder_cannot_touch_a_reacquired_lease() {
    let db = Database::new();
    let leaser = Leaser::new(db.clone());
    let key = LeaseKey::system(["contested"]);
    let first = leaser
        .acquire(key.clone(), MIN_LEASE_TTL, None)
        .await
        .unwrap();

    // Force expiry and reap, then a second holder takes the key.
    let mut tx = db.begin().await;
    tx.tables_mut()
        .leases
        .get_mut(&key.to_string())
        .unwrap()
        .expires_at = Utc::now() - Duration::from_secs(1);
    tx.commit().unwrap();
    assert_eq!(leaser.expire_leases().await.unwrap(), 1);
    let second = leaser
        .acquire(key.clone(), MIN_LEASE_TTL, None)
        .await
        .unwrap();

    // The first holder's release must not delete the second's row.
    let _ = first.release().await;
    let tx = db.begin().await;
    assert!(tx.tables().leases.contains_key(&key.to_string()));
    drop(tx);
    second.release().await.unwrap();
}
