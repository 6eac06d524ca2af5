mod common;

use storage_contracts::ErrorKind;
use storage_testing::HostOp;
use storage_testing::fixtures::{GIB, disk};
use storage_types::labels::volume_finalizer;
use storage_types::{Drive, DriveState, Quota};

use common::Harness;

fn path_in(h: &Harness, relative: &str) -> String {
    h.root.path().join(relative).display().to_string()
}

#[tokio::test]
async fn volume_mount_lifecycle() {
    let h = Harness::new([disk("sdb", 8, 16, 4 * GIB).build()]);
    let drive = h.adopt_only_drive().await;
    let staging = path_in(&h, "kubelet/staging/vol-1");
    let target = path_in(&h, "kubelet/pods/p1/vol-1");

    h.coordinator
        .stage(&drive, "vol-1", &staging, GIB, &h.cancel)
        .await
        .expect("stage");
    h.coordinator
        .stage(&drive, "vol-1", &staging, GIB, &h.cancel)
        .await
        .expect("second stage is a no-op");
    assert!(h.host.mounted(&staging));
    assert!(std::path::Path::new(&format!("{}/vol-1", drive.status.mountpoint)).is_dir());
    assert_eq!(h.host.quota("/dev/sdb", "vol-1"), Some(Quota::limits(GIB, GIB)));

    h.coordinator
        .publish(&staging, &target, true, &h.cancel)
        .await
        .expect("publish");
    let published = h
        .host
        .mounts()
        .into_iter()
        .find(|m| m.target == target)
        .expect("target mount");
    assert!(published.read_only);
    assert_eq!(published.source, staging);

    h.coordinator.unpublish(&target, &h.cancel).await.expect("unpublish");
    h.coordinator
        .unpublish(&target, &h.cancel)
        .await
        .expect("second unpublish is a no-op");
    h.coordinator.unstage(&staging, &h.cancel).await.expect("unstage");
    assert!(!h.host.mounted(&target));
    assert!(!h.host.mounted(&staging));
    assert_eq!(h.host.calls(HostOp::Unmount), vec![target, staging]);
    assert!(h.host.mounted(&drive.status.mountpoint));
}

#[tokio::test]
async fn staging_needs_a_mounted_drive() {
    let h = Harness::new([]);
    let staging = path_in(&h, "staging/vol-1");

    let err = h
        .coordinator
        .stage(&Drive::new("d1"), "vol-1", &staging, GIB, &h.cancel)
        .await
        .expect_err("unmounted drive");
    assert!(err.is(ErrorKind::MountFailure));
    assert!(h.host.calls(HostOp::BindMount).is_empty());
}

#[tokio::test]
async fn failed_unpublish_is_internal() {
    let h = Harness::new([disk("sdb", 8, 16, 4 * GIB).build()]);
    let drive = h.adopt_only_drive().await;
    let staging = path_in(&h, "staging/vol-1");
    let target = path_in(&h, "target/vol-1");
    h.coordinator
        .stage(&drive, "vol-1", &staging, GIB, &h.cancel)
        .await
        .expect("stage");
    h.coordinator
        .publish(&staging, &target, false, &h.cancel)
        .await
        .expect("publish");

    h.host.fail_next(HostOp::Unmount, "target is busy");
    let err = h
        .coordinator
        .unpublish(&target, &h.cancel)
        .await
        .expect_err("busy");
    assert!(err.is(ErrorKind::Internal));
    assert!(err.message.contains("target is busy"));
    assert!(h.host.mounted(&target));
}

#[tokio::test]
async fn claims_account_capacity() {
    let h = Harness::new([disk("sdb", 8, 16, 4 * GIB).build()]);
    let drive = h.adopt_only_drive().await;
    let name = drive.meta.name.as_str();
    assert_eq!(drive.status.free_capacity, 4 * GIB);

    let claimed = h.coordinator.claim(name, "vol-1", GIB, &h.cancel).await.expect("claim");
    assert_eq!(claimed.status.drive_status, DriveState::InUse);
    assert_eq!(claimed.status.allocated_capacity, GIB);
    assert_eq!(claimed.status.free_capacity, 3 * GIB);
    assert!(claimed.meta.has_finalizer(&volume_finalizer("vol-1")));

    let again = h.coordinator.claim(name, "vol-1", GIB, &h.cancel).await.expect("idempotent");
    assert_eq!(again.status.allocated_capacity, GIB);

    let err = h
        .coordinator
        .claim(name, "vol-2", 4 * GIB, &h.cancel)
        .await
        .expect_err("too large");
    assert!(err.is(ErrorKind::Conflict));

    h.reconcile().await;
    let reconciled = h.drive(name).await;
    assert_eq!(reconciled.status.drive_status, DriveState::InUse);
    assert_eq!(reconciled.status.free_capacity, 3 * GIB);

    let released = h.coordinator.release(name, "vol-1", GIB, &h.cancel).await.expect("release");
    assert_eq!(released.status.drive_status, DriveState::Ready);
    assert_eq!(released.status.allocated_capacity, 0);
    assert_eq!(released.status.free_capacity, 4 * GIB);
    assert!(!released.has_volumes());
}

#[tokio::test]
async fn candidates_cannot_host_volumes() {
    let h = Harness::new([disk("sdb", 8, 16, 4 * GIB).build()]);
    let name = h.reconcile().await.created.remove(0);

    let err = h
        .coordinator
        .claim(&name, "vol-1", GIB, &h.cancel)
        .await
        .expect_err("available drive");
    assert!(err.is(ErrorKind::Conflict));
    assert_eq!(h.drive(&name).await.status.allocated_capacity, 0);
}
