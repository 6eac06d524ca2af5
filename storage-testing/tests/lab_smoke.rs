use storage_contracts::FilesystemOps;
use storage_sys::XfsFilesystem;
use storage_testing::fixtures::destructive_enabled;
use storage_testing::lab::LoopDevice;
use tokio_util::sync::CancellationToken;

const LAB_SIZE: u64 = 300 * 1024 * 1024;

#[tokio::test]
async fn formatted_loop_device_probes_back_its_uuid() {
    if !destructive_enabled() {
        eprintln!("SKIP set LOCALDRIVE_TESTING_ENABLE_DESTRUCTIVE=1 to run");
        return;
    }

    let device = LoopDevice::attach(LAB_SIZE).expect("attach loop device");
    let fs_uuid = uuid::Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();
    let xfs = XfsFilesystem::new(false);

    xfs.format(device.path(), &fs_uuid, true, &cancel)
        .await
        .expect("format loop device");
    let info = xfs.probe(device.path(), &cancel).await.expect("probe");

    assert_eq!(info.fs_uuid, fs_uuid);
    assert_eq!(info.fs_type, "xfs");
    assert_eq!(info.label, "LOCALDRIVE");
    assert!(info.total_bytes > 0 && info.total_bytes <= LAB_SIZE);
}
