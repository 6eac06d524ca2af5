#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use storage_contracts::{Registry, list_all};
use storage_service::{
    Agent, AgentConfig, FormatService, LocalRegistry, ReconcileReport, Reconciler,
    VolumeCoordinator,
};
use storage_testing::fixtures::NODE;
use storage_testing::{FakeHost, RecordingRegistry};
use storage_types::{
    ConditionStatus, Device, Drive, DriveCondition, LabelSelector, RequestedFormat, Volume,
};

/// Agent wired to a fake host and in-memory registries, mounting under a temp dir
pub struct Harness {
    pub host: FakeHost,
    pub root: TempDir,
    pub config: Arc<AgentConfig>,
    pub drives: Arc<RecordingRegistry<Drive>>,
    pub volumes: Arc<RecordingRegistry<Volume>>,
    pub reconciler: Arc<Reconciler>,
    pub formatter: Arc<FormatService>,
    pub coordinator: VolumeCoordinator,
    pub agent: Agent,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        let root = tempfile::tempdir().expect("temp dir");
        let host = FakeHost::with_devices(devices);
        let shared = Arc::new(host.clone());
        let config = Arc::new(AgentConfig::for_node(NODE, root.path()));

        let drives = Arc::new(RecordingRegistry::<Drive>::new(Arc::new(
            LocalRegistry::<Drive>::in_memory(),
        )));
        let volumes = Arc::new(RecordingRegistry::<Volume>::new(Arc::new(
            LocalRegistry::<Volume>::in_memory(),
        )));

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&config),
            shared.clone(),
            shared.clone(),
            drives.clone(),
            volumes.clone(),
        ));
        let formatter = Arc::new(FormatService::new(
            Arc::clone(&config),
            shared.clone(),
            shared.clone(),
            shared.clone(),
            drives.clone(),
        ));
        let coordinator = VolumeCoordinator::new(shared.clone(), shared, drives.clone());
        let agent = Agent::new(
            Arc::clone(&config),
            Arc::clone(&reconciler),
            Arc::clone(&formatter),
            drives.clone(),
        );

        Self {
            host,
            root,
            config,
            drives,
            volumes,
            reconciler,
            formatter,
            coordinator,
            agent,
            cancel: CancellationToken::new(),
        }
    }

    pub fn mount_root(&self) -> String {
        self.config.mount_root()
    }

    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconciler
            .reconcile(&self.cancel)
            .await
            .expect("reconcile pass")
    }

    /// Reconcile plus any formats it asked for
    pub async fn sync(&self) -> ReconcileReport {
        self.agent.sync(&self.cancel).await.expect("sync pass")
    }

    pub async fn drive(&self, name: &str) -> Drive {
        self.drives.get(name).await.expect("drive record")
    }

    pub async fn all_drives(&self) -> Vec<Drive> {
        list_all::<Drive>(self.drives.as_ref(), &LabelSelector::everything(), 100)
            .await
            .expect("list drives")
    }

    /// Creates a record without counting the write
    pub async fn seed(&self, drive: Drive) -> Drive {
        let created = self.drives.create(drive).await.expect("seed drive");
        self.drives.reset();
        created
    }

    pub async fn seed_volume(&self, volume: Volume) -> Volume {
        let created = self.volumes.create(volume).await.expect("seed volume");
        self.volumes.reset();
        created
    }

    /// Operator sets `requestedFormat` on a drive
    pub async fn request_format(&self, name: &str, force: bool) {
        self.request_format_with(name, force, &[]).await;
    }

    pub async fn request_format_with(&self, name: &str, force: bool, mount_options: &[&str]) {
        let mut drive = self.drive(name).await;
        drive.spec.requested_format = Some(RequestedFormat {
            force,
            filesystem: "xfs".to_string(),
            mount_options: mount_options.iter().map(|o| o.to_string()).collect(),
            ..RequestedFormat::default()
        });
        self.drives.update(drive).await.expect("request format");
    }

    /// Creates the record for a single fresh device and formats it
    pub async fn adopt_only_drive(&self) -> Drive {
        let report = self.reconcile().await;
        assert_eq!(report.created.len(), 1, "expected exactly one new drive");
        let name = report.created[0].clone();
        self.request_format(&name, false).await;
        self.sync().await;
        self.drive(&name).await
    }
}

pub fn condition(drive: &Drive, kind: DriveCondition) -> ConditionStatus {
    drive.status.conditions.status(kind.as_str())
}

pub fn condition_message(drive: &Drive, kind: DriveCondition) -> String {
    drive
        .status
        .conditions
        .get(kind.as_str())
        .map(|c| c.message.clone())
        .unwrap_or_default()
}
