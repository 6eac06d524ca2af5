// SPDX-License-Identifier: GPL-3.0-only

//! XFS project quotas through `xfs_quota`

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use storage_types::{Quota, pretty_to_bytes};

use crate::command::run;
use crate::{Result, SysError};

const KIB: u64 = 1024;

/// Project id of a volume: the first four bytes of sha256(name), little-endian
pub fn project_id(volume_name: &str) -> u32 {
    let digest = Sha256::digest(volume_name.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Reads one report column. Bare numbers are 1 KiB blocks; suffixed values
/// (`-h` output such as `1.5G`) are base 1024.
fn parse_report_value(value: &str) -> Result<u64> {
    if value.bytes().all(|b| b.is_ascii_digit()) {
        let blocks: u64 = value
            .parse()
            .map_err(|e| SysError::Parse(format!("invalid quota value '{value}': {e}")))?;
        return Ok(blocks.saturating_mul(KIB));
    }
    pretty_to_bytes(value).map_err(|e| SysError::Parse(format!("invalid quota value '{value}': {e}")))
}

/// Extracts `#<id>  used  soft  hard  ...` from a project quota report
pub fn parse_quota_report(output: &str, project_id: u32) -> Result<Quota> {
    let key = format!("#{project_id}");

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&key.as_str()) {
            continue;
        }
        if fields.len() < 4 {
            return Err(SysError::Parse(format!("short quota report line '{line}'")));
        }
        return Ok(Quota {
            current_space: parse_report_value(fields[1])?,
            soft_limit: parse_report_value(fields[2])?,
            hard_limit: parse_report_value(fields[3])?,
        });
    }

    Err(SysError::NotFound(format!("xfs project {project_id}")))
}

fn quota_failed(err: SysError) -> SysError {
    match err {
        SysError::CommandFailed { command, stderr } => {
            SysError::QuotaFailed(format!("{command}: {stderr}"))
        }
        other => other,
    }
}

pub async fn get_quota(device: &str, volume_name: &str, cancel: &CancellationToken) -> Result<Quota> {
    let args = vec![
        "-x".to_string(),
        "-c".to_string(),
        "report -p -N -b".to_string(),
        device.to_string(),
    ];
    let output = run("xfs_quota", &args, cancel).await.map_err(quota_failed)?;
    parse_quota_report(&output, project_id(volume_name))
}

/// Assigns the volume's project id to `path` and applies the limits.
///
/// Does nothing when the project already has a quota.
pub async fn set_quota(
    device: &str,
    path: &str,
    volume_name: &str,
    quota: Quota,
    cancel: &CancellationToken,
) -> Result<()> {
    match get_quota(device, volume_name, cancel).await {
        Ok(_) => return Ok(()),
        Err(SysError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }

    let id = project_id(volume_name);
    tracing::debug!(project_id = id, path, "setting project quota");

    let project = vec![
        "-x".to_string(),
        "-c".to_string(),
        format!("project -d 0 -s -p {path} {id}"),
        device.to_string(),
    ];
    run("xfs_quota", &project, cancel).await.map_err(quota_failed)?;

    let limit = vec![
        "-x".to_string(),
        "-c".to_string(),
        format!(
            "limit -p bsoft={}k bhard={}k {id}",
            quota.soft_limit.div_ceil(KIB),
            quota.hard_limit.div_ceil(KIB)
        ),
        device.to_string(),
    ];
    run("xfs_quota", &limit, cancel).await.map_err(quota_failed)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_stable() {
        let id = project_id("pvc-0f1e2d3c");
        assert_eq!(id, project_id("pvc-0f1e2d3c"));
        assert_ne!(id, project_id("pvc-0f1e2d3d"));

        let digest = Sha256::digest(b"vol-1");
        assert_eq!(
            project_id("vol-1"),
            u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
        );
    }

    #[test]
    fn parses_block_report() {
        let report = "\
#0                0          0          0     00 [--------]
#1234        204800    1048576    1048576     00 [--------]
#99              12         0          0     00 [--------]
";
        let quota = parse_quota_report(report, 1234).expect("project present");
        assert_eq!(quota.current_space, 204_800 * 1024);
        assert_eq!(quota.soft_limit, 1_073_741_824);
        assert_eq!(quota.hard_limit, 1_073_741_824);
    }

    #[test]
    fn parses_human_readable_report() {
        let report = "#4242   512M   1.5G   2G  00 [------]\n";
        let quota = parse_quota_report(report, 4242).expect("project present");
        assert_eq!(quota.current_space, 536_870_912);
        assert_eq!(quota.soft_limit, 1_610_612_736);
        assert_eq!(quota.hard_limit, 2_147_483_648);
    }

    #[test]
    fn missing_project_is_not_found() {
        let report = "#12345  0  0  0  00 [------]\n";
        assert!(matches!(parse_quota_report(report, 1234), Err(SysError::NotFound(_))));
        assert!(matches!(parse_quota_report("", 1), Err(SysError::NotFound(_))));
    }

    #[test]
    fn limits_round_trip_through_report() {
        let soft = 5 * 1024 * 1024 * 1024u64;
        let report = format!("#7 0 {} {} 00 [------]\n", soft.div_ceil(KIB), soft.div_ceil(KIB));
        let quota = parse_quota_report(&report, 7).expect("project present");
        assert_eq!((quota.soft_limit, quota.hard_limit), (soft, soft));
    }
}
