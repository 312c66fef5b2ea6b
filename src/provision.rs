//! Provisioning helpers
//!
//! Filesystem legwork performed before a container starts: tenant
//! subvolume mounts, config-file materialization with ownership and
//! permissions, log-shipper configuration, and operator bind-mount
//! assembly.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::unistd::{chown, Gid, Group, Uid, User};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{ConfigFile, LogConfig, ServiceVolume};

/// Mode applied to tenant resource paths
const RESOURCE_PATH_MODE: u32 = 0o770;

/// Container-side path of the materialized log-shipper configuration
pub const LOG_SHIPPER_CONF: &str = "/etc/quay/log-shipper.conf";

/// Mounts named volumes under a base directory
///
/// Production drivers (btrfs, devicemapper) live outside this crate; the
/// [`LocalDriver`] maps a mount to a plain directory.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Mount (or re-use) the volume `name` under `base`, returning its path
    async fn mount(&self, name: &str, base: &Path) -> Result<PathBuf>;
}

/// Directory-backed volume driver
#[derive(Debug, Default)]
pub struct LocalDriver;

#[async_trait]
impl VolumeDriver for LocalDriver {
    async fn mount(&self, name: &str, base: &Path) -> Result<PathBuf> {
        let path = base.join(name);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::io("subvolume", e))?;
        Ok(path)
    }
}

/// Resolve the tenant subvolume for a service
///
/// Mounts `<var_path>/volumes/<pool_id>` and then `…/<tenant_id>`; the
/// returned path is stable per tenant.
pub async fn subvolume(
    driver: &dyn VolumeDriver,
    var_path: &Path,
    pool_id: &str,
    tenant_id: &str,
) -> Result<PathBuf> {
    let base = var_path.join("volumes");
    let pool = driver.mount(pool_id, &base).await?;
    driver.mount(tenant_id, &pool).await
}

/// Create a volume's resource path under the tenant subvolume
///
/// The directory is created mode 0770 and chowned to the volume's owner
/// when one is declared; ownership failures are logged, not fatal.
pub fn prepare_resource_path(subvolume: &Path, volume: &ServiceVolume) -> Result<PathBuf> {
    let resource = subvolume.join(&volume.resource_path);
    fs::create_dir_all(&resource).map_err(|e| Error::io("resource-path", e))?;
    fs::set_permissions(&resource, fs::Permissions::from_mode(RESOURCE_PATH_MODE))
        .map_err(|e| Error::io("resource-path", e))?;
    if !volume.owner.is_empty() {
        if let Err(e) = apply_owner(&resource, &volume.owner) {
            warn!(
                path = %resource.display(),
                owner = %volume.owner,
                error = %e,
                "could not chown resource path"
            );
        }
    }
    Ok(resource)
}

/// Write a config file to a uniquely-named temp file and set its
/// ownership and mode
///
/// The file is named `cp_<service_id>_<slashified_filename>_<random>`.
/// A failing chown is logged and tolerated; a failing chmod is not.
pub fn materialize_config(
    service_id: &str,
    filename: &str,
    config: &ConfigFile,
) -> Result<PathBuf> {
    let prefix = format!("cp_{}_{}_", service_id, filename.replace('/', "__"));
    let file = tempfile::Builder::new()
        .prefix(&prefix)
        .tempfile()
        .map_err(|e| Error::io("config-file", e))?;
    fs::write(file.path(), &config.content).map_err(|e| Error::io("config-file", e))?;
    let (_, path) = file.keep().map_err(|e| Error::io("config-file", e.error))?;

    if !config.permissions.is_empty() {
        let mode = parse_mode(&config.permissions)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::io("config-file", e))?;
    }
    if !config.owner.is_empty() {
        if let Err(e) = apply_owner(&path, &config.owner) {
            warn!(
                service = %service_id,
                file = %filename,
                owner = %config.owner,
                error = %e,
                "could not chown config file"
            );
        }
    }
    debug!(service = %service_id, file = %filename, path = %path.display(), "config file materialized");
    Ok(path)
}

/// Materialize the log-shipper configuration for a service's log files
///
/// Returns the host path of the config plus the bind mount that puts it
/// at [`LOG_SHIPPER_CONF`] inside the container.
pub fn write_log_shipper_config(
    service_id: &str,
    log_configs: &[LogConfig],
) -> Result<(PathBuf, Vec<String>)> {
    let files: Vec<_> = log_configs
        .iter()
        .map(|lc| json!({ "path": lc.path, "type": lc.log_type }))
        .collect();
    let content = serde_json::to_string_pretty(&json!({ "files": files }))
        .map_err(|e| Error::serialization("log-shipper-config", e))?;
    let config = ConfigFile {
        content,
        owner: String::new(),
        permissions: "0644".to_string(),
    };
    let path = materialize_config(service_id, "log_shipper_conf", &config)?;
    let binds = vec![format!("{}:{}", path.display(), LOG_SHIPPER_CONF)];
    Ok((path, binds))
}

/// Filter operator bind mounts down to those for one image
///
/// Entries have the form `<image>:<host_path>:<container_path>`;
/// malformed entries are dropped with a warning.
pub fn assemble_bind_mounts(requested: &[String], image_id: &str) -> Vec<String> {
    let mut binds = Vec::new();
    for entry in requested {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 3 {
            warn!(entry = %entry, "ignoring malformed bind mount");
            continue;
        }
        if parts[0] == image_id {
            binds.push(format!("{}:{}", parts[1], parts[2]));
        }
    }
    binds
}

/// Whether an owner spec is in `user:group` form
pub fn valid_owner_spec(owner: &str) -> bool {
    let parts: Vec<&str> = owner.split(':').collect();
    parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty()
}

/// Chown a path to a `user:group` spec
///
/// Numeric ids are used directly; names are resolved against the local
/// user database.
fn apply_owner(path: &Path, owner: &str) -> Result<()> {
    if !valid_owner_spec(owner) {
        return Err(Error::fatal(format!("unsupported owner spec: {}", owner)));
    }
    let (user, group) = owner.split_once(':').expect("validated above");
    let uid = resolve_uid(user)?;
    let gid = resolve_gid(group)?;
    chown(path, Some(uid), Some(gid))
        .map_err(|e| Error::io("chown", std::io::Error::other(e)))?;
    Ok(())
}

fn resolve_uid(user: &str) -> Result<Uid> {
    if let Ok(raw) = user.parse::<u32>() {
        return Ok(Uid::from_raw(raw));
    }
    match User::from_name(user) {
        Ok(Some(entry)) => Ok(entry.uid),
        Ok(None) => Err(Error::fatal(format!("unknown user: {}", user))),
        Err(e) => Err(Error::io("user-lookup", std::io::Error::other(e))),
    }
}

fn resolve_gid(group: &str) -> Result<Gid> {
    if let Ok(raw) = group.parse::<u32>() {
        return Ok(Gid::from_raw(raw));
    }
    match Group::from_name(group) {
        Ok(Some(entry)) => Ok(entry.gid),
        Ok(None) => Err(Error::fatal(format!("unknown group: {}", group))),
        Err(e) => Err(Error::io("group-lookup", std::io::Error::other(e))),
    }
}

/// Parse an octal mode string like `"0644"`
fn parse_mode(permissions: &str) -> Result<u32> {
    u32::from_str_radix(permissions.trim_start_matches("0o"), 8)
        .map_err(|_| Error::fatal(format!("invalid permission spec: {}", permissions)))
}
