//! Device identity: a stable opaque id distinguishing walkers without accounts.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::{Result, WalkError};

/// Supplies the id progress records are keyed by.
pub trait DeviceIdentityProvider {
    fn device_id(&self) -> Result<String>;
}

/// Identity persisted in a file, generated on first use.
#[derive(Debug)]
pub struct FileDeviceIdentity {
    path: PathBuf,
    cached: OnceCell<String>,
}

impl FileDeviceIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_or_create(&self) -> Result<String> {
        let unavailable = |e: std::io::Error| WalkError::DeviceIdentityUnavailable {
            message: format!("{}: {}", self.path.display(), e),
        };

        match fs::read_to_string(&self.path) {
            Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable(e)),
        }

        let id = Uuid::new_v4().to_string();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(unavailable)?;
        }
        fs::write(&self.path, &id).map_err(unavailable)?;
        info!("[DeviceIdentity] Created new device id at {}", self.path.display());
        Ok(id)
    }
}

impl DeviceIdentityProvider for FileDeviceIdentity {
    fn device_id(&self) -> Result<String> {
        self.cached.get_or_try_init(|| self.read_or_create()).cloned()
    }
}

/// Fixed identity supplied by the host.
#[derive(Debug, Clone)]
pub struct StaticDeviceIdentity(pub String);

impl DeviceIdentityProvider for StaticDeviceIdentity {
    fn device_id(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_identity_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("device_id");

        let first = FileDeviceIdentity::new(&path).device_id().unwrap();
        assert!(Uuid::parse_str(&first).is_ok());
        assert!(path.exists());

        // A fresh provider reads the same id back
        let second = FileDeviceIdentity::new(&path).device_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_file_identity_reads_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_id");
        fs::write(&path, "  host-assigned-id\n").unwrap();

        let identity = FileDeviceIdentity::new(&path);
        assert_eq!(identity.device_id().unwrap(), "host-assigned-id");
    }

    #[test]
    fn test_file_identity_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be
        let identity = FileDeviceIdentity::new(dir.path());
        assert!(matches!(
            identity.device_id(),
            Err(WalkError::DeviceIdentityUnavailable { .. })
        ));
    }

    #[test]
    fn test_static_identity() {
        let identity = StaticDeviceIdentity("walker-7".to_string());
        assert_eq!(identity.device_id().unwrap(), "walker-7");
    }
}
