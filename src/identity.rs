//! Geräte-Identität
//!
//! Stabile Device ID, die beim ersten Start erzeugt und danach aus dem
//! App-Datenverzeichnis geladen wird:
//! - Windows: `%APPDATA%/pulse/endpoint/data/device-id`
//! - macOS: `~/Library/Application Support/dev.pulse.endpoint/device-id`
//! - Linux: `~/.local/share/endpoint/device-id`

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

const DEVICE_ID_FILE: &str = "device-id";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Failed to access device id file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not determine app data directory")]
    NoDataDirectory,

    #[error("Device id file is empty: {0}")]
    Empty(PathBuf),
}

// ============================================================================
// DEVICE IDENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    /// Lädt die Device ID aus dem App-Datenverzeichnis oder legt sie an
    pub fn load_or_create() -> Result<Self, IdentityError> {
        let proj_dirs = directories::ProjectDirs::from("dev", "pulse", "endpoint")
            .ok_or(IdentityError::NoDataDirectory)?;
        Self::load_or_create_in(proj_dirs.data_dir())
    }

    /// Wie [`load_or_create`](Self::load_or_create), aber in `dir`
    pub fn load_or_create_in(dir: &Path) -> Result<Self, IdentityError> {
        let path = dir.join(DEVICE_ID_FILE);

        if path.exists() {
            tracing::info!("Loading device id from {:?}", path);
            let device_id = fs::read_to_string(&path)?.trim().to_string();
            if device_id.is_empty() {
                return Err(IdentityError::Empty(path));
            }
            return Ok(Self { device_id });
        }

        tracing::info!("Creating new device id at {:?}", path);
        let identity = Self::new(Uuid::new_v4().to_string());
        identity.save_to_file(&path)?;
        Ok(identity)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn save_to_file(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &self.device_id)?;

        // Nur Owner kann lesen/schreiben
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();

        let first = DeviceIdentity::load_or_create_in(dir.path()).unwrap();
        let second = DeviceIdentity::load_or_create_in(dir.path()).unwrap();

        assert_eq!(first, second);
        assert!(Uuid::parse_str(first.device_id()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_device_id_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();

        DeviceIdentity::load_or_create_in(&dir.path().join("nested")).unwrap();

        let mode = fs::metadata(dir.path().join("nested").join(DEVICE_ID_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DEVICE_ID_FILE), "  \n").unwrap();

        assert!(matches!(
            DeviceIdentity::load_or_create_in(dir.path()),
            Err(IdentityError::Empty(_))
        ));
    }
}
