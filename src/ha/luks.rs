//! LUKS encryption
//!
//! Wraps `cryptsetup` for at-rest encryption of replica devices. The key is
//! read from a Secret and handed to cryptsetup through a private key file
//! that lives only for the duration of one command.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::exec::{ExecParams, Executor};

/// Suffix of the device-mapper name of an opened volume
pub const ENCRYPT_MAPPER_SUFFIX: &str = "-encrypt";

/// Secret data key holding the passphrase
pub const SECRET_KEY_FIELD: &str = "key";

/// Device-mapper name of an opened volume
pub fn mapper_name(volume: &str) -> String {
    format!("{}{}", volume, ENCRYPT_MAPPER_SUFFIX)
}

/// Device path of an opened volume
pub fn mapper_path(volume: &str) -> String {
    format!("/dev/mapper/{}", mapper_name(volume))
}

/// cryptsetup driver
pub struct LuksManager {
    exec: Arc<dyn Executor>,
    key_dir: PathBuf,
}

impl LuksManager {
    /// `key_dir` must be visible to the executor's mount namespace
    pub fn new(exec: Arc<dyn Executor>, key_dir: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            key_dir: key_dir.into(),
        }
    }

    fn key_file(&self, volume: &str, key: &[u8]) -> Result<tempfile::NamedTempFile> {
        if key.is_empty() {
            return Err(Error::Encryption {
                volume: volume.to_string(),
                reason: "empty encryption key".into(),
            });
        }
        let mut file = tempfile::Builder::new()
            .prefix("luks-")
            .tempfile_in(&self.key_dir)?;
        file.write_all(key)?;
        file.flush()?;
        Ok(file)
    }

    /// Whether `device` carries a LUKS header
    pub async fn is_luks(&self, device: &str) -> Result<bool> {
        let params = ExecParams::new("cryptsetup").args(["isLuks", device]);
        let command = params.command_line();
        let res = self.exec.run(params).await;
        match res.exit_code {
            0 if res.error.is_none() => Ok(true),
            1 if res.error.is_none() => Ok(false),
            _ => res.check(&command).map(|_| false),
        }
    }

    /// Format `device` as LUKS unless it already is
    pub async fn encrypt_volume(&self, volume: &str, device: &str, key: &[u8]) -> Result<()> {
        if self.is_luks(device).await? {
            debug!("{} is already LUKS formatted", device);
            return Ok(());
        }
        let key_file = self.key_file(volume, key)?;
        self.exec
            .run_checked(ExecParams::new("cryptsetup").args([
                "-q".to_string(),
                "-s".to_string(),
                "512".to_string(),
                "luksFormat".to_string(),
                device.to_string(),
                key_file.path().to_string_lossy().to_string(),
            ]))
            .await?;
        info!(target: "audit", "Encrypted device {} of volume {}", device, volume);
        Ok(())
    }

    /// Open the mapping and return its device path
    pub async fn open_volume(&self, volume: &str, device: &str, key: &[u8]) -> Result<String> {
        let key_file = self.key_file(volume, key)?;
        let params = ExecParams::new("cryptsetup").args([
            "--allow-discards".to_string(),
            "luksOpen".to_string(),
            "-d".to_string(),
            key_file.path().to_string_lossy().to_string(),
            device.to_string(),
            mapper_name(volume),
        ]);
        let command = params.command_line();
        let res = self.exec.run(params).await;
        if !res.is_success() && !res.stderr.contains("already exists") {
            res.check(&command)?;
        }
        Ok(mapper_path(volume))
    }

    /// Close the mapping; an inactive mapping is not an error
    pub async fn close_volume(&self, volume: &str) -> Result<()> {
        let params = ExecParams::new("cryptsetup").args(["luksClose".to_string(), mapper_name(volume)]);
        let command = params.command_line();
        let res = self.exec.run(params).await;
        if !res.is_success() && !res.stderr.contains("not active") {
            res.check(&command)?;
        }
        Ok(())
    }

    /// Inverse of [`encrypt_volume`](Self::encrypt_volume): close, erase
    /// the key slots and wipe the header
    pub async fn decrypt_volume(&self, volume: &str, device: &str) -> Result<()> {
        self.close_volume(volume).await?;
        if !self.is_luks(device).await? {
            return Ok(());
        }
        self.exec
            .run_checked(ExecParams::new("cryptsetup").args(["-q", "luksErase", device]))
            .await?;
        self.exec
            .run_checked(ExecParams::new("wipefs").args(["-a", device]))
            .await?;
        info!(target: "audit", "Removed encryption from device {} of volume {}", device, volume);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockExecutor;
    use crate::exec::ExecResult;
    use assert_matches::assert_matches;

    fn manager(mock: Arc<MockExecutor>, dir: &tempfile::TempDir) -> LuksManager {
        LuksManager::new(mock, dir.path())
    }

    #[tokio::test]
    async fn test_encrypt_formats_plain_device() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutor::new());
        mock.on("cryptsetup isLuks", ExecResult::failure(1, ""));
        let luks = manager(mock.clone(), &dir);

        luks.encrypt_volume("pvc-1", "/dev/vg/pvc-1", b"secret").await.unwrap();
        assert!(mock.called("cryptsetup -q -s 512 luksFormat /dev/vg/pvc-1"));
        // key file is gone once the command finished
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_encrypt_skips_luks_device() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutor::new());
        mock.on("cryptsetup isLuks", ExecResult::success(""));
        let luks = manager(mock.clone(), &dir);

        luks.encrypt_volume("pvc-1", "/dev/vg/pvc-1", b"secret").await.unwrap();
        assert!(!mock.called("cryptsetup -q -s 512 luksFormat"));
    }

    #[tokio::test]
    async fn test_open_tolerates_existing_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutor::new());
        mock.on(
            "cryptsetup --allow-discards luksOpen",
            ExecResult::failure(5, "Device pvc-1-encrypt already exists."),
        );
        let luks = manager(mock, &dir);

        let path = luks.open_volume("pvc-1", "/dev/vg/pvc-1", b"secret").await.unwrap();
        assert_eq!(path, "/dev/mapper/pvc-1-encrypt");
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutor::new());
        mock.on("cryptsetup isLuks", ExecResult::failure(1, ""));
        let luks = manager(mock, &dir);

        assert_matches!(
            luks.encrypt_volume("pvc-1", "/dev/vg/pvc-1", b"").await,
            Err(Error::Encryption { .. })
        );
    }

    #[tokio::test]
    async fn test_decrypt_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutor::new());
        mock.on("cryptsetup luksClose", ExecResult::failure(4, "Device pvc-1-encrypt is not active."));
        let luks = manager(mock.clone(), &dir);

        luks.decrypt_volume("pvc-1", "/dev/vg/pvc-1").await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls[0], "cryptsetup luksClose pvc-1-encrypt");
        assert_eq!(calls[1], "cryptsetup isLuks /dev/vg/pvc-1");
        assert_eq!(calls[2], "cryptsetup -q luksErase /dev/vg/pvc-1");
        assert_eq!(calls[3], "wipefs -a /dev/vg/pvc-1");
    }
}
