//! Environment-driven configuration.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use fsync_error::Result;
use serde::{Deserialize, Serialize};

/// Opt-in toggle; parsed like C `atoi`, nonzero enables.
pub const ENV_ENABLE: &str = "FSYNC";
/// Directory whose inode names the backing file.
pub const ENV_CONFIG_DIR: &str = "FSYNC_CONFIG_DIR";
/// Directory holding the backing file.
pub const ENV_SHM_DIR: &str = "FSYNC_SHM_DIR";

pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsyncConfig {
    pub enabled: bool,
    pub config_dir: PathBuf,
    pub shm_dir: PathBuf,
}

impl Default for FsyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_dir: PathBuf::from("."),
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
        }
    }
}

impl FsyncConfig {
    /// An enabled configuration rooted at explicit directories.
    #[must_use]
    pub fn enabled_at(config_dir: impl Into<PathBuf>, shm_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            config_dir: config_dir.into(),
            shm_dir: shm_dir.into(),
        }
    }

    /// Read [`ENV_ENABLE`], [`ENV_CONFIG_DIR`] and [`ENV_SHM_DIR`] from the
    /// process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Build a configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let defaults = Self::default();
        Self {
            enabled: lookup(ENV_ENABLE).is_some_and(|v| parse_toggle(&v)),
            config_dir: lookup(ENV_CONFIG_DIR)
                .filter(|v| !v.is_empty())
                .map_or(defaults.config_dir, PathBuf::from),
            shm_dir: lookup(ENV_SHM_DIR)
                .filter(|v| !v.is_empty())
                .map_or(defaults.shm_dir, PathBuf::from),
        }
    }

    /// File name of the backing file, derived from the config directory's
    /// inode.
    pub fn backing_file_name(&self) -> Result<String> {
        fsync_shm::backing_file_name(&self.config_dir)
    }

    /// Full path of the backing file.
    pub fn backing_path(&self) -> Result<PathBuf> {
        Ok(self.shm_dir.join(self.backing_file_name()?))
    }

    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

/// `atoi(value) != 0`: optional leading whitespace and sign, then digits up
/// to the first non-digit.
fn parse_toggle(value: &OsStr) -> bool {
    let Some(text) = value.to_str() else {
        return false;
    };
    let text = text.trim_start();
    let digits = text.strip_prefix(['+', '-']).unwrap_or(text);
    digits
        .chars()
        .take_while(char::is_ascii_digit)
        .any(|c| c != '0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), OsString::from(v)))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn toggle_parses_like_atoi() {
        for on in ["1", "2", "-1", "+7", "  1", "10abc", "007"] {
            assert!(parse_toggle(OsStr::new(on)), "{on:?} should enable");
        }
        for off in ["", "0", "00", "abc", "yes", "-0", " 0x1", "+"] {
            assert!(!parse_toggle(OsStr::new(off)), "{off:?} should not enable");
        }
    }

    #[test]
    fn absent_variables_give_defaults() {
        let config = FsyncConfig::from_lookup(lookup(&[]));
        assert_eq!(config, FsyncConfig::default());
        assert!(!config.enabled);
        assert_eq!(config.shm_dir, Path::new("/dev/shm"));
    }

    #[test]
    fn variables_override_defaults() {
        let config = FsyncConfig::from_lookup(lookup(&[
            ("FSYNC", "1"),
            ("FSYNC_CONFIG_DIR", "/tmp/prefix"),
            ("FSYNC_SHM_DIR", "/run/shm"),
        ]));
        assert!(config.enabled);
        assert_eq!(config.config_dir(), Path::new("/tmp/prefix"));
        assert_eq!(config.shm_dir, Path::new("/run/shm"));
    }

    #[test]
    fn empty_directories_fall_back() {
        let config =
            FsyncConfig::from_lookup(lookup(&[("FSYNC_CONFIG_DIR", ""), ("FSYNC_SHM_DIR", "")]));
        assert_eq!(config.config_dir, Path::new("."));
        assert_eq!(config.shm_dir, Path::new(DEFAULT_SHM_DIR));
    }

    #[test]
    fn backing_path_uses_config_dir_inode() {
        use std::os::unix::fs::MetadataExt;

        let prefix = tempfile::tempdir().unwrap();
        let shm = tempfile::tempdir().unwrap();
        let config = FsyncConfig::enabled_at(prefix.path(), shm.path());
        let ino = std::fs::metadata(prefix.path()).unwrap().ino();

        let path = config.backing_path().unwrap();
        assert_eq!(path, shm.path().join(format!("fsync-{ino:x}")));
    }

    #[test]
    fn round_trips_through_json() {
        let config = FsyncConfig::enabled_at("/a", "/b");
        let json = serde_json::to_string(&config).unwrap();
        let back: FsyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
