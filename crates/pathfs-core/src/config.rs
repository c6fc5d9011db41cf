// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration loaded from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MountError;

fn default_errno() -> i32 {
    libc::ENOENT
}

/// Everything needed to mount a filesystem, in file form.
///
/// ```json
/// { "mount_point": "/mnt/mem", "fsname": "memfs", "allow_other": true, "threads": 4 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    pub mount_point: Option<PathBuf>,
    /// Extra option tokens, appended verbatim after the generated ones.
    pub options: Vec<String>,
    pub fsname: Option<String>,
    pub subtype: Option<String>,
    pub debug: bool,
    pub read_only: bool,
    pub allow_other: bool,
    pub allow_root: bool,
    pub auto_unmount: bool,
    #[serde(default = "default_errno")]
    pub default_errno: i32,
    pub dir_buffer_size: Option<usize>,
    /// Dispatch threads; 1 selects the single-threaded loop.
    pub threads: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: None,
            options: Vec::new(),
            fsname: None,
            subtype: None,
            debug: false,
            read_only: false,
            allow_other: false,
            allow_root: false,
            auto_unmount: false,
            default_errno: default_errno(),
            dir_buffer_size: None,
            threads: 1,
        }
    }
}

impl MountConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MountError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MountError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| MountError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        debug!(target: "pathfs::config", path = %path.display(), "Loaded mount config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MountError> {
        if self.default_errno <= 0 {
            return Err(MountError::Config(format!(
                "default_errno must be positive, got {}",
                self.default_errno
            )));
        }
        if self.threads == 0 {
            return Err(MountError::Config("threads must be at least 1".into()));
        }
        if self.allow_other && self.allow_root {
            return Err(MountError::Config(
                "allow_other and allow_root are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// Option tokens for [`crate::Mount::initialize`].
    pub fn argv(&self) -> Vec<String> {
        let mut options = Vec::new();
        if let Some(fsname) = &self.fsname {
            options.push(format!("fsname={fsname}"));
        }
        if let Some(subtype) = &self.subtype {
            options.push(format!("subtype={subtype}"));
        }
        for (set, name) in [
            (self.read_only, "ro"),
            (self.allow_other, "allow_other"),
            (self.allow_root, "allow_root"),
            (self.auto_unmount, "auto_unmount"),
        ] {
            if set {
                options.push(name.to_owned());
            }
        }

        let mut argv = Vec::new();
        if !options.is_empty() {
            argv.push("-o".to_owned());
            argv.push(options.join(","));
        }
        if self.debug {
            argv.push("-d".to_owned());
        }
        if self.threads == 1 {
            argv.push("-s".to_owned());
        }
        argv.extend(self.options.iter().cloned());
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MountArgs;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: MountConfig = serde_json::from_str(r#"{"fsname": "memfs"}"#).unwrap();
        assert_eq!(config.default_errno, libc::ENOENT);
        assert_eq!(config.threads, 1);
        assert_eq!(config.argv(), ["-o", "fsname=memfs", "-s"]);
    }

    #[test]
    fn argv_round_trips_through_mount_args() {
        let config = MountConfig {
            fsname: Some("memfs".into()),
            subtype: Some("pathfs".into()),
            allow_other: true,
            debug: true,
            threads: 4,
            options: vec!["-oro".into()],
            ..MountConfig::default()
        };
        let args = MountArgs::parse(config.argv()).unwrap();
        assert_eq!(args.option_value("fsname"), Some("memfs"));
        assert_eq!(args.option_value("subtype"), Some("pathfs"));
        assert!(args.has_option("allow_other"));
        assert!(args.has_option("ro"));
        assert!(args.debug());
        assert!(!args.single_threaded());
    }

    #[test]
    fn load_reads_and_validates_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"mount_point": "/mnt/x", "default_errno": 5}"#).unwrap();
        let config = MountConfig::load(&good).unwrap();
        assert_eq!(config.mount_point, Some(PathBuf::from("/mnt/x")));
        assert_eq!(config.default_errno, libc::EIO);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"threads": 0}"#).unwrap();
        assert!(matches!(MountConfig::load(&bad), Err(MountError::Config(_))));

        let unknown = dir.path().join("unknown.json");
        std::fs::write(&unknown, r#"{"colour": "blue"}"#).unwrap();
        assert!(matches!(MountConfig::load(&unknown), Err(MountError::Config(_))));

        assert!(matches!(
            MountConfig::load(dir.path().join("missing.json")),
            Err(MountError::Config(_))
        ));
    }
}
