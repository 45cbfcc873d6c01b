//! Per-user daemon files

use crate::storage::{get_data_dir, StorageError};
use std::path::{Path, PathBuf};

/// Socket, PID, log, config and key database under one directory
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonPaths {
    root: PathBuf,
}

impl DaemonPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--dir` if given, else `LLMD_HOME`, else the platform config dir
    pub fn resolve(dir: Option<&Path>) -> Result<Self, StorageError> {
        match dir {
            Some(dir) => Ok(Self::new(dir)),
            None => get_data_dir().map(Self::new),
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("daemon.log")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn keys_db(&self) -> PathBuf {
        self.root.join("keys.db")
    }

    /// PID recorded by a previous daemon, if readable
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.pid_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = DaemonPaths::new("/tmp/llmd-test");
        assert_eq!(paths.socket(), PathBuf::from("/tmp/llmd-test/daemon.sock"));
        assert_eq!(paths.keys_db(), PathBuf::from("/tmp/llmd-test/keys.db"));
    }

    #[test]
    fn test_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::new(dir.path());
        assert_eq!(paths.read_pid(), None);

        std::fs::write(paths.pid_file(), "4242\n").unwrap();
        assert_eq!(paths.read_pid(), Some(4242));

        std::fs::write(paths.pid_file(), "garbage").unwrap();
        assert_eq!(paths.read_pid(), None);
    }
}
