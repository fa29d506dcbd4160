// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Writes rendered configuration files, optionally keeping old ones around.

use crate::constants::proxy::CONFIG_FILE;
use crate::error::Result;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TIMESTAMPED_PREFIX: &str = "haproxy-";
const TIMESTAMPED_SUFFIX: &str = ".cfg";

pub struct ConfigFiles {
    dir: PathBuf,
    max_old: usize,
    sequence: u64,
}

impl ConfigFiles {
    /// A non positive `max_old` writes a single `haproxy.cfg`
    pub fn new(dir: &Path, max_old: i32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_old: max_old.max(0) as usize,
            sequence: 0,
        }
    }

    /// Write a new configuration, returning the path the proxy should load
    pub fn write(&mut self, content: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        if self.max_old == 0 {
            let path = self.dir.join(CONFIG_FILE);
            fs::write(&path, content)?;
            return Ok(path);
        }

        self.sequence += 1;
        let name = format!(
            "{}{}-{:06}{}",
            TIMESTAMPED_PREFIX,
            Utc::now().format("%Y%m%d-%H%M%S%.3f"),
            self.sequence,
            TIMESTAMPED_SUFFIX
        );
        let path = self.dir.join(name);
        fs::write(&path, content)?;
        self.prune()?;
        Ok(path)
    }

    /// Write a file next to the configuration, e.g. the crt-list
    pub fn write_aux(&self, name: &str, content: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Remove timestamped files beyond the current one plus `max_old`
    fn prune(&self) -> Result<()> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| {
                        n.starts_with(TIMESTAMPED_PREFIX) && n.ends_with(TIMESTAMPED_SUFFIX)
                    })
            })
            .collect();
        files.sort();

        let keep = self.max_old + 1;
        if files.len() <= keep {
            return Ok(());
        }
        for old in &files[..files.len() - keep] {
            match fs::remove_file(old) {
                Ok(()) => debug!("Removed old configuration {}", old.display()),
                Err(e) => warn!("Failed to remove old configuration {}: {}", old.display(), e),
            }
        }
        Ok(())
    }
}
