use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::fs_utils::sanitize_segment;

/// Shortcut stored as a small `key=value` text file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcutRecord {
    pub target: PathBuf,
    pub working_directory: PathBuf,
}

impl ShortcutRecord {
    pub fn render(&self) -> String {
        format!(
            "target={}\nworking_directory={}\n",
            self.target.display(),
            self.working_directory.display()
        )
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut target = None;
        let mut working_directory = None;
        for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match line.split_once('=') {
                Some(("target", value)) => target = Some(PathBuf::from(value)),
                Some(("working_directory", value)) => {
                    working_directory = Some(PathBuf::from(value))
                }
                _ => {}
            }
        }
        Ok(Self {
            target: target.ok_or_else(|| anyhow!("shortcut has no target"))?,
            working_directory: working_directory
                .ok_or_else(|| anyhow!("shortcut has no working_directory"))?,
        })
    }
}

pub fn shortcut_path(directory: &Path, name: &str) -> PathBuf {
    directory.join(format!("{}.lnk", sanitize_segment(name)))
}

pub fn read_shortcut(path: &Path) -> Result<ShortcutRecord> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read shortcut: {}", path.display()))?;
    ShortcutRecord::parse(&raw).with_context(|| format!("invalid shortcut: {}", path.display()))
}
