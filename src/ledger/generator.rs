//! # Migration Generator
//!
//! Generates new migration files with proper numbering, structure, and a
//! checksum matching the empty template scripts. Authors edit the `up` and
//! `down` sections and rerun checksum computation through discovery.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;

use super::MigrationVersion;
use crate::checksum::migration_checksum;
use crate::errors::{MigrationError, ShiftResult};

/// Placeholder scripts baked into freshly generated files.
const TEMPLATE_UP: &str = "-- TODO: forward schema change\n";
const TEMPLATE_DOWN: &str = "-- TODO: reverse of 'up'\n";

/// Migration file generator
pub struct MigrationGenerator {
    migrations_dir: PathBuf,
}

impl MigrationGenerator {
    pub fn new(migrations_dir: PathBuf) -> Self {
        Self { migrations_dir }
    }

    /// Generate the next numbered migration file and return its path.
    pub fn create(&self, name: &str) -> ShiftResult<PathBuf> {
        if !self.migrations_dir.exists() {
            fs::create_dir_all(&self.migrations_dir).map_err(|e| MigrationError::FileWrite {
                path: self.migrations_dir.clone(),
                source: e,
            })?;
        }

        let next_version = self.next_version()?;

        // Sanitize name (lowercase, underscores)
        let sanitized_name = name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect::<String>();

        let filename = format!("{:03}_{}.yaml", next_version, sanitized_name);
        let file_path = self.migrations_dir.join(&filename);
        if file_path.exists() {
            return Err(MigrationError::MalformedMigration {
                path: file_path,
                reason: "file already exists".to_string(),
            });
        }

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let checksum = migration_checksum(TEMPLATE_UP, TEMPLATE_DOWN);
        let content = format!(
            r#"# Migration: {}
# Created: {}
#
# Edit the 'up' and 'down' scripts, then clear the checksum line; discovery
# recomputes and pins it.

version: {}
description: {}
checksum: "{}"
up: |
{}
down: |
{}
"#,
            sanitized_name,
            timestamp,
            next_version,
            sanitized_name,
            checksum,
            indent(TEMPLATE_UP),
            indent(TEMPLATE_DOWN)
        );

        fs::write(&file_path, &content).map_err(|e| MigrationError::FileWrite {
            path: file_path.clone(),
            source: e,
        })?;

        Ok(file_path)
    }

    /// Next version number: one past the highest numbered filename.
    fn next_version(&self) -> ShiftResult<MigrationVersion> {
        if !self.migrations_dir.exists() {
            return Ok(1);
        }

        let mut max_version: MigrationVersion = 0;

        for entry in fs::read_dir(&self.migrations_dir).map_err(|e| MigrationError::FileRead {
            path: self.migrations_dir.clone(),
            source: e,
        })? {
            let entry = entry.map_err(|e| MigrationError::FileRead {
                path: self.migrations_dir.clone(),
                source: e,
            })?;

            let path = entry.path();
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                // Parse version from filename: 001_name -> 1
                if let Some(idx) = stem.find('_') {
                    if let Ok(version) = stem[..idx].parse::<MigrationVersion>() {
                        max_version = max_version.max(version);
                    }
                } else if let Ok(version) = stem.parse::<MigrationVersion>() {
                    max_version = max_version.max(version);
                }
            }
        }

        Ok(max_version + 1)
    }
}

/// Two-space indent for YAML block scalars.
fn indent(script: &str) -> String {
    script
        .lines()
        .map(|line| format!("  {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}
