// Manifest Module - plugin file list for the SIP plugin installer
use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// The manifest shipped with this plugin
pub const PEX_MANIFEST: &str = include_str!("../pex.manifest");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file: String,
    pub dir: String,  // Relative to the SIP installation root
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    pub headers: Vec<(String, String)>,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub installed: Vec<PathBuf>,
    pub skipped: Vec<String>,  // Listed but not present, e.g. generated data files
}

impl Manifest {
    /// Parse `Key: value` headers, a blank line, then `<file> <dir>` entries.
    /// Lines starting with `#` are comments.
    pub fn parse(text: &str) -> Result<Self> {
        let mut manifest = Manifest::default();
        let mut in_headers = true;

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.starts_with('#') {
                continue;
            }
            if line.is_empty() {
                if !manifest.headers.is_empty() {
                    in_headers = false;
                }
                continue;
            }

            if in_headers {
                let (key, value) = line
                    .split_once(':')
                    .with_context(|| format!("line {}: expected `Key: value`, got {:?}", n + 1, line))?;
                manifest.headers.push((key.trim().to_string(), value.trim().to_string()));
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                bail!("line {}: expected `<file> <directory>`, got {:?}", n + 1, line);
            }
            if escapes_root(Path::new(fields[0])) {
                bail!("line {}: file name must be relative: {}", n + 1, fields[0]);
            }
            if escapes_root(Path::new(fields[1])) {
                bail!("line {}: install directory must be relative: {}", n + 1, fields[1]);
            }
            manifest.files.push(ManifestEntry {
                file: fields[0].to_string(),
                dir: fields[1].to_string(),
            });
        }

        Ok(manifest)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Copy every listed file found under `source_root` into `target_root/<dir>/`.
    ///
    /// A file is looked up at `source_root/<file>` and then at `source_root/<dir>/<file>`.
    pub fn install(&self, source_root: &Path, target_root: &Path) -> Result<InstallReport> {
        let mut report = InstallReport::default();

        for entry in &self.files {
            let candidates = [
                source_root.join(&entry.file),
                source_root.join(&entry.dir).join(&entry.file),
            ];
            let Some(source) = candidates.iter().find(|p| p.is_file()) else {
                warn!("Skipping {}: not found under {}", entry.file, source_root.display());
                report.skipped.push(entry.file.clone());
                continue;
            };

            let dest_dir = target_root.join(&entry.dir);
            std::fs::create_dir_all(&dest_dir)
                .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
            let dest = dest_dir.join(&entry.file);
            std::fs::copy(source, &dest)
                .with_context(|| format!("Failed to copy {} to {}", source.display(), dest.display()))?;
            info!("Installed {}", dest.display());
            report.installed.push(dest);
        }

        Ok(report)
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.headers {
            if value.is_empty() {
                writeln!(f, "{}:", key)?;
            } else {
                writeln!(f, "{}: {}", key, value)?;
            }
        }
        writeln!(f)?;
        for entry in &self.files {
            writeln!(f, "{} {}", entry.file, entry.dir)?;
        }
        Ok(())
    }
}

// Absolute paths and `..` would place files outside the install root
fn escapes_root(path: &Path) -> bool {
    path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir))
}
