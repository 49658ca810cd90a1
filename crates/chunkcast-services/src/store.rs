//! Writes completed transfers to disk.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::reassembly::CompletedTransfer;

pub struct PayloadStore {
    output_dir: PathBuf,
}

impl PayloadStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write a completed payload to `output_dir/<filename>`.
    ///
    /// Only the last component of the announced filename is used. The file is
    /// written under a temporary name and renamed into place, so a reader never
    /// sees a partial payload.
    pub fn write(&self, done: &CompletedTransfer) -> Result<PathBuf> {
        let name = sanitize_filename(&done.descriptor.filename)?;
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;

        let path = self.output_dir.join(name);
        let partial = self.output_dir.join(format!(".{name}.part"));
        std::fs::write(&partial, &done.payload)
            .with_context(|| format!("writing {}", partial.display()))?;
        std::fs::rename(&partial, &path)
            .with_context(|| format!("renaming into {}", path.display()))?;

        tracing::info!(
            transfer = %done.key,
            bytes = done.payload.len(),
            path = %path.display(),
            "payload written"
        );
        Ok(path)
    }
}

/// Reduce an announced filename to a single safe path component.
pub fn sanitize_filename(filename: &str) -> Result<&str> {
    let name = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => bail!("refusing to write filename {filename:?}"),
    }
}
