use std::fs::{OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::EntrypointError;
use crate::types::StorageFlags;

/// Renders the engine config file. Key order is fixed; flags that were not
/// set are left out so the engine default applies.
pub struct ConfigRenderer<'a> {
    settings: &'a Settings,
    flags: &'a StorageFlags,
}

impl<'a> ConfigRenderer<'a> {
    pub fn new(settings: &'a Settings, flags: &'a StorageFlags) -> Self {
        Self { settings, flags }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        push_line(&mut out, "dbpath", self.settings.data_dir.display());
        push_line(&mut out, "port", self.settings.port);
        for (key, value) in self.flags.entries() {
            if let Some(value) = value {
                push_line(&mut out, key, value);
            }
        }
        out
    }

    /// Replace `path` atomically: the engine sees the old file or the new one.
    ///
    /// An arbitrary runtime uid usually may write the config file but not its
    /// directory; then the existing file is rewritten in place instead.
    pub fn write_to(&self, path: &Path) -> Result<(), EntrypointError> {
        let contents = self.render();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        match NamedTempFile::new_in(dir) {
            Ok(tmp) => replace_atomically(tmp, path, &contents)?,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!(
                    dir = %dir.display(),
                    "config directory not writable, rewriting the file in place"
                );
                rewrite_in_place(path, &contents)?;
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            path = %path.display(),
            lines = contents.lines().count(),
            "rendered engine config"
        );
        Ok(())
    }
}

fn replace_atomically(
    mut tmp: NamedTempFile,
    path: &Path,
    contents: &str,
) -> Result<(), EntrypointError> {
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o644))?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn rewrite_in_place(path: &Path, contents: &str) -> Result<(), EntrypointError> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn push_line(out: &mut String, key: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("{key} = {value}\n"));
}
