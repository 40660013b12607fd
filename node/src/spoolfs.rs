//! Spool filesystem over `std::fs`: the host points it at a data directory,
//! the device at the mounted flash filesystem. Only flat names are allowed;
//! the two spool files never live in subdirectories.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use greenhouse_common::hal::SpoolFs;

pub struct StdSpoolFs {
    base: PathBuf,
}

impl StdSpoolFs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) {
            bail!("invalid spool file name: {name:?}");
        }
        Ok(self.base.join(name))
    }
}

impl SpoolFs for StdSpoolFs {
    fn append_line(&mut self, name: &str, line: &str) -> Result<()> {
        let path = self.path_for(name)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed opening {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("failed appending {}", path.display()))
    }

    fn read_lines(&self, name: &str) -> Result<Vec<String>> {
        let path = self.path_for(name)?;
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        Ok(contents.lines().map(str::to_string).collect())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let from = self.path_for(from)?;
        let to = self.path_for(to)?;
        fs::rename(&from, &to)
            .with_context(|| format!("failed renaming {} -> {}", from.display(), to.display()))
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        fs::remove_file(&path).with_context(|| format!("failed removing {}", path.display()))
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.base)
            .with_context(|| format!("failed listing {}", self.base.display()))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

/// Create the base directory; a failure here disables the spool for this
/// boot rather than taking the node down.
pub fn prepare_base(base: &Path) -> bool {
    match fs::create_dir_all(base) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("spool directory {} unavailable: {err}", base.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenhouse_common::spool::{DrainOutcome, TelemetrySpool, PROCESSING_FILE, SPOOL_FILE};

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("greenhouse-spool-{}-{tag}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn append_read_rename_remove_round_trip() {
        let dir = scratch_dir("roundtrip");
        let mut fs_impl = StdSpoolFs::new(dir.clone());

        fs_impl.append_line(SPOOL_FILE, "{\"seq\":0}").unwrap();
        fs_impl.append_line(SPOOL_FILE, "{\"seq\":1}").unwrap();
        assert_eq!(fs_impl.read_lines(SPOOL_FILE).unwrap().len(), 2);

        fs_impl.rename(SPOOL_FILE, PROCESSING_FILE).unwrap();
        assert!(fs_impl.read_lines(SPOOL_FILE).is_err());
        assert_eq!(fs_impl.read_lines(PROCESSING_FILE).unwrap().len(), 2);
        assert!(fs_impl.list().unwrap().contains(&PROCESSING_FILE.to_string()));

        fs_impl.remove(PROCESSING_FILE).unwrap();
        assert!(fs_impl.list().unwrap().is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn drain_protocol_works_on_real_files() {
        let dir = scratch_dir("drain");
        let mut fs_impl = StdSpoolFs::new(dir.clone());
        let mut spool = TelemetrySpool::new(true);

        for i in 0..3 {
            fs_impl.append_line(SPOOL_FILE, &format!("{{\"seq\":{i}}}")).unwrap();
        }

        let mut published = Vec::new();
        let outcome = spool.drain(&mut fs_impl, |line| {
            published.push(line.to_string());
            true
        });

        assert_eq!(outcome, DrainOutcome::Clean);
        assert_eq!(published.len(), 3);
        assert!(fs_impl.list().unwrap().is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn nested_names_are_rejected() {
        let dir = scratch_dir("names");
        let mut fs_impl = StdSpoolFs::new(dir.clone());

        assert!(fs_impl.append_line("../escape.txt", "x").is_err());
        assert!(fs_impl.append_line("", "x").is_err());

        let _ = fs::remove_dir_all(dir);
    }
}
