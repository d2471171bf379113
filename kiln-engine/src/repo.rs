//! Access to the binary package repository.
//!
//! Packages live flat in the `All` directory as `<pkgname>.pkg`, each with a
//! fingerprint recorded beside it. Workers publish through write-then-rename
//! so a crashed build never leaves a half-written package behind, and the
//! scheduler only reads the directory before any worker runs.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};
use walkdir::WalkDir;

use kiln_core::Fingerprint;

use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct Repository {
    all_dir: PathBuf,
}

impl Repository {
    /// Opens (creating if necessary) the repository `All` directory.
    pub fn open(all_dir: &Path) -> Result<Repository, EngineError> {
        fs::create_dir_all(all_dir).map_err(|err| EngineError::io(&all_dir.to_path_buf(), err))?;
        Ok(Repository {
            all_dir: all_dir.to_path_buf(),
        })
    }

    #[inline]
    pub fn all_dir(&self) -> &Path {
        &self.all_dir
    }

    /// Expected location of a package file.
    pub fn package_path(&self, pkgname: &str) -> PathBuf {
        self.all_dir.join(format!("{}.pkg", pkgname))
    }

    fn fingerprint_path(&self, pkgname: &str) -> PathBuf {
        self.all_dir.join(format!("{}.pkg.fp", pkgname))
    }

    /// The fingerprint recorded when `pkgname` was last published.
    pub fn recorded_fingerprint(&self, pkgname: &str) -> Option<Fingerprint> {
        let text = fs::read_to_string(self.fingerprint_path(pkgname)).ok()?;
        text.trim().parse().ok()
    }

    /// Already-built check: the package file exists and its recorded
    /// fingerprint matches the one computed for this run.
    pub fn is_built(&self, pkgname: &str, fingerprint: &Fingerprint) -> bool {
        if !self.package_path(pkgname).is_file() {
            return false;
        }
        match self.recorded_fingerprint(pkgname) {
            Some(recorded) => recorded == *fingerprint,
            None => false,
        }
    }

    /// Publishes a package file captured from a sandbox.
    ///
    /// The payload and its fingerprint are staged under temporary names and
    /// atomically renamed into place, package first.
    pub fn publish(
        &self,
        staged: &Path,
        pkgname: &str,
        fingerprint: &Fingerprint,
    ) -> Result<PathBuf, EngineError> {
        let final_path = self.package_path(pkgname);
        let tmp_path = self.all_dir.join(format!(".tmp.{}.pkg", pkgname));

        fs::copy(staged, &tmp_path).map_err(|err| EngineError::io(&tmp_path, err))?;
        fs::rename(&tmp_path, &final_path).map_err(|err| EngineError::io(&final_path, err))?;

        let fp_final = self.fingerprint_path(pkgname);
        let fp_tmp = self.all_dir.join(format!(".tmp.{}.fp", pkgname));
        {
            let mut file = fs::File::create(&fp_tmp).map_err(|err| EngineError::io(&fp_tmp, err))?;
            writeln!(file, "{}", fingerprint).map_err(|err| EngineError::io(&fp_tmp, err))?;
        }
        fs::rename(&fp_tmp, &fp_final).map_err(|err| EngineError::io(&fp_final, err))?;

        debug!("published {}", final_path.display());
        Ok(final_path)
    }

    /// Deletes a package and its fingerprint, for `force` and `test` runs.
    pub fn remove(&self, pkgname: &str) -> Result<(), EngineError> {
        for path in &[self.package_path(pkgname), self.fingerprint_path(pkgname)] {
            match fs::remove_file(path) {
                Ok(()) => info!("removed {}", path.display()),
                Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(EngineError::io(path, err)),
            }
        }
        Ok(())
    }

    /// Rebuilds the repository database by invoking the host package
    /// tooling over the packages directory.
    pub fn rebuild_database(&self, packages_dir: &Path) -> Result<(), EngineError> {
        info!("rebuilding repository database in {}", packages_dir.display());
        let status = Command::new("pkg")
            .arg("repo")
            .arg(packages_dir)
            .status()
            .map_err(|err| EngineError::Repository(format!("unable to run pkg repo: {}", err)))?;

        if !status.success() {
            return Err(EngineError::Repository(format!(
                "pkg repo exited with {}",
                status
            )));
        }
        Ok(())
    }
}

/// Deletes distfiles not referenced by any port in `referenced`.
///
/// Paths in `referenced` are relative to the distfiles directory. Returns
/// the number of files removed.
pub fn purge_distfiles(
    distfiles_dir: &Path,
    referenced: &BTreeSet<String>,
) -> Result<usize, EngineError> {
    let mut removed = 0;

    for entry in WalkDir::new(distfiles_dir) {
        let entry =
            entry.map_err(|err| EngineError::Repository(format!("distfiles walk: {}", err)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = match entry.path().strip_prefix(distfiles_dir) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => continue,
        };

        if referenced.contains(&relative) {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                info!("purged distfile {}", relative);
                removed += 1;
            }
            Err(err) => warn!("unable to purge {}: {}", relative, err),
        }
    }

    Ok(removed)
}
