//! Minimal read access to installable application packages.
//!
//! Deployment only needs two things from a package: the names of its
//! entries, and the ability to extract one entry to disk.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Prefix under which packages carry native libraries.
pub const NATIVE_LIB_PREFIX: &str = "lib/";

pub trait PackageArchive {
    /// Entry names in archive order.
    fn entry_names(&self) -> Vec<String>;

    /// Extracts one entry below `dest_dir`, keeping its relative path.
    fn extract(&mut self, name: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Native-library entries (`lib/<abi>/...`), in archive order.
    fn native_libraries(&self) -> Vec<String> {
        self.entry_names()
            .into_iter()
            .filter(|n| n.starts_with(NATIVE_LIB_PREFIX))
            .collect()
    }
}

/// A package stored as a zip file on the local disk (e.g. an APK).
pub struct ZipPackage {
    path: PathBuf,
    archive: ZipArchive<File>,
    names: Vec<String>,
}

impl ZipPackage {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("Failed to open package {}: {}", path.display(), e),
            ))
        })?;
        let mut archive = ZipArchive::new(file)?;
        // file_names() iterates a hash map; keep central-directory order
        let mut names = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            names.push(archive.by_index_raw(i)?.name().to_string());
        }
        Ok(Self {
            path: path.to_path_buf(),
            archive,
            names,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PackageArchive for ZipPackage {
    fn entry_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn extract(&mut self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let mut entry = self.archive.by_name(name)?;
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Provisioning(format!("unsafe entry name in package: {}", name)))?;
        let target = dest_dir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        Ok(target)
    }
}
