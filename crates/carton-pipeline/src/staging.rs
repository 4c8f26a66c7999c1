//! Scratch staging area for one pipeline run.
//!
//! Layout:
//!
//! ```text
//! <root>/fetch/<i>/          output of fetch stage i
//! <root>/values/values.yml   merged values, when a values step ran
//! <root>/template/<i>.yml    manifest stream after template stage i
//! <root>/deploy/final.yml    stream handed to the deploy stage
//! ```

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
    /// Set for temporary areas; removes the directory on drop.
    guard: Option<TempDir>,
}

impl StagingArea {
    /// A fresh directory removed when the area is dropped.
    pub fn temporary() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("carton-staging-").tempdir()?;
        Ok(Self {
            root: dir.path().to_path_buf(),
            guard: Some(dir),
        })
    }

    /// A directory that outlives the run. Output of earlier runs is cleared.
    pub fn persistent(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        for sub in ["fetch", "values", "template", "deploy"] {
            let dir = root.join(sub);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, guard: None })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_temporary(&self) -> bool {
        self.guard.is_some()
    }

    /// Create and return the directory for fetch stage `index`.
    pub fn fetch_dir(&self, index: usize) -> io::Result<PathBuf> {
        let dir = self.root.join("fetch").join(index.to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn fetch_root(&self) -> PathBuf {
        self.root.join("fetch")
    }

    pub fn values_file(&self) -> PathBuf {
        self.root.join("values").join("values.yml")
    }

    pub fn has_values(&self) -> bool {
        self.values_file().is_file()
    }

    pub fn template_output(&self, index: usize) -> PathBuf {
        self.root.join("template").join(format!("{index}.yml"))
    }

    pub fn deploy_file(&self) -> PathBuf {
        self.root.join("deploy").join("final.yml")
    }

    /// Resolve a staging-relative path, refusing to escape the root.
    pub fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        let rel = Path::new(relative);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path '{relative}' must stay inside the staging area"),
            ));
        }
        Ok(self.root.join(rel))
    }

    /// Keep the directory on disk and return its path.
    pub fn keep(mut self) -> PathBuf {
        match self.guard.take() {
            Some(dir) => dir.into_path(),
            None => self.root.clone(),
        }
    }
}

/// Write `bytes` to `path`, creating parent directories.
pub fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)
}

/// Every `.yml`/`.yaml` file below `dir`, sorted by path.
pub fn collect_yaml_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        if !current.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            ) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Concatenate YAML files into one stream, one `---` separated document
/// group per file.
pub fn concat_yaml(files: &[PathBuf]) -> io::Result<Vec<u8>> {
    let mut stream = Vec::new();
    for file in files {
        let content = std::fs::read(file)?;
        if !content.starts_with(b"---") {
            stream.extend_from_slice(b"---\n");
        }
        stream.extend_from_slice(&content);
        if !content.ends_with(b"\n") {
            stream.push(b'\n');
        }
    }
    Ok(stream)
}

/// Copy a directory tree.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<usize> {
    let mut copied = 0;
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
