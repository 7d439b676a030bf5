/// Per-job working directory.
///
/// Each job gets `jobs_root/<job_id>`, normally a size-capped tmpfs owned by
/// the sandbox user, bound read-write at `/work` inside the sandbox. The
/// workspace outlives the execution so outputs can be downloaded, and is
/// released exactly once: explicitly or on drop.
use crate::config::job::InputFile;
use crate::config::types::{FileKind, JobError, OutputFile, Result, SandboxError};
use crate::config::validator::check_relative_path;
use crate::kernel::mount::{mount_tmpfs, unmount_lazy, TmpfsOptions};
use crate::safety::safe_cleanup::remove_tree_secure;
use glob::{MatchOptions, Pattern};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const WORKDIR_MODE: u32 = 0o700;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Classify an output file by extension.
pub fn classify(path: &Path) -> FileKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" | "py" | "js" | "sh" | "html" | "xml" | "yaml" | "yml" => {
            FileKind::Text
        }
        "json" | "jsonl" => FileKind::Json,
        "csv" | "tsv" => FileKind::Csv,
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "bmp" | "webp" => FileKind::Image,
        "zip" | "tar" | "gz" | "tgz" | "bz2" | "xz" | "zst" => FileKind::Archive,
        "pt" | "pth" | "onnx" | "h5" | "pkl" | "safetensors" | "ckpt" => FileKind::Model,
        "npy" | "npz" | "parquet" | "arrow" | "feather" | "bin" | "dat" => FileKind::Data,
        _ => FileKind::Binary,
    }
}

/// Lowercase hex SHA-256 of a file's content.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| SandboxError::Config(format!("invalid output pattern {:?}: {}", p, e)))
        })
        .collect()
}

/// Regular files under `dir`, as paths relative to `base`. Symlinks are skipped.
fn walk_files(base: &Path, dir: &Path, out: &mut Vec<(String, PathBuf, u64)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            walk_files(base, &path, out)?;
        } else if meta.is_file() {
            if let Ok(rel) = path.strip_prefix(base) {
                out.push((rel.to_string_lossy().into_owned(), path.clone(), meta.len()));
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct JobWorkspace {
    job_id: String,
    dir: PathBuf,
    owner: Option<(u32, u32)>,
    mounted: bool,
    released: bool,
}

impl JobWorkspace {
    /// Create `jobs_root/<job_id>` as a tmpfs of `size_bytes` owned by the
    /// sandbox user. In permissive mode a failed mount degrades to a plain
    /// directory.
    pub fn create(
        jobs_root: &Path,
        job_id: &str,
        size_bytes: u64,
        uid: u32,
        gid: u32,
        strict_mode: bool,
    ) -> Result<Self> {
        let mut workspace = Self::plain(jobs_root, job_id)?;
        workspace.owner = Some((uid, gid));

        let options = TmpfsOptions {
            size_bytes,
            mode: WORKDIR_MODE,
            uid,
            gid,
        };
        match mount_tmpfs(&workspace.dir, &options) {
            Ok(()) => workspace.mounted = true,
            Err(e) if strict_mode => return Err(e),
            Err(e) => {
                log::warn!(
                    "tmpfs for job {} unavailable, using plain directory (permissive mode): {}",
                    job_id,
                    e
                );
                std::os::unix::fs::chown(&workspace.dir, Some(uid), Some(gid))?;
            }
        }
        log::debug!(
            "Workspace for job {} at {} (tmpfs={}, size={})",
            job_id,
            workspace.dir.display(),
            workspace.mounted,
            size_bytes
        );
        Ok(workspace)
    }

    /// Plain directory workspace with no mount.
    pub fn plain(jobs_root: &Path, job_id: &str) -> Result<Self> {
        fs::create_dir_all(jobs_root).map_err(|e| {
            SandboxError::Filesystem(format!(
                "Failed to create jobs root {}: {}",
                jobs_root.display(),
                e
            ))
        })?;
        let dir = jobs_root.join(job_id);
        // create_dir, not create_dir_all: an existing directory is a collision.
        fs::create_dir(&dir).map_err(|e| {
            SandboxError::Filesystem(format!(
                "Failed to create workspace {}: {}",
                dir.display(),
                e
            ))
        })?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(WORKDIR_MODE))?;
        Ok(Self {
            job_id: job_id.to_string(),
            dir,
            owner: None,
            mounted: false,
            released: false,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn is_tmpfs(&self) -> bool {
        self.mounted
    }

    /// Write input files into the workspace, owned by the sandbox user.
    pub fn stage_inputs(&self, inputs: &[InputFile]) -> Result<()> {
        for input in inputs {
            check_relative_path(&input.path).map_err(SandboxError::Config)?;
            let target = self.dir.join(&input.path);
            if let Some(parent) = target.parent() {
                self.create_owned_dirs(parent)?;
            }
            fs::write(&target, &input.contents)?;
            let mode = if input.executable { 0o755 } else { 0o644 };
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            self.chown(&target)?;
        }
        Ok(())
    }

    fn create_owned_dirs(&self, dir: &Path) -> Result<()> {
        if dir == self.dir || dir.exists() {
            return Ok(());
        }
        if let Some(parent) = dir.parent() {
            self.create_owned_dirs(parent)?;
        }
        fs::create_dir(dir)?;
        self.chown(dir)
    }

    fn chown(&self, path: &Path) -> Result<()> {
        if let Some((uid, gid)) = self.owner {
            std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        }
        Ok(())
    }

    /// Files matching any of `patterns` (every file when empty), sorted by path.
    pub fn collect_outputs(&self, patterns: &[String]) -> Result<Vec<OutputFile>> {
        let patterns = compile_patterns(patterns)?;
        let mut files = Vec::new();
        walk_files(&self.dir, &self.dir, &mut files)?;
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut outputs = Vec::new();
        for (rel, path, size_bytes) in files {
            if !patterns.is_empty() && !patterns.iter().any(|p| p.matches_with(&rel, GLOB_OPTIONS)) {
                continue;
            }
            let sha256 = sha256_file(&path)?;
            outputs.push(OutputFile {
                kind: classify(&path),
                path: rel,
                size_bytes,
                sha256,
            });
        }
        Ok(outputs)
    }

    /// Bytes currently stored in the workspace.
    pub fn data_bytes(&self) -> u64 {
        let mut files = Vec::new();
        if walk_files(&self.dir, &self.dir, &mut files).is_err() {
            return 0;
        }
        files.iter().map(|(_, _, size)| size).sum()
    }

    /// Resolve a downloadable file, rejecting anything outside the workspace.
    pub fn resolve(&self, rel: &str) -> std::result::Result<PathBuf, JobError> {
        check_relative_path(rel).map_err(JobError::InvalidPath)?;
        let candidate = self.dir.join(rel);
        let resolved = candidate
            .canonicalize()
            .map_err(|_| JobError::InvalidPath(format!("{} does not exist", rel)))?;
        let root = self
            .dir
            .canonicalize()
            .map_err(|_| JobError::InvalidPath("workspace is gone".to_string()))?;
        if !resolved.starts_with(&root) {
            return Err(JobError::InvalidPath(format!("{} escapes the workspace", rel)));
        }
        if !resolved.is_file() {
            return Err(JobError::InvalidPath(format!("{} is not a file", rel)));
        }
        Ok(resolved)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Unmount and delete. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if self.mounted {
            unmount_lazy(&self.dir)?;
            self.mounted = false;
        }
        remove_tree_secure(&self.dir)?;
        self.released = true;
        log::debug!("Released workspace for job {}", self.job_id);
        Ok(())
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to release workspace {}: {}", self.dir.display(), e);
        }
    }
}
