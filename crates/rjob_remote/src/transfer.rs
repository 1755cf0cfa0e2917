//! Directory tree transfer built on nothing but exec channels: files travel as
//! base64 chunks piped through `base64 -d` on upload and `base64` on download.

use crate::{config, shell, RemoteShell};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    ".venv",
    "__pycache__",
    ".ipynb_checkpoints",
    ".DS_Store",
];

#[derive(Debug, Clone)]
pub struct TransferFilter {
    ignore: BTreeSet<String>,
}

impl Default for TransferFilter {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl TransferFilter {
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ignore: BTreeSet<String> = DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect();
        ignore.extend(extra.into_iter().map(Into::into));
        Self { ignore }
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore.contains(name)
    }

    fn find_prune_clause(&self) -> String {
        let names: Vec<String> = self
            .ignore
            .iter()
            .map(|name| format!("-name {}", shell::quote(name)))
            .collect();
        format!("\\( {} \\) -prune", names.join(" -o "))
    }
}

#[derive(Debug, Default)]
pub struct LocalTree {
    pub dirs: Vec<String>,
    pub files: Vec<(PathBuf, String)>,
}

/// Lists `root` recursively, returning directories and files as `/`-separated
/// paths relative to `root`, skipping anything whose name is ignored.
pub fn collect_local_tree(root: &Path, filter: &TransferFilter) -> Result<LocalTree> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let mut tree = LocalTree::default();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !filter.is_ignored(&entry.file_name().to_string_lossy()));
    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .ok()
            .and_then(shell::relative_posix)
            .with_context(|| format!("unexpected path {}", entry.path().display()))?;
        if entry.file_type().is_dir() {
            tree.dirs.push(relative);
        } else if entry.file_type().is_file() {
            tree.files.push((entry.path().to_path_buf(), relative));
        }
    }
    Ok(tree)
}

/// Fails when `local` exists and holds data, unless `overwrite` is set.
pub fn check_local_target(local: &Path, overwrite: bool) -> Result<()> {
    if overwrite || !local.exists() {
        return Ok(());
    }
    if local.is_file() {
        bail!("local path {} exists as a file", local.display());
    }
    let mut entries =
        std::fs::read_dir(local).with_context(|| format!("reading {}", local.display()))?;
    if entries.next().is_some() {
        bail!(
            "local path {} already exists and is not empty (pass overwrite to replace)",
            local.display()
        );
    }
    Ok(())
}

async fn exec_checked<S: RemoteShell + ?Sized>(shell: &S, command: &str, what: &str) -> Result<String> {
    let out = shell.exec(command).await?;
    if !out.success() {
        bail!(
            "{what} failed (exit {}): {}",
            out.exit_code,
            out.stderr.trim()
        );
    }
    Ok(out.stdout)
}

/// Copies the local directory `local` into the absolute remote directory `remote`.
/// Returns the number of files written.
pub async fn upload_tree<S: RemoteShell + ?Sized>(
    shell: &S,
    local: &Path,
    remote: &str,
    filter: &TransferFilter,
) -> Result<usize> {
    let root = local.to_path_buf();
    let walk_filter = filter.clone();
    let tree = tokio::task::spawn_blocking(move || collect_local_tree(&root, &walk_filter))
        .await
        .context("local tree walk panicked")??;

    let mut mkdir = format!("mkdir -p {}", shell::quote(remote));
    for dir in &tree.dirs {
        mkdir.push(' ');
        mkdir.push_str(&shell::quote(&shell::join(remote, dir)));
    }
    exec_checked(shell, &mkdir, "creating remote directories").await?;

    let chunk = config::transfer_chunk_bytes();
    for (path, relative) in &tree.files {
        let target = shell::quote(&shell::join(remote, relative));
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        debug!(target: "remote::transfer", "uploading {} ({} bytes)", relative, bytes.len());
        if bytes.is_empty() {
            exec_checked(shell, &format!(": > {target}"), "creating empty file").await?;
            continue;
        }
        for (index, piece) in bytes.chunks(chunk).enumerate() {
            let redirect = if index == 0 { ">" } else { ">>" };
            let command = format!(
                "printf %s '{}' | base64 -d {redirect} {target}",
                STANDARD.encode(piece)
            );
            exec_checked(shell, &command, "writing remote file")
                .await
                .with_context(|| format!("uploading {relative}"))?;
        }
    }
    Ok(tree.files.len())
}

/// Copies the absolute remote directory `remote` into `local`. Returns the number of files read.
pub async fn download_tree<S: RemoteShell + ?Sized>(
    shell: &S,
    remote: &str,
    local: &Path,
    overwrite: bool,
    filter: &TransferFilter,
) -> Result<usize> {
    let quoted = shell::quote(remote);
    let kind = exec_checked(
        shell,
        &format!("test -d {quoted} && echo dir || echo missing"),
        "checking remote directory",
    )
    .await?;
    if kind.trim() != "dir" {
        bail!("remote directory {remote} does not exist");
    }
    check_local_target(local, overwrite)?;

    let listing = exec_checked(
        shell,
        &format!(
            "cd {quoted} && find . {} -o -type f -print",
            filter.find_prune_clause()
        ),
        "listing remote files",
    )
    .await?;

    tokio::fs::create_dir_all(local)
        .await
        .with_context(|| format!("creating {}", local.display()))?;

    let mut count = 0;
    for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let relative = line.trim_start_matches("./");
        let Some(target) = safe_local_join(local, relative) else {
            bail!("refusing to write remote entry {relative:?} outside {}", local.display());
        };
        let encoded = exec_checked(
            shell,
            &format!("base64 < {}", shell::quote(&shell::join(remote, relative))),
            "reading remote file",
        )
        .await
        .with_context(|| format!("downloading {relative}"))?;
        let compact: String = encoded.split_whitespace().collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .with_context(|| format!("decoding {relative}"))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        count += 1;
    }
    Ok(count)
}

fn safe_local_join(base: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    shell::relative_posix(relative)?;
    Some(base.join(relative))
}
