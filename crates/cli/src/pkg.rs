//! `noxy --get`: git-based dependency fetching.
//!
//! `noxy --get github.com/user/lib[@version]` clones (or updates) the
//! repository into `noxy_libs/github.com/user/lib/`, checks out the
//! requested version when given, and records the dependency in
//! `noxy.mod`. Shells out to `git`; there is no registry.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::manifest::Manifest;

pub fn get(spec: &str) -> Result<(), String> {
    let (repo, version) = split_spec(spec);
    if repo.is_empty() {
        return Err("empty repository specification".to_string());
    }

    let dest = PathBuf::from("noxy_libs").join(repo);
    if dest.exists() {
        update(&dest)?;
    } else {
        clone(repo, &dest)?;
    }
    if let Some(version) = version {
        checkout(&dest, version)?;
    }

    let manifest_path = Path::new("noxy.mod");
    let mut manifest = Manifest::load(manifest_path)?;
    manifest.record(repo, version.unwrap_or("latest"));
    manifest.save(manifest_path)?;

    println!("fetched {} -> {}", repo, dest.display());
    Ok(())
}

/// Split `repo[@version]`.
fn split_spec(spec: &str) -> (&str, Option<&str>) {
    match spec.split_once('@') {
        Some((repo, version)) => (repo, Some(version)),
        None => (spec, None),
    }
}

fn clone_url(repo: &str) -> String {
    if repo.starts_with("http://") || repo.starts_with("https://") {
        repo.to_string()
    } else {
        format!("https://{}.git", repo)
    }
}

fn clone(repo: &str, dest: &Path) -> Result<(), String> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("{}: {}", parent.display(), e))?;
    }
    let url = clone_url(repo);
    tracing::debug!(%url, dest = %dest.display(), "cloning dependency");
    run_git(None, &["clone", "--quiet", &url, &dest.to_string_lossy()])
}

fn update(dest: &Path) -> Result<(), String> {
    tracing::debug!(dest = %dest.display(), "updating dependency");
    run_git(Some(dest), &["pull", "--quiet", "--ff-only"])
}

fn checkout(dest: &Path, version: &str) -> Result<(), String> {
    run_git(Some(dest), &["checkout", "--quiet", version])
}

fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<(), String> {
    let mut command = Command::new("git");
    if let Some(dir) = dir {
        command.arg("-C").arg(dir);
    }
    let status = command
        .args(args)
        .status()
        .map_err(|e| format!("failed to run git: {}", e))?;
    if !status.success() {
        return Err(format!(
            "git {} exited with {}",
            args.first().unwrap_or(&""),
            status
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_spec() {
        assert_eq!(
            split_spec("github.com/u/lib@v1.0"),
            ("github.com/u/lib", Some("v1.0"))
        );
        assert_eq!(split_spec("github.com/u/lib"), ("github.com/u/lib", None));
    }

    #[test]
    fn test_clone_url() {
        assert_eq!(
            clone_url("github.com/u/lib"),
            "https://github.com/u/lib.git"
        );
        assert_eq!(
            clone_url("https://example.com/repo.git"),
            "https://example.com/repo.git"
        );
    }
}
