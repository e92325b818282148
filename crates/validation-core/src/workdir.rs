//! Filesystem layout of a validation's working directory.
//!
//! ```text
//! {work_dir}/{validation_id}/files/<relative path>     staged inputs, shared by every job
//! {work_dir}/{validation_id}/{validator_id}/input/     per-job scratch (input.json)
//! {work_dir}/{validation_id}/{validator_id}/output/    per-job scratch (result.json)
//! ```

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use crate::{model::SANDBOX_INPUT_DATA, Error, Result};

pub const FILES_DIR: &str = "files";
pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "output";
pub const INPUT_MANIFEST: &str = "input.json";
pub const RESULT_MANIFEST: &str = "result.json";

/// Ids become directory names, so they must be a single plain path component.
fn path_component<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !value.contains('/') => Ok(value),
        _ => Err(Error::msg(format!("invalid {kind} '{value}'"))),
    }
}

pub fn validation_dir(work_dir: &Path, validation_id: &str) -> Result<PathBuf> {
    Ok(work_dir.join(path_component("validation id", validation_id)?))
}

pub fn files_dir(validation_dir: &Path) -> PathBuf {
    validation_dir.join(FILES_DIR)
}

pub fn job_dir(validation_dir: &Path, validator_id: &str) -> Result<PathBuf> {
    Ok(validation_dir.join(path_component("validator id", validator_id)?))
}

/// A submitted file path relative to the staged-files tree.
///
/// Leading separators are dropped; `..` and other non-normal components are rejected so a file
/// can never be staged outside `files/`.
pub fn relative_data_path(file_path: &str) -> Result<PathBuf> {
    let trimmed = file_path.trim_start_matches('/');
    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(Error::msg(format!("invalid file path '{file_path}'"))),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::msg(format!("invalid file path '{file_path}'")));
    }
    Ok(out)
}

/// Where a submitted file appears inside the sandbox.
pub fn sandbox_data_path(file_path: &str) -> String {
    format!("{SANDBOX_INPUT_DATA}/{}", file_path.trim_start_matches('/'))
}

/// Inverse of [`sandbox_data_path`] for paths reported by a validator.
///
/// Only paths below the mount (prefix plus separator) are stripped; anything else is returned
/// unchanged so a sibling such as `/mnt/input/dataa` never matches a requested file.
pub fn strip_sandbox_prefix(path: &str) -> &str {
    path.strip_prefix(SANDBOX_INPUT_DATA)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path)
}

pub async fn create_dir_all(path: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder.create(path).await
}

/// Remove a directory tree; a tree that is already gone is not an error.
pub async fn remove_dir_all(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
