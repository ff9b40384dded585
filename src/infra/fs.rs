//! # File System Operations Module / 文件系统操作模块
//!
//! This module provides utilities for file system operations used by isolated
//! hosts: scratch directories, shadow copies and temporary configuration files.
//!
//! 此模块提供隔离宿主使用的文件系统操作：临时工作目录、影子副本和临时配置文件。

use fs_extra::dir::{CopyOptions, copy};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir, TempPath};

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Creates a unique scratch directory for an environment. The directory is
/// removed when the returned `TempDir` is dropped or closed.
pub fn create_scratch_dir(label: &str) -> io::Result<TempDir> {
    Builder::new()
        .prefix(&format!("plan_runner_{}_", sanitize(label)))
        .tempdir()
}

/// Writes `content` to a fresh temporary file and keeps only its path.
/// The file is deleted when the `TempPath` is closed or dropped.
///
/// 将 `content` 写入一个新的临时文件，只保留其路径。
/// 当 `TempPath` 被关闭或丢弃时文件会被删除。
pub fn write_temporary_file(label: &str, suffix: &str, content: &str) -> io::Result<TempPath> {
    let mut file = Builder::new()
        .prefix(&format!("plan_runner_{}_", sanitize(label)))
        .suffix(suffix)
        .tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

/// Copies the entire content of a source directory into a destination directory.
///
/// # Arguments
/// * `from` - Source directory path
/// * `to` - Destination directory path
pub fn copy_dir_all(from: &Path, to: &Path) -> io::Result<()> {
    let mut options = CopyOptions::new();
    options.overwrite = true;
    options.content_only = true;
    copy(from, to, &options).map_err(io::Error::other)?;
    Ok(())
}

/// Checks if a path exists and is a directory.
pub fn is_directory(path: &Path) -> bool {
    path.is_dir()
}

/// Gets the absolute path from a potentially relative path.
///
/// # Returns
/// Canonicalized absolute path, or an error if the path doesn't exist
pub fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    fs::canonicalize(path)
}
