//! Writes reconstructed files under an output directory.
//!
//! Path hints from the engine look like `192.168.1.1/TCP-80/index.html`.
//! Each component is reduced to a safe file name so a hint can never leave
//! the output root, and an existing file is never overwritten: the second
//! `index.html` lands as `index[1].html`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flowsleuth_core::file::FileSink;
use tracing::{debug, trace};

use crate::error::SinkError;

/// Longest component kept from a hint.
const MAX_COMPONENT_LEN: usize = 128;

/// Gives up on finding a free name after this many attempts.
const MAX_COLLISIONS: u32 = 10_000;

/// [`FileSink`] writing into a directory tree.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    written: u64,
}

impl DirectorySink {
    /// Use `root` as the output directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(SinkError::NotADirectory {
                path: root.display().to_string(),
            });
        }
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "directory sink ready");
        Ok(Self { root, written: 0 })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Relative path for a hint; never empty, never escapes the root.
    pub fn relative_path(path_hint: &str) -> PathBuf {
        let mut path: PathBuf = path_hint
            .split(['/', '\\'])
            .filter_map(sanitize_component)
            .collect();
        if path.as_os_str().is_empty() {
            path.push("unnamed");
        }
        path
    }
}

fn sanitize_component(component: &str) -> Option<String> {
    let trimmed = component.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return None;
    }
    let cleaned: String = trimmed
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | '[' | ']' | '=' | '+') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_COMPONENT_LEN)
        .collect();
    Some(cleaned)
}

/// `name.ext` -> `name[n].ext`
fn numbered(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}[{n}].{}", ext.to_string_lossy()),
        None => format!("{stem}[{n}]"),
    };
    path.with_file_name(name)
}

impl FileSink for DirectorySink {
    fn store(&mut self, path_hint: &str, data: &[u8]) -> io::Result<String> {
        let target = self.root.join(Self::relative_path(path_hint));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut candidate = target.clone();
        let mut attempt = 0;
        let mut file = loop {
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(file) => break file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_COLLISIONS => {
                    attempt += 1;
                    candidate = numbered(&target, attempt);
                }
                Err(err) => return Err(err),
            }
        };
        file.write_all(data)?;
        file.flush()?;

        self.written += 1;
        trace!(path = %candidate.display(), bytes = data.len(), "file written");
        Ok(candidate.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_cannot_escape() {
        assert_eq!(
            DirectorySink::relative_path("192.168.1.1/TCP-80/index.html"),
            PathBuf::from("192.168.1.1/TCP-80/index.html")
        );
        assert_eq!(
            DirectorySink::relative_path("../../etc/passwd"),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            DirectorySink::relative_path("/abs/./x"),
            PathBuf::from("abs/x")
        );
        assert_eq!(DirectorySink::relative_path(".."), PathBuf::from("unnamed"));
    }

    #[test]
    fn test_unsafe_characters_replaced() {
        assert_eq!(
            DirectorySink::relative_path("fe80::1/TCP-80/a b?.txt"),
            PathBuf::from("fe80__1/TCP-80/a_b_.txt")
        );
    }

    #[test]
    fn test_collisions_are_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path()).unwrap();

        let first = sink.store("10.0.0.1/TCP-80/index.html", b"one").unwrap();
        let second = sink.store("10.0.0.1/TCP-80/index.html", b"two").unwrap();
        let third = sink.store("10.0.0.1/TCP-80/README", b"three").unwrap();
        let fourth = sink.store("10.0.0.1/TCP-80/README", b"four").unwrap();

        assert!(first.ends_with("index.html"));
        assert!(second.ends_with("index[1].html"));
        assert!(fourth.ends_with("README[1]"));
        assert_eq!(fs::read(&first).unwrap(), b"one");
        assert_eq!(fs::read(&second).unwrap(), b"two");
        assert_eq!(fs::read(&third).unwrap(), b"three");
        assert_eq!(sink.written(), 4);
    }

    #[test]
    fn test_root_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            DirectorySink::new(file.path()),
            Err(SinkError::NotADirectory { .. })
        ));
    }
}
