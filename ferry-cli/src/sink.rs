//! Materialize received artifacts as files in a directory.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use ferry_core::{Artifact, ArtifactSink};
use tracing::debug;

/// Writes each artifact into `dir`, never overwriting: `a.txt`, `a (1).txt`, `a (2).txt`...
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactSink for DirectorySink {
    type Output = PathBuf;
    type Error = io::Error;

    fn materialize(&mut self, artifact: Artifact) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let name = safe_file_name(&artifact.file_name);
        let mut n = 0u32;
        loop {
            let path = self.dir.join(numbered(&name, n));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut f) => {
                    io::Write::write_all(&mut f, &artifact.data)?;
                    debug!(path = %path.display(), bytes = artifact.data.len(), "artifact written");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Final path component of a sender-supplied name. Falls back to "received" for names
/// with no usable component ("", "..", "/").
fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(OsStr::to_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("received")
        .to_string()
}

fn numbered(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    match (
        path.file_stem().and_then(OsStr::to_str),
        path.extension().and_then(OsStr::to_str),
    ) {
        (Some(stem), Some(ext)) => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", name, n),
    }
}
