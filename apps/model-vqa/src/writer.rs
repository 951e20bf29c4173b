use crate::error::{EvalError, EvalResult};
use serde::Serialize;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::warn;

/// Writes one JSON value per line, flushing after each so finished records survive a crash.
pub struct JsonLinesWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesWriter {
    /// Creates parent directories, then truncates the file or appends to it.
    pub fn create(path: impl AsRef<Path>, append: bool) -> EvalResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
        }
        if append {
            drop_partial_line(path)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(|e| EvalError::io(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> EvalResult<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| EvalError::io(&self.path, e))
    }

    pub fn close(mut self) -> EvalResult<()> {
        self.writer
            .flush()
            .map_err(|e| EvalError::io(&self.path, e))
    }
}

/// Cuts an existing file back to its last newline so appended records start on a
/// line of their own. A record cut short by a crash is discarded.
fn drop_partial_line(path: &Path) -> EvalResult<()> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(EvalError::io(path, e)),
    };
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    warn!(
        "dropping {} bytes of an unfinished line at the end of {}",
        content.len() - keep,
        path.display()
    );
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(keep as u64))
        .map_err(|e| EvalError::io(path, e))
}
