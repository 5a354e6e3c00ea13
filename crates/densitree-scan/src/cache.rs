//! Persisted scan snapshots.
//!
//! A cache file is gzip-compressed text. The header line identifies the
//! format; `D` lines carry a directory's full path and open its scope,
//! `F` lines are files in the most recent scope:
//!
//! ```text
//! [densitree 1.0 cache file]
//! # Type  path/name  size  mtime
//! D /t 4096 1700000000
//! F notes.txt 120 1699999000
//! D /t/a 4096 1700000000
//! ```
//!
//! The first `D` line's path is the snapshot's root; a file with this
//! name found inside a directory being scanned may replace that scan
//! (see the cache preemption in the local read job).

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use densitree_core::{Node, NodeId, ReadState, ScanError, Tree};

use crate::job::{finish_reading, JobOutcome};

/// Name under which snapshots are recognized inside scanned directories.
pub const DEFAULT_CACHE_NAME: &str = ".densitree.cache.gz";

const CACHE_HEADER: &str = "[densitree 1.0 cache file]";

/// Entries consumed per tick. Large enough to amortize dispatch cost,
/// small enough to keep a single tick bounded.
const MAX_CACHE_LINES_PER_TICK: usize = 1000;

type CacheLines = Lines<BufReader<GzDecoder<File>>>;

#[derive(Debug)]
enum CacheEntry {
    Dir { path: PathBuf, size: u64, mtime: i64 },
    File { name: String, size: u64, mtime: i64 },
}

/// Streaming reader for a cache file.
#[derive(Debug)]
pub struct CacheReader {
    path: PathBuf,
    lines: CacheLines,
    ok: bool,
    eof: bool,
    dirs_by_path: HashMap<PathBuf, NodeId>,
    current_dir: Option<NodeId>,
    created_dirs: Vec<NodeId>,
}

impl CacheReader {
    /// Open a cache file and validate its header.
    pub fn open(path: &Path) -> Result<Self, ScanError> {
        let lines = open_lines(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            lines,
            ok: true,
            eof: false,
            dirs_by_path: HashMap::new(),
            current_dir: None,
            created_dirs: Vec::new(),
        })
    }

    /// Check if the reader is still usable.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Check if the stream is exhausted.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Scan forward to the first directory entry and return its path.
    ///
    /// Moves the read offset; `rewind()` before handing the reader to a
    /// cache job.
    pub fn first_dir(&mut self) -> Option<PathBuf> {
        loop {
            let line = self.next_content_line()?;
            match parse_entry(&line) {
                Some(CacheEntry::Dir { path, .. }) => return Some(path),
                Some(CacheEntry::File { .. }) => continue,
                None => {
                    self.ok = false;
                    return None;
                }
            }
        }
    }

    /// Reopen the stream from the start. Gzip streams cannot seek, so
    /// this goes back to the file.
    pub fn rewind(&mut self) -> Result<(), ScanError> {
        self.lines = open_lines(&self.path)?;
        self.ok = true;
        self.eof = false;
        self.dirs_by_path.clear();
        self.current_dir = None;
        self.created_dirs.clear();
        Ok(())
    }

    /// Consume up to `max_lines` entries, inserting nodes under
    /// `attach_parent`. Returns the number of entries consumed.
    pub fn read(&mut self, tree: &mut Tree, attach_parent: NodeId, max_lines: usize) -> usize {
        let mut consumed = 0;

        while consumed < max_lines && self.ok && !self.eof {
            let Some(line) = self.next_content_line() else {
                break;
            };
            consumed += 1;

            match parse_entry(&line) {
                Some(CacheEntry::Dir { path, size, mtime }) => {
                    self.add_dir(tree, attach_parent, path, size, mtime);
                }
                Some(CacheEntry::File { name, size, mtime }) => {
                    self.add_file(tree, &name, size, mtime);
                }
                None => {
                    warn!("Bad cache entry in {}: \"{line}\"", self.path.display());
                    self.ok = false;
                }
            }
        }

        consumed
    }

    fn next_content_line(&mut self) -> Option<String> {
        loop {
            match self.lines.next() {
                Some(Ok(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('[') {
                        continue;
                    }
                    return Some(trimmed.to_string());
                }
                Some(Err(e)) => {
                    warn!("Read error in {}: {e}", self.path.display());
                    self.ok = false;
                    return None;
                }
                None => {
                    self.eof = true;
                    return None;
                }
            }
        }
    }

    fn add_dir(
        &mut self,
        tree: &mut Tree,
        attach_parent: NodeId,
        path: PathBuf,
        size: u64,
        mtime: i64,
    ) {
        let parent_id = match path.parent().and_then(|p| self.dirs_by_path.get(p)) {
            Some(&id) => id,
            None if self.dirs_by_path.is_empty() => attach_parent,
            None => {
                warn!(
                    "Cache entry {} has no parent in {}",
                    path.display(),
                    self.path.display()
                );
                self.ok = false;
                return;
            }
        };

        // Directly under the virtual root the node keeps the full path
        // as its name, like any scanned top level.
        let name = if parent_id == tree.root() {
            path.to_string_lossy().into_owned()
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned())
        };

        let mut node = Node::dir(name).with_stat(size, mtime, 0, 0, 0, 0, 0, 1);
        node.set_read_state(ReadState::Reading);
        let id = tree.insert_child(parent_id, node);

        if parent_id == tree.root() && tree.url().as_os_str().is_empty() {
            tree.set_root_location(path.clone(), 0, None);
        }

        self.dirs_by_path.insert(path, id);
        self.current_dir = Some(id);
        self.created_dirs.push(id);
    }

    fn add_file(&mut self, tree: &mut Tree, name: &str, size: u64, mtime: i64) {
        let Some(dir) = self.current_dir else {
            warn!(
                "File entry \"{name}\" before any directory in {}",
                self.path.display()
            );
            self.ok = false;
            return;
        };
        tree.insert_child(dir, Node::file(name).with_stat(size, mtime, 0, 0, 0, 0, 0, 1));
    }

    /// Mark every directory this reader created as broken. Used when
    /// the stream errors mid-way; the partial content stays visible.
    pub fn abandon(&mut self, tree: &mut Tree) {
        for &dir in self.created_dirs.iter().rev() {
            tree.send_finalize_local(dir);
            tree.set_read_state(dir, ReadState::Error);
        }
    }

    /// Settle every directory this reader created, deepest first.
    pub fn finalize(&mut self, tree: &mut Tree) {
        debug!(
            "Cache reading finished: {} dirs from {}",
            self.created_dirs.len(),
            self.path.display()
        );
        for &dir in self.created_dirs.iter().rev() {
            if tree.read_state(dir) != Some(ReadState::Error) {
                tree.send_finalize_local(dir);
                tree.set_read_state(dir, ReadState::Finished);
            }
        }
    }
}

fn open_lines(path: &Path) -> Result<CacheLines, ScanError> {
    let file = File::open(path).map_err(|e| ScanError::io(path, e))?;
    let mut lines = BufReader::new(GzDecoder::new(file)).lines();

    match lines.next() {
        Some(Ok(header)) if header.trim() == CACHE_HEADER => Ok(lines),
        Some(Ok(header)) => Err(ScanError::Cache {
            path: path.to_path_buf(),
            message: format!("unrecognized header \"{header}\""),
        }),
        Some(Err(e)) => Err(ScanError::Cache {
            path: path.to_path_buf(),
            message: format!("not a gzip text file: {e}"),
        }),
        None => Err(ScanError::Cache {
            path: path.to_path_buf(),
            message: "empty file".to_string(),
        }),
    }
}

fn parse_entry(line: &str) -> Option<CacheEntry> {
    let mut fields = line.split_whitespace();
    let kind = fields.next()?;
    let raw_name = fields.next()?;
    let size: u64 = fields.next()?.parse().ok()?;
    let mtime: i64 = fields.next()?.parse().ok()?;

    match kind {
        "D" => Some(CacheEntry::Dir {
            path: PathBuf::from(unescape(raw_name)),
            size,
            mtime,
        }),
        "F" => Some(CacheEntry::File {
            name: unescape(raw_name),
            size,
            mtime,
        }),
        _ => None,
    }
}

/// Consumes a cache snapshot in bounded chunks, one per tick.
#[derive(Debug)]
pub(crate) struct CacheReadJob {
    dir: NodeId,
    reader: Option<CacheReader>,
}

impl CacheReadJob {
    /// Create a job inserting the snapshot under `attach_parent`.
    pub(crate) fn new(tree: &mut Tree, attach_parent: NodeId, reader: CacheReader) -> Self {
        tree.read_job_added(attach_parent);
        let reader = if reader.ok() { Some(reader) } else { None };
        Self {
            dir: attach_parent,
            reader,
        }
    }

    pub(crate) fn dir(&self) -> NodeId {
        self.dir
    }

    /// Consume one chunk; called repeatedly until the stream ends.
    pub(crate) fn run(&mut self, tree: &mut Tree) -> JobOutcome {
        let Some(reader) = self.reader.as_mut() else {
            finish_reading(tree, self.dir, ReadState::Error);
            return JobOutcome::Finished;
        };

        reader.read(tree, self.dir, MAX_CACHE_LINES_PER_TICK);

        if reader.eof() || !reader.ok() {
            let state = if reader.ok() {
                reader.finalize(tree);
                ReadState::Finished
            } else {
                reader.abandon(tree);
                ReadState::Error
            };
            finish_reading(tree, self.dir, state);
            return JobOutcome::Finished;
        }

        JobOutcome::Yield
    }
}

/// Serializes a scanned subtree into the cache format.
pub struct CacheWriter;

impl CacheWriter {
    /// Write the subtree rooted at `top` to `path`.
    pub fn write(tree: &Tree, top: NodeId, path: &Path) -> Result<(), ScanError> {
        let file = File::create(path).map_err(|e| ScanError::io(path, e))?;
        let mut out = BufWriter::new(GzEncoder::new(file, Compression::default()));

        Self::write_all(tree, top, &mut out)
            .and_then(|()| out.flush())
            .map_err(|e| ScanError::io(path, e))?;

        let encoder = out
            .into_inner()
            .map_err(|e| ScanError::io(path, e.into_error()))?;
        encoder.finish().map_err(|e| ScanError::io(path, e))?;
        Ok(())
    }

    fn write_all(tree: &Tree, top: NodeId, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "{CACHE_HEADER}")?;
        writeln!(out, "# Generated by densitree")?;
        writeln!(out, "# Do not edit!")?;
        writeln!(out, "#")?;
        writeln!(out, "# Type  path/name  size  mtime")?;
        writeln!(out)?;
        Self::write_dir(tree, top, out)
    }

    fn write_dir(tree: &Tree, dir: NodeId, out: &mut impl Write) -> std::io::Result<()> {
        let Some(node) = tree.node(dir) else {
            return Ok(());
        };
        let url = tree.url_of(dir);
        writeln!(
            out,
            "D {} {} {}",
            escape(&url.to_string_lossy()),
            node.size,
            node.mtime
        )?;

        for &child in tree.children(dir) {
            if let Some(child_node) = tree.node(child) {
                if child_node.is_file() {
                    writeln!(
                        out,
                        "F {} {} {}",
                        escape(&child_node.name),
                        child_node.size,
                        child_node.mtime
                    )?;
                }
            }
        }
        for &child in tree.children(dir) {
            if tree.node(child).is_some_and(|n| n.is_dir()) {
                Self::write_dir(tree, child, out)?;
            }
        }
        Ok(())
    }
}

/// Percent-encode whitespace, `%`, and control characters. Everything
/// else, multi-byte characters included, passes through untouched.
fn escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == '%' || ch == ' ' || ch.is_control() {
            for byte in ch.to_string().as_bytes() {
                result.push('%');
                result.push_str(&format!("{byte:02X}"));
            }
        } else {
            result.push(ch);
        }
    }
    result
}

fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            if let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                result.push(byte);
                i += 3;
                continue;
            }
        }
        result.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&result).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        for name in ["plain", "with space", "100% sure", "tab\there", "naïve名前"] {
            assert_eq!(unescape(&escape(name)), name, "round trip of {name:?}");
        }
        assert_eq!(escape("a b"), "a%20b");
        assert_eq!(escape("50%"), "50%25");
    }

    #[test]
    fn test_parse_entry() {
        match parse_entry("D /t/a 4096 1700000000") {
            Some(CacheEntry::Dir { path, size, mtime }) => {
                assert_eq!(path, PathBuf::from("/t/a"));
                assert_eq!(size, 4096);
                assert_eq!(mtime, 1_700_000_000);
            }
            other => panic!("unexpected entry: {other:?}"),
        }

        match parse_entry("F notes%20file.txt 120 99") {
            Some(CacheEntry::File { name, .. }) => assert_eq!(name, "notes file.txt"),
            other => panic!("unexpected entry: {other:?}"),
        }

        assert!(parse_entry("X what 1 2").is_none());
        assert!(parse_entry("D /t notanumber 2").is_none());
        assert!(parse_entry("D /t").is_none());
    }

    #[test]
    fn test_open_rejects_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.gz");
        let file = File::create(&path).unwrap();
        let mut gz = GzEncoder::new(file, Compression::default());
        writeln!(gz, "[something else]").unwrap();
        gz.finish().unwrap();

        assert!(matches!(
            CacheReader::open(&path),
            Err(ScanError::Cache { .. })
        ));
    }

    #[test]
    fn test_open_rejects_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, "not gzip at all\n").unwrap();

        assert!(CacheReader::open(&path).is_err());
    }

    #[test]
    fn test_first_dir_and_rewind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.gz");
        let file = File::create(&path).unwrap();
        let mut gz = GzEncoder::new(file, Compression::default());
        writeln!(gz, "{CACHE_HEADER}").unwrap();
        writeln!(gz, "# comment").unwrap();
        writeln!(gz, "D /t 4096 1").unwrap();
        writeln!(gz, "F f1 10 2").unwrap();
        gz.finish().unwrap();

        let mut reader = CacheReader::open(&path).unwrap();
        assert_eq!(reader.first_dir(), Some(PathBuf::from("/t")));
        reader.rewind().unwrap();

        let mut tree = Tree::new();
        let root = tree.root();
        let consumed = reader.read(&mut tree, root, 1000);
        assert_eq!(consumed, 2);
        assert!(reader.ok());

        let top = tree.first_toplevel().unwrap();
        assert_eq!(tree.node(top).unwrap().name, "/t");
        assert_eq!(tree.children(top).len(), 1);
    }
}
