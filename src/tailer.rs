/// Tails the EVE Online game log, yielding complete lines as they are written.
///
/// The pipeline calls [`TailerState::poll_bounded`] once per cycle. Each poll
/// stats the path, decides where to resume, and reads every complete line
/// appended since the last poll. A trailing line without its terminator is
/// left unread and picked up again once it is finished, so the stored offset
/// always sits at a line boundary and never exceeds the file size.
///
/// Rotation handling: the game client recreates the log when a new session
/// starts. We key on the file-system identity (device + inode on Unix,
/// creation time elsewhere) plus a fingerprint of the first bytes of the
/// file; a changed identity, a changed fingerprint, a file that shrank below
/// our offset, or a file that reappears after going missing all restart from
/// byte 0. The fingerprint catches in-place rewrites and, on Windows, a file
/// recreated under the same name that inherited the old creation time
/// (file-system tunneling).
///
/// Directory mode ([`TailerState::follow_directory`]): EVE writes one
/// timestamped `*.txt` per session into `Gamelogs`. Every poll rescans the
/// directory and switches to a newer session log as soon as one appears,
/// reading it from byte 0. An empty directory is simply waited on.
///
/// `notify` is only a wake hint here ([`watch_for_changes`]); the interval
/// timer in the pipeline is what guarantees progress.
use crate::error::TailError;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fs::{File, Metadata};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Bytes at the start of the file covered by the head fingerprint.
const HEAD_BYTES: u64 = 256;
/// Read size when scanning backwards for a line boundary.
const SCAN_CHUNK: u64 = 4096;

/// One complete line of the log, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub text:             String,
    /// Byte offset of the first byte of this line in the file.
    pub offset:           u64,
    /// Wall-clock time (epoch ms) of the poll that read the line.
    pub discovered_at_ms: u64,
}

impl RawLine {
    pub fn new(text: impl Into<String>, discovered_at_ms: u64) -> Self {
        Self { text: text.into(), offset: 0, discovered_at_ms }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileIdentity {
    Inode { dev: u64, ino: u64 },
    Created { nanos: u128 },
}

#[cfg(unix)]
fn identity_of(meta: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity::Inode { dev: meta.dev(), ino: meta.ino() })
}

// Creation time survives a delete-and-recreate within the tunneling window,
// so on these platforms the head fingerprint does most of the work.
#[cfg(not(unix))]
fn identity_of(meta: &Metadata) -> Option<FileIdentity> {
    meta.created()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| FileIdentity::Created { nanos: d.as_nanos() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchPosition {
    pub identity:  Option<FileIdentity>,
    pub offset:    u64,
    /// Number of leading bytes covered by `head_hash` (at most 256).
    pub head_len:  u64,
    pub head_hash: u64,
}

#[derive(Debug, Clone)]
pub struct TailerState {
    /// File being tailed. Empty while a followed directory holds no log.
    path:         PathBuf,
    directory:    Option<PathBuf>,
    position:     Option<WatchPosition>,
    missing:      bool,
    /// Only honoured for the very first poll.
    start_at_end: bool,
}

impl TailerState {
    pub fn new(path: impl Into<PathBuf>, start_at_end: bool) -> Self {
        Self {
            path: path.into(),
            directory: None,
            position: None,
            missing: false,
            start_at_end,
        }
    }

    /// Tail whichever `*.txt` in `dir` was modified most recently, moving on
    /// to newer session logs as the game creates them.
    pub fn follow_directory(dir: impl Into<PathBuf>, start_at_end: bool) -> Self {
        Self {
            path: PathBuf::new(),
            directory: Some(dir.into()),
            position: None,
            missing: false,
            start_at_end,
        }
    }

    /// Current log file; empty while a followed directory has no logs yet.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn position(&self) -> Option<WatchPosition> {
        self.position
    }

    /// Read every complete line appended since the previous poll.
    ///
    /// A missing file yields no lines and no error. Any other I/O failure is
    /// returned with the stored position untouched.
    pub fn poll(&mut self, now_ms: u64) -> Result<Vec<RawLine>, TailError> {
        self.follow_newest();
        if self.path.as_os_str().is_empty() {
            // Nothing to tail yet; whatever shows up later is new content.
            self.start_at_end = false;
            return Ok(Vec::new());
        }

        let meta = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !self.missing && self.position.is_some() {
                    tracing::info!("Game log {:?} disappeared, waiting for it to return", self.path);
                }
                self.missing = true;
                self.start_at_end = false;
                return Ok(Vec::new());
            }
            Err(e) => return Err(TailError::io(&self.path, e)),
        };
        if !meta.is_file() {
            return Err(TailError::io(
                &self.path,
                std::io::Error::other("not a regular file"),
            ));
        }
        let identity = identity_of(&meta);
        let file_len = meta.len();

        let head_changed = match self.position {
            Some(pos)
                if !self.missing
                    && pos.identity == identity
                    && pos.head_len > 0
                    && file_len >= pos.head_len =>
            {
                head_print(&self.path, pos.head_len)? != pos.head_hash
            }
            _ => false,
        };

        let start = match self.position {
            None if self.start_at_end && !self.missing => self.last_line_boundary(file_len)?,
            None => 0,
            Some(_) if self.missing => {
                tracing::info!("Game log {:?} reappeared, reading from byte 0", self.path);
                0
            }
            Some(pos) if pos.identity != identity => {
                tracing::info!("Game log rotation detected (new file identity), restarting from byte 0");
                0
            }
            Some(pos) if file_len < pos.offset => {
                tracing::info!(
                    "Game log truncated ({} -> {} bytes), restarting from byte 0",
                    pos.offset,
                    file_len
                );
                0
            }
            Some(_) if head_changed => {
                tracing::info!("Game log rewritten (start of file changed), restarting from byte 0");
                0
            }
            Some(pos) => pos.offset,
        };

        let (lines, consumed) = if file_len > start {
            self.read_from(start, now_ms)?
        } else {
            (Vec::new(), 0)
        };

        let offset = start + consumed;
        let head_len = offset.min(HEAD_BYTES);
        let head_hash = match self.position {
            Some(pos) if pos.head_len == head_len && start == pos.offset => pos.head_hash,
            _ => head_print(&self.path, head_len)?,
        };

        self.position = Some(WatchPosition { identity, offset, head_len, head_hash });
        self.missing = false;
        self.start_at_end = false;
        Ok(lines)
    }

    /// In directory mode, switch to a session log newer than the current one.
    fn follow_newest(&mut self) {
        let Some(dir) = &self.directory else {
            return;
        };
        let Some((newest, newest_modified)) = newest_log(dir) else {
            return;
        };
        if newest == self.path {
            return;
        }

        if self.path.as_os_str().is_empty() {
            tracing::info!("Following game log {:?}", newest);
        } else {
            let current_modified = std::fs::metadata(&self.path).and_then(|m| m.modified());
            if matches!(current_modified, Ok(t) if t >= newest_modified) {
                return;
            }
            tracing::info!("New session log {:?}, switching from {:?}", newest, self.path);
            // Only the log present at startup may start at its end.
            self.start_at_end = false;
        }

        self.path     = newest;
        self.position = None;
        self.missing  = false;
    }

    /// Offset just past the last `\n` before `end`, or 0 when there is none.
    fn last_line_boundary(&self, end: u64) -> Result<u64, TailError> {
        let mut file = File::open(&self.path).map_err(|e| TailError::io(&self.path, e))?;
        let mut buf = vec![0u8; SCAN_CHUNK as usize];
        let mut chunk_end = end;

        while chunk_end > 0 {
            let chunk_start = chunk_end.saturating_sub(SCAN_CHUNK);
            let len = (chunk_end - chunk_start) as usize;
            file.seek(SeekFrom::Start(chunk_start))
                .and_then(|_| file.read_exact(&mut buf[..len]))
                .map_err(|e| TailError::io(&self.path, e))?;

            if let Some(i) = buf[..len].iter().rposition(|b| *b == b'\n') {
                return Ok(chunk_start + i as u64 + 1);
            }
            chunk_end = chunk_start;
        }
        Ok(0)
    }

    /// Returns the complete lines from `start` and the number of bytes they
    /// span (terminators included).
    fn read_from(&self, start: u64, now_ms: u64) -> Result<(Vec<RawLine>, u64), TailError> {
        let mut file = File::open(&self.path).map_err(|e| TailError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| TailError::io(&self.path, e))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| TailError::io(&self.path, e))?;

        let mut lines = Vec::new();
        let mut line_start = 0usize;
        for (i, byte) in buf.iter().enumerate() {
            if *byte != b'\n' {
                continue;
            }
            let mut raw = &buf[line_start..i];
            if let Some(stripped) = raw.strip_suffix(b"\r") {
                raw = stripped;
            }
            lines.push(RawLine {
                text:             String::from_utf8_lossy(raw).into_owned(),
                offset:           start + line_start as u64,
                discovered_at_ms: now_ms,
            });
            line_start = i + 1;
        }
        Ok((lines, line_start as u64))
    }

    /// Run [`poll`](Self::poll) on the blocking pool, giving up after `limit`.
    ///
    /// The poll works on a copy of the state; the copy is committed only when
    /// the read finishes in time and succeeds, so a hung or failed read leaves
    /// the position exactly where the previous cycle put it.
    pub async fn poll_bounded(
        &mut self,
        limit:  Duration,
        now_ms: u64,
    ) -> Result<Vec<RawLine>, TailError> {
        let mut worker = self.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let result = worker.poll(now_ms);
            (worker, result)
        });

        match tokio::time::timeout(limit, handle).await {
            Ok(Ok((worker, Ok(lines)))) => {
                *self = worker;
                Ok(lines)
            }
            Ok(Ok((_, Err(e)))) => Err(e),
            Ok(Err(join_err)) => Err(TailError::Worker(join_err.to_string())),
            Err(_) => Err(TailError::TimedOut { after_ms: limit.as_millis() as u64 }),
        }
    }
}

/// Hash of the first `len` bytes of the file.
fn head_print(path: &Path, len: u64) -> Result<u64, TailError> {
    let mut head = Vec::with_capacity(len as usize);
    File::open(path)
        .and_then(|f| f.take(len).read_to_end(&mut head))
        .map_err(|e| TailError::io(path, e))?;

    let mut hasher = DefaultHasher::new();
    head.hash(&mut hasher);
    Ok(hasher.finish())
}

// ---------------------------------------------------------------------------
// Log directory helpers
// ---------------------------------------------------------------------------

fn is_game_log(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"))
}

fn newest_log(logs_dir: &Path) -> Option<(PathBuf, SystemTime)> {
    let entries = std::fs::read_dir(logs_dir).ok()?;

    let mut best: Option<(PathBuf, SystemTime)> = None;

    for entry in entries.flatten() {
        let path = entry.path();
        if !is_game_log(&path) {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };

        match &best {
            None => best = Some((path, modified)),
            Some((_, best_time)) if modified >= *best_time => best = Some((path, modified)),
            _ => {}
        }
    }
    best
}

/// Scans `logs_dir` for `*.txt` game logs and returns the one with the most
/// recent `modified` timestamp. `None` if there are none.
pub fn find_latest_log(logs_dir: &Path) -> Option<PathBuf> {
    let best = newest_log(logs_dir).map(|(p, _)| p);
    if let Some(ref p) = best {
        tracing::debug!("find_latest_log: selected {:?}", p);
    }
    best
}

// ---------------------------------------------------------------------------
// File-system wake hint
// ---------------------------------------------------------------------------

/// Watch the log's directory and signal (at most one pending) wake-up
/// whenever the tailed file, or in directory mode any `*.txt` in it, is
/// created, modified or removed.
///
/// The returned watcher must be kept alive for as long as hints are wanted.
pub fn watch_for_changes(
    tailer: &TailerState,
) -> notify::Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (watch_dir, file_name) = match tailer.directory() {
        Some(dir) => (dir.to_path_buf(), None),
        None => {
            let parent = tailer
                .path()
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            (parent, tailer.path().file_name().map(|n| n.to_os_string()))
        }
    };

    let (tx, rx) = mpsc::channel::<()>(1);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
            ) && event.paths.iter().any(|p| match &file_name {
                Some(name) => p.file_name() == Some(name.as_os_str()),
                None => is_game_log(p),
            });
            if relevant {
                // Full channel means a wake is already pending.
                let _ = tx.try_send(());
            }
        }
        Err(e) => tracing::warn!("File watcher error: {}", e),
    })?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

    tracing::info!("Watching {:?} for log changes", watch_dir);
    Ok((watcher, rx))
}
