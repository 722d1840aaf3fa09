//! Claims-change sources
//!
//! A source yields changes in sequence order starting at a requested
//! sequence number. The stream may never end; callers stop reading when
//! they are cancelled.

use super::message::{ClaimChange, ClaimType};
use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

/// Why a stream item could not be delivered.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The message itself is bad. Reading it again will not help, but the
    /// stream can continue past it.
    #[error("{location}: invalid claim change: {reason}")]
    Malformed {
        /// Present when the message got far enough to carry one
        sequence: Option<i64>,
        location: String,
        reason: String,
    },

    /// The connection or file failed. The stream ends after this item.
    #[error("claim change stream interrupted: {0:#}")]
    Transient(#[source] anyhow::Error),
}

impl StreamError {
    /// Sequence number to filter on, `None` when it must always be delivered.
    fn sequence(&self) -> Option<i64> {
        match self {
            StreamError::Malformed { sequence, .. } => *sequence,
            StreamError::Transient(_) => None,
        }
    }
}

pub type ChangeStream = BoxStream<'static, Result<ClaimChange, StreamError>>;

#[async_trait]
pub trait ClaimChangeSource: Send + Sync {
    /// Changes of `claim_type` with `sequence >= starting_sequence`, in order.
    async fn open_stream(
        &self,
        claim_type: ClaimType,
        starting_sequence: i64,
    ) -> anyhow::Result<ChangeStream>;
}

fn at_or_after(item: &Result<ClaimChange, StreamError>, starting_sequence: i64) -> bool {
    let sequence = match item {
        Ok(change) => Some(change.sequence),
        Err(e) => e.sequence(),
    };
    sequence.is_none_or(|s| s >= starting_sequence)
}

/// Reads newline-delimited JSON changes, one `<claim_type>.ndjson` file per
/// claim type, from a directory.
#[derive(Debug, Clone)]
pub struct NdjsonClaimSource {
    dir: PathBuf,
}

impl NdjsonClaimSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, claim_type: ClaimType) -> PathBuf {
        self.dir.join(format!("{claim_type}.ndjson"))
    }
}

async fn next_line(
    lines: &mut Lines<BufReader<File>>,
    line_no: &mut usize,
    path: &Path,
) -> anyhow::Result<Option<String>> {
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?
    {
        *line_no += 1;
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

/// Decode one line, keeping its sequence number when only the rest is bad.
fn decode_line(path: &Path, line_no: usize, line: &str) -> Result<ClaimChange, StreamError> {
    let location = format!("{}:{}", path.display(), line_no);
    let value: Value = serde_json::from_str(line).map_err(|e| StreamError::Malformed {
        sequence: None,
        location: location.clone(),
        reason: e.to_string(),
    })?;
    let sequence = value.get("sequence").and_then(Value::as_i64);
    serde_json::from_value(value).map_err(|e| StreamError::Malformed {
        sequence,
        location,
        reason: e.to_string(),
    })
}

#[async_trait]
impl ClaimChangeSource for NdjsonClaimSource {
    async fn open_stream(
        &self,
        claim_type: ClaimType,
        starting_sequence: i64,
    ) -> anyhow::Result<ChangeStream> {
        let path = self.path_for(claim_type);
        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open claim source {}", path.display()))?;

        let state = (BufReader::new(file).lines(), 0usize, path);
        let changes = stream::unfold(Some(state), |state| async move {
            let (mut lines, mut line_no, path) = state?;
            match next_line(&mut lines, &mut line_no, &path).await {
                Ok(None) => None,
                Ok(Some(line)) => {
                    let item = decode_line(&path, line_no, &line);
                    Some((item, Some((lines, line_no, path))))
                },
                Err(e) => Some((Err(StreamError::Transient(e)), None)),
            }
        });

        Ok(changes
            .filter(move |item| futures::future::ready(at_or_after(item, starting_sequence)))
            .boxed())
    }
}

/// One scripted item of a [`MemoryClaimSource`].
#[derive(Debug, Clone)]
pub enum SourceItem {
    Change(ClaimChange),
    Malformed { sequence: Option<i64>, reason: String },
    /// Ends the stream as a dropped connection would
    Disconnect,
}

#[derive(Debug, Default)]
struct MemoryState {
    opened_at: Vec<i64>,
    open_failures: u32,
    disconnects_left: u32,
}

/// Serves a fixed list of changes, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryClaimSource {
    items: Arc<Vec<SourceItem>>,
    hold_open: bool,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryClaimSource {
    pub fn new(changes: Vec<ClaimChange>) -> Self {
        Self::scripted(changes.into_iter().map(SourceItem::Change).collect())
    }

    pub fn scripted(items: Vec<SourceItem>) -> Self {
        Self {
            items: Arc::new(items),
            ..Self::default()
        }
    }

    /// After the listed changes, wait forever like a live stream.
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Fail the next `count` calls to `open_stream`.
    pub fn failing_opens(self, count: u32) -> Self {
        self.lock().open_failures = count;
        self
    }

    /// Honour only the first `count` [`SourceItem::Disconnect`]s served;
    /// later reads pass over them.
    pub fn disconnecting(self, count: u32) -> Self {
        self.lock().disconnects_left = count;
        self
    }

    /// Starting sequences of every successful `open_stream` call so far.
    pub fn opened_at(&self) -> Vec<i64> {
        self.lock().opened_at.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ClaimChangeSource for MemoryClaimSource {
    async fn open_stream(
        &self,
        _claim_type: ClaimType,
        starting_sequence: i64,
    ) -> anyhow::Result<ChangeStream> {
        let mut state = self.lock();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            anyhow::bail!("claim source unavailable");
        }
        state.opened_at.push(starting_sequence);

        let mut served = Vec::new();
        let mut disconnected = false;
        for item in self.items.iter() {
            let item = match item {
                SourceItem::Change(change) => Ok(change.clone()),
                SourceItem::Malformed { sequence, reason } => Err(StreamError::Malformed {
                    sequence: *sequence,
                    location: sequence.map_or_else(|| "memory".to_string(), |s| format!("memory#{s}")),
                    reason: reason.clone(),
                }),
                SourceItem::Disconnect if state.disconnects_left > 0 => {
                    state.disconnects_left -= 1;
                    disconnected = true;
                    Err(StreamError::Transient(anyhow::anyhow!("connection reset")))
                },
                SourceItem::Disconnect => continue,
            };
            if at_or_after(&item, starting_sequence) {
                served.push(item);
            }
            if disconnected {
                break;
            }
        }
        drop(state);

        let listed = stream::iter(served);
        Ok(if self.hold_open && !disconnected {
            listed.chain(stream::pending()).boxed()
        } else {
            listed.boxed()
        })
    }
}
