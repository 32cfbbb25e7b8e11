//! Handler that turns change events into report lines:
//!
//! ```text
//! DEPLOYMENT MODIFIED: default/web
//!  spec:
//! -  replicas: 3
//! +  replicas: 5
//! ```

use std::io;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use kwatch_core::{ChangeEvent, ResourceKind, ResourceRecord, VolatilityMask};
use kwatch_diff::external::{diff_with_tool, ExternalTool};
use kwatch_diff::{canonical_yaml, diff, diff_masked, DiffLine};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{EventHandler, HandlerError};

/// Destination for rendered lines. One call per event so blocks never interleave.
pub trait LineSink: Send + Sync {
    fn emit(&self, lines: &[String]) -> io::Result<()>;
}

/// Hands each block to a writer task so handlers never block on output.
///
/// Blocks are written in emit order. The task flushes after every block and
/// returns the writer once every clone of the sink is dropped.
#[derive(Clone)]
pub struct WriterSink {
    tx: mpsc::UnboundedSender<Vec<String>>,
}

impl WriterSink {
    pub fn spawn<W>(mut out: W) -> (Self, JoinHandle<io::Result<W>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();
        let task = tokio::spawn(async move {
            while let Some(lines) = rx.recv().await {
                let mut block = String::new();
                for l in &lines {
                    block.push_str(l);
                    block.push('\n');
                }
                out.write_all(block.as_bytes()).await?;
                out.flush().await?;
            }
            Ok(out)
        });
        (Self { tx }, task)
    }

    pub fn stdout() -> (Self, JoinHandle<io::Result<tokio::io::Stdout>>) {
        Self::spawn(tokio::io::stdout())
    }
}

impl LineSink for WriterSink {
    fn emit(&self, lines: &[String]) -> io::Result<()> {
        self.tx
            .send(lines.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "report writer stopped"))
    }
}

/// Collects lines in memory.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl LineSink for MemorySink {
    fn emit(&self, lines: &[String]) -> io::Result<()> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(lines);
        Ok(())
    }
}

pub struct ReportHandler<S> {
    sink: S,
    masks: FxHashMap<ResourceKind, VolatilityMask>,
    tool: Option<ExternalTool>,
    timestamps: bool,
}

impl<S: LineSink> ReportHandler<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, masks: FxHashMap::default(), tool: None, timestamps: false }
    }

    /// Strip `mask` from both sides before diffing `kind`.
    pub fn with_mask(mut self, kind: ResourceKind, mask: VolatilityMask) -> Self {
        self.masks.insert(kind, mask);
        self
    }

    /// Diff through an external program instead of the built-in engine.
    pub fn with_tool(mut self, tool: Option<ExternalTool>) -> Self {
        self.tool = tool;
        self
    }

    /// Prefix headers with a local `YYYY/MM/DD hh:mm:ss` timestamp.
    pub fn with_timestamps(mut self, on: bool) -> Self {
        self.timestamps = on;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn header(&self, event: &ChangeEvent) -> String {
        let line = format!("{} {}: {}", event.kind().label(), event.verb(), event.identity());
        if self.timestamps {
            format!("{} {}", chrono::Local::now().format("%Y/%m/%d %H:%M:%S"), line)
        } else {
            line
        }
    }

    async fn diff_lines(&self, old: &ResourceRecord, new: &ResourceRecord) -> Result<Vec<String>, HandlerError> {
        let mask = self.masks.get(&new.kind());
        match &self.tool {
            None => {
                let lines: Vec<DiffLine> = match mask {
                    Some(m) => diff_masked(old, new, m)?,
                    None => diff(old, new)?,
                };
                Ok(lines.iter().map(ToString::to_string).collect())
            }
            Some(tool) => {
                let (mut a, mut b) = (old.document(), new.document());
                if let Some(m) = mask {
                    m.apply(&mut a);
                    m.apply(&mut b);
                }
                let out = diff_with_tool(tool, &canonical_yaml(&a)?, &canonical_yaml(&b)?).await?;
                Ok(out.lines().map(str::to_string).collect())
            }
        }
    }
}

#[async_trait]
impl<S: LineSink> EventHandler for ReportHandler<S> {
    fn name(&self) -> &str {
        "report"
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        let mut lines = vec![self.header(event)];
        if let ChangeEvent::Modified { old, new } = event {
            match self.diff_lines(old, new).await {
                Ok(diff) => lines.extend(diff),
                Err(e) => {
                    self.sink.emit(&lines)?;
                    return Err(e);
                }
            }
        }
        self.sink.emit(&lines)?;
        Ok(())
    }
}
