//! Event decoder
//!
//! [`RecordParser`] turns lines into events. [`Decoder`] runs it as a task
//! over a byte stream so consumers can call [`Decoder::read`] from any number
//! of tasks while the stream is read independently.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::CodecError;
use super::event::Event;

/// Default bound on one line and on one record
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1 << 20;

/// Events decoded ahead of the consumer
const EVENT_BUFFER: usize = 64;

/// Line-at-a-time record assembly
#[derive(Debug)]
pub struct RecordParser {
    max_record_size: usize,
    kind: Option<String>,
    id: Option<u64>,
    data: Vec<u8>,
    time: Option<DateTime<Utc>>,
    has_field: bool,
    size: usize,
    line: u64,
}

impl RecordParser {
    pub fn new(max_record_size: usize) -> Self {
        Self {
            max_record_size,
            kind: None,
            id: None,
            data: Vec::new(),
            time: None,
            has_field: false,
            size: 0,
            line: 0,
        }
    }

    /// Feed one line without its terminating `\n`; returns an event on dispatch
    pub fn feed_line(&mut self, line: &[u8]) -> Result<Option<Event>, CodecError> {
        self.line += 1;
        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if line[0] == b':' {
            return Ok(None);
        }

        self.size += line.len() + 1;
        if self.size > self.max_record_size || line.len() > self.max_record_size {
            return Err(CodecError::RecordTooLarge {
                limit: self.max_record_size,
            });
        }

        let (name, value) = match line.iter().position(|b| *b == b':') {
            Some(i) => (&line[..i], &line[i + 1..]),
            None => (line, &line[line.len()..]),
        };
        let value = value.strip_prefix(b" ").unwrap_or(value);
        self.has_field = true;

        match name {
            b"event" => {
                let kind = std::str::from_utf8(value).map_err(|e| self.error(format!("event is not UTF-8: {}", e)))?;
                self.kind = Some(kind.to_string());
            }
            b"id" => {
                let id = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| self.error(format!("invalid id '{}'", String::from_utf8_lossy(value))))?;
                self.id = Some(id);
            }
            b"data" => {
                self.data.extend_from_slice(value);
                self.data.push(b'\n');
            }
            b"time" => {
                let time = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                    .map(|t| t.with_timezone(&Utc));
                self.time = Some(time.unwrap_or_else(Utc::now));
            }
            _ => {}
        }
        Ok(None)
    }

    fn error(&self, reason: String) -> CodecError {
        CodecError::Decode { line: self.line, reason }
    }

    fn dispatch(&mut self) -> Option<Event> {
        if !self.has_field {
            return None;
        }
        let event = Event {
            kind: self.kind.take().unwrap_or_else(|| Event::DEFAULT_KIND.to_string()),
            id: self.id.take().unwrap_or(0),
            data: std::mem::take(&mut self.data),
            time: self.time.take().unwrap_or_else(Utc::now),
        };
        self.has_field = false;
        self.size = 0;
        Some(event)
    }
}

/// Read one `\n`-terminated line into `line`, without the terminator
///
/// Returns `false` at end of stream; a trailing partial line is dropped.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> Result<bool, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(false);
        }
        let (take, done) = match buf.iter().position(|b| *b == b'\n') {
            Some(i) => (i, true),
            None => (buf.len(), false),
        };
        if line.len() + take > max {
            return Err(CodecError::RecordTooLarge { limit: max });
        }
        line.extend_from_slice(&buf[..take]);
        reader.consume(if done { take + 1 } else { take });
        if done {
            return Ok(true);
        }
    }
}

async fn decode_stream<R>(mut reader: R, max_record_size: usize, tx: &mpsc::Sender<Event>) -> CodecError
where
    R: AsyncBufRead + Unpin,
{
    let mut parser = RecordParser::new(max_record_size);
    let mut line = Vec::new();
    loop {
        match read_line(&mut reader, &mut line, max_record_size).await {
            Ok(true) => {}
            Ok(false) => return CodecError::EndOfStream,
            Err(e) => return e,
        }
        match parser.feed_line(&line) {
            Ok(Some(event)) => {
                if tx.send(event).await.is_err() {
                    return CodecError::Closed;
                }
            }
            Ok(None) => {}
            Err(e) => return e,
        }
    }
}

/// Concurrent-safe reader over a decoded event stream
pub struct Decoder {
    events: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    terminal: Arc<Mutex<Option<CodecError>>>,
    closed: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("closed", &*self.closed.borrow())
            .finish_non_exhaustive()
    }
}

impl Decoder {
    /// Start decoding `reader` in its own task
    pub fn new<R>(reader: R, max_record_size: usize) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        debug!(max_record_size, "Decoder::new: called");
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let terminal = Arc::new(Mutex::new(None));
        let task_terminal = terminal.clone();
        let task = tokio::spawn(async move {
            let error = decode_stream(reader, max_record_size, &tx).await;
            match &error {
                CodecError::EndOfStream | CodecError::Closed => debug!(%error, "Decoder task finished"),
                _ => warn!(%error, "Decoder task failed"),
            }
            // Set before the event sender drops so readers see it after the last event
            *task_terminal.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
            drop(tx);
        });

        let (closed, _) = watch::channel(false);
        Self {
            events: tokio::sync::Mutex::new(rx),
            terminal,
            closed,
            task: Mutex::new(Some(task)),
        }
    }

    fn terminal(&self) -> CodecError {
        self.terminal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or(CodecError::EndOfStream)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Next event, or the stream's terminal error once reached
    pub async fn read(&self) -> Result<Event, CodecError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(CodecError::Closed);
        }

        let mut events = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => return Err(CodecError::Closed),
            events = self.events.lock() => events,
        };
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(CodecError::Closed),
            event = events.recv() => match event {
                Some(event) => Ok(event),
                None => Err(self.terminal()),
            },
        }
    }

    /// Stop decoding and release the stream; the second call returns `Closed`
    pub fn close(&self) -> Result<(), CodecError> {
        if self.closed.send_replace(true) {
            return Err(CodecError::Closed);
        }
        debug!("Decoder::close: closing");
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
