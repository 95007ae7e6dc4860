use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{Result, RoundtableError};

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Pulls `data:` payloads out of a server-sent-event byte stream.
///
/// Multi-line events are joined with `\n`; other fields (`event:`, `id:`, comments) are ignored.
/// The `[DONE]` sentinel ends the stream.
struct SseReader<R> {
    reader: R,
    line: Vec<u8>,
    event: String,
    limits: SseLimits,
    finished: bool,
}

impl<R> SseReader<R>
where
    R: AsyncBufRead + Unpin,
{
    fn new(reader: R, limits: SseLimits) -> Self {
        Self {
            reader,
            line: Vec::new(),
            event: String::new(),
            limits,
            finished: false,
        }
    }

    /// Reads one line (including its terminator) into `self.line`; `false` at EOF.
    async fn read_line(&mut self) -> Result<bool> {
        self.line.clear();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(!self.line.is_empty());
            }

            let newline = available.iter().position(|byte| *byte == b'\n');
            let take = newline.map_or(available.len(), |pos| pos + 1);
            if self.line.len().saturating_add(take) > self.limits.max_line_bytes {
                return Err(RoundtableError::InvalidResponse(format!(
                    "SSE line exceeds max_line_bytes={}",
                    self.limits.max_line_bytes
                )));
            }

            self.line.extend_from_slice(&available[..take]);
            self.reader.consume(take);
            if newline.is_some() {
                return Ok(true);
            }
        }
    }

    fn push_data(&mut self, data: &str) -> Result<()> {
        let separator = usize::from(!self.event.is_empty());
        let next_len = self
            .event
            .len()
            .saturating_add(separator)
            .saturating_add(data.len());
        if next_len > self.limits.max_event_bytes {
            return Err(RoundtableError::InvalidResponse(format!(
                "SSE event exceeds max_event_bytes={}",
                self.limits.max_event_bytes
            )));
        }
        if separator == 1 {
            self.event.push('\n');
        }
        self.event.push_str(data);
        Ok(())
    }

    fn take_event(&mut self) -> Option<String> {
        if self.event == DONE_SENTINEL {
            self.event.clear();
            self.finished = true;
            return None;
        }
        Some(std::mem::take(&mut self.event))
    }

    async fn next_data(&mut self) -> Result<Option<String>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            if !self.read_line().await? {
                self.finished = true;
                if self.event.is_empty() {
                    return Ok(None);
                }
                return Ok(self.take_event());
            }

            let line = std::str::from_utf8(&self.line).map_err(|err| {
                RoundtableError::InvalidResponse(format!("invalid SSE UTF-8: {err}"))
            })?;
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if self.event.is_empty() {
                    continue;
                }
                return Ok(self.take_event());
            }

            if let Some(rest) = line.strip_prefix("data:") {
                let rest = rest.strip_prefix(' ').unwrap_or(rest).to_string();
                self.push_data(&rest)?;
            }
        }
    }
}

pub fn sse_data_stream_from_reader_with_limits<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        SseReader::new(reader, limits),
        |mut reader| async move {
            let next = reader.next_data().await?;
            Ok(next.map(|data| (data, reader)))
        },
    ))
}

pub fn sse_data_stream_from_reader<R>(reader: R) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    sse_data_stream_from_reader_with_limits(reader, SseLimits::default())
}

pub fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    let reader = tokio::io::BufReader::new(StreamReader::new(bytes));
    sse_data_stream_from_reader(reader)
}
