//! Server-sent-event decoding shared by the HTTP adapters
//!
//! ```text
//! event: content_block_delta
//! data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}
//!
//! data: [DONE]
//! ```

use bytes::BytesMut;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;

use crate::stream_adapter::{ChunkStream, UpstreamResponse};
use crate::{Error, Result};

/// One dispatched SSE frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// What a provider parser decided about one frame
#[derive(Debug)]
pub enum FrameOutcome {
    Chunk(UpstreamResponse),
    Skip,
    Done,
    Fail(Error),
}

/// Incremental line decoder over a byte buffer
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(frame) = self.feed_line(line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Dispatch whatever is left once the body has ended
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let rest = String::from_utf8_lossy(&rest).trim_end().to_string();
            if let Some(frame) = self.feed_line(&rest) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

struct DecodeState<F> {
    body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<UpstreamResponse>>,
    parse: F,
    finished: bool,
}

impl<F> DecodeState<F>
where
    F: FnMut(SseFrame) -> FrameOutcome,
{
    fn apply(&mut self, frame: SseFrame) {
        if self.finished {
            return;
        }
        if frame.is_done_marker() {
            self.finished = true;
            return;
        }
        match (self.parse)(frame) {
            FrameOutcome::Chunk(chunk) => self.pending.push_back(Ok(chunk)),
            FrameOutcome::Skip => {}
            FrameOutcome::Done => self.finished = true,
            FrameOutcome::Fail(err) => {
                self.pending.push_back(Err(err));
                self.finished = true;
            }
        }
    }
}

/// Turn a streaming HTTP response into normalized chunks using `parse`
pub fn decode_stream<F>(response: reqwest::Response, parse: F) -> ChunkStream
where
    F: FnMut(SseFrame) -> FrameOutcome + Send + 'static,
{
    let state = DecodeState {
        body: response.bytes_stream().boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        parse,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for frame in state.decoder.push(&bytes) {
                        state.apply(frame);
                    }
                }
                Some(Err(err)) => {
                    state.pending.push_back(Err(Error::from(err)));
                    state.finished = true;
                }
                None => {
                    if let Some(frame) = state.decoder.finish() {
                        state.apply(frame);
                    }
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
