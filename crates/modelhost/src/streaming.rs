//! Server-sent event framing for inference payloads.
//!
//! Every frame is `data: <compact json>\n\n`. The encoder keeps no state
//! between calls, so each frame decodes on its own and a transport can replay
//! from any frame boundary. Writing, flushing and disconnect detection belong
//! to the transport.

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::error::{EncodingError, ServingError};

pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

const DATA_PREFIX: &str = "data: ";
const ID_PREFIX: &str = "id: ";
const TERMINATOR: &str = "\n\n";

/// One event wrapping a payload (a response increment, or a request echo).
#[derive(Debug, Clone)]
pub struct ServerSentEvent<'a, T: Serialize + ?Sized> {
    data: &'a T,
    id: Option<String>,
}

impl<'a, T: Serialize + ?Sized> ServerSentEvent<'a, T> {
    pub fn new(data: &'a T) -> Self {
        Self { data, id: None }
    }

    /// Adds an `id:` line so clients can resume with `Last-Event-ID`.
    /// Line breaks are dropped from the id; they would end the field early.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id: String = id.into();
        self.id = Some(id.chars().filter(|c| *c != '\n' && *c != '\r').collect());
        self
    }

    /// Serializes the whole frame, or nothing.
    pub fn encode(&self) -> Result<Bytes, EncodingError> {
        let json = serde_json::to_vec(self.data)?;

        let id_len = self.id.as_ref().map_or(0, |id| ID_PREFIX.len() + id.len() + 1);
        let mut frame =
            BytesMut::with_capacity(id_len + DATA_PREFIX.len() + json.len() + TERMINATOR.len());
        if let Some(id) = &self.id {
            frame.put_slice(ID_PREFIX.as_bytes());
            frame.put_slice(id.as_bytes());
            frame.put_u8(b'\n');
        }
        frame.put_slice(DATA_PREFIX.as_bytes());
        frame.put_slice(&json);
        frame.put_slice(TERMINATOR.as_bytes());
        Ok(frame.freeze())
    }
}

/// Encodes one payload as a `data:` frame.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, EncodingError> {
    ServerSentEvent::new(payload).encode()
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("frame does not end with a blank line")]
    Unterminated,

    #[error("frame has {0} data lines, expected exactly one")]
    DataLines(usize),

    #[error("frame payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client-side inverse of [`encode`]: strips the field prefix and the blank
/// line terminator and parses the JSON payload. Other fields (`id:`,
/// `event:`, `retry:`) are ignored.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, FrameError> {
    let text = std::str::from_utf8(frame)?;
    let body = text.strip_suffix(TERMINATOR).ok_or(FrameError::Unterminated)?;

    let data: Vec<&str> = body
        .split('\n')
        .filter_map(|line| line.strip_prefix(DATA_PREFIX))
        .collect();
    if data.len() != 1 {
        return Err(FrameError::DataLines(data.len()));
    }
    Ok(serde_json::from_str(data[0])?)
}

/// Frames every item of `stream` in order. The output ends after the first
/// upstream or encoding error, which is yielded as the final item; a frame is
/// never partially emitted. Dropping the output drops `stream`.
pub fn encode_stream<S, T, E>(stream: S) -> impl Stream<Item = Result<Bytes, ServingError>>
where
    S: Stream<Item = Result<T, E>>,
    T: Serialize,
    E: Into<ServingError>,
{
    async_stream::try_stream! {
        futures_util::pin_mut!(stream);
        while let Some(item) = futures_util::StreamExt::next(&mut stream).await {
            let payload = item.map_err(Into::<ServingError>::into)?;
            let frame = encode(&payload)?;
            yield frame;
        }
    }
}
