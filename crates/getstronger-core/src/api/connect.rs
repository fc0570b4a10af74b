//! Connect protocol client over HTTP.
//!
//! Unary calls post a JSON message and read a JSON reply. Server streams
//! exchange enveloped JSON messages: each envelope is a flags byte, a
//! big-endian u32 length, then the payload. The last envelope carries the
//! end-of-stream flag and, on failure, the error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{header, Client};
use reqwest_cookie_store::CookieStoreMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use super::error::WireError;
use super::{ApiError, Code, MessageStream, RemoteError, RpcRequest, RpcTransport};

// ============================================================================
// Constants
// ============================================================================

/// Connect protocol version header value.
const PROTOCOL_VERSION: &str = "1";

/// Content type of unary JSON calls.
const UNARY_CONTENT_TYPE: &str = "application/json";

/// Content type of streaming JSON calls.
const STREAM_CONTENT_TYPE: &str = "application/connect+json";

/// Envelope header: one flags byte plus a four byte length.
const ENVELOPE_HEADER_LEN: usize = 5;

/// Largest envelope payload accepted from the server.
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_END_STREAM: u8 = 0b10;

/// TCP connect timeout. Streams are long-lived so no total timeout applies to them.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// RPC client for the getstronger API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ConnectClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl ConnectClient {
    /// Create a new client. `cookies` keeps the refresh token cookie set by
    /// login so refresh and logout calls carry it; the caller may persist it.
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        cookies: Arc<CookieStoreMutex>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .cookie_provider(cookies)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    fn url(&self, procedure: &str) -> String {
        format!("{}/{}", self.base_url, procedure)
    }

    /// Check if response is successful, turning the error body into a `RemoteError` if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status.as_u16(), &body).into())
        }
    }
}

#[async_trait]
impl RpcTransport for ConnectClient {
    async fn unary(&self, request: RpcRequest) -> Result<Value, ApiError> {
        trace!(procedure = request.procedure, "POST unary");

        let response = self
            .client
            .post(self.url(request.procedure))
            .headers(request.headers)
            .header(header::CONTENT_TYPE, UNARY_CONTENT_TYPE)
            .header("Connect-Protocol-Version", PROTOCOL_VERSION)
            .timeout(self.request_timeout)
            .json(&request.message)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn server_stream(&self, request: RpcRequest) -> Result<MessageStream, ApiError> {
        trace!(procedure = request.procedure, "POST server stream");

        let body = encode_envelope(&request.message)?;
        let response = self
            .client
            .post(self.url(request.procedure))
            .headers(request.headers)
            .header(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)
            .header("Connect-Protocol-Version", PROTOCOL_VERSION)
            .body(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from))
            .boxed();

        Ok(decode_envelopes(chunks))
    }
}

/// Frame a message as a single uncompressed envelope.
pub(crate) fn encode_envelope<T: Serialize>(message: &T) -> Result<Bytes, ApiError> {
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ApiError::InvalidResponse("message too large to frame".to_string()))?;

    let mut out = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    out.put_u8(0);
    out.put_u32(len);
    out.extend_from_slice(&payload);
    Ok(out.freeze())
}

#[derive(Debug, PartialEq, Eq)]
struct Envelope {
    flags: u8,
    payload: Bytes,
}

impl Envelope {
    /// Split one complete envelope off the front of `buf`, if buffered.
    /// Fails as soon as the header announces an oversized payload.
    fn split_from(buf: &mut BytesMut) -> Result<Option<Self>, ApiError> {
        if buf.len() < ENVELOPE_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ApiError::InvalidResponse(format!(
                "message of {} bytes exceeds the {} byte limit",
                len, MAX_MESSAGE_SIZE
            )));
        }
        if buf.len() < ENVELOPE_HEADER_LEN + len {
            return Ok(None);
        }
        let flags = buf[0];
        buf.advance(ENVELOPE_HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self { flags, payload }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct EndStream {
    #[serde(default)]
    error: Option<WireError>,
}

/// What one envelope means to the consumer of the stream.
enum Frame {
    Message(Value),
    End(Option<RemoteError>),
}

fn interpret(envelope: Envelope) -> Result<Frame, ApiError> {
    if envelope.flags & FLAG_COMPRESSED != 0 {
        return Err(ApiError::InvalidResponse(
            "compressed envelopes are not supported".to_string(),
        ));
    }

    if envelope.flags & FLAG_END_STREAM != 0 {
        let end: EndStream = if envelope.payload.is_empty() {
            EndStream::default()
        } else {
            serde_json::from_slice(&envelope.payload)?
        };
        return Ok(Frame::End(end.error.map(|e| e.into_remote(Code::Unknown))));
    }

    Ok(Frame::Message(serde_json::from_slice(&envelope.payload)?))
}

struct EnvelopeReader {
    chunks: BoxStream<'static, Result<Bytes, ApiError>>,
    buffer: BytesMut,
    finished: bool,
}

impl EnvelopeReader {
    async fn next_item(&mut self) -> Option<Result<Value, ApiError>> {
        if self.finished {
            return None;
        }

        loop {
            let envelope = match Envelope::split_from(&mut self.buffer) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            };
            if let Some(envelope) = envelope {
                match interpret(envelope) {
                    Ok(Frame::Message(message)) => return Some(Ok(message)),
                    Ok(Frame::End(None)) => {
                        debug!("server closed stream");
                        self.finished = true;
                        return None;
                    }
                    Ok(Frame::End(Some(error))) => {
                        self.finished = true;
                        return Some(Err(error.into()));
                    }
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }

            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    return Some(Err(ApiError::InvalidResponse(
                        "stream ended without an end-of-stream message".to_string(),
                    )));
                }
            }
        }
    }
}

/// Turn a raw body byte stream into a stream of decoded messages.
pub(crate) fn decode_envelopes(chunks: BoxStream<'static, Result<Bytes, ApiError>>) -> MessageStream {
    let reader = EnvelopeReader {
        chunks,
        buffer: BytesMut::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        let item = reader.next_item().await?;
        Some((item, reader))
    })
    .boxed()
}
