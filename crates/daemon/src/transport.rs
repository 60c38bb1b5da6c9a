//! Transport-neutral message channel and the websocket wire layer.
//!
//! Sessions speak to a pair of boxed [`Sink`] and [`Stream`] values carrying
//! [`WsMessage`]s instead of a concrete socket type. The HTTP layer completes
//! the upgrade handshake itself and frames the raw connection with
//! [`WsCodec`]: legacy clients put raw resize bytes in text messages, so text
//! payloads are carried as bytes and never checked for UTF-8. Tests plug in
//! an in-memory channel.

use std::io;
use std::pin::Pin;

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Sink, StreamExt};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// One message on a bidirectional message channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// A binary message, one encoded frame.
    Binary(Vec<u8>),
    /// A text message, the legacy encoding. Raw bytes, not necessarily UTF-8.
    Text(Vec<u8>),
    /// Transport-level ping.
    Ping(Vec<u8>),
    /// Transport-level pong.
    Pong(Vec<u8>),
    /// Close notification.
    Close,
}

/// Outbound half of a channel.
pub type MessageSink = Pin<Box<dyn Sink<WsMessage, Error = io::Error> + Send>>;

/// Inbound half of a channel. The stream ends when the peer goes away.
pub type MessageStream = BoxStream<'static, io::Result<WsMessage>>;

/// GUID appended to the client key when computing the accept key.
const HANDSHAKE_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version accepted.
const WEBSOCKET_VERSION: &str = "13";

const FIN: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Largest payload a control frame may carry.
const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Status code sent with the server's close frame.
const CLOSE_NORMAL: u16 = 1000;

/// Reasons an upgrade request is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// `Upgrade: websocket` is missing.
    #[error("missing Upgrade: websocket header")]
    NotWebSocket,

    /// `Connection` does not list `upgrade`.
    #[error("missing Connection: upgrade header")]
    NotUpgrade,

    /// `Sec-WebSocket-Version` is not 13.
    #[error("unsupported websocket version")]
    UnsupportedVersion,

    /// `Sec-WebSocket-Key` is missing.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

fn header_is(headers: &HeaderMap, name: header::HeaderName, value: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(value))
}

fn header_contains_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Checks an upgrade request and returns the `Sec-WebSocket-Accept` value.
pub fn upgrade_accept_key(headers: &HeaderMap) -> Result<String, HandshakeError> {
    if !header_is(headers, header::UPGRADE, "websocket") {
        return Err(HandshakeError::NotWebSocket);
    }
    if !header_contains_token(headers, header::CONNECTION, "upgrade") {
        return Err(HandshakeError::NotUpgrade);
    }
    if !header_is(headers, header::SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION) {
        return Err(HandshakeError::UnsupportedVersion);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::MissingKey)?;
    Ok(accept_key(key.as_bytes()))
}

/// Derives the accept key for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key);
    sha1.update(HANDSHAKE_GUID);
    BASE64.encode(sha1.finalize())
}

fn protocol_error(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

fn is_control(opcode: u8) -> bool {
    opcode & 0x8 != 0
}

/// One frame off the wire, unmasked.
struct RawFrame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Server side websocket framing.
///
/// Decodes masked client frames, reassembling fragmented messages, and
/// encodes unmasked unfragmented server frames. No extensions are
/// negotiated, so frames with reserved bits set are rejected.
#[derive(Debug)]
pub struct WsCodec {
    max_message_size: usize,
    /// Opcode and payload of a fragmented message in progress.
    partial: Option<(u8, Vec<u8>)>,
}

impl WsCodec {
    /// A codec refusing messages longer than `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            partial: None,
        }
    }

    fn decode_frame(&self, src: &mut BytesMut) -> io::Result<Option<RawFrame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let (b0, b1) = (src[0], src[1]);
        if b0 & RSV_BITS != 0 {
            return Err(protocol_error("reserved bits set"));
        }
        if b1 & MASK_BIT == 0 {
            return Err(protocol_error("client frame is not masked"));
        }

        let fin = b0 & FIN != 0;
        let opcode = b0 & OPCODE_BITS;

        let (len, len_end) = match b1 & LEN_BITS {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (u64::from(n), 2),
        };

        if is_control(opcode) && (!fin || len > MAX_CONTROL_PAYLOAD) {
            return Err(protocol_error("invalid control frame"));
        }
        if len > self.max_message_size as u64 {
            return Err(protocol_error("frame exceeds maximum message size"));
        }

        let payload_start = len_end + 4;
        let total = payload_start + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        let mask = [
            frame[len_end],
            frame[len_end + 1],
            frame[len_end + 2],
            frame[len_end + 3],
        ];
        let payload = frame[payload_start..]
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4])
            .collect();

        Ok(Some(RawFrame {
            fin,
            opcode,
            payload,
        }))
    }

    fn assemble(&mut self, frame: RawFrame) -> io::Result<Option<WsMessage>> {
        match frame.opcode {
            OP_CLOSE => Ok(Some(WsMessage::Close)),
            OP_PING => Ok(Some(WsMessage::Ping(frame.payload))),
            OP_PONG => Ok(Some(WsMessage::Pong(frame.payload))),
            OP_TEXT | OP_BINARY => {
                if self.partial.is_some() {
                    return Err(protocol_error("new message inside a fragmented message"));
                }
                if frame.fin {
                    return Ok(Some(data_message(frame.opcode, frame.payload)));
                }
                self.partial = Some((frame.opcode, frame.payload));
                Ok(None)
            }
            OP_CONTINUATION => {
                let Some((opcode, mut payload)) = self.partial.take() else {
                    return Err(protocol_error("continuation without a message"));
                };
                if payload.len() + frame.payload.len() > self.max_message_size {
                    return Err(protocol_error("message exceeds maximum message size"));
                }
                payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    Ok(Some(data_message(opcode, payload)))
                } else {
                    self.partial = Some((opcode, payload));
                    Ok(None)
                }
            }
            _ => Err(protocol_error("unknown opcode")),
        }
    }
}

fn data_message(opcode: u8, payload: Vec<u8>) -> WsMessage {
    if opcode == OP_TEXT {
        WsMessage::Text(payload)
    } else {
        WsMessage::Binary(payload)
    }
}

impl Decoder for WsCodec {
    type Item = WsMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<WsMessage>> {
        // Fragments of a larger message produce nothing until the last one
        while let Some(frame) = self.decode_frame(src)? {
            if let Some(message) = self.assemble(frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

impl Encoder<WsMessage> for WsCodec {
    type Error = io::Error;

    fn encode(&mut self, message: WsMessage, dst: &mut BytesMut) -> io::Result<()> {
        let (opcode, payload) = match message {
            WsMessage::Binary(payload) => (OP_BINARY, payload),
            WsMessage::Text(payload) => (OP_TEXT, payload),
            WsMessage::Ping(payload) => (OP_PING, payload),
            WsMessage::Pong(payload) => (OP_PONG, payload),
            WsMessage::Close => (OP_CLOSE, CLOSE_NORMAL.to_be_bytes().to_vec()),
        };

        dst.reserve(10 + payload.len());
        dst.put_u8(FIN | opcode);
        match payload.len() {
            n if n < 126 => dst.put_u8(n as u8),
            n if n <= usize::from(u16::MAX) => {
                dst.put_u8(126);
                dst.put_u16(n as u16);
            }
            n => {
                dst.put_u8(127);
                dst.put_u64(n as u64);
            }
        }
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Frames an upgraded connection and splits it into a channel.
pub fn split_upgraded<IO>(io: IO, max_message_size: usize) -> (MessageSink, MessageStream)
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (sink, stream) = Framed::new(io, WsCodec::new(max_message_size)).split();
    (Box::pin(sink), stream.boxed())
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use futures_util::SinkExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Builds a masked client frame.
    fn client_frame(first: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut out = vec![first];
        match payload.len() {
            n if n < 126 => out.push(MASK_BIT | n as u8),
            n if n <= usize::from(u16::MAX) => {
                out.push(MASK_BIT | 126);
                out.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                out.push(MASK_BIT | 127);
                out.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(&mask);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        out
    }

    fn decode_all(codec: &mut WsCodec, bytes: &[u8]) -> io::Result<Vec<WsMessage>> {
        let mut buf = BytesMut::from(bytes);
        let mut messages = Vec::new();
        while let Some(msg) = codec.decode(&mut buf)? {
            messages.push(msg);
        }
        Ok(messages)
    }

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers
    }

    #[test]
    fn test_accept_key_known_value() {
        // Sample handshake from RFC 6455 section 1.3
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(
            upgrade_accept_key(&upgrade_headers()).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_handshake_rejections() {
        let mut headers = upgrade_headers();
        headers.remove(header::UPGRADE);
        assert_eq!(upgrade_accept_key(&headers), Err(HandshakeError::NotWebSocket));

        let mut headers = upgrade_headers();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert_eq!(upgrade_accept_key(&headers), Err(HandshakeError::NotUpgrade));

        let mut headers = upgrade_headers();
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert_eq!(
            upgrade_accept_key(&headers),
            Err(HandshakeError::UnsupportedVersion)
        );

        let mut headers = upgrade_headers();
        headers.remove(header::SEC_WEBSOCKET_KEY);
        assert_eq!(upgrade_accept_key(&headers), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn test_text_payload_is_not_utf8_checked() {
        let mut codec = WsCodec::new(1024);
        let resize = [0x01, 0x00, 0x18, 0x00, 0x84];

        let messages = decode_all(&mut codec, &client_frame(FIN | OP_TEXT, &resize)).unwrap();
        assert_eq!(messages, vec![WsMessage::Text(resize.to_vec())]);
    }

    #[test]
    fn test_decode_message_kinds() {
        let mut codec = WsCodec::new(1024);
        let mut wire = client_frame(FIN | OP_BINARY, &[0x00, b'h', b'i']);
        wire.extend(client_frame(FIN | OP_PING, b"p"));
        wire.extend(client_frame(FIN | OP_PONG, b""));
        wire.extend(client_frame(FIN | OP_CLOSE, &[0x03, 0xe8]));

        assert_eq!(
            decode_all(&mut codec, &wire).unwrap(),
            vec![
                WsMessage::Binary(vec![0x00, b'h', b'i']),
                WsMessage::Ping(b"p".to_vec()),
                WsMessage::Pong(vec![]),
                WsMessage::Close,
            ]
        );
    }

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let mut codec = WsCodec::new(100_000);
        let payload = vec![b'z'; 70_000];
        let wire = client_frame(FIN | OP_BINARY, &payload);

        let mut buf = BytesMut::from(&wire[..5]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[5..wire.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[wire.len() - 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(WsMessage::Binary(payload)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fragmented_message_with_interleaved_ping() {
        let mut codec = WsCodec::new(1024);
        let mut wire = client_frame(OP_TEXT, b"aGVs");
        wire.extend(client_frame(FIN | OP_PING, b""));
        wire.extend(client_frame(OP_CONTINUATION, b"bG8"));
        wire.extend(client_frame(FIN | OP_CONTINUATION, b"="));

        assert_eq!(
            decode_all(&mut codec, &wire).unwrap(),
            vec![WsMessage::Ping(vec![]), WsMessage::Text(b"aGVsbG8=".to_vec())]
        );
    }

    #[test]
    fn test_decode_protocol_errors() {
        let unmasked = vec![FIN | OP_BINARY, 0x01, 0x00];
        assert!(decode_all(&mut WsCodec::new(1024), &unmasked).is_err());

        let reserved = client_frame(FIN | 0x40 | OP_BINARY, b"x");
        assert!(decode_all(&mut WsCodec::new(1024), &reserved).is_err());

        let fragmented_ping = client_frame(OP_PING, b"");
        assert!(decode_all(&mut WsCodec::new(1024), &fragmented_ping).is_err());

        let stray_continuation = client_frame(FIN | OP_CONTINUATION, b"x");
        assert!(decode_all(&mut WsCodec::new(1024), &stray_continuation).is_err());

        let too_big = client_frame(FIN | OP_BINARY, &[0u8; 65]);
        assert!(decode_all(&mut WsCodec::new(64), &too_big).is_err());
    }

    #[test]
    fn test_encode_server_frames() {
        let mut codec = WsCodec::new(1024);
        let mut buf = BytesMut::new();

        codec.encode(WsMessage::Binary(vec![0x03]), &mut buf).unwrap();
        assert_eq!(&buf[..], &[FIN | OP_BINARY, 0x01, 0x03]);

        buf.clear();
        codec.encode(WsMessage::Close, &mut buf).unwrap();
        assert_eq!(&buf[..], &[FIN | OP_CLOSE, 0x02, 0x03, 0xe8]);

        buf.clear();
        codec.encode(WsMessage::Binary(vec![0; 300]), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[FIN | OP_BINARY, 126, 0x01, 0x2c]);
        assert_eq!(buf.len(), 304);
    }

    #[tokio::test]
    async fn test_split_upgraded_over_duplex() {
        let (server_io, mut client_io) = tokio::io::duplex(4096);
        let (mut sink, mut stream) = split_upgraded(server_io, 1024);

        client_io
            .write_all(&client_frame(FIN | OP_TEXT, &[0x01, 0x00, 0xc8, 0x00, 0xff]))
            .await
            .unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            WsMessage::Text(vec![0x01, 0x00, 0xc8, 0x00, 0xff])
        );

        sink.send(WsMessage::Pong(b"p".to_vec())).await.unwrap();
        let mut reply = [0u8; 3];
        client_io.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [FIN | OP_PONG, 0x01, b'p']);

        drop(client_io);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_channel() {
        let (mut sink, mut stream, mut peer) = memory::channel();

        sink.send(WsMessage::Binary(vec![2])).await.unwrap();
        assert_eq!(peer.outbound.recv().await, Some(WsMessage::Binary(vec![2])));

        peer.send(WsMessage::Text(b"x".to_vec()));
        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg, WsMessage::Text(b"x".to_vec()));

        drop(peer);
        assert!(stream.next().await.is_none());
        assert!(sink.send(WsMessage::Close).await.is_err());
    }
}
