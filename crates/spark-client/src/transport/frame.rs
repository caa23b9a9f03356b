//! 多路复用传输的帧格式。
//!
//! 每帧由 10 字节帧头与 `len` 字节载荷组成：
//!
//! ```text
//! +-----------+---------+----------+-------------+
//! | len: u32  | kind:u8 | flags:u8 | stream: u32 |  payload (len bytes)
//! +-----------+---------+----------+-------------+
//! ```
//!
//! 整数一律大端。客户端发起的流使用奇数编号，编号 0 保留给连接级帧。
//! 消息在 DATA 字节流内以 `u32` 长度前缀分隔，一条消息可以横跨多帧。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ClientError;

pub const HEADER_LEN: usize = 10;
pub const PREFACE: &[u8] = b"SPARK-MUX/1";
/// 消息长度前缀的字节数。
pub const MESSAGE_PREFIX_LEN: usize = 4;
/// 单条消息的长度上限：加上前缀后仍须能用 `u32` 表示。
pub const MAX_MESSAGE_LEN: usize = u32::MAX as usize - MESSAGE_PREFIX_LEN;

/// DATA 帧：该方向上不会再有数据。
pub const FLAG_END_STREAM: u8 = 0x1;
/// PING 帧：这是对端 PING 的回应。
pub const FLAG_ACK: u8 = 0x1;

/// GOAWAY / RESET 的错误码。
pub const CODE_NO_ERROR: u32 = 0;
pub const CODE_PROTOCOL_ERROR: u32 = 1;
pub const CODE_FLOW_CONTROL_ERROR: u32 = 3;
pub const CODE_CANCEL: u32 = 8;

const KIND_PREFACE: u8 = 0;
const KIND_SETTINGS: u8 = 1;
const KIND_HEADERS: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_TRAILERS: u8 = 4;
const KIND_WINDOW_UPDATE: u8 = 5;
const KIND_PING: u8 = 6;
const KIND_GOAWAY: u8 = 7;
const KIND_RESET: u8 = 8;

/// 握手时交换的参数；描述发送方愿意接收的量。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    pub stream_window: u32,
    pub connection_window: u32,
    pub max_frame_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Preface,
    Settings(Settings),
    Headers {
        stream: u32,
        method: String,
    },
    Data {
        stream: u32,
        payload: Bytes,
        end_stream: bool,
    },
    Trailers {
        stream: u32,
        code: u32,
        message: String,
    },
    /// `stream == 0` 表示连接级额度。
    WindowUpdate {
        stream: u32,
        increment: u32,
    },
    Ping {
        payload: u64,
        ack: bool,
    },
    GoAway {
        last_stream: u32,
        code: u32,
        debug: String,
    },
    Reset {
        stream: u32,
        code: u32,
    },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Headers { stream, .. }
            | Frame::Data { stream, .. }
            | Frame::Trailers { stream, .. }
            | Frame::WindowUpdate { stream, .. }
            | Frame::Reset { stream, .. } => *stream,
            Frame::Preface | Frame::Settings(_) | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// 追加编码结果到 `dst`。
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Preface => {
                put_header(dst, PREFACE.len(), KIND_PREFACE, 0, 0);
                dst.put_slice(PREFACE);
            }
            Frame::Settings(settings) => {
                put_header(dst, 12, KIND_SETTINGS, 0, 0);
                dst.put_u32(settings.stream_window);
                dst.put_u32(settings.connection_window);
                dst.put_u32(settings.max_frame_size);
            }
            Frame::Headers { stream, method } => {
                put_header(dst, method.len(), KIND_HEADERS, 0, *stream);
                dst.put_slice(method.as_bytes());
            }
            Frame::Data {
                stream,
                payload,
                end_stream,
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                put_header(dst, payload.len(), KIND_DATA, flags, *stream);
                dst.put_slice(payload);
            }
            Frame::Trailers {
                stream,
                code,
                message,
            } => {
                put_header(dst, 4 + message.len(), KIND_TRAILERS, 0, *stream);
                dst.put_u32(*code);
                dst.put_slice(message.as_bytes());
            }
            Frame::WindowUpdate { stream, increment } => {
                put_header(dst, 4, KIND_WINDOW_UPDATE, 0, *stream);
                dst.put_u32(*increment);
            }
            Frame::Ping { payload, ack } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                put_header(dst, 8, KIND_PING, flags, 0);
                dst.put_u64(*payload);
            }
            Frame::GoAway {
                last_stream,
                code,
                debug,
            } => {
                put_header(dst, 8 + debug.len(), KIND_GOAWAY, 0, 0);
                dst.put_u32(*last_stream);
                dst.put_u32(*code);
                dst.put_slice(debug.as_bytes());
            }
            Frame::Reset { stream, code } => {
                put_header(dst, 4, KIND_RESET, 0, *stream);
                dst.put_u32(*code);
            }
        }
    }

    /// 从 `src` 中切出一帧；数据不足时返回 `Ok(None)` 且不消费任何字节。
    ///
    /// `max_frame_size` 为本端通告的帧长上限，超出即视为协议违例。
    pub fn decode(src: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, ClientError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len > max_frame_size {
            return Err(ClientError::protocol(format!(
                "frame of {len} bytes exceeds the advertised limit {max_frame_size}"
            )));
        }
        let len = len as usize;
        if src.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        header.advance(4);
        let kind = header.get_u8();
        let flags = header.get_u8();
        let stream = header.get_u32();
        let mut payload = src.split_to(len).freeze();

        let frame = match kind {
            KIND_PREFACE => {
                if payload.as_ref() != PREFACE {
                    return Err(ClientError::protocol("unexpected connection preface"));
                }
                Frame::Preface
            }
            KIND_SETTINGS => {
                expect_len(&payload, 12, "SETTINGS")?;
                Frame::Settings(Settings {
                    stream_window: payload.get_u32(),
                    connection_window: payload.get_u32(),
                    max_frame_size: payload.get_u32(),
                })
            }
            KIND_HEADERS => Frame::Headers {
                stream: nonzero_stream(stream, "HEADERS")?,
                method: utf8(payload, "HEADERS")?,
            },
            KIND_DATA => Frame::Data {
                stream: nonzero_stream(stream, "DATA")?,
                payload,
                end_stream: flags & FLAG_END_STREAM != 0,
            },
            KIND_TRAILERS => {
                if payload.len() < 4 {
                    return Err(ClientError::protocol("TRAILERS payload too short"));
                }
                let code = payload.get_u32();
                Frame::Trailers {
                    stream: nonzero_stream(stream, "TRAILERS")?,
                    code,
                    message: utf8(payload, "TRAILERS")?,
                }
            }
            KIND_WINDOW_UPDATE => {
                expect_len(&payload, 4, "WINDOW_UPDATE")?;
                let increment = payload.get_u32();
                if increment == 0 {
                    return Err(ClientError::protocol("WINDOW_UPDATE with zero increment"));
                }
                Frame::WindowUpdate { stream, increment }
            }
            KIND_PING => {
                expect_len(&payload, 8, "PING")?;
                Frame::Ping {
                    payload: payload.get_u64(),
                    ack: flags & FLAG_ACK != 0,
                }
            }
            KIND_GOAWAY => {
                if payload.len() < 8 {
                    return Err(ClientError::protocol("GOAWAY payload too short"));
                }
                let last_stream = payload.get_u32();
                let code = payload.get_u32();
                Frame::GoAway {
                    last_stream,
                    code,
                    debug: utf8(payload, "GOAWAY")?,
                }
            }
            KIND_RESET => {
                expect_len(&payload, 4, "RESET")?;
                Frame::Reset {
                    stream: nonzero_stream(stream, "RESET")?,
                    code: payload.get_u32(),
                }
            }
            other => {
                return Err(ClientError::protocol(format!("unknown frame kind {other}")));
            }
        };
        Ok(Some(frame))
    }
}

/// 校验消息长度能否被长度前缀表示。
pub fn check_message_len(len: usize) -> Result<(), ClientError> {
    if len > MAX_MESSAGE_LEN {
        return Err(ClientError::invalid_argument(format!(
            "message of {len} bytes exceeds the limit of {MAX_MESSAGE_LEN} bytes"
        )));
    }
    Ok(())
}

/// 为消息加上长度前缀；调用方须先通过 [`check_message_len`]。
pub fn encode_message(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_PREFIX_LEN + message.len());
    buf.put_u32(message.len() as u32);
    buf.put_slice(message);
    buf.freeze()
}

/// 从重组缓冲中切出一条完整消息；不足一条时返回 `None`。
pub fn decode_message(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < MESSAGE_PREFIX_LEN {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < MESSAGE_PREFIX_LEN + len {
        return None;
    }
    buf.advance(MESSAGE_PREFIX_LEN);
    Some(buf.split_to(len).freeze())
}

fn put_header(dst: &mut BytesMut, len: usize, kind: u8, flags: u8, stream: u32) {
    debug_assert!(u32::try_from(len).is_ok(), "frame payload of {len} bytes");
    dst.reserve(HEADER_LEN + len);
    dst.put_u32(len as u32);
    dst.put_u8(kind);
    dst.put_u8(flags);
    dst.put_u32(stream);
}

fn expect_len(payload: &Bytes, len: usize, kind: &str) -> Result<(), ClientError> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(ClientError::protocol(format!(
            "{kind} payload must be {len} bytes, got {}",
            payload.len()
        )))
    }
}

fn nonzero_stream(stream: u32, kind: &str) -> Result<u32, ClientError> {
    if stream == 0 {
        Err(ClientError::protocol(format!("{kind} frame on stream 0")))
    } else {
        Ok(stream)
    }
}

fn utf8(payload: Bytes, kind: &str) -> Result<String, ClientError> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| ClientError::protocol(format!("{kind} payload is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_input_is_not_consumed() {
        let mut buf = BytesMut::new();
        Frame::Data {
            stream: 1,
            payload: Bytes::from_static(b"hello"),
            end_stream: true,
        }
        .encode(&mut buf);
        let full = buf.len();

        let mut partial = BytesMut::from(&buf[..full - 1]);
        assert_eq!(Frame::decode(&mut partial, 16 * 1024).unwrap(), None);
        assert_eq!(partial.len(), full - 1, "不完整的帧不应被消费");

        let frame = Frame::decode(&mut buf, 16 * 1024).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                stream: 1,
                payload: Bytes::from_static(b"hello"),
                end_stream: true
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_protocol_violation() {
        let mut buf = BytesMut::new();
        Frame::Data {
            stream: 1,
            payload: Bytes::from(vec![0u8; 32]),
            end_stream: false,
        }
        .encode(&mut buf);
        let err = Frame::decode(&mut buf, 16).unwrap_err();
        assert_eq!(err.code(), "spark.client.transport.protocol");
    }

    #[test]
    fn messages_are_reassembled_across_chunks() {
        let encoded = encode_message(b"spanning");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..5]);
        assert_eq!(decode_message(&mut buf), None);
        buf.extend_from_slice(&encoded[5..]);
        assert_eq!(decode_message(&mut buf), Some(Bytes::from_static(b"spanning")));
        assert!(buf.is_empty());
    }

    #[test]
    fn message_length_must_fit_the_prefix() {
        assert!(check_message_len(0).is_ok());
        assert!(check_message_len(MAX_MESSAGE_LEN).is_ok());
        let err = check_message_len(MAX_MESSAGE_LEN + 1).unwrap_err();
        assert_eq!(err.code(), "spark.client.call.invalid_argument", "超长消息只是调用级错误");
    }
}
