//! Binary frame codec for daemon messages.
//!
//! ## Wire format
//!
//! Each frame is one discriminator byte followed by a variant-specific
//! payload. Payload lengths are either fixed per variant or self-describing:
//!
//! - integers: big-endian
//! - strings: 4-byte length prefix (big-endian u32) + UTF-8 bytes
//! - string lists: 4-byte element count + that many strings
//!
//! `KeepAlive` and `CancelBuild` are a bare discriminator byte with no
//! payload. A zero-byte read at a frame boundary means the peer closed
//! cleanly and decodes to `None`; EOF anywhere inside a frame is an error.
//! An unknown discriminator is a hard protocol error, not a skip: protocol
//! versions are negotiated through the registry, so a mismatch here means
//! the peer is not speaking this protocol at all.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::daemon::message::{self, BuildRequest, Message};
use crate::error::TransportError;

/// Maximum size of a single string payload (16 MB), to prevent a corrupt or
/// hostile length prefix from exhausting memory.
pub const MAX_STRING_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum number of elements in a string list.
pub const MAX_LIST_LEN: u32 = 64 * 1024;

/// Encode and write one frame. Does not flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), TransportError> {
    writer.write_u8(message.discriminator()).await?;
    match message {
        Message::BuildRequest(request) => {
            write_string_list(writer, &request.args).await?;
            write_string(writer, &request.working_dir).await?;
        }
        Message::BuildStarted { pid } => {
            writer.write_u32(*pid).await?;
        }
        Message::ProjectEvent {
            project_id,
            message,
        } => {
            write_string(writer, project_id).await?;
            write_string(writer, message).await?;
        }
        Message::LogLine(line) => {
            write_string(writer, line).await?;
        }
        Message::Prompt {
            prompt_id,
            question,
        } => {
            write_string(writer, prompt_id).await?;
            write_string(writer, question).await?;
        }
        Message::PromptResponse { prompt_id, answer } => {
            write_string(writer, prompt_id).await?;
            write_string(writer, answer).await?;
        }
        Message::KeepAlive | Message::CancelBuild => {}
        Message::BuildFinished { exit_code } => {
            writer.write_i32(*exit_code).await?;
        }
    }
    Ok(())
}

/// Read and decode one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// frames. A truncated frame or unknown discriminator is an error.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, TransportError> {
    let discriminator = match reader.read_u8().await {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let message = match discriminator {
        message::BUILD_REQUEST => Message::BuildRequest(BuildRequest {
            args: read_string_list(reader).await?,
            working_dir: read_string(reader).await?,
        }),
        message::BUILD_STARTED => Message::BuildStarted {
            pid: reader.read_u32().await?,
        },
        message::PROJECT_EVENT => Message::ProjectEvent {
            project_id: read_string(reader).await?,
            message: read_string(reader).await?,
        },
        message::LOG_LINE => Message::LogLine(read_string(reader).await?),
        message::PROMPT => Message::Prompt {
            prompt_id: read_string(reader).await?,
            question: read_string(reader).await?,
        },
        message::PROMPT_RESPONSE => Message::PromptResponse {
            prompt_id: read_string(reader).await?,
            answer: read_string(reader).await?,
        },
        message::KEEP_ALIVE => Message::KeepAlive,
        message::CANCEL_BUILD => Message::CancelBuild,
        message::BUILD_FINISHED => Message::BuildFinished {
            exit_code: reader.read_i32().await?,
        },
        other => {
            return Err(TransportError::Protocol(format!(
                "unknown message discriminator {:#04x}",
                other
            )));
        }
    };
    Ok(Some(message))
}

async fn write_string<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &str,
) -> Result<(), TransportError> {
    if value.len() > MAX_STRING_SIZE as usize {
        return Err(TransportError::Protocol(format!(
            "string too large: {} bytes (max {})",
            value.len(),
            MAX_STRING_SIZE
        )));
    }
    writer.write_u32(value.len() as u32).await?;
    writer.write_all(value.as_bytes()).await?;
    Ok(())
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, TransportError> {
    let len = reader.read_u32().await?;
    if len > MAX_STRING_SIZE {
        return Err(TransportError::Protocol(format!(
            "string too large: {} bytes (max {})",
            len, MAX_STRING_SIZE
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|e| TransportError::Protocol(format!("invalid UTF-8 in string payload: {}", e)))
}

async fn write_string_list<W: AsyncWrite + Unpin>(
    writer: &mut W,
    values: &[String],
) -> Result<(), TransportError> {
    if values.len() > MAX_LIST_LEN as usize {
        return Err(TransportError::Protocol(format!(
            "list too long: {} elements (max {})",
            values.len(),
            MAX_LIST_LEN
        )));
    }
    writer.write_u32(values.len() as u32).await?;
    for value in values {
        write_string(writer, value).await?;
    }
    Ok(())
}

async fn read_string_list<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<String>, TransportError> {
    let len = reader.read_u32().await?;
    if len > MAX_LIST_LEN {
        return Err(TransportError::Protocol(format!(
            "list too long: {} elements (max {})",
            len, MAX_LIST_LEN
        )));
    }
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        values.push(read_string(reader).await?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn encode(message: &Message) -> Vec<u8> {
        let mut buf = Vec::new();
        write_message(&mut buf, message).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn roundtrip_every_variant() {
        let messages = vec![
            Message::BuildRequest(BuildRequest {
                args: vec!["cargo".into(), "build".into(), "--release".into()],
                working_dir: "/home/user/project".into(),
            }),
            Message::BuildStarted { pid: 4321 },
            Message::ProjectEvent {
                project_id: "core".into(),
                message: "compiling".into(),
            },
            Message::LogLine("warning: unused variable".into()),
            Message::Prompt {
                prompt_id: "p-1".into(),
                question: "overwrite output dir?".into(),
            },
            Message::PromptResponse {
                prompt_id: "p-1".into(),
                answer: "yes".into(),
            },
            Message::KeepAlive,
            Message::CancelBuild,
            Message::BuildFinished { exit_code: -1 },
        ];

        for message in messages {
            let buf = encode(&message).await;
            let mut reader = Cursor::new(buf);
            let decoded = read_message(&mut reader).await.unwrap().unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[tokio::test]
    async fn multiple_frames_on_one_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::KeepAlive).await.unwrap();
        write_message(&mut buf, &Message::LogLine("a".into()))
            .await
            .unwrap();
        write_message(&mut buf, &Message::BuildFinished { exit_code: 2 })
            .await
            .unwrap();

        let mut reader = Cursor::new(buf);
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::KeepAlive)
        );
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::LogLine("a".into()))
        );
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::BuildFinished { exit_code: 2 })
        );
        // clean EOF at the frame boundary
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_build_is_a_single_byte() {
        let buf = encode(&Message::CancelBuild).await;
        assert_eq!(buf, vec![message::CANCEL_BUILD]);
        let keep_alive = encode(&Message::KeepAlive).await;
        assert_eq!(keep_alive.len(), 1);
    }

    #[tokio::test]
    async fn strings_are_big_endian_length_prefixed() {
        let buf = encode(&Message::LogLine("hi".into())).await;
        assert_eq!(buf[0], message::LOG_LINE);
        assert_eq!(&buf[1..5], &2u32.to_be_bytes());
        assert_eq!(&buf[5..], b"hi");
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buf = encode(&Message::LogLine("truncate me".into())).await;
        buf.truncate(buf.len() - 4);
        let mut reader = Cursor::new(buf);
        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn unknown_discriminator_is_a_hard_failure() {
        let mut reader = Cursor::new(vec![0xEEu8, 0, 0, 0, 0]);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert!(err.to_string().contains("0xee"));
    }

    #[tokio::test]
    async fn oversized_string_length_is_rejected() {
        let mut buf = vec![message::LOG_LINE];
        buf.extend_from_slice(&(MAX_STRING_SIZE + 1).to_be_bytes());
        buf.extend_from_slice(b"some data");
        let mut reader = Cursor::new(buf);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn oversized_list_length_is_rejected() {
        let mut buf = vec![message::BUILD_REQUEST];
        buf.extend_from_slice(&(MAX_LIST_LEN + 1).to_be_bytes());
        buf.extend_from_slice(b"some data");
        let mut reader = Cursor::new(buf);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn empty_stream_is_clean_eof() {
        let mut reader = Cursor::new(Vec::new());
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }
}
