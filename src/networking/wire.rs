//! Framing on the companion port.
//!
//! Every connection starts with one kind byte followed by a header:
//! source node id, reply port (u16 BE) and path, strings as u32 BE length
//! plus UTF-8 bytes. A message frame then carries a u32-prefixed payload and
//! ends; a channel frame is followed by the raw stream until EOF.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;

const FRAME_MESSAGE: u8 = 1;
const FRAME_CHANNEL: u8 = 2;

pub const MAX_STRING_LEN: usize = 4 * 1024;
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub source_id: String,
    /// Port the sender accepts connections on; the receiver pairs it with the
    /// connection's peer IP to reach the sender back.
    pub reply_port: u16,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message { header: FrameHeader, payload: Vec<u8> },
    Channel(FrameHeader),
}

fn put_bytes(buf: &mut Vec<u8>, field: &'static str, bytes: &[u8], max: usize) -> Result<(), WireError> {
    if bytes.len() > max {
        return Err(WireError::TooLong {
            field,
            len: bytes.len(),
            max,
        });
    }
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_header(buf: &mut Vec<u8>, header: &FrameHeader) -> Result<(), WireError> {
    put_bytes(buf, "source id", header.source_id.as_bytes(), MAX_STRING_LEN)?;
    buf.extend_from_slice(&header.reply_port.to_be_bytes());
    put_bytes(buf, "path", header.path.as_bytes(), MAX_STRING_LEN)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    match frame {
        Frame::Message { header, payload } => {
            buf.push(FRAME_MESSAGE);
            put_header(&mut buf, header)?;
            put_bytes(&mut buf, "payload", payload, MAX_PAYLOAD_LEN)?;
        }
        Frame::Channel(header) => {
            buf.push(FRAME_CHANNEL);
            put_header(&mut buf, header)?;
        }
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_bytes<R>(reader: &mut R, field: &'static str, max: usize) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > max {
        return Err(WireError::TooLong { field, len, max });
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

async fn read_string<R>(reader: &mut R, field: &'static str) -> Result<String, WireError>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_bytes(reader, field, MAX_STRING_LEN).await?;
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(field))
}

async fn read_header<R>(reader: &mut R) -> Result<FrameHeader, WireError>
where
    R: AsyncRead + Unpin,
{
    let source_id = read_string(reader, "source id").await?;
    let reply_port = reader.read_u16().await?;
    let path = read_string(reader, "path").await?;
    Ok(FrameHeader {
        source_id,
        reply_port,
        path,
    })
}

/// Reads one frame. For a channel frame the reader is left positioned at
/// the start of the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await? {
        FRAME_MESSAGE => {
            let header = read_header(reader).await?;
            let payload = read_bytes(reader, "payload", MAX_PAYLOAD_LEN).await?;
            Ok(Frame::Message { header, payload })
        }
        FRAME_CHANNEL => Ok(Frame::Channel(read_header(reader).await?)),
        other => Err(WireError::UnknownKind(other)),
    }
}
