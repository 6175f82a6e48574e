//! Wire protocol for primary/backup replication
//!
//! Backup to primary: an 8-byte big-endian report of the backup's max
//! commit log offset. Primary to backup: a 21-byte frame header
//! (`kind u8 | start u64 | primary max u64 | body length u32`) followed by
//! the body. DATA bodies are raw commit log bytes; HEARTBEAT, GAP and AHEAD
//! frames carry no body.

use crate::error::{ClusterError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size
pub const FRAME_HEADER_SIZE: usize = 21;

/// Backup report size
pub const REPORT_SIZE: usize = 8;

/// Maximum frame body (16 MB)
pub const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Raw commit log bytes starting at the frame's start offset
    Data = 1,
    /// Keep-alive carrying the primary's max offset
    Heartbeat = 2,
    /// The requested offset is gone; start offset is the primary's minimum
    Gap = 3,
    /// The backup reported more than the primary holds
    Ahead = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = ClusterError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Heartbeat),
            3 => Ok(FrameKind::Gap),
            4 => Ok(FrameKind::Ahead),
            other => Err(ClusterError::Protocol(format!("unknown frame kind {}", other))),
        }
    }
}

/// Primary to backup frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub start_offset: u64,
    pub primary_max: u64,
    pub body: Bytes,
}

impl Frame {
    pub fn data(start_offset: u64, primary_max: u64, body: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            start_offset,
            primary_max,
            body,
        }
    }

    pub fn heartbeat(start_offset: u64, primary_max: u64) -> Self {
        Self {
            kind: FrameKind::Heartbeat,
            start_offset,
            primary_max,
            body: Bytes::new(),
        }
    }

    pub fn gap(min_available: u64, primary_max: u64) -> Self {
        Self {
            kind: FrameKind::Gap,
            start_offset: min_available,
            primary_max,
            body: Bytes::new(),
        }
    }

    pub fn ahead(primary_max: u64) -> Self {
        Self {
            kind: FrameKind::Ahead,
            start_offset: primary_max,
            primary_max,
            body: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.body.len());
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.start_offset);
        buf.put_u64(self.primary_max);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse a header into (kind, start, primary max, body length).
    pub fn decode_header(mut header: &[u8]) -> Result<(FrameKind, u64, u64, usize)> {
        if header.len() < FRAME_HEADER_SIZE {
            return Err(ClusterError::Protocol(format!(
                "short frame header: {} bytes",
                header.len()
            )));
        }
        let kind = FrameKind::try_from(header.get_u8())?;
        let start = header.get_u64();
        let primary_max = header.get_u64();
        let len = header.get_u32() as usize;
        if len > MAX_FRAME_BODY {
            return Err(ClusterError::MessageTooLarge {
                size: len,
                max: MAX_FRAME_BODY,
            });
        }
        if kind != FrameKind::Data && len != 0 {
            return Err(ClusterError::Protocol(format!(
                "{:?} frame with {} byte body",
                kind, len
            )));
        }
        Ok((kind, start, primary_max, len))
    }
}

fn map_read_error(e: std::io::Error) -> ClusterError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ClusterError::ConnectionClosed
    } else {
        ClusterError::Io(e)
    }
}

/// Read one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(map_read_error)?;
    let (kind, start_offset, primary_max, len) = Frame::decode_header(&header)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(map_read_error)?;
    Ok(Frame {
        kind,
        start_offset,
        primary_max,
        body: Bytes::from(body),
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a backup report.
pub async fn read_report<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; REPORT_SIZE];
    reader.read_exact(&mut buf).await.map_err(map_read_error)?;
    Ok(u64::from_be_bytes(buf))
}

pub async fn write_report<W: AsyncWrite + Unpin>(writer: &mut W, offset: u64) -> Result<()> {
    writer.write_all(&offset.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
