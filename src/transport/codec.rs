//! Wire framing
//!
//! Frame format: [LEN u32 LE][CRC32 u32 LE][BODY]
//! BODY is bincode. A request body is `{method, log}`, a response body is
//! `Ok(bytes) | Err(message)`. Streams over TCP open with a hello frame
//! carrying the dialer's node ID.

use crate::common::{crc32, Error, NodeId, Result};
use crate::storage::Log;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub method: String,
    pub log: Log,
}

/// Borrowed twin of `WireRequest`, encodes identically
#[derive(Serialize)]
pub struct WireRequestRef<'a> {
    pub method: &'a str,
    pub log: &'a Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireResponse {
    Ok(Vec<u8>),
    Err(String),
}

impl From<crate::transport::Reply> for WireResponse {
    fn from(reply: crate::transport::Reply) -> Self {
        match reply {
            Ok(payload) => WireResponse::Ok(payload),
            Err(message) => WireResponse::Err(message),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    node_id: NodeId,
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Codec(format!(
            "frame of {} bytes exceeds limit {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32(&body).to_le_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream between frames
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(Error::Codec(format!(
            "frame of {} bytes exceeds limit {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let stored_checksum = reader.read_u32_le().await?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let computed_checksum = crc32(&body);
    if computed_checksum != stored_checksum {
        return Err(Error::Codec("Checksum mismatch".into()));
    }

    Ok(Some(bincode::deserialize(&body)?))
}

pub async fn write_hello<W: AsyncWrite + Unpin>(writer: &mut W, node_id: &NodeId) -> Result<()> {
    write_frame(
        writer,
        &Hello {
            node_id: node_id.clone(),
        },
    )
    .await
}

pub async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<NodeId> {
    match read_frame::<_, Hello>(reader).await? {
        Some(hello) if !hello.node_id.is_empty() => Ok(hello.node_id),
        Some(_) => Err(Error::Codec("hello with empty node id".into())),
        None => Err(Error::ConnectionFailed("stream closed before hello".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_frame() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let log = Log::new(1, 1, b"test request".to_vec());

        write_frame(
            &mut client,
            &WireRequestRef {
                method: "prepare",
                log: &log,
            },
        )
        .await
        .unwrap();

        let req: WireRequest = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(req.method, "prepare");
        assert_eq!(req.log, log);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let res: Option<WireResponse> = read_frame(&mut server).await.unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn test_corrupted_body_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let body = bincode::serialize(&WireResponse::Ok(b"payload".to_vec())).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        client.write_all(&frame).await.unwrap();

        let res = read_frame::<_, WireResponse>(&mut server).await;
        assert!(matches!(res, Err(Error::Codec(_))));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_le_bytes())
            .await
            .unwrap();
        let res = read_frame::<_, WireResponse>(&mut server).await;
        assert!(matches!(res, Err(Error::Codec(_))));
    }

    #[tokio::test]
    async fn test_hello() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_hello(&mut client, &NodeId::from("follower1"))
            .await
            .unwrap();
        assert_eq!(
            read_hello(&mut server).await.unwrap(),
            NodeId::from("follower1")
        );
    }
}
