//! Wire protocol
//!
//! Frame format: [LEN u32 BE][bincode payload]. One connection carries many
//! sequential request/response pairs; a clean EOF between frames ends the
//! session. Oversized frames are rejected before allocation.

use crate::checkpoint::CheckpointRecord;
use crate::common::{Error, ErrorCode, Result};
use crate::store::Tensor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Create a parameter block (idempotent on retransmission).
    InitParameter {
        name: String,
        shape: Vec<usize>,
        value: Tensor,
    },
    /// Apply one gradient step. `seq` must be strictly greater than the last
    /// accepted value for this trainer/name pair.
    PushGradient {
        trainer: String,
        name: String,
        grad: Tensor,
        seq: u64,
    },
    PullParameter {
        name: String,
    },
    Checkpoint,
    ListParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Initialized { version: u64 },
    Pushed { version: u64 },
    Parameter { value: Tensor, version: u64 },
    Checkpointed { record: CheckpointRecord },
    Parameters { names: Vec<String> },
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn from_error(err: &Error) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Write one frame. Flushes so a request/response exchange never stalls in a
/// buffer.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body =
        bincode::serialize(msg).map_err(|e| Error::Wire(format!("serialize error: {e}")))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(Error::Wire(format!("frame too large: {} bytes", body.len())));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on clean EOF before a length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Wire(format!("frame too large: {len} bytes")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let msg =
        bincode::deserialize(&body).map_err(|e| Error::Wire(format!("deserialize error: {e}")))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let req = Request::PushGradient {
            trainer: "t0".into(),
            name: "w".into(),
            grad: Tensor::F32(vec![0.1, 0.1]),
            seq: 1,
        };
        write_frame(&mut a, &req).await.unwrap();

        let got: Request = read_frame(&mut b).await.unwrap().unwrap();
        match got {
            Request::PushGradient { name, seq, .. } => {
                assert_eq!(name, "w");
                assert_eq!(seq, 1);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Option<Request> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();

        let err = read_frame::<_, Request>(&mut b).await;
        assert!(matches!(err, Err(Error::Wire(_))));
    }

    #[tokio::test]
    async fn test_error_response_carries_code() {
        let err = Error::StaleUpdate { last: 4, got: 2 };
        let resp = Response::from_error(&err);
        let Response::Error { code, .. } = resp else {
            panic!("expected error response")
        };
        assert_eq!(code, ErrorCode::StaleUpdate);
    }
}
