//! Worker-side client handle
//!
//! Thin synchronous-per-call wrapper over one TCP connection. Server-reported
//! failures come back as `Error::Remote` with the original `ErrorCode`, so
//! callers can match on `StaleUpdate`, `ShapeMismatch`, and friends.

use crate::checkpoint::CheckpointRecord;
use crate::common::{Error, Result};
use crate::rpc::wire::{read_frame, write_frame, Request, Response};
use crate::store::Tensor;
use tokio::net::{TcpStream, ToSocketAddrs};

pub struct PserverClient {
    stream: TcpStream,
}

impl PserverClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub async fn init_parameter(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        value: Tensor,
    ) -> Result<u64> {
        let resp = self
            .call(Request::InitParameter {
                name: name.to_string(),
                shape,
                value,
            })
            .await?;
        match resp {
            Response::Initialized { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn push_gradient(
        &mut self,
        trainer: &str,
        name: &str,
        grad: Tensor,
        seq: u64,
    ) -> Result<u64> {
        let resp = self
            .call(Request::PushGradient {
                trainer: trainer.to_string(),
                name: name.to_string(),
                grad,
                seq,
            })
            .await?;
        match resp {
            Response::Pushed { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn pull_parameter(&mut self, name: &str) -> Result<(Tensor, u64)> {
        let resp = self
            .call(Request::PullParameter {
                name: name.to_string(),
            })
            .await?;
        match resp {
            Response::Parameter { value, version } => Ok((value, version)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn checkpoint(&mut self) -> Result<CheckpointRecord> {
        match self.call(Request::Checkpoint).await? {
            Response::Checkpointed { record } => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_parameters(&mut self) -> Result<Vec<String>> {
        match self.call(Request::ListParameters).await? {
            Response::Parameters { names } => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&mut self, req: Request) -> Result<Response> {
        write_frame(&mut self.stream, &req).await?;
        let resp: Response = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| Error::Wire("connection closed by server".into()))?;

        if let Response::Error { code, message } = resp {
            return Err(Error::Remote { code, message });
        }
        Ok(resp)
    }
}

fn unexpected(resp: Response) -> Error {
    Error::Wire(format!("unexpected response: {resp:?}"))
}
