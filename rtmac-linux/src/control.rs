//! The messages exchanged over the control socket
//!
//! Every connection carries exactly one request followed by one response.
//! Both are JSON documents, prefixed with their length as a big endian u64.

use std::path::Path;

use rtmac::{
    config::StationAddr,
    observability::TdmaSnapshot,
    scheduler::{CycleInfo, WaitKind},
    tdma::RequestError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UnixStream,
};

const MAX_JSON_MESSAGE_SIZE: u64 = 1 << 20; // 1 MiB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    BecomeMaster {
        cycle_period_us: Option<u64>,
    },
    BecomeClient,
    Up,
    Down,
    AddStation {
        address: StationAddr,
        rt: bool,
        #[serde(default)]
        offset_us: u64,
    },
    RemoveStation {
        address: StationAddr,
        rt: bool,
    },
    ChangeCycle {
        cycle_period_us: u64,
    },
    ChangeOffset {
        address: StationAddr,
        offset_us: u64,
    },
    ChangeMtu {
        mtu: u16,
    },
    TimeOffset,
    WaitOnCycle {
        kind: WaitKind,
    },
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    Done,
    Rejected { error: RequestError },
    TimeOffset { offset_ns: i64 },
    Cycle {
        cycle_no: u64,
        cycle_start_ns: u64,
        clock_offset_ns: i64,
    },
    Snapshot(TdmaSnapshot),
    Failed { message: String },
}

impl From<CycleInfo> for ControlResponse {
    fn from(info: CycleInfo) -> Self {
        ControlResponse::Cycle {
            cycle_no: info.cycle_no,
            cycle_start_ns: info.cycle_start.wire_nanos(),
            clock_offset_ns: info.clock_offset.whole_nanos(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("io error on the control socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("the TDMA instance is not running")]
    Stopped,
}

/// Issue a single request to the daemon listening at `path`
pub async fn send_request(
    path: impl AsRef<Path>,
    request: &ControlRequest,
) -> Result<ControlResponse, ControlError> {
    let mut stream = UnixStream::connect(path).await?;
    write_json(&mut stream, request).await?;

    let mut buffer = Vec::with_capacity(16 * 1024);
    Ok(read_json(&mut stream, &mut buffer).await?)
}

pub async fn write_json<T>(stream: &mut (impl AsyncWrite + Unpin), value: &T) -> std::io::Result<()>
where
    T: serde::Serialize,
{
    let bytes = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_u64(bytes.len() as u64).await?;
    stream.write_all(&bytes).await
}

pub async fn read_json<'a, T>(
    stream: &mut (impl AsyncRead + Unpin),
    buffer: &'a mut Vec<u8>,
) -> std::io::Result<T>
where
    T: serde::Deserialize<'a>,
{
    buffer.clear();
    let msg_size = stream.read_u64().await?;
    if msg_size > MAX_JSON_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "message too large",
        ));
    }
    let msg_size: usize = msg_size.try_into().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "message size cannot be represented",
        )
    })?;
    buffer.resize(msg_size, 0);
    stream.read_exact(buffer).await?;
    serde_json::from_slice(buffer)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}
