//! Wire protocol between broker clients and the server.
//!
//! Every exchange is one [`Request`] datagram from a client endpoint to the
//! well-known server endpoint, answered by exactly one [`Response`] datagram
//! sent to the requester's own endpoint. Records are serialized with rkyv,
//! one archive per datagram; the datagram boundary is the only framing.
//!
//! Handles never appear in the payload. When a response refers to an
//! exported allocation, the resource itself travels as `SCM_RIGHTS`
//! ancillary data on the same datagram and [`Response::handle_count`] says
//! how many to expect (see [`crate::ipc`]).

mod message;
mod name;

pub use message::{Command, DeviceAddress, Request, Response, ShareableHandle, StatusCode};
pub use name::{MAX_NAME_LEN, MemName};

use crate::error::{Error, Result};

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

fn check_len(len: usize) -> Result<()> {
    if len > MAX_DATAGRAM_SIZE {
        return Err(Error::Codec(format!(
            "record is {} bytes, datagram limit is {}",
            len, MAX_DATAGRAM_SIZE
        )));
    }
    Ok(())
}

fn aligned_copy(buf: &[u8]) -> rkyv::util::AlignedVec<16> {
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(buf);
    aligned
}

impl Request {
    /// Serialize into one datagram payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Error::Codec(e.to_string()))?;
        check_len(bytes.len())?;
        Ok(bytes.to_vec())
    }

    /// Deserialize and validate one datagram payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(buf.len())?;
        let aligned = aligned_copy(buf);
        let req = rkyv::from_bytes::<Request, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Codec(e.to_string()))?;
        if let Some(name) = &req.name {
            name.validate()?;
        }
        Ok(req)
    }
}

impl Response {
    /// Serialize into one datagram payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Error::Codec(e.to_string()))?;
        check_len(bytes.len())?;
        Ok(bytes.to_vec())
    }

    /// Deserialize and validate one datagram payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(buf.len())?;
        let aligned = aligned_copy(buf);
        let res = rkyv::from_bytes::<Response, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Codec(e.to_string()))?;
        if let Some(name) = &res.name {
            name.validate()?;
        }
        Ok(res)
    }
}
