//! Little-endian binary encoding used by block metadata, the time index and
//! the symbol database.

mod num;
mod string;
mod vec;

use std::{future::Future, io};

use tokio::io::{AsyncRead, AsyncWrite};

pub trait Encode {
    fn encode<W>(&self, writer: &mut W) -> impl Future<Output = io::Result<()>> + Send
    where
        W: AsyncWrite + Unpin + Send;

    fn size(&self) -> usize;
}

impl<T: Encode + Sync> Encode for &T {
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        Encode::encode(*self, writer).await
    }

    fn size(&self) -> usize {
        Encode::size(*self)
    }
}

pub trait Decode: Sized {
    fn decode<R>(reader: &mut R) -> impl Future<Output = io::Result<Self>> + Send
    where
        R: AsyncRead + Unpin + Send;
}

/// Encode `value` into a fresh buffer.
pub(crate) async fn encode_to_vec<T: Encode + Sync>(value: &T) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(value.size());
    value.encode(&mut buf).await?;
    Ok(buf)
}

/// Upper bound on pre-allocation driven by an untrusted length prefix.
pub(crate) const MAX_PREALLOC: usize = 4096;

pub(crate) fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
