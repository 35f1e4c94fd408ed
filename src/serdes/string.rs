use std::{io, mem::size_of};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{invalid_data, Decode, Encode, MAX_PREALLOC};

impl Encode for str {
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let len = u32::try_from(self.len()).map_err(|_| invalid_data("string is too long"))?;
        len.encode(writer).await?;
        writer.write_all(self.as_bytes()).await
    }

    fn size(&self) -> usize {
        size_of::<u32>() + self.len()
    }
}

impl Encode for String {
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.as_str().encode(writer).await
    }

    fn size(&self) -> usize {
        self.as_str().size()
    }
}

impl Decode for String {
    async fn decode<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let len = u32::decode(reader).await? as u64;
        let mut buf = Vec::with_capacity((len as usize).min(MAX_PREALLOC));
        let read = reader.take(len).read_to_end(&mut buf).await?;
        if read as u64 != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "string is shorter than its length prefix",
            ));
        }

        String::from_utf8(buf).map_err(|err| invalid_data(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::serdes::{Decode, Encode};

    #[tokio::test]
    async fn test_encode_decode() {
        let source_0 = "Hello! World";
        let source_1 = "Hello! profblock".to_string();

        let mut bytes = Vec::new();
        source_0.encode(&mut bytes).await.unwrap();
        source_1.encode(&mut bytes).await.unwrap();
        assert_eq!(bytes.len(), source_0.size() + source_1.size());

        let mut cursor = Cursor::new(bytes);
        let decoded_0 = String::decode(&mut cursor).await.unwrap();
        let decoded_1 = String::decode(&mut cursor).await.unwrap();

        assert_eq!(source_0, decoded_0);
        assert_eq!(source_1, decoded_1);
    }

    #[tokio::test]
    async fn reject_invalid_utf8() {
        let mut bytes = Vec::new();
        2u32.encode(&mut bytes).await.unwrap();
        bytes.extend_from_slice(&[0xff, 0xfe]);

        assert!(String::decode(&mut Cursor::new(bytes)).await.is_err());
    }

    #[tokio::test]
    async fn reject_truncated_string() {
        let mut bytes = Vec::new();
        u32::MAX.encode(&mut bytes).await.unwrap();
        bytes.extend_from_slice(b"short");

        let err = String::decode(&mut Cursor::new(bytes)).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
