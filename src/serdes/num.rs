use std::{io, mem::size_of};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Decode, Encode};

macro_rules! implement_encode_decode {
    ($struct_name:ident) => {
        impl Encode for $struct_name {
            async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
            where
                W: AsyncWrite + Unpin + Send,
            {
                writer.write_all(&self.to_le_bytes()).await
            }

            fn size(&self) -> usize {
                size_of::<Self>()
            }
        }

        impl Decode for $struct_name {
            async fn decode<R>(reader: &mut R) -> io::Result<Self>
            where
                R: AsyncRead + Unpin + Send,
            {
                let buf = {
                    let mut buf = [0; size_of::<Self>()];
                    reader.read_exact(&mut buf).await?;
                    buf
                };

                Ok(Self::from_le_bytes(buf))
            }
        }
    };
}

implement_encode_decode!(u8);
implement_encode_decode!(u16);
implement_encode_decode!(u32);
implement_encode_decode!(u64);
implement_encode_decode!(i32);
implement_encode_decode!(i64);

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::serdes::{Decode, Encode};

    #[tokio::test]
    async fn test_encode_decode() {
        let mut bytes = Vec::new();
        7u8.encode(&mut bytes).await.unwrap();
        (-3i32).encode(&mut bytes).await.unwrap();
        u64::MAX.encode(&mut bytes).await.unwrap();
        i64::MIN.encode(&mut bytes).await.unwrap();
        assert_eq!(bytes.len(), 1 + 4 + 8 + 8);

        let mut cursor = Cursor::new(bytes);
        assert_eq!(u8::decode(&mut cursor).await.unwrap(), 7);
        assert_eq!(i32::decode(&mut cursor).await.unwrap(), -3);
        assert_eq!(u64::decode(&mut cursor).await.unwrap(), u64::MAX);
        assert_eq!(i64::decode(&mut cursor).await.unwrap(), i64::MIN);
        assert!(u8::decode(&mut cursor).await.is_err());
    }
}
