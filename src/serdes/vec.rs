use std::{io, mem::size_of};

use tokio::io::{AsyncRead, AsyncWrite};

use super::{invalid_data, Decode, Encode, MAX_PREALLOC};

impl<T> Decode for Vec<T>
where
    T: Decode + Send,
{
    async fn decode<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let len = u32::decode(reader).await? as usize;
        let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));

        for _ in 0..len {
            items.push(T::decode(reader).await?);
        }
        Ok(items)
    }
}

impl<T> Encode for Vec<T>
where
    T: Encode + Send + Sync,
{
    async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let len = u32::try_from(self.len()).map_err(|_| invalid_data("list is too long"))?;
        len.encode(writer).await?;

        for item in self {
            item.encode(writer).await?;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.iter().map(|item| item.size()).sum::<usize>() + size_of::<u32>()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::serdes::{Decode, Encode};

    #[tokio::test]
    async fn test_encode_decode() {
        let source = vec![vec![1u32, 2, 3], vec![], vec![42]];

        let mut bytes = Vec::new();
        source.encode(&mut bytes).await.unwrap();
        assert_eq!(bytes.len(), source.size());

        let decoded = Vec::<Vec<u32>>::decode(&mut Cursor::new(bytes)).await.unwrap();
        assert_eq!(source, decoded);
    }
}
