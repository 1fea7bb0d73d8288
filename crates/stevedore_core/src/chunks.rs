use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Number of parts a source of `total` bytes splits into.
pub fn part_count(total: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total.div_ceil(chunk_size)
}

/// Turn an [`AsyncRead`] into a sequence of fixed-size [`bytes::Bytes`].
///
/// Every chunk is exactly `chunk_size` bytes except the last, which holds whatever remains. Chunks
/// are read on demand so at most one chunk is buffered at a time. An empty source yields no
/// chunks at all.
pub struct ChunkSplitter<R> {
    source: R,
    chunk_size: usize,
    exhausted: bool,
}

impl<R> ChunkSplitter<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size,
            exhausted: chunk_size == 0,
        }
    }

    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.source.read(&mut buffer[filled..]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buffer.truncate(filled);
        Ok(Some(Bytes::from(buffer)))
    }

    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> {
        stream::try_unfold(self, |mut splitter| async move {
            Ok(splitter.next_chunk().await?.map(|chunk| (chunk, splitter)))
        })
    }
}

#[cfg(test)]
mod test {
    use futures::TryStreamExt;
    use rstest::*;

    use super::*;

    fn source(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[rstest]
    #[case::empty(0, 4)]
    #[case::smaller_than_chunk(3, 4)]
    #[case::exact_chunk(4, 4)]
    #[case::exact_multiple(12, 4)]
    #[case::remainder(13, 4)]
    #[case::one_byte_chunks(5, 1)]
    #[tokio::test]
    async fn splits_into_ceil_parts(#[case] len: usize, #[case] chunk_size: usize) {
        let data = source(len);
        let chunks: Vec<Bytes> = ChunkSplitter::new(std::io::Cursor::new(data.clone()), chunk_size)
            .into_stream()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            chunks.len() as u64,
            part_count(len as u64, chunk_size as u64)
        );
        if let Some((last, rest)) = chunks.split_last() {
            assert!(rest.iter().all(|c| c.len() == chunk_size));
            assert!(!last.is_empty() && last.len() <= chunk_size);
        }
        assert_eq!(chunks.concat(), data);
    }

    #[tokio::test]
    async fn fills_chunks_from_short_reads() {
        let (mut tx, rx) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(&source(20)).await.unwrap();
        });

        let mut splitter = ChunkSplitter::new(rx, 8);
        let mut sizes = vec![];
        while let Some(chunk) = splitter.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
        }
        writer.await.unwrap();
        assert_eq!(sizes, vec![8, 8, 4]);
    }

    #[tokio::test]
    async fn stays_exhausted() {
        let mut splitter = ChunkSplitter::new(std::io::Cursor::new(source(2)), 4);
        assert_eq!(splitter.next_chunk().await.unwrap().unwrap().len(), 2);
        assert!(splitter.next_chunk().await.unwrap().is_none());
        assert!(splitter.next_chunk().await.unwrap().is_none());
    }

    #[rstest]
    #[case(12 * 1024 * 1024, 5 * 1024 * 1024, 3)]
    #[case(10 * 1024 * 1024, 5 * 1024 * 1024, 2)]
    #[case(1, 5 * 1024 * 1024, 1)]
    #[case(0, 5 * 1024 * 1024, 0)]
    #[case(u64::MAX, 5 * 1024 * 1024, u64::MAX / (5 * 1024 * 1024) + 1)]
    #[case(u64::MAX, 1, u64::MAX)]
    fn counts_parts(#[case] total: u64, #[case] chunk_size: u64, #[case] expected: u64) {
        assert_eq!(part_count(total, chunk_size), expected);
    }
}
