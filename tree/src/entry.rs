//! The directory entry model and the byte sources an entry can be served
//! from.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, BufReader, ReadBuf};
use tracing::warn;

/// Where an entry's bytes come from: a real file on disk, or raw bytes held
/// in memory (synthetic entries such as built-in pages).
#[derive(Debug, Clone)]
pub enum Source {
    Disk(PathBuf),
    Memory(Bytes),
}

/// One name inside a directory: stat metadata, the identity doubling as the
/// entity tag, and (for directories) the child mapping.
///
/// Entries are immutable once published; a rescan builds entirely new ones.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: SystemTime,
    pub is_dir: bool,

    /// Unique for the process lifetime. Reused across rescans iff mtime and
    /// directory-ness are unchanged, so clients can cache it as an ETag.
    pub id: u64,

    /// Empty unless `is_dir`. Built fresh on every scan, never mutated.
    pub children: HashMap<String, Arc<Entry>>,

    /// True iff this is a synthetic alias for a gzip-compressed file.
    pub gzip: bool,

    pub source: Source,
}

/// Byte sources that support random access. Blanket-implemented for every
/// read-and-seek type; every implementor is `Unpin`, so the methods take
/// `&mut self` and the bridge impls below let `Box<dyn SeekableRead>` be
/// used wherever tokio's traits are expected.
pub trait SeekableRead: Send {
    fn poll_read_unpin(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>>;
    fn start_seek_unpin(&mut self, position: SeekFrom) -> io::Result<()>;
    fn poll_complete_unpin(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<u64>>;
}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {
    fn poll_read_unpin(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(self).poll_read(cx, buf)
    }

    fn start_seek_unpin(&mut self, position: SeekFrom) -> io::Result<()> {
        Pin::new(self).start_seek(position)
    }

    fn poll_complete_unpin(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(self).poll_complete(cx)
    }
}

impl AsyncRead for Box<dyn SeekableRead> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        (**self).poll_read_unpin(cx, buf)
    }
}

impl AsyncSeek for Box<dyn SeekableRead> {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        (**self).start_seek_unpin(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        (**self).poll_complete_unpin(cx)
    }
}

/// A readable byte source handed to the content responder. Seekable sources
/// support arbitrary range requests; streams only forward skips.
pub enum Content {
    Seekable(Box<dyn SeekableRead>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Content {
    pub fn is_seekable(&self) -> bool {
        matches!(self, Content::Seekable(_))
    }
}

impl AsyncRead for Content {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Content::Seekable(s) => Pin::new(s).poll_read(cx, buf),
            Content::Stream(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl Entry {
    /// Opens the entry's bytes.
    ///
    /// `keep_gzipped` serves a compressed alias as its raw compressed bytes.
    /// Otherwise aliases up to `decode_budget` compressed bytes are decoded
    /// fully into memory (the result stays seekable, so range requests keep
    /// working); larger ones are decoded as a forward-only stream.
    ///
    /// Returns the content and whether it is still gzip-compressed and must
    /// be served with `Content-Encoding: gzip`. A decode failure falls back
    /// to the raw compressed bytes instead of failing the request.
    pub async fn open(&self, keep_gzipped: bool, decode_budget: u64) -> io::Result<(Content, bool)> {
        if !self.gzip || keep_gzipped {
            return Ok((self.raw().await?, self.gzip));
        }

        if self.size <= decode_budget {
            match self.decode_to_memory().await {
                Ok(data) => {
                    return Ok((
                        Content::Seekable(Box::new(io::Cursor::new(data))),
                        false,
                    ))
                }
                Err(e) => {
                    warn!(name = %self.name, err = %e, "gzip decode failed, serving compressed bytes");
                    return Ok((self.raw().await?, true));
                }
            }
        }

        // Too large to hold decoded in memory. The first chunk is read
        // eagerly so a corrupt gzip header can still fall back to the
        // compressed original before any response bytes are committed.
        let mut decoder = GzipDecoder::new(BufReader::new(self.raw().await?));
        let mut first = vec![0u8; 8 * 1024];
        match decoder.read(&mut first).await {
            Ok(n) => {
                first.truncate(n);
                Ok((
                    Content::Stream(Box::new(io::Cursor::new(first).chain(decoder))),
                    false,
                ))
            }
            Err(e) => {
                warn!(name = %self.name, err = %e, "gzip decode failed, serving compressed bytes");
                Ok((self.raw().await?, true))
            }
        }
    }

    async fn raw(&self) -> io::Result<Content> {
        Ok(match &self.source {
            Source::Disk(path) => Content::Seekable(Box::new(File::open(path).await?)),
            Source::Memory(data) => {
                Content::Seekable(Box::new(io::Cursor::new(data.clone())))
            }
        })
    }

    async fn decode_to_memory(&self) -> io::Result<Vec<u8>> {
        let mut decoder = GzipDecoder::new(BufReader::new(self.raw().await?));
        let mut data = Vec::new();
        decoder.read_to_end(&mut data).await?;
        Ok(data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::UNIX_EPOCH;
    use tokio::io::AsyncWriteExt;

    fn entry(size: u64, gzip: bool, source: Source) -> Entry {
        Entry {
            name: "content".into(),
            size,
            mode: 0o644,
            mtime: UNIX_EPOCH,
            is_dir: false,
            id: 1,
            children: HashMap::new(),
            gzip,
            source,
        }
    }

    async fn gzipped(data: &[u8]) -> Vec<u8> {
        use async_compression::tokio::bufread::GzipEncoder;
        let mut out = Vec::new();
        GzipEncoder::new(data)
            .read_to_end(&mut out)
            .await
            .expect("encode");
        out
    }

    async fn read_all(content: &mut Content) -> Vec<u8> {
        let mut out = Vec::new();
        content.read_to_end(&mut out).await.expect("read");
        out
    }

    #[tokio::test]
    async fn memory_source_is_seekable() {
        let e = entry(5, false, Source::Memory(Bytes::from_static(b"hello")));
        let (mut content, enc) = e.open(false, 0).await.unwrap();
        assert!(content.is_seekable());
        assert!(!enc);
        assert_eq!(read_all(&mut content).await, b"hello");
    }

    #[tokio::test]
    async fn gzip_alias_decodes_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html.gz");
        let compressed = gzipped(b"<html>hi</html>").await;
        tokio::fs::File::create(&path)
            .await
            .unwrap()
            .write_all(&compressed)
            .await
            .unwrap();

        let e = entry(compressed.len() as u64, true, Source::Disk(path));
        let (mut content, enc) = e.open(false, 1024 * 1024).await.unwrap();
        assert!(content.is_seekable());
        assert!(!enc);
        assert_eq!(read_all(&mut content).await, b"<html>hi</html>");
    }

    #[tokio::test]
    async fn gzip_alias_streams_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html.gz");
        let compressed = gzipped(b"<html>hi</html>").await;
        tokio::fs::File::create(&path)
            .await
            .unwrap()
            .write_all(&compressed)
            .await
            .unwrap();

        let e = entry(compressed.len() as u64, true, Source::Disk(path));
        let (mut content, enc) = e.open(false, 0).await.unwrap();
        assert!(!content.is_seekable());
        assert!(!enc);
        assert_eq!(read_all(&mut content).await, b"<html>hi</html>");
    }

    #[tokio::test]
    async fn gzip_passthrough_when_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html.gz");
        let compressed = gzipped(b"<html>hi</html>").await;
        tokio::fs::File::create(&path)
            .await
            .unwrap()
            .write_all(&compressed)
            .await
            .unwrap();

        let e = entry(compressed.len() as u64, true, Source::Disk(path.clone()));
        let (mut content, enc) = e.open(true, 1024 * 1024).await.unwrap();
        assert!(enc);
        assert_eq!(read_all(&mut content).await, compressed);
    }

    #[tokio::test]
    async fn corrupt_gzip_falls_back_to_raw() {
        let garbage = b"this is not gzip at all".to_vec();
        let e = entry(
            garbage.len() as u64,
            true,
            Source::Memory(Bytes::from(garbage.clone())),
        );
        let (mut content, enc) = e.open(false, 1024 * 1024).await.unwrap();
        assert!(enc, "must fall back to Content-Encoding: gzip");
        assert_eq!(read_all(&mut content).await, garbage);
    }
}
