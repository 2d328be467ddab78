use bytes::Bytes;
use bytes::BytesMut;
use memchr::memchr;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

/// Newline-delimited reader for the control endpoint's JSON-lines protocol.
///
/// Control requests are small, so the buffer starts small; the length cap
/// exists to bound a misbehaving local client.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_line_len: usize,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
            max_line_len: 64 * 1024,
        }
    }

    pub fn max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max.max(1);
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Read one line, stripping the trailing `\n` and an optional `\r`.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` for a line (may be empty),
    /// - `Ok(None)` on clean EOF with no buffered data.
    pub async fn read_line(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(i) = memchr(b'\n', &self.buf) {
                let mut line = self.buf.split_to(i + 1).freeze();
                let mut end = line.len() - 1;
                if end > 0 && line[end - 1] == b'\r' {
                    end -= 1;
                }
                line.truncate(end);
                return Ok(Some(line));
            }

            if self.buf.len() > self.max_line_len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading line",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_crlf_and_lf_and_empty_lines() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"{\"op\":\"x\"}\r\n\nlast\n").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        assert_eq!(&lr.read_line().await.unwrap().unwrap()[..], b"{\"op\":\"x\"}");
        assert_eq!(&lr.read_line().await.unwrap().unwrap()[..], b"");
        assert_eq!(&lr.read_line().await.unwrap().unwrap()[..], b"last");
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_line_is_an_error() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            let _ = b.write_all(&[b'x'; 64]).await;
        });

        let mut lr = LineReader::new(a).max_line_len(16);
        assert!(lr.read_line().await.is_err());
    }
}
