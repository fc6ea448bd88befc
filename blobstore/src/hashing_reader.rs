use pin_project_lite::pin_project;
use tokio::io::AsyncRead;

pin_project! {
    /// Wraps an existing AsyncRead, and allows querying for the BLAKE3 digest
    /// and the number of bytes of all data read "through" it.
    pub struct B3HashingReader<R>
    where
        R: AsyncRead,
    {
        #[pin]
        inner: R,
        hasher: blake3::Hasher,
        size: u64,
    }
}

impl<R> B3HashingReader<R>
where
    R: AsyncRead,
{
    pub fn from(r: R) -> Self {
        Self {
            inner: r,
            hasher: blake3::Hasher::new(),
            size: 0,
        }
    }

    /// Number of bytes read so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Return the digest, lower hex.
    pub fn digest(&self) -> String {
        data_encoding::HEXLOWER.encode(self.hasher.finalize().as_bytes())
    }
}

impl<R> tokio::io::AsyncRead for B3HashingReader<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let buf_filled_len_before = buf.filled().len();

        let this = self.project();
        let ret = this.inner.poll_read(cx, buf);

        // write everything new filled into the hasher.
        let new = &buf.filled()[buf_filled_len_before..];
        this.hasher.update(new);
        *this.size += new.len() as u64;

        ret
    }
}
