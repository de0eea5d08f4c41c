//! Streaming SHA-256 helpers.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental hasher that also counts bytes.
#[derive(Default)]
pub(crate) struct HashingCounter {
    hasher: Sha256,
    size: u64,
}

impl HashingCounter {
    pub(crate) fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    pub(crate) fn finish(self) -> (u64, String) {
        (self.size, hex::encode(self.hasher.finalize()))
    }
}

/// Copy `reader` into `writer`, feeding every byte to `counter`.
pub(crate) async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &mut HashingCounter,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        counter.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
    }
    Ok(())
}

/// Copy `reader` into `writer`, returning the byte count and hex digest.
pub(crate) async fn copy_hashed<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<(u64, String)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut counter = HashingCounter::default();
    copy_counted(reader, writer, &mut counter).await?;
    Ok(counter.finish())
}
