//! Running SHA-1 and MD5 digests over a byte stream

use md5::Md5;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};
use treesync_core::domain::{ContentHashes, Md5Hash, Sha1Hash};

use crate::Result;

/// SHA-1 and MD5 updated together
#[derive(Clone, Default)]
pub struct StreamDigests {
    sha1: Sha1,
    md5: Md5,
    bytes: u64,
}

impl StreamDigests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha1.update(data);
        self.md5.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish both digests
    pub fn finalize(self) -> ContentHashes {
        let sha1 = self.sha1.finalize();
        let md5 = self.md5.finalize();
        // Digest output lengths are fixed by the algorithms, so these cannot fail.
        ContentHashes {
            sha1: Sha1Hash::from_bytes(&sha1).ok(),
            md5: Md5Hash::from_bytes(&md5).ok(),
        }
    }
}

impl std::fmt::Debug for StreamDigests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDigests")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

/// Hash a whole stream in `chunk_size` reads, returning the digests and length
pub async fn hash_reader<R>(reader: &mut R, chunk_size: usize) -> Result<(ContentHashes, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut digests = StreamDigests::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digests.update(&buf[..n]);
    }
    let len = digests.bytes();
    Ok((digests.finalize(), len))
}
