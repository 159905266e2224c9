//! Content hashing.
//!
//! Every content address in the system is a lowercase hex sha512 digest: layer
//! blobs in the cache and on the blob store, and serialized manifests.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha512};

/// Length and sha512 of a byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentDigest {
    pub sha512: String,
    pub length: u64,
}

/// A writer that hashes and counts everything passed through to `inner`.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha512,
    bytes_written: u64,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha512::new(),
            bytes_written: 0,
        }
    }

    pub fn finish(self) -> (W, ContentDigest) {
        let HashingWriter {
            inner,
            hasher,
            bytes_written,
        } = self;
        let digest = ContentDigest {
            sha512: hex::encode(hasher.finalize()),
            length: bytes_written,
        };
        (inner, digest)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes_written = self
            .bytes_written
            .saturating_add(written.try_into().unwrap_or(u64::MAX));
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash a stream to its end.
pub fn digest_reader<R: Read>(reader: &mut R) -> io::Result<ContentDigest> {
    let mut writer = HashingWriter::new(io::sink());
    io::copy(reader, &mut writer)?;
    Ok(writer.finish().1)
}

/// Content address of an in-memory payload.
pub fn content_address(bytes: &[u8]) -> String {
    hex::encode(Sha512::digest(bytes))
}
