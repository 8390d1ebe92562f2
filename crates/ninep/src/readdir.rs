//! Server-side helper presenting a directory listing as a readable file.
//!
//! Reading a directory in 9P returns a stream of marshalled `Dir` records.
//! `Readdir` adapts a backend's entry stream to the [`File`] contract so
//! the session can serve directory reads exactly like file reads.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::{ename, Error};
use crate::fcall::Dir;
use crate::fs::{DirStream, File};
use crate::serialize::Encodable;
use crate::utils::Result;

/// Wraps a stream of directory entries into a `File`.
///
/// Offsets must increase monotonically by exactly the previous returned
/// count; anything else is a `bad offset`. An entry that does not fit the
/// caller's buffer is stashed for the next call. End of stream is a
/// zero-length read with no error.
pub struct Readdir {
    stream: DirStream,
    buf: Option<Dir>, // one-item lookahead
    offset: u64,
}

impl Readdir {
    pub fn new(stream: DirStream) -> Readdir {
        Readdir {
            stream,
            buf: None,
            offset: 0,
        }
    }

    /// A `Readdir` over a fixed snapshot of entries.
    pub fn fixed(dirs: Vec<Dir>) -> Readdir {
        Readdir::new(stream::iter(dirs.into_iter().map(Ok)).boxed())
    }

    async fn next_entry(&mut self) -> Result<Option<Dir>> {
        if let Some(d) = self.buf.take() {
            return Ok(Some(d));
        }
        match self.stream.next().await {
            None => Ok(None),
            Some(d) => Ok(Some(d?)),
        }
    }
}

#[async_trait]
impl File for Readdir {
    async fn read(&mut self, p: &mut [u8], offset: u64) -> Result<usize> {
        if self.offset != offset {
            return Err(Error::proto(ename::BAD_OFFSET));
        }

        let mut n = 0;
        while let Some(d) = self.next_entry().await? {
            let mut rec = Vec::with_capacity(d.size() as usize + 2);
            d.encode(&mut rec)?;

            if n + rec.len() > p.len() {
                // would over-fill the buffer: save the entry for next time
                self.buf = Some(d);
                if n == 0 {
                    return Err(Error::proto(ename::READ_TOO_SMALL));
                }
                break;
            }

            p[n..n + rec.len()].copy_from_slice(&rec);
            n += rec.len();
        }

        self.offset += n as u64;
        Ok(n)
    }

    async fn write(&mut self, _p: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::proto(ename::INVALID_WRITE))
    }

    fn iounit(&self) -> u32 {
        0
    }
}
