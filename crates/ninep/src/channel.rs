//! Framed message transport over a duplex byte stream.
//!
//! A frame on the wire is `size[4] type[1] tag[2] body`, little-endian,
//! with the size field counting itself. The channel decodes and encodes
//! whole [`Msg`]s and enforces the negotiated maximum message size on both
//! directions. Neither half is internally synchronized; the serve loop
//! keeps one reader task and funnels writers through a mutex.

use bytes::buf::{Buf, BufMut};
use bytes::BytesMut;
use futures::sink::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{ename, Error};
use crate::fcall::{FCall, Msg, MsgType, MIN_MSIZE, P92000, VERSION_UNKNOWN};
use crate::io_err;
use crate::serialize;
use crate::utils::Result;

fn frame_codec(msize: u32) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .max_frame_length(msize.saturating_sub(4) as usize)
        .new_codec()
}

/// Receiving half of a [`Channel`].
pub struct ChannelReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    /// Read one framed message. `None` means the peer closed the stream.
    pub async fn read_msg(&mut self) -> Result<Option<Msg>> {
        match self.inner.next().await {
            None => Ok(None),
            // the frame layer only reports InvalidData for over-long frames
            Some(Err(e)) if e.kind() == ::std::io::ErrorKind::InvalidData => {
                Err(io_err!(InvalidData, ename::MSG_TOO_LARGE).into())
            }
            Some(Err(e)) => Err(e.into()),
            Some(Ok(frame)) => Ok(Some(serialize::read_msg(&mut frame.reader())?)),
        }
    }

    fn set_msize(&mut self, msize: u32) {
        self.inner
            .decoder_mut()
            .set_max_frame_length(msize.saturating_sub(4) as usize);
    }
}

/// Sending half of a [`Channel`].
pub struct ChannelWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
    msize: u32,
}

impl<W: AsyncWrite + Unpin> ChannelWriter<W> {
    /// Encode and send one message, refusing frames above msize.
    pub async fn write_msg(&mut self, msg: &Msg) -> Result<()> {
        if msg.body.size() > self.msize {
            return Err(Error::proto(ename::MSG_TOO_LARGE));
        }

        let mut writer = BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, msg)?;
        self.inner.send(writer.into_inner().freeze()).await?;
        Ok(())
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    fn set_msize(&mut self, msize: u32) {
        self.msize = msize;
        self.inner
            .encoder_mut()
            .set_max_frame_length(msize.saturating_sub(4) as usize);
    }
}

/// A framed 9P message channel with a negotiated maximum message size.
pub struct Channel<R, W> {
    rx: ChannelReader<R>,
    tx: ChannelWriter<W>,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, msize: u32) -> Channel<R, W> {
        Channel {
            rx: ChannelReader {
                inner: FramedRead::new(reader, frame_codec(msize)),
            },
            tx: ChannelWriter {
                inner: FramedWrite::new(writer, frame_codec(msize)),
                msize,
            },
        }
    }

    pub fn msize(&self) -> u32 {
        self.tx.msize()
    }

    /// Reset the message size limit on both directions.
    pub fn set_msize(&mut self, msize: u32) {
        self.rx.set_msize(msize);
        self.tx.set_msize(msize);
    }

    pub async fn read_msg(&mut self) -> Result<Option<Msg>> {
        self.rx.read_msg().await
    }

    pub async fn write_msg(&mut self, msg: &Msg) -> Result<()> {
        self.tx.write_msg(msg).await
    }

    /// Split into independently owned halves for concurrent use.
    pub fn into_split(self) -> (ChannelReader<R>, ChannelWriter<W>) {
        (self.rx, self.tx)
    }

    /// Run the server side of version negotiation.
    ///
    /// Reads one `TVersion`, computes `min(client, server)` msize, answers
    /// `9P2000` for the base version or any `9P2000.*` subtype, and resets
    /// the channel limit. An unintelligible client version is answered
    /// with `unknown` and reported as an error.
    pub async fn negotiate(&mut self, srv_msize: u32) -> Result<(u32, String)> {
        let msg = self
            .read_msg()
            .await?
            .ok_or_else(|| Error::from(io_err!(UnexpectedEof, "connection closed")))?;

        let (client_msize, client_version) = match msg.body {
            FCall::TVersion { msize, version } => (msize, version),
            ref body => {
                let reply = Msg {
                    tag: msg.tag,
                    body: FCall::RError {
                        ename: ename::UNKNOWN_MSG.to_owned(),
                    },
                };
                self.write_msg(&reply).await?;
                return Err(Error::Proto(format!(
                    "expected Tversion, got {:?}",
                    MsgType::from(body)
                )));
            }
        };

        let known = client_version == P92000 || client_version.starts_with("9P2000.");
        // the server's answer must not exceed the client's offer
        let msize = srv_msize.min(client_msize);

        let reply = Msg {
            tag: msg.tag,
            body: FCall::RVersion {
                msize,
                version: if known && msize >= MIN_MSIZE {
                    P92000.to_owned()
                } else {
                    VERSION_UNKNOWN.to_owned()
                },
            },
        };
        self.write_msg(&reply).await?;

        if !known {
            return Err(Error::Proto(format!(
                "unknown protocol version: {}",
                client_version
            )));
        }
        if msize < MIN_MSIZE {
            return Err(Error::Proto(format!("msize too small: {}", msize)));
        }

        self.set_msize(msize);
        Ok((msize, P92000.to_owned()))
    }
}
