//! The implementation of the receiving end of the application layer protocol.

use std::io;

use bytemuck::Zeroable;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, DEFAULT_MAX_FRAME_LEN, Deserialize, LEN_TYPE_SIZE, LenType};

/// The receiving end handle of the communication.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u32>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    /// Creates a new `OnoReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sets the largest frame this receiver accepts.
    ///
    /// # Arguments
    /// * `len` - The size in bytes of the largest expected frame, length prefix excluded.
    pub fn set_max_frame_len(&mut self, len: usize) {
        self.max_frame_len = len;
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Waits to receive a new message, deserializing it from the receiver's own buffer.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    pub async fn recv<'buf, T>(&'buf mut self) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        let Self {
            rx,
            buf,
            max_frame_len,
        } = self;
        let frame = read_frame(rx, buf, *max_frame_len).await?;
        T::deserialize(frame)
    }

    /// Waits to receive a new message from the inner receiver.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///           `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let frame = read_frame(&mut self.rx, buf, self.max_frame_len).await?;
        T::deserialize(frame)
    }
}

/// Reads one length prefixed frame into `buf` and returns the bytes of the frame.
async fn read_frame<'buf, R, B>(
    rx: &mut R,
    buf: &'buf mut Vec<B>,
    max_len: usize,
) -> io::Result<&'buf mut [u8]>
where
    R: AsyncRead + Unpin,
    B: Align4,
{
    let mut size_buf = [0; LEN_TYPE_SIZE];
    rx.read_exact(&mut size_buf).await?;
    let len = LenType::from_be_bytes(size_buf) as usize;

    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received a frame of {len} bytes, the maximum is {max_len}"),
        ));
    }

    let needed_amount = len.div_ceil(size_of::<B>());
    buf.clear();
    buf.resize(needed_amount, B::zeroed());

    let view: &mut [u8] = bytemuck::cast_slice_mut(buf.as_mut_slice());
    let frame = &mut view[..len];
    rx.read_exact(frame).await?;
    Ok(frame)
}
