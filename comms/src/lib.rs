//! Framed message channel shared by the processes of a run group.
//!
//! Every frame is a big-endian length followed by the serialized message.
//! Control messages travel as JSON, gradient frames are sent as raw `f32`
//! bytes without an intermediate copy.

mod align;
mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::{Align1, Align4};
pub use deserialize::Deserialize;
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frame size a fresh receiver accepts, enough for any control or error message.
///
/// Anything larger is treated as a corrupt stream unless the receiver was
/// told to expect it with `OnoReceiver::set_max_frame_len`.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Creates both `OnoReceiver` and `OnoSender` network channel parts.
///
/// Given a writer and reader creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of an ono receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
