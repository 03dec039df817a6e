use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const GRADIENT: Header = 2;

/// Size of the frame carrying a gradient of `values` floats, length prefix excluded.
pub fn gradient_frame_len(values: usize) -> usize {
    HEADER_SIZE + values * size_of::<f32>()
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// A flat gradient, either a rank's local contribution or the group mean.
    Gradient(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of a peer, announces who is connecting.
    Join { rank: usize, world_size: usize },
    /// A rank reached the barrier of `step`, `stop` is its stop vote.
    Arrive { step: u64, stop: bool },
    /// Every rank reached the barrier of `step`, `stop` is true if any rank voted to stop.
    Release { step: u64, stop: bool },
    /// A rank's view of the resolved training state.
    Digest { digest: String },
    /// Every rank presented the same digest.
    Agreed,
    /// Some rank presented a digest different from the hub's.
    Mismatch {
        rank: usize,
        expected: String,
        got: String,
    },
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    /// A fatal failure on the sending side, the run group must unwind.
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a short name of this message's kind, for logging and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Gradient(_)) => "data/gradient",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(Payload::Gradient(grad)) => {
                buf.extend_from_slice(&GRADIENT.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(grad)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut kind = [0; HEADER_SIZE];
        kind.copy_from_slice(kind_buf);

        match Header::from_be_bytes(kind) {
            ERR => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            GRADIENT => {
                let nums: &[f32] = bytemuck::try_cast_slice(rest).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Received a malformed gradient frame: {e:?}"),
                    )
                })?;

                Ok(Self::Data(Payload::Gradient(nums)))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_round_trips_through_json() {
        let msg = Msg::Control(Command::Arrive { step: 7, stop: true });
        let mut buf = Vec::new();
        assert!(msg.serialize(&mut buf).unwrap().is_none());

        match Msg::deserialize(&mut buf).unwrap() {
            Msg::Control(Command::Arrive { step, stop }) => {
                assert_eq!(step, 7);
                assert!(stop);
            }
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = 9u32.to_be_bytes().to_vec();
        assert!(Msg::deserialize(&mut buf).is_err());
    }

    #[test]
    fn short_frame_is_rejected() {
        let mut buf = vec![0u8; 2];
        assert!(Msg::deserialize(&mut buf).is_err());
    }
}
