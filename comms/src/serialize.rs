use std::io;

/// Writes a value into an outgoing frame.
pub trait Serialize<'a> {
    /// Appends the owned part of the message into `buf`, the returned slice (if any)
    /// is written right after it without being copied.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
