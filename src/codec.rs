//! Wire codec seam.
//!
//! Byte-level packet encoding lives outside the engine; a codec
//! implementation is injected alongside the transport. `decode` is
//! incremental: it consumes a complete packet from the front of `src` or
//! leaves the buffer untouched and returns `None` until more bytes arrive.

use crate::error::Result;
use crate::packet::Packet;
use bytes::BytesMut;

pub trait PacketCodec: Send + Sync {
    /// Appends the encoded form of `packet` to `dst`.
    fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> Result<()>;

    /// Decodes one packet from the front of `src`, if a complete one is
    /// buffered. A malformed frame is a protocol error and fatal to the
    /// connection.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>>;
}
