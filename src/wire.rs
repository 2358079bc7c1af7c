//! # Wire Codec
//!
//! Bit-exact packet headers for the datagram transports. Every multi-byte
//! field travels in network byte order; the layout is fixed and versioned
//! through the reserved top bit of the leading type byte.
//!
//! ## Header layout (24 bytes)
//!
//! ```text
//! offset  size  field
//!      0     1  packet type (top bit reserved, must be zero)
//!      1     1  auxiliary bits (attribute / accept status / NACK kind)
//!      2     4  source connection ID
//!      6     4  destination connection ID
//!     10     4  sequence number
//!     14     4  cumulative ACK
//!     18     4  selective-ACK bitmap (32 slots above the cumulative)
//!     22     2  payload length
//! ```
//!
//! RMA packets carry an additional sub-header at the front of the payload;
//! see [`RmaWriteHeader`], [`RmaReadRequest`] and [`RmaReadReply`].

use crate::status::{Result, Status};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Reserved versioning bit in the type byte.
pub const TYPE_RESERVED: u8 = 0x80;

/// NACK kind carried in the auxiliary byte: receiver out of RX buffers.
pub const NACK_RNR: u8 = 0;
/// NACK kind carried in the auxiliary byte: unknown or unauthorised RMA
/// handle; the payload names the failing operation.
pub const NACK_RMA_HANDLE: u8 = 1;

/// On-wire packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Connection request carrying the application payload.
    ConnRequest = 0,
    /// Accepting reply from the passive side.
    ConnReply = 1,
    /// Final leg of the three-way handshake.
    ConnAck = 2,
    /// Rejection from the passive side.
    ConnReject = 3,
    /// Application message.
    Msg = 4,
    /// Standalone acknowledgement.
    Ack = 5,
    /// Negative acknowledgement (RNR or RMA handle).
    Nack = 6,
    /// RMA write fragment.
    RmaWrite = 7,
    /// RMA read request for one fragment window.
    RmaReadRequest = 8,
    /// Data reply to an RMA read request.
    RmaReadReply = 9,
    /// Liveness probe.
    Keepalive = 10,
}

impl PacketType {
    fn from_wire(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => PacketType::ConnRequest,
            1 => PacketType::ConnReply,
            2 => PacketType::ConnAck,
            3 => PacketType::ConnReject,
            4 => PacketType::Msg,
            5 => PacketType::Ack,
            6 => PacketType::Nack,
            7 => PacketType::RmaWrite,
            8 => PacketType::RmaReadRequest,
            9 => PacketType::RmaReadReply,
            10 => PacketType::Keepalive,
            _ => return Err(Status::Invalid),
        })
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: PacketType,
    pub aux: u8,
    pub src: u32,
    pub dst: u32,
    pub seq: u32,
    pub ack: u32,
    pub sack: u32,
    pub len: u16,
}

impl Header {
    /// Append the encoded header to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind as u8);
        buf.push(self.aux);
        // Writes into a Vec cannot fail.
        let _ = buf.write_u32::<BigEndian>(self.src);
        let _ = buf.write_u32::<BigEndian>(self.dst);
        let _ = buf.write_u32::<BigEndian>(self.seq);
        let _ = buf.write_u32::<BigEndian>(self.ack);
        let _ = buf.write_u32::<BigEndian>(self.sack);
        let _ = buf.write_u16::<BigEndian>(self.len);
    }

    /// Decode a datagram into a header and its payload slice. Rejects short
    /// datagrams, unknown types, a set reserved bit, and a length field that
    /// disagrees with the datagram size.
    pub fn decode(datagram: &[u8]) -> Result<(Header, &[u8])> {
        if datagram.len() < HEADER_LEN {
            return Err(Status::Invalid);
        }
        let (mut head, payload) = datagram.split_at(HEADER_LEN);
        let type_byte = head.read_u8().map_err(|_| Status::Invalid)?;
        if type_byte & TYPE_RESERVED != 0 {
            return Err(Status::Invalid);
        }
        let header = Header {
            kind: PacketType::from_wire(type_byte)?,
            aux: head.read_u8().map_err(|_| Status::Invalid)?,
            src: head.read_u32::<BigEndian>().map_err(|_| Status::Invalid)?,
            dst: head.read_u32::<BigEndian>().map_err(|_| Status::Invalid)?,
            seq: head.read_u32::<BigEndian>().map_err(|_| Status::Invalid)?,
            ack: head.read_u32::<BigEndian>().map_err(|_| Status::Invalid)?,
            sack: head.read_u32::<BigEndian>().map_err(|_| Status::Invalid)?,
            len: head.read_u16::<BigEndian>().map_err(|_| Status::Invalid)?,
        };
        if payload.len() != header.len as usize {
            return Err(Status::Invalid);
        }
        Ok((header, payload))
    }

    /// Re-stamp the acknowledgement fields of an already-encoded packet.
    /// Retransmissions use this so every copy on the wire carries the
    /// receiver state current at transmit time.
    pub fn patch_ack(packet: &mut [u8], ack: u32, sack: u32) {
        debug_assert!(packet.len() >= HEADER_LEN);
        packet[14..18].copy_from_slice(&ack.to_be_bytes());
        packet[18..22].copy_from_slice(&sack.to_be_bytes());
    }
}

/// Sub-header of an [`PacketType::RmaWrite`] payload (24 bytes), followed by
/// the fragment data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaWriteHeader {
    /// Token of the target registration.
    pub token: u64,
    /// Byte offset into the target region.
    pub offset: u64,
    /// Originator's operation ID, echoed in RMA-handle NACKs.
    pub op: u64,
}

pub const RMA_WRITE_HEADER_LEN: usize = 24;

impl RmaWriteHeader {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let _ = buf.write_u64::<BigEndian>(self.token);
        let _ = buf.write_u64::<BigEndian>(self.offset);
        let _ = buf.write_u64::<BigEndian>(self.op);
    }

    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8])> {
        if payload.len() < RMA_WRITE_HEADER_LEN {
            return Err(Status::Invalid);
        }
        let (mut head, data) = payload.split_at(RMA_WRITE_HEADER_LEN);
        Ok((
            Self {
                token: head.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
                offset: head.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
                op: head.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
            },
            data,
        ))
    }
}

/// Payload of an [`PacketType::RmaReadRequest`] (44 bytes): which window of
/// the target region to read, and where the reply should land at the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaReadRequest {
    pub token: u64,
    pub offset: u64,
    pub length: u32,
    pub origin_token: u64,
    pub origin_offset: u64,
    pub op: u64,
}

pub const RMA_READ_REQUEST_LEN: usize = 44;

impl RmaReadRequest {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let _ = buf.write_u64::<BigEndian>(self.token);
        let _ = buf.write_u64::<BigEndian>(self.offset);
        let _ = buf.write_u32::<BigEndian>(self.length);
        let _ = buf.write_u64::<BigEndian>(self.origin_token);
        let _ = buf.write_u64::<BigEndian>(self.origin_offset);
        let _ = buf.write_u64::<BigEndian>(self.op);
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.len() != RMA_READ_REQUEST_LEN {
            return Err(Status::Invalid);
        }
        Ok(Self {
            token: payload.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
            offset: payload.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
            length: payload.read_u32::<BigEndian>().map_err(|_| Status::Invalid)?,
            origin_token: payload.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
            origin_offset: payload.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
            op: payload.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
        })
    }
}

/// Sub-header of an [`PacketType::RmaReadReply`] payload (24 bytes),
/// followed by the fragment data for the origin region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaReadReply {
    pub origin_token: u64,
    pub origin_offset: u64,
    pub op: u64,
}

pub const RMA_READ_REPLY_LEN: usize = 24;

impl RmaReadReply {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let _ = buf.write_u64::<BigEndian>(self.origin_token);
        let _ = buf.write_u64::<BigEndian>(self.origin_offset);
        let _ = buf.write_u64::<BigEndian>(self.op);
    }

    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8])> {
        if payload.len() < RMA_READ_REPLY_LEN {
            return Err(Status::Invalid);
        }
        let (mut head, data) = payload.split_at(RMA_READ_REPLY_LEN);
        Ok((
            Self {
                origin_token: head.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
                origin_offset: head.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
                op: head.read_u64::<BigEndian>().map_err(|_| Status::Invalid)?,
            },
            data,
        ))
    }
}

/// Serial-number comparison over the 32-bit sequence space (RFC 1982):
/// `a` is strictly before `b`.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` is at or before `b` in the serial space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            kind: PacketType::Msg,
            aux: 3,
            src: 0xdead_beef,
            dst: 0x0102_0304,
            seq: 42,
            ack: 41,
            sack: 0b101,
            len: 5,
        }
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        buf.extend_from_slice(b"hello");

        let (header, payload) = Header::decode(&buf).unwrap();
        assert_eq!(header, sample());
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn fields_are_network_byte_order() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf);
        // Source connection ID sits at offset 2, big-endian.
        assert_eq!(&buf[2..6], &[0xde, 0xad, 0xbe, 0xef]);
        // Payload length sits at offset 22.
        assert_eq!(&buf[22..24], &[0x00, 0x05]);
    }

    #[test]
    fn decode_rejects_bad_input() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf);
        buf.extend_from_slice(b"hello");

        // Truncated datagram.
        assert_eq!(Header::decode(&buf[..10]), Err(Status::Invalid));
        // Length disagreeing with the datagram.
        assert_eq!(Header::decode(&buf[..buf.len() - 1]), Err(Status::Invalid));
        // Reserved version bit.
        let mut versioned = buf.clone();
        versioned[0] |= TYPE_RESERVED;
        assert_eq!(Header::decode(&versioned), Err(Status::Invalid));
        // Unknown type.
        let mut unknown = buf;
        unknown[0] = 0x7f;
        assert_eq!(Header::decode(&unknown), Err(Status::Invalid));
    }

    #[test]
    fn patch_ack_restamps_in_place() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf);
        Header::patch_ack(&mut buf, 99, 0xffff_0000);
        let (header, _) = Header::decode(&buf).unwrap();
        assert_eq!(header.ack, 99);
        assert_eq!(header.sack, 0xffff_0000);
        assert_eq!(header.seq, 42);
    }

    #[test]
    fn rma_subheaders_round_trip() {
        let write = RmaWriteHeader { token: 7, offset: 1 << 40, op: 9 };
        let mut buf = Vec::new();
        write.write_to(&mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        let (decoded, data) = RmaWriteHeader::decode(&buf).unwrap();
        assert_eq!(decoded, write);
        assert_eq!(data, &[1, 2, 3]);

        let req = RmaReadRequest {
            token: 1,
            offset: 2,
            length: 3,
            origin_token: 4,
            origin_offset: 5,
            op: 6,
        };
        let mut buf = Vec::new();
        req.write_to(&mut buf);
        assert_eq!(RmaReadRequest::decode(&buf).unwrap(), req);

        let reply = RmaReadReply { origin_token: 4, origin_offset: 5, op: 6 };
        let mut buf = Vec::new();
        reply.write_to(&mut buf);
        buf.push(0xaa);
        let (decoded, data) = RmaReadReply::decode(&buf).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(data, &[0xaa]);
    }

    #[test]
    fn serial_comparison_handles_wraparound() {
        assert!(seq_lt(1, 2));
        assert!(!seq_lt(2, 2));
        assert!(seq_le(2, 2));
        // Across the wrap point, u32::MAX precedes 0.
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_lt(u32::MAX - 5, 10));
        assert!(!seq_lt(10, u32::MAX - 5));
    }
}
