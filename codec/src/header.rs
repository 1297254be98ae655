//! The fixed 16-byte PGM header shared by every packet type.
use crate::CodecError;
use byteorder::{BigEndian, ByteOrder};

/// Length in bytes of the fixed PGM header.
pub const HEADER_LEN: usize = 16;

/// Bit in the options byte: at least one option follows the header.
pub const OPT_PRESENT: u8 = 0b0000_0001;
/// Bit in the options byte: options were inserted by a network element.
pub const OPT_NETWORK: u8 = 0b0000_0010;
/// Bit in the options byte: the packet carries FEC parity, not original data.
pub const OPT_PARITY: u8 = 0b0000_1000;
/// Bit in the options byte: packets in this transmission group vary in length.
pub const OPT_VAR_PKTLEN: u8 = 0b0001_0000;

/// PGM type codes used by this sender (RFC 3208 §8).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketType {
    /// Source Path Message.
    Spm,
    /// Original data.
    Odata,
    /// Repair (retransmitted) data.
    Rdata,
    /// Negative acknowledgment.
    Nak,
    /// Null negative acknowledgment (DLR-originated).
    Nnak,
    /// NAK confirmation.
    Ncf,
    /// SPM request.
    Spmr,
}

impl PacketType {
    fn code(self) -> u8 {
        match self {
            PacketType::Spm => 0x00,
            PacketType::Odata => 0x04,
            PacketType::Rdata => 0x05,
            PacketType::Nak => 0x08,
            PacketType::Nnak => 0x09,
            PacketType::Ncf => 0x0A,
            PacketType::Spmr => 0x40,
        }
    }

    fn from_code(code: u8) -> Result<Self, CodecError> {
        Ok(match code {
            0x00 => PacketType::Spm,
            0x04 => PacketType::Odata,
            0x05 => PacketType::Rdata,
            0x08 => PacketType::Nak,
            0x09 => PacketType::Nnak,
            0x0A => PacketType::Ncf,
            0x40 => PacketType::Spmr,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

/// The fixed PGM header.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    /// Source port.
    pub source_port: u16,
    /// Destination port.
    pub dest_port: u16,
    /// Packet type.
    pub ty: PacketType,
    /// Options bitfield (`OPT_PRESENT`, `OPT_NETWORK`, `OPT_PARITY`, `OPT_VAR_PKTLEN`).
    pub options: u8,
    /// Internet checksum over the whole TPDU.
    pub checksum: u16,
    /// Globally-unique source identifier.
    pub gsi: [u8; 6],
    /// Length of the TSDU following the header (and any options).
    pub tsdu_length: u16,
}

impl Header {
    /// Encodes the header into the first [`HEADER_LEN`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u16(&mut buf[0..2], self.source_port);
        BigEndian::write_u16(&mut buf[2..4], self.dest_port);
        buf[4] = self.ty.code();
        buf[5] = self.options;
        BigEndian::write_u16(&mut buf[6..8], self.checksum);
        buf[8..14].copy_from_slice(&self.gsi);
        BigEndian::write_u16(&mut buf[14..16], self.tsdu_length);
    }

    /// Decodes the header from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::ShortHeader);
        }
        let mut gsi = [0u8; 6];
        gsi.copy_from_slice(&buf[8..14]);
        Ok(Self {
            source_port: BigEndian::read_u16(&buf[0..2]),
            dest_port: BigEndian::read_u16(&buf[2..4]),
            ty: PacketType::from_code(buf[4])?,
            options: buf[5],
            checksum: BigEndian::read_u16(&buf[6..8]),
            gsi,
            tsdu_length: BigEndian::read_u16(&buf[14..16]),
        })
    }

    /// Whether `OPT_PRESENT` is set.
    pub fn has_options(&self) -> bool {
        self.options & OPT_PRESENT != 0
    }
}
