//! PGM (RFC 3208) wire format.
//!
//! This crate only encodes/decodes bytes; it has no notion of a transmit
//! window, a retransmit queue or a socket. Everything here is a pure
//! function or a thin, cheaply-constructed struct over a `Vec<u8>`/`&[u8]`.
#![deny(missing_docs)]
#![deny(warnings)]

mod header;
mod options;
mod packet;

pub use header::{Header, PacketType, HEADER_LEN, OPT_NETWORK, OPT_PARITY, OPT_PRESENT, OPT_VAR_PKTLEN};
pub use options::{Fragment, Opt, OptNakList, OPT_END, OPT_MASK};
pub use packet::{
    build_ncf, build_odata, build_parity, build_spm, build_spmr, rewrite_as_rdata, verify_nak,
    verify_nnak, verify_spmr, BuiltOdata, NakInfo, Nla, OdataFields, ParityFields, SpmFields,
    TYPE_NAK, TYPE_NCF, TYPE_NNAK, TYPE_ODATA, TYPE_RDATA, TYPE_SPM, TYPE_SPMR,
};

/// Errors rejecting a malformed incoming control packet (spec.md's `Malformed`).
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum CodecError {
    /// The packet is shorter than the fixed header.
    #[error("packet shorter than the fixed PGM header")]
    ShortHeader,
    /// The header's declared TSDU length does not match the actual payload.
    #[error("TSDU length mismatch: header said {declared}, packet carried {actual}")]
    TsduLengthMismatch {
        /// Length declared in the header.
        declared: usize,
        /// Length actually present in the buffer.
        actual: usize,
    },
    /// `OPT_PRESENT` is set but no option chain follows.
    #[error("OPT_PRESENT set without an option chain")]
    OptPresentWithoutOptions,
    /// The first option was not `OPT_LENGTH`, or its length field was wrong.
    #[error("OPT_LENGTH missing or malformed")]
    BadOptLength,
    /// The option chain did not end with an `OPT_END`-flagged option.
    #[error("option chain missing OPT_END terminator")]
    MissingOptEnd,
    /// An option's declared length runs past the end of the packet.
    #[error("option at offset {offset} extends past the end of the packet")]
    OptionOverrun {
        /// Byte offset the option started at.
        offset: usize,
    },
    /// A NAK's source NLA did not match the sender's bound unicast address.
    #[error("NAK source NLA does not match the sender's unicast address")]
    SourceNlaMismatch,
    /// A NAK's group NLA did not match the configured multicast group.
    #[error("NAK group NLA does not match the configured multicast group")]
    GroupNlaMismatch,
    /// The packet's type code is not one this codec recognizes.
    #[error("unrecognized PGM type code {0:#04x}")]
    UnknownType(u8),
    /// A parity NAK was received but on-demand parity is disabled.
    #[error("parity NAK received with on-demand parity disabled")]
    OndemandParityDisabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header {
            source_port: 7000,
            dest_port: 7001,
            ty: PacketType::Odata,
            options: 0,
            checksum: 0,
            gsi: [1, 2, 3, 4, 5, 6],
            tsdu_length: 5,
        };
        let mut buf = [0u8; HEADER_LEN];
        h.encode(&mut buf);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(decoded.source_port, 7000);
        assert_eq!(decoded.ty, PacketType::Odata);
        assert_eq!(decoded.gsi, [1, 2, 3, 4, 5, 6]);
        assert_eq!(decoded.tsdu_length, 5);
    }
}
