//! PGM option TLV chain.
use crate::CodecError;
use byteorder::{BigEndian, ByteOrder};

/// Bit in `opt_type` marking the last option in the chain.
pub const OPT_END: u8 = 0b1000_0000;
/// Mask isolating the option type from `opt_type`.
pub const OPT_MASK: u8 = 0b0111_1111;

const OPT_HDR_LEN: usize = 3;

const TY_LENGTH: u8 = 0x00;
const TY_FRAGMENT: u8 = 0x01;
const TY_NAK_LIST: u8 = 0x02;
const TY_PARITY_GRP: u8 = 0x03;
const TY_PARITY: u8 = 0x04;
const TY_VAR_PKTLEN: u8 = 0x05;

/// Maximum number of additional sequence numbers an `OPT_NAK_LIST` can carry
/// (62 * 4 bytes + 3-byte option header fits inside the 255-byte option
/// length field).
#[allow(dead_code)]
pub const MAX_NAK_LIST_ENTRIES: usize = 62;

/// `OPT_FRAGMENT` payload: identifies this packet as part of a fragmented APDU.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Fragment {
    /// Sequence number of the first fragment of the APDU.
    pub opt_sqn: u32,
    /// Byte offset of this fragment within the APDU.
    pub opt_frag_off: u32,
    /// Total length of the APDU.
    pub opt_frag_len: u32,
}

/// A NAK's additional sequence numbers, beyond the primary `nak_sqn`.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct OptNakList(pub Vec<u32>);

/// A decoded PGM option.
#[derive(Debug, Clone, PartialEq)]
pub enum Opt {
    /// Mandatory first option: total byte length of the option chain.
    Length(u16),
    /// Fragmentation metadata.
    Fragment(Fragment),
    /// Extra NAK'd sequence numbers.
    NakList(OptNakList),
    /// Transmission group size (`k`), carried with proactive parity.
    ParityGrp(u32),
    /// Parity index `h` within the transmission group's parity space.
    Parity(u32),
    /// Flags that this transmission group's packets were zero-padded to a
    /// common length, with a 16-bit true-length trailer per source packet.
    VarPktlen,
}

impl Opt {
    fn ty(&self) -> u8 {
        match self {
            Opt::Length(_) => TY_LENGTH,
            Opt::Fragment(_) => TY_FRAGMENT,
            Opt::NakList(_) => TY_NAK_LIST,
            Opt::ParityGrp(_) => TY_PARITY_GRP,
            Opt::Parity(_) => TY_PARITY,
            Opt::VarPktlen => TY_VAR_PKTLEN,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Opt::Length(_) => 2,
            Opt::Fragment(_) => 12,
            Opt::NakList(list) => list.0.len() * 4,
            Opt::ParityGrp(_) => 4,
            Opt::Parity(_) => 4,
            Opt::VarPktlen => 0,
        }
    }

    fn encode_value(&self, buf: &mut Vec<u8>) {
        match self {
            Opt::Length(total) => buf.extend_from_slice(&total.to_be_bytes()),
            Opt::Fragment(f) => {
                buf.extend_from_slice(&f.opt_sqn.to_be_bytes());
                buf.extend_from_slice(&f.opt_frag_off.to_be_bytes());
                buf.extend_from_slice(&f.opt_frag_len.to_be_bytes());
            }
            Opt::NakList(list) => {
                for sqn in &list.0 {
                    buf.extend_from_slice(&sqn.to_be_bytes());
                }
            }
            Opt::ParityGrp(k) => buf.extend_from_slice(&k.to_be_bytes()),
            Opt::Parity(h) => buf.extend_from_slice(&h.to_be_bytes()),
            Opt::VarPktlen => {}
        }
    }
}

/// Encodes an option chain, setting `OPT_END` on the last entry.
///
/// `opts[0]` must be `Opt::Length`; its value is overwritten with the
/// correct total length regardless of what the caller passed in.
pub fn encode_options(opts: &[Opt]) -> Vec<u8> {
    assert!(matches!(opts.first(), Some(Opt::Length(_))), "OPT_LENGTH must be first");
    let total: usize = opts.iter().map(|o| OPT_HDR_LEN + o.value_len()).sum();

    let mut buf = Vec::with_capacity(total);
    for (i, opt) in opts.iter().enumerate() {
        let mut opt_type = opt.ty();
        if i == opts.len() - 1 {
            opt_type |= OPT_END;
        }
        let opt_length = (OPT_HDR_LEN + opt.value_len()) as u8;
        buf.push(opt_type);
        buf.push(opt_length);
        buf.push(0); // opt_reserved

        if i == 0 {
            Opt::Length(total as u16).encode_value(&mut buf);
        } else {
            opt.encode_value(&mut buf);
        }
    }
    buf
}

/// Parses a PGM option chain per the contracts in spec.md §4.3.
pub fn parse_options(buf: &[u8]) -> Result<Vec<Opt>, CodecError> {
    let mut opts = Vec::new();
    let mut offset = 0usize;
    let mut declared_total: Option<usize> = None;
    let mut terminated = false;

    while offset < buf.len() {
        if offset + OPT_HDR_LEN > buf.len() {
            return Err(CodecError::OptionOverrun { offset });
        }
        let opt_type = buf[offset];
        let opt_length = buf[offset + 1] as usize;
        let end = opt_type & OPT_END != 0;
        let ty = opt_type & OPT_MASK;

        if offset + opt_length > buf.len() || opt_length < OPT_HDR_LEN {
            return Err(CodecError::OptionOverrun { offset });
        }
        let value = &buf[offset + OPT_HDR_LEN..offset + opt_length];

        if offset == 0 {
            if ty != TY_LENGTH || opt_length != OPT_HDR_LEN + 2 {
                return Err(CodecError::BadOptLength);
            }
            let total = BigEndian::read_u16(value) as usize;
            if total != buf.len() {
                return Err(CodecError::BadOptLength);
            }
            declared_total = Some(total);
            opts.push(Opt::Length(total as u16));
        } else {
            opts.push(decode_value(ty, value)?);
        }

        offset += opt_length;
        if end {
            terminated = true;
            break;
        }
    }

    if declared_total.is_none() {
        return Err(CodecError::OptPresentWithoutOptions);
    }
    if !terminated {
        return Err(CodecError::MissingOptEnd);
    }
    Ok(opts)
}

fn decode_value(ty: u8, value: &[u8]) -> Result<Opt, CodecError> {
    Ok(match ty {
        TY_FRAGMENT if value.len() == 12 => Opt::Fragment(Fragment {
            opt_sqn: BigEndian::read_u32(&value[0..4]),
            opt_frag_off: BigEndian::read_u32(&value[4..8]),
            opt_frag_len: BigEndian::read_u32(&value[8..12]),
        }),
        TY_NAK_LIST if value.len() % 4 == 0 => {
            let entries = value.chunks_exact(4).map(BigEndian::read_u32).collect();
            Opt::NakList(OptNakList(entries))
        }
        TY_PARITY_GRP if value.len() == 4 => Opt::ParityGrp(BigEndian::read_u32(value)),
        TY_PARITY if value.len() == 4 => Opt::Parity(BigEndian::read_u32(value)),
        TY_VAR_PKTLEN if value.is_empty() => Opt::VarPktlen,
        _ => return Err(CodecError::BadOptLength),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_round_trips() {
        let opts = vec![
            Opt::Length(0),
            Opt::Fragment(Fragment {
                opt_sqn: 10,
                opt_frag_off: 4,
                opt_frag_len: 8,
            }),
        ];
        let encoded = encode_options(&opts);
        let decoded = parse_options(&encoded).unwrap();
        assert_eq!(
            decoded[1],
            Opt::Fragment(Fragment {
                opt_sqn: 10,
                opt_frag_off: 4,
                opt_frag_len: 8
            })
        );
    }

    #[test]
    fn nak_list_round_trips() {
        let opts = vec![Opt::Length(0), Opt::NakList(OptNakList(vec![1, 2, 3]))];
        let encoded = encode_options(&opts);
        let decoded = parse_options(&encoded).unwrap();
        assert_eq!(decoded[1], Opt::NakList(OptNakList(vec![1, 2, 3])));
    }

    #[test]
    fn missing_opt_end_rejected() {
        let mut encoded = encode_options(&[Opt::Length(0), Opt::VarPktlen]);
        let last = encoded.len() - OPT_HDR_LEN;
        encoded[last] &= OPT_MASK; // strip OPT_END
        assert_eq!(parse_options(&encoded), Err(CodecError::MissingOptEnd));
    }

    #[test]
    fn overrun_option_rejected() {
        let mut encoded = encode_options(&[Opt::Length(0), Opt::VarPktlen]);
        let second_opt_length_offset = 5 + 1;
        encoded[second_opt_length_offset] = encoded.len() as u8 + 10;
        assert_eq!(parse_options(&encoded), Err(CodecError::OptionOverrun { offset: 5 }));
    }

    #[test]
    fn bad_opt_length_rejected() {
        let mut encoded = encode_options(&[Opt::Length(0), Opt::VarPktlen]);
        encoded[1] = 4; // OPT_LENGTH must be exactly OPT_HDR_LEN + 2 = 5
        assert_eq!(parse_options(&encoded), Err(CodecError::BadOptLength));
    }
}
