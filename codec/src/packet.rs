//! Per-type packet bodies: SPM, ODATA/RDATA, NAK/NNAK, NCF, SPMR.
use crate::header::{Header, PacketType, HEADER_LEN, OPT_PARITY, OPT_PRESENT, OPT_VAR_PKTLEN};
use crate::options::{encode_options, parse_options, Fragment, Opt, OptNakList};
use crate::CodecError;
use byteorder::{BigEndian, ByteOrder};

/// `PacketType::Nak`'s wire type code, for callers that only have raw bytes.
pub const TYPE_NAK: u8 = 0x08;
/// `PacketType::Nnak`'s wire type code.
pub const TYPE_NNAK: u8 = 0x09;
/// `PacketType::Ncf`'s wire type code.
pub const TYPE_NCF: u8 = 0x0A;
/// `PacketType::Spm`'s wire type code.
pub const TYPE_SPM: u8 = 0x00;
/// `PacketType::Odata`'s wire type code.
pub const TYPE_ODATA: u8 = 0x04;
/// `PacketType::Rdata`'s wire type code.
pub const TYPE_RDATA: u8 = 0x05;
/// `PacketType::Spmr`'s wire type code.
pub const TYPE_SPMR: u8 = 0x40;

const AFI_IP: u16 = 1;
const AFI_IP6: u16 = 2;

/// A Network Layer Address: an address-family indicator plus the address.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Nla {
    /// IPv4 address.
    V4([u8; 4]),
    /// IPv6 address.
    V6([u8; 16]),
}

impl Nla {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Nla::V4(addr) => {
                buf.extend_from_slice(&AFI_IP.to_be_bytes());
                buf.extend_from_slice(addr);
            }
            Nla::V6(addr) => {
                buf.extend_from_slice(&AFI_IP6.to_be_bytes());
                buf.extend_from_slice(addr);
            }
        }
    }

    fn wire_len(&self) -> usize {
        match self {
            Nla::V4(_) => 2 + 4,
            Nla::V6(_) => 2 + 16,
        }
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::ShortHeader);
        }
        let afi = BigEndian::read_u16(&buf[0..2]);
        match afi {
            AFI_IP if buf.len() >= 6 => {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&buf[2..6]);
                Ok((Nla::V4(addr), 6))
            }
            AFI_IP6 if buf.len() >= 18 => {
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&buf[2..18]);
                Ok((Nla::V6(addr), 18))
            }
            _ => Err(CodecError::ShortHeader),
        }
    }
}

fn finalize_checksum(buf: &mut [u8]) {
    buf[6] = 0;
    buf[7] = 0;
    let csum = pgm_checksum::fold(pgm_checksum::partial(buf));
    BigEndian::write_u16(&mut buf[6..8], csum);
}

/// Fields specific to an SPM packet.
#[derive(Debug, Clone, Copy)]
pub struct SpmFields {
    /// Monotonically increasing SPM sequence number.
    pub spm_sqn: u32,
    /// Transmit window trail at the moment of the snapshot.
    pub trail: u32,
    /// Transmit window lead at the moment of the snapshot.
    pub lead: u32,
    /// Source's own NLA.
    pub nla: Nla,
}

/// Builds a complete, checksummed SPM TPDU.
pub fn build_spm(header: Header, fields: SpmFields) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN + 12 + fields.nla.wire_len()];
    let mut h = header;
    h.ty = PacketType::Spm;
    h.tsdu_length = 0;
    h.encode(&mut buf);

    let mut body = Vec::with_capacity(12 + fields.nla.wire_len());
    body.extend_from_slice(&fields.spm_sqn.to_be_bytes());
    body.extend_from_slice(&fields.trail.to_be_bytes());
    body.extend_from_slice(&fields.lead.to_be_bytes());
    fields.nla.encode(&mut body);
    buf[HEADER_LEN..].copy_from_slice(&body);

    finalize_checksum(&mut buf);
    buf
}

/// Fields specific to an ODATA/RDATA packet.
#[derive(Debug, Clone)]
pub struct OdataFields {
    /// Assigned sequence number.
    pub data_sqn: u32,
    /// Transmit window trail at the moment of emission.
    pub data_trail: u32,
    /// Fragmentation metadata, present for multi-fragment APDUs.
    pub fragment: Option<Fragment>,
    /// Transmission group size, present when proactive parity is enabled.
    pub parity_grp: Option<u32>,
}

/// A built ODATA TPDU plus the unfolded partial checksum of the TSDU alone
/// (the memo the caller stores on the packet record for RDATA acceleration).
pub struct BuiltOdata {
    /// The complete, checksummed TPDU.
    pub tpdu: Vec<u8>,
    /// Unfolded partial checksum covering only the TSDU bytes.
    pub tsdu_partial: u32,
    /// Byte offset within `tpdu` where `data_trail` is stored (for fast
    /// retransmit header rewrites).
    pub data_trail_offset: usize,
    /// Byte offset within `tpdu` where the TSDU begins.
    pub tsdu_offset: usize,
}

/// Builds a complete, checksummed ODATA TPDU.
pub fn build_odata(header: Header, fields: OdataFields, tsdu: &[u8]) -> BuiltOdata {
    let mut opts = Vec::new();
    if let Some(frag) = fields.fragment {
        opts.push(Opt::Fragment(frag));
    }
    if let Some(k) = fields.parity_grp {
        opts.push(Opt::ParityGrp(k));
    }
    let has_opts = !opts.is_empty();
    let opts_buf = if has_opts {
        let mut full = vec![Opt::Length(0)];
        full.extend(opts);
        encode_options(&full)
    } else {
        Vec::new()
    };

    let fixed_len = 8;
    let mut buf = vec![0u8; HEADER_LEN + fixed_len + opts_buf.len() + tsdu.len()];
    let mut h = header;
    h.ty = PacketType::Odata;
    h.tsdu_length = tsdu.len() as u16;
    if has_opts {
        h.options |= OPT_PRESENT;
    }
    h.encode(&mut buf);

    let data_sqn_offset = HEADER_LEN;
    let data_trail_offset = HEADER_LEN + 4;
    BigEndian::write_u32(&mut buf[data_sqn_offset..data_sqn_offset + 4], fields.data_sqn);
    BigEndian::write_u32(&mut buf[data_trail_offset..data_trail_offset + 4], fields.data_trail);

    let opts_offset = HEADER_LEN + fixed_len;
    buf[opts_offset..opts_offset + opts_buf.len()].copy_from_slice(&opts_buf);

    let tsdu_offset = opts_offset + opts_buf.len();
    let tsdu_partial = pgm_checksum::partial_copy(tsdu, &mut buf[tsdu_offset..]);

    finalize_checksum(&mut buf);

    BuiltOdata {
        tpdu: buf,
        tsdu_partial,
        data_trail_offset,
        tsdu_offset,
    }
}

/// Rewrites an ODATA TPDU in place into an RDATA retransmission: flips the
/// type to RDATA, updates `data_trail`, and recomputes the checksum by
/// combining a fresh header partial sum with the saved TSDU partial sum
/// (spec.md §4.2/§4.6) instead of re-summing the TSDU.
pub fn rewrite_as_rdata(
    buf: &mut [u8],
    data_trail_offset: usize,
    tsdu_offset: usize,
    new_trail: u32,
    tsdu_partial: u32,
) {
    buf[4] = TYPE_RDATA;
    BigEndian::write_u32(&mut buf[data_trail_offset..data_trail_offset + 4], new_trail);
    buf[6] = 0;
    buf[7] = 0;
    let header_partial = pgm_checksum::partial(&buf[..tsdu_offset]);
    let combined = pgm_checksum::block_add(header_partial, tsdu_partial, tsdu_offset);
    let csum = pgm_checksum::fold(combined);
    BigEndian::write_u16(&mut buf[6..8], csum);
}

/// Fields specific to a parity (FEC repair) packet.
#[derive(Debug, Clone)]
pub struct ParityFields {
    /// Transmission group base sequence number ORed with the parity index.
    pub data_sqn: u32,
    /// Transmit window trail at the moment of emission.
    pub data_trail: u32,
    /// Parity index `h` within `[0, n-k)`.
    pub h: u32,
    /// Whether the originals in this group were zero-padded to a common
    /// length (sets `OPT_VAR_PKTLEN`).
    pub var_pktlen: bool,
    /// RS-combined `OPT_FRAGMENT`, present if any original carried one.
    pub fragment: Option<Fragment>,
}

/// Builds a complete, checksummed parity TPDU. `tsdu` is the RS-encoded
/// parity symbol data (already including any variable-length trailer).
pub fn build_parity(header: Header, fields: ParityFields, tsdu: &[u8]) -> Vec<u8> {
    let mut opts = vec![Opt::Parity(fields.h)];
    if fields.var_pktlen {
        opts.push(Opt::VarPktlen);
    }
    if let Some(frag) = fields.fragment {
        opts.push(Opt::Fragment(frag));
    }
    let mut full = vec![Opt::Length(0)];
    full.extend(opts);
    let opts_buf = encode_options(&full);

    let fixed_len = 8;
    let mut buf = vec![0u8; HEADER_LEN + fixed_len + opts_buf.len() + tsdu.len()];
    let mut h = header;
    h.ty = PacketType::Odata;
    h.tsdu_length = tsdu.len() as u16;
    h.options |= OPT_PRESENT | OPT_PARITY;
    if fields.var_pktlen {
        h.options |= OPT_VAR_PKTLEN;
    }
    h.encode(&mut buf);

    BigEndian::write_u32(&mut buf[HEADER_LEN..HEADER_LEN + 4], fields.data_sqn);
    BigEndian::write_u32(&mut buf[HEADER_LEN + 4..HEADER_LEN + 8], fields.data_trail);

    let opts_offset = HEADER_LEN + fixed_len;
    buf[opts_offset..opts_offset + opts_buf.len()].copy_from_slice(&opts_buf);

    let tsdu_offset = opts_offset + opts_buf.len();
    pgm_checksum::partial_copy(tsdu, &mut buf[tsdu_offset..]);

    finalize_checksum(&mut buf);
    buf
}

/// Builds an SPMR TPDU (no fixed fields beyond the header).
pub fn build_spmr(header: Header) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN];
    let mut h = header;
    h.ty = PacketType::Spmr;
    h.tsdu_length = 0;
    h.encode(&mut buf);
    finalize_checksum(&mut buf);
    buf
}

/// A validated NAK or NNAK.
#[derive(Debug, Clone)]
pub struct NakInfo {
    /// Primary requested sequence number.
    pub nak_sqn: u32,
    /// Sender-observed source NLA.
    pub source_nla: Nla,
    /// Sender-observed group NLA.
    pub group_nla: Nla,
    /// Whether `OPT_PARITY` was set (a parity request, not a selective one).
    pub is_parity: bool,
    /// Additional sequences from `OPT_NAK_LIST`.
    pub extra: Vec<u32>,
}

impl NakInfo {
    /// All requested sequence numbers: the primary plus any `OPT_NAK_LIST` entries.
    pub fn all_sequences(&self) -> Vec<u32> {
        let mut v = Vec::with_capacity(1 + self.extra.len());
        v.push(self.nak_sqn);
        v.extend_from_slice(&self.extra);
        v
    }
}

fn parse_nak_body(
    header: &Header,
    buf: &[u8],
    expected_source: &Nla,
    expected_group: &Nla,
) -> Result<NakInfo, CodecError> {
    if buf.len() < HEADER_LEN + 4 {
        return Err(CodecError::ShortHeader);
    }
    let nak_sqn = BigEndian::read_u32(&buf[HEADER_LEN..HEADER_LEN + 4]);
    let mut offset = HEADER_LEN + 4;
    let (source_nla, len) = Nla::decode(&buf[offset..])?;
    offset += len;
    let (group_nla, len) = Nla::decode(&buf[offset..])?;
    offset += len;

    if &source_nla != expected_source {
        return Err(CodecError::SourceNlaMismatch);
    }
    if &group_nla != expected_group {
        return Err(CodecError::GroupNlaMismatch);
    }

    let declared = header.tsdu_length as usize;
    let actual = buf.len() - offset;
    if declared != actual {
        return Err(CodecError::TsduLengthMismatch { declared, actual });
    }

    let mut extra = Vec::new();
    if header.has_options() {
        for opt in parse_options(&buf[offset..])? {
            if let Opt::NakList(list) = opt {
                extra = list.0;
            }
        }
    }

    Ok(NakInfo {
        nak_sqn,
        source_nla,
        group_nla,
        is_parity: header.options & OPT_PARITY != 0,
        extra,
    })
}

/// Verifies an incoming NAK per spec.md §4.3/§4.6.
pub fn verify_nak(
    buf: &[u8],
    expected_source: &Nla,
    expected_group: &Nla,
    ondemand_parity_enabled: bool,
) -> Result<NakInfo, CodecError> {
    let header = Header::decode(buf)?;
    if header.ty != PacketType::Nak {
        return Err(CodecError::UnknownType(buf[4]));
    }
    let info = parse_nak_body(&header, buf, expected_source, expected_group)?;
    if info.is_parity && !ondemand_parity_enabled {
        return Err(CodecError::OndemandParityDisabled);
    }
    Ok(info)
}

/// Verifies an incoming NNAK. NNAKs carry no retransmission obligation; the
/// sender only needs the sequence number for statistics.
pub fn verify_nnak(buf: &[u8], expected_source: &Nla, expected_group: &Nla) -> Result<NakInfo, CodecError> {
    let header = Header::decode(buf)?;
    if header.ty != PacketType::Nnak {
        return Err(CodecError::UnknownType(buf[4]));
    }
    parse_nak_body(&header, buf, expected_source, expected_group)
}

/// Verifies an incoming SPMR.
pub fn verify_spmr(buf: &[u8]) -> Result<(), CodecError> {
    let header = Header::decode(buf)?;
    if header.ty != PacketType::Spmr {
        return Err(CodecError::UnknownType(buf[4]));
    }
    if header.tsdu_length != 0 {
        return Err(CodecError::TsduLengthMismatch {
            declared: header.tsdu_length as usize,
            actual: buf.len() - HEADER_LEN,
        });
    }
    Ok(())
}

/// Builds an NCF TPDU confirming receipt of a NAK.
///
/// Per spec.md §4.6, NCF is never rate-limited and is emitted only after
/// full NAK validation completes (spec.md §9 Open Question (b)).
pub fn build_ncf(header: Header, nak_sqn: u32, source: Nla, group: Nla, extra: &[u32]) -> Vec<u8> {
    let has_opts = !extra.is_empty();
    let opts_buf = if has_opts {
        let full = vec![Opt::Length(0), Opt::NakList(OptNakList(extra.to_vec()))];
        encode_options(&full)
    } else {
        Vec::new()
    };

    let fixed_len = 4 + source.wire_len() + group.wire_len();
    let mut buf = vec![0u8; HEADER_LEN + fixed_len + opts_buf.len()];
    let mut h = header;
    h.ty = PacketType::Ncf;
    h.tsdu_length = opts_buf.len() as u16;
    if has_opts {
        h.options |= OPT_PRESENT;
    }
    h.encode(&mut buf);

    let mut body = Vec::with_capacity(fixed_len);
    body.extend_from_slice(&nak_sqn.to_be_bytes());
    source.encode(&mut body);
    group.encode(&mut body);
    buf[HEADER_LEN..HEADER_LEN + fixed_len].copy_from_slice(&body);
    buf[HEADER_LEN + fixed_len..].copy_from_slice(&opts_buf);

    finalize_checksum(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Header {
        Header {
            source_port: 3056,
            dest_port: 3056,
            ty: PacketType::Spm,
            options: 0,
            checksum: 0,
            gsi: [1, 2, 3, 4, 5, 6],
            tsdu_length: 0,
        }
    }

    #[test]
    fn odata_round_trip_checksum_valid() {
        let built = build_odata(
            template(),
            OdataFields {
                data_sqn: 0,
                data_trail: 0,
                fragment: None,
                parity_grp: None,
            },
            b"hello",
        );
        assert_eq!(pgm_checksum::fold(pgm_checksum::partial(&built.tpdu)), 0);
        assert_eq!(&built.tpdu[built.tsdu_offset..], b"hello");
    }

    #[test]
    fn rdata_rewrite_preserves_tsdu_bytes() {
        let built = build_odata(
            template(),
            OdataFields {
                data_sqn: 1,
                data_trail: 0,
                fragment: None,
                parity_grp: None,
            },
            b"payload!",
        );
        let mut tpdu = built.tpdu.clone();
        rewrite_as_rdata(&mut tpdu, built.data_trail_offset, built.tsdu_offset, 1, built.tsdu_partial);
        assert_eq!(tpdu[4], TYPE_RDATA);
        assert_eq!(&tpdu[built.tsdu_offset..], &built.tpdu[built.tsdu_offset..]);
        assert_eq!(pgm_checksum::fold(pgm_checksum::partial(&tpdu)), 0);
    }

    #[test]
    fn nak_verify_rejects_wrong_source() {
        let source = Nla::V4([10, 0, 0, 1]);
        let group = Nla::V4([239, 0, 0, 1]);
        let wrong = Nla::V4([10, 0, 0, 2]);

        let mut h = template();
        h.ty = PacketType::Nak;
        let mut buf = vec![0u8; HEADER_LEN + 4 + wrong.wire_len() + group.wire_len()];
        h.encode(&mut buf);
        let mut body = Vec::new();
        body.extend_from_slice(&7u32.to_be_bytes());
        wrong.encode(&mut body);
        group.encode(&mut body);
        buf[HEADER_LEN..].copy_from_slice(&body);

        let err = verify_nak(&buf, &source, &group, true).unwrap_err();
        assert_eq!(err, CodecError::SourceNlaMismatch);
    }

    #[test]
    fn ncf_carries_nak_list_when_multiple() {
        let source = Nla::V4([10, 0, 0, 1]);
        let group = Nla::V4([239, 0, 0, 1]);
        let buf = build_ncf(template(), 5, source, group, &[6, 7]);
        let header = Header::decode(&buf).unwrap();
        assert!(header.has_options());
    }
}
