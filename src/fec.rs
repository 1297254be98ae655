//! Parity packet synthesis: the sender-side integration between the
//! transmit window's packet records and the raw `pgm-fec` RS math
//! (spec.md §4.7).
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use pgm_codec::{Fragment, ParityFields};
use pgm_fec::ParityEncoder;

use crate::txw::Record;

/// A synthesized parity TSDU plus the packet fields it was built with.
pub struct SynthesizedParity {
    /// The RS-combined TSDU bytes (padding/trailer already applied).
    pub tsdu: Vec<u8>,
    /// The `ParityFields` to encode alongside it.
    pub fields: ParityFields,
}

/// Gathers the `k` original records of one transmission group and produces
/// the `h`-th parity packet.
///
/// `data_sqn` is the transmission-group base sequence ORed with `h`, and
/// `data_trail` is the window's current trail, both per spec.md §4.7/§4.4.
pub fn synthesize(
    originals: &[Arc<Record>],
    encoder: &ParityEncoder,
    h: u32,
    data_sqn: u32,
    data_trail: u32,
) -> SynthesizedParity {
    let tsdu_lens: Vec<usize> = originals
        .iter()
        .map(|r| {
            let buf = r.buf.lock().unwrap();
            buf.len() - r.tsdu_offset
        })
        .collect();
    let max_len = tsdu_lens.iter().copied().max().unwrap_or(0);
    let var_pktlen = tsdu_lens.iter().any(|&l| l != max_len);

    let shard_len = if var_pktlen { max_len + 2 } else { max_len };
    let mut source_shards: Vec<Vec<u8>> = Vec::with_capacity(originals.len());

    // Builds a zero-padded, trailer-appended shard in a scratch buffer for
    // RS input; `record.buf` itself is only ever read here, never resized
    // or extended, so a later selective retransmission of the same record
    // still sends exactly the original ODATA's wire bytes.
    for (record, &true_len) in originals.iter().zip(tsdu_lens.iter()) {
        let buf = record.buf.lock().unwrap();
        let tsdu_offset = record.tsdu_offset;

        let mut shard = vec![0u8; shard_len];
        shard[..true_len].copy_from_slice(&buf[tsdu_offset..tsdu_offset + true_len]);
        if var_pktlen {
            BigEndian::write_u16(&mut shard[max_len..max_len + 2], true_len as u16);
        }
        source_shards.push(shard);
    }

    let refs: Vec<&[u8]> = source_shards.iter().map(|s| s.as_slice()).collect();
    let parity_shards = encoder
        .encode(&refs)
        .expect("transmission group shard count must match the configured encoder");
    let tsdu = parity_shards[h as usize].clone();

    let fragment = combine_fragments(originals, encoder, h);

    SynthesizedParity {
        tsdu,
        fields: ParityFields {
            data_sqn,
            data_trail,
            h,
            var_pktlen,
            fragment,
        },
    }
}

/// RS-combines the originals' `OPT_FRAGMENT` payloads (zero-filled for
/// originals that had none) and returns the combined fragment for parity
/// index `h`, if any original in the group actually carried one.
///
/// Decoding this combined value back into a per-original fragment is
/// receiver-side work and out of scope here (spec.md §1 Non-goals).
fn combine_fragments(originals: &[Arc<Record>], encoder: &ParityEncoder, h: u32) -> Option<Fragment> {
    if !originals.iter().any(|r| r.fragment.is_some()) {
        return None;
    }

    let shards: Vec<[u8; 12]> = originals
        .iter()
        .map(|r| match r.fragment {
            Some(f) => {
                let mut b = [0u8; 12];
                BigEndian::write_u32(&mut b[0..4], f.opt_sqn);
                BigEndian::write_u32(&mut b[4..8], f.opt_frag_off);
                BigEndian::write_u32(&mut b[8..12], f.opt_frag_len);
                b
            }
            None => [0u8; 12],
        })
        .collect();

    let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
    let parity = encoder.encode(&refs).expect("fragment shard count must match the configured encoder");
    let combined = &parity[h as usize];
    Some(Fragment {
        opt_sqn: BigEndian::read_u32(&combined[0..4]),
        opt_frag_off: BigEndian::read_u32(&combined[4..8]),
        opt_frag_len: BigEndian::read_u32(&combined[8..12]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    fn record(tsdu: &[u8]) -> Arc<Record> {
        Arc::new(Record {
            sqn: 0,
            first_sent: Instant::now(),
            buf: Mutex::new(tsdu.to_vec()),
            data_trail_offset: 0,
            tsdu_offset: 0,
            fragment: None,
            tsdu_partial: 0,
        })
    }

    #[test]
    fn equal_length_group_skips_var_pktlen() {
        let encoder = ParityEncoder::new(2, 1).unwrap();
        let originals = vec![record(b"aaaa"), record(b"bbbb")];
        let synth = synthesize(&originals, &encoder, 0, 10, 0);
        assert!(!synth.fields.var_pktlen);
        assert_eq!(synth.tsdu.len(), 4);
    }

    #[test]
    fn mismatched_lengths_pad_and_set_var_pktlen() {
        let encoder = ParityEncoder::new(2, 1).unwrap();
        let originals = vec![record(b"aaaa"), record(b"bb")];
        let synth = synthesize(&originals, &encoder, 0, 10, 0);
        assert!(synth.fields.var_pktlen);
        assert_eq!(synth.tsdu.len(), 4 + 2);
    }

    #[test]
    fn synthesis_never_mutates_the_source_record() {
        let encoder = ParityEncoder::new(2, 1).unwrap();
        let originals = vec![record(b"aaaa"), record(b"bb")];
        let _ = synthesize(&originals, &encoder, 0, 10, 0);
        assert_eq!(originals[0].buf.lock().unwrap().as_slice(), b"aaaa");
        assert_eq!(originals[1].buf.lock().unwrap().as_slice(), b"bb");
    }

    #[test]
    fn padding_is_idempotent_across_repeated_synthesis() {
        let encoder = ParityEncoder::new(2, 1).unwrap();
        let originals = vec![record(b"aaaa"), record(b"bb")];
        let first = synthesize(&originals, &encoder, 0, 10, 0);
        let second = synthesize(&originals, &encoder, 0, 10, 0);
        assert_eq!(first.tsdu, second.tsdu);
    }
}
