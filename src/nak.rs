//! NAK/NNAK/SPMR ingress handling (spec.md §4.6).
use std::sync::atomic::Ordering;
use std::time::Instant;

use pgm_codec::{Header, Nla};

use crate::spm::SpmrThrottle;
use crate::txw::Txw;
use crate::{Stats, Tsi};

/// The result of handling one incoming NAK.
pub struct NakOutcome {
    /// The NCF TPDU to emit immediately (NCF is never rate-limited, spec.md §4.6).
    pub ncf: Vec<u8>,
    /// Whether any sequence in the NAK's list was newly enqueued, meaning
    /// the timer thread should be woken.
    pub should_notify_timer: bool,
}

/// Configuration the NAK path needs to validate incoming control packets,
/// independent of the rest of transport state.
pub struct NakPath {
    source_nla: Nla,
    group_nla: Nla,
    ondemand_parity_enabled: bool,
    tg_shift: u32,
}

impl NakPath {
    /// Builds a NAK path bound to the sender's own NLA, the configured
    /// multicast group NLA, whether on-demand parity NAKs are accepted, and
    /// the transmission-group size's log2 shift.
    pub fn new(source_nla: Nla, group_nla: Nla, ondemand_parity_enabled: bool, tg_shift: u32) -> Self {
        Self {
            source_nla,
            group_nla,
            ondemand_parity_enabled,
            tg_shift,
        }
    }

    /// Validates and processes an incoming NAK. `ncf_header` is the caller's
    /// template header (TSI etc.) to stamp onto the outgoing NCF.
    pub fn handle_nak(&self, buf: &[u8], txw: &Txw, stats: &Stats, ncf_header: Header) -> Option<NakOutcome> {
        let info = match pgm_codec::verify_nak(buf, &self.source_nla, &self.group_nla, self.ondemand_parity_enabled) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("discarding malformed NAK: {e}");
                stats.malformed_naks.fetch_add(1, Ordering::Relaxed);
                stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if info.is_parity {
            stats.parity_naks_received.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.selective_naks_received.fetch_add(1, Ordering::Relaxed);
        }

        let sequences = info.all_sequences();
        let mut should_notify_timer = false;
        for sqn in &sequences {
            if let Ok(true) = txw.retransmit_push(*sqn, info.is_parity, self.tg_shift) {
                should_notify_timer = true;
            }
        }

        let ncf = pgm_codec::build_ncf(ncf_header, info.nak_sqn, info.source_nla, info.group_nla, &info.extra);

        Some(NakOutcome { ncf, should_notify_timer })
    }

    /// Validates and accounts an incoming NNAK. No retransmission obligation
    /// (spec.md §4.6); only `nnak_errors` is incremented on malformed input.
    pub fn handle_nnak(&self, buf: &[u8], stats: &Stats) {
        match pgm_codec::verify_nnak(buf, &self.source_nla, &self.group_nla) {
            Ok(_) => {}
            Err(e) => {
                log::warn!("discarding malformed NNAK: {e}");
                stats.nnak_errors.fetch_add(1, Ordering::Relaxed);
                stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Validates an incoming SPMR and consults `throttle` for whether an
    /// immediate SPM response is due.
    pub fn handle_spmr(&self, buf: &[u8], peer: Tsi, throttle: &SpmrThrottle, stats: &Stats) -> bool {
        match pgm_codec::verify_spmr(buf) {
            Ok(()) => {
                stats.spmr_received.fetch_add(1, Ordering::Relaxed);
                throttle.allow(peer, Instant::now())
            }
            Err(e) => {
                log::warn!("discarding malformed SPMR: {e}");
                stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgm_codec::{Header, OdataFields, PacketType};
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Instant as StdInstant;

    use crate::spm::SpmrThrottle;
    use crate::txw::Record;

    fn source() -> Nla {
        Nla::V4([10, 0, 0, 1])
    }
    fn group() -> Nla {
        Nla::V4([239, 0, 0, 1])
    }

    fn template() -> Header {
        Header {
            source_port: 3056,
            dest_port: 3056,
            ty: PacketType::Nak,
            options: 0,
            checksum: 0,
            gsi: [1, 2, 3, 4, 5, 6],
            tsdu_length: 0,
        }
    }

    fn build_nak(nak_sqn: u32, source: Nla, group: Nla, is_parity: bool) -> Vec<u8> {
        let mut h = template();
        if is_parity {
            h.options |= pgm_codec::OPT_PARITY;
        }
        let body_len = 4 + 6 + 6; // v4 NLAs
        let mut buf = vec![0u8; pgm_codec::HEADER_LEN + body_len];
        h.encode(&mut buf);
        let mut body = Vec::new();
        body.extend_from_slice(&nak_sqn.to_be_bytes());
        match source {
            Nla::V4(a) => {
                body.extend_from_slice(&1u16.to_be_bytes());
                body.extend_from_slice(&a);
            }
            _ => unreachable!(),
        }
        match group {
            Nla::V4(a) => {
                body.extend_from_slice(&1u16.to_be_bytes());
                body.extend_from_slice(&a);
            }
            _ => unreachable!(),
        }
        buf[pgm_codec::HEADER_LEN..].copy_from_slice(&body);
        buf
    }

    fn seed_txw() -> Txw {
        let txw = Txw::new(8, 2);
        let built = pgm_codec::build_odata(
            Header {
                source_port: 1,
                dest_port: 1,
                ty: PacketType::Odata,
                options: 0,
                checksum: 0,
                gsi: [0; 6],
                tsdu_length: 0,
            },
            OdataFields {
                data_sqn: 0,
                data_trail: 0,
                fragment: None,
                parity_grp: None,
            },
            b"hi",
        );
        txw.add(Arc::new(Record {
            sqn: 0,
            first_sent: StdInstant::now(),
            buf: Mutex::new(built.tpdu),
            data_trail_offset: built.data_trail_offset,
            tsdu_offset: built.tsdu_offset,
            fragment: None,
            tsdu_partial: built.tsdu_partial,
        }));
        txw
    }

    #[test]
    fn valid_nak_pushes_repair_and_builds_ncf() {
        let path = NakPath::new(source(), group(), true, 1);
        let txw = seed_txw();
        let stats = Stats::default();
        let buf = build_nak(0, source(), group(), false);

        let outcome = path.handle_nak(&buf, &txw, &stats, template()).unwrap();
        assert!(outcome.should_notify_timer);
        assert!(txw.has_pending_repairs());
        assert_eq!(stats.selective_naks_received.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn wrong_source_nla_is_malformed_and_discarded() {
        let path = NakPath::new(source(), group(), true, 1);
        let txw = seed_txw();
        let stats = Stats::default();
        let buf = build_nak(0, Nla::V4([10, 0, 0, 2]), group(), false);

        assert!(path.handle_nak(&buf, &txw, &stats, template()).is_none());
        assert_eq!(stats.malformed_naks.load(Ordering::Relaxed), 1);
        assert_eq!(stats.packets_discarded.load(Ordering::Relaxed), 1);
        assert!(!txw.has_pending_repairs());
    }

    #[test]
    fn duplicate_nak_does_not_renotify_timer() {
        let path = NakPath::new(source(), group(), true, 1);
        let txw = seed_txw();
        let stats = Stats::default();
        let buf = build_nak(0, source(), group(), false);

        let first = path.handle_nak(&buf, &txw, &stats, template()).unwrap();
        assert!(first.should_notify_timer);
        let second = path.handle_nak(&buf, &txw, &stats, template()).unwrap();
        assert!(!second.should_notify_timer);
    }

    #[test]
    fn spmr_throttled_to_one_per_ihb_min() {
        let path = NakPath::new(source(), group(), true, 1);
        let stats = Stats::default();
        let throttle = SpmrThrottle::new(std::time::Duration::from_secs(60));
        let mut buf = vec![0u8; pgm_codec::HEADER_LEN];
        Header {
            source_port: 1,
            dest_port: 1,
            ty: PacketType::Spmr,
            options: 0,
            checksum: 0,
            gsi: [0; 6],
            tsdu_length: 0,
        }
        .encode(&mut buf);
        let peer = Tsi { gsi: [9; 6], source_port: 1 };

        assert!(path.handle_spmr(&buf, peer, &throttle, &stats));
        assert!(!path.handle_spmr(&buf, peer, &throttle, &stats));
        assert_eq!(stats.spmr_received.load(Ordering::Relaxed), 2);
    }
}
