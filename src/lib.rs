//! Send-side protocol engine for a PGM (RFC 3208) reliable-multicast transport.
//!
//! This crate implements the sender's transmit window, retransmit queue, SPM
//! heartbeat scheduler, NAK/NCF handling, Reed-Solomon parity synthesis, and
//! rate-limited send path. Socket creation, interface/NLA resolution, and
//! receiver-side logic are external collaborators, modeled here only as the
//! [`pgm_sink::DatagramSink`] trait the transport writes TPDUs to.
#![deny(missing_docs)]
#![deny(warnings)]

mod error;
mod fec;
mod nak;
mod rate;
mod send_path;
mod spm;
mod transport;
mod txw;

pub use error::{Errno, PgmError};
pub use pgm_codec::Nla;
pub use rate::RateController;
pub use transport::{SendFlags, SenderStats, Transport, TransportBuilder, TransportConfig};
pub use txw::{sqn_lt, RepairJob};

use std::sync::atomic::{AtomicU64, Ordering};

/// Transmit Session Identifier: GSI plus source port (spec.md §3, Glossary).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Tsi {
    /// Globally-unique source identifier.
    pub gsi: [u8; 6],
    /// UDP/transport source port.
    pub source_port: u16,
}

/// Cumulative, monotonic statistics counters (spec.md §6).
#[derive(Default)]
pub(crate) struct Stats {
    pub bytes_sent: AtomicU64,
    pub data_bytes_sent: AtomicU64,
    pub data_msgs_sent: AtomicU64,
    pub selective_naks_received: AtomicU64,
    pub parity_naks_received: AtomicU64,
    pub malformed_naks: AtomicU64,
    pub bytes_retransmitted: AtomicU64,
    pub msgs_retransmitted: AtomicU64,
    pub nnak_errors: AtomicU64,
    pub spmr_received: AtomicU64,
    pub packets_discarded: AtomicU64,
}

impl Stats {
    pub(crate) fn snapshot(&self) -> SenderStats {
        SenderStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            data_bytes_sent: self.data_bytes_sent.load(Ordering::Relaxed),
            data_msgs_sent: self.data_msgs_sent.load(Ordering::Relaxed),
            selective_naks_received: self.selective_naks_received.load(Ordering::Relaxed),
            parity_naks_received: self.parity_naks_received.load(Ordering::Relaxed),
            malformed_naks: self.malformed_naks.load(Ordering::Relaxed),
            bytes_retransmitted: self.bytes_retransmitted.load(Ordering::Relaxed),
            msgs_retransmitted: self.msgs_retransmitted.load(Ordering::Relaxed),
            nnak_errors: self.nnak_errors.load(Ordering::Relaxed),
            spmr_received: self.spmr_received.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
        }
    }
}
