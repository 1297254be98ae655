//! The transport: owns TSI, window, rate controller, SPM state, and the
//! timer/receive thread pair (spec.md §3 Transport State, §5 Concurrency).
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pgm_codec::{Header, Nla, PacketType, SpmFields};
use pgm_fec::ParityEncoder;
use pgm_sink::DatagramSink;

use crate::error::PgmError;
use crate::fec;
use crate::nak::NakPath;
use crate::rate::RateController;
use crate::send_path::{fragment_plan, header_template, odata_fields_for, record_from_built, ResumeState};
use crate::spm::{SpmSchedule, SpmrThrottle};
use crate::txw::{RepairJob, Txw};
use crate::{Stats, Tsi};

pub use crate::send_path::SendFlags;

/// Pre-bind configuration surface (spec.md §6). Every setter on
/// [`TransportBuilder`] fails with [`PgmError::AlreadyBound`] if called
/// after `bind()` — enforced structurally, since `TransportBuilder` is
/// consumed by `bind()` and a [`Transport`] exposes no setters at all.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ambient (steady-state) SPM interval, microseconds > 0.
    pub ambient_spm_interval: Duration,
    /// Decaying heartbeat SPM interval sequence, each > 0.
    pub heartbeat_spm_intervals: Vec<Duration>,
    /// Minimum interval between SPM responses to the same peer's SPMR.
    pub ihb_min: Duration,
    /// Window capacity in sequence numbers, `0 < n < 2^31 - 1`.
    pub txw_sqns: u32,
    /// Egress rate cap in bytes/sec (also gates the burst cap below).
    pub txw_max_rte: u64,
    /// Burst cap in bytes for the token bucket.
    pub txw_burst_bytes: u64,
    /// Whether on-demand (NAK-triggered) parity requests are accepted.
    pub use_ondemand_parity: bool,
    /// Whether parity is proactively generated at transmission-group closure.
    pub use_proactive_parity: bool,
    /// Reed-Solomon `n` (total shards per transmission group).
    pub rs_n: u32,
    /// Reed-Solomon `k` (original shards per transmission group); must be a power of two.
    pub rs_k: u32,
    /// Maximum TPDU size in bytes.
    pub max_tpdu: usize,
    /// Source UDP port, part of the TSI.
    pub source_port: u16,
    /// Destination UDP port.
    pub dest_port: u16,
    /// Globally-unique source identifier.
    pub gsi: [u8; 6],
    /// The sender's own unicast NLA, checked against incoming NAKs' source NLA.
    pub source_nla: Nla,
    /// The configured multicast group NLA, checked against incoming NAKs' group NLA.
    pub group_nla: Nla,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ambient_spm_interval: Duration::from_secs(1),
            heartbeat_spm_intervals: vec![Duration::from_millis(100), Duration::from_millis(200)],
            ihb_min: Duration::from_millis(500),
            txw_sqns: 4096,
            txw_max_rte: u64::MAX / 2,
            txw_burst_bytes: 65536,
            use_ondemand_parity: false,
            use_proactive_parity: false,
            rs_n: 0,
            rs_k: 1,
            max_tpdu: 1500,
            source_port: 0,
            dest_port: 0,
            gsi: [0; 6],
            source_nla: Nla::V4([0, 0, 0, 0]),
            group_nla: Nla::V4([0, 0, 0, 0]),
        }
    }
}

impl TransportConfig {
    fn header_overhead(&self) -> usize {
        pgm_codec::HEADER_LEN + 8 + 15 // fixed ODATA fields + worst-case OPT_FRAGMENT+OPT_LENGTH
    }

    fn max_tsdu(&self) -> usize {
        self.max_tpdu.saturating_sub(self.header_overhead())
    }

    fn tg_shift(&self) -> u32 {
        self.rs_k.max(1).trailing_zeros()
    }
}

/// Builder for a [`Transport`], mirroring the teacher's builder-then-bind
/// lifecycle: a chain of `set_*` methods consuming `self`, finished by
/// `bind()` which freezes configuration.
pub struct TransportBuilder {
    config: TransportConfig,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBuilder {
    /// Creates a builder with spec.md §6 defaults.
    pub fn new() -> Self {
        Self { config: TransportConfig::default() }
    }

    /// Sets the ambient SPM interval.
    pub fn set_ambient_spm_interval(mut self, interval: Duration) -> Self {
        self.config.ambient_spm_interval = interval;
        self
    }

    /// Sets the decaying heartbeat SPM interval sequence.
    pub fn set_heartbeat_spm_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.config.heartbeat_spm_intervals = intervals;
        self
    }

    /// Sets the per-peer SPMR response throttle interval.
    pub fn set_ihb_min(mut self, ihb_min: Duration) -> Self {
        self.config.ihb_min = ihb_min;
        self
    }

    /// Sets the transmit window's sequence-number capacity.
    pub fn set_txw_sqns(mut self, txw_sqns: u32) -> Self {
        self.config.txw_sqns = txw_sqns;
        self
    }

    /// Sets the token-bucket replenish rate, in bytes/sec.
    pub fn set_txw_max_rte(mut self, bytes_per_sec: u64) -> Self {
        self.config.txw_max_rte = bytes_per_sec;
        self
    }

    /// Sets the token-bucket burst cap, in bytes.
    pub fn set_txw_burst_bytes(mut self, burst_bytes: u64) -> Self {
        self.config.txw_burst_bytes = burst_bytes;
        self
    }

    /// Enables or disables accepting on-demand (NAK-triggered) parity requests.
    pub fn set_use_ondemand_parity(mut self, enabled: bool) -> Self {
        self.config.use_ondemand_parity = enabled;
        self
    }

    /// Enables or disables proactively generating parity at group closure.
    pub fn set_use_proactive_parity(mut self, enabled: bool) -> Self {
        self.config.use_proactive_parity = enabled;
        self
    }

    /// Sets the Reed-Solomon `(n, k)` parameters; `k` must be a power of two.
    pub fn set_rs(mut self, n: u32, k: u32) -> Self {
        self.config.rs_n = n;
        self.config.rs_k = k;
        self
    }

    /// Sets the maximum TPDU size in bytes.
    pub fn set_max_tpdu(mut self, max_tpdu: usize) -> Self {
        self.config.max_tpdu = max_tpdu;
        self
    }

    /// Sets the TSI's port and GSI components.
    pub fn set_tsi(mut self, source_port: u16, dest_port: u16, gsi: [u8; 6]) -> Self {
        self.config.source_port = source_port;
        self.config.dest_port = dest_port;
        self.config.gsi = gsi;
        self
    }

    /// Sets the sender's own NLA and the configured multicast group NLA.
    pub fn set_nlas(mut self, source_nla: Nla, group_nla: Nla) -> Self {
        self.config.source_nla = source_nla;
        self.config.group_nla = group_nla;
        self
    }

    /// Validates configuration and binds the transport to `sink`, spawning
    /// the timer and receive threads. `control_rx` carries raw incoming
    /// control-packet bytes (NAK/NNAK/SPMR) from whatever poll loop owns the
    /// real socket — receiving and demultiplexing datagrams onto this
    /// channel is out of scope here (spec.md §1).
    pub fn bind<S: DatagramSink + 'static>(
        self,
        sink: S,
        control_rx: crossbeam::channel::Receiver<Vec<u8>>,
    ) -> Result<Arc<Transport>, PgmError> {
        let config = self.config;
        if config.txw_sqns == 0 || config.txw_sqns >= (1u32 << 31) - 1 {
            return Err(PgmError::Invalid("txw_sqns out of range".into()));
        }
        if config.rs_k == 0 || !config.rs_k.is_power_of_two() {
            return Err(PgmError::Invalid("rs_k must be a nonzero power of two".into()));
        }
        if (config.use_ondemand_parity || config.use_proactive_parity) && config.rs_n <= config.rs_k {
            return Err(PgmError::Invalid("rs_n must exceed rs_k when parity is enabled".into()));
        }

        let tg_shift = config.tg_shift();
        let n_minus_k = config.rs_n.saturating_sub(config.rs_k).max(1);
        let parity_encoder = if config.use_ondemand_parity || config.use_proactive_parity {
            Some(
                ParityEncoder::new(config.rs_k as usize, (config.rs_n - config.rs_k) as usize)
                    .map_err(|e| PgmError::Invalid(e.to_string()))?,
            )
        } else {
            None
        };

        let (repair_tx, repair_rx) = crossbeam::channel::unbounded();
        let nak_path = NakPath::new(config.source_nla, config.group_nla, config.use_ondemand_parity, tg_shift);

        let transport = Arc::new(Transport {
            txw: Txw::new(config.txw_sqns, n_minus_k),
            rate: RateController::new(config.txw_max_rte, config.txw_burst_bytes),
            spm: SpmSchedule::new(config.heartbeat_spm_intervals.clone(), config.ambient_spm_interval),
            spmr_throttle: SpmrThrottle::new(config.ihb_min),
            nak_path,
            stats: Stats::default(),
            sink: Arc::new(sink),
            closed: AtomicBool::new(false),
            resume: Mutex::new(None),
            parity_encoder,
            tg_shift,
            send_mutex: Mutex::new(()),
            repair_tx,
            repair_rx,
            threads: Mutex::new(None),
            config,
        });

        let timer_handle = {
            let t = transport.clone();
            std::thread::spawn(move || t.run_timer_thread())
        };
        let receive_handle = {
            let t = transport.clone();
            std::thread::spawn(move || t.run_receive_thread(control_rx))
        };
        *transport.threads.lock().unwrap() = Some(TransportThreads {
            timer: timer_handle,
            receive: receive_handle,
        });

        Ok(transport)
    }
}

struct TransportThreads {
    timer: JoinHandle<()>,
    receive: JoinHandle<()>,
}

/// A `Copy`-able snapshot of the cumulative counters in spec.md §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderStats {
    /// Total wire bytes sent (ODATA + RDATA + SPM + parity + NCF).
    pub bytes_sent: u64,
    /// Application data bytes sent (sum of TSDU payload lengths for ODATA).
    pub data_bytes_sent: u64,
    /// Number of ODATA messages sent.
    pub data_msgs_sent: u64,
    /// Selective NAKs received.
    pub selective_naks_received: u64,
    /// Parity (on-demand) NAKs received.
    pub parity_naks_received: u64,
    /// NAKs rejected as malformed.
    pub malformed_naks: u64,
    /// Bytes retransmitted as RDATA.
    pub bytes_retransmitted: u64,
    /// Messages retransmitted as RDATA.
    pub msgs_retransmitted: u64,
    /// Malformed NNAKs received.
    pub nnak_errors: u64,
    /// SPMRs received.
    pub spmr_received: u64,
    /// Packets discarded (malformed control packets of any kind).
    pub packets_discarded: u64,
}

/// The bound sender transport.
pub struct Transport {
    config: TransportConfig,
    txw: Txw,
    rate: RateController,
    spm: SpmSchedule,
    spmr_throttle: SpmrThrottle,
    nak_path: NakPath,
    stats: Stats,
    sink: Arc<dyn DatagramSink>,
    closed: AtomicBool,
    resume: Mutex<Option<ResumeState>>,
    parity_encoder: Option<ParityEncoder>,
    tg_shift: u32,
    /// Coarse "TXW writer role" mutex: application threads serialize here so
    /// sequence assignment stays strictly monotonic and gap-free (spec.md §5
    /// ordering guarantee (i)) even with multiple concurrent callers.
    send_mutex: Mutex<()>,
    repair_tx: crossbeam::channel::Sender<()>,
    repair_rx: crossbeam::channel::Receiver<()>,
    threads: Mutex<Option<TransportThreads>>,
}

impl Transport {
    fn odata_header_template(&self) -> Header {
        header_template(self.config.source_port, self.config.dest_port, self.config.gsi)
    }

    fn tsi(&self) -> Tsi {
        Tsi { gsi: self.config.gsi, source_port: self.config.source_port }
    }

    /// Snapshot of the cumulative statistics counters.
    pub fn stats(&self) -> SenderStats {
        self.stats.snapshot()
    }

    /// Copies one APDU, fragmenting if it exceeds `max_tsdu`.
    pub fn send(&self, apdu: &[u8], flags: SendFlags) -> Result<usize, PgmError> {
        self.send_vector(&[apdu], true, flags)
    }

    /// Single-packet fast path: fails with `Oversize` rather than fragmenting.
    pub fn send_one_copy(&self, apdu: &[u8], flags: SendFlags) -> Result<usize, PgmError> {
        if apdu.len() > self.config.max_tsdu() {
            return Err(PgmError::Oversize { len: apdu.len() });
        }
        self.send_vector(&[apdu], true, flags)
    }

    /// Gathers `iov` into one APDU. If `one_apdu` and the total fits in one
    /// TSDU, emits a single ODATA with one `OPT_FRAGMENT`; otherwise fragments.
    pub fn send_vector(&self, iov: &[&[u8]], one_apdu: bool, flags: SendFlags) -> Result<usize, PgmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PgmError::Closed);
        }

        let total_len: usize = iov.iter().map(|b| b.len()).sum();
        let capacity = self.config.max_tsdu() * self.config.txw_sqns as usize;
        if total_len > capacity {
            return Err(PgmError::Oversize { len: total_len });
        }

        let mut apdu = Vec::with_capacity(total_len);
        for b in iov {
            apdu.extend_from_slice(b);
        }

        let fits_single = one_apdu && total_len <= self.config.max_tsdu();
        let plans = if fits_single {
            vec![crate::send_path::FragmentPlan { offset: 0, len: total_len }]
        } else {
            fragment_plan(total_len, self.config.max_tsdu())
        };

        let _writer = self.send_mutex.lock().unwrap();

        let (start_idx, frag_sqn) = {
            let resume = self.resume.lock().unwrap();
            match resume.as_ref() {
                Some(r) if r.apdu_len == total_len => (r.next_fragment, r.frag_sqn),
                _ => (0, self.txw.next_lead()),
            }
        };

        if flags.grouped_rate_check() {
            let remaining = plans.len() - start_idx;
            let upper_bound = remaining * self.config.max_tpdu;
            self.rate.check(upper_bound, true)?;
        }

        for i in start_idx..plans.len() {
            let plan = plans[i];
            if !flags.grouped_rate_check() {
                let estimated_wire = plan.len + self.config.header_overhead();
                if let Err(e) = self.rate.check(estimated_wire, flags.dontwait()) {
                    *self.resume.lock().unwrap() = Some(ResumeState {
                        apdu_len: total_len,
                        next_fragment: i,
                        frag_sqn,
                    });
                    return Err(e);
                }
            }

            let sqn = self.txw.next_lead();
            let trail = self.txw.trail();
            let parity_grp = if self.config.use_proactive_parity {
                Some(self.config.rs_k)
            } else {
                None
            };
            let fields = odata_fields_for(&plans, i, total_len, frag_sqn, sqn, trail, parity_grp);
            let fragment = fields.fragment;
            let built = pgm_codec::build_odata(self.odata_header_template(), fields, &apdu[plan.offset..plan.offset + plan.len]);
            let wire_len = built.tpdu.len();

            match self.sink.send(&built.tpdu) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && flags.dontwait() => {
                    let record = record_from_built(sqn, built, fragment);
                    self.txw.add(record);
                    *self.resume.lock().unwrap() = Some(ResumeState {
                        apdu_len: total_len,
                        next_fragment: i + 1,
                        frag_sqn,
                    });
                    return Err(PgmError::WouldBlock);
                }
                Err(_) => {
                    // Per spec.md §7, write failures after the record exists are
                    // swallowed: the window is the durable record of the data.
                }
            }

            let record = record_from_built(sqn, built, fragment);
            self.txw.add(record);
            self.stats.data_bytes_sent.fetch_add(plan.len as u64, Ordering::Relaxed);
            self.stats.data_msgs_sent.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_sent.fetch_add(wire_len as u64, Ordering::Relaxed);
            let (_, should_wake) = self.spm.reset_after_burst(Instant::now());
            if should_wake {
                let _ = self.repair_tx.send(());
            }

            if self.config.use_proactive_parity {
                let tg_mask = !0u32 << self.tg_shift;
                if sqn.wrapping_add(1) & !tg_mask == 0 {
                    let tg_base = sqn & tg_mask;
                    if self.txw.retransmit_push(tg_base, true, self.tg_shift).unwrap_or(false) {
                        let _ = self.repair_tx.send(());
                    }
                }
            }
        }

        *self.resume.lock().unwrap() = None;
        Ok(total_len)
    }

    /// Feeds one incoming control-packet buffer (NAK, NNAK, or SPMR) to the
    /// NAK/NCF path, dispatching by the decoded packet type.
    fn handle_control_packet(&self, buf: &[u8]) {
        let ty = match Header::decode(buf) {
            Ok(h) => h.ty,
            Err(e) => {
                log::warn!("discarding control packet with unparsable header: {e}");
                self.stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match ty {
            PacketType::Nak => {
                if let Some(outcome) = self.nak_path.handle_nak(buf, &self.txw, &self.stats, self.odata_header_template()) {
                    let _ = self.sink.send(&outcome.ncf);
                    if outcome.should_notify_timer {
                        let _ = self.repair_tx.send(());
                    }
                }
            }
            PacketType::Nnak => self.nak_path.handle_nnak(buf, &self.stats),
            PacketType::Spmr => {
                if self.nak_path.handle_spmr(buf, self.tsi(), &self.spmr_throttle, &self.stats) {
                    self.emit_spm();
                }
            }
            other => {
                log::warn!("discarding control packet of unexpected type {other:?}");
                self.stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn run_receive_thread(&self, control_rx: crossbeam::channel::Receiver<Vec<u8>>) {
        while let Ok(buf) = control_rx.recv() {
            self.handle_control_packet(&buf);
        }
    }

    fn emit_spm(&self) {
        let fields = SpmFields {
            spm_sqn: self.spm.next_spm_sqn(),
            trail: self.txw.trail(),
            lead: self.txw.lead(),
            nla: self.config.source_nla,
        };
        let tpdu = pgm_codec::build_spm(self.odata_header_template(), fields);
        if self.rate.check(tpdu.len(), false).is_ok() {
            let _ = self.sink.send(&tpdu);
            self.stats.bytes_sent.fetch_add(tpdu.len() as u64, Ordering::Relaxed);
        }
    }

    fn emit_selective_rdata(&self, sqn: u32) {
        let record = match self.txw.peek(sqn) {
            Ok(r) => r,
            Err(_) => return,
        };
        let trail = self.txw.trail();
        let wire_len = {
            let mut buf = record.buf.lock().unwrap();
            pgm_codec::rewrite_as_rdata(&mut buf, record.data_trail_offset, record.tsdu_offset, trail, record.tsdu_partial);
            buf.len()
        };
        if self.rate.check(wire_len, false).is_ok() {
            let buf = record.buf.lock().unwrap();
            let _ = self.sink.send(&buf);
            self.stats.bytes_retransmitted.fetch_add(wire_len as u64, Ordering::Relaxed);
            self.stats.msgs_retransmitted.fetch_add(1, Ordering::Relaxed);
            log::trace!("retransmitted sqn {sqn} as RDATA ({wire_len} bytes)");
        }
        self.spm.reset_after_burst(Instant::now());
    }

    fn emit_parity(&self, tg_base: u32, h: u32) {
        let encoder = match &self.parity_encoder {
            Some(e) => e,
            None => return,
        };
        let k = self.config.rs_k;
        let mut originals = Vec::with_capacity(k as usize);
        for sqn in tg_base..tg_base.wrapping_add(k) {
            match self.txw.peek(sqn) {
                Ok(r) => originals.push(r),
                Err(_) => return,
            }
        }
        let trail = self.txw.trail();
        let parity_sqn = tg_base | h;
        let synth = fec::synthesize(&originals, encoder, h, parity_sqn, trail);
        let tpdu = pgm_codec::build_parity(self.odata_header_template(), synth.fields, &synth.tsdu);
        if self.rate.check(tpdu.len(), false).is_ok() {
            let _ = self.sink.send(&tpdu);
            self.stats.bytes_retransmitted.fetch_add(tpdu.len() as u64, Ordering::Relaxed);
            self.stats.msgs_retransmitted.fetch_add(1, Ordering::Relaxed);
            log::trace!("emitted parity index {h} for transmission group at {tg_base} ({} bytes)", tpdu.len());
        }
        self.spm.reset_after_burst(Instant::now());
    }

    fn drain_repairs(&self) {
        while let Some(job) = self.txw.retransmit_try_peek() {
            match job {
                RepairJob::Selective(sqn) => self.emit_selective_rdata(sqn),
                RepairJob::Parity { tg_base, h } => self.emit_parity(tg_base, h),
            }
            self.txw.retransmit_remove_head();
        }
    }

    fn run_timer_thread(&self) {
        loop {
            let now = Instant::now();
            let deadline = self.spm.current_deadline();
            let timeout = deadline.saturating_duration_since(now).max(Duration::from_millis(1));

            match self.repair_rx.recv_timeout(timeout) {
                Ok(()) => {}
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                    self.drain_repairs();
                    break;
                }
            }

            self.drain_repairs();

            let now = Instant::now();
            if now >= self.spm.current_deadline() {
                self.emit_spm();
                self.spm.on_deadline_fired(now);
            }

            if self.closed.load(Ordering::Acquire) {
                self.drain_repairs();
                break;
            }
        }
    }

    /// Sets the closed flag, wakes the timer thread so it drains the
    /// retransmit queue once and exits, and joins it. Subsequent `send`
    /// calls fail with [`PgmError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.repair_tx.send(());
        if let Some(threads) = self.threads.lock().unwrap().take() {
            let _ = threads.timer.join();
            let _ = threads.receive.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgm_sink::{LoopbackSink, LossySink};

    // Routed through a deterministically reliable `LossySink` (px=1.0,
    // pq=0.0) rather than `sink` directly, so the duplicate-NAK and
    // retransmission tests below exercise the same lossy-substrate seam a
    // real deployment would wrap a socket in, per the teacher's
    // `LossyChannel` test-double convention.
    fn bind_basic(sink: LoopbackSink) -> (Arc<Transport>, crossbeam::channel::Sender<Vec<u8>>) {
        let _ = env_logger::try_init();
        let (tx, rx) = crossbeam::channel::unbounded();
        let transport = TransportBuilder::new()
            .set_txw_sqns(32)
            .set_txw_max_rte(1_000_000_000)
            .set_max_tpdu(1500)
            .set_ambient_spm_interval(Duration::from_secs(1))
            .set_tsi(3056, 3056, [1, 2, 3, 4, 5, 6])
            .set_nlas(Nla::V4([10, 0, 0, 1]), Nla::V4([239, 0, 0, 1]))
            .bind(LossySink::new(sink, 1.0, 0.0), rx)
            .unwrap();
        (transport, tx)
    }

    #[test]
    fn single_small_send_produces_one_odata() {
        let sink = LoopbackSink::default();
        let (transport, _tx) = bind_basic(sink.clone());

        let n = transport.send(b"hello", SendFlags::blocking()).unwrap();
        assert_eq!(n, 5);

        std::thread::sleep(Duration::from_millis(20));
        let tpdu = sink.pop().expect("one ODATA expected");
        let header = Header::decode(&tpdu).unwrap();
        assert_eq!(header.ty, PacketType::Odata);
        assert_eq!(&tpdu[tpdu.len() - 5..], b"hello");

        transport.close();
    }

    #[test]
    fn fragmentation_splits_into_two_odata() {
        let sink = LoopbackSink::default();
        let (tx_c, rx_c) = crossbeam::channel::unbounded();
        let _ = tx_c;
        let transport = TransportBuilder::new()
            .set_txw_sqns(32)
            .set_txw_max_rte(1_000_000_000)
            .set_max_tpdu(pgm_codec::HEADER_LEN + 8 + 15 + 4)
            .set_tsi(1, 1, [0; 6])
            .set_nlas(Nla::V4([10, 0, 0, 1]), Nla::V4([239, 0, 0, 1]))
            .bind(sink.clone(), rx_c)
            .unwrap();

        transport.send(b"ABCDEFGH", SendFlags::blocking()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let first = sink.pop().unwrap();
        let second = sink.pop().unwrap();
        let h1 = Header::decode(&first).unwrap();
        let h2 = Header::decode(&second).unwrap();
        assert_eq!(h1.tsdu_length, 4);
        assert_eq!(h2.tsdu_length, 4);
        transport.close();
    }

    #[test]
    fn rate_limited_send_rejects_with_no_wire_bytes() {
        let sink = LoopbackSink::default();
        let (tx_c, rx_c) = crossbeam::channel::unbounded();
        let _ = tx_c;
        // A burst cap that can satisfy one small send but is then left
        // exhausted, so the next DONTWAIT|WAITALL send is transiently
        // rate-limited rather than structurally impossible.
        let transport = TransportBuilder::new()
            .set_txw_sqns(32)
            .set_txw_max_rte(1)
            .set_txw_burst_bytes(2000)
            .set_max_tpdu(1500)
            .set_tsi(1, 1, [0; 6])
            .set_nlas(Nla::V4([10, 0, 0, 1]), Nla::V4([239, 0, 0, 1]))
            .bind(sink.clone(), rx_c)
            .unwrap();

        let flags = SendFlags::new(true, true).unwrap();
        transport.send(&vec![b'x'; 100], flags).unwrap();
        sink.drain();
        let lead_after_first = transport.txw.next_lead();

        let err = transport.send(&vec![b'x'; 1000], flags).unwrap_err();
        assert_eq!(err, PgmError::RateLimited);
        assert!(sink.is_empty());
        assert_eq!(transport.txw.next_lead(), lead_after_first);
        transport.close();
    }

    #[test]
    fn send_larger_than_burst_cap_errors_instead_of_blocking() {
        let sink = LoopbackSink::default();
        let (tx_c, rx_c) = crossbeam::channel::unbounded();
        let _ = tx_c;
        // burst_bytes is smaller than a single packet's worst-case wire
        // size: no amount of waiting can ever satisfy this request, with
        // DONTWAIT or without.
        let transport = TransportBuilder::new()
            .set_txw_sqns(32)
            .set_txw_max_rte(1_000_000_000)
            .set_txw_burst_bytes(10)
            .set_max_tpdu(1500)
            .set_tsi(1, 1, [0; 6])
            .set_nlas(Nla::V4([10, 0, 0, 1]), Nla::V4([239, 0, 0, 1]))
            .bind(sink.clone(), rx_c)
            .unwrap();

        let err = transport.send(b"hello", SendFlags::blocking()).unwrap_err();
        assert!(matches!(err, PgmError::Invalid(_)));
        assert!(sink.is_empty());
        transport.close();
    }

    fn nak_for(source_nla: Nla, group_nla: Nla, nak_sqn: u32, is_parity: bool) -> Vec<u8> {
        let h = Header {
            source_port: 3056,
            dest_port: 3056,
            ty: PacketType::Nak,
            options: if is_parity { pgm_codec::OPT_PARITY } else { 0 },
            checksum: 0,
            gsi: [1, 2, 3, 4, 5, 6],
            tsdu_length: 0,
        };
        let body_len = 4 + 6 + 6;
        let mut buf = vec![0u8; pgm_codec::HEADER_LEN + body_len];
        h.encode(&mut buf);
        let mut body = Vec::new();
        body.extend_from_slice(&nak_sqn.to_be_bytes());
        match source_nla {
            Nla::V4(a) => {
                body.extend_from_slice(&1u16.to_be_bytes());
                body.extend_from_slice(&a);
            }
            _ => unreachable!(),
        }
        match group_nla {
            Nla::V4(a) => {
                body.extend_from_slice(&1u16.to_be_bytes());
                body.extend_from_slice(&a);
            }
            _ => unreachable!(),
        }
        buf[pgm_codec::HEADER_LEN..].copy_from_slice(&body);
        buf
    }

    #[test]
    fn nak_produces_rdata_and_duplicate_is_suppressed() {
        let sink = LoopbackSink::default();
        let (transport, control_tx) = bind_basic(sink.clone());

        transport.send(b"hello", SendFlags::blocking()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        sink.drain(); // discard the original ODATA, keep only what the NAK triggers

        // Two identical NAKs arrive back to back, before the timer thread has
        // a chance to drain the first repair off the queue: both are valid
        // and both get an NCF, but the second is coalesced into the same
        // queued job rather than producing a second retransmission.
        let nak = nak_for(Nla::V4([10, 0, 0, 1]), Nla::V4([239, 0, 0, 1]), 0, false);
        control_tx.send(nak.clone()).unwrap();
        control_tx.send(nak).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let packets = sink.drain();
        let ncf_count = packets
            .iter()
            .filter(|p| Header::decode(p).map(|h| h.ty == PacketType::Ncf).unwrap_or(false))
            .count();
        let rdata_count = packets
            .iter()
            .filter(|p| Header::decode(p).map(|h| h.ty == PacketType::Rdata).unwrap_or(false))
            .count();
        assert_eq!(ncf_count, 2, "every well-formed NAK gets an NCF, duplicate or not");
        assert_eq!(rdata_count, 1, "the duplicate NAK is coalesced into the one queued repair");
        assert_eq!(transport.stats().msgs_retransmitted, 1);

        transport.close();
    }

    #[test]
    fn malformed_nak_wrong_source_nla_is_discarded_without_rdata() {
        let sink = LoopbackSink::default();
        let (transport, control_tx) = bind_basic(sink.clone());

        transport.send(b"hello", SendFlags::blocking()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        sink.drain();

        let bad_nak = nak_for(Nla::V4([10, 0, 0, 99]), Nla::V4([239, 0, 0, 1]), 0, false);
        control_tx.send(bad_nak).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert!(sink.is_empty(), "no NCF or RDATA for a NAK with the wrong source NLA");
        assert_eq!(transport.stats().malformed_naks, 1);
        assert_eq!(transport.stats().msgs_retransmitted, 0);

        transport.close();
    }

    #[test]
    fn proactive_parity_emitted_at_group_closure() {
        let sink = LoopbackSink::default();
        let (tx_c, rx_c) = crossbeam::channel::unbounded();
        let _ = tx_c;
        let transport = TransportBuilder::new()
            .set_txw_sqns(32)
            .set_txw_max_rte(1_000_000_000)
            .set_max_tpdu(1500)
            .set_tsi(1, 1, [0; 6])
            .set_nlas(Nla::V4([10, 0, 0, 1]), Nla::V4([239, 0, 0, 1]))
            .set_use_proactive_parity(true)
            .set_rs(4, 2)
            .bind(sink.clone(), rx_c)
            .unwrap();

        // rs_k = 2: each pair of ODATA sends closes one transmission group.
        transport.send(b"g0a", SendFlags::blocking()).unwrap();
        transport.send(b"g0b", SendFlags::blocking()).unwrap();
        transport.send(b"g1a", SendFlags::blocking()).unwrap();
        transport.send(b"g1b", SendFlags::blocking()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let packets = sink.drain();
        let parity_count = packets
            .iter()
            .filter(|p| Header::decode(p).map(|h| h.options & pgm_codec::OPT_PARITY != 0).unwrap_or(false))
            .count();
        assert_eq!(parity_count, 2, "one parity packet per transmission-group closure");

        transport.close();
    }
}
