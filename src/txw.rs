//! Transmit window: the bounded ring of packet records plus its embedded
//! retransmit queue (spec.md §4.1, §9).
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use pgm_codec::Fragment;

use crate::error::PgmError;

/// Modular sequence comparison: `(i32)(a - b) < 0`, per spec.md §9.
pub fn sqn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn window_contains(trail: u32, lead: u32, s: u32) -> bool {
    !sqn_lt(s, trail) && !sqn_lt(lead, s)
}

/// One packet's durable record inside the transmit window (spec.md §3 "Packet Record").
pub struct Record {
    /// Assigned PGM sequence number.
    pub sqn: u32,
    /// Wall-clock time of first transmission.
    #[allow(dead_code)]
    pub first_sent: Instant,
    /// The full encoded TPDU. Retransmission rewrites the header fields in
    /// place (type, `data_trail`, checksum) without changing length; parity
    /// synthesis only reads this buffer, so its length and TSDU bytes always
    /// match the original ODATA as sent.
    pub buf: Mutex<Vec<u8>>,
    /// Byte offset of `data_trail` within `buf`.
    pub data_trail_offset: usize,
    /// Byte offset where the TSDU begins within `buf`.
    pub tsdu_offset: usize,
    /// This record's `OPT_FRAGMENT` metadata, if it was part of a fragmented APDU.
    pub fragment: Option<Fragment>,
    /// Unfolded partial checksum of the TSDU alone, memoized at first send
    /// to accelerate RDATA emission (spec.md §4.2, §9).
    pub tsdu_partial: u32,
}

/// A pending repair request drained by the timer thread (spec.md §3 "Retransmit Queue").
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RepairJob {
    /// Retransmit a single original sequence as RDATA.
    Selective(u32),
    /// Synthesize parity index `h` for the transmission group based at `tg_base`.
    Parity {
        /// Transmission-group base sequence.
        tg_base: u32,
        /// Parity index within `[0, n-k)`.
        h: u32,
    },
}

struct Inner {
    trail: u32,
    lead: u32,
    has_any: bool,
    txw_sqns: u32,
    slots: Vec<Option<Arc<Record>>>,
}

struct RetransmitState {
    queue: VecDeque<RepairJob>,
    in_queue: HashSet<RepairJob>,
    /// Monotonic per-transmission-group parity index allocator.
    parity_h: HashMap<u32, u32>,
}

/// The sliding transmit window and its retransmit queue.
///
/// Per spec.md §5, a reader-writer lock protects the window itself
/// (application threads write, the timer/SPM path reads), while the
/// retransmit queue carries its own embedded mutex.
pub struct Txw {
    inner: RwLock<Inner>,
    retransmit: Mutex<RetransmitState>,
    n_minus_k: u32,
}

impl std::hash::Hash for RepairJob {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            RepairJob::Selective(sqn) => {
                0u8.hash(state);
                sqn.hash(state);
            }
            RepairJob::Parity { tg_base, .. } => {
                1u8.hash(state);
                tg_base.hash(state);
            }
        }
    }
}

impl Txw {
    /// Creates an empty window holding up to `txw_sqns` records, whose
    /// parity index allocator wraps modulo `n_minus_k` (RS parity count).
    pub fn new(txw_sqns: u32, n_minus_k: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                trail: 0,
                lead: 0,
                has_any: false,
                txw_sqns,
                slots: (0..txw_sqns).map(|_| None).collect(),
            }),
            retransmit: Mutex::new(RetransmitState {
                queue: VecDeque::new(),
                in_queue: HashSet::new(),
                parity_h: HashMap::new(),
            }),
            n_minus_k: n_minus_k.max(1),
        }
    }

    /// The sequence that will be assigned to the next record `add`ed.
    pub fn next_lead(&self) -> u32 {
        let inner = self.inner.read().unwrap();
        if inner.has_any {
            inner.lead.wrapping_add(1)
        } else {
            0
        }
    }

    /// Current trail (oldest live sequence).
    pub fn trail(&self) -> u32 {
        self.inner.read().unwrap().trail
    }

    /// Current lead (newest live sequence).
    pub fn lead(&self) -> u32 {
        self.inner.read().unwrap().lead
    }

    /// Inserts `record`, which must carry `sqn == next_lead()`. Never blocks;
    /// on overflow the oldest record is evicted and `trail` advances.
    pub fn add(&self, record: Arc<Record>) {
        let mut inner = self.inner.write().unwrap();
        debug_assert!(!inner.has_any || record.sqn == inner.lead.wrapping_add(1));

        let txw_sqns = inner.txw_sqns;
        let idx = (record.sqn % txw_sqns) as usize;
        inner.slots[idx] = Some(record.clone());
        inner.lead = record.sqn;
        if !inner.has_any {
            inner.trail = record.sqn;
            inner.has_any = true;
        }

        let count = inner.lead.wrapping_sub(inner.trail).wrapping_add(1);
        if count > txw_sqns {
            inner.trail = inner.lead.wrapping_sub(txw_sqns).wrapping_add(1);
        }
    }

    /// Random-access lookup within `[trail, lead]`.
    pub fn peek(&self, sqn: u32) -> Result<Arc<Record>, PgmError> {
        let inner = self.inner.read().unwrap();
        if !inner.has_any || !window_contains(inner.trail, inner.lead, sqn) {
            return Err(PgmError::OutOfWindow {
                sqn,
                trail: inner.trail,
                lead: inner.lead,
            });
        }
        let idx = (sqn % inner.txw_sqns) as usize;
        match &inner.slots[idx] {
            Some(r) if r.sqn == sqn => Ok(r.clone()),
            _ => Err(PgmError::OutOfWindow {
                sqn,
                trail: inner.trail,
                lead: inner.lead,
            }),
        }
    }

    /// Pushes a repair request. Returns `Ok(true)` if newly enqueued (the
    /// caller should notify the timer thread), `Ok(false)` if it was a
    /// duplicate of one already queued.
    ///
    /// For parity requests, `shift` is the transmission-group size's log2;
    /// the allocated parity index wraps modulo `n - k`
    /// (`rs_h %= n - k`, spec.md §9 Open Question (a)) — this is preserved
    /// verbatim from the original implementation's behavior, not "fixed":
    /// repeated parity requests for the same group reuse indices cyclically.
    pub fn retransmit_push(&self, sqn: u32, is_parity: bool, shift: u32) -> Result<bool, PgmError> {
        {
            let inner = self.inner.read().unwrap();
            if inner.has_any && !window_contains(inner.trail, inner.lead, sqn) {
                return Err(PgmError::OutOfWindow {
                    sqn,
                    trail: inner.trail,
                    lead: inner.lead,
                });
            }
        }

        let mut rt = self.retransmit.lock().unwrap();
        let job = if is_parity {
            let tg_base = sqn & (!0u32 << shift);
            let counter = rt.parity_h.entry(tg_base).or_insert(0);
            let h = *counter % self.n_minus_k;
            *counter += 1;
            RepairJob::Parity { tg_base, h }
        } else {
            RepairJob::Selective(sqn)
        };

        if rt.in_queue.contains(&job) {
            return Ok(false);
        }
        rt.in_queue.insert(job.clone());
        rt.queue.push_back(job);
        Ok(true)
    }

    /// Reads the head of the retransmit queue without removing it.
    pub fn retransmit_try_peek(&self) -> Option<RepairJob> {
        self.retransmit.lock().unwrap().queue.front().cloned()
    }

    /// Removes the head of the retransmit queue, allowing future pushes for
    /// that sequence/group to be re-enqueued.
    pub fn retransmit_remove_head(&self) {
        let mut rt = self.retransmit.lock().unwrap();
        if let Some(job) = rt.queue.pop_front() {
            rt.in_queue.remove(&job);
        }
    }

    /// Whether the retransmit queue has any pending work.
    #[allow(dead_code)]
    pub fn has_pending_repairs(&self) -> bool {
        !self.retransmit.lock().unwrap().queue.is_empty()
    }
}
