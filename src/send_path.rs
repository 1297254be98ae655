//! ODATA emission: fragmentation planning, flag validation, and mid-APDU
//! resume state (spec.md §4.4, §9).
use std::sync::Arc;
use std::time::Instant;

use pgm_codec::{Fragment, Header, OdataFields};

use crate::error::PgmError;
use crate::txw::Record;

/// Send-call blocking flags (spec.md §6).
///
/// Legal combinations are no flags (fully blocking), `DONTWAIT` alone, and
/// `DONTWAIT | WAITALL`. `spec.md` §6 names "WAITALL alone" as legal in the
/// same sentence that forbids "WAITALL without DONTWAIT" — the same
/// combination under two names. This implementation takes the explicit
/// prohibition as authoritative and rejects bare `WAITALL` (see DESIGN.md).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SendFlags {
    dontwait: bool,
    waitall: bool,
}

impl SendFlags {
    /// Fully blocking: waits for both rate tokens and the write primitive.
    pub fn blocking() -> Self {
        Self { dontwait: false, waitall: false }
    }

    /// Builds a flag set, rejecting the forbidden bare-`WAITALL` combination.
    pub fn new(dontwait: bool, waitall: bool) -> Result<Self, PgmError> {
        if waitall && !dontwait {
            return Err(PgmError::Invalid("WAITALL requires DONTWAIT".into()));
        }
        Ok(Self { dontwait, waitall })
    }

    /// `DONTWAIT`: the rate controller and write primitive never block.
    pub fn dontwait(&self) -> bool {
        self.dontwait
    }

    /// `DONTWAIT | WAITALL`: reserve rate tokens for the whole batch
    /// atomically up front instead of consulting the controller per packet.
    pub fn grouped_rate_check(&self) -> bool {
        self.dontwait && self.waitall
    }
}

/// One fragment's placement within an APDU being split across multiple TSDUs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FragmentPlan {
    /// Byte offset within the APDU.
    pub offset: usize,
    /// Length of this fragment.
    pub len: usize,
}

/// Splits `apdu_len` bytes into fragments of at most `max_tsdu`, contiguous
/// and strictly increasing per spec.md §4.4. A single fragment is returned
/// (offset 0, full length) when the APDU already fits.
pub fn fragment_plan(apdu_len: usize, max_tsdu: usize) -> Vec<FragmentPlan> {
    if apdu_len <= max_tsdu {
        return vec![FragmentPlan { offset: 0, len: apdu_len }];
    }
    let mut plans = Vec::with_capacity((apdu_len + max_tsdu - 1) / max_tsdu);
    let mut offset = 0;
    while offset < apdu_len {
        let len = max_tsdu.min(apdu_len - offset);
        plans.push(FragmentPlan { offset, len });
        offset += len;
    }
    plans
}

/// State preserved across a retry after a mid-APDU `WouldBlock`/`RateLimited`
/// (spec.md §9 "Coroutine-style resume"): which fragment index was in flight,
/// so the retry re-enters the loop there without re-fragmenting, re-checksumming,
/// or re-touching fragments already inserted into the window.
#[derive(Debug, Clone)]
pub struct ResumeState {
    /// Total APDU length this resume applies to (a cheap identity check).
    pub apdu_len: usize,
    /// Index into the fragment plan of the next fragment to send.
    pub next_fragment: usize,
    /// The sequence number assigned to the APDU's first fragment
    /// (`OPT_FRAGMENT`'s `opt_sqn`, shared by all fragments).
    pub frag_sqn: u32,
}

/// Builds one ODATA fragment's full `OdataFields` plus `OPT_FRAGMENT` (when
/// `plans.len() > 1`) for fragment index `i` of `plans`.
pub fn odata_fields_for(
    plans: &[FragmentPlan],
    i: usize,
    apdu_len: usize,
    frag_sqn: u32,
    data_sqn: u32,
    data_trail: u32,
    parity_grp: Option<u32>,
) -> OdataFields {
    let fragment = if plans.len() > 1 {
        Some(Fragment {
            opt_sqn: frag_sqn,
            opt_frag_off: plans[i].offset as u32,
            opt_frag_len: apdu_len as u32,
        })
    } else {
        None
    };
    OdataFields {
        data_sqn,
        data_trail,
        fragment,
        parity_grp,
    }
}

/// Wraps a freshly built ODATA TPDU into a [`Record`] ready for [`crate::txw::Txw::add`].
pub fn record_from_built(sqn: u32, built: pgm_codec::BuiltOdata, fragment: Option<Fragment>) -> Arc<Record> {
    Arc::new(Record {
        sqn,
        first_sent: Instant::now(),
        buf: std::sync::Mutex::new(built.tpdu),
        data_trail_offset: built.data_trail_offset,
        tsdu_offset: built.tsdu_offset,
        fragment,
        tsdu_partial: built.tsdu_partial,
    })
}

/// Rebuilds the header fields needed for each fragment's `ODATA`, sharing
/// GSI/ports/options across the whole APDU.
pub fn header_template(source_port: u16, dest_port: u16, gsi: [u8; 6]) -> Header {
    Header {
        source_port,
        dest_port,
        ty: pgm_codec::PacketType::Odata,
        options: 0,
        checksum: 0,
        gsi,
        tsdu_length: 0,
    }
}
