//! The sender's interface to the unreliable datagram substrate.
//!
//! Socket creation, interface/NLA resolution and IP/UDP framing are explicit
//! non-goals of the sender core: this crate only names the seam between the
//! protocol engine and whatever actually puts bytes on the wire (a UDP
//! socket, an IP multicast socket, a test double).
#![deny(missing_docs)]
#![deny(warnings)]
use std::collections::VecDeque;
use std::io::Result;
use std::sync::{Arc, Mutex};

/// A destination the sender can write complete PGM TPDUs to.
///
/// Implementations are expected to be cheap to clone (an `Arc` around a
/// socket handle) since the transport hands a clone to the timer thread as
/// well as to application threads.
pub trait DatagramSink: Send + Sync {
    /// Writes one complete TPDU. Must not partially write: either the whole
    /// buffer reaches the substrate or an error is returned.
    fn send(&self, tpdu: &[u8]) -> Result<()>;
}

impl<T: DatagramSink + ?Sized> DatagramSink for Arc<T> {
    fn send(&self, tpdu: &[u8]) -> Result<()> {
        (**self).send(tpdu)
    }
}

/// An in-memory sink that records every TPDU handed to it, in order.
///
/// Used by `pgm-send`'s tests in place of a real multicast socket.
#[derive(Clone, Default)]
pub struct LoopbackSink(Arc<Mutex<VecDeque<Vec<u8>>>>);

impl LoopbackSink {
    /// Pops the oldest recorded TPDU, if any.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.0.lock().unwrap().pop_front()
    }

    /// Number of TPDUs currently queued.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Whether no TPDU has been recorded (and not yet popped).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every recorded TPDU in send order.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().drain(..).collect()
    }
}

impl DatagramSink for LoopbackSink {
    fn send(&self, tpdu: &[u8]) -> Result<()> {
        self.0.lock().unwrap().push_back(tpdu.to_vec());
        Ok(())
    }
}

/// A sink that drops or duplicates writes with a fixed probability.
///
/// The `px` parameter is the probability that a write reaches the inner
/// sink at all; `pq` is the probability that, independently, the write is
/// also duplicated. `px=1.0, pq=0.0` is a perfectly reliable sink;
/// `px=0.0, pq=0.0` simulates a full partition.
pub struct LossySink<S> {
    inner: S,
    px: f64,
    pq: f64,
}

impl<S: DatagramSink> LossySink<S> {
    /// Creates a new lossy sink wrapping `inner`.
    pub fn new(inner: S, px: f64, pq: f64) -> Self {
        assert!((0.0..=1.0).contains(&px));
        assert!((0.0..=1.0).contains(&pq));
        Self { inner, px, pq }
    }
}

impl<S: DatagramSink> DatagramSink for LossySink<S> {
    fn send(&self, tpdu: &[u8]) -> Result<()> {
        use rand::Rng;
        let fate: f64 = rand::thread_rng().gen();
        if fate < self.px {
            self.inner.send(tpdu)?;
            if fate < self.pq {
                self.inner.send(tpdu)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_records_in_order() {
        let sink = LoopbackSink::default();
        sink.send(b"one").unwrap();
        sink.send(b"two").unwrap();
        assert_eq!(sink.pop().unwrap(), b"one");
        assert_eq!(sink.pop().unwrap(), b"two");
        assert!(sink.pop().is_none());
    }

    #[test]
    fn lossy_sink_reliable() {
        let inner = LoopbackSink::default();
        let lossy = LossySink::new(inner.clone(), 1.0, 0.0);
        lossy.send(b"ping").unwrap();
        assert_eq!(inner.drain(), vec![b"ping".to_vec()]);
    }

    #[test]
    fn lossy_sink_partition() {
        let inner = LoopbackSink::default();
        let lossy = LossySink::new(inner.clone(), 0.0, 0.0);
        lossy.send(b"ping").unwrap();
        assert!(inner.is_empty());
    }
}
