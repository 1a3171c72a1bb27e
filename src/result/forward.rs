//! Relaying backend packets to a client, renumbering and rewriting them when
//! the two legs negotiated different capabilities.

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::backend::BackendLink;
use crate::metrics::metrics;
use crate::protocol::packet::{self, capabilities, Packet};
use crate::transport::{PacketSink, ResumeListener, Slice};

/// EOF compatibility rewrite between the two legs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofRewrite {
    /// Both legs agree
    None,
    /// Source deprecates EOF, destination expects classic EOF packets
    InjectEof,
    /// Source sends classic EOF packets, destination deprecates them
    DropEof,
}

impl EofRewrite {
    pub fn between(source_caps: u32, dest_caps: u32) -> Self {
        match (
            capabilities::deprecates_eof(source_caps),
            capabilities::deprecates_eof(dest_caps),
        ) {
            (true, false) => EofRewrite::InjectEof,
            (false, true) => EofRewrite::DropEof,
            _ => EofRewrite::None,
        }
    }
}

pub struct Forwarder {
    sink: Arc<dyn PacketSink>,
    backend: Arc<dyn BackendLink>,
    resumer: Arc<dyn ResumeListener>,
    dest_caps: u32,
    /// Added to every source sequence id (mod 256)
    seq_delta: u8,
    /// Sequence id the destination expects next
    next_seq: u8,
    holding: bool,
    pending: Vec<Bytes>,
    /// Set once the destination refused a write
    sink_gone: bool,
    /// Set once any byte was handed to the destination
    written: bool,
}

impl Forwarder {
    /// Destination capabilities are those negotiated on `sink`
    pub fn new(sink: Arc<dyn PacketSink>, backend: Arc<dyn BackendLink>) -> Self {
        let resumer = backend.resume_listener();
        let dest_caps = sink.capabilities();
        Self {
            sink,
            backend,
            resumer,
            dest_caps,
            seq_delta: 0,
            // the request itself carried sequence 0
            next_seq: 1,
            holding: false,
            pending: Vec::new(),
            sink_gone: false,
            written: false,
        }
    }

    pub fn dest_caps(&self) -> u32 {
        self.dest_caps
    }

    pub fn seq_delta(&self) -> u8 {
        self.seq_delta
    }

    pub fn next_seq(&self) -> u8 {
        self.next_seq
    }

    pub fn is_holding(&self) -> bool {
        self.holding
    }

    pub fn has_written(&self) -> bool {
        self.written
    }

    /// Relay a packet unchanged apart from its sequence ids
    pub fn forward(&mut self, slice: &Slice) {
        let bytes = if self.seq_delta == 0 {
            if self.holding {
                slice.dump().into_bytes()
            } else {
                slice.bytes().clone()
            }
        } else {
            let mut copy = BytesMut::from(&slice.bytes()[..]);
            packet::renumber(&mut copy, self.seq_delta);
            copy.freeze()
        };
        self.next_seq = packet::last_sequence(&bytes).wrapping_add(1);
        self.emit(bytes);
    }

    /// Relay `source` with a rewritten payload at its (shifted) sequence id
    pub fn forward_payload(&mut self, source: &Slice, payload: &[u8]) {
        let seq = source.sequence_id().wrapping_add(self.seq_delta);
        let bytes = Packet::new(seq, Bytes::copy_from_slice(payload)).to_wire();
        let emitted = packet::chunk_count(&bytes);
        let original = source.chunk_count();
        // keep later packets contiguous if the chunk count changed
        self.seq_delta = self
            .seq_delta
            .wrapping_add(emitted as u8)
            .wrapping_sub(original as u8);
        self.next_seq = packet::last_sequence(&bytes).wrapping_add(1);
        self.emit(bytes);
    }

    /// Emit a packet the source never sent; shifts everything after it
    pub fn inject(&mut self, payload: &[u8]) {
        let bytes = Packet::new(self.next_seq, Bytes::copy_from_slice(payload)).to_wire();
        let count = packet::chunk_count(&bytes) as u8;
        self.seq_delta = self.seq_delta.wrapping_add(count);
        self.next_seq = self.next_seq.wrapping_add(count);
        self.emit(bytes);
    }

    /// Swallow a source packet; shifts everything after it back
    pub fn skip(&mut self, slice: &Slice) {
        self.seq_delta = self.seq_delta.wrapping_sub(slice.chunk_count() as u8);
    }

    /// Start buffering: later output stays pending until `release`
    pub fn hold(&mut self) {
        self.holding = true;
    }

    /// Send everything pending in one batch
    pub fn release(&mut self) {
        self.holding = false;
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        if self.sink_gone {
            return;
        }
        match self.sink.write_batch(batch) {
            Ok(()) => {
                self.written = true;
                metrics().packets_forwarded_total.inc_by(count as u64);
                self.apply_backpressure();
            }
            Err(e) => self.lost_sink(e),
        }
    }

    /// Drop everything pending
    pub fn discard(&mut self) {
        self.holding = false;
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn emit(&mut self, bytes: Bytes) {
        if self.holding {
            self.pending.push(bytes);
            return;
        }
        if self.sink_gone {
            return;
        }
        match self.sink.write(bytes) {
            Ok(()) => {
                self.written = true;
                metrics().packets_forwarded_total.inc();
                self.apply_backpressure();
            }
            Err(e) => self.lost_sink(e),
        }
    }

    fn lost_sink(&mut self, e: crate::transport::TransportError) {
        debug!(backend_id = self.backend.id(), error = %e, "Destination gone, draining result");
        self.sink_gone = true;
        self.pending.clear();
        // never leave the source paused for a sink that will not drain
        self.backend.enable_read();
    }

    /// Pause the source while the destination is blocked
    fn apply_backpressure(&self) {
        if !self.sink.is_write_blocked() {
            return;
        }
        self.backend.disable_read();
        let listener: Weak<dyn ResumeListener> = Arc::downgrade(&self.resumer);
        // drained between the check and the registration
        if !self.sink.register_resume(listener) {
            self.backend.enable_read();
        }
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("seq_delta", &self.seq_delta)
            .field("next_seq", &self.next_seq)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{encode_packet, first_sequence, MAX_PACKET_SIZE};
    use crate::testing::{MockBackend, MockSink};

    fn forwarder(sink: &Arc<MockSink>, backend: &Arc<MockBackend>) -> Forwarder {
        Forwarder::new(sink.clone(), backend.clone())
    }

    #[test]
    fn test_rewrite_mode_between_caps() {
        let deprecate = capabilities::CLIENT_DEPRECATE_EOF | capabilities::CLIENT_PROTOCOL_41;
        let classic = capabilities::CLIENT_PROTOCOL_41;
        assert_eq!(EofRewrite::between(deprecate, classic), EofRewrite::InjectEof);
        assert_eq!(EofRewrite::between(classic, deprecate), EofRewrite::DropEof);
        assert_eq!(EofRewrite::between(classic, classic), EofRewrite::None);
        assert_eq!(EofRewrite::between(deprecate, deprecate), EofRewrite::None);
    }

    #[test]
    fn test_inject_shifts_following_packets() {
        let sink = MockSink::new(0);
        let backend = MockBackend::replica(0);
        let mut fwd = forwarder(&sink, &backend);

        fwd.forward(&Slice::new(encode_packet(1, b"a")));
        fwd.inject(b"\xfe");
        fwd.forward(&Slice::new(encode_packet(2, b"b")));

        let seqs: Vec<u8> = sink.packets().iter().map(|p| first_sequence(p)).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(fwd.seq_delta(), 1);
        assert_eq!(fwd.next_seq(), 4);
    }

    #[test]
    fn test_skip_shifts_back() {
        let sink = MockSink::new(0);
        let backend = MockBackend::replica(0);
        let mut fwd = forwarder(&sink, &backend);

        fwd.forward(&Slice::new(encode_packet(1, b"a")));
        fwd.skip(&Slice::new(encode_packet(2, b"\xfe\0\0\0\0")));
        fwd.forward(&Slice::new(encode_packet(3, b"b")));
        let seqs: Vec<u8> = sink.packets().iter().map(|p| first_sequence(p)).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_renumber_walks_multi_chunk_packets() {
        let sink = MockSink::new(0);
        let backend = MockBackend::replica(0);
        let mut fwd = forwarder(&sink, &backend);
        fwd.inject(b"\xfe\0\0\0\0");

        let big = Packet::new(255, vec![1u8; MAX_PACKET_SIZE + 1]).to_wire();
        fwd.forward(&Slice::new(big));
        let sent = sink.packets();
        let seqs: Vec<u8> = packet::chunks(&sent[1]).map(|(_, h)| h.sequence_id).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(fwd.next_seq(), 2);
    }

    #[test]
    fn test_hold_release_is_all_or_nothing() {
        let sink = MockSink::new(0);
        let backend = MockBackend::replica(0);
        let mut fwd = forwarder(&sink, &backend);

        fwd.hold();
        fwd.forward(&Slice::new(encode_packet(1, b"def")));
        fwd.inject(b"\xfe\0\0\x02\0");
        assert!(sink.packets().is_empty());
        assert_eq!(fwd.pending_len(), 2);
        fwd.release();
        assert_eq!(sink.batches(), 1);
        assert_eq!(sink.packets().len(), 2);

        fwd.hold();
        fwd.forward(&Slice::new(encode_packet(3, b"gone")));
        fwd.discard();
        fwd.release();
        assert_eq!(sink.packets().len(), 2);
    }

    #[test]
    fn test_blocked_sink_pauses_source_until_resume() {
        let sink = MockSink::new(0);
        sink.set_blocked(true);
        let backend = MockBackend::replica(0);
        let mut fwd = forwarder(&sink, &backend);

        fwd.forward(&Slice::new(encode_packet(1, b"row")));
        assert!(!backend.read_enabled());
        sink.drain();
        assert!(backend.read_enabled());
    }

    #[test]
    fn test_drain_race_reenables_read() {
        let sink = MockSink::new(0);
        sink.set_blocked(true);
        sink.drain_on_register();
        let backend = MockBackend::replica(0);
        let mut fwd = forwarder(&sink, &backend);

        fwd.forward(&Slice::new(encode_packet(1, b"row")));
        assert!(backend.read_enabled());
    }

    #[test]
    fn test_closed_sink_keeps_draining() {
        let sink = MockSink::new(0);
        sink.close();
        let backend = MockBackend::replica(0);
        let mut fwd = forwarder(&sink, &backend);
        fwd.forward(&Slice::new(encode_packet(1, b"row")));
        fwd.forward(&Slice::new(encode_packet(2, b"row")));
        assert!(sink.packets().is_empty());
        assert!(backend.read_enabled());
    }
}
