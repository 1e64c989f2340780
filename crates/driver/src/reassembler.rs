//! Network frame reassembly
//!
//! Bulk IN transfers carry whole IP frames back to back, but a frame may
//! straddle two transfers. The reassembler walks each chunk through a small
//! state machine and emits every completed frame.
//!
//! A bad declared length, or a failed allocation, drops the parser into
//! `WaitSync`: the rest of the transfer is discarded and parsing restarts
//! at the next transfer boundary, which is always frame aligned.

use bytes::Bytes;
use protocol::{FRAME_HEADER_LEN, declared_length};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    WaitHeader,
    WaitBody,
    WaitSync,
}

/// What one [`Reassembler::feed`] call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub frames: usize,
    pub length_errors: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct Reassembler {
    state: ParseState,
    header: [u8; FRAME_HEADER_LEN],
    header_len: usize,
    packet: Vec<u8>,
    bytes_expected: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            state: ParseState::WaitHeader,
            header: [0u8; FRAME_HEADER_LEN],
            header_len: 0,
            packet: Vec::new(),
            bytes_expected: FRAME_HEADER_LEN,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Bytes still needed to finish the current header or body
    pub fn bytes_expected(&self) -> usize {
        self.bytes_expected
    }

    /// Forget any partial frame
    pub fn reset(&mut self) {
        self.state = ParseState::WaitHeader;
        self.header_len = 0;
        self.packet = Vec::new();
        self.bytes_expected = FRAME_HEADER_LEN;
    }

    /// Consume one received chunk
    ///
    /// `end_of_transfer` marks the chunk as the tail of a bulk transfer.
    pub fn feed(
        &mut self,
        mut chunk: &[u8],
        end_of_transfer: bool,
        mut deliver: impl FnMut(Bytes),
    ) -> FeedReport {
        let mut report = FeedReport::default();

        while !chunk.is_empty() {
            match self.state {
                ParseState::WaitHeader => {
                    let take = (FRAME_HEADER_LEN - self.header_len).min(chunk.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&chunk[..take]);
                    self.header_len += take;
                    self.bytes_expected = FRAME_HEADER_LEN - self.header_len;
                    chunk = &chunk[take..];

                    if self.header_len == FRAME_HEADER_LEN {
                        self.start_frame(&mut report, &mut deliver);
                    }
                }
                ParseState::WaitBody => {
                    let take = self.bytes_expected.min(chunk.len());
                    self.packet.extend_from_slice(&chunk[..take]);
                    self.bytes_expected -= take;
                    chunk = &chunk[take..];

                    if self.bytes_expected == 0 {
                        self.finish_frame(&mut report, &mut deliver);
                    }
                }
                ParseState::WaitSync => {
                    trace!("Discarding {} bytes while resynchronizing", chunk.len());
                    chunk = &[];
                }
            }
        }

        if end_of_transfer && self.state == ParseState::WaitSync {
            debug!("Transfer boundary reached, resynchronized");
            self.reset();
        }
        report
    }

    fn start_frame(&mut self, report: &mut FeedReport, deliver: &mut impl FnMut(Bytes)) {
        let total = match declared_length(&self.header) {
            Ok(total) => total,
            Err(e) => {
                debug!("Invalid frame header: {}", e);
                report.length_errors += 1;
                self.enter_sync();
                return;
            }
        };

        let mut packet = Vec::new();
        if packet.try_reserve_exact(total).is_err() {
            warn!("Could not allocate {} byte frame, dropping", total);
            report.dropped += 1;
            self.enter_sync();
            return;
        }
        packet.extend_from_slice(&self.header);
        self.packet = packet;
        self.bytes_expected = total - FRAME_HEADER_LEN;
        self.state = ParseState::WaitBody;

        if self.bytes_expected == 0 {
            self.finish_frame(report, deliver);
        }
    }

    fn finish_frame(&mut self, report: &mut FeedReport, deliver: &mut impl FnMut(Bytes)) {
        let frame = Bytes::from(std::mem::take(&mut self.packet));
        trace!("Frame complete: {} bytes", frame.len());
        report.frames += 1;
        deliver(frame);

        self.state = ParseState::WaitHeader;
        self.header_len = 0;
        self.bytes_expected = FRAME_HEADER_LEN;
    }

    fn enter_sync(&mut self) {
        self.state = ParseState::WaitSync;
        self.header_len = 0;
        self.packet = Vec::new();
        self.bytes_expected = 0;
    }
}
