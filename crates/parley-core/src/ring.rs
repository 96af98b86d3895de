//! Out-of-order receive buffer for command packets.
//!
//! Buffers Command/CommandLow packets until a complete message can be
//! assembled: single packets pass through, fragment runs are concatenated,
//! compressed payloads are expanded. Memory is bounded by a fixed buffer
//! cap; the backing arena grows geometrically and wraps with an explicit
//! start cursor.

use crate::error::RingError;
use crate::packet::Packet;
use crate::quickerlz;
use crate::window::GenerationWindow;
use crate::ID_MODULUS;

/// Classification of an incoming id against the queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetState {
    /// Not in the window and not recently consumed: reject, do not ack
    OutOfWindowNotSet,
    /// Behind the window but recently consumed: duplicate, re-ack only
    OutOfWindowSet,
    /// In the window with no packet stored yet: accept and buffer
    InWindowNotSet,
    /// In the window and already stored: duplicate, re-ack only
    InWindowSet,
}

/// Reorder/defragmentation queue over a generation window
pub struct RingQueue {
    /// Arena of slots; logical index `i` lives at `(start + i) % capacity`
    buffer: Vec<Option<Packet>>,
    /// Physical index of logical position 0 (the window base)
    start: usize,
    /// High-water mark: one past the highest set logical index. Positions
    /// below `count` may be unset holes awaiting their packet.
    count: usize,
    window: GenerationWindow,
    max_buffer_size: usize,
    max_decompressed_size: usize,
}

impl RingQueue {
    /// Initial arena capacity before any growth
    const INITIAL_CAPACITY: usize = 16;

    /// Create an empty queue.
    ///
    /// `max_buffer_size` caps arena growth; ids mapping past it are
    /// rejected as errors. `max_decompressed_size` bounds decompression of
    /// assembled payloads.
    #[must_use]
    pub fn new(window_size: u32, max_buffer_size: usize, max_decompressed_size: usize) -> Self {
        let capacity = Self::INITIAL_CAPACITY.min(max_buffer_size.max(1));
        Self {
            buffer: (0..capacity).map(|_| None).collect(),
            start: 0,
            count: 0,
            window: GenerationWindow::new(window_size),
            max_buffer_size,
            max_decompressed_size,
        }
    }

    /// The underlying generation window (read-only)
    #[must_use]
    pub fn window(&self) -> &GenerationWindow {
        &self.window
    }

    /// Number of buffered positions up to the high-water mark
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    fn physical(&self, index: usize) -> usize {
        (self.start + index) % self.buffer.len()
    }

    /// Classify `id` against the window and the stored slots
    #[must_use]
    pub fn is_set(&self, id: u16) -> SetState {
        if let Some(index) = self.window.mapped_to_index(id) {
            let index = index as usize;
            if index < self.count && self.buffer[self.physical(index)].is_some() {
                SetState::InWindowSet
            } else {
                SetState::InWindowNotSet
            }
        } else {
            // Distance behind the window base; ids we consumed recently
            // were acked once already but the ack may have been lost.
            let behind = (self.window.base_offset() + ID_MODULUS
                - 1
                - u32::from(id))
                % ID_MODULUS;
            if behind < self.window.window_size() {
                SetState::OutOfWindowSet
            } else {
                SetState::OutOfWindowNotSet
            }
        }
    }

    /// Store a packet at its window position.
    ///
    /// # Errors
    ///
    /// Returns `RingError::NotSettable` unless the id classifies as
    /// `InWindowNotSet` (duplicate or out-of-window sets are caller bugs),
    /// and `RingError::BufferCapExceeded` if the position lies beyond the
    /// configured arena cap.
    pub fn set(&mut self, packet: Packet) -> Result<(), RingError> {
        let id = packet.packet_id;
        if self.is_set(id) != SetState::InWindowNotSet {
            return Err(RingError::NotSettable(id));
        }
        // In-window by the check above
        let index = self.window.mapped_to_index(id).unwrap_or(0) as usize;
        if index >= self.buffer.len() {
            self.grow_to(index + 1)?;
        }
        let slot = self.physical(index);
        self.buffer[slot] = Some(packet);
        self.count = self.count.max(index + 1);
        Ok(())
    }

    /// Double the arena (capped) until it can address `needed` slots,
    /// re-laying the live region out from physical index 0.
    fn grow_to(&mut self, needed: usize) -> Result<(), RingError> {
        if needed > self.max_buffer_size {
            return Err(RingError::BufferCapExceeded {
                index: needed - 1,
                cap: self.max_buffer_size,
            });
        }
        let mut new_capacity = self.buffer.len().max(1);
        while new_capacity < needed {
            new_capacity = (new_capacity * 2).min(self.max_buffer_size);
        }
        let mut new_buffer: Vec<Option<Packet>> = (0..new_capacity).map(|_| None).collect();
        for index in 0..self.count {
            let slot = self.physical(index);
            new_buffer[index] = self.buffer[slot].take();
        }
        self.buffer = new_buffer;
        self.start = 0;
        Ok(())
    }

    /// Pop the next complete message if the front of the queue holds one.
    ///
    /// A non-fragmented packet at the front stands alone. A fragmented
    /// front packet needs a gap-free run ending at the first packet whose
    /// fragmented flag is clear; the run's payloads are concatenated onto
    /// the first packet. If the assembled packet carries the compressed
    /// flag its payload is expanded before being returned.
    ///
    /// # Errors
    ///
    /// Returns `RingError::Decompress` if an assembled payload fails to
    /// decompress; the run is consumed either way.
    pub fn try_dequeue(&mut self) -> Result<Option<Packet>, RingError> {
        if self.count == 0 {
            return Ok(None);
        }
        let head_fragmented = match &self.buffer[self.physical(0)] {
            Some(packet) => packet.flags.is_fragmented(),
            None => return Ok(None),
        };

        let run_len = if head_fragmented {
            // Find the closing fragment: gap-free run, first clear flag ends it
            let mut end = None;
            for index in 1..self.count {
                match &self.buffer[self.physical(index)] {
                    Some(packet) if packet.flags.is_fragmented() => continue,
                    Some(_) => {
                        end = Some(index);
                        break;
                    }
                    None => break,
                }
            }
            match end {
                Some(end) => end + 1,
                None => return Ok(None),
            }
        } else {
            1
        };

        let mut assembled = self.take_front(0);
        for index in 1..run_len {
            let fragment = self.take_front(index);
            assembled.payload.extend_from_slice(&fragment.payload);
        }
        assembled.flags.clear_fragmented();

        self.start = self.physical(run_len);
        self.count -= run_len;
        // The window only slides as messages are consumed
        self.window
            .advance(run_len as u32)
            .map_err(|_| RingError::NotSettable(assembled.packet_id))?;

        if assembled.flags.is_compressed() {
            tracing::trace!(
                id = assembled.packet_id,
                len = assembled.payload.len(),
                "decompressing assembled command"
            );
            assembled.payload =
                quickerlz::decompress(&assembled.payload, self.max_decompressed_size)?;
        }
        Ok(Some(assembled))
    }

    fn take_front(&mut self, index: usize) -> Packet {
        let slot = self.physical(index);
        self.buffer[slot]
            .take()
            .unwrap_or_else(|| unreachable!("run scan guarantees a packet at {slot}"))
    }
}
