//! Generation tracking for wrapping 16-bit packet ids.
//!
//! Packet ids wrap at 65536; the generation counts completed wraps. The
//! window classifies an incoming id as in-window (accept), next-generation
//! (accept, belongs to the wrap in progress) or rejected, and maps accepted
//! ids to flat indices for the reorder queue.

use crate::error::WindowError;
use crate::ID_MODULUS;

/// Sliding acceptance window over the wrapping id space
#[derive(Debug, Clone)]
pub struct GenerationWindow {
    base_offset: u32,
    generation: u32,
    window_size: u32,
}

impl GenerationWindow {
    /// Create a window starting at id 0, generation 0.
    ///
    /// `window_size` must be in `1..=ID_MODULUS`.
    #[must_use]
    pub fn new(window_size: u32) -> Self {
        debug_assert!(window_size >= 1 && window_size <= ID_MODULUS);
        Self {
            base_offset: 0,
            generation: 0,
            window_size,
        }
    }

    /// The id the window currently starts at
    #[must_use]
    pub fn base_offset(&self) -> u32 {
        self.base_offset
    }

    /// Completed wrap count
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Acceptance window width
    #[must_use]
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// True iff `v` falls within `[base, base + window_size)` modulo the id
    /// space, including the case where the window straddles the wrap point.
    #[must_use]
    pub fn is_in_window(&self, v: u16) -> bool {
        let v = u32::from(v);
        let end = self.base_offset + self.window_size;
        if end <= ID_MODULUS {
            v >= self.base_offset && v < end
        } else {
            v >= self.base_offset || v < end - ID_MODULUS
        }
    }

    /// True when the window straddles the wrap point and `v` is
    /// unambiguously an id of the *next* generation rather than a stale one.
    #[must_use]
    pub fn is_next_gen(&self, v: u16) -> bool {
        let v = u32::from(v);
        self.base_offset > ID_MODULUS - self.window_size
            && v < self.base_offset + self.window_size - ID_MODULUS
    }

    /// The generation `v` belongs to, assuming it is in-window
    #[must_use]
    pub fn generation_for(&self, v: u16) -> u32 {
        if self.is_next_gen(v) {
            self.generation + 1
        } else {
            self.generation
        }
    }

    /// Flat array offset of `v` relative to the window base, or `None` if
    /// `v` is not in the window.
    #[must_use]
    pub fn mapped_to_index(&self, v: u16) -> Option<u32> {
        if !self.is_in_window(v) {
            return None;
        }
        let v = u32::from(v);
        if self.is_next_gen(v as u16) {
            Some(v + ID_MODULUS - self.base_offset)
        } else {
            Some(v - self.base_offset)
        }
    }

    /// Move the window base forward by `n`, bumping the generation on wrap.
    ///
    /// # Errors
    ///
    /// Returns `WindowError::AdvanceTooLarge` if `n` exceeds the id modulus.
    pub fn advance(&mut self, n: u32) -> Result<(), WindowError> {
        if n > ID_MODULUS {
            return Err(WindowError::AdvanceTooLarge(n));
        }
        let moved = self.base_offset + n;
        self.generation += moved / ID_MODULUS;
        self.base_offset = moved % ID_MODULUS;
        Ok(())
    }

    /// Drag the window base just past `v` if `v` is acceptable.
    ///
    /// Used for the voice path: the newest in-window id becomes the new
    /// floor and everything older is implicitly dropped. Returns `false`
    /// (no state change) for out-of-window ids.
    pub fn set_and_drag(&mut self, v: u16) -> bool {
        match self.mapped_to_index(v) {
            Some(index) => {
                // index + 1 <= window_size <= modulus, always legal
                self.advance(index + 1).is_ok()
            }
            None => false,
        }
    }
}
