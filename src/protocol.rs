//! Packet framing for the logsock wire protocol.
//!
//! A packet is every byte up to and including a `\n`. There is no length
//! prefix and no content validation: embedded NULs and invalid UTF-8 are
//! carried through untouched.
//!
//! Each connection owns one [`PacketAssembler`] that accumulates partial
//! input across reads. The accumulation grows by doubling from an initial
//! capacity and is capped at a hard ceiling; input that would push a packet
//! past the ceiling is rejected and nothing of that packet is ever emitted.

use bytes::{Bytes, BytesMut};

/// Packet delimiter.
pub const DELIMITER: u8 = b'\n';

/// Framing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Packet would grow beyond the configured maximum.
    TooLarge {
        /// Size the packet would have reached.
        size: usize,
        /// Configured ceiling.
        max: usize,
    },
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::TooLarge { size, max } => {
                write!(f, "packet exceeds maximum size ({size} > {max})")
            }
        }
    }
}

impl std::error::Error for PacketError {}

/// Per-connection packet accumulator.
#[derive(Debug)]
pub struct PacketAssembler {
    buf: BytesMut,
    /// Logical capacity, grown by doubling and never above `max_size`.
    capacity: usize,
    max_size: usize,
}

impl PacketAssembler {
    /// Create an assembler with the given starting capacity and ceiling.
    pub fn new(initial_capacity: usize, max_size: usize) -> Self {
        let capacity = initial_capacity.min(max_size).max(1);
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            max_size,
        }
    }

    /// Consume input up to and including the next delimiter.
    ///
    /// `input` is advanced past whatever was consumed. Returns the completed
    /// packet when a delimiter was found, `None` when all of `input` went into
    /// the pending accumulation. Callers loop until `input` is empty.
    pub fn feed(&mut self, input: &mut &[u8]) -> Result<Option<Bytes>, PacketError> {
        let newline = input.iter().position(|&b| b == DELIMITER);
        let take = newline.map_or(input.len(), |pos| pos + 1);

        let needed = self.buf.len() + take;
        if needed > self.max_size {
            self.buf.clear();
            return Err(PacketError::TooLarge {
                size: needed,
                max: self.max_size,
            });
        }
        self.grow_to(needed);

        let (chunk, rest) = input.split_at(take);
        self.buf.extend_from_slice(chunk);
        *input = rest;

        if newline.is_some() {
            Ok(Some(self.buf.split().freeze()))
        } else {
            Ok(None)
        }
    }

    /// Double the logical capacity until `needed` fits, capped at the ceiling.
    fn grow_to(&mut self, needed: usize) {
        if needed <= self.capacity {
            return;
        }
        let mut capacity = self.capacity;
        while capacity < needed {
            capacity = capacity.saturating_mul(2).min(self.max_size);
        }
        self.capacity = capacity;
        self.buf.reserve(capacity - self.buf.len());
    }

    /// Bytes accumulated for the packet in progress.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Current logical buffer capacity.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
