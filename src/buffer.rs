//! Progress-tracking byte buffers for non-blocking transports.
//!
//! Non-blocking I/O never guarantees a full transfer, so both directions
//! need a container that remembers how far the transport got:
//!
//! - [`InputBuffer`] accumulates reads into a geometrically growing arena
//!   bounded by a hard capacity ceiling.
//! - [`OutputBuffer`] holds one outbound payload plus the cursor of bytes
//!   already flushed.
//!
//! Neither buffer loops. Each `*_with` call makes exactly one transport
//! attempt through the supplied closure and records its progress; the
//! owning transport decides whether to call again. This keeps the buffers
//! transport-agnostic — the same `InputBuffer` is filled by `libc::read`
//! on a plain socket and by a rustls session reader on a TLS one.

use std::io;

/// Default growth trigger: grow when free space drops below this.
pub const DEFAULT_MIN_SIZE_AVAIL: usize = 100;
/// Default initial arena capacity.
pub const DEFAULT_CAPACITY: usize = 10 * 1024;
/// Default hard ceiling on arena capacity.
pub const DEFAULT_MAX_CAPACITY: usize = 1024 * 1024;

/// Growable receive buffer for one connection.
///
/// Invariants: `size <= capacity <= max_capacity`. The arena grows only
/// when free space falls below `min_size_avail`, doubling (at least) up to
/// `max_capacity`; a growth request that cannot strictly increase capacity
/// is reported as [`io::ErrorKind::OutOfMemory`] rather than silently
/// truncating the read.
pub struct InputBuffer {
    data: Vec<u8>,
    size: usize,
    min_size_avail: usize,
    max_capacity: usize,
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SIZE_AVAIL, DEFAULT_CAPACITY, DEFAULT_MAX_CAPACITY)
    }
}

impl InputBuffer {
    /// Create a buffer with an initial `capacity`, growing whenever free
    /// space drops below `min_size_avail`, never past `max_capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity > max_capacity` or `min_size_avail == 0`; both
    /// are configuration bugs, not runtime conditions.
    pub fn new(min_size_avail: usize, capacity: usize, max_capacity: usize) -> Self {
        assert!(
            capacity <= max_capacity,
            "initial capacity {capacity} exceeds max capacity {max_capacity}"
        );
        assert!(min_size_avail > 0, "min_size_avail must be non-zero");
        Self {
            data: vec![0; capacity],
            size: 0,
            min_size_avail,
            max_capacity,
        }
    }

    /// Bytes currently holding valid data.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current arena length.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The valid prefix `[0, size)`.
    pub fn get(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// Drop the first `n` bytes and shift the unconsumed tail to offset 0.
    ///
    /// Used after a consumer has processed a prefix, e.g. one HTTP message
    /// out of a pipelined buffer.
    ///
    /// # Panics
    ///
    /// Panics if `n > size()`.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.size, "consume({n}) beyond valid size {}", self.size);
        self.data.copy_within(n..self.size, 0);
        self.size -= n;
    }

    /// Make one transport read attempt into the free tail.
    ///
    /// Grows first if free space is below the trigger; a saturated buffer
    /// fails with [`io::ErrorKind::OutOfMemory`] before the closure runs,
    /// leaving the buffer untouched. On `Ok(n)` the valid size advances by
    /// `n`; `Ok(0)` (peer closed) and `Err` pass through unchanged.
    pub fn read_with<F>(&mut self, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        if self.capacity() - self.size < self.min_size_avail {
            self.grow()?;
        }
        let n = read(&mut self.data[self.size..])?;
        debug_assert!(n <= self.capacity() - self.size);
        self.size += n;
        Ok(n)
    }

    /// Grow to `min(max_capacity, max(capacity + min_size_avail, capacity * 2))`.
    fn grow(&mut self) -> io::Result<()> {
        let cur = self.capacity();
        let new_cap = self
            .max_capacity
            .min((cur + self.min_size_avail).max(cur * 2));
        if new_cap <= cur {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("input buffer saturated at {} bytes", self.max_capacity),
            ));
        }
        self.data.resize(new_cap, 0);
        Ok(())
    }
}

/// Outbound payload with a flush cursor.
///
/// Constructed per message, consumed across one or more non-blocking write
/// attempts. `finished()` holds once every byte has been handed to the
/// transport.
#[derive(Default)]
pub struct OutputBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl OutputBuffer {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            data: payload.into(),
            offset: 0,
        }
    }

    /// All bytes flushed?
    pub fn finished(&self) -> bool {
        self.offset == self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total payload length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Bytes already flushed.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The unflushed tail `[offset, len)`.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    /// Reset to an empty, unwritten state for reuse.
    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
    }

    /// Replace the payload and rewind the cursor.
    pub fn reset(&mut self, payload: impl Into<Vec<u8>>) {
        self.data = payload.into();
        self.offset = 0;
    }

    /// Make one transport write attempt over the unflushed tail.
    ///
    /// On `Ok(n)` the cursor advances by `n`; `Ok(0)` and `Err` pass
    /// through unchanged.
    pub fn write_with<F>(&mut self, write: F) -> io::Result<usize>
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        let n = write(&self.data[self.offset..])?;
        debug_assert!(n <= self.data.len() - self.offset);
        self.offset += n;
        Ok(n)
    }
}
