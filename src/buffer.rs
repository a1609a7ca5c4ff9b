//! Bounded protocol buffer with head and tail room.
//!
//! Every APDU this stack builds or parses lives in a [`BacnetBuf`]. The buffer
//! reserves [`HEADROOM`] bytes in front of the visible window so lower layers
//! can prepend their headers with [`BacnetBuf::push`] without copying, and
//! [`TAILROOM`] bytes behind the capacity limit. The capacity is fixed when
//! the buffer is initialised and can only shrink: a reply is bounded by the
//! peer's negotiated maximum APDU size and going past it is an error, never a
//! reallocation.
//!
//! # Example
//!
//! ```
//! use bacnet_session::buffer::BacnetBuf;
//!
//! let mut buf = BacnetBuf::new(50);
//! buf.put_slice(&[0x10, 0x08]).unwrap();
//! buf.push(2).unwrap().copy_from_slice(&[0x01, 0x20]);
//! assert_eq!(buf.data(), &[0x01, 0x20, 0x10, 0x08]);
//! buf.pull(2).unwrap();
//! assert_eq!(buf.data(), &[0x10, 0x08]);
//! ```

use bytes::Bytes;
use thiserror::Error;

/// Bytes reserved in front of the data window for lower-layer headers.
pub const HEADROOM: usize = 40;
/// Bytes reserved behind the capacity limit.
pub const TAILROOM: usize = 32;

/// Result type for buffer operations
pub type Result<T> = std::result::Result<T, BufferError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer overflow: {needed} bytes needed, {available} available")]
    Overflow { needed: usize, available: usize },
    #[error("cannot consume {requested} bytes from a window of {available}")]
    Underflow { requested: usize, available: usize },
    #[error("no headroom left to prepend {requested} bytes ({available} available)")]
    NoHeadroom { requested: usize, available: usize },
    #[error("buffer may only shrink: requested {requested}, capacity {capacity}")]
    Grow { requested: usize, capacity: usize },
}

/// Length-tracked byte buffer that never grows.
#[derive(Clone, PartialEq, Eq)]
pub struct BacnetBuf {
    storage: Box<[u8]>,
    /// Offset of the first visible byte.
    start: usize,
    len: usize,
    /// Offset one past the last writable byte.
    end: usize,
}

impl BacnetBuf {
    /// Allocates a buffer able to hold `size` bytes of payload.
    pub fn new(size: usize) -> Self {
        Self {
            storage: vec![0u8; HEADROOM + size + TAILROOM].into_boxed_slice(),
            start: HEADROOM,
            len: 0,
            end: HEADROOM + size,
        }
    }

    /// Builds a buffer holding a copy of `data`, sized exactly to it.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.storage[HEADROOM..HEADROOM + data.len()].copy_from_slice(data);
        buf.len = data.len();
        buf
    }

    /// Resets the window to `size` bytes of empty capacity behind the headroom.
    ///
    /// `size` may not exceed what the buffer was allocated with.
    pub fn init(&mut self, size: usize) -> Result<()> {
        let allocated = self.storage.len() - HEADROOM - TAILROOM;
        if size > allocated {
            return Err(BufferError::Grow {
                requested: size,
                capacity: allocated,
            });
        }
        self.start = HEADROOM;
        self.end = HEADROOM + size;
        self.len = 0;
        Ok(())
    }

    /// Shrinks the capacity measured from the current window start.
    pub fn resize(&mut self, size: usize) -> Result<()> {
        let capacity = self.capacity();
        if size > capacity {
            return Err(BufferError::Grow {
                requested: size,
                capacity,
            });
        }
        if size < self.len {
            return Err(BufferError::Overflow {
                needed: self.len,
                available: size,
            });
        }
        self.end = self.start + size;
        Ok(())
    }

    /// Extends the window backwards by `len` bytes and returns the new front.
    pub fn push(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > self.start {
            return Err(BufferError::NoHeadroom {
                requested: len,
                available: self.start,
            });
        }
        self.start -= len;
        self.len += len;
        Ok(&mut self.storage[self.start..self.start + len])
    }

    /// Consumes `len` bytes from the front of the window and returns them.
    pub fn pull(&mut self, len: usize) -> Result<&[u8]> {
        if len > self.len {
            return Err(BufferError::Underflow {
                requested: len,
                available: self.len,
            });
        }
        let from = self.start;
        self.start += len;
        self.len -= len;
        Ok(&self.storage[from..from + len])
    }

    /// Appends one byte.
    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_slice(&[value])
    }

    /// Appends `data`, failing without writing anything if it does not fit.
    pub fn put_slice(&mut self, data: &[u8]) -> Result<()> {
        self.ensure(data.len())?;
        let at = self.start + self.len;
        self.storage[at..at + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Fails unless `additional` more bytes fit before the capacity limit.
    pub fn ensure(&self, additional: usize) -> Result<()> {
        let available = self.remaining();
        if additional > available {
            return Err(BufferError::Overflow {
                needed: additional,
                available,
            });
        }
        Ok(())
    }

    /// Drops everything past the first `len` bytes of the window.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Empties the window, keeping its position and capacity.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn data(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes between the window start and the capacity limit.
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    pub fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.len)
    }

    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Copies the visible window into an immutable, shareable frame.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.data())
    }
}

impl std::fmt::Debug for BacnetBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacnetBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("headroom", &self.start)
            .field("data", &hex::encode(self.data()))
            .finish()
    }
}

impl AsRef<[u8]> for BacnetBuf {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}
