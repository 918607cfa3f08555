//! Incoming-message buffer descriptor.

use crate::{MAX_MESSAGE_BPAGES, MAX_MESSAGE_LENGTH};

/// The list of bpage offsets backing one incoming message.
///
/// The transport creates one of these per incoming message, hands it to
/// [`BufferPool::allocate`](crate::BufferPool::allocate) to fill, reads
/// data pointers back out via
/// [`BufferPool::get_buffer`](crate::BufferPool::get_buffer), and finally
/// passes [`offsets`](Self::offsets) to
/// [`BufferPool::release_buffers`](crate::BufferPool::release_buffers)
/// when the message has been consumed.
///
/// Each offset is a byte offset into the pool's region. Every entry but
/// the last addresses the start of a full bpage; the last may point into
/// the middle of a partial bpage shared with other messages from the same
/// core.
#[derive(Clone)]
pub struct MessageBuffers {
    /// Total message length in bytes.
    length: usize,
    /// Number of valid entries in `bpage_offsets`.
    num_bpages: usize,
    /// Region byte offsets, one per bpage backing the message.
    bpage_offsets: [u32; MAX_MESSAGE_BPAGES],
}

impl MessageBuffers {
    /// Create an empty descriptor for a message of `length` bytes.
    ///
    /// No buffer space is reserved until the descriptor is passed to
    /// `BufferPool::allocate`.
    ///
    /// # Panics
    ///
    /// Panics if `length` exceeds [`MAX_MESSAGE_LENGTH`]; the transport's
    /// protocol layer is responsible for rejecting oversized messages
    /// before buffers come into play.
    pub fn new(length: usize) -> Self {
        assert!(
            length <= MAX_MESSAGE_LENGTH,
            "message length {length} exceeds maximum {MAX_MESSAGE_LENGTH}"
        );
        Self {
            length,
            num_bpages: 0,
            bpage_offsets: [0; MAX_MESSAGE_BPAGES],
        }
    }

    /// Total message length in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Number of bpages currently backing the message.
    ///
    /// Zero until `allocate` succeeds, and reset to zero if it fails.
    #[inline]
    pub fn num_bpages(&self) -> usize {
        self.num_bpages
    }

    /// The region byte offsets backing the message, one per bpage.
    #[inline]
    pub fn offsets(&self) -> &[u32] {
        &self.bpage_offsets[..self.num_bpages]
    }

    /// Returns true if no buffer space is attached.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_bpages == 0
    }

    /// Drop all recorded offsets (the backing refs are the pool's business).
    pub(crate) fn clear(&mut self) {
        self.num_bpages = 0;
    }

    /// Append one bpage offset.
    pub(crate) fn push_offset(&mut self, offset: u32) {
        debug_assert!(self.num_bpages < MAX_MESSAGE_BPAGES);
        self.bpage_offsets[self.num_bpages] = offset;
        self.num_bpages += 1;
    }
}

impl std::fmt::Debug for MessageBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffers")
            .field("length", &self.length)
            .field("num_bpages", &self.num_bpages)
            .field("offsets", &self.offsets())
            .finish()
    }
}
