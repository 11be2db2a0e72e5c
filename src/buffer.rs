//! Refcounted immutable byte ranges.
//!
//! A [`Buffer`] either owns its storage or is a zero-copy view onto
//! another buffer's storage. Views keep the parent storage alive; the
//! last handle to drop releases the storage (and runs the owner's drop,
//! if the buffer was built with [`Buffer::from_owner`]) exactly once.

use std::fmt;

use bytes::Bytes;

/// An immutable, refcounted byte range.
///
/// `Clone` retains (cheap, no copy). Dropping the last clone releases
/// the underlying storage.
#[derive(Clone, Default)]
pub struct Buffer {
    data: Bytes,
}

impl Buffer {
    /// Wrap owned storage.
    pub fn new(content: impl Into<Bytes>) -> Buffer {
        Buffer {
            data: content.into(),
        }
    }

    /// Wrap caller-owned storage without copying.
    ///
    /// The owner is dropped — its release logic runs exactly once — when
    /// the last `Buffer` referencing it (including views) is dropped.
    pub fn from_owner<T>(owner: T) -> Buffer
    where
        T: AsRef<[u8]> + Send + 'static,
    {
        Buffer {
            data: Bytes::from_owner(owner),
        }
    }

    /// Wrap a static byte slice.
    pub fn from_static(content: &'static [u8]) -> Buffer {
        Buffer {
            data: Bytes::from_static(content),
        }
    }

    /// Format into a freshly allocated buffer (the printf constructor).
    ///
    /// Usually called through `format_args!`:
    /// `Buffer::format(format_args!("{} {}", a, b))`.
    pub fn format(args: fmt::Arguments<'_>) -> Buffer {
        Buffer::new(fmt::format(args).into_bytes())
    }

    /// A zero-copy view of `len` bytes starting at `offset`.
    ///
    /// `offset` is clamped into `[0, self.len()]` and `len` into
    /// `[0, self.len() - offset]`; `len == 0` means "rest of the
    /// buffer". The view keeps the parent storage alive.
    pub fn view(&self, offset: usize, len: usize) -> Buffer {
        let offset = offset.min(self.data.len());
        let rest = self.data.len() - offset;
        let len = if len == 0 { rest } else { len.min(rest) };
        Buffer {
            data: self.data.slice(offset..offset + len),
        }
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The content as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(content: Vec<u8>) -> Buffer {
        Buffer::new(content)
    }
}

impl From<&'static str> for Buffer {
    fn from(content: &'static str) -> Buffer {
        Buffer::from_static(content.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Owner whose drop increments a counter — stands in for a release
    /// function.
    struct Tracked {
        bytes: Vec<u8>,
        drops: Arc<AtomicUsize>,
    }

    impl AsRef<[u8]> for Tracked {
        fn as_ref(&self) -> &[u8] {
            &self.bytes
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn retain_release_is_neutral() {
        let buffer = Buffer::new(b"hello".to_vec());
        let retained = buffer.clone();
        assert_eq!(retained.as_slice(), b"hello");
        drop(retained);
        assert_eq!(buffer.as_slice(), b"hello");
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn release_hook_runs_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let buffer = Buffer::from_owner(Tracked {
            bytes: b"payload".to_vec(),
            drops: drops.clone(),
        });
        let view = buffer.view(2, 3);
        assert_eq!(view.as_slice(), b"ylo");

        drop(buffer);
        // The view still holds the storage.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(view.as_slice(), b"ylo");

        drop(view);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn view_clamps_bounds() {
        let buffer = Buffer::new(b"abcdef".to_vec());
        assert_eq!(buffer.view(0, 0).as_slice(), b"abcdef");
        assert_eq!(buffer.view(2, 0).as_slice(), b"cdef");
        assert_eq!(buffer.view(2, 100).as_slice(), b"cdef");
        assert_eq!(buffer.view(100, 4).as_slice(), b"");
        assert_eq!(buffer.view(6, 0).as_slice(), b"");
    }

    #[test]
    fn view_of_view_resolves_through_parent() {
        let buffer = Buffer::new(b"0123456789".to_vec());
        let outer = buffer.view(2, 6); // "234567"
        let inner = outer.view(1, 3); // "345"
        assert_eq!(inner.as_slice(), b"345");
        drop(buffer);
        drop(outer);
        assert_eq!(inner.as_slice(), b"345");
    }

    #[test]
    fn format_allocates_fresh_storage() {
        let buffer = Buffer::format(format_args!("x={} y={}", 1, "two"));
        assert_eq!(buffer.as_slice(), b"x=1 y=two");
    }
}
