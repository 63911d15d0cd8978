//! Typed views over guest linear memory.
//!
//! A view borrows the current memory buffer, so the borrow checker already
//! rules out a view outliving a growth of that buffer. [`MemoryViews`] only
//! records the identity (base address and length) of the buffer each view
//! kind was last built over, for observability: a changed or empty identity
//! counts as a rebuild in [`MemoryViews::rebuilds`] and is traced.

use std::marker::PhantomData;

use tether_types::{BridgeError, BridgeResult};
use tracing::trace;

/// Mask a guest-supplied 32-bit offset as unsigned.
#[inline]
pub const fn guest_offset(raw: i32) -> u32 {
    raw as u32
}

/// An element type a view can address.
pub trait Element: Copy {
    const WIDTH: usize;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_element {
    ($($ty:ty),*) => {$(
        impl Element for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::WIDTH]);
                <$ty>::from_le_bytes(raw)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_element!(u8, i32, u32, f32, f64);

/// An element-addressed window over a memory buffer.
///
/// `B` is `&[u8]` for a read-only view and `&mut [u8]` for a writable one.
/// Pointers are byte offsets, element `i` lives at byte `i * T::WIDTH`.
pub struct View<B, T> {
    buf: B,
    _elem: PhantomData<T>,
}

impl<B: AsRef<[u8]>, T: Element> View<B, T> {
    fn new(buf: B) -> Self {
        Self {
            buf,
            _elem: PhantomData,
        }
    }

    /// Number of whole elements in the view.
    pub fn len(&self) -> usize {
        self.buf.as_ref().len() / T::WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.buf.as_ref().len()
    }

    /// Element at `index`.
    pub fn get(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(T::WIDTH)?;
        let bytes = self.buf.as_ref().get(start..start + T::WIDTH)?;
        Some(T::read_le(bytes))
    }

    /// The raw bytes behind `len` elements starting at byte offset `ptr`.
    pub fn subarray(&self, ptr: u32, len: u32) -> BridgeResult<&[u8]> {
        let (start, byte_len) = self.locate(ptr, len)?;
        Ok(&self.buf.as_ref()[start..start + byte_len])
    }

    /// Copy `len` elements starting at byte offset `ptr` out of the view.
    pub fn read(&self, ptr: u32, len: u32) -> BridgeResult<Vec<T>> {
        Ok(self
            .subarray(ptr, len)?
            .chunks_exact(T::WIDTH)
            .map(T::read_le)
            .collect())
    }

    fn locate(&self, ptr: u32, len: u32) -> BridgeResult<(usize, usize)> {
        if ptr as usize % T::WIDTH != 0 {
            return Err(BridgeError::Misaligned {
                ptr,
                width: T::WIDTH,
            });
        }
        let start = ptr as usize;
        let byte_len = (len as usize)
            .checked_mul(T::WIDTH)
            .ok_or(BridgeError::OutOfBounds {
                offset: start,
                len: usize::MAX,
                memory_len: self.byte_len(),
            })?;
        BridgeError::check_bounds(start, byte_len, self.byte_len())?;
        Ok((start, byte_len))
    }
}

impl<'m, T: Element> View<&'m [u8], T> {
    /// Like [`View::subarray`], but the slice borrows the underlying memory
    /// rather than the view.
    pub fn into_subarray(self, ptr: u32, len: u32) -> BridgeResult<&'m [u8]> {
        let (start, byte_len) = self.locate(ptr, len)?;
        Ok(&self.buf[start..start + byte_len])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>, T: Element> View<B, T> {
    /// Overwrite element `index`.
    pub fn set(&mut self, index: usize, value: T) -> BridgeResult<()> {
        let start = index.saturating_mul(T::WIDTH);
        BridgeError::check_bounds(start, T::WIDTH, self.byte_len())?;
        value.write_le(&mut self.buf.as_mut()[start..]);
        Ok(())
    }

    /// Copy `values` into the view starting at byte offset `ptr`.
    pub fn write(&mut self, ptr: u32, values: &[T]) -> BridgeResult<()> {
        let len = u32::try_from(values.len()).map_err(|_| BridgeError::OutOfBounds {
            offset: ptr as usize,
            len: values.len(),
            memory_len: self.byte_len(),
        })?;
        let (start, byte_len) = self.locate(ptr, len)?;
        let out = &mut self.buf.as_mut()[start..start + byte_len];
        for (chunk, value) in out.chunks_exact_mut(T::WIDTH).zip(values) {
            value.write_le(chunk);
        }
        Ok(())
    }
}

/// Byte-addressed little-endian access, used for out-parameters.
pub struct DataView<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> DataView<B> {
    pub fn byte_len(&self) -> usize {
        self.buf.as_ref().len()
    }

    fn get<T: Element>(&self, offset: u32) -> BridgeResult<T> {
        let start = offset as usize;
        BridgeError::check_bounds(start, T::WIDTH, self.byte_len())?;
        Ok(T::read_le(&self.buf.as_ref()[start..]))
    }

    pub fn get_i32(&self, offset: u32) -> BridgeResult<i32> {
        self.get(offset)
    }

    pub fn get_u32(&self, offset: u32) -> BridgeResult<u32> {
        self.get(offset)
    }

    pub fn get_f64(&self, offset: u32) -> BridgeResult<f64> {
        self.get(offset)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> DataView<B> {
    fn set<T: Element>(&mut self, offset: u32, value: T) -> BridgeResult<()> {
        let start = offset as usize;
        BridgeError::check_bounds(start, T::WIDTH, self.byte_len())?;
        value.write_le(&mut self.buf.as_mut()[start..]);
        Ok(())
    }

    pub fn set_i32(&mut self, offset: u32, value: i32) -> BridgeResult<()> {
        self.set(offset, value)
    }

    pub fn set_u32(&mut self, offset: u32, value: u32) -> BridgeResult<()> {
        self.set(offset, value)
    }

    pub fn set_f64(&mut self, offset: u32, value: f64) -> BridgeResult<()> {
        self.set(offset, value)
    }
}

/// Identity of a memory buffer: where it starts and how long it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferId {
    base: usize,
    len: usize,
}

impl BufferId {
    fn of(mem: &[u8]) -> Self {
        Self {
            base: mem.as_ptr() as usize,
            len: mem.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewKind {
    Bytes,
    Words,
    UWords,
    Floats,
    Data,
}

const VIEW_KINDS: usize = 5;

/// Per-instance cache of memory view identities.
#[derive(Debug, Default)]
pub struct MemoryViews {
    cached: [Option<BufferId>; VIEW_KINDS],
    rebuilds: u64,
}

impl MemoryViews {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte view.
    pub fn bytes<'m>(&mut self, mem: &'m [u8]) -> View<&'m [u8], u8> {
        self.revalidate(ViewKind::Bytes, mem);
        View::new(mem)
    }

    pub fn bytes_mut<'m>(&mut self, mem: &'m mut [u8]) -> View<&'m mut [u8], u8> {
        self.revalidate(ViewKind::Bytes, mem);
        View::new(mem)
    }

    /// Signed 32-bit view.
    pub fn words32<'m>(&mut self, mem: &'m [u8]) -> View<&'m [u8], i32> {
        self.revalidate(ViewKind::Words, mem);
        View::new(mem)
    }

    pub fn words32_mut<'m>(&mut self, mem: &'m mut [u8]) -> View<&'m mut [u8], i32> {
        self.revalidate(ViewKind::Words, mem);
        View::new(mem)
    }

    /// Unsigned 32-bit view.
    pub fn uwords32<'m>(&mut self, mem: &'m [u8]) -> View<&'m [u8], u32> {
        self.revalidate(ViewKind::UWords, mem);
        View::new(mem)
    }

    pub fn uwords32_mut<'m>(&mut self, mem: &'m mut [u8]) -> View<&'m mut [u8], u32> {
        self.revalidate(ViewKind::UWords, mem);
        View::new(mem)
    }

    /// 32-bit float view.
    pub fn floats32<'m>(&mut self, mem: &'m [u8]) -> View<&'m [u8], f32> {
        self.revalidate(ViewKind::Floats, mem);
        View::new(mem)
    }

    pub fn floats32_mut<'m>(&mut self, mem: &'m mut [u8]) -> View<&'m mut [u8], f32> {
        self.revalidate(ViewKind::Floats, mem);
        View::new(mem)
    }

    pub fn data_view<'m>(&mut self, mem: &'m [u8]) -> DataView<&'m [u8]> {
        self.revalidate(ViewKind::Data, mem);
        DataView { buf: mem }
    }

    pub fn data_view_mut<'m>(&mut self, mem: &'m mut [u8]) -> DataView<&'m mut [u8]> {
        self.revalidate(ViewKind::Data, mem);
        DataView { buf: mem }
    }

    /// Forget every cached view. Call after anything that may have grown memory.
    pub fn invalidate(&mut self) {
        self.cached = [None; VIEW_KINDS];
    }

    /// How many times a view has been (re)built over a new buffer.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    fn revalidate(&mut self, kind: ViewKind, mem: &[u8]) {
        let current = BufferId::of(mem);
        let slot = &mut self.cached[kind as usize];
        let fresh = matches!(slot, Some(cached) if cached.len != 0 && *cached == current);
        if !fresh {
            trace!(?kind, len = current.len, "rebuilding memory view");
            *slot = Some(current);
            self.rebuilds += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_subarray_outlives_the_view() {
        let mem = b"hello world".to_vec();
        let mut views = MemoryViews::new();
        let word = views.bytes(&mem).into_subarray(6, 5).unwrap();
        views.invalidate();
        assert_eq!(word, b"world");
        assert!(views.bytes(&mem).into_subarray(8, 4).is_err());
    }

    #[test]
    fn guest_offset_reinterprets_negative_pointers() {
        assert_eq!(guest_offset(16), 16);
        assert_eq!(guest_offset(-1), u32::MAX);
    }

    #[test]
    fn cached_view_is_reused_while_buffer_is_unchanged() {
        let mem = vec![0u8; 64];
        let mut views = MemoryViews::new();
        assert_eq!(views.bytes(&mem).len(), 64);
        assert_eq!(views.bytes(&mem).len(), 64);
        assert_eq!(views.rebuilds(), 1);
    }

    #[test]
    fn each_view_kind_is_cached_separately() {
        let mem = vec![0u8; 64];
        let mut views = MemoryViews::new();
        views.bytes(&mem);
        views.words32(&mem);
        views.floats32(&mem);
        views.words32(&mem);
        assert_eq!(views.rebuilds(), 3);
    }

    #[test]
    fn empty_buffer_is_never_trusted() {
        let mem: Vec<u8> = Vec::new();
        let mut views = MemoryViews::new();
        views.bytes(&mem);
        views.bytes(&mem);
        assert_eq!(views.rebuilds(), 2);
    }

    #[test]
    fn invalidate_forces_rebuild() {
        let mem = vec![0u8; 8];
        let mut views = MemoryViews::new();
        views.bytes(&mem);
        views.invalidate();
        views.bytes(&mem);
        assert_eq!(views.rebuilds(), 2);
    }

    #[test]
    fn typed_read_uses_byte_pointer() {
        let mut mem = vec![0u8; 16];
        let mut views = MemoryViews::new();
        views.words32_mut(&mut mem).write(8, &[-7, 9]).unwrap();
        assert_eq!(views.words32(&mem).read(8, 2).unwrap(), vec![-7, 9]);
        assert_eq!(views.words32(&mem).get(2), Some(-7));
        assert_eq!(views.uwords32(&mem).get(2), Some(-7i32 as u32));
    }

    #[test]
    fn misaligned_and_out_of_bounds_are_rejected() {
        let mem = vec![0u8; 16];
        let mut views = MemoryViews::new();
        assert!(matches!(
            views.floats32(&mem).read(2, 1),
            Err(BridgeError::Misaligned { ptr: 2, width: 4 })
        ));
        assert!(matches!(
            views.floats32(&mem).read(12, 2),
            Err(BridgeError::OutOfBounds { .. })
        ));
        assert!(views.bytes(&mem).subarray(16, 0).unwrap().is_empty());
    }

    #[test]
    fn data_view_round_trips_words() {
        let mut mem = vec![0u8; 16];
        let mut views = MemoryViews::new();
        let mut dv = views.data_view_mut(&mut mem);
        dv.set_i32(0, 42).unwrap();
        dv.set_f64(8, 2.5).unwrap();
        assert!(dv.set_i32(14, 1).is_err());
        let dv = views.data_view(&mem);
        assert_eq!(dv.get_i32(0).unwrap(), 42);
        assert_eq!(dv.get_f64(8).unwrap(), 2.5);
    }

    #[test]
    fn guest_offsets_are_unsigned() {
        assert_eq!(guest_offset(-4), 0xffff_fffc);
    }
}
