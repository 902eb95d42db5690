//! Element buffers used for protocol I/O.
//!
//! A [`Buffer`] either owns a heap allocation or is a view over memory the
//! caller owns. The storage tag is fixed when the storage is created; the only
//! way a buffer changes from one kind to the other is by replacing its storage
//! wholesale through [`Buffer::wrap`] or [`Buffer::reserve`].
//!
//! The buffer keeps two cursors. The write cursor is the logical length: the
//! number of valid elements. The read cursor trails it and is advanced by
//! [`Buffer::read`]. Capacity is the number of elements in the storage.
//!
//! All fallible operations return [`Error::InvalidArgument`] for misuse and
//! [`Error::OutOfMemory`] when an allocation cannot be satisfied. Nothing is
//! ever silently truncated.

use crate::error::{Error, Result};
use std::io::Read;
use std::ops::Deref;

#[derive(Debug, Clone, PartialEq)]
enum Storage<'a, T> {
    Owned(Vec<T>),
    Borrowed(&'a [T]),
}

/// Owned-or-borrowed element buffer with read/write cursors.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer<'a, T> {
    storage: Storage<'a, T>,
    len: usize,
    read_pos: usize,
}

fn allocate<T: Copy>(len: usize, fill: T) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory { requested: len })?;
    data.resize(len, fill);
    Ok(data)
}

fn checked_len(len: i64) -> Result<usize> {
    usize::try_from(len)
        .map_err(|_| Error::invalid(format!("buffer length must not be negative, got {len}")))
}

impl<T: Copy + Default> Default for Buffer<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: Copy + Default> Buffer<'a, T> {
    /// An owning buffer with no allocation.
    pub fn new() -> Self {
        Self {
            storage: Storage::Owned(Vec::new()),
            len: 0,
            read_pos: 0,
        }
    }

    /// Allocate `len` default elements.
    pub fn owned(len: i64) -> Result<Self> {
        Self::owned_filled(len, T::default())
    }

    /// Allocate `len` elements, each set to `value`.
    pub fn owned_filled(len: i64, value: T) -> Result<Self> {
        let len = checked_len(len)?;
        Ok(Self {
            storage: Storage::Owned(allocate(len, value)?),
            len,
            read_pos: 0,
        })
    }

    /// View caller memory. Dropping the buffer never frees it.
    pub fn borrowed(data: &'a [T]) -> Self {
        Self {
            storage: Storage::Borrowed(data),
            len: data.len(),
            read_pos: 0,
        }
    }

    /// Allocate `data.len()` elements and copy `data` into them.
    pub fn copy_from(data: &[T]) -> Result<Self> {
        let mut storage = allocate(data.len(), T::default())?;
        storage.copy_from_slice(data);
        Ok(Self {
            storage: Storage::Owned(storage),
            len: data.len(),
            read_pos: 0,
        })
    }

    /// Copy `data[..size]` into the buffer.
    ///
    /// An unallocated buffer allocates exactly `size` elements. An allocated
    /// buffer requires `size` to equal its capacity.
    pub fn assign(&mut self, data: &[T], size: usize) -> Result<()> {
        if size > data.len() {
            return Err(Error::invalid(format!(
                "assign of {size} elements from a source of {}",
                data.len()
            )));
        }
        let source = &data[..size];
        if self.capacity() == 0 {
            let mut storage = allocate(size, T::default())?;
            storage.copy_from_slice(source);
            self.storage = Storage::Owned(storage);
        } else {
            if size != self.capacity() {
                return Err(Error::invalid(format!(
                    "assign of {size} elements into a buffer of capacity {}",
                    self.capacity()
                )));
            }
            match &mut self.storage {
                Storage::Owned(storage) => storage.copy_from_slice(source),
                Storage::Borrowed(_) => {
                    return Err(Error::invalid("cannot assign into a borrowed buffer"));
                }
            }
        }
        self.len = size;
        self.read_pos = 0;
        Ok(())
    }

    /// Release any owned storage and view `data[..size]` instead.
    ///
    /// `None` yields an empty view whatever `size` is.
    pub fn wrap(&mut self, data: Option<&'a [T]>, size: usize) -> Result<()> {
        let view = match data {
            Some(data) if size > data.len() => {
                return Err(Error::invalid(format!(
                    "wrap of {size} elements over a slice of {}",
                    data.len()
                )));
            }
            Some(data) => &data[..size],
            None => &[],
        };
        self.storage = Storage::Borrowed(view);
        self.len = view.len();
        self.read_pos = 0;
        Ok(())
    }

    /// Make room for a fresh write of `size` elements.
    ///
    /// Reallocates only when the current capacity is smaller or the storage
    /// is a read-only view. Old contents are discarded and both cursors
    /// reset either way, so `size` elements always fit afterwards.
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        if self.capacity() < size || !self.is_owned() {
            self.storage = Storage::Owned(allocate(size, T::default())?);
        }
        self.len = 0;
        self.read_pos = 0;
        Ok(())
    }

    /// Make room for `additional` more elements after the write cursor,
    /// keeping the contents and both cursors.
    pub fn grow(&mut self, additional: usize) -> Result<()> {
        let needed = self
            .len
            .checked_add(additional)
            .ok_or(Error::OutOfMemory {
                requested: usize::MAX,
            })?;
        if needed <= self.capacity() {
            return Ok(());
        }
        match &mut self.storage {
            Storage::Owned(storage) => {
                storage
                    .try_reserve_exact(needed - storage.len())
                    .map_err(|_| Error::OutOfMemory { requested: needed })?;
                storage.resize(needed, T::default());
                Ok(())
            }
            Storage::Borrowed(_) => Err(Error::invalid("cannot grow a borrowed buffer")),
        }
    }

    /// Append `data` at the write cursor.
    pub fn write(&mut self, data: &[T]) -> Result<()> {
        let end = self
            .len
            .checked_add(data.len())
            .filter(|end| *end <= self.capacity())
            .ok_or_else(|| {
                Error::invalid(format!(
                    "write of {} elements at {} exceeds capacity {}",
                    data.len(),
                    self.len,
                    self.capacity()
                ))
            })?;
        match &mut self.storage {
            Storage::Owned(storage) => storage[self.len..end].copy_from_slice(data),
            Storage::Borrowed(_) => {
                return Err(Error::invalid("cannot write into a borrowed buffer"));
            }
        }
        self.len = end;
        Ok(())
    }

    /// Take the next `n` written elements.
    pub fn read(&mut self, n: usize) -> Result<&[T]> {
        let end = self
            .read_pos
            .checked_add(n)
            .filter(|end| *end <= self.len)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "read of {n} elements at {} exceeds length {}",
                    self.read_pos, self.len
                ))
            })?;
        let start = self.read_pos;
        self.read_pos = end;
        Ok(&self.as_slice_full()[start..end])
    }

    /// Reset both cursors. Capacity is kept.
    pub fn clear(&mut self) {
        self.len = 0;
        self.read_pos = 0;
    }

    /// The valid elements.
    pub fn as_slice(&self) -> &[T] {
        &self.as_slice_full()[..self.len]
    }

    /// Elements not yet consumed by [`Buffer::read`].
    pub fn remaining(&self) -> &[T] {
        &self.as_slice_full()[self.read_pos..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.as_slice_full().len()
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    fn as_slice_full(&self) -> &[T] {
        match &self.storage {
            Storage::Owned(storage) => storage,
            Storage::Borrowed(view) => view,
        }
    }
}

impl<T: Copy + Default> Deref for Buffer<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl Buffer<'_, u8> {
    /// Read exactly `n` bytes from `reader`, appending at the write cursor.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R, n: usize) -> Result<()> {
        let end = self
            .len
            .checked_add(n)
            .filter(|end| *end <= self.capacity())
            .ok_or_else(|| {
                Error::invalid(format!(
                    "fill of {n} bytes at {} exceeds capacity {}",
                    self.len,
                    self.capacity()
                ))
            })?;
        match &mut self.storage {
            Storage::Owned(storage) => reader.read_exact(&mut storage[self.len..end])?,
            Storage::Borrowed(_) => {
                return Err(Error::invalid("cannot fill a borrowed buffer"));
            }
        }
        self.len = end;
        Ok(())
    }
}
