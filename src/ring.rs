//! Ring buffer used by the channel waiter queues and the `chan::buffer`
//! pipeline stage.
//!
//! Storage is always a power of two so wraparound is a mask. A bounded
//! buffer still rounds its storage up to a power of two and tracks the
//! logical capacity separately. An unbounded buffer doubles its storage
//! when full, move-constructing the live elements into the fresh
//! allocation.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::mem;
use std::ptr;

use rand::Rng;

/// Unbounded capacity marker, matching `usize::MAX`.
pub const UNBOUNDED: usize = usize::MAX;

pub struct RingBuffer<T> {
    data: *mut T,
    size: usize, // power of two
    front: usize,
    len: usize,
    capacity: usize, // UNBOUNDED or a fixed logical bound
}

impl<T> RingBuffer<T> {
    /// Creates an unbounded buffer.
    pub fn new() -> Self {
        Self::with_capacity(UNBOUNDED)
    }

    /// Creates a buffer holding at most `capacity` elements
    /// (`UNBOUNDED` for no limit).
    pub fn with_capacity(capacity: usize) -> Self {
        let size = if capacity == UNBOUNDED {
            4
        } else {
            capacity.max(1).next_power_of_two()
        };
        RingBuffer {
            data: Self::allocate(size),
            size,
            front: 0,
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    pub fn front(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            // SAFETY: slot `front` holds an initialized element when len > 0.
            Some(unsafe { &*self.slot(0) })
        }
    }

    pub fn push(&mut self, value: T) {
        assert!(self.len < self.capacity, "ring buffer full");
        if self.len == self.size {
            self.grow();
        }
        // SAFETY: the slot past the last element is allocated and vacant.
        unsafe { ptr::write(self.slot(self.len), value) };
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: slot `front` holds an initialized element; reading it
        // out leaves the slot vacant and we advance past it.
        let value = unsafe { ptr::read(self.slot(0)) };
        self.front = (self.front + 1) & (self.size - 1);
        self.len -= 1;
        Some(value)
    }

    /// Removes the first element equal to `value`. A hole in the middle
    /// is filled by pulling the front or back element, chosen at random
    /// so neither end is systematically favored.
    pub fn remove(&mut self, value: &T) -> bool
    where
        T: PartialEq,
    {
        for i in 0..self.len {
            // SAFETY: indices 0..len are initialized.
            if unsafe { &*self.slot(i) } != value {
                continue;
            }
            unsafe {
                if i == 0 {
                    ptr::drop_in_place(self.slot(0));
                    self.front = (self.front + 1) & (self.size - 1);
                } else if i == self.len - 1 {
                    ptr::drop_in_place(self.slot(i));
                } else if rand::thread_rng().gen::<bool>() {
                    let hole = self.slot(i);
                    ptr::drop_in_place(hole);
                    ptr::write(hole, ptr::read(self.slot(0)));
                    self.front = (self.front + 1) & (self.size - 1);
                } else {
                    let hole = self.slot(i);
                    ptr::drop_in_place(hole);
                    ptr::write(hole, ptr::read(self.slot(self.len - 1)));
                }
            }
            self.len -= 1;
            return true;
        }
        false
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            buffer: self,
            index: 0,
        }
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    fn slot(&self, logical: usize) -> *mut T {
        let physical = (self.front + logical) & (self.size - 1);
        if mem::size_of::<T>() == 0 {
            self.data
        } else {
            // SAFETY: physical < size, inside the allocation.
            unsafe { self.data.add(physical) }
        }
    }

    fn grow(&mut self) {
        debug_assert_eq!(self.capacity, UNBOUNDED);
        let new_size = self.size * 2;
        let new_data = Self::allocate(new_size);
        for i in 0..self.len {
            // SAFETY: reading each live element exactly once into the
            // fresh uninitialized allocation; the old slots are not
            // dropped afterwards, only deallocated.
            unsafe { ptr::write(new_data.add(i), ptr::read(self.slot(i))) };
        }
        Self::deallocate(self.data, self.size);
        self.data = new_data;
        self.size = new_size;
        self.front = 0;
    }

    fn allocate(size: usize) -> *mut T {
        if mem::size_of::<T>() == 0 {
            return ptr::NonNull::dangling().as_ptr();
        }
        let layout = Layout::array::<T>(size).expect("ring buffer layout overflow");
        // SAFETY: layout is non-zero-sized here.
        let p = unsafe { alloc(layout) } as *mut T;
        if p.is_null() {
            handle_alloc_error(layout);
        }
        p
    }

    fn deallocate(data: *mut T, size: usize) {
        if mem::size_of::<T>() == 0 {
            return;
        }
        let layout = Layout::array::<T>(size).expect("ring buffer layout overflow");
        // SAFETY: `data` was allocated with this exact layout.
        unsafe { dealloc(data as *mut u8, layout) };
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.clear();
        Self::deallocate(self.data, self.size);
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the buffer owns its elements; sending it moves them wholesale.
unsafe impl<T: Send> Send for RingBuffer<T> {}

pub struct Iter<'a, T> {
    buffer: &'a RingBuffer<T>,
    index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.index >= self.buffer.len {
            return None;
        }
        // SAFETY: indices 0..len are initialized.
        let item = unsafe { &*self.buffer.slot(self.index) };
        self.index += 1;
        Some(item)
    }
}
