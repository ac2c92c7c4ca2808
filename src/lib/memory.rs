//! The core accounting allocator and its per-allocation metadata

use std::{
  alloc::{ alloc as heap_alloc, dealloc as heap_dealloc, Layout },
  mem::{ align_of, size_of },
  ptr::{ self, NonNull },
};

use bitflags::bitflags;
use thiserror::Error;

use crate::{
  static_assert,
  sync::Mutex,
  utils::{ bool_str, get_align_offset },
};


bitflags! {
  /// Metadata flags describing how an allocation is to be treated
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct AllocFlags: u8 {
    /// Has this address been freed?
    const FREE = 1 << 0;
    /// Is this address marked const? [unenforced]
    const CONST = 1 << 1;
    /// Was this address allocated for the VM itself rather than for an object?
    const SYSTEM = 1 << 2;
    /// Is this address not vital to the VM?
    const NON_VITAL = 1 << 3;
    /// Was this address produced through the hybrid allocator?
    const HYBRID = 1 << 4;
    /// Was this address produced through a linear allocator?
    const LINEAR = 1 << 5;
  }
}

/// Default flags for object allocations
pub const DEFAULT_ALLOC_FLAGS: AllocFlags = AllocFlags::empty();

/// Flags for allocations owned by the VM itself
pub const SYSTEM_ALLOC_FLAGS: AllocFlags = AllocFlags::SYSTEM;


/// Metadata immediately preceding every live allocation.
///
/// Given a payload pointer `p`, the header lives at `p - size_of::<AllocationHeader>()`.
/// The `(size, padding, flags)` triple is fixed at allocation time; only the
/// FREE flag bit may change afterwards
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
pub struct AllocationHeader {
  /// Bytes requested by the caller, excluding the header and padding
  pub size: u32,
  /// Trailing padding bytes keeping consecutive allocations pointer-aligned
  pub padding: u16,
  /// Metadata flags
  pub flags: AllocFlags,
}

static_assert!(size_of::<AllocationHeader>() == 8);
static_assert!(align_of::<AllocationHeader>() == align_of::<*const u8>());

impl AllocationHeader {
  /// Compute the number of padding bytes appended to an allocation of
  /// `size` bytes so that the next contiguous header slot is pointer-aligned
  pub fn compute_padding (size: u32) -> u16 {
    get_align_offset(size as usize, align_of::<AllocationHeader>()) as u16
  }

  /// Emit a human readable dump of this header to the log
  pub fn log (&self) {
    log::debug!("Allocation : {:p}", self);
    log::debug!("    Flags.FREE       : {}", bool_str(self.flags.contains(AllocFlags::FREE)));
    log::debug!("    Flags.CONST      : {}", bool_str(self.flags.contains(AllocFlags::CONST)));
    log::debug!("    Flags.SYSTEM     : {}", bool_str(self.flags.contains(AllocFlags::SYSTEM)));
    log::debug!("    Flags.NON_VITAL  : {}", bool_str(self.flags.contains(AllocFlags::NON_VITAL)));
    log::debug!("    Flags.HYBRID     : {}", bool_str(self.flags.contains(AllocFlags::HYBRID)));
    log::debug!("    Flags.LINEAR     : {}", bool_str(self.flags.contains(AllocFlags::LINEAR)));
    log::debug!("    Padding Bytes    : {}", self.padding);
    log::debug!("    Requested Size   : {}", self.size);
    log::debug!("    Contiguous Size  : {}", self.size as u64 + self.padding as u64);
    log::debug!("    Total Size       : {}", self.size as u64 + self.padding as u64 + size_of::<Self>() as u64);
  }
}


/// An address to a block of memory produced by a [`CoreAllocator`].
///
/// The handle is equal to the payload pointer; the allocation's header is
/// reachable behind it, so size queries work from the handle alone. This is
/// a plain value and carries no ownership by itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAddress(NonNull<u8>);

impl MemoryAddress {
  /// Construct a MemoryAddress from a raw payload pointer
  ///
  /// # Safety
  /// `ptr` must point at the payload of a live allocation produced by a
  /// [`CoreAllocator`]; every query on the handle reads the header behind it
  pub unsafe fn from_raw (ptr: NonNull<u8>) -> Self {
    Self(ptr)
  }

  /// Get the raw payload pointer
  pub fn as_ptr (self) -> *mut u8 {
    self.0.as_ptr()
  }

  fn header_ptr (self) -> *mut AllocationHeader {
    unsafe { (self.0.as_ptr() as *mut AllocationHeader).sub(1) }
  }

  /// Read a copy of the header behind this address
  pub fn header (self) -> AllocationHeader {
    unsafe { *self.header_ptr() }
  }

  /// The number of bytes that were requested from the allocator
  /// (excluding the header and any trailing padding)
  pub fn query_allocated_size (self) -> u32 {
    self.header().size
  }

  /// The requested size plus the trailing padding bytes
  pub fn query_contiguous_size (self) -> u32 {
    let header = self.header();
    header.size + header.padding as u32
  }

  /// The requested size plus the trailing padding and the header itself
  pub fn query_total_size (self) -> u32 {
    self.query_contiguous_size() + size_of::<AllocationHeader>() as u32
  }

  /// Reinterpret the payload as a pointer to `T`
  pub fn cast<T> (self) -> *mut T {
    self.0.as_ptr() as *mut T
  }

  /// Get a pointer to the `T` at `index`, stepping by `size_of::<T>()`
  ///
  /// # Safety
  /// The caller must ensure `(index + 1) * size_of::<T>()` is within the allocation
  pub unsafe fn get_aligned<T> (self, index: u32) -> *mut T {
    (self.0.as_ptr() as *mut T).add(index as usize)
  }

  /// Get a pointer to the `T` at a direct byte offset of `index`
  ///
  /// # Safety
  /// The caller must ensure `index + size_of::<T>()` is within the allocation
  pub unsafe fn get_direct<T> (self, index: u32) -> *mut T {
    self.0.as_ptr().add(index as usize) as *mut T
  }

  /// Emit a human readable dump of this allocation's header to the log
  pub fn log (self) {
    self.header().log()
  }
}


/// Every potential error produced by an allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
  /// The allocator is invalid or uninitialised
  #[error("the allocator is invalid or uninitialised")]
  InvalidAllocator,
  /// More bytes have been released than were ever requested; a foreign or
  /// double-released address has passed through this allocator
  #[error("total deallocations exceed total allocations")]
  NegativeMemoryUsage,
  /// The request would surpass the VM-imposed allocation cap
  #[error("the VM-imposed memory maximum was reached")]
  HitVmMaximum,
  /// The underlying heap refused the request
  #[error("the operating system is out of memory")]
  HitOsMaximum,
  /// A single request may not exceed [`CoreAllocator::MAX_ALLOCATION`] bytes
  #[error("the requested size exceeds the per-allocation maximum")]
  SizeTooLarge,
  /// Zero-sized requests are rejected
  #[error("the requested size is zero")]
  SizeIsZero,
}


struct AllocState {
  object_bytes: i64,
  system_bytes: i64,
  max_bytes: u64,
  last_error: Option<MemoryError>,
}

impl AllocState {
  fn total_bytes (&self) -> i64 {
    self.object_bytes + self.system_bytes
  }
}


/// The core allocator: the one source of long-lived heap objects in a VM.
///
/// Every allocation is prefixed with an [`AllocationHeader`] and accounted
/// against either the object or the system byte counter. An optional byte
/// cap bounds the total. All operations hold the internal lock for their
/// entire duration
pub struct CoreAllocator {
  state: Mutex<AllocState>,
}

impl CoreAllocator {
  /// The largest single request, in bytes. Larger buffers must be split
  /// across multiple allocations by the caller
  pub const MAX_ALLOCATION: u64 = u32::MAX as u64;

  /// Create a new CoreAllocator with no allocation cap
  pub fn new () -> Self {
    Self {
      state: Mutex::new(AllocState {
        object_bytes: 0,
        system_bytes: 0,
        max_bytes: 0,
        last_error: None,
      })
    }
  }

  fn request_locked (state: &mut AllocState, size: u32, flags: AllocFlags) -> Result<NonNull<u8>, MemoryError> {
    if size == 0 { return Err(MemoryError::SizeIsZero) }

    let padding = AllocationHeader::compute_padding(size);
    let total = size as u64 + padding as u64 + size_of::<AllocationHeader>() as u64;

    if state.max_bytes != 0
    && state.total_bytes() as i128 + total as i128 > state.max_bytes as i128 {
      return Err(MemoryError::HitVmMaximum)
    }

    let layout = Layout::from_size_align(total as usize, align_of::<AllocationHeader>())
      .map_err(|_| MemoryError::HitOsMaximum)?;

    let raw = unsafe { heap_alloc(layout) };
    if raw.is_null() { return Err(MemoryError::HitOsMaximum) }

    unsafe { (raw as *mut AllocationHeader).write(AllocationHeader { size, padding, flags }) }

    if flags.contains(AllocFlags::SYSTEM) {
      state.system_bytes += total as i64
    } else {
      state.object_bytes += total as i64
    }

    Ok(unsafe { NonNull::new_unchecked(raw.add(size_of::<AllocationHeader>())) })
  }

  fn release_locked (state: &mut AllocState, address: MemoryAddress) {
    let header = address.header();
    let total = header.size as u64 + header.padding as u64 + size_of::<AllocationHeader>() as u64;

    if header.flags.contains(AllocFlags::SYSTEM) {
      state.system_bytes -= total as i64
    } else {
      state.object_bytes -= total as i64
    }

    unsafe {
      let layout = Layout::from_size_align_unchecked(total as usize, align_of::<AllocationHeader>());
      heap_dealloc(address.header_ptr() as *mut u8, layout)
    }
  }

  /// Request a block of `size` bytes.
  ///
  /// On success the returned address points just past the freshly written
  /// header and the matching byte counter includes the header and padding.
  /// On failure returns None; see [`CoreAllocator::last_error`] for the cause
  #[must_use = "the returned address must be managed manually"]
  pub fn request (&self, size: u32, flags: AllocFlags) -> Option<MemoryAddress> {
    let mut state = self.state.lock();

    match Self::request_locked(&mut state, size, flags) {
      Ok(ptr) => Some(unsafe { MemoryAddress::from_raw(ptr) }),
      Err(err) => {
        state.last_error = Some(err);
        None
      }
    }
  }

  /// Request an array of `count` values of `T`, each initialised to a clone
  /// of `init`. The allocation carries a single header whose size is
  /// `size_of::<T>() * count`.
  ///
  /// Fails with SizeIsZero for a zero count and SizeTooLarge when the byte
  /// size exceeds [`CoreAllocator::MAX_ALLOCATION`]
  #[must_use = "the returned array must be managed manually"]
  pub fn request_array<T: Clone> (&self, count: u32, flags: AllocFlags, init: T) -> Option<NonNull<T>> {
    assert!(
      align_of::<T>() <= align_of::<AllocationHeader>(),
      "Tried to allocate values with an alignment {} larger than the maximum {}",
      align_of::<T>(), align_of::<AllocationHeader>()
    );

    let mut state = self.state.lock();

    let byte_size = size_of::<T>() as u64 * count as u64;

    let err = if count == 0 {
      MemoryError::SizeIsZero
    } else if byte_size > Self::MAX_ALLOCATION {
      MemoryError::SizeTooLarge
    } else {
      match Self::request_locked(&mut state, byte_size as u32, flags) {
        Ok(ptr) => {
          let data = ptr.as_ptr() as *mut T;
          for i in 0..count as usize {
            unsafe { data.add(i).write(init.clone()) }
          }
          return Some(ptr.cast())
        },
        Err(err) => err
      }
    };

    state.last_error = Some(err);
    None
  }

  /// Release an allocation and return its bytes to the matching counter.
  ///
  /// Only provide an address that was produced by this allocator instance;
  /// a foreign address is diagnosable afterwards only via [`CoreAllocator::validate`]
  pub fn release (&self, address: MemoryAddress) {
    let mut state = self.state.lock();
    Self::release_locked(&mut state, address)
  }

  /// Release an array allocation, dropping `size / size_of::<T>()` values
  /// in index order before the bytes are returned
  ///
  /// # Safety
  /// `ptr` must have been produced by [`CoreAllocator::request_array`] on
  /// this instance with the same `T`, and the values must still be live
  pub unsafe fn release_array<T> (&self, ptr: NonNull<T>) {
    let address = MemoryAddress::from_raw(ptr.cast());
    let count = address.query_allocated_size() as usize / size_of::<T>();

    for i in 0..count {
      ptr::drop_in_place(ptr.as_ptr().add(i))
    }

    self.release(address)
  }

  /// Move an allocation to a new block of `new_size` bytes, copying
  /// `min(old, new)` payload bytes and updating `address` in place.
  ///
  /// The old flags carry over. The whole operation happens under a single
  /// lock acquisition
  #[must_use = "resizing can fail, leaving the address untouched"]
  pub fn resize (&self, address: &mut MemoryAddress, new_size: u32) -> Result<(), MemoryError> {
    let mut state = self.state.lock();

    let old_header = address.header();

    let new_ptr = match Self::request_locked(&mut state, new_size, old_header.flags) {
      Ok(ptr) => ptr,
      Err(err) => {
        state.last_error = Some(err);
        return Err(err)
      }
    };

    unsafe {
      ptr::copy_nonoverlapping(
        address.as_ptr(),
        new_ptr.as_ptr(),
        old_header.size.min(new_size) as usize
      );

      Self::release_locked(&mut state, *address);
      *address = MemoryAddress::from_raw(new_ptr);
    }

    Ok(())
  }

  /// Validate the accounting of this allocator: neither byte counter may be
  /// negative, and when a cap is set the total must not exceed it
  pub fn validate (&self) -> Result<(), MemoryError> {
    let mut state = self.state.lock();

    let err = if state.object_bytes < 0 || state.system_bytes < 0 {
      MemoryError::NegativeMemoryUsage
    } else if state.max_bytes != 0 && state.total_bytes() as u64 > state.max_bytes {
      MemoryError::HitVmMaximum
    } else {
      return Ok(())
    };

    state.last_error = Some(err);
    Err(err)
  }

  /// The last error recorded by this allocator. Sticky: a successful
  /// operation does not clear it; use [`CoreAllocator::clear_last_error`]
  pub fn last_error (&self) -> Option<MemoryError> {
    self.state.lock().last_error
  }

  /// Clear the recorded last error
  pub fn clear_last_error (&self) {
    self.state.lock().last_error = None
  }

  /// Total bytes accounted to object allocations, headers and padding included.
  /// A negative value indicates a severe accounting error
  pub fn object_bytes (&self) -> i64 {
    self.state.lock().object_bytes
  }

  /// Total bytes accounted to system allocations, headers and padding included
  pub fn system_bytes (&self) -> i64 {
    self.state.lock().system_bytes
  }

  /// Combined object and system byte total
  pub fn total_bytes (&self) -> i64 {
    self.state.lock().total_bytes()
  }

  /// The cap on total allocated bytes; 0 means uncapped
  pub fn max_bytes (&self) -> u64 {
    self.state.lock().max_bytes
  }

  /// Set the cap on total allocated bytes; 0 removes the cap
  pub fn set_max_bytes (&self, new_max: u64) {
    self.state.lock().max_bytes = new_max
  }

  /// Emit a human readable dump of the allocator state to the log
  pub fn log (&self) {
    let state = self.state.lock();

    log::debug!("CoreAllocator : {:p}", self);
    log::debug!("    Object Bytes : {}", state.object_bytes);
    log::debug!("    System Bytes : {}", state.system_bytes);
    log::debug!("    Total Bytes  : {}", state.total_bytes());
    log::debug!("    Max Bytes    : {}", state.max_bytes);
    log::debug!("    Last Error   : {:?}", state.last_error);
  }
}

impl Default for CoreAllocator { fn default () -> Self { Self::new() } }
