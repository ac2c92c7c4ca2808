//! Per-processor memory: a byte stack and a frame-chained local arena

use std::{
  mem::size_of,
  ptr::{ self, NonNull },
  sync::Arc,
};

use crate::{
  static_assert,
  memory::{ CoreAllocator, MemoryAddress, MemoryError, SYSTEM_ALLOC_FLAGS },
};


/// Metadata about one call frame, written into the local arena at the
/// frame's creation point. The `previous` link is an arena offset rather
/// than a pointer so the arena could be moved in future revisions
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Frame {
  offset: u32,
  usage: u32,
  previous: u32,
}

/// Sentinel offset marking the absence of a previous frame
const FRAME_NONE: u32 = u32::MAX;

const FRAME_SIZE: u32 = size_of::<Frame>() as u32;

static_assert!(size_of::<Frame>() == 12);


/// The result of a stack pop operation.
///
/// When `valid` is true, `value` holds the popped data (zero for memory
/// pops). When false, the pop underflowed and `value` holds how many bytes
/// short the stack was; nothing was modified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopResult {
  /// The data retrieved from the stack, or the underflow distance
  pub value: u64,
  /// Was the pop performed?
  pub valid: bool,
}


/// The working memory of one virtual processor: a single contiguous
/// allocation split into a byte stack (for transfer between function
/// calls) and a local arena (for call-frame-scoped variable storage).
///
/// There is no internal lock; each instance has exactly one owning thread
pub struct ThreadMemory {
  allocator: Arc<CoreAllocator>,
  raw: MemoryAddress,
  stack_size: u32,
  stack_idx: u32,
  local_size: u32,
  local_idx: u32,
  current_frame: u32,
}

impl ThreadMemory {
  /// The sentinel returned by [`ThreadMemory::merge`] when the pop on the
  /// other stack fails
  pub const MERGE_FAILURE: i64 = i64::MIN;

  /// Allocate the combined stack + local buffer from the core allocator.
  ///
  /// Both regions live end-to-end in one system allocation; the stack
  /// occupies the first `stack_size` bytes
  pub fn new (allocator: &Arc<CoreAllocator>, stack_size: u32, local_size: u32) -> Result<Self, MemoryError> {
    let total = stack_size as u64 + local_size as u64;
    if total > CoreAllocator::MAX_ALLOCATION {
      return Err(MemoryError::SizeTooLarge)
    }

    let raw = allocator.request(total as u32, SYSTEM_ALLOC_FLAGS)
      .ok_or_else(|| allocator.last_error().unwrap_or(MemoryError::HitOsMaximum))?;

    Ok(Self {
      allocator: Arc::clone(allocator),
      raw,
      stack_size,
      stack_idx: 0,
      local_size,
      local_idx: 0,
      current_frame: FRAME_NONE,
    })
  }

  fn stack_start (&self) -> *mut u8 {
    self.raw.as_ptr()
  }

  fn local_start (&self) -> *mut u8 {
    unsafe { self.raw.as_ptr().add(self.stack_size as usize) }
  }

  fn read_frame (&self, offset: u32) -> Frame {
    debug_assert!(offset + FRAME_SIZE <= self.local_size);
    unsafe { (self.local_start().add(offset as usize) as *const Frame).read_unaligned() }
  }

  fn write_frame (&mut self, offset: u32, frame: Frame) {
    debug_assert!(offset + FRAME_SIZE <= self.local_size);
    unsafe { (self.local_start().add(offset as usize) as *mut Frame).write_unaligned(frame) }
  }

// STACK: //

  fn push_bytes (&mut self, bytes: &[u8]) -> i64 {
    let width = bytes.len() as u64;
    let fit = self.stack_size as i64 - (self.stack_idx as u64 + width) as i64;

    // A failed push reports how far past the end it would have run,
    // as a negative value, and is never applied
    if fit < 0 { return fit }

    unsafe {
      ptr::copy_nonoverlapping(
        bytes.as_ptr(),
        self.stack_start().add(self.stack_idx as usize),
        bytes.len()
      )
    }

    self.stack_idx += width as u32;
    fit
  }

  fn pop_width (&mut self, width: u32) -> (u64, bool) {
    if self.stack_idx < width {
      return ((width - self.stack_idx) as u64, false)
    }

    self.stack_idx -= width;
    (0, true)
  }

  /// Push an 8-bit value onto the stack.
  /// Returns the remaining stack bytes, negative on would-overflow
  pub fn push8 (&mut self, data: u8) -> i64 {
    self.push_bytes(&data.to_ne_bytes())
  }

  /// Push a 16-bit value onto the stack.
  /// Returns the remaining stack bytes, negative on would-overflow
  pub fn push16 (&mut self, data: u16) -> i64 {
    self.push_bytes(&data.to_ne_bytes())
  }

  /// Push a 32-bit value onto the stack.
  /// Returns the remaining stack bytes, negative on would-overflow
  pub fn push32 (&mut self, data: u32) -> i64 {
    self.push_bytes(&data.to_ne_bytes())
  }

  /// Push a 64-bit value onto the stack.
  /// Returns the remaining stack bytes, negative on would-overflow
  pub fn push64 (&mut self, data: u64) -> i64 {
    self.push_bytes(&data.to_ne_bytes())
  }

  /// Push an arbitrary amount of memory onto the stack.
  /// Returns the remaining stack bytes, negative on would-overflow
  pub fn push_mem (&mut self, data: &[u8]) -> i64 {
    self.push_bytes(data)
  }

  /// Pop an 8-bit value from the stack
  pub fn pop8 (&mut self) -> PopResult {
    match self.pop_width(1) {
      (_, true) => PopResult {
        value: unsafe { self.stack_start().add(self.stack_idx as usize).read() } as u64,
        valid: true
      },
      (short, false) => PopResult { value: short, valid: false }
    }
  }

  /// Pop a 16-bit value from the stack
  pub fn pop16 (&mut self) -> PopResult {
    match self.pop_width(2) {
      (_, true) => PopResult {
        value: unsafe {
          (self.stack_start().add(self.stack_idx as usize) as *const u16).read_unaligned()
        } as u64,
        valid: true
      },
      (short, false) => PopResult { value: short, valid: false }
    }
  }

  /// Pop a 32-bit value from the stack
  pub fn pop32 (&mut self) -> PopResult {
    match self.pop_width(4) {
      (_, true) => PopResult {
        value: unsafe {
          (self.stack_start().add(self.stack_idx as usize) as *const u32).read_unaligned()
        } as u64,
        valid: true
      },
      (short, false) => PopResult { value: short, valid: false }
    }
  }

  /// Pop a 64-bit value from the stack
  pub fn pop64 (&mut self) -> PopResult {
    match self.pop_width(8) {
      (_, true) => PopResult {
        value: unsafe {
          (self.stack_start().add(self.stack_idx as usize) as *const u64).read_unaligned()
        },
        valid: true
      },
      (short, false) => PopResult { value: short, valid: false }
    }
  }

  /// Pop `out.len()` bytes from the stack into a caller buffer.
  /// On success `value` is zero; `valid` still reports the outcome
  pub fn pop_mem (&mut self, out: &mut [u8]) -> PopResult {
    let width = out.len() as u32;

    match self.pop_width(width) {
      (_, true) => {
        unsafe {
          ptr::copy_nonoverlapping(
            self.stack_start().add(self.stack_idx as usize),
            out.as_mut_ptr(),
            out.len()
          )
        }
        PopResult { value: 0, valid: true }
      },
      (short, false) => PopResult { value: short, valid: false }
    }
  }

  /// Pop `size` bytes from `other`'s stack and push them onto this one.
  ///
  /// Returns the remaining space on this stack, negative on would-overflow
  /// (nothing transferred), or [`ThreadMemory::MERGE_FAILURE`] when the pop
  /// side underflows (neither stack is modified)
  pub fn merge (&mut self, other: &mut ThreadMemory, size: u32) -> i64 {
    let fit = self.stack_size as i64 - (self.stack_idx as u64 + size as u64) as i64;
    if fit < 0 { return fit }

    if other.stack_idx < size { return Self::MERGE_FAILURE }

    other.stack_idx -= size;

    unsafe {
      ptr::copy_nonoverlapping(
        other.stack_start().add(other.stack_idx as usize),
        self.stack_start().add(self.stack_idx as usize),
        size as usize
      )
    }

    self.stack_idx += size;
    fit
  }

  /// Reset the stack, discarding all pushed data.
  /// The local arena is not disturbed
  pub fn reset_stack (&mut self) {
    self.stack_idx = 0
  }

  /// True if the stack region exists and can be used
  pub fn stack_valid (&self) -> bool {
    self.stack_size > 0
  }

// LOCAL: //

  /// Open a new local frame at the top of the arena and make it current.
  /// Returns false when the arena cannot fit another frame header
  pub fn frame_new (&mut self) -> bool {
    if self.local_remaining() < FRAME_SIZE { return false }

    let offset = self.local_idx;
    self.write_frame(offset, Frame { offset, usage: 0, previous: self.current_frame });

    self.current_frame = offset;
    self.local_idx += FRAME_SIZE;

    true
  }

  /// Drop the current frame, releasing everything it allocated, and make
  /// the previous frame current. Returns true iff a previous frame remains
  pub fn frame_drop (&mut self) -> bool {
    if self.current_frame == FRAME_NONE { return false }

    let frame = self.read_frame(self.current_frame);

    self.local_idx = frame.offset;
    self.current_frame = frame.previous;

    self.current_frame != FRAME_NONE
  }

  /// Release everything the current frame allocated but keep the frame
  /// itself. Returns false when no frame is current
  pub fn frame_reset (&mut self) -> bool {
    if self.current_frame == FRAME_NONE { return false }

    let mut frame = self.read_frame(self.current_frame);
    frame.usage = 0;
    self.write_frame(self.current_frame, frame);

    self.local_idx = self.current_frame + FRAME_SIZE;

    true
  }

  /// Request `size` bytes from the current frame's address space.
  /// Returns None when no frame is current or the arena would overflow
  pub fn request_bytes (&mut self, size: u32) -> Option<NonNull<u8>> {
    if self.current_frame == FRAME_NONE { return None }
    if self.local_remaining() < size { return None }

    let ptr = unsafe {
      NonNull::new_unchecked(self.local_start().add(self.local_idx as usize))
    };

    self.local_idx += size;

    let mut frame = self.read_frame(self.current_frame);
    frame.usage += size;
    self.write_frame(self.current_frame, frame);

    Some(ptr)
  }

  /// Release `size` bytes from the current frame's address space.
  ///
  /// Returns the bytes still allocated in the frame; when the drop would
  /// underflow the frame, a negative value is returned and nothing changes
  pub fn drop_bytes (&mut self, size: u32) -> i64 {
    if self.current_frame == FRAME_NONE { return -1 }

    let mut frame = self.read_frame(self.current_frame);
    let remaining = frame.usage as i64 - size as i64;

    if remaining >= 0 {
      self.local_idx -= size;
      frame.usage -= size;
      self.write_frame(self.current_frame, frame);
    }

    remaining
  }

  /// Translate an offset relative to the current frame's data into a
  /// pointer. Returns None when no frame is current or the offset is
  /// beyond the frame's allocated bytes
  pub fn get_at (&self, offset: u32) -> Option<NonNull<u8>> {
    if self.current_frame == FRAME_NONE { return None }

    let frame = self.read_frame(self.current_frame);
    if offset >= frame.usage { return None }

    Some(unsafe {
      NonNull::new_unchecked(
        self.local_start().add((frame.offset + FRAME_SIZE + offset) as usize)
      )
    })
  }

  /// Reset the local arena, discarding all frames and their data.
  /// The stack is not disturbed
  pub fn reset_local (&mut self) {
    self.local_idx = 0;
    self.current_frame = FRAME_NONE;
  }

  /// True if the local arena exists and a frame is open for use
  pub fn local_valid (&self) -> bool {
    self.local_size > 0 && self.current_frame != FRAME_NONE
  }

// GETTERS: //

  /// Total size of the combined stack + local allocation
  pub fn allocation_size (&self) -> u32 { self.stack_size + self.local_size }

  /// Reserved size of the stack region
  pub fn stack_size (&self) -> u32 { self.stack_size }

  /// Reserved size of the local region
  pub fn local_size (&self) -> u32 { self.local_size }

  /// Bytes currently used by the stack
  pub fn stack_usage (&self) -> u32 { self.stack_idx }

  /// Bytes currently used by the local arena, frame headers included
  pub fn local_usage (&self) -> u32 { self.local_idx }

  /// Free bytes left on the stack
  pub fn stack_remaining (&self) -> u32 { self.stack_size - self.stack_idx }

  /// Free bytes left in the local arena
  pub fn local_remaining (&self) -> u32 { self.local_size - self.local_idx }

  /// Emit a human readable dump of this memory's state to the log
  pub fn log (&self) {
    log::debug!("ThreadMemory : {:p}", self);
    log::debug!("    StackSize  : {}", self.stack_size);
    log::debug!("    LocalSize  : {}", self.local_size);
    log::debug!("    StackUsage : {}", self.stack_idx);
    log::debug!("    LocalUsage : {}", self.local_idx);
    log::debug!("    RawAddress : {:p}", self.raw.as_ptr());
    log::debug!("    ------------");
    log::debug!("    Total Allocation Size : {}", self.allocation_size());
    log::debug!("    Remaining Stack Space : {}", self.stack_remaining());
    log::debug!("    Remaining Local Space : {}", self.local_remaining());
  }
}

impl Drop for ThreadMemory {
  fn drop (&mut self) {
    self.allocator.release(self.raw)
  }
}

// A ThreadMemory has exactly one owning thread at any time; the raw
// buffer pointer never aliases another owner
unsafe impl Send for ThreadMemory {}


#[cfg(test)]
mod tests {
  use super::*;

  fn mem (stack: u32, local: u32) -> (Arc<CoreAllocator>, ThreadMemory) {
    let alloc = Arc::new(CoreAllocator::new());
    let tm = ThreadMemory::new(&alloc, stack, local).unwrap();
    (alloc, tm)
  }

  #[test]
  fn test_accounting_round_trip () {
    let alloc = Arc::new(CoreAllocator::new());

    {
      let _tm = ThreadMemory::new(&alloc, 128, 128).unwrap();
      assert!(alloc.system_bytes() > 0);
    }

    assert_eq!(alloc.system_bytes(), 0);
  }

  #[test]
  fn test_push_pop_round_trip () {
    let (_a, mut tm) = mem(128, 0);

    assert_eq!(tm.push8(0x12), 127);
    assert_eq!(tm.push16(0x3456), 125);
    assert_eq!(tm.push32(0x789A_BCDE), 121);
    assert_eq!(tm.push64(0xFEDC_BA98_7654_3210), 113);

    assert_eq!(tm.pop64(), PopResult { value: 0xFEDC_BA98_7654_3210, valid: true });
    assert_eq!(tm.pop32(), PopResult { value: 0x789A_BCDE, valid: true });
    assert_eq!(tm.pop16(), PopResult { value: 0x3456, valid: true });
    assert_eq!(tm.pop8(), PopResult { value: 0x12, valid: true });

    assert_eq!(tm.stack_usage(), 0);
  }

  #[test]
  fn test_pop_underflow () {
    let (_a, mut tm) = mem(128, 0);

    assert_eq!(tm.pop8(), PopResult { value: 1, valid: false });

    assert_eq!(tm.push8(0x42), 127);
    assert_eq!(tm.pop8(), PopResult { value: 0x42, valid: true });
    assert_eq!(tm.pop8(), PopResult { value: 1, valid: false });

    assert_eq!(tm.pop64(), PopResult { value: 8, valid: false });
  }

  #[test]
  fn test_push_boundary () {
    let (_a, mut tm) = mem(8, 0);

    // A push that exactly fills the stack succeeds with zero remaining
    assert_eq!(tm.push64(1), 0);
    // One more byte reports the overflow distance and changes nothing
    assert_eq!(tm.push8(1), -1);
    assert_eq!(tm.stack_usage(), 8);
  }

  #[test]
  fn test_push_pop_mem () {
    let (_a, mut tm) = mem(32, 0);

    assert_eq!(tm.push_mem(b"hello row"), 23);

    let mut out = [0u8; 9];
    assert_eq!(tm.pop_mem(&mut out), PopResult { value: 0, valid: true });
    assert_eq!(&out, b"hello row");

    assert_eq!(tm.pop_mem(&mut out), PopResult { value: 9, valid: false });
  }

  #[test]
  fn test_merge () {
    let alloc = Arc::new(CoreAllocator::new());
    let mut a = ThreadMemory::new(&alloc, 64, 0).unwrap();
    let mut b = ThreadMemory::new(&alloc, 64, 0).unwrap();

    b.push32(0xCAFE_BEEF);

    assert_eq!(a.merge(&mut b, 4), 60);
    assert_eq!(b.stack_usage(), 0);
    assert_eq!(a.pop32(), PopResult { value: 0xCAFE_BEEF, valid: true });
  }

  #[test]
  fn test_merge_failure_modifies_nothing () {
    let alloc = Arc::new(CoreAllocator::new());
    let mut a = ThreadMemory::new(&alloc, 64, 0).unwrap();
    let mut b = ThreadMemory::new(&alloc, 64, 0).unwrap();

    b.push16(7);

    assert_eq!(a.merge(&mut b, 4), ThreadMemory::MERGE_FAILURE);
    assert_eq!(a.stack_usage(), 0);
    assert_eq!(b.stack_usage(), 2);
  }

  #[test]
  fn test_frame_nesting () {
    let (_a, mut tm) = mem(128, 128);

    assert!(tm.frame_new());
    let outer = tm.request_bytes(4).unwrap();
    unsafe { (outer.as_ptr() as *mut u32).write_unaligned(0xABCD_EF98) }
    assert_eq!(
      unsafe { (tm.get_at(0).unwrap().as_ptr() as *const u32).read_unaligned() },
      0xABCD_EF98
    );

    assert!(tm.frame_new());
    let inner = tm.request_bytes(4).unwrap();
    unsafe { (inner.as_ptr() as *mut u32).write_unaligned(0xCAFE_BEEF) }
    assert_eq!(
      unsafe { (tm.get_at(0).unwrap().as_ptr() as *const u32).read_unaligned() },
      0xCAFE_BEEF
    );

    // Dropping the inner frame exposes the outer frame's data again
    assert!(tm.frame_drop());
    assert_eq!(
      unsafe { (tm.get_at(0).unwrap().as_ptr() as *const u32).read_unaligned() },
      0xABCD_EF98
    );

    // The outer frame is the last one
    assert!(!tm.frame_drop());
    assert_eq!(tm.local_usage(), 0);
    assert!(tm.request_bytes(1).is_none());
  }

  #[test]
  fn test_frame_reset () {
    let (_a, mut tm) = mem(0, 128);

    assert!(!tm.frame_reset());

    assert!(tm.frame_new());
    tm.request_bytes(16).unwrap();
    assert_eq!(tm.local_usage(), FRAME_SIZE + 16);

    assert!(tm.frame_reset());
    assert_eq!(tm.local_usage(), FRAME_SIZE);
    assert!(tm.get_at(0).is_none());
  }

  #[test]
  fn test_drop_bytes () {
    let (_a, mut tm) = mem(0, 128);

    assert_eq!(tm.drop_bytes(1), -1);

    tm.frame_new();
    tm.request_bytes(8).unwrap();

    assert_eq!(tm.drop_bytes(3), 5);
    assert_eq!(tm.drop_bytes(8), -3);
    assert_eq!(tm.drop_bytes(5), 0);
  }

  #[test]
  fn test_get_at_bounds () {
    let (_a, mut tm) = mem(0, 128);

    assert!(tm.get_at(0).is_none());

    tm.frame_new();
    tm.request_bytes(4).unwrap();

    assert!(tm.get_at(3).is_some());
    assert!(tm.get_at(4).is_none());
  }

  #[test]
  fn test_arena_overflow () {
    let (_a, mut tm) = mem(0, 32);

    assert!(tm.frame_new());
    assert!(tm.request_bytes(32).is_none());
    assert!(tm.request_bytes(20).is_some());

    // No room left for another frame header
    assert!(!tm.frame_new());
  }

  #[test]
  fn test_stack_and_local_independent () {
    let (_a, mut tm) = mem(64, 64);

    tm.push32(1);
    tm.frame_new();
    tm.request_bytes(4).unwrap();

    tm.reset_stack();
    assert_eq!(tm.stack_usage(), 0);
    assert_eq!(tm.local_usage(), FRAME_SIZE + 4);

    tm.push32(2);
    tm.reset_local();
    assert_eq!(tm.local_usage(), 0);
    assert_eq!(tm.stack_usage(), 4);
    assert!(!tm.local_valid());
  }
}
