//! Relocation tables binding bytecode cross-reference indices to symbols

use std::{
  ptr::{ self, NonNull },
  slice, str,
  sync::Arc,
};

use crate::{
  memory::{ CoreAllocator, MemoryError, SYSTEM_ALLOC_FLAGS },
  storage::{ FlatStorage, Symbol },
};


/// One relocation: a lookup key and the symbol it resolved to, if any.
/// The key is borrowed, never owned
#[derive(Clone)]
struct Entry {
  resolved: *mut Symbol,
  key: *const u8,
  key_len: u8,
}


/// A symbol table for external access from inside a function's bytecode.
///
/// Instructions such as `call`, `spawn`, and `eload` carry indices into
/// this table; each index names a key that is resolved against the symbol
/// store on first retrieval and cached from then on. Unresolvable keys are
/// not cached, so symbols assigned later still bind
pub struct RelocationTable {
  allocator: Arc<CoreAllocator>,
  storage: NonNull<FlatStorage>,
  entries: NonNull<Entry>,
  len: u32,
}

impl RelocationTable {
  /// Allocate a table of `count` empty relocation entries resolving
  /// against `storage`
  ///
  /// # Safety
  /// `storage` must outlive the table; retrievals read through it
  pub unsafe fn new (allocator: &Arc<CoreAllocator>, storage: &FlatStorage, count: u32) -> Result<Self, MemoryError> {
    let entries = allocator
      .request_array::<Entry>(count, SYSTEM_ALLOC_FLAGS, Entry {
        resolved: ptr::null_mut(),
        key: ptr::null(),
        key_len: 0,
      })
      .ok_or_else(|| allocator.last_error().unwrap_or(MemoryError::HitOsMaximum))?;

    Ok(Self {
      allocator: Arc::clone(allocator),
      storage: NonNull::from(storage),
      entries,
      len: count,
    })
  }

  /// The number of entries in this table
  pub fn len (&self) -> u32 { self.len }

  /// Determine if this table has no entries
  pub fn is_empty (&self) -> bool { self.len == 0 }

  fn entry (&self, idx: u32) -> Option<&Entry> {
    if idx >= self.len { return None }
    Some(unsafe { &*self.entries.as_ptr().add(idx as usize) })
  }

  fn entry_mut (&mut self, idx: u32) -> Option<&mut Entry> {
    if idx >= self.len { return None }
    Some(unsafe { &mut *self.entries.as_ptr().add(idx as usize) })
  }

  /// Install `key` at `idx`, optionally resolving it against the store
  /// immediately. Returns false when the index is out of bounds or the
  /// slot already holds a key
  ///
  /// # Safety
  /// `key` must outlive the table; only the pointer is stored
  pub unsafe fn assign_idx (&mut self, idx: u32, key: &str, resolve: bool) -> bool {
    debug_assert!(key.len() <= u8::MAX as usize);

    let storage = self.storage;

    let entry = match self.entry_mut(idx) {
      Some(entry) => entry,
      None => return false
    };

    if !entry.key.is_null() { return false }

    entry.key = key.as_ptr();
    entry.key_len = key.len() as u8;
    entry.resolved = if resolve {
      storage.as_ref().lookup(key)
        .map(NonNull::as_ptr)
        .unwrap_or(ptr::null_mut())
    } else {
      ptr::null_mut()
    };

    true
  }

  /// Retrieve the symbol for `idx`, performing and caching a one-time
  /// lookup when the entry has not resolved yet.
  ///
  /// Returns None when the index is out of bounds, the slot has no key,
  /// or the key does not name a stored symbol. Misses are not cached
  pub fn retrieve_idx (&mut self, idx: u32) -> Option<NonNull<Symbol>> {
    let storage = self.storage;

    let entry = self.entry_mut(idx)?;

    if let Some(resolved) = NonNull::new(entry.resolved) {
      return Some(resolved)
    }

    if entry.key.is_null() { return None }

    let key = unsafe {
      str::from_utf8_unchecked(slice::from_raw_parts(entry.key, entry.key_len as usize))
    };

    let symbol = unsafe { storage.as_ref() }.lookup(key)?;
    entry.resolved = symbol.as_ptr();

    Some(symbol)
  }

  /// Retrieve the key stored at `idx`, or None when the index is out of
  /// bounds or the slot is empty
  pub fn retrieve_idx_key (&self, idx: u32) -> Option<&str> {
    let entry = self.entry(idx)?;

    if entry.key.is_null() { return None }

    Some(unsafe {
      str::from_utf8_unchecked(slice::from_raw_parts(entry.key, entry.key_len as usize))
    })
  }
}

impl Drop for RelocationTable {
  fn drop (&mut self) {
    // Entries borrow their keys; only the array itself is released
    unsafe { self.allocator.release_array(self.entries) }
  }
}


#[cfg(test)]
mod tests {
  use std::ptr;
  use super::*;
  use crate::storage::{ StorageRequest, SymbolType };

  fn data_request (key: &str) -> StorageRequest {
    StorageRequest {
      kind: SymbolType::Data,
      extended_type: 0,
      key,
      value: ptr::null_mut(),
      value_size: 0,
    }
  }

  #[test]
  fn test_retrieval () {
    let alloc = Arc::new(CoreAllocator::new());
    let storage = FlatStorage::new(&alloc).unwrap();

    let sym_a = storage.assign(&data_request("KeyA")).unwrap();
    let sym_b = storage.assign(&data_request("KeyB")).unwrap();

    let mut reloc = unsafe { RelocationTable::new(&alloc, &storage, 3).unwrap() };

    unsafe {
      assert!(reloc.assign_idx(0, "KeyA", false));
      assert!(reloc.assign_idx(1, "KeyB", true));
      assert!(reloc.assign_idx(2, "KeyC", false)); // Doesn't exist!
    }

    assert_eq!(reloc.retrieve_idx(0), Some(sym_a));
    assert_eq!(reloc.retrieve_idx(1), Some(sym_b));
    assert_eq!(reloc.retrieve_idx(2), None);

    assert_eq!(reloc.retrieve_idx_key(0), Some("KeyA"));
    assert_eq!(reloc.retrieve_idx_key(2), Some("KeyC"));
    assert_eq!(reloc.retrieve_idx_key(3), None);
  }

  #[test]
  fn test_occupied_slot_rejected () {
    let alloc = Arc::new(CoreAllocator::new());
    let storage = FlatStorage::new(&alloc).unwrap();

    let mut reloc = unsafe { RelocationTable::new(&alloc, &storage, 2).unwrap() };

    unsafe {
      assert!(reloc.assign_idx(0, "KeyA", false));
      assert!(!reloc.assign_idx(0, "KeyB", false));
      assert!(!reloc.assign_idx(2, "KeyB", false));
    }

    assert_eq!(reloc.retrieve_idx_key(0), Some("KeyA"));
    assert_eq!(reloc.retrieve_idx_key(1), None);
  }

  #[test]
  fn test_miss_is_not_cached () {
    let alloc = Arc::new(CoreAllocator::new());
    let storage = FlatStorage::new(&alloc).unwrap();

    let mut reloc = unsafe { RelocationTable::new(&alloc, &storage, 1).unwrap() };
    unsafe { reloc.assign_idx(0, "late", false) };

    assert_eq!(reloc.retrieve_idx(0), None);

    // Late binding: assigning the symbol afterwards makes retrieval work
    let sym = storage.assign(&data_request("late")).unwrap();
    assert_eq!(reloc.retrieve_idx(0), Some(sym));
  }

  #[test]
  fn test_accounting_round_trip () {
    let alloc = Arc::new(CoreAllocator::new());
    let storage = FlatStorage::new(&alloc).unwrap();

    let before = alloc.system_bytes();
    {
      let _reloc = unsafe { RelocationTable::new(&alloc, &storage, 8).unwrap() };
      assert!(alloc.system_bytes() > before);
    }
    assert_eq!(alloc.system_bytes(), before);
  }
}
