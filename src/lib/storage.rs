//! The global symbol store: a hashed key to symbol map with collision chains

use std::{
  ptr::{ self, NonNull },
  slice,
  sync::Arc,
};

use thiserror::Error;

use crate::{
  memory::{ CoreAllocator, MemoryAddress, MemoryError, SYSTEM_ALLOC_FLAGS },
  sync::Mutex,
  utils::sdbm,
};


/// The internal type of a [`Symbol`] stored in a storage device
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
  /// This Symbol was not properly initialised and/or does not exist
  Invalid,
  /// This Symbol points to a Function usable by the call and spawn
  /// family of instructions. The executor refuses to run anything else
  Func,
  /// This Symbol points to arbitrary data
  Data,
  /// This Symbol points to arbitrary data hidden from running executables
  Metadata,
  /// This Symbol names a collection of other Symbols; unused by the VM
  /// itself but available to languages implementing namespaces
  Collection,
  /// This Symbol points to a custom type defined by a third-party
  /// runtime, further described by its extended type tag
  Extended,
}

/// A globally accessible tagged value, stored by key and referenced from
/// bytecode through a relocation table. The store never owns `value`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
  /// What is the type of this Symbol?
  pub kind: SymbolType,
  /// When `kind` is [`SymbolType::Extended`], an opaque third-party tag
  pub extended_type: u32,
  /// A pointer to the actual contents of this Symbol
  pub value: *mut u8,
}

impl Symbol {
  /// Reinterpret the value pointer as a `T` pointer
  pub fn cast_value<T> (&self) -> *mut T {
    self.value as *mut T
  }
}


/// The attributes used to create a new [`Symbol`]
#[derive(Debug, Clone, Copy)]
pub struct StorageRequest<'k> {
  /// The type the new Symbol will carry
  pub kind: SymbolType,
  /// The extended type tag, meaningful when `kind` is Extended
  pub extended_type: u32,
  /// The key the Symbol will be looked up by; 1 to 254 bytes
  pub key: &'k str,
  /// The value the Symbol will point at; not copied, not owned
  pub value: *mut u8,
  /// The size in bytes of the value, for devices that copy it
  pub value_size: u32,
}


/// Every potential error produced by a symbol assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
  /// A Symbol already exists at the given key
  #[error("a symbol already exists at the given key")]
  SymbolExists,
  /// The key is empty or longer than [`FlatStorage::MAX_KEY_LEN`] bytes
  #[error("the key cannot be used to store a value")]
  InvalidKey,
  /// The value cannot be stored in this device
  #[error("the value cannot be stored")]
  InvalidValue,
  /// The storage device is invalid and/or uninitialised
  #[error("the storage device is invalid or uninitialised")]
  InvalidStorage,
  /// An underlying allocation failed
  #[error("not enough memory for the symbol or its bookkeeping")]
  NotEnoughSpace,
}


/// Internal extension of the base Symbol record. `sym` is the first field
/// so a node pointer doubles as a `*mut Symbol` for callers
#[repr(C)]
#[derive(Clone)]
struct FsSymbol {
  sym: Symbol,
  key: *mut u8,
  key_len: u8,
  key_hash: u64,
  chain_next: *mut FsSymbol,
}

impl FsSymbol {
  fn key_bytes (&self) -> &[u8] {
    unsafe { slice::from_raw_parts(self.key, self.key_len as usize) }
  }

  fn matches (&self, hash: u64, key: &[u8]) -> bool {
    // Hash equality alone is not identity; always compare the bytes
    self.key_hash == hash && self.key_bytes() == key
  }
}


struct MapInner {
  buckets: *mut *mut FsSymbol,
  bucket_count: u32,
  populated: u32,
  last_error: Option<StoreError>,
}

// Nodes are reached only through the lock
unsafe impl Send for MapInner {}

impl MapInner {
  unsafe fn bucket (&self, idx: u32) -> *mut FsSymbol {
    *self.buckets.add(idx as usize)
  }

  unsafe fn set_bucket (&mut self, idx: u32, node: *mut FsSymbol) {
    *self.buckets.add(idx as usize) = node
  }
}


/// The default storage device: a flat hash map of [`Symbol`]s keyed by
/// short byte strings, with per-bucket collision chains.
///
/// Every node, key copy, and the bucket array itself come from the VM's
/// [`CoreAllocator`]. All public operations are serialized by one internal
/// lock
pub struct FlatStorage {
  allocator: Arc<CoreAllocator>,
  inner: Mutex<MapInner>,
}

impl FlatStorage {
  /// The starting number of buckets
  pub const BASE_BUCKETS: u32 = 32;
  /// How many buckets each grow step adds
  pub const STEP_BUCKETS: u32 = 16;
  /// The maximum key length in bytes
  pub const MAX_KEY_LEN: usize = 254;

  /// Create a new FlatStorage backed by the given allocator
  pub fn new (allocator: &Arc<CoreAllocator>) -> Result<Self, MemoryError> {
    let buckets = allocator
      .request_array::<*mut FsSymbol>(Self::BASE_BUCKETS, SYSTEM_ALLOC_FLAGS, ptr::null_mut())
      .ok_or_else(|| allocator.last_error().unwrap_or(MemoryError::HitOsMaximum))?;

    Ok(Self {
      allocator: Arc::clone(allocator),
      inner: Mutex::new(MapInner {
        buckets: buckets.as_ptr(),
        bucket_count: Self::BASE_BUCKETS,
        populated: 0,
        last_error: None,
      })
    })
  }

  /// Chain `node` into the bucket array for its hash.
  /// Returns false when a symbol with the same `(hash, key)` already
  /// occupies the chain
  unsafe fn chain_in (buckets: *mut *mut FsSymbol, bucket_count: u32, node: *mut FsSymbol) -> bool {
    let idx = ((*node).key_hash % bucket_count as u64) as usize;
    let slot = buckets.add(idx);

    if (*slot).is_null() {
      *slot = node;
      return true
    }

    let mut cursor = *slot;
    loop {
      if (*cursor).matches((*node).key_hash, (*node).key_bytes()) {
        return false
      }

      if (*cursor).chain_next.is_null() {
        (*cursor).chain_next = node;
        return true
      }

      cursor = (*cursor).chain_next;
    }
  }

  /// Regrow the bucket array by [`FlatStorage::STEP_BUCKETS`], reinserting
  /// every node. The nodes themselves are never reallocated; a failed
  /// array allocation leaves the old table intact
  fn grow_locked (&self, inner: &mut MapInner) -> bool {
    let new_count = inner.bucket_count + Self::STEP_BUCKETS;

    let new_buckets = match self.allocator
      .request_array::<*mut FsSymbol>(new_count, SYSTEM_ALLOC_FLAGS, ptr::null_mut()) {
      Some(buckets) => buckets.as_ptr(),
      None => return false
    };

    unsafe {
      for i in 0..inner.bucket_count {
        let mut node = inner.bucket(i);

        while !node.is_null() {
          let next = (*node).chain_next;
          (*node).chain_next = ptr::null_mut();

          Self::chain_in(new_buckets, new_count, node);

          node = next;
        }
      }

      self.allocator.release_array(NonNull::new_unchecked(inner.buckets));
    }

    inner.buckets = new_buckets;
    inner.bucket_count = new_count;

    true
  }

  fn release_node (&self, node: *mut FsSymbol) {
    unsafe {
      self.allocator.release(MemoryAddress::from_raw(NonNull::new_unchecked((*node).key)));
      self.allocator.release_array(NonNull::new_unchecked(node));
    }
  }

  /// Create a Symbol with the requested attributes.
  ///
  /// On success returns a pointer to the new Symbol and clears the last
  /// error; on failure returns None with the cause readable through
  /// [`FlatStorage::last_error`]. The key is copied; the store owns the
  /// copy until the symbol is deleted or the store is dropped
  pub fn assign (&self, request: &StorageRequest) -> Option<NonNull<Symbol>> {
    let mut inner = self.inner.lock();

    if inner.buckets.is_null() {
      inner.last_error = Some(StoreError::InvalidStorage);
      return None
    }

    let key = request.key.as_bytes();
    if key.is_empty() || key.len() > Self::MAX_KEY_LEN {
      inner.last_error = Some(StoreError::InvalidKey);
      return None
    }

    // Grow ahead of the estimated usage so chains stay short
    if inner.populated + 1 >= inner.bucket_count && !self.grow_locked(&mut inner) {
      inner.last_error = Some(StoreError::NotEnoughSpace);
      return None
    }

    let hash = sdbm(key) as u64;

    let node = match self.allocator.request_array::<FsSymbol>(1, SYSTEM_ALLOC_FLAGS, FsSymbol {
      sym: Symbol {
        kind: request.kind,
        extended_type: request.extended_type,
        value: request.value,
      },
      key: ptr::null_mut(),
      key_len: key.len() as u8,
      key_hash: hash,
      chain_next: ptr::null_mut(),
    }) {
      Some(node) => node.as_ptr(),
      None => {
        inner.last_error = Some(StoreError::NotEnoughSpace);
        return None
      }
    };

    let key_copy = match self.allocator.request(key.len() as u32, SYSTEM_ALLOC_FLAGS) {
      Some(addr) => addr,
      None => {
        unsafe { self.allocator.release_array(NonNull::new_unchecked(node)) }
        inner.last_error = Some(StoreError::NotEnoughSpace);
        return None
      }
    };

    unsafe {
      ptr::copy_nonoverlapping(key.as_ptr(), key_copy.as_ptr(), key.len());
      (*node).key = key_copy.as_ptr();

      if !Self::chain_in(inner.buckets, inner.bucket_count, node) {
        self.release_node(node);
        inner.last_error = Some(StoreError::SymbolExists);
        return None
      }
    }

    inner.populated += 1;
    inner.last_error = None;

    Some(unsafe { NonNull::new_unchecked(node as *mut Symbol) })
  }

  /// Retrieve the Symbol stored at the given key, or None when the key is
  /// absent or the store is uninitialised
  pub fn lookup (&self, key: &str) -> Option<NonNull<Symbol>> {
    let inner = self.inner.lock();

    if inner.buckets.is_null() { return None }

    let key = key.as_bytes();
    let hash = sdbm(key) as u64;

    unsafe {
      let mut node = inner.bucket((hash % inner.bucket_count as u64) as u32);

      while !node.is_null() {
        if (*node).matches(hash, key) {
          return Some(NonNull::new_unchecked(node as *mut Symbol))
        }

        node = (*node).chain_next;
      }
    }

    None
  }

  /// Delete the Symbol stored at the given key, releasing its key copy and
  /// its record. Returns true iff a symbol was removed
  pub fn delete (&self, key: &str) -> bool {
    let mut inner = self.inner.lock();

    if inner.buckets.is_null() { return false }

    let key = key.as_bytes();
    let hash = sdbm(key) as u64;
    let idx = (hash % inner.bucket_count as u64) as u32;

    unsafe {
      let head = inner.bucket(idx);
      if head.is_null() { return false }

      let victim = if (*head).matches(hash, key) {
        inner.set_bucket(idx, (*head).chain_next);
        head
      } else {
        let mut prev = head;

        loop {
          let next = (*prev).chain_next;
          if next.is_null() { return false }

          if (*next).matches(hash, key) {
            (*prev).chain_next = (*next).chain_next;
            break next
          }

          prev = next;
        }
      };

      self.release_node(victim);
    }

    inner.populated -= 1;
    true
  }

  /// The last error recorded by an assignment; cleared by a successful one
  pub fn last_error (&self) -> Option<StoreError> {
    self.inner.lock().last_error
  }

  /// The estimated number of Symbols stored
  pub fn usage (&self) -> u32 {
    self.inner.lock().populated
  }

  /// The number of buckets currently allocated
  pub fn bucket_count (&self) -> u32 {
    self.inner.lock().bucket_count
  }

  /// Emit a human readable dump of the map state to the log
  pub fn log (&self, log_empty: bool) {
    let inner = self.inner.lock();

    log::debug!("FlatStorage : {:p}", self);
    log::debug!("    Bucket Count : {}", inner.bucket_count);
    log::debug!("    Usage        : {}", inner.populated);

    unsafe {
      for i in 0..inner.bucket_count {
        let mut node = inner.bucket(i);

        if node.is_null() {
          if log_empty { log::trace!("    [{:04}] : (empty)", i) }
          continue
        }

        let mut depth = 0;
        while !node.is_null() {
          log::trace!(
            "    [{:04}]{} : {:?}",
            i,
            if depth > 0 { " >" } else { "" },
            String::from_utf8_lossy((*node).key_bytes())
          );

          node = (*node).chain_next;
          depth += 1;
        }
      }
    }
  }
}

impl Drop for FlatStorage {
  fn drop (&mut self) {
    let (buckets, bucket_count) = {
      let inner = self.inner.get_mut();
      (inner.buckets, inner.bucket_count)
    };

    if buckets.is_null() { return }

    unsafe {
      for i in 0..bucket_count {
        let mut node = *buckets.add(i as usize);

        while !node.is_null() {
          let next = (*node).chain_next;
          self.release_node(node);
          node = next;
        }
      }

      self.allocator.release_array(NonNull::new_unchecked(buckets));
    }

    let inner = self.inner.get_mut();
    inner.buckets = ptr::null_mut();
    inner.bucket_count = 0;
    inner.populated = 0;
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn store () -> (Arc<CoreAllocator>, FlatStorage) {
    let alloc = Arc::new(CoreAllocator::new());
    let storage = FlatStorage::new(&alloc).unwrap();
    (alloc, storage)
  }

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
  fn test_assign_lookup_delete_round_trip () {
    let (_a, storage) = store();

    assert!(storage.assign(&data_request("KeyA")).is_some());
    assert!(storage.assign(&data_request("KeyB")).is_some());
    assert_eq!(storage.usage(), 2);

    assert!(storage.lookup("KeyA").is_some());
    assert!(storage.lookup("KeyB").is_some());
    assert!(storage.lookup("KeyC").is_none());

    assert!(storage.delete("KeyA"));
    assert!(storage.lookup("KeyA").is_none());
    assert!(storage.lookup("KeyB").is_some());

    // Deleting an absent key reports false
    assert!(!storage.delete("KeyA"));

    // Reinsertion works after deletion
    assert!(storage.assign(&data_request("KeyA")).is_some());
    assert!(storage.lookup("KeyA").is_some());
  }

  #[test]
  fn test_symbol_fields_round_trip () {
    let (_a, storage) = store();

    let mut payload = 42u64;

    let sym = storage.assign(&StorageRequest {
      kind: SymbolType::Extended,
      extended_type: 0xBEEF,
      key: "ext",
      value: &mut payload as *mut u64 as *mut u8,
      value_size: 8,
    }).unwrap();

    let found = storage.lookup("ext").unwrap();
    assert_eq!(found, sym);

    let sym = unsafe { found.as_ref() };
    assert_eq!(sym.kind, SymbolType::Extended);
    assert_eq!(sym.extended_type, 0xBEEF);
    assert_eq!(unsafe { *sym.cast_value::<u64>() }, 42);
  }

  #[test]
  fn test_duplicate_key_rejected () {
    let (_a, storage) = store();

    assert!(storage.assign(&data_request("dup")).is_some());
    assert!(storage.assign(&data_request("dup")).is_none());
    assert_eq!(storage.last_error(), Some(StoreError::SymbolExists));
    assert_eq!(storage.usage(), 1);
  }

  #[test]
  fn test_invalid_keys_rejected () {
    let (_a, storage) = store();

    assert!(storage.assign(&data_request("")).is_none());
    assert_eq!(storage.last_error(), Some(StoreError::InvalidKey));

    let long = "k".repeat(255);
    assert!(storage.assign(&data_request(&long)).is_none());
    assert_eq!(storage.last_error(), Some(StoreError::InvalidKey));

    let max = "k".repeat(254);
    assert!(storage.assign(&data_request(&max)).is_some());
  }

  /// Find `count` keys that all land in the same bucket of a fresh store
  fn colliding_keys (count: usize) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let target = sdbm(b"collide-0") % FlatStorage::BASE_BUCKETS;

    let mut i = 0;
    while found.len() < count {
      let key = format!("collide-{}", i);
      if sdbm(key.as_bytes()) % FlatStorage::BASE_BUCKETS == target {
        found.push(key)
      }
      i += 1;
    }

    found
  }

  #[test]
  fn test_collision_chain () {
    let (_a, storage) = store();
    let keys = colliding_keys(3);

    for key in &keys {
      assert!(storage.assign(&data_request(key)).is_some());
    }

    for key in &keys {
      assert!(storage.lookup(key).is_some());
    }

    // Delete the middle of the chain, then the head
    assert!(storage.delete(&keys[1]));
    assert!(storage.lookup(&keys[1]).is_none());
    assert!(storage.lookup(&keys[0]).is_some());
    assert!(storage.lookup(&keys[2]).is_some());

    assert!(storage.delete(&keys[0]));
    assert!(storage.lookup(&keys[2]).is_some());
  }

  #[test]
  fn test_growth_preserves_symbols () {
    let (_a, storage) = store();

    assert_eq!(storage.bucket_count(), 32);

    for i in 0..31 {
      assert!(storage.assign(&data_request(&format!("sym-{}", i))).is_some());
    }
    assert_eq!(storage.bucket_count(), 32);

    // The 32nd assignment triggers a grow step first
    assert!(storage.assign(&data_request("sym-31")).is_some());
    assert_eq!(storage.bucket_count(), 48);
    assert_eq!(storage.usage(), 32);

    for i in 0..32 {
      assert!(storage.lookup(&format!("sym-{}", i)).is_some(), "sym-{} lost in grow", i);
    }
  }

  #[test]
  fn test_store_accounting_round_trip () {
    let alloc = Arc::new(CoreAllocator::new());

    {
      let storage = FlatStorage::new(&alloc).unwrap();
      for i in 0..40 {
        storage.assign(&data_request(&format!("sym-{}", i)));
      }
      assert!(alloc.system_bytes() > 0);
    }

    // Dropping the store returns every node, key, and the bucket array
    assert_eq!(alloc.system_bytes(), 0);
    assert!(alloc.validate().is_ok());
  }
}
