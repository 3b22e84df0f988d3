//! Fibonacci buddy allocator.
//!
//! Blocks are sized along the generalized Fibonacci sequence
//! `a(n) = a(n-1) + a(n-4)` and split into *unequal* buddy pairs: two
//! adjacent terms of the sequence summing to the parent. Three header bits
//! per block are enough to merge any freed pair back into its parent without
//! external bookkeeping. Backing memory comes from the host allocator in
//! chunks that are themselves sequence terms.

#![allow(clippy::missing_safety_doc)]

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
};

// =============================================================================
// Constants
// =============================================================================

/// Bytes per block. Block sizes are counted in these units.
const BLOCK_SIZE: usize = 8;
const WORD_SIZE: usize = size_of::<usize>();
/// One machine word of header precedes every user area.
const HEADER_SIZE: usize = WORD_SIZE;

/// Sequence seed `a(0)..a(3)`, in blocks. The smallest term must hold a
/// header plus the two list words a free block carries.
#[cfg(target_pointer_width = "64")]
const SEED: [usize; 4] = [3, 4, 5, 7];
#[cfg(target_pointer_width = "32")]
const SEED: [usize; 4] = [2, 3, 4, 5];
#[cfg(target_pointer_width = "16")]
const SEED: [usize; 4] = [1, 2, 3, 4];

/// Terms the ladder starts with.
#[cfg(target_pointer_width = "64")]
const LADDER_INIT_TERMS: usize = 11;
#[cfg(target_pointer_width = "32")]
const LADDER_INIT_TERMS: usize = 10;
#[cfg(target_pointer_width = "16")]
const LADDER_INIT_TERMS: usize = 9;

/// Cells the initial ladder storage can hold before relocating.
const LADDER_INIT_CAPACITY: usize = 16;

const MIN_SIZE: usize = SEED[0];

/// First `LADDER_INIT_TERMS` terms of the sequence.
const INITIAL_TERMS: [usize; LADDER_INIT_TERMS] = initial_terms();

/// Smallest seed term whose block can carry the initial cell array.
const BOOTSTRAP_TERM: usize = bootstrap_term();

// Header word layout: size in bits [3..W), flags in bits [0..3).
const SIZE_SHIFT: u32 = 3;
const FLAG_MASK: usize = 0b111;
const IN_USE_BIT: usize = 1 << 2;
const LR_BIT: usize = 1 << 1;
const INH_BIT: usize = 1 << 0;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(BLOCK_SIZE.is_power_of_two());
// A free block stores its header plus the prev/next list words in place.
const _: () = assert!(MIN_SIZE * BLOCK_SIZE >= HEADER_SIZE + 2 * WORD_SIZE);
const _: () = assert!(SEED[0] < SEED[1] && SEED[1] < SEED[2] && SEED[2] < SEED[3]);
const _: () = assert!(LADDER_INIT_TERMS >= 5);
const _: () = assert!(LADDER_INIT_TERMS <= LADDER_INIT_CAPACITY);
const _: () = assert!(size_of::<Cell>() == 2 * WORD_SIZE);
// The seed is self-hosting: one seed term covers the initial cell storage.
const _: () = assert!(BOOTSTRAP_TERM >= blocks_for(LADDER_INIT_CAPACITY * size_of::<Cell>()));

// =============================================================================
// Block header codec
// =============================================================================

/// Which side of a split a block is, as stored in the `lr` bit.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
  Left = 0,
  Right = 1,
}

impl Side {
  #[inline(always)]
  fn from_bit(set: bool) -> Self {
    if set { Side::Right } else { Side::Left }
  }
}

/// Handle to a raw block: one header word followed by the user area.
///
/// While a block is free, the first two words of its area hold the `prev`
/// and `next` pointers of its cell's list. Constructed only over
/// engine-owned memory; accessors dereference without further checks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Block(*mut usize);

impl Block {
  const NULL: Block = Block(null_mut());

  #[inline(always)]
  fn is_null(self) -> bool {
    self.0.is_null()
  }

  /// Block owning `area`, one word back.
  #[inline(always)]
  unsafe fn from_area(area: *mut u8) -> Self {
    Block(unsafe { (area as *mut usize).sub(1) })
  }

  /// User area, one word past the header.
  #[inline(always)]
  fn area(self) -> *mut u8 {
    unsafe { self.0.add(1) as *mut u8 }
  }

  /// Size in blocks.
  #[inline(always)]
  fn size(self) -> usize {
    unsafe { *self.0 >> SIZE_SHIFT }
  }

  #[inline(always)]
  fn set_size(self, size: usize) {
    unsafe { *self.0 = (*self.0 & FLAG_MASK) | (size << SIZE_SHIFT) };
  }

  #[inline(always)]
  fn in_use(self) -> bool {
    unsafe { *self.0 & IN_USE_BIT != 0 }
  }

  #[inline(always)]
  fn set_in_use(self, in_use: bool) {
    let bit = if in_use { IN_USE_BIT } else { 0 };
    unsafe { *self.0 = (*self.0 & !IN_USE_BIT) | bit };
  }

  #[inline(always)]
  fn lr(self) -> Side {
    Side::from_bit(unsafe { *self.0 & LR_BIT != 0 })
  }

  #[inline(always)]
  fn set_lr(self, side: Side) {
    unsafe { *self.0 = (*self.0 & !LR_BIT) | ((side as usize) << 1) };
  }

  #[inline(always)]
  fn inh(self) -> Side {
    Side::from_bit(unsafe { *self.0 & INH_BIT != 0 })
  }

  #[inline(always)]
  fn set_inh(self, side: Side) {
    unsafe { *self.0 = (*self.0 & !INH_BIT) | side as usize };
  }

  /// One store covering every header field, for memory whose header word is
  /// garbage or stale.
  #[inline(always)]
  fn set_header(self, size: usize, in_use: bool, lr: Side, inh: Side) {
    let mut word = size << SIZE_SHIFT;
    if in_use {
      word |= IN_USE_BIT;
    }
    word |= (lr as usize) << 1;
    word |= inh as usize;
    unsafe { *self.0 = word };
  }

  // List links live in the first two area words while the block is free.

  #[inline(always)]
  fn prev(self) -> Block {
    Block(unsafe { *self.0.add(1) } as *mut usize)
  }

  #[inline(always)]
  fn set_prev(self, prev: Block) {
    unsafe { *self.0.add(1) = prev.0 as usize };
  }

  #[inline(always)]
  fn next(self) -> Block {
    Block(unsafe { *self.0.add(2) } as *mut usize)
  }

  #[inline(always)]
  fn set_next(self, next: Block) {
    unsafe { *self.0.add(2) = next.0 as usize };
  }

  /// The position `blocks` blocks past this block's start.
  #[inline(always)]
  fn offset(self, blocks: usize) -> Block {
    Block(unsafe { (self.0 as *mut u8).add(blocks * BLOCK_SIZE) } as *mut usize)
  }

  /// The position `blocks` blocks before this block's start.
  #[inline(always)]
  fn offset_back(self, blocks: usize) -> Block {
    Block(unsafe { (self.0 as *mut u8).sub(blocks * BLOCK_SIZE) } as *mut usize)
  }
}

/// One rung of the size ladder: a sequence term and the head of the
/// doubly-linked list of free blocks of exactly that size.
#[repr(C)]
#[derive(Clone, Copy)]
struct Cell {
  size: usize,
  head: Block,
}

// =============================================================================
// Host allocator boundary
// =============================================================================

/// Draws `bytes` from the host allocator, pointer-aligned. Exhaustion is
/// fatal: partial engine state is already committed, so there is no retry
/// path to offer callers.
fn host_acquire(bytes: usize) -> *mut u8 {
  let ptr = unsafe { libc::malloc(bytes) } as *mut u8;
  if ptr.is_null() {
    panic!("host allocation of {bytes} bytes failed");
  }
  ptr
}

unsafe fn host_release(ptr: *mut u8) {
  unsafe { libc::free(ptr.cast()) };
}

// =============================================================================
// Engine
// =============================================================================

/// Fibonacci buddy sub-allocation engine.
///
/// Single-threaded by construction: every operation takes `&mut self`, and
/// the raw-pointer fields keep the type `!Send`/`!Sync`. Callers sharing an
/// engine across threads must serialize externally.
///
/// Dropping the engine releases every chunk back to the host; outstanding
/// user areas become invalid at that point.
pub struct FibAllocator {
  /// Cell storage, living inside `ladder_block`'s user area.
  cells: *mut Cell,
  /// Cells in use. `cells[i].size` for `i >= 4` is `[i-1] + [i-4]`.
  len: usize,
  /// Cells the storage holds before relocation.
  capacity: usize,
  /// Engine-owned in-use block carrying the cell storage.
  ladder_block: Block,
  /// Head of the chunk list, linked through each chunk's first word.
  chunks: *mut usize,
  /// Chunk bases and their block terms, for integrity checks.
  #[cfg(test)]
  chunk_terms: Vec<(usize, usize)>,
}

impl FibAllocator {
  /// Builds an engine with a freshly seeded ladder.
  ///
  /// The ladder describes blocks but also lives in one: the seed storage is
  /// the first chunk's block, held in-use by the engine itself. Later growth
  /// relocates it through the normal alloc/free path.
  pub fn new() -> Self {
    let mut engine = FibAllocator {
      cells: null_mut(),
      len: 0,
      capacity: 0,
      ladder_block: Block::NULL,
      chunks: null_mut(),
      #[cfg(test)]
      chunk_terms: Vec::new(),
    };

    let root = engine.acquire_chunk(BOOTSTRAP_TERM);
    root.set_in_use(true);
    engine.ladder_block = root;
    engine.cells = root.area() as *mut Cell;
    engine.capacity = LADDER_INIT_CAPACITY;
    engine.len = LADDER_INIT_TERMS;
    for (i, &size) in INITIAL_TERMS.iter().enumerate() {
      unsafe { engine.cells.add(i).write(Cell { size, head: Block::NULL }) };
    }
    engine
  }

  #[inline(always)]
  fn cell(&self, i: usize) -> &Cell {
    debug_assert!(i < self.len, "cell index {i} out of range (len {})", self.len);
    unsafe { &*self.cells.add(i) }
  }

  #[inline(always)]
  fn cell_mut(&mut self, i: usize) -> &mut Cell {
    debug_assert!(i < self.len, "cell index {i} out of range (len {})", self.len);
    unsafe { &mut *self.cells.add(i) }
  }

  #[inline(always)]
  fn cell_size(&self, i: usize) -> usize {
    self.cell(i).size
  }
}

impl Default for FibAllocator {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Free-list operations
// =============================================================================

impl FibAllocator {
  /// Detaches and returns the head of cell `i`'s list.
  fn take_first(&mut self, i: usize) -> Block {
    let item = self.cell(i).head;
    debug_assert!(!item.is_null(), "take_first on empty cell {i}");
    let next = item.next();
    if !next.is_null() {
      next.set_prev(Block::NULL);
    }
    self.cell_mut(i).head = next;
    item
  }

  /// Pushes `item` at the head of cell `i`'s list. `in_use` is left alone;
  /// callers decide.
  fn insert(&mut self, i: usize, item: Block) {
    debug_assert!(
      item.size() == self.cell_size(i),
      "inserting {}-block item into cell {i} of size {}",
      item.size(),
      self.cell_size(i),
    );
    let head = self.cell(i).head;
    item.set_next(head);
    if !head.is_null() {
      head.set_prev(item);
    }
    item.set_prev(Block::NULL);
    self.cell_mut(i).head = item;
  }

  /// Unlinks `item` from cell `i`. Found by pointer identity; the lists stay
  /// short because coalescing drains them, so the walk is cheap.
  fn delete(&mut self, i: usize, item: Block) {
    let mut curr = self.cell(i).head;
    while !curr.is_null() && curr != item {
      curr = curr.next();
    }
    debug_assert!(!curr.is_null(), "block {:p} not on cell {i}", item.0);
    if curr.is_null() {
      return;
    }
    let prev = curr.prev();
    let next = curr.next();
    if !prev.is_null() {
      prev.set_next(next);
    }
    if !next.is_null() {
      next.set_prev(prev);
    }
    if curr == self.cell(i).head {
      self.cell_mut(i).head = next;
    }
  }
}

// =============================================================================
// Splitter
// =============================================================================

impl FibAllocator {
  /// Carves `block`, resident at ladder index `i`, down toward `n` blocks.
  /// Each round shears the parent into the `[i-4]`/`[i-1]` pair, keeps the
  /// smallest side still covering `n`, and enqueues the other. Index 4 is
  /// the splitting floor: below it no child pair is defined.
  fn split(&mut self, mut i: usize, block: Block, n: usize) -> Block {
    let mut curr = block;
    while i > 4 && self.cell_size(i - 1) >= n {
      let szl = self.cell_size(i - 4);
      let szr = self.cell_size(i - 1);
      // The parent's identity moves down: its `lr` into the left child's
      // `inh`, its `inh` into the right child's. A merge rebuilds the
      // parent header from exactly these two bits.
      let inh_l = curr.lr();
      let inh_r = curr.inh();
      let left = curr;
      let right = curr.offset(szl);
      left.set_header(szl, false, Side::Left, inh_l);
      right.set_header(szr, false, Side::Right, inh_r);
      if szl >= n {
        self.insert(i - 1, right);
        i -= 4;
        curr = left;
      } else {
        self.insert(i - 4, left);
        i -= 1;
        curr = right;
      }
    }
    curr
  }
}

// =============================================================================
// Coalescer
// =============================================================================

impl FibAllocator {
  /// Buddy of `item`, resident at index `i`, and the buddy's ladder index.
  /// A left block's buddy sits right after it, three rungs up; a right
  /// block's buddy sits `[i-3]` blocks before it.
  fn buddy_of(&self, item: Block, i: usize) -> (Block, usize) {
    if item.lr() == Side::Left {
      (item.offset(item.size()), i + 3)
    } else {
      let j = i - 3;
      (item.offset_back(self.cell_size(j)), j)
    }
  }

  /// Merges the head of cell `i` with its buddy while the buddy is free and
  /// whole. The chunk sentinel is permanently in use, so the walk never
  /// crosses a chunk boundary.
  fn coalesce(&mut self, mut i: usize) {
    let mut item = self.cell(i).head;
    loop {
      let (buddy, j) = self.buddy_of(item, i);
      // `in_use` first: the sentinel's index would be past the ladder.
      if buddy.in_use() || buddy.size() != self.cell_size(j) {
        return;
      }
      self.delete(i, item);
      self.delete(j, buddy);
      let (left, right, parent) = if item.lr() == Side::Left {
        (item, buddy, i + 4)
      } else {
        (buddy, item, i + 1)
      };
      // Both inheritance bits are read before the left header is rewritten.
      // `in_use` needs no touch: both halves were free.
      let lr = left.inh();
      let inh = right.inh();
      left.set_size(self.cell_size(parent));
      left.set_lr(lr);
      left.set_inh(inh);
      self.insert(parent, left);
      item = left;
      i = parent;
    }
  }
}

// =============================================================================
// Chunk source
// =============================================================================

impl FibAllocator {
  /// Draws a fresh chunk holding one free block of `n` blocks, links it on
  /// the chunk list, and plants the fake-right sentinel that stops
  /// coalescing at the chunk's end.
  fn acquire_chunk(&mut self, n: usize) -> Block {
    let raw = host_acquire(n * BLOCK_SIZE + 2 * WORD_SIZE);

    let link = raw as *mut usize;
    unsafe { *link = self.chunks as usize };
    self.chunks = link;
    #[cfg(test)]
    self.chunk_terms.push((raw as usize, n));

    let sentinel = Block(unsafe { raw.add(WORD_SIZE + n * BLOCK_SIZE) } as *mut usize);
    sentinel.set_header(0, true, Side::Right, Side::Left);

    let block = Block(unsafe { raw.add(WORD_SIZE) } as *mut usize);
    block.set_header(n, false, Side::Left, Side::Left);
    block
  }
}

impl Drop for FibAllocator {
  fn drop(&mut self) {
    // The ladder storage lives inside a chunk, so releasing the chunk list
    // returns everything, outstanding user areas included.
    let mut chunk = self.chunks;
    while !chunk.is_null() {
      let next = unsafe { *chunk } as *mut usize;
      unsafe { host_release(chunk as *mut u8) };
      chunk = next;
    }
    self.chunks = null_mut();
  }
}

// =============================================================================
// Ladder growth
// =============================================================================

impl FibAllocator {
  /// Index of the smallest term covering `n` blocks, extending the ladder
  /// when the sequence has not reached `n` yet. Extension always precedes a
  /// chunk draw, so chunk sizes are resident terms.
  fn covering_index(&mut self, n: usize) -> usize {
    let mut i = 0;
    loop {
      if i == self.len {
        self.extend_by_one();
      }
      if self.cell_size(i) >= n {
        return i;
      }
      i += 1;
    }
  }

  /// Appends the next term, `[len-1] + [len-4]`, with an empty list.
  fn extend_by_one(&mut self) {
    if self.len == self.capacity {
      self.grow_storage();
    }
    let size = self.cell_size(self.len - 1) + self.cell_size(self.len - 4);
    debug_assert!(size > self.cell_size(self.len - 1), "term overflow at {}", self.len);
    unsafe { self.cells.add(self.len).write(Cell { size, head: Block::NULL }) };
    self.len += 1;
  }

  /// Doubles the cell storage, relocating through the engine itself: the
  /// replacement array is a normally allocated block and the old one goes
  /// back through the normal free path.
  fn grow_storage(&mut self) {
    let new_capacity = self.capacity * 2;
    let n = blocks_for(new_capacity * size_of::<Cell>());
    // A full ladder's top term dwarfs its own storage need, so relocation
    // never re-enters extension.
    debug_assert!(
      self.cell_size(self.len - 1) >= n,
      "ladder of {} terms cannot host {n} blocks of cell storage",
      self.len,
    );
    let block = self.alloc_blocks(n);
    let new_cells = block.area() as *mut Cell;
    unsafe { core::ptr::copy_nonoverlapping(self.cells, new_cells, self.len) };
    let old = self.ladder_block;
    self.cells = new_cells;
    self.capacity = new_capacity;
    self.ladder_block = block;
    self.free_block(old);
  }
}

// =============================================================================
// Allocation and release
// =============================================================================

impl FibAllocator {
  /// Returns a pointer-aligned region of at least `size` bytes (a zero-byte
  /// request is served as one byte). The bytes are uninitialized. Infallible
  /// in the caller-visible sense; host exhaustion is fatal.
  pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
    let n = blocks_for(size.max(1));
    let block = self.alloc_blocks(n);
    // Blocks always trail a non-null header word.
    unsafe { NonNull::new_unchecked(block.area()) }
  }

  /// Returns `area` to the engine.
  ///
  /// # Safety
  ///
  /// `area` must have been returned by this engine's [`alloc`](Self::alloc)
  /// and not freed since. Foreign and repeated pointers are undefined
  /// behavior; no validation is performed.
  pub unsafe fn free(&mut self, area: NonNull<u8>) {
    let block = unsafe { Block::from_area(area.as_ptr()) };
    debug_assert!(block.in_use(), "freeing a block that is not in use: {area:p}");
    self.free_block(block);
  }

  /// Obtains an in-use block of at least `n` blocks: the smallest stocked
  /// cell that covers `n`, or a fresh chunk of the smallest covering term.
  /// A fresh chunk never splits, because no smaller term covers `n`.
  fn alloc_blocks(&mut self, n: usize) -> Block {
    let (i, block) = match self.smallest_stocked(n) {
      Some(i) => {
        let block = self.take_first(i);
        (i, block)
      }
      None => {
        let i = self.covering_index(n);
        let block = self.acquire_chunk(self.cell_size(i));
        (i, block)
      }
    };
    let block = self.split(i, block, n);
    block.set_in_use(true);
    block
  }

  /// Smallest cell covering `n` blocks with a non-empty list.
  fn smallest_stocked(&self, n: usize) -> Option<usize> {
    (0..self.len).find(|&i| self.cell_size(i) >= n && !self.cell(i).head.is_null())
  }

  /// Release path shared by user frees and ladder relocation. Sizes are
  /// unique along the ladder, so the cell is found by scanning from the
  /// bottom.
  fn free_block(&mut self, block: Block) {
    let size = block.size();
    let mut i = 0;
    while self.cell_size(i) != size {
      i += 1;
    }
    block.set_in_use(false);
    self.insert(i, block);
    self.coalesce(i);
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
thread_local! {
  static ENGINE: core::cell::UnsafeCell<Option<FibAllocator>> =
    const { core::cell::UnsafeCell::new(None) };
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn mem_init() {
  ENGINE.with(|e| unsafe { *e.get() = Some(FibAllocator::new()) });
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn mem_finalize() {
  ENGINE.with(|e| unsafe { *e.get() = None });
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mem_alloc(size: usize) -> *mut u8 {
  ENGINE.with(|e| match unsafe { &mut *e.get() } {
    Some(engine) => engine.alloc(size).as_ptr(),
    None => null_mut(),
  })
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mem_free(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else {
    return;
  };
  ENGINE.with(|e| {
    if let Some(engine) = unsafe { &mut *e.get() } {
      unsafe { engine.free(ptr) };
    }
  });
}

// =============================================================================
// Utils
// =============================================================================

/// Blocks needed to carry `bytes` of payload plus the header word.
#[inline(always)]
const fn blocks_for(bytes: usize) -> usize {
  match bytes.checked_add(HEADER_SIZE) {
    Some(total) => total.div_ceil(BLOCK_SIZE),
    None => panic!("allocation size overflow"),
  }
}

const fn initial_terms() -> [usize; LADDER_INIT_TERMS] {
  let mut terms = [0; LADDER_INIT_TERMS];
  terms[0] = SEED[0];
  terms[1] = SEED[1];
  terms[2] = SEED[2];
  terms[3] = SEED[3];
  let mut i = 4;
  while i < LADDER_INIT_TERMS {
    terms[i] = terms[i - 1] + terms[i - 4];
    i += 1;
  }
  terms
}

const fn bootstrap_term() -> usize {
  let need = blocks_for(LADDER_INIT_CAPACITY * size_of::<Cell>());
  let mut i = 0;
  while i < LADDER_INIT_TERMS {
    if INITIAL_TERMS[i] >= need {
      return INITIAL_TERMS[i];
    }
    i += 1;
  }
  panic!("no seed term covers the initial cell storage");
}

// =============================================================================
// Test introspection
// =============================================================================

#[cfg(test)]
impl FibAllocator {
  fn ladder_len(&self) -> usize {
    self.len
  }

  fn ladder_capacity(&self) -> usize {
    self.capacity
  }

  fn block_size_of(&self, area: NonNull<u8>) -> usize {
    unsafe { Block::from_area(area.as_ptr()) }.size()
  }

  fn free_count(&self, i: usize) -> usize {
    let mut count = 0;
    let mut item = self.cell(i).head;
    while !item.is_null() {
      count += 1;
      item = item.next();
    }
    count
  }

  /// Sizes of every free block, ascending.
  fn free_sizes(&self) -> Vec<usize> {
    let mut sizes = Vec::new();
    for i in 0..self.len {
      let mut item = self.cell(i).head;
      while !item.is_null() {
        sizes.push(item.size());
        item = item.next();
      }
    }
    sizes.sort_unstable();
    sizes
  }

  fn chunk_count(&self) -> usize {
    let mut count = 0;
    let mut chunk = self.chunks;
    while !chunk.is_null() {
      count += 1;
      chunk = unsafe { *chunk } as *mut usize;
    }
    count
  }

  /// Checks every structural invariant the engine promises between calls.
  fn assert_invariants(&self) {
    assert!(self.len >= 5 && self.len <= self.capacity);
    assert!(self.ladder_block.in_use(), "ladder storage block must stay in use");
    assert_eq!(self.chunk_terms.len(), self.chunk_count());

    for i in 1..self.len {
      assert!(
        self.cell_size(i) > self.cell_size(i - 1),
        "ladder sizes not strictly increasing at {i}",
      );
    }
    for i in 4..self.len {
      assert_eq!(
        self.cell_size(i),
        self.cell_size(i - 1) + self.cell_size(i - 4),
        "sequence recurrence broken at {i}",
      );
    }

    for i in 0..self.len {
      let mut prev = Block::NULL;
      let mut item = self.cell(i).head;
      while !item.is_null() {
        assert_eq!(item.size(), self.cell_size(i), "mis-filed block on cell {i}");
        assert!(!item.in_use(), "in-use block on cell {i}'s free list");
        assert_eq!(item.prev(), prev, "broken prev link on cell {i}");
        // Eager coalescing: no free block may face a free, whole buddy.
        let (buddy, j) = self.buddy_of(item, i);
        if !buddy.in_use() {
          assert!(j < self.len, "free buddy of a free block must be on the ladder");
          assert_ne!(
            buddy.size(),
            self.cell_size(j),
            "free whole buddy pair left unmerged at cell {i}",
          );
        }
        prev = item;
        item = item.next();
      }
    }

    // Chunk sentinels are immortal: still sized zero, right, in use.
    for &(base, term) in &self.chunk_terms {
      let sentinel = Block((base + WORD_SIZE + term * BLOCK_SIZE) as *mut usize);
      assert_eq!(sentinel.size(), 0, "sentinel size clobbered");
      assert!(sentinel.in_use(), "sentinel no longer in use");
      assert_eq!(sentinel.lr(), Side::Right, "sentinel side clobbered");
    }
  }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use rand::{Rng, SeedableRng, rngs::StdRng};

  fn fill(area: NonNull<u8>, size: usize, byte: u8) {
    unsafe { area.as_ptr().write_bytes(byte, size) };
  }

  fn assert_intact(area: NonNull<u8>, size: usize, byte: u8) {
    let bytes = unsafe { core::slice::from_raw_parts(area.as_ptr(), size) };
    assert!(bytes.iter().all(|&b| b == byte), "live area was mutated by the engine");
  }

  #[test]
  fn header_bits_are_independent() {
    let mut word: usize = 0;
    let block = Block(&mut word);

    block.set_header(14, false, Side::Left, Side::Right);
    assert_eq!(block.size(), 14);
    assert!(!block.in_use());
    assert_eq!(block.lr(), Side::Left);
    assert_eq!(block.inh(), Side::Right);

    block.set_in_use(true);
    assert_eq!(block.size(), 14);
    assert_eq!(block.lr(), Side::Left);
    assert_eq!(block.inh(), Side::Right);

    block.set_size(345);
    assert!(block.in_use());
    assert_eq!(block.lr(), Side::Left);
    assert_eq!(block.inh(), Side::Right);

    block.set_lr(Side::Right);
    block.set_inh(Side::Left);
    assert_eq!(block.size(), 345);
    assert!(block.in_use());
    assert_eq!(block.lr(), Side::Right);
    assert_eq!(block.inh(), Side::Left);
  }

  #[test]
  #[cfg(target_pointer_width = "64")]
  fn block_counts_round_up_past_the_header() {
    assert_eq!(blocks_for(1), 2);
    assert_eq!(blocks_for(40), 6);
    assert_eq!(blocks_for(100), 14);
    assert_eq!(blocks_for(1000), 126);
    assert_eq!(blocks_for(1500), 189);
  }

  #[test]
  fn new_engine_is_seeded() {
    let engine = FibAllocator::new();
    assert_eq!(engine.ladder_len(), LADDER_INIT_TERMS);
    assert_eq!(engine.ladder_capacity(), LADDER_INIT_CAPACITY);
    for (i, &term) in INITIAL_TERMS.iter().enumerate() {
      assert_eq!(engine.cell_size(i), term);
      assert_eq!(engine.free_count(i), 0);
    }
    // One chunk so far: the one the ladder itself lives in.
    assert_eq!(engine.chunk_count(), 1);
    engine.assert_invariants();
  }

  #[test]
  fn min_requests_take_smallest_term_blocks() {
    let mut engine = FibAllocator::new();
    let x = engine.alloc(1);
    assert_eq!(engine.block_size_of(x), MIN_SIZE);
    let y = engine.alloc(0);
    assert_eq!(engine.block_size_of(y), MIN_SIZE);
    assert_ne!(x, y);
    engine.assert_invariants();
    unsafe {
      engine.free(x);
      engine.free(y);
    }
    engine.assert_invariants();
    assert_eq!(engine.free_sizes(), vec![MIN_SIZE, MIN_SIZE]);
  }

  #[test]
  #[cfg(target_pointer_width = "64")]
  fn fresh_chunks_use_the_smallest_covering_term() {
    let mut engine = FibAllocator::new();

    // 100 bytes need 14 blocks; 14 is a term, so the chunk matches exactly.
    let a = engine.alloc(100);
    assert_eq!(engine.block_size_of(a), 14);
    assert!(engine.block_size_of(a) * BLOCK_SIZE - HEADER_SIZE >= 100);

    // 40 bytes need 6 blocks; nothing is stocked, so a 7-term chunk is drawn.
    let b = engine.alloc(40);
    assert_eq!(engine.block_size_of(b), 7);

    assert_eq!(engine.chunk_count(), 3); // ladder chunk + the two above
    unsafe {
      engine.free(a);
      engine.free(b);
    }
    // Each chunk's block is whole again.
    assert_eq!(engine.free_sizes(), vec![7, 14]);
    engine.assert_invariants();
  }

  #[test]
  #[cfg(target_pointer_width = "64")]
  fn sibling_buddies_merge_in_either_order() {
    let mut engine = FibAllocator::new();

    // 144 bytes need exactly 19 blocks; freeing stocks the 19-cell.
    let seed = engine.alloc(144);
    assert_eq!(engine.block_size_of(seed), 19);
    unsafe { engine.free(seed) };

    // Recycling the 19 splits it into the 5/14 sibling pair.
    let small = engine.alloc(30);
    assert_eq!(engine.block_size_of(small), 5);
    let large = engine.alloc(100);
    assert_eq!(engine.block_size_of(large), 14);

    // Left freed first.
    unsafe {
      engine.free(small);
      engine.free(large);
    }
    assert_eq!(engine.free_sizes(), vec![19]);
    engine.assert_invariants();

    // Same dance, right freed first.
    let small = engine.alloc(30);
    let large = engine.alloc(100);
    unsafe {
      engine.free(large);
      engine.free(small);
    }
    assert_eq!(engine.free_sizes(), vec![19]);
    assert_eq!(engine.chunk_count(), 2);
    engine.assert_invariants();
  }

  #[test]
  #[cfg(target_pointer_width = "64")]
  fn bottom_of_the_ladder_never_splits() {
    let mut engine = FibAllocator::new();

    // Stock the 10-cell (index 4), then ask for 3 blocks: 10 covers it but
    // sits at the splitting floor, so the whole block is handed out.
    let seed = engine.alloc(72);
    assert_eq!(engine.block_size_of(seed), 10);
    unsafe { engine.free(seed) };

    let p = engine.alloc(16);
    assert_eq!(engine.block_size_of(p), 10);
    unsafe { engine.free(p) };
    engine.assert_invariants();
  }

  #[test]
  fn identical_rounds_reuse_chunks() {
    let mut engine = FibAllocator::new();

    let mut round = |engine: &mut FibAllocator| {
      let a = engine.alloc(1000);
      let b = engine.alloc(1000);
      let c = engine.alloc(1000);
      #[cfg(target_pointer_width = "64")]
      assert_eq!(engine.block_size_of(a), 131);
      unsafe {
        engine.free(a);
        engine.free(b);
        engine.free(c);
      }
    };

    round(&mut engine);
    let chunks_after_first = engine.chunk_count();
    round(&mut engine);
    assert_eq!(engine.chunk_count(), chunks_after_first, "second round must not grow memory");
    engine.assert_invariants();
  }

  #[test]
  #[cfg(target_pointer_width = "64")]
  fn interleaved_split_chain_returns_to_one_root() {
    let mut engine = FibAllocator::new();

    let m = engine.alloc(1500);
    assert_eq!(engine.block_size_of(m), 250);
    unsafe { engine.free(m) };

    // Every request below is served out of the 250 root; no chunk is drawn.
    let a = engine.alloc(100);
    assert_eq!(engine.block_size_of(a), 14);
    let b = engine.alloc(250);
    assert_eq!(engine.block_size_of(b), 36);
    let c = engine.alloc(80);
    let d = engine.alloc(25);
    unsafe { engine.free(d) };
    unsafe { engine.free(a) };
    let e = engine.alloc(300);
    unsafe { engine.free(c) };
    unsafe { engine.free(b) };
    let f = engine.alloc(350);
    engine.assert_invariants();
    unsafe { engine.free(f) };
    unsafe { engine.free(e) };

    assert_eq!(engine.chunk_count(), 2); // ladder chunk + the 250 root
    assert_eq!(engine.free_sizes(), vec![250], "every split must fold back into the root");
    engine.assert_invariants();
  }

  #[test]
  fn ladder_extends_and_doubles_capacity() {
    let mut engine = FibAllocator::new();
    assert_eq!(engine.ladder_capacity(), LADDER_INIT_CAPACITY);

    let mut live = Vec::new();
    for size in [1usize, 10, 100, 1_000, 10_000, 100_000] {
      let p = engine.alloc(size);
      let top = engine.cell_size(engine.ladder_len() - 1);
      assert!(top >= blocks_for(size), "ladder top {top} cannot cover {size} bytes");
      live.push(p);
    }

    assert!(engine.ladder_len() > LADDER_INIT_CAPACITY);
    assert_eq!(engine.ladder_capacity(), 2 * LADDER_INIT_CAPACITY);
    engine.assert_invariants();

    for p in live {
      unsafe { engine.free(p) };
    }
    engine.assert_invariants();
  }

  #[test]
  fn live_areas_survive_engine_traffic() {
    let mut engine = FibAllocator::new();

    let a = engine.alloc(200);
    fill(a, 200, 0xAB);

    // Churn around the live area.
    for k in 0..50 {
      let p = engine.alloc(k * 7 + 1);
      unsafe { engine.free(p) };
    }
    let b = engine.alloc(512);
    fill(b, 512, 0xCD);

    assert_intact(a, 200, 0xAB);
    unsafe { engine.free(a) };
    assert_intact(b, 512, 0xCD);
    unsafe { engine.free(b) };
    engine.assert_invariants();
  }

  #[test]
  fn checksummed_random_workload() {
    const SLOTS: usize = 800;
    const EVENTS: usize = 1000;

    let mut engine = FibAllocator::new();
    let mut rng = StdRng::seed_from_u64(0x42);
    let mut slots: Vec<Option<(NonNull<u8>, usize, u8)>> = vec![None; SLOTS];

    for event in 0..EVENTS {
      let slot = rng.random_range(0..SLOTS);
      match slots[slot].take() {
        None => {
          let size = rng.random_range(1..=50_000);
          let area = engine.alloc(size);
          assert!(
            engine.block_size_of(area) * BLOCK_SIZE - HEADER_SIZE >= size,
            "area shorter than requested",
          );
          let byte = rng.random::<u8>();
          fill(area, size, byte);
          slots[slot] = Some((area, size, byte));
        }
        Some((area, size, byte)) => {
          assert_intact(area, size, byte);
          unsafe { engine.free(area) };
        }
      }
      if event % 100 == 0 {
        engine.assert_invariants();
      }
    }

    for slot in &mut slots {
      if let Some((area, size, byte)) = slot.take() {
        assert_intact(area, size, byte);
        unsafe { engine.free(area) };
      }
    }
    engine.assert_invariants();
  }
}
