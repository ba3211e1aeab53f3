use std::collections::VecDeque;

use super::chunk::{PoolChunk, RegionHandle};

/// Slab index of a chunk within its arena. Stable for the chunk's lifetime;
/// an id is only reused after the chunk it named was destroyed, which the
/// arena only does once nothing (buffer or cache entry) references it.
pub(crate) type ChunkId = usize;

/// Arena-owned chunk storage. Chunks are linked into lists by id instead of
/// by intrusive pointers, which keeps the ownership story trivial: the slab
/// owns every chunk, the lists and caches only hold ids.
pub(crate) struct ChunkSlab {
    slots: Vec<Option<PoolChunk>>,
    free_ids: Vec<ChunkId>,
}

impl ChunkSlab {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_ids: Vec::new(),
        }
    }

    pub fn insert(&mut self, chunk: PoolChunk) -> ChunkId {
        if let Some(id) = self.free_ids.pop() {
            debug_assert!(self.slots[id].is_none());
            self.slots[id] = Some(chunk);
            id
        } else {
            self.slots.push(Some(chunk));
            self.slots.len() - 1
        }
    }

    pub fn remove(&mut self, id: ChunkId) -> PoolChunk {
        let chunk = self.slots[id].take().expect("removing a vacant chunk slot");
        self.free_ids.push(id);
        chunk
    }

    pub fn get(&self, id: ChunkId) -> &PoolChunk {
        self.slots[id].as_ref().expect("vacant chunk slot")
    }

    pub fn get_mut(&mut self, id: ChunkId) -> &mut PoolChunk {
        self.slots[id].as_mut().expect("vacant chunk slot")
    }

    /// Number of live chunks.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_ids.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id))
    }
}

/// What a list allocation should carve out of a chunk.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ListRequest {
    /// A page run of the given normalized capacity.
    Run(usize),
    /// A fresh leaf page split into subpage elements of the given size.
    Subpage { elem_size: usize },
}

/// Result of a successful list allocation.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ListGrant {
    Run(RegionHandle),
    /// Leaf node carrying the newly created subpage.
    SubpageLeaf(u32),
}

/// One utilization bucket of the arena's chunk chain.
///
/// Thresholds are precomputed in free-byte space. The `0.99999999` percent
/// compensation makes the integer comparison land exactly on the percentage
/// boundary; without it a chunk at precisely `max_usage` percent oscillates
/// between adjacent lists.
pub(crate) struct ChunkList {
    pub min_usage: i32,
    pub max_usage: i32,
    /// Allocation moves the chunk up when `free_bytes <= free_min_threshold`.
    /// Signed: for a list with no usage ceiling this is negative and the
    /// comparison can never trigger.
    free_min_threshold: i64,
    /// Freeing moves the chunk down when `free_bytes > free_max_threshold`.
    free_max_threshold: i64,
    /// Largest normalized capacity this list promises to serve, derived
    /// from `min_usage`: every resident chunk has at least this many bytes
    /// free.
    max_capacity: usize,
    pub next: Option<usize>,
    pub prev: Option<usize>,
    /// Resident chunk ids, most recently touched first.
    chunks: VecDeque<ChunkId>,
}

impl ChunkList {
    pub fn new(min_usage: i32, max_usage: i32, chunk_size: usize) -> Self {
        debug_assert!(min_usage <= max_usage);
        Self {
            min_usage,
            max_usage,
            free_min_threshold: if max_usage == 100 {
                0
            } else {
                threshold(chunk_size, max_usage)
            },
            free_max_threshold: if min_usage == 100 {
                0
            } else {
                threshold(chunk_size, min_usage)
            },
            max_capacity: calculate_max_capacity(min_usage, chunk_size),
            next: None,
            prev: None,
            chunks: VecDeque::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.contains(&id)
    }

    fn unlink(&mut self, id: ChunkId) {
        let pos = self
            .chunks
            .iter()
            .position(|&c| c == id)
            .expect("chunk not resident in its recorded list");
        self.chunks.remove(pos);
    }
}

fn threshold(chunk_size: usize, usage: i32) -> i64 {
    // Free-byte bound for a usage-percentage bound, rounded up just past the
    // exact boundary. Sentinel bounds fall out naturally: usage == i32::MIN
    // (the init list floor) gives an unreachably high threshold, usage
    // above 100 (the full list ceiling) a negative one.
    let t = chunk_size as f64 * (100.0 - f64::from(usage) + 0.999_999_99) / 100.0;
    t as i64
}

fn calculate_max_capacity(min_usage: i32, chunk_size: usize) -> usize {
    let min_usage = min_usage.max(1);
    if min_usage >= 100 {
        // Fully-used chunks can serve nothing.
        return 0;
    }
    chunk_size * (100 - min_usage as usize) / 100
}

/// Try to satisfy `request` from any chunk resident in `lists[idx]`,
/// migrating the winning chunk upward when the allocation pushes its free
/// bytes at or below this list's lower threshold.
pub(crate) fn allocate(
    lists: &mut [ChunkList],
    chunks: &mut ChunkSlab,
    idx: usize,
    request: ListRequest,
) -> Option<(ChunkId, ListGrant)> {
    let needed = match request {
        ListRequest::Run(norm) => norm,
        ListRequest::Subpage { .. } => 0, // one page; gated below per chunk
    };
    if lists[idx].chunks.is_empty() || needed > lists[idx].max_capacity {
        return None;
    }
    let candidates: Vec<ChunkId> = lists[idx].chunks.iter().copied().collect();
    for id in candidates {
        let chunk = chunks.get_mut(id);
        let grant = match request {
            ListRequest::Run(norm) => chunk.allocate_run(norm).map(ListGrant::Run),
            ListRequest::Subpage { elem_size } => {
                chunk.create_subpage(elem_size).map(ListGrant::SubpageLeaf)
            }
        };
        let Some(grant) = grant else { continue };
        if (chunks.get(id).free_bytes() as i64) <= lists[idx].free_min_threshold {
            let next = lists[idx]
                .next
                .expect("chunk crossed the top list's lower threshold");
            lists[idx].unlink(id);
            add(lists, chunks, next, id);
        }
        return Some((id, grant));
    }
    None
}

/// Insert a chunk into `lists[idx]`, cascading upward while its free bytes
/// sit at or below the target list's lower threshold.
pub(crate) fn add(lists: &mut [ChunkList], chunks: &mut ChunkSlab, idx: usize, id: ChunkId) {
    let mut idx = idx;
    while (chunks.get(id).free_bytes() as i64) <= lists[idx].free_min_threshold {
        idx = lists[idx]
            .next
            .expect("no list accepts a chunk this utilized");
    }
    lists[idx].chunks.push_front(id);
    chunks.get_mut(id).list = Some(idx);
}

/// After bytes were returned to `id`, migrate it down the chain until it
/// settles in a matching list. Returns `false` when the chunk fell below the
/// floor of the lowest list (no `prev`) — the caller must destroy it.
pub(crate) fn settle_after_free(
    lists: &mut [ChunkList],
    chunks: &mut ChunkSlab,
    id: ChunkId,
) -> bool {
    let idx = chunks
        .get(id)
        .list
        .expect("freed into a chunk resident in no list");
    if (chunks.get(id).free_bytes() as i64) <= lists[idx].free_max_threshold {
        return true;
    }
    lists[idx].unlink(id);
    chunks.get_mut(id).list = None;
    move_down(lists, chunks, idx, id)
}

fn move_down(lists: &mut [ChunkList], chunks: &mut ChunkSlab, idx: usize, id: ChunkId) -> bool {
    match lists[idx].prev {
        None => {
            debug_assert!(chunks.get(id).is_unused(), "destroying a chunk in use");
            false
        }
        Some(prev) if prev == idx => {
            // Self-linked floor (the init list): never destroyed from here.
            lists[idx].chunks.push_front(id);
            chunks.get_mut(id).list = Some(idx);
            true
        }
        Some(prev) => move_into(lists, chunks, prev, id),
    }
}

fn move_into(lists: &mut [ChunkList], chunks: &mut ChunkSlab, idx: usize, id: ChunkId) -> bool {
    if (chunks.get(id).free_bytes() as i64) > lists[idx].free_max_threshold {
        // Still too free for this bucket; keep descending.
        return move_down(lists, chunks, idx, id);
    }
    lists[idx].chunks.push_front(id);
    chunks.get_mut(id).list = Some(idx);
    true
}
