use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use log::{info, warn};

#[cfg(debug_assertions)]
use log::debug;

use crate::{
    data_types::BufferId,
    error_codes::{TransportError, TransportResult},
};

/// Identifies a shared pool. Buffer sizes are rounded up to a power of two so that
/// channels with similar message sizes share the same size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolSpec {
    pub buffer_size: usize,

    /// Zero means the pool grows whenever it runs out of free buffers
    pub max_buffers: usize,
}

impl PoolSpec {
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1).next_power_of_two(),
            max_buffers,
        }
    }

    pub fn unbounded(buffer_size: usize) -> Self {
        Self::new(buffer_size, 0)
    }
}

enum Slot {
    Free(Vec<u8>),
    Leased,
    Vacant,
}

struct PoolState {
    slots: Vec<Slot>,
    free: Vec<BufferId>,
    vacant: Vec<BufferId>,
    leased: usize,
    closed: bool,
}

impl PoolState {
    fn allocated(self: &Self) -> usize {
        self.slots.len() - self.vacant.len()
    }
}

/// Arena of fixed capacity byte buffers. A buffer is either free in its slot or
/// leased out as a `PooledBuffer`, and a leased buffer finds its way back to its
/// slot when it is released or dropped.
pub struct BufferPool {
    spec: PoolSpec,
    state: Mutex<PoolState>,
    this: Weak<BufferPool>,
}

impl BufferPool {
    pub fn new(spec: PoolSpec) -> Arc<Self> {
        info!(
            "BufferPool: Created for {} byte buffers, limit {}",
            spec.buffer_size,
            if spec.max_buffers == 0 { "none".to_owned() } else { spec.max_buffers.to_string() }
        );
        Arc::new_cyclic(|this| Self {
            spec,
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                free: Vec::new(),
                vacant: Vec::new(),
                leased: 0,
                closed: false,
            }),
            this: this.clone(),
        })
    }

    pub fn spec(self: &Self) -> PoolSpec {
        self.spec
    }

    pub fn buffer_size(self: &Self) -> usize {
        self.spec.buffer_size
    }

    /// Hands out a free buffer, allocating a new one if the pool is allowed to grow
    pub fn acquire(self: &Self) -> TransportResult<PooledBuffer> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::InvalidState(format!(
                "pool of {} byte buffers is closed",
                self.spec.buffer_size
            )));
        }

        let (id, data) = if let Some(id) = state.free.pop() {
            match mem::replace(&mut state.slots[id as usize], Slot::Leased) {
                Slot::Free(data) => (id, data),
                _ => {
                    return Err(TransportError::InvalidState(format!(
                        "buffer {id} is on the free list but is not free"
                    )))
                }
            }
        } else if self.spec.max_buffers != 0 && state.allocated() >= self.spec.max_buffers {
            return Err(TransportError::ResourceExhausted(format!(
                "all {} buffers of {} bytes are in use",
                self.spec.max_buffers, self.spec.buffer_size
            )));
        } else if let Some(id) = state.vacant.pop() {
            state.slots[id as usize] = Slot::Leased;
            (id, Vec::with_capacity(self.spec.buffer_size))
        } else {
            let id = state.slots.len() as BufferId;
            state.slots.push(Slot::Leased);
            (id, Vec::with_capacity(self.spec.buffer_size))
        };

        state.leased += 1;

        #[cfg(debug_assertions)]
        debug!("BufferPool: Leased buffer {id}, {} outstanding", state.leased);

        Ok(PooledBuffer {
            id,
            data,
            capacity: self.spec.buffer_size,
            pool: self.this.clone(),
        })
    }

    /// Returns a buffer to the free set. Dropping the buffer has the same effect, this
    /// form also checks that the buffer came from this pool.
    pub fn release(self: &Self, buffer: PooledBuffer) -> TransportResult<()> {
        if !Weak::ptr_eq(&buffer.pool, &self.this) {
            return Err(TransportError::InvalidArgument(format!(
                "buffer {} does not belong to the pool of {} byte buffers",
                buffer.id, self.spec.buffer_size
            )));
        }
        drop(buffer);
        Ok(())
    }

    /// Allocates free buffers until at least `count` buffers exist or the limit is reached
    pub fn reserve(self: &Self, count: usize) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        let target = if self.spec.max_buffers == 0 { count } else { count.min(self.spec.max_buffers) };
        while state.allocated() < target {
            let data = Vec::with_capacity(self.spec.buffer_size);
            let id = match state.vacant.pop() {
                Some(id) => {
                    state.slots[id as usize] = Slot::Free(data);
                    id
                }
                None => {
                    state.slots.push(Slot::Free(data));
                    (state.slots.len() - 1) as BufferId
                }
            };
            state.free.push(id);
        }
    }

    /// Frees the memory held by buffers that are not leased
    pub fn shrink(self: &Self) {
        let mut state = self.state();
        let free = mem::take(&mut state.free);
        for id in free {
            state.slots[id as usize] = Slot::Vacant;
            state.vacant.push(id);
        }
    }

    /// Frees all idle buffers and refuses further leases. Buffers still leased are
    /// discarded when they come back.
    pub fn close(self: &Self) {
        self.shrink();
        let mut state = self.state();
        if !state.closed {
            state.closed = true;
            if state.leased > 0 {
                warn!(
                    "BufferPool: Closed {} byte pool with {} buffers still leased",
                    self.spec.buffer_size, state.leased
                );
            } else {
                info!("BufferPool: Closed {} byte pool", self.spec.buffer_size);
            }
        }
    }

    pub fn is_closed(self: &Self) -> bool {
        self.state().closed
    }

    /// Number of buffers currently leased out
    pub fn outstanding(self: &Self) -> usize {
        self.state().leased
    }

    pub fn free_count(self: &Self) -> usize {
        self.state().free.len()
    }

    pub fn allocated(self: &Self) -> usize {
        self.state().allocated()
    }

    fn give_back(self: &Self, id: BufferId, mut data: Vec<u8>) {
        let mut state = self.state();
        let closed = state.closed;
        state.leased = state.leased.saturating_sub(1);
        let slot = &mut state.slots[id as usize];
        if !matches!(slot, Slot::Leased) {
            warn!("BufferPool: Buffer {id} returned but it was not leased");
            return;
        }
        if closed {
            *slot = Slot::Vacant;
            state.vacant.push(id);
            return;
        }
        data.clear();
        *slot = Slot::Free(data);
        state.free.push(id);
    }

    fn state(self: &Self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A leased buffer. Its length never exceeds the capacity of the pool it came from.
pub struct PooledBuffer {
    id: BufferId,
    data: Vec<u8>,
    capacity: usize,
    pool: Weak<BufferPool>,
}

impl PooledBuffer {
    pub fn id(self: &Self) -> BufferId {
        self.id
    }

    pub fn capacity(self: &Self) -> usize {
        self.capacity
    }

    pub fn len(self: &Self) -> usize {
        self.data.len()
    }

    pub fn is_empty(self: &Self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(self: &Self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(self: &Self) -> &[u8] {
        &self.data
    }

    pub fn extend_from_slice(self: &mut Self, bytes: &[u8]) -> TransportResult<()> {
        if bytes.len() > self.remaining() {
            return Err(TransportError::BufferFull {
                needed: bytes.len(),
                remaining: self.remaining(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Overwrites bytes that were already written, used to fix up headers
    pub(crate) fn write_at(self: &mut Self, offset: usize, bytes: &[u8]) -> TransportResult<()> {
        let end = offset + bytes.len();
        if end > self.data.len() {
            return Err(TransportError::InvalidArgument(format!(
                "write of {} bytes at offset {offset} is beyond the {} bytes written",
                bytes.len(),
                self.data.len()
            )));
        }
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn clear(self: &mut Self) {
        self.data.clear();
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(self.id, mem::take(&mut self.data));
        }
    }
}
