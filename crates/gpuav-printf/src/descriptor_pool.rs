//! Descriptor sets for output buffers, carved out of pool chunks.
//!
//! Every instrumented command needs one descriptor set. Creating a pool per set would be far too
//! slow, so sets are allocated from chunks of [`DescriptorPoolManager::chunk_size`] sets. A chunk
//! serves a single set layout and its pool is destroyed as soon as its last set is released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use tracing::{debug, warn};

use crate::dispatch::DeviceDispatch;
use crate::error::ResourceError;

/// Bookkeeping for one descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolChunk {
    pub pool: vk::DescriptorPool,
    pub layout: vk::DescriptorSetLayout,
    pub capacity: u32,
    pub used: u32,
}

impl DescriptorPoolChunk {
    fn fits(&self, count: u32, layout: vk::DescriptorSetLayout) -> bool {
        self.layout == layout && self.used + count <= self.capacity
    }
}

/// Hands out descriptor sets holding `bindings_per_set` storage buffers each.
///
/// All operations serialize on one lock.
pub struct DescriptorPoolManager {
    dispatch: Arc<dyn DeviceDispatch>,
    chunk_size: u32,
    bindings_per_set: u32,
    chunks: Mutex<Vec<DescriptorPoolChunk>>,
}

impl DescriptorPoolManager {
    pub fn new(dispatch: Arc<dyn DeviceDispatch>, chunk_size: u32, bindings_per_set: u32) -> Self {
        Self {
            dispatch,
            chunk_size: chunk_size.max(1),
            bindings_per_set: bindings_per_set.max(1),
            chunks: Mutex::new(Vec::new()),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DescriptorPoolChunk>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates `count` sets of `layout` from a single pool.
    ///
    /// Reuses the first chunk of the same layout with room, otherwise creates a chunk of
    /// `max(chunk_size, count)` sets. `count == 0` allocates nothing.
    pub fn acquire(
        &self,
        count: u32,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::DescriptorPool, Vec<vk::DescriptorSet>), ResourceError> {
        if count == 0 {
            return Ok((vk::DescriptorPool::null(), Vec::new()));
        }

        let mut chunks = self.lock();
        let index = match chunks.iter().position(|chunk| chunk.fits(count, layout)) {
            Some(index) => index,
            None => {
                let capacity = self.chunk_size.max(count);
                let pool_size = vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: capacity * self.bindings_per_set,
                };
                let pool = self
                    .dispatch
                    .create_descriptor_pool(capacity, &[pool_size])
                    .map_err(ResourceError::DescriptorPool)?;
                debug!(?pool, capacity, "created descriptor pool chunk");
                chunks.push(DescriptorPoolChunk {
                    pool,
                    layout,
                    capacity,
                    used: 0,
                });
                chunks.len() - 1
            }
        };

        let chunk = &mut chunks[index];
        let layouts = vec![layout; count as usize];
        match self.dispatch.allocate_descriptor_sets(chunk.pool, &layouts) {
            Ok(sets) => {
                chunk.used += count;
                Ok((chunk.pool, sets))
            }
            Err(err) => {
                if chunk.used == 0 {
                    let chunk = chunks.remove(index);
                    self.dispatch.destroy_descriptor_pool(chunk.pool);
                }
                Err(ResourceError::DescriptorSets(err))
            }
        }
    }

    /// Returns one set to its pool, destroying the pool once it is empty.
    ///
    /// Unknown pools are ignored.
    pub fn release(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        let mut chunks = self.lock();
        let Some(index) = chunks.iter().position(|chunk| chunk.pool == pool) else {
            debug!(?pool, "release for unknown descriptor pool");
            return;
        };
        let freed = self.dispatch.free_descriptor_sets(pool, &[set]);
        let chunk = &mut chunks[index];
        chunk.used = chunk.used.saturating_sub(1);
        if let Err(err) = freed {
            // The set keeps its slot until the pool itself is destroyed.
            warn!(?pool, %err, "failed to free debug printf descriptor set");
            chunk.capacity = chunk.capacity.saturating_sub(1);
        }
        if chunk.used == 0 {
            chunks.remove(index);
            self.dispatch.destroy_descriptor_pool(pool);
            debug!(?pool, "destroyed empty descriptor pool chunk");
        }
    }

    pub fn chunks(&self) -> Vec<DescriptorPoolChunk> {
        self.lock().clone()
    }

    /// Destroys every pool. Sets still handed out become invalid.
    pub fn destroy_all(&self) {
        for chunk in self.lock().drain(..) {
            self.dispatch.destroy_descriptor_pool(chunk.pool);
        }
    }
}

impl std::fmt::Debug for DescriptorPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPoolManager")
            .field("chunk_size", &self.chunk_size)
            .field("bindings_per_set", &self.bindings_per_set)
            .field("chunks", &self.chunks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDevice;

    fn manager(device: &Arc<MockDevice>, chunk_size: u32) -> DescriptorPoolManager {
        DescriptorPoolManager::new(device.clone(), chunk_size, 1)
    }

    #[test]
    fn zero_count_allocates_nothing() {
        let device = Arc::new(MockDevice::new());
        let pools = manager(&device, 4);
        let (pool, sets) = pools.acquire(0, vk::DescriptorSetLayout::null()).unwrap();
        assert_eq!(pool, vk::DescriptorPool::null());
        assert!(sets.is_empty());
        assert!(pools.chunks().is_empty());
    }

    #[test]
    fn three_sets_from_chunks_of_two() {
        let device = Arc::new(MockDevice::new());
        let layout = device.layout_handle();
        let pools = manager(&device, 2);

        let acquired: Vec<_> = (0..3)
            .map(|_| {
                let (pool, sets) = pools.acquire(1, layout).unwrap();
                (pool, sets[0])
            })
            .collect();
        let chunks = pools.chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].capacity, chunks[0].used), (2, 2));
        assert_eq!((chunks[1].capacity, chunks[1].used), (2, 1));
        assert_eq!(acquired[0].0, acquired[1].0);
        assert_ne!(acquired[1].0, acquired[2].0);
        assert_eq!(device.live_descriptor_pools(), 2);

        for (pool, set) in acquired {
            pools.release(pool, set);
        }
        assert!(pools.chunks().is_empty());
        assert_eq!(device.live_descriptor_pools(), 0);
    }

    #[test]
    fn chunks_only_serve_their_own_layout() {
        let device = Arc::new(MockDevice::new());
        let a = device.layout_handle();
        let b = device.layout_handle();
        let pools = manager(&device, 4);

        let (pool_a, _) = pools.acquire(1, a).unwrap();
        let (pool_b, _) = pools.acquire(1, b).unwrap();
        assert_ne!(pool_a, pool_b);
        assert_eq!(pools.chunks().len(), 2);
    }

    #[test]
    fn oversized_requests_get_their_own_chunk() {
        let device = Arc::new(MockDevice::new());
        let layout = device.layout_handle();
        let pools = manager(&device, 2);

        let (pool, sets) = pools.acquire(5, layout).unwrap();
        assert_eq!(sets.len(), 5);
        let chunk = pools.chunks()[0];
        assert_eq!(chunk.pool, pool);
        assert_eq!(chunk.capacity, 5);
        assert_eq!(chunk.used, 5);
    }

    #[test]
    fn unknown_pools_are_ignored_on_release() {
        let device = Arc::new(MockDevice::new());
        let layout = device.layout_handle();
        let pools = manager(&device, 2);

        let (_, sets) = pools.acquire(1, layout).unwrap();
        pools.release(vk::DescriptorPool::null(), sets[0]);
        assert_eq!(pools.chunks()[0].used, 1);
    }

    #[test]
    fn failed_frees_still_retire_the_pool() {
        let device = Arc::new(MockDevice::new());
        let layout = device.layout_handle();
        let pools = manager(&device, 2);

        let (pool, sets) = pools.acquire(2, layout).unwrap();
        device.fail_descriptor_frees(true);
        pools.release(pool, sets[0]);
        let chunk = pools.chunks()[0];
        assert_eq!((chunk.used, chunk.capacity), (1, 1));
        // The lost slot is not handed out again.
        let (other, _) = pools.acquire(1, layout).unwrap();
        assert_ne!(other, pool);

        pools.release(pool, sets[1]);
        assert_eq!(pools.chunks().len(), 1);
        assert_eq!(device.live_descriptor_pools(), 1);
    }

    #[test]
    fn pool_creation_failure_is_reported() {
        let device = Arc::new(MockDevice::new());
        device.fail_descriptor_pools(true);
        let pools = manager(&device, 4);
        assert_eq!(
            pools.acquire(1, device.layout_handle()),
            Err(ResourceError::DescriptorPool(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            ))
        );
        assert!(pools.chunks().is_empty());
    }

    #[test]
    fn destroy_all_destroys_every_pool() {
        let device = Arc::new(MockDevice::new());
        let layout = device.layout_handle();
        let pools = manager(&device, 1);
        pools.acquire(1, layout).unwrap();
        pools.acquire(1, layout).unwrap();
        assert_eq!(device.live_descriptor_pools(), 2);
        pools.destroy_all();
        assert_eq!(device.live_descriptor_pools(), 0);
        assert!(pools.chunks().is_empty());
    }
}
