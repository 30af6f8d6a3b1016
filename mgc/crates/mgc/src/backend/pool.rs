//! Pool backend
//!
//! Incremental-style collector: finalization messages queue up and are
//! drained by allocation polls and at the start of every explicit
//! collection, and watches track 1MB zones per epoch. Weak arrays start in
//! generation 2 and rehashed hash-table arrays go straight to the
//! long-lived generation.

use super::{Backend, Placement, Shared};
use crate::config::{GcConfig, GenerationParams, MB};
use crate::error::Result;
use crate::logging::GcLogger;
use crate::watch::EpochWatch;
use std::sync::Arc;

pub struct PoolBackend {
    shared: Shared,
}

impl Backend for PoolBackend {
    type Watch = EpochWatch;

    const NAME: &'static str = "pool";
    const PROMPT_FINALIZATION: bool = false;

    fn default_generations() -> Vec<GenerationParams> {
        vec![
            GenerationParams::new(8 * MB, 0.9),
            GenerationParams::new(32 * MB, 0.5),
            GenerationParams::new(128 * MB, 0.1),
        ]
    }

    fn new(config: &GcConfig, logger: Arc<GcLogger>) -> Result<Self> {
        let defaults = Self::default_generations();
        let last = config.generations_or(&defaults).len().saturating_sub(1);
        let placement = Placement {
            main: 0,
            code: 0,
            weak: 2.min(last),
            hash: last,
        };
        Ok(Self {
            shared: Shared::new(Self::NAME, Self::PROMPT_FINALIZATION, config, &defaults, placement, logger)?,
        })
    }

    fn shared(&self) -> &Shared {
        &self.shared
    }

    fn collect(&self) -> Result<()> {
        self.shared.check_finalizers();
        self.shared.collect_with(self.shared.heap.generations() - 1)?;
        Ok(())
    }

    fn create_watch(&self) -> EpochWatch {
        EpochWatch::new(self.shared.moves.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocPool;
    use crate::config::KB;
    use crate::heap::PoolKind;
    use crate::object::format::{init_weak_array, size_array};
    use crate::object::types::GcType;
    use crate::scan::StackSet;

    fn config() -> GcConfig {
        GcConfig {
            chunk_size: 64 * KB,
            ..Default::default()
        }
    }

    #[test]
    fn test_placement() {
        let backend = PoolBackend::new(&config(), Arc::new(GcLogger::default())).unwrap();
        let placement = backend.shared().placement();
        assert_eq!(placement.weak, 2);
        assert_eq!(placement.hash, 2);
        assert_eq!(backend.shared().heap.generations(), 3);
    }

    #[test]
    fn test_weak_arrays_start_in_generation_two() {
        let backend = PoolBackend::new(&config(), Arc::new(GcLogger::default())).unwrap();
        let thread = backend.attach_thread(Arc::new(StackSet::new())).unwrap();
        let ty = GcType::weak_array();
        let size = size_array(&ty, 4).unwrap();
        let handle = backend.shared().heap.types.alloc(ty).unwrap();

        let weak = backend
            .reserve(&thread, AllocPool::Weak, size, |base| unsafe {
                init_weak_array(base, handle.to_raw(), size, 4)
            })
            .unwrap();
        assert_eq!(backend.shared().heap.locate(weak), Some((PoolKind::Weak, 2)));
        backend.detach_thread(&thread).unwrap();
    }
}
