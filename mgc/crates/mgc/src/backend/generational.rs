//! Generational backend
//!
//! All moving pools share the nursery, finalizers run at the end of the
//! call that collected (cross-thread ones are handed off), and watches
//! remember the exact address ranges each collection moved.

use super::{Backend, Placement, Shared};
use crate::config::{GcConfig, GenerationParams, MB};
use crate::error::Result;
use crate::logging::GcLogger;
use crate::watch::AddrWatch;
use std::sync::Arc;

pub struct GenerationalBackend {
    shared: Shared,
}

impl Backend for GenerationalBackend {
    type Watch = AddrWatch;

    const NAME: &'static str = "generational";
    const PROMPT_FINALIZATION: bool = true;

    fn default_generations() -> Vec<GenerationParams> {
        vec![
            GenerationParams::new(MB, 0.9),
            GenerationParams::new(10 * MB, 0.5),
            GenerationParams::new(100 * MB, 0.1),
        ]
    }

    fn new(config: &GcConfig, logger: Arc<GcLogger>) -> Result<Self> {
        let placement = Placement {
            main: 0,
            code: 0,
            weak: 0,
            hash: 0,
        };
        Ok(Self {
            shared: Shared::new(
                Self::NAME,
                Self::PROMPT_FINALIZATION,
                config,
                &Self::default_generations(),
                placement,
                logger,
            )?,
        })
    }

    fn shared(&self) -> &Shared {
        &self.shared
    }

    fn collect(&self) -> Result<()> {
        self.shared
            .collect_and_finalize(self.shared.heap.generations() - 1)?;
        Ok(())
    }

    fn create_watch(&self) -> AddrWatch {
        AddrWatch::new(self.shared.moves.clone())
    }
}
