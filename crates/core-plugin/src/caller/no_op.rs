//! Pass-through caller: turns chunks into empty-sequence reads without
//! talking to a basecaller. Used by the unblock-all diagnostic mode and in
//! tests, where downstream classification should land on `no_seq`.

use core_model::{BasecalledRead, ReadChunk};

use crate::{Caller, PluginError, ReadStream};

#[derive(Debug, Default)]
pub struct NoOpCaller {
    batches: u64,
}

impl NoOpCaller {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Caller for NoOpCaller {
    fn basecall(&mut self, chunks: Vec<ReadChunk>) -> Result<ReadStream, PluginError> {
        self.batches += 1;
        Ok(Box::new(
            chunks
                .into_iter()
                .map(|chunk| BasecalledRead::unbasecalled(&chunk, None)),
        ))
    }

    fn validate(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "no-op caller (chunks pass through unbasecalled)".to_string()
    }

    fn disconnect(&mut self) {}
}
