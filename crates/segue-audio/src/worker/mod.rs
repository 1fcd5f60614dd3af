//! Background threads driving the pipeline.

pub mod collector;
pub mod decoder;

use std::sync::Arc;
use std::thread::JoinHandle;

use segue_core::{Error, Result};

use crate::shared::Shared;

fn spawn_named(name: &str, shared: Arc<Shared>, run: fn(Arc<Shared>)) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run(shared))
        .map_err(|e| Error::Internal(format!("Failed to spawn {name} thread: {e}")))
}

/// Start the decoder worker thread.
pub fn spawn_decoder(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    spawn_named("segue-decoder", shared, decoder::run)
}

/// Start the collector thread.
pub fn spawn_collector(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    spawn_named("segue-collector", shared, collector::run)
}
