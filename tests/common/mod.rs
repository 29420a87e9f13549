#![allow(dead_code)]

use std::path::PathBuf;

use quarry::EngineLocator;

/// Locate a worker stand-in script under `tests/fixtures/`.
pub fn fixture_engine(name: &str) -> EngineLocator {
    let path: PathBuf = [env!("CARGO_MANIFEST_DIR"), "tests", "fixtures", name]
        .iter()
        .collect();
    EngineLocator::new(path)
}
