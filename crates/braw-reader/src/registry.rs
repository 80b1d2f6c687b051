//! Process-wide decoder registry.
//!
//! Readers register a factory under a name. The media framework looks them
//! up by name, or asks every registered reader whether it supports a URL.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::engine::DecodeEngine;
use crate::options::ReaderOptions;
use crate::reader::BrawReader;
use crate::video::{FrameReader, FrameSink};

/// Everything a factory needs to build a reader.
#[derive(Clone)]
pub struct ReaderContext {
    pub engine: Arc<dyn DecodeEngine>,
    pub sink: Arc<dyn FrameSink>,
    pub options: ReaderOptions,
}

/// Builds a reader for one playback session.
pub type ReaderFactory = Arc<dyn Fn(ReaderContext) -> Arc<dyn FrameReader> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    factory: ReaderFactory,
    supports: fn(&str) -> bool,
}

static REGISTRY: LazyLock<Mutex<HashMap<String, Entry>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Registers a reader under `name` (case-insensitive). Returns `false` if
/// the name is already taken.
pub fn register_once(name: &str, supports: fn(&str) -> bool, factory: ReaderFactory) -> bool {
    let mut registry = REGISTRY.lock();
    let key = key(name);
    if registry.contains_key(&key) {
        return false;
    }
    tracing::debug!("registered frame reader '{}'", name);
    registry.insert(key, Entry { factory, supports });
    true
}

/// Removes a reader. Returns `false` if it was not registered.
pub fn unregister(name: &str) -> bool {
    REGISTRY.lock().remove(&key(name)).is_some()
}

pub fn is_registered(name: &str) -> bool {
    REGISTRY.lock().contains_key(&key(name))
}

/// Creates a reader by name.
pub fn create(name: &str, context: ReaderContext) -> Option<Arc<dyn FrameReader>> {
    // clone out so the factory runs without the registry lock
    let entry = REGISTRY.lock().get(&key(name)).cloned()?;
    Some((entry.factory)(context))
}

/// Names of registered readers whose URL check accepts `url`, sorted.
pub fn readers_for(url: &str) -> Vec<String> {
    let mut names: Vec<String> = REGISTRY
        .lock()
        .iter()
        .filter(|(_, entry)| (entry.supports)(url))
        .map(|(name, _)| name.clone())
        .collect();
    names.sort();
    names
}

/// Registers the BRAW reader. Safe to call more than once.
pub fn register_braw() -> bool {
    register_once(
        BrawReader::NAME,
        BrawReader::supports_url,
        Arc::new(|context: ReaderContext| -> Arc<dyn FrameReader> {
            Arc::new(BrawReader::new(context.engine, context.sink, context.options))
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedEngine;

    fn context() -> ReaderContext {
        let sink = |_frame: crate::video::VideoFrame| true;
        ReaderContext {
            engine: Arc::new(SimulatedEngine::default()),
            sink: Arc::new(sink),
            options: ReaderOptions::default(),
        }
    }

    #[test]
    fn test_register_braw_once() {
        register_braw();
        assert!(!register_braw());
        assert!(is_registered("braw"));
        assert!(is_registered("BRAW"));

        let reader = create("BRAW", context());
        assert_eq!(reader.map(|r| r.name()), Some("BRAW"));
    }

    #[test]
    fn test_readers_for_url() {
        register_braw();
        assert!(readers_for("/clips/A001.braw").contains(&"braw".to_string()));
        assert!(!readers_for("/clips/A001.mov").contains(&"braw".to_string()));
    }

    #[test]
    fn test_unknown_reader() {
        assert!(create("prores", context()).is_none());
        assert!(!unregister("prores"));
    }
}
