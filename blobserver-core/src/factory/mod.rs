//! factory — name-keyed construction of detectors and sources
//!
//! Two independent registries, populated once at startup.  Creating an
//! unknown key yields `None`; there is no fallback class.

use std::sync::{Arc, Mutex};

use crate::detection::{self, Detector};
use crate::source::{self, Source};

struct Entry<T> {
    name: String,
    documentation: String,
    build: Box<dyn Fn(i32) -> T + Send + Sync>,
}

/// A registry keyed by class name.  Registration order is preserved so
/// enumeration replies are stable.
pub struct Factory<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Factory<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register_class<F>(&mut self, name: &str, documentation: &str, build: F)
    where
        F: Fn(i32) -> T + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            name: name.to_string(),
            documentation: documentation.to_string(),
            build: Box::new(build),
        });
    }

    pub fn key_exists(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn get_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn documentation(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.documentation.as_str())
    }

    /// Construct an instance for `name`, or `None` for an unknown key.
    pub fn create(&self, name: &str, subsource: i32) -> Option<T> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| (e.build)(subsource))
    }
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub type DetectorFactory = Factory<Box<dyn Detector + Send>>;
pub type SourceFactory = Factory<Arc<Mutex<dyn Source + Send>>>;

/// The registry of built-in detector classes.
pub fn detector_factory() -> DetectorFactory {
    let mut factory = DetectorFactory::new();
    factory.register_class(
        detection::light_spots::CLASS_NAME,
        detection::light_spots::DOCUMENTATION,
        |_| Box::new(detection::LightSpots::new()),
    );
    factory.register_class(
        detection::mean_outliers::CLASS_NAME,
        detection::mean_outliers::DOCUMENTATION,
        |_| Box::new(detection::MeanOutliers::new()),
    );
    factory
}

/// The registry of built-in source classes.
pub fn source_factory() -> SourceFactory {
    let mut factory = SourceFactory::new();
    factory.register_class(
        source::pattern::CLASS_NAME,
        source::pattern::DOCUMENTATION,
        |subsource| Arc::new(Mutex::new(source::PatternSource::new(subsource))),
    );
    factory.register_class(
        source::shmdata::CLASS_NAME,
        source::shmdata::DOCUMENTATION,
        |subsource| Arc::new(Mutex::new(source::ShmdataSource::new(subsource))),
    );
    factory
}
