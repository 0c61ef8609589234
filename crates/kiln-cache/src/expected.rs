use std::collections::BTreeMap;
use std::path::PathBuf;

/// One output file a wrapped command is expected to produce.
///
/// `path` is where the command places the artifact on a miss and where the
/// cache materializes it on a hit. A `required` file that is absent after a
/// successful run is a failure; an optional file may be absent and must then
/// be absent after replay as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFile {
    pub path: PathBuf,
    pub required: bool,
}

impl ExpectedFile {
    pub fn new(path: impl Into<PathBuf>, required: bool) -> Self {
        Self {
            path: path.into(),
            required,
        }
    }
}

/// Declared expected files keyed by their stable file id (e.g. `object`).
///
/// A `BTreeMap` keeps iteration deterministic across invocations.
pub type ExpectedFiles = BTreeMap<String, ExpectedFile>;
