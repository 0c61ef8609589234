use crate::capabilities::Capabilities;
use kiln_cache::{CacheError, ExpectedFiles};
use kiln_config::Config;
use kiln_hash::{DigestBuilder, HashError};
use kiln_process::{run_command, CommandSpec, RunOptions, RunResult};
use std::collections::BTreeMap;

/// A failure that aborts caching for this invocation.
///
/// The caller converts every variant into "run the command directly, do not
/// cache", so no wrapper failure can change the compiler's observed output.
#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    /// The wrapper refuses this command line (e.g. no object output, or a
    /// feature the cache cannot replay).
    #[error("unsupported invocation: {0}")]
    Unsupported(String),

    /// The preprocessor run failed; the compiler itself will produce the
    /// authoritative diagnostics.
    #[error("preprocessor failure: {0}")]
    Preprocess(String),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("process error: {0}")]
    Process(#[from] std::io::Error),
}

/// The per-compiler strategy.
///
/// Every hook has a conservative default; a wrapper overrides the parts that
/// are relevant for its tool. The pipeline in [`crate::handle_command`] calls
/// them in a fixed order: `resolve_args`, `capabilities`,
/// `preprocess_source`, `relevant_arguments`, `relevant_env_vars`,
/// `program_id`, `build_files`, and finally `run_for_miss` on a miss.
pub trait ProgramWrapper {
    /// The raw argument vector, starting with the wrapped executable.
    fn args(&self) -> &[String];

    fn config(&self) -> &Config;

    /// Expand response files and normalize the argument vector in place.
    /// Must be idempotent.
    fn resolve_args(&mut self) -> Result<(), WrapperError> {
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// The canonical, path-independent representation of all translation
    /// inputs. For compilers this is the preprocessor output (includes
    /// inlined, macros expanded); other tools may return source contents.
    fn preprocess_source(&mut self) -> Result<Vec<u8>, WrapperError> {
        Ok(Vec::new())
    }

    /// The filtered flag list that can still affect output once the
    /// preprocessed input is fixed (include paths, output paths and source
    /// file names are already folded into the preprocessed text).
    fn relevant_arguments(&self) -> Result<Vec<String>, WrapperError> {
        Ok(self.args().to_vec())
    }

    /// Environment variables known to influence the tool's output.
    fn relevant_env_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// A string that changes whenever the tool's observable behavior does.
    ///
    /// The default hashes the executable file, which is robust but fragile
    /// across installs of behaviorally identical binaries; wrappers that can
    /// query a version string should prefer it.
    fn program_id(&mut self) -> Result<String, WrapperError> {
        let exe = self
            .args()
            .first()
            .ok_or_else(|| WrapperError::Unsupported("empty argument vector".to_string()))?;
        let mut hasher = DigestBuilder::new();
        hasher.update_from_file(exe)?;
        Ok(hasher.finish().to_hex())
    }

    /// The declared expected output files, keyed by stable file id.
    fn build_files(&self) -> Result<ExpectedFiles, WrapperError> {
        Ok(ExpectedFiles::new())
    }

    /// Execute the real command, capturing stdout, stderr and the exit code.
    fn run_for_miss(&mut self) -> Result<RunResult, WrapperError> {
        let spec = CommandSpec::from_argv_with_prefix(self.args(), &self.config().prefix)
            .ok_or_else(|| WrapperError::Unsupported("empty argument vector".to_string()))?;
        Ok(run_command(&spec, &RunOptions::default())?)
    }
}
