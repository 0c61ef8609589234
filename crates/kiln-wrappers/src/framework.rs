use crate::wrapper::{ProgramWrapper, WrapperError};
use kiln_cache::{Cache, CacheEntry, CompressionMode};
use kiln_hash::DigestBuilder;
use std::io::Write;

/// Run the full caching pipeline for one invocation.
///
/// On a hit the captured stdout/stderr are re-emitted and the captured exit
/// code returned without spawning the compiler. On a miss the real command
/// runs, its output is forwarded, and a successful run is inserted into the
/// cache. Any error aborts caching for this invocation; the caller falls
/// back to running the command directly.
pub fn handle_command(
    wrapper: &mut dyn ProgramWrapper,
    cache: &Cache,
) -> Result<i32, WrapperError> {
    wrapper.resolve_args()?;
    let caps = wrapper.capabilities();

    let mut hasher = DigestBuilder::new();
    hasher.update(&wrapper.preprocess_source()?);
    hasher.update_str(&wrapper.relevant_arguments()?.join("\0"));
    hasher.update_map(&wrapper.relevant_env_vars());
    hasher.update_str(&wrapper.program_id()?);
    let digest = hasher.finish();

    let config = wrapper.config();
    let allow_hard_links = config.hard_links && caps.hard_links;
    let terminate_on_miss = config.terminate_on_miss;
    let compression_mode = if config.compress {
        CompressionMode::All
    } else {
        CompressionMode::None
    };

    let expected_files = wrapper.build_files()?;

    match cache.lookup(&digest, &expected_files, allow_hard_links, caps.create_target_dirs) {
        Ok(Some(replay)) => {
            emit(&replay.std_out, &replay.std_err)?;
            return Ok(replay.return_code);
        }
        Ok(None) => {}
        Err(err) => {
            // A broken cache must not break the build; carry on as a miss.
            tracing::error!(
                target = "kiln.wrapper",
                digest = %digest,
                error = %err,
                "cache lookup failed, continuing as a miss"
            );
        }
    }
    tracing::info!(target = "kiln.wrapper", digest = %digest, "cache miss");

    if terminate_on_miss {
        let stdout = std::io::stdout();
        let mut stdout = stdout.lock();
        for expected_file in expected_files.values() {
            writeln!(stdout, "{}", expected_file.path.display())?;
        }
        return Ok(0);
    }

    let result = wrapper.run_for_miss()?;
    emit(&result.std_out, &result.std_err)?;

    // Failed runs are never cached: intermittent faults must not be
    // replayed. Truncated captures are not cached either — replaying them
    // would drop output the compiler actually produced.
    if result.return_code == 0 && !result.truncated {
        let file_ids = expected_files
            .iter()
            .filter(|(_, expected_file)| expected_file.required || expected_file.path.exists())
            .map(|(file_id, _)| file_id.clone())
            .collect();
        let entry = CacheEntry {
            file_ids,
            compression_mode,
            std_out: result.std_out.clone(),
            std_err: result.std_err.clone(),
            return_code: result.return_code,
        };
        if let Err(err) = cache.add(&digest, entry, &expected_files, allow_hard_links) {
            tracing::error!(
                target = "kiln.wrapper",
                digest = %digest,
                error = %err,
                "failed to insert cache entry"
            );
        }
    }

    Ok(result.return_code)
}

fn emit(std_out: &[u8], std_err: &[u8]) -> std::io::Result<()> {
    if !std_out.is_empty() {
        let stdout = std::io::stdout();
        let mut stdout = stdout.lock();
        stdout.write_all(std_out)?;
        stdout.flush()?;
    }
    if !std_err.is_empty() {
        let stderr = std::io::stderr();
        let mut stderr = stderr.lock();
        stderr.write_all(std_err)?;
        stderr.flush()?;
    }
    Ok(())
}
