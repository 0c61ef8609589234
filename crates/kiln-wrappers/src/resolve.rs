use crate::gcc::GccWrapper;
use crate::wrapper::ProgramWrapper;
use kiln_config::Config;
use std::path::Path;

/// Pick the wrapper strategy for an argument vector, from the wrapped
/// executable's file name.
///
/// `None` means no wrapper understands this command; the caller runs it
/// directly, uncached.
pub fn find_wrapper(args: &[String], config: &Config) -> Option<Box<dyn ProgramWrapper>> {
    let exe = args.first()?;
    let file_name = Path::new(exe).file_name()?.to_string_lossy();

    if let Some(mode) = GccWrapper::detect(&file_name) {
        tracing::debug!(target = "kiln.wrapper", exe = %exe, ?mode, "using gcc wrapper");
        return Some(Box::new(GccWrapper::new(
            args.to_vec(),
            config.clone(),
            mode,
        )));
    }

    tracing::debug!(target = "kiln.wrapper", exe = %exe, "no wrapper for command");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_gcc_by_basename() {
        let config = Config::default();
        assert!(find_wrapper(&strings(&["/usr/bin/gcc", "-c", "a.c"]), &config).is_some());
        assert!(find_wrapper(&strings(&["clang++", "-c", "a.cc"]), &config).is_some());
    }

    #[test]
    fn unknown_tools_get_no_wrapper() {
        let config = Config::default();
        assert!(find_wrapper(&strings(&["rustc", "--edition=2021"]), &config).is_none());
        assert!(find_wrapper(&[], &config).is_none());
    }
}
