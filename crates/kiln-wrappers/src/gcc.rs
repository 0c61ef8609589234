//! Wrapper for the GCC compiler family (gcc, g++, clang, clang++).

use crate::args::expand_response_files;
use crate::capabilities::Capabilities;
use crate::wrapper::{ProgramWrapper, WrapperError};
use kiln_cache::{ExpectedFile, ExpectedFiles};
use kiln_config::{Accuracy, Config};
use kiln_process::{run_command, CommandSpec, RunOptions};
use std::path::Path;

// Tick this to a new number if the hash format changes in a
// non-backwards-compatible way.
const HASH_VERSION: &str = "1";

/// Flags whose following argument is a file path (and therefore must not be
/// hashed).
const PATH_ARGS: &[&str] = &["-I", "-MF", "-MT", "-MQ", "-o", "-isystem"];

const DEBUG_OPTIONS: &[&str] = &[
    "-g", "-ggdb", "-gdwarf", "-gdwarf-2", "-gdwarf-3", "-gdwarf-4", "-gdwarf-5", "-gstabs",
    "-gstabs+", "-gxcoff", "-gxcoff+", "-gvms",
];

const COVERAGE_OPTIONS: &[&str] = &["-ftest-coverage", "-fprofile-arcs", "--coverage"];

/// Which driver personality the executable name matched.
///
/// GCC and clang take different flags for preprocessing only directives, and
/// differ in whether command-line defines survive the preprocess step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibleMode {
    Gcc,
    Clang,
}

pub struct GccWrapper {
    args: Vec<String>,
    config: Config,
    mode: CompatibleMode,
    resolved_args: Vec<String>,
}

impl GccWrapper {
    pub fn new(args: Vec<String>, config: Config, mode: CompatibleMode) -> Self {
        Self {
            args,
            config,
            mode,
            resolved_args: Vec::new(),
        }
    }

    /// Match an executable file name against the drivers this wrapper
    /// understands.
    ///
    /// The extension is kept so versioned names like
    /// `aarch64-unknown-nto-qnx7.0.0-g++` still match. `clang-cl` takes
    /// MSVC-style arguments and `clang-tidy` is not a compiler; both are
    /// rejected.
    pub fn detect(file_name: &str) -> Option<CompatibleMode> {
        let name = file_name.to_lowercase();
        if name.contains("clang-cl") || name.contains("clang-tidy") {
            return None;
        }

        for needle in ["gcc", "g++"] {
            if let Some(idx) = name.find(needle) {
                let preceded_by_word = idx > 0
                    && (name.as_bytes()[idx - 1].is_ascii_alphanumeric()
                        || name.as_bytes()[idx - 1] == b'_');
                if !preceded_by_word {
                    return Some(CompatibleMode::Gcc);
                }
            }
        }

        if let Some(idx) = name.find("clang") {
            let rest = &name[idx + "clang".len()..];
            let rest = rest
                .strip_prefix("++")
                .or_else(|| rest.strip_prefix("-cpp"))
                .unwrap_or(rest);
            let rest = rest.strip_suffix(".exe").unwrap_or(rest);
            // Allow version suffixes like "-5", "-6.0"; reject anything
            // wordier ("clang-format", ...).
            if rest.is_empty()
                || (rest.starts_with('-')
                    && rest[1..].chars().all(|c| c.is_ascii_digit() || c == '.'))
            {
                return Some(CompatibleMode::Clang);
            }
        }

        None
    }

    fn uses_defines_in_preprocess(&self) -> bool {
        // Both drivers get flags that keep command-line defines out of the
        // preprocess step, so `-D` flags still matter afterwards.
        match self.mode {
            CompatibleMode::Gcc | CompatibleMode::Clang => false,
        }
    }

    fn make_preprocessor_cmd(&self, preprocessed_file: &Path) -> Vec<String> {
        let mut preprocess_args = Vec::with_capacity(self.args.len() + 6);

        // Drop arguments the preprocess step must not see.
        let mut drop_next_arg = false;
        for arg in &self.args {
            let drop_this_arg = std::mem::take(&mut drop_next_arg);
            let drop_this_arg = drop_this_arg
                || match arg.as_str() {
                    "-c" => true,
                    "-o" => {
                        drop_next_arg = true;
                        true
                    }
                    _ => false,
                };
            if !drop_this_arg {
                preprocess_args.push(arg.clone());
            }
        }

        // Should we inhibit line info in the preprocessed output?
        let debug_symbols_required =
            has_any(&self.args, DEBUG_OPTIONS) && self.config.accuracy >= Accuracy::Strict;
        let coverage_symbols_required =
            has_any(&self.args, COVERAGE_OPTIONS) && self.config.accuracy >= Accuracy::Default;
        let inhibit_line_info = !(debug_symbols_required || coverage_symbols_required);

        preprocess_args.push("-E".to_string());
        if inhibit_line_info {
            preprocess_args.push("-P".to_string());
        }
        preprocess_args.push("-o".to_string());
        preprocess_args.push(preprocessed_file.to_string_lossy().into_owned());

        // Only preprocess conditional directives; defines stay on the
        // command line and in the hashed flags.
        match self.mode {
            CompatibleMode::Gcc => preprocess_args.push("-fdirectives-only".to_string()),
            CompatibleMode::Clang => preprocess_args.push("-frewrite-includes".to_string()),
        }

        preprocess_args
    }
}

impl ProgramWrapper for GccWrapper {
    fn args(&self) -> &[String] {
        &self.args
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn resolve_args(&mut self) -> Result<(), WrapperError> {
        self.resolved_args = expand_response_files(&self.args);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        // hard_links: GCC never rewrites an existing output file in place.
        Capabilities::from_tags(["direct_mode", "hard_links"])
    }

    fn preprocess_source(&mut self) -> Result<Vec<u8>, WrapperError> {
        // Only plain compile-to-object commands are supported.
        let is_object_compilation = self.resolved_args.iter().any(|arg| arg == "-c");
        let has_object_output = self.resolved_args.iter().any(|arg| arg == "-o");
        if !is_object_compilation || !has_object_output {
            return Err(WrapperError::Unsupported(
                "not a compile-to-object command".to_string(),
            ));
        }

        let preprocessed_file = tempfile::Builder::new()
            .prefix("kiln-preprocess")
            .suffix(".i")
            .tempfile()
            .map_err(WrapperError::Process)?;

        let preprocess_args = self.make_preprocessor_cmd(preprocessed_file.path());
        let (program, rest) = preprocess_args
            .split_first()
            .ok_or_else(|| WrapperError::Unsupported("empty argument vector".to_string()))?;
        let result = run_command(&CommandSpec::new(program, rest), &RunOptions::default())?;
        if result.return_code != 0 {
            return Err(WrapperError::Preprocess(format!(
                "preprocessor exited with {}",
                result.return_code
            )));
        }

        Ok(std::fs::read(preprocessed_file.path())?)
    }

    fn relevant_arguments(&self) -> Result<Vec<String>, WrapperError> {
        let mut filtered_args = Vec::new();

        // The compiler binary without its directory; the full path must not
        // affect the fingerprint.
        filtered_args.push(file_name_of(&self.args[0]));

        // Always skip the first arg since we have handled it already.
        let mut skip_next_arg = true;
        for arg in &self.resolved_args {
            if std::mem::take(&mut skip_next_arg) {
                continue;
            }

            // Things that will not change how we go from preprocessed code
            // to an object file.
            let is_unwanted_arg = arg.starts_with("-I")
                || (self.uses_defines_in_preprocess() && arg.starts_with("-D"))
                || arg.starts_with("-M")
                || arg.starts_with("--sysroot=")
                || is_source_file(arg);

            if PATH_ARGS.contains(&arg.as_str()) {
                // We don't want to hash file paths.
                skip_next_arg = true;
            } else if !is_unwanted_arg {
                filtered_args.push(arg.clone());
            }
        }

        tracing::debug!(
            target = "kiln.wrapper",
            args = %filtered_args.join(" "),
            "filtered arguments"
        );
        Ok(filtered_args)
    }

    fn program_id(&mut self) -> Result<String, WrapperError> {
        // The version string is preferred over hashing the binary: it is
        // stable across reinstalls of the same release.
        let spec = CommandSpec::new(
            &self.args[0],
            &["--version".to_string()],
        );
        let result = run_command(&spec, &RunOptions::default())?;
        if result.return_code != 0 {
            return Err(WrapperError::Unsupported(
                "unable to get the compiler version string".to_string(),
            ));
        }

        let mut id = String::from(HASH_VERSION);
        id.push_str(&String::from_utf8_lossy(&result.std_out));
        Ok(id)
    }

    fn build_files(&self) -> Result<ExpectedFiles, WrapperError> {
        let mut files = ExpectedFiles::new();
        let mut object_path: Option<&str> = None;
        for (i, arg) in self.resolved_args.iter().enumerate() {
            if arg == "-o" {
                if let Some(path) = self.resolved_args.get(i + 1) {
                    if object_path.is_some() {
                        return Err(WrapperError::Unsupported(
                            "only a single target object file can be specified".to_string(),
                        ));
                    }
                    object_path = Some(path);
                }
            }
        }
        let object_path = object_path.ok_or_else(|| {
            WrapperError::Unsupported("unable to get the target object file".to_string())
        })?;
        files.insert("object".to_string(), ExpectedFile::new(object_path, true));

        if has_any(&self.resolved_args, COVERAGE_OPTIONS) {
            let coverage_path = Path::new(object_path).with_extension("gcno");
            files.insert("coverage".to_string(), ExpectedFile::new(coverage_path, true));
        }
        Ok(files)
    }
}

fn has_any(args: &[String], options: &[&str]) -> bool {
    args.iter().any(|arg| options.contains(&arg.as_str()))
}

fn is_source_file(arg: &str) -> bool {
    let lower = arg.to_lowercase();
    [".cpp", ".cc", ".cxx", ".c"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn wrapper(args: &[&str]) -> GccWrapper {
        let mut wrapper = GccWrapper::new(strings(args), Config::default(), CompatibleMode::Gcc);
        wrapper.resolve_args().unwrap();
        wrapper
    }

    #[test]
    fn detect_matches_the_gcc_family() {
        assert_eq!(GccWrapper::detect("gcc"), Some(CompatibleMode::Gcc));
        assert_eq!(GccWrapper::detect("g++"), Some(CompatibleMode::Gcc));
        assert_eq!(
            GccWrapper::detect("aarch64-unknown-nto-qnx7.0.0-g++"),
            Some(CompatibleMode::Gcc)
        );
        assert_eq!(GccWrapper::detect("gcc-12"), Some(CompatibleMode::Gcc));
        assert_eq!(GccWrapper::detect("clang"), Some(CompatibleMode::Clang));
        assert_eq!(GccWrapper::detect("clang++"), Some(CompatibleMode::Clang));
        assert_eq!(GccWrapper::detect("clang-14"), Some(CompatibleMode::Clang));
        assert_eq!(GccWrapper::detect("x86-clang-6.0"), Some(CompatibleMode::Clang));
    }

    #[test]
    fn detect_rejects_lookalikes() {
        assert_eq!(GccWrapper::detect("clang-cl"), None);
        assert_eq!(GccWrapper::detect("clang-tidy"), None);
        assert_eq!(GccWrapper::detect("clang-format"), None);
        assert_eq!(GccWrapper::detect("rustc"), None);
        assert_eq!(GccWrapper::detect("msgcc-helper"), None);
    }

    #[test]
    fn build_files_require_exactly_one_object_output() {
        let w = wrapper(&["gcc", "-c", "main.c", "-o", "main.o"]);
        let files = w.build_files().unwrap();
        assert_eq!(files.len(), 1);
        let object = &files["object"];
        assert_eq!(object.path, Path::new("main.o"));
        assert!(object.required);

        let w = wrapper(&["gcc", "-c", "main.c"]);
        assert!(matches!(w.build_files(), Err(WrapperError::Unsupported(_))));

        let w = wrapper(&["gcc", "-c", "main.c", "-o", "a.o", "-o", "b.o"]);
        assert!(matches!(w.build_files(), Err(WrapperError::Unsupported(_))));
    }

    #[test]
    fn coverage_flags_add_a_gcno_build_file() {
        let w = wrapper(&["gcc", "--coverage", "-c", "main.c", "-o", "obj/main.o"]);
        let files = w.build_files().unwrap();
        assert_eq!(files["coverage"].path, Path::new("obj/main.gcno"));
        assert!(files["coverage"].required);
    }

    #[test]
    fn relevant_arguments_exclude_paths_and_sources() {
        let w = wrapper(&[
            "/usr/bin/gcc",
            "-O2",
            "-I/abs/include",
            "-I",
            "/other/include",
            "-isystem",
            "/sys/include",
            "-MMD",
            "-MF",
            "dep.d",
            "--sysroot=/sysroot",
            "-c",
            "src/main.c",
            "-o",
            "main.o",
            "-fno-exceptions",
        ]);
        let relevant = w.relevant_arguments().unwrap();
        assert_eq!(
            relevant,
            vec!["gcc", "-O2", "-c", "-fno-exceptions"]
        );
    }

    #[test]
    fn defines_survive_filtering_for_gcc_and_clang() {
        // Both drivers keep `-D` out of the preprocess step, so defines must
        // stay in the hashed flags.
        let w = wrapper(&["gcc", "-DNDEBUG", "-c", "a.c", "-o", "a.o"]);
        assert!(w.relevant_arguments().unwrap().contains(&"-DNDEBUG".to_string()));
    }

    #[test]
    fn preprocessor_cmd_drops_output_flags_and_inhibits_line_info() {
        let w = wrapper(&["gcc", "-O2", "-c", "main.c", "-o", "main.o"]);
        let cmd = w.make_preprocessor_cmd(Path::new("/tmp/pre.i"));
        assert_eq!(
            cmd,
            strings(&[
                "gcc",
                "-O2",
                "main.c",
                "-E",
                "-P",
                "-o",
                "/tmp/pre.i",
                "-fdirectives-only"
            ])
        );
    }

    #[test]
    fn strict_accuracy_keeps_line_info_for_debug_builds() {
        let mut w = GccWrapper::new(
            strings(&["gcc", "-g", "-c", "main.c", "-o", "main.o"]),
            Config {
                accuracy: Accuracy::Strict,
                ..Config::default()
            },
            CompatibleMode::Gcc,
        );
        w.resolve_args().unwrap();
        let cmd = w.make_preprocessor_cmd(Path::new("/tmp/pre.i"));
        assert!(!cmd.contains(&"-P".to_string()));

        // At default accuracy, debug line info is not preserved.
        let w = wrapper(&["gcc", "-g", "-c", "main.c", "-o", "main.o"]);
        let cmd = w.make_preprocessor_cmd(Path::new("/tmp/pre.i"));
        assert!(cmd.contains(&"-P".to_string()));
    }

    #[test]
    fn coverage_builds_keep_line_info_at_default_accuracy() {
        let w = wrapper(&["gcc", "--coverage", "-c", "main.c", "-o", "main.o"]);
        let cmd = w.make_preprocessor_cmd(Path::new("/tmp/pre.i"));
        assert!(!cmd.contains(&"-P".to_string()));
    }

    #[test]
    fn clang_uses_rewrite_includes() {
        let mut w = GccWrapper::new(
            strings(&["clang", "-c", "main.c", "-o", "main.o"]),
            Config::default(),
            CompatibleMode::Clang,
        );
        w.resolve_args().unwrap();
        let cmd = w.make_preprocessor_cmd(Path::new("/tmp/pre.i"));
        assert!(cmd.contains(&"-frewrite-includes".to_string()));
        assert!(!cmd.contains(&"-fdirectives-only".to_string()));
    }

    #[test]
    fn non_compile_commands_are_unsupported() {
        let mut w = wrapper(&["gcc", "main.c", "-o", "a.out"]);
        assert!(matches!(
            w.preprocess_source(),
            Err(WrapperError::Unsupported(_))
        ));
    }
}
