/// Optional cache behaviors a wrapper opts into.
///
/// - `hard_links`: artifacts may be hard-linked between the cache and the
///   build tree (safe only when the wrapped tool never rewrites outputs in
///   place).
/// - `create_target_dirs`: replay may create missing parent directories for
///   expected files.
/// - `direct_mode`: the wrapper can enumerate its input files without a full
///   preprocessor run. Declared for forward compatibility; the pipeline
///   currently always preprocesses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub hard_links: bool,
    pub create_target_dirs: bool,
    pub direct_mode: bool,
}

impl Capabilities {
    /// Parse capability tags; unknown tags are logged and ignored.
    pub fn from_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Self {
        let mut caps = Self::default();
        for tag in tags {
            match tag {
                "hard_links" => caps.hard_links = true,
                "create_target_dirs" => caps.create_target_dirs = true,
                "direct_mode" => caps.direct_mode = true,
                other => {
                    tracing::error!(target = "kiln.wrapper", tag = other, "invalid capability");
                }
            }
        }
        caps
    }
}
