//! Compiler options.
//!
//! The recognized option set and its effects. Options are plain data; the
//! pipeline reads them, nothing mutates them after a context is built.

use opal_core::{Bailout, CompileResult};

/// Named boolean/integer options controlling code generation.
#[derive(Debug, Clone)]
pub struct Options {
    /// 0..3. Level 1 enables canonicalization and local value numbering,
    /// level 2 adds inlining, level 3 adds redundant range-check pruning.
    pub opt_level: u8,
    /// Emit array range checks.
    pub gen_bounds_checks: bool,
    /// Emit store-type checks for object array stores.
    pub gen_array_store_check: bool,
    /// Emit explicit divide-by-zero checks instead of relying on a
    /// hardware trap.
    pub gen_explicit_div0_checks: bool,
    /// Lower switches through contiguous key ranges; when off, one compare
    /// per case.
    pub gen_table_ranges: bool,
    /// Reserve a scratch register for biased locking in monitor enter.
    pub use_biased_locking: bool,
    /// Emit the XIR call-site snippet after argument materialization.
    pub invoke_snippet_after_arguments: bool,
    /// SSE level for x86 floating point (0, 1 or 2).
    pub sse_version: u8,
    /// Force patching paths even when resolution would succeed.
    pub test_patching: bool,
    /// When set, restrict diagnostic output to methods whose qualified
    /// name contains this substring.
    pub print_filter: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            opt_level: 1,
            gen_bounds_checks: true,
            gen_array_store_check: true,
            gen_explicit_div0_checks: true,
            gen_table_ranges: true,
            use_biased_locking: false,
            invoke_snippet_after_arguments: true,
            sse_version: 2,
            test_patching: false,
            print_filter: None,
        }
    }
}

impl Options {
    /// Whether inlining is enabled.
    #[inline]
    pub fn inline(&self) -> bool {
        self.opt_level >= 2
    }

    /// Whether canonicalization and local value numbering run during build.
    #[inline]
    pub fn canonicalize(&self) -> bool {
        self.opt_level >= 1
    }

    /// Whether redundant range checks are pruned.
    #[inline]
    pub fn prune_range_checks(&self) -> bool {
        self.opt_level >= 3 && self.gen_bounds_checks
    }

    /// Whether diagnostics should be produced for a method name.
    pub fn matches_filter(&self, qualified_name: &str) -> bool {
        match &self.print_filter {
            Some(filter) => qualified_name.contains(filter.as_str()),
            None => false,
        }
    }

    /// Set an option by its spelled name, e.g. `("OptLevel", "2")`.
    pub fn set(&mut self, name: &str, value: &str) -> CompileResult<()> {
        fn parse_bool(name: &str, value: &str) -> CompileResult<bool> {
            match value {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(Bailout::invariant(format!(
                    "option {name} expects a boolean, got {value:?}"
                ))),
            }
        }
        match name {
            "OptLevel" => {
                let level: u8 = value
                    .parse()
                    .map_err(|_| Bailout::invariant(format!("bad OptLevel {value:?}")))?;
                if level > 3 {
                    return Err(Bailout::invariant(format!("OptLevel out of range: {level}")));
                }
                self.opt_level = level;
            }
            "GenBoundsChecks" => self.gen_bounds_checks = parse_bool(name, value)?,
            "GenArrayStoreCheck" => self.gen_array_store_check = parse_bool(name, value)?,
            "GenExplicitDiv0Checks" => self.gen_explicit_div0_checks = parse_bool(name, value)?,
            "GenTableRanges" => self.gen_table_ranges = parse_bool(name, value)?,
            "UseBiasedLocking" => self.use_biased_locking = parse_bool(name, value)?,
            "InvokeSnippetAfterArguments" => {
                self.invoke_snippet_after_arguments = parse_bool(name, value)?
            }
            "SSEVersion" => {
                let v: u8 = value
                    .parse()
                    .map_err(|_| Bailout::invariant(format!("bad SSEVersion {value:?}")))?;
                if v > 2 {
                    return Err(Bailout::invariant(format!("SSEVersion out of range: {v}")));
                }
                self.sse_version = v;
            }
            "PrintFilter" => {
                self.print_filter = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "TestPatching" => self.test_patching = parse_bool(name, value)?,
            _ => {
                return Err(Bailout::invariant(format!("unknown option {name:?}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.opt_level, 1);
        assert!(opts.gen_bounds_checks);
        assert!(opts.gen_table_ranges);
        assert!(!opts.inline());
        assert!(opts.canonicalize());
    }

    #[test]
    fn test_set_by_name() {
        let mut opts = Options::default();
        opts.set("OptLevel", "3").unwrap();
        opts.set("GenBoundsChecks", "false").unwrap();
        opts.set("PrintFilter", "Foo.bar").unwrap();
        assert_eq!(opts.opt_level, 3);
        assert!(!opts.gen_bounds_checks);
        assert!(opts.inline());
        assert!(opts.matches_filter("com/x/Foo.bar(II)V"));
        assert!(!opts.matches_filter("com/x/Baz.qux()V"));
    }

    #[test]
    fn test_unknown_and_invalid_rejected() {
        let mut opts = Options::default();
        assert!(opts.set("NoSuchOption", "1").is_err());
        assert!(opts.set("OptLevel", "9").is_err());
        assert!(opts.set("GenTableRanges", "maybe").is_err());
    }

    #[test]
    fn test_filter_off_means_silent() {
        let opts = Options::default();
        assert!(!opts.matches_filter("anything"));
    }
}
