//! AOT configuration.
//!
//! Values come from three layers, lowest precedence first: a TOML document
//! ([`AotConfig::from_toml_str`]), the `OTTER_*` environment variables
//! ([`AotConfig::apply_env`]) and the `with_*` setters.
//!
//! ```toml
//! enable_aot = true
//! stub_file = "/system/lib/otter/stub.an"
//! aot_file_base = "/data/app/entry/modules"
//! use_mmap = true
//! verify_checksum = true
//! framework_abc_names = ["framework/ui.abc"]
//! ```

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;

/// Set to a truthy value to run everything in the interpreter
pub const ENV_DISABLE_AOT: &str = "OTTER_DISABLE_AOT";
/// Path of the stub container
pub const ENV_STUB_FILE: &str = "OTTER_AOT_STUB_FILE";
/// Base name of the `.an`/`.ai` pair
pub const ENV_AOT_FILE: &str = "OTTER_AOT_FILE";
/// Memory-map containers and snapshots
pub const ENV_MMAP: &str = "OTTER_AOT_MMAP";
/// Bind bytecode files without comparing checksums
pub const ENV_SKIP_CHECKSUM: &str = "OTTER_AOT_SKIP_CHECKSUM";

/// AOT loader settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AotConfig {
    /// Load and bind AOT code at all
    pub enable_aot: bool,
    /// Container holding the runtime stubs
    pub stub_file: Option<PathBuf>,
    /// Base name to which `.an` and `.ai` are appended
    pub aot_file_base: Option<String>,
    /// Memory-map files instead of reading them
    pub use_mmap: bool,
    /// Refuse to bind bytecode files whose checksum changed since compilation
    pub verify_checksum: bool,
    /// Bytecode files whose constant pools may be patched by the framework
    pub framework_abc_names: Vec<String>,
    /// Treat unknown frames as fatal instead of ending the walk
    pub strict_frame_walk: bool,
}

impl Default for AotConfig {
    fn default() -> Self {
        Self {
            enable_aot: true,
            stub_file: None,
            aot_file_base: None,
            use_mmap: true,
            verify_checksum: true,
            framework_abc_names: Vec::new(),
            strict_frame_walk: true,
        }
    }
}

/// `"" | "0" | false | off | no` are false, everything else is true
pub fn parse_env_truthy(value: &str) -> bool {
    let value = value.trim();
    !matches!(value, "" | "0")
        && !value.eq_ignore_ascii_case("false")
        && !value.eq_ignore_ascii_case("off")
        && !value.eq_ignore_ascii_case("no")
}

impl AotConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self::default().apply_lookup(lookup)
    }

    /// Override fields from the process environment
    pub fn apply_env(self) -> Self {
        self.apply_lookup(|name| std::env::var(name).ok())
    }

    /// Override fields from `lookup`
    pub fn apply_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup(ENV_DISABLE_AOT).is_some_and(|v| parse_env_truthy(&v)) {
            self.enable_aot = false;
        }
        if let Some(path) = lookup(ENV_STUB_FILE).filter(|v| !v.trim().is_empty()) {
            self.stub_file = Some(PathBuf::from(path.trim()));
        }
        if let Some(base) = lookup(ENV_AOT_FILE).filter(|v| !v.trim().is_empty()) {
            self.aot_file_base = Some(base.trim().to_owned());
        }
        if let Some(value) = lookup(ENV_MMAP) {
            self.use_mmap = parse_env_truthy(&value);
        }
        if lookup(ENV_SKIP_CHECKSUM).is_some_and(|v| parse_env_truthy(&v)) {
            self.verify_checksum = false;
        }
        self
    }

    /// Enable or disable AOT
    pub fn with_enable_aot(mut self, enable: bool) -> Self {
        self.enable_aot = enable;
        self
    }

    /// Set the stub container path
    pub fn with_stub_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stub_file = Some(path.into());
        self
    }

    /// Set the `.an`/`.ai` base name
    pub fn with_aot_file_base(mut self, base: impl Into<String>) -> Self {
        self.aot_file_base = Some(base.into());
        self
    }

    /// Choose between memory-mapping and reading files
    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    /// Enable or disable checksum gating
    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Mark a bytecode file as framework code
    pub fn with_framework_abc_name(mut self, name: impl Into<String>) -> Self {
        self.framework_abc_names.push(name.into());
        self
    }

    /// Choose between strict and hybrid frame walks
    pub fn with_strict_frame_walk(mut self, strict: bool) -> Self {
        self.strict_frame_walk = strict;
        self
    }
}
