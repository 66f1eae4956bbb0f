#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::float_cmp)]

//! # Cortex Domains
//!
//! Concrete tool domains for the Cortex harness. Each adapter hides its
//! tool's semantics behind the `DomainAdapter` protocol; the agent loop
//! only ever sees an executor tool, two meta-tools, and descriptive error
//! text.
//!
//! - [`sqlite`]: SQL through the `sqlite3` CLI with safety checks
//! - [`gridtool`]: a native pipeline CSV DSL with degradable error prose
//! - [`fluxtool`]: the remapped holdout DSL compiled onto the gridtool engine
//! - [`shell`]: unrestricted shell in a per-run workspace
//! - [`artic`]: a GET-only REST client for a public art-collection API

pub mod artic;
pub mod fluxtool;
pub mod gridtool;
pub mod shell;
pub mod sqlite;

use std::path::PathBuf;

use cortex_harness::domain::{DomainAdapter, ErrorStyle};
use cortex_harness::error::{Error, Result};

pub use artic::ArticAdapter;
pub use fluxtool::FluxtoolAdapter;
pub use gridtool::{GridtoolAdapter, run_gridtool_script};
pub use shell::ShellAdapter;
pub use sqlite::SqliteAdapter;

/// Domain names the registry recognizes.
pub const DOMAIN_NAMES: [&str; 5] = ["sqlite", "gridtool", "fluxtool", "shell", "artic"];

/// Construction options shared by every adapter.
#[derive(Debug, Clone, Default)]
pub struct DomainOptions {
    /// Error-prose style for adapters that support degradation.
    pub error_style: ErrorStyle,
    /// Root of local reference docs exposed to the strict-mode knowledge
    /// provider (one subdirectory per domain).
    pub docs_root: Option<PathBuf>,
}

impl DomainOptions {
    fn domain_docs(&self, domain: &str) -> Option<PathBuf> {
        self.docs_root.as_ref().map(|root| root.join(domain))
    }
}

/// Look up an adapter by domain name.
pub fn resolve_adapter(name: &str, options: &DomainOptions) -> Result<Box<dyn DomainAdapter>> {
    match name.trim().to_lowercase().as_str() {
        "sqlite" => Ok(Box::new(SqliteAdapter::new(options.domain_docs("sqlite")))),
        "gridtool" => Ok(Box::new(GridtoolAdapter::new(
            options.error_style,
            options.domain_docs("gridtool"),
        ))),
        "fluxtool" => Ok(Box::new(FluxtoolAdapter::new(
            options.error_style,
            options.domain_docs("fluxtool"),
        ))),
        "shell" => Ok(Box::new(ShellAdapter::new(options.domain_docs("shell")))),
        "artic" => Ok(Box::new(ArticAdapter::new(options.domain_docs("artic")))),
        other => Err(Error::UnknownDomain(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_known_domain() {
        let options = DomainOptions::default();
        for name in DOMAIN_NAMES {
            let adapter = resolve_adapter(name, &options).unwrap();
            assert_eq!(adapter.name(), name);
            assert!(adapter.executor_tool_name().starts_with("run_"));
        }
        assert!(resolve_adapter("fortran", &options).is_err());
    }

    #[test]
    fn every_adapter_exposes_three_standard_tools() {
        let options = DomainOptions::default();
        for name in DOMAIN_NAMES {
            let adapter = resolve_adapter(name, &options).unwrap();
            let defs = adapter.tool_defs(&[], false);
            assert_eq!(defs.len(), 3, "{name} should expose executor + meta tools");
            let names: Vec<&str> = defs.iter().map(|def| def.name.as_str()).collect();
            assert!(names.contains(&adapter.executor_tool_name()));
            assert!(names.contains(&"read_skill"));
            assert!(names.contains(&"show_fixture"));

            let opaque_defs = adapter.tool_defs(&[], true);
            let opaque_names: Vec<&str> = opaque_defs.iter().map(|def| def.name.as_str()).collect();
            assert_eq!(opaque_names, vec!["dispatch", "probe", "catalog"]);
        }
    }
}
