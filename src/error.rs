//! Error taxonomy shared across the dispatcher, tables, and plugins.
//!
//! Mirrors the five classes in the design: transient external failures,
//! malformed input, table invariant violations, fatal startup/shutdown
//! errors, and plugin panics. Only the first three are ever returned from
//! a packet/conntrack/netlog callback; `Fatal` is raised during startup
//! and `PluginPanic` is synthesized by the dispatcher's catch boundary.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    TransientExternal,
    Malformed,
    TableInvariant,
    Fatal,
    PluginPanic,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 5] = [
        ErrorClass::TransientExternal,
        ErrorClass::Malformed,
        ErrorClass::TableInvariant,
        ErrorClass::Fatal,
        ErrorClass::PluginPanic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientExternal => "transient_external",
            ErrorClass::Malformed => "malformed",
            ErrorClass::TableInvariant => "table_invariant",
            ErrorClass::Fatal => "fatal",
            ErrorClass::PluginPanic => "plugin_panic",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ErrorClass::TransientExternal => 0,
            ErrorClass::Malformed => 1,
            ErrorClass::TableInvariant => 2,
            ErrorClass::Fatal => 3,
            ErrorClass::PluginPanic => 4,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DictError {
    #[error("unsupported value type {0:?}")]
    UnsupportedType(String),
    #[error("malformed dict line: {0}")]
    MalformedLine(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
