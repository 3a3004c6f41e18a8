//! Read-only dispatch flags.

use serde::{Deserialize, Serialize};

pub const DEFAULT_TUPLE_ARGS_THRESHOLD: usize = 100;

/// Which computation builder lowers traced programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoweringPath {
    #[default]
    Classic,
    /// Lowering through an external MLIR pipeline; not available here.
    Mlir,
}

impl LoweringPath {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::Mlir => "mlir",
        }
    }
}

impl std::fmt::Display for LoweringPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Fail when an output of a dispatched computation contains a NaN.
    pub debug_nans: bool,
    /// Fail when an output of a dispatched computation contains an infinity.
    pub debug_infs: bool,
    /// Log every compilation at `WARN` instead of `DEBUG`.
    pub log_compiles: bool,
    pub lowering: LoweringPath,
    /// Argument counts above this are passed to the executable as one tuple.
    pub tuple_args_threshold: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            debug_nans: false,
            debug_infs: false,
            log_compiles: false,
            lowering: LoweringPath::Classic,
            tuple_args_threshold: DEFAULT_TUPLE_ARGS_THRESHOLD,
        }
    }
}

impl DispatchConfig {
    /// Defaults overridden by `TJ_DEBUG_NANS`, `TJ_DEBUG_INFS`,
    /// `TJ_LOG_COMPILES` and `TJ_TUPLE_ARGS_THRESHOLD`. Malformed values are
    /// ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(flag) = lookup("TJ_DEBUG_NANS").as_deref().and_then(parse_flag) {
            config.debug_nans = flag;
        }
        if let Some(flag) = lookup("TJ_DEBUG_INFS").as_deref().and_then(parse_flag) {
            config.debug_infs = flag;
        }
        if let Some(flag) = lookup("TJ_LOG_COMPILES").as_deref().and_then(parse_flag) {
            config.log_compiles = flag;
        }
        if let Some(threshold) = lookup("TJ_TUPLE_ARGS_THRESHOLD")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
        {
            config.tuple_args_threshold = threshold;
        }
        config
    }

    #[must_use]
    pub fn checks_numerics(&self) -> bool {
        self.debug_nans || self.debug_infs
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
