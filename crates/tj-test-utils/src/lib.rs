#![forbid(unsafe_code)]

//! Test-log schema shared by every tracejit crate.
//!
//! Each suite records one `TestLogV1` per logged scenario so that dispatch
//! behavior (cache hits, compile counts, placement decisions) can be replayed
//! and diffed across runs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TEST_LOG_SCHEMA_VERSION: &str = "tracejit.test-log.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogEnv {
    pub os: String,
    pub arch: String,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogV1 {
    pub schema_version: String,
    pub test_id: String,
    pub fixture_id: String,
    pub seed: Option<u64>,
    pub env: TestLogEnv,
    pub result: TestResult,
    /// Number of backend compilations observed while the scenario ran.
    pub compile_count: Option<u64>,
    pub details: Option<String>,
}

impl TestLogV1 {
    #[must_use]
    pub fn unit(
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        result: TestResult,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            seed: capture_proptest_seed(),
            env: capture_env(),
            result,
            compile_count: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_compile_count(mut self, count: u64) -> Self {
        self.compile_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[must_use]
pub fn capture_env() -> TestLogEnv {
    TestLogEnv {
        os: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        timestamp_unix_ms: now_unix_ms_u64(),
    }
}

pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Number of proptest cases to run, overridable through `TJ_PROPTEST_CASES`.
#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("TJ_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() { 512 } else { 128 }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    ["TJ_PROPTEST_SEED", "PROPTEST_RNG_SEED"]
        .iter()
        .find_map(|name| std::env::var(name).ok()?.parse::<u64>().ok())
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}
