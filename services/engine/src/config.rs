//! Engine configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/vg-engine/engine.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `store.sqlite_path`
//! - Each `[[fix_sessions]]` / `[[ilink3_sessions]]` entry needs a `role`
//!   (`"initiator"` or `"acceptor"`) and the matching `target`/`bind` address.

use std::path::{Path, PathBuf};

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config types (validated, used by the rest of the engine)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reply_timeout_ms: u64,
    pub negotiate_resend_max: u32,
    pub retransmit_batch_max: u64,
    pub max_inflight_replies: usize,
    pub default_library_id: String,
    pub log_any_messages: bool,
    pub application_heartbeat_interval_ms: u64,
    pub library_timeout_ms: u64,
    pub archive_backup_location: Option<PathBuf>,
    pub store: StoreConfig,
    pub fix_sessions: Vec<FixSessionConfig>,
    pub ilink3_sessions: Vec<Ilink3SessionConfig>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Acceptor,
}

/// A session's network endpoint: where to connect to (initiator) or where
/// to listen (acceptor). Which one applies is determined by `role`.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub role: SessionRole,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct FixSessionConfig {
    pub endpoint: Endpoint,
    pub begin_string: String,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub heart_bt_int: u32,
}

#[derive(Debug, Clone)]
pub struct Ilink3SessionConfig {
    pub endpoint: Endpoint,
    pub session_id: String,
    pub firm_id: String,
    pub keep_alive_interval_ms: u64,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    engine: Option<RawEngineSection>,
    store: Option<RawStoreConfig>,
    fix_sessions: Option<Vec<RawFixSessionConfig>>,
    ilink3_sessions: Option<Vec<RawIlink3SessionConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawEngineSection {
    reply_timeout_ms: Option<u64>,
    negotiate_resend_max: Option<u32>,
    retransmit_batch_max: Option<u64>,
    max_inflight_replies: Option<usize>,
    default_library_id: Option<String>,
    log_any_messages: Option<bool>,
    application_heartbeat_interval_ms: Option<u64>,
    library_timeout_ms: Option<u64>,
    archive_backup_location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFixSessionConfig {
    role: Option<String>,
    target: Option<String>,
    bind: Option<String>,
    begin_string: Option<String>,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    heart_bt_int: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawIlink3SessionConfig {
    role: Option<String>,
    target: Option<String>,
    bind: Option<String>,
    session_id: Option<String>,
    firm_id: Option<String>,
    keep_alive_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load engine config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load engine config from the default path `/etc/vg-engine/engine.toml`.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/vg-engine/engine.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<EngineConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw.schema_version.ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!("schema_version must be 1, got {schema_version}")));
    }

    let engine_section = raw.engine.unwrap_or(RawEngineSection {
        reply_timeout_ms: None,
        negotiate_resend_max: None,
        retransmit_batch_max: None,
        max_inflight_replies: None,
        default_library_id: None,
        log_any_messages: None,
        application_heartbeat_interval_ms: None,
        library_timeout_ms: None,
        archive_backup_location: None,
    });

    let raw_store = raw.store.ok_or_else(|| ConfigError::MissingField("store".to_owned()))?;
    let sqlite_path = raw_store.sqlite_path.ok_or_else(|| ConfigError::MissingField("store.sqlite_path".to_owned()))?;

    let raw_fix = raw.fix_sessions.unwrap_or_default();
    let mut fix_sessions = Vec::with_capacity(raw_fix.len());
    for (i, s) in raw_fix.into_iter().enumerate() {
        let endpoint = parse_endpoint("fix_sessions", i, s.role, s.target, s.bind)?;
        fix_sessions.push(FixSessionConfig {
            endpoint,
            begin_string: s.begin_string.unwrap_or_else(|| "FIX.4.4".to_owned()),
            sender_comp_id: s
                .sender_comp_id
                .ok_or_else(|| ConfigError::MissingField(format!("fix_sessions[{i}].sender_comp_id")))?,
            target_comp_id: s
                .target_comp_id
                .ok_or_else(|| ConfigError::MissingField(format!("fix_sessions[{i}].target_comp_id")))?,
            heart_bt_int: s.heart_bt_int.unwrap_or(30),
        });
    }

    let raw_ilink3 = raw.ilink3_sessions.unwrap_or_default();
    let mut ilink3_sessions = Vec::with_capacity(raw_ilink3.len());
    for (i, s) in raw_ilink3.into_iter().enumerate() {
        let endpoint = parse_endpoint("ilink3_sessions", i, s.role, s.target, s.bind)?;
        ilink3_sessions.push(Ilink3SessionConfig {
            endpoint,
            session_id: s.session_id.ok_or_else(|| ConfigError::MissingField(format!("ilink3_sessions[{i}].session_id")))?,
            firm_id: s.firm_id.ok_or_else(|| ConfigError::MissingField(format!("ilink3_sessions[{i}].firm_id")))?,
            keep_alive_interval_ms: s.keep_alive_interval_ms.unwrap_or(10_000),
        });
    }

    Ok(EngineConfig {
        reply_timeout_ms: engine_section.reply_timeout_ms.unwrap_or(10_000),
        negotiate_resend_max: engine_section.negotiate_resend_max.unwrap_or(2),
        retransmit_batch_max: engine_section.retransmit_batch_max.unwrap_or(2500),
        max_inflight_replies: engine_section.max_inflight_replies.unwrap_or(1024),
        default_library_id: engine_section.default_library_id.unwrap_or_else(|| "local".to_owned()),
        log_any_messages: engine_section.log_any_messages.unwrap_or(false),
        application_heartbeat_interval_ms: engine_section.application_heartbeat_interval_ms.unwrap_or(15_000),
        library_timeout_ms: engine_section.library_timeout_ms.unwrap_or(30_000),
        archive_backup_location: engine_section.archive_backup_location.map(PathBuf::from),
        store: StoreConfig { sqlite_path },
        fix_sessions,
        ilink3_sessions,
    })
}

fn parse_endpoint(
    section: &str,
    index: usize,
    role: Option<String>,
    target: Option<String>,
    bind: Option<String>,
) -> Result<Endpoint, ConfigError> {
    let role = role.ok_or_else(|| ConfigError::MissingField(format!("{section}[{index}].role")))?;
    match role.as_str() {
        "initiator" => {
            let address = target.ok_or_else(|| ConfigError::MissingField(format!("{section}[{index}].target")))?;
            Ok(Endpoint { role: SessionRole::Initiator, address })
        }
        "acceptor" => {
            let address = bind.ok_or_else(|| ConfigError::MissingField(format!("{section}[{index}].bind")))?;
            Ok(Endpoint { role: SessionRole::Acceptor, address })
        }
        other => Err(ConfigError::InvalidValue(format!(
            "{section}[{index}].role must be \"initiator\" or \"acceptor\", got \"{other}\""
        ))),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        schema_version = 1

        [store]
        sqlite_path = "/tmp/does-not-matter.sqlite3"

        [[fix_sessions]]
        role = "acceptor"
        bind = "0.0.0.0:5001"
        sender_comp_id = "GATEWAY"
        target_comp_id = "VENUE"

        [[ilink3_sessions]]
        role = "initiator"
        target = "127.0.0.1:6001"
        session_id = "SESSION-A"
        firm_id = "FIRM-X"
    "#;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let cfg = load_config_from_str(MINIMAL).expect("minimal config should load");
        assert_eq!(cfg.reply_timeout_ms, 10_000);
        assert_eq!(cfg.fix_sessions.len(), 1);
        assert_eq!(cfg.fix_sessions[0].begin_string, "FIX.4.4");
        assert_eq!(cfg.fix_sessions[0].endpoint.role, SessionRole::Acceptor);
        assert_eq!(cfg.ilink3_sessions.len(), 1);
        assert_eq!(cfg.ilink3_sessions[0].endpoint.role, SessionRole::Initiator);
        assert_eq!(cfg.ilink3_sessions[0].keep_alive_interval_ms, 10_000);
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let toml = "schema_version = 2\n[store]\nsqlite_path = \"x\"\n";
        assert!(matches!(load_config_from_str(toml), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn rejects_missing_store() {
        let toml = "schema_version = 1\n";
        assert!(matches!(load_config_from_str(toml), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn rejects_acceptor_without_bind() {
        let toml = r#"
            schema_version = 1
            [store]
            sqlite_path = "x"
            [[fix_sessions]]
            role = "acceptor"
            sender_comp_id = "GATEWAY"
            target_comp_id = "VENUE"
        "#;
        assert!(matches!(load_config_from_str(toml), Err(ConfigError::MissingField(_))));
    }
}
