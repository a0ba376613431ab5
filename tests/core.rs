//! Core infrastructure tests.

mod common;

use std::path::PathBuf;
use tessera::core::config::{Config, ConfigOverrides};
use tessera::core::error::{ErrorKind, TesseraError, UnavailableReason};
use tessera::core::time::{Clock, ManualClock, Tick};

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn parse_minimal_config() {
    let dir = tempfile::tempdir().unwrap();
    let file = common::config_file(&common::single_member_toml(dir.path()));

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.member.id, 1);
    assert_eq!(config.member.name, "solo");
    assert_eq!(config.member.data_dir, dir.path());
    assert_eq!(config.telemetry.log_level, "info");
    assert!(config.listeners.tls_chain_path.is_none());
}

#[test]
fn parse_three_member_cluster() {
    let file = common::config_file(
        r#"
[member]
id = 3
name = "c"
data_dir = "/var/lib/tessera"

[cluster]
initial_members = [
    { id = 1, name = "a", peer_addr = "10.0.0.1:2380" },
    { id = 2, name = "b", peer_addr = "10.0.0.2:2380" },
    { id = 3, name = "c", peer_addr = "10.0.0.3:2380", client_addr = "10.0.0.3:2379" },
]
tick_interval_ms = 50
election_ticks = 20
heartbeat_ticks = 2

[kv]
compaction_retention = 5000
max_lease_ttl = 600
"#,
    );

    let config = Config::from_file(file.path()).unwrap();
    let members = config.initial_members();
    assert_eq!(members.len(), 3);
    assert_eq!(members[2].peer_addr, "10.0.0.3:2380");
    assert_eq!(members[2].client_addr, "10.0.0.3:2379");
    assert_eq!(config.tick_interval().as_millis(), 50);
    assert_eq!(config.kv.compaction_retention, 5000);
    assert_eq!(config.kv.max_lease_ttl, 600);
}

#[test]
fn rejects_unlisted_member() {
    let file = common::config_file(
        r#"
[member]
id = 9
data_dir = "d"

[cluster]
initial_members = [{ id = 1, peer_addr = "10.0.0.1:2380" }]
"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("not listed"), "{:#}", err);
}

#[test]
fn rejects_election_not_above_heartbeat() {
    let file = common::config_file(
        r#"
[member]
id = 1
data_dir = "d"

[cluster]
election_ticks = 2
heartbeat_ticks = 2
"#,
    );
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn rejects_unknown_log_level() {
    let file = common::config_file(
        r#"
[member]
id = 1
data_dir = "d"

[telemetry]
log_level = "chatty"
"#,
    );
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn missing_file_reports_path() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/tessera.toml")).unwrap_err();
    assert!(format!("{:#}", err).contains("/nonexistent/tessera.toml"));
}

#[test]
fn overrides_apply_after_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::from_toml(&common::single_member_toml(dir.path())).unwrap();
    config.apply_overrides(&ConfigOverrides {
        log_level: Some("debug".into()),
        data_dir: Some(PathBuf::from("/srv/tessera")),
    });
    assert_eq!(config.telemetry.log_level, "debug");
    assert_eq!(config.member.data_dir, PathBuf::from("/srv/tessera"));
    config.validate().unwrap();
}

#[test]
fn serialized_config_reloads() {
    let config = Config::single_member(4, "/tmp/t");
    let text = config.to_toml().unwrap();
    let back = Config::from_toml(&text).unwrap();
    assert_eq!(back.member.id, 4);
    assert_eq!(back.initial_members(), config.initial_members());
}

// ============================================================================
// Error tests
// ============================================================================

#[test]
fn only_unavailability_is_retryable() {
    assert!(TesseraError::unavailable(UnavailableReason::NoLeader).is_retryable());
    assert!(TesseraError::unavailable(UnavailableReason::Timeout).is_retryable());
    assert!(!TesseraError::permission_denied("no").is_retryable());
    assert!(!TesseraError::invalid_argument("bad").is_retryable());
    assert!(!TesseraError::RevisionCompacted {
        revision: 1,
        compaction_floor: 5
    }
    .is_retryable());
}

#[test]
fn errors_classify_into_kinds() {
    assert_eq!(
        TesseraError::RevisionCompacted {
            revision: 2,
            compaction_floor: 10
        }
        .kind(),
        ErrorKind::RevisionCompacted
    );
    assert_eq!(
        TesseraError::FutureRevision {
            revision: 20,
            current: 10
        }
        .kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(TesseraError::InvalidToken.kind(), ErrorKind::Unauthenticated);
    assert_eq!(TesseraError::LeaseNotFound { lease_id: 7 }.kind(), ErrorKind::NotFound);
    assert_eq!(
        TesseraError::UserExists { name: "a".into() }.kind(),
        ErrorKind::AlreadyExists
    );
}

#[test]
fn error_messages_name_the_revision() {
    let err = TesseraError::RevisionCompacted {
        revision: 3,
        compaction_floor: 8,
    };
    let text = err.to_string();
    assert!(text.contains('3') && text.contains('8'), "{}", text);
}

// ============================================================================
// Time tests
// ============================================================================

#[test]
fn manual_clock_moves_only_when_told() {
    let clock = ManualClock::new(Tick::new(1_000));
    assert_eq!(clock.now(), Tick::new(1_000));
    clock.advance_ms(250);
    assert_eq!(clock.now().ms, 1_250);
    clock.set(Tick::new(5_000));
    assert_eq!(clock.now().ms, 5_000);
}

#[test]
fn tick_arithmetic() {
    let start = Tick::new(10_000);
    let deadline = start.add_secs(5);
    assert_eq!(deadline.ms, 15_000);
    assert!(!start.is_at_or_after(deadline));
    assert!(start.add_ms(5_000).is_at_or_after(deadline));
    assert_eq!(start.ms_until(deadline), 5_000);
    assert_eq!(deadline.ms_until(start), 0);
}
