//! Fingerprint determinism and config loading for `e2s-core`.
//!
//! Each `#[case]` is isolated; no shared state.

use assert_fs::prelude::*;
use e2s_core::{
    external_id, AccountStatus, CoreError, Fingerprint, Normalizer, SourceRecord, SyncConfig,
};
use predicates::prelude::predicate;
use rstest::rstest;

fn record(name: &str, status: &str, address: &str) -> SourceRecord {
    let mut r = SourceRecord::new("C100", name);
    r.status = AccountStatus::parse(status);
    r.address = address.to_string();
    r
}

#[rstest]
#[case("Acme Store", "ACTIVE", "1 Main St, Austin TX")]
#[case("  acme   store ", "active", "1 main st austin tx")]
#[case("ACME STORE!", "Active", "1 Main St., Austin, TX")]
#[case("Acme\tStore", " ACTIVE ", "1  Main  St , Austin  TX")]
fn cosmetic_variants_share_a_fingerprint(
    #[case] name: &str,
    #[case] status: &str,
    #[case] address: &str,
) {
    let n = Normalizer::default();
    let baseline = Fingerprint::of_source(&n, &record("Acme Store", "ACTIVE", "1 Main St, Austin TX"));
    assert_eq!(Fingerprint::of_source(&n, &record(name, status, address)), baseline);
}

#[rstest]
#[case("Acme Store 2", "ACTIVE", "1 Main St, Austin TX")]
#[case("Acme Store", "INACTIVE", "1 Main St, Austin TX")]
#[case("Acme Store", "ACTIVE", "2 Main St, Austin TX")]
fn content_changes_move_the_fingerprint(
    #[case] name: &str,
    #[case] status: &str,
    #[case] address: &str,
) {
    let n = Normalizer::default();
    let baseline = Fingerprint::of_source(&n, &record("Acme Store", "ACTIVE", "1 Main St, Austin TX"));
    assert_ne!(Fingerprint::of_source(&n, &record(name, status, address)), baseline);
}

#[test]
fn fingerprint_is_stable_across_calls_and_readers() {
    let a = Fingerprint::for_address(&Normalizer::default(), "Acme Store", "ACTIVE", "");
    let b = Fingerprint::for_address(&Normalizer::default(), "Acme Store", "ACTIVE", "");
    assert_eq!(a, b);
    // A digest stored truncated by an earlier run still matches.
    assert!(a.matches(&a.as_str()[..external_id::MAX_VALUE_LEN]));
}

#[rstest]
#[case("encompass_id")]
#[case("EncompassId")]
#[case("ENCOMPASS_ID")]
#[case("encompassid")]
fn every_alias_reads_the_same_identifier(#[case] key: &str) {
    let ids = [(key.to_string(), "C100".to_string())].into_iter().collect();
    assert_eq!(
        external_id::read_source_id(&ids).expect("no conflict"),
        Some("C100".to_string())
    );
}

#[test]
fn config_file_is_loaded_from_disk() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("e2s.yaml");
    file.write_str("retention_days: 7\nconfirm_delete: true\n")
        .expect("write");
    file.assert(predicate::path::exists());

    let config = SyncConfig::load_at(file.path()).expect("load");
    assert_eq!(config.retention_days, 7);
    assert!(config.confirm_delete);
    assert_eq!(config.radius_m, 50);
}

#[test]
fn missing_config_file_is_an_io_error() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let err = SyncConfig::load_at(&dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, CoreError::Io { .. }), "got: {err}");
}
