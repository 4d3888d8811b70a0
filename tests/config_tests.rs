use std::io::Write;

use isoledger::{IsolationLevel, Ledger, LedgerConfig, LedgerError, LockWait, PhantomPolicy};

#[test]
fn test_defaults() {
    let config = LedgerConfig::default();
    assert_eq!(config.default_isolation, IsolationLevel::ReadCommitted);
    assert_eq!(config.phantom_policy, PhantomPolicy::MySql);
    assert_eq!(config.lock_wait, LockWait::Block { timeout_ms: 1_000 });
    assert_eq!(config.gc_interval, 128);

    assert_eq!(LedgerConfig::from_toml_str("").unwrap(), config);
}

#[test]
fn test_parse_full_config() {
    let text = r#"
        default_isolation = "serializable"
        phantom_policy = "postgresql"
        gc_interval = 0

        [lock_wait]
        mode = "block"
        timeout_ms = 250
    "#;
    let config = LedgerConfig::from_toml_str(text).unwrap();
    assert_eq!(
        config,
        LedgerConfig::default()
            .with_isolation(IsolationLevel::Serializable)
            .with_phantom_policy(PhantomPolicy::PostgreSql)
            .with_lock_wait(LockWait::Block { timeout_ms: 250 })
            .with_gc_interval(0)
    );
}

#[test]
fn test_parse_no_wait() {
    let config = LedgerConfig::from_toml_str("lock_wait = { mode = \"no_wait\" }").unwrap();
    assert_eq!(config.lock_wait, LockWait::NoWait);
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(matches!(
        LedgerConfig::from_toml_str("default_isolation = \"snapshot\""),
        Err(LedgerError::Config(_))
    ));
    assert!(matches!(
        LedgerConfig::load("/definitely/not/here.toml"),
        Err(LedgerError::Config(_))
    ));
}

#[test]
fn test_load_from_file_and_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "default_isolation = \"repeatable_read\"").unwrap();
    writeln!(file, "phantom_policy = \"postgresql\"").unwrap();

    let config = LedgerConfig::load(file.path()).unwrap();
    assert_eq!(config.default_isolation, IsolationLevel::RepeatableRead);
    assert_eq!(config.phantom_policy, PhantomPolicy::PostgreSql);

    let text = config.to_toml_string().unwrap();
    assert_eq!(LedgerConfig::from_toml_str(&text).unwrap(), config);

    let ledger = Ledger::new(config);
    assert_eq!(
        ledger.begin_default().isolation_level(),
        IsolationLevel::RepeatableRead
    );
}
