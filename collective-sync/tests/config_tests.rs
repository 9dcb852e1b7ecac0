use collective_sync::{EpochPolicy, SyncConfig};
use std::time::Duration;

#[test]
fn backoff_grows_by_half() {
    let config = SyncConfig::default();
    let first = config.next_backoff(Duration::from_millis(20));
    assert_eq!(first, Duration::from_millis(30));
    assert_eq!(config.next_backoff(first), Duration::from_millis(45));
}

#[test]
fn backoff_is_capped() {
    let config = SyncConfig {
        max_backoff_ms: 100,
        ..Default::default()
    };
    assert_eq!(config.next_backoff(Duration::from_millis(80)), Duration::from_millis(100));
    assert_eq!(config.next_backoff(Duration::from_millis(100)), Duration::from_millis(100));

    let mut delay = config.upload_period();
    for _ in 0..20 {
        delay = config.next_backoff(delay);
        assert!(delay <= config.max_backoff());
    }
    assert_eq!(delay, config.max_backoff());
}

#[test]
fn defaults() {
    let config = SyncConfig::default();
    assert_eq!(config.sync_path, "collective");
    assert!(config.synchronized_prefixes.is_empty());
    assert_eq!(config.upload_period(), Duration::from_secs(5));
    assert_eq!(config.collection_epoch(), Duration::from_secs(5));
    assert_eq!(config.max_backoff(), Duration::from_secs(300));
    assert_eq!(config.epoch_policy, EpochPolicy::AllOrNothing);
}

#[test]
fn partial_config_fills_defaults() {
    let config: SyncConfig = serde_json::from_str(
        r#"{"synchronized_prefixes":["shared"],"epoch_policy":"partial_apply"}"#,
    )
    .unwrap();
    assert_eq!(config.synchronized_prefixes, vec!["shared".to_string()]);
    assert_eq!(config.epoch_policy, EpochPolicy::PartialApply);
    assert_eq!(config.upload_period_ms, 5_000);
}
