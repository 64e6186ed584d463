use media_relay::config::RelayConfig;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_sample_config() {
    let config = RelayConfig::from_file("config/media_relay.yaml");
    assert!(config.is_ok(), "Failed to load sample config: {:?}", config.err());

    let config = config.unwrap();
    assert_eq!(config.listen_address, "0.0.0.0:5001");
    assert_eq!(config.cache.stream_url_ttl, 3600);
    assert_eq!(config.cache.fallback_cleanup_threshold, 1000);
    assert_eq!(config.upstream.chunk_size, 8192);
    assert_eq!(config.upstream.timeout_secs, 30);
    assert_eq!(config.extractor.player_clients, vec!["android", "ios"]);
}

#[test]
fn test_load_minimal_config() {
    let file = write_config(
        r#"
upstream:
  chunk_size: 16384
"#,
    );

    let config = RelayConfig::from_file(file.path()).unwrap();
    assert_eq!(config.upstream.chunk_size, 16384);
    // Check defaults are applied
    assert_eq!(config.upstream.timeout_secs, 30);
    assert_eq!(config.upstream.default_content_type, "audio/webm");
    assert_eq!(config.cache.stream_url_ttl, 3600);
    assert_eq!(config.extractor.program, "yt-dlp");
}

#[test]
fn test_load_empty_mapping_uses_defaults() {
    let file = write_config("{}\n");
    let config = RelayConfig::from_file(file.path()).unwrap();
    assert_eq!(config.upstream, RelayConfig::default().upstream);
}

#[test]
fn test_load_invalid_config() {
    let file = write_config(
        r#"
upstream:
  chunk_size: 100
"#,
    );

    let config = RelayConfig::from_file(file.path());
    assert!(config.is_err(), "Should fail validation for chunk_size < 1KB");
}

#[test]
fn test_load_malformed_yaml() {
    let file = write_config("cache: [unclosed\n");
    assert!(RelayConfig::from_file(file.path()).is_err());
}

#[test]
fn test_load_nonexistent_file() {
    let config = RelayConfig::from_file("nonexistent.yaml");
    assert!(config.is_err(), "Should fail when file doesn't exist");
}
