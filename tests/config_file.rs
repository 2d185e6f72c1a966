use pacer::config::{Config, ConfigError};
use std::io::Write;

#[test]
fn bundled_config_loads_and_validates() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml");
    let config = Config::from_file(path).unwrap();

    assert_eq!(config.target.port, 10086);
    assert_eq!(config.run.connections, 100);
    assert_eq!(config.run.expected_exchanges(), 100_000);
    assert_eq!(config.socket.max_frame_size, 10240);
    assert_eq!(config.validate(), Ok(()));
}

#[test]
fn invalid_values_surface_on_validate() {
    let mut file = tempfile();
    writeln!(file.1, "[run]\nrequests_per_connection = 0").unwrap();

    let config = Config::from_file(file.0.to_str().unwrap()).unwrap();
    assert_eq!(config.validate(), Err(ConfigError::ZeroQuota));
    std::fs::remove_file(&file.0).ok();
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::from_file("/definitely/not/here/pacer.toml").is_err());
}

fn tempfile() -> (std::path::PathBuf, std::fs::File) {
    let path = std::env::temp_dir().join(format!("pacer-config-{}.toml", std::process::id()));
    let file = std::fs::File::create(&path).unwrap();
    (path, file)
}
