use std::io::Write;
use std::time::Duration;

use trellis_core::{Application, ApplicationStatus, Config};

#[test]
fn test_user_file_configures_new_applications() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[defaults]
channel_count = 4
tempo = 140.0
time_signature = [7, 8]

[server]
port = 57200
retry_backoff_ms = 10
"#
    )
    .unwrap();

    let config = Config::load_from(file.path());
    let settings = config.settings();
    assert_eq!(settings.server_port, 57200);
    assert_eq!(settings.retry_backoff, Duration::from_millis(10));

    let app = Application::from_config(&config);
    assert_eq!(app.status(), ApplicationStatus::Offline);
    assert_eq!(app.channel_count(), 4);
    assert_eq!(app.transport().tempo(), 140.0);
    assert_eq!(app.transport().time_signature(), (7, 8));
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_from(&dir.path().join("absent.toml"));
    let settings = config.settings();
    assert_eq!(settings.channel_count, 2);
    assert_eq!(settings.tempo, 120.0);
    assert_eq!(settings.boot_retries, 3);
}

#[test]
fn test_out_of_range_values_are_clamped() {
    let config = Config::from_toml_str(
        r#"
[defaults]
channel_count = 32
tempo = -5.0

[server]
boot_retries = 0
"#,
    )
    .unwrap();
    let settings = config.settings();
    assert_eq!(settings.channel_count, 8);
    assert_eq!(settings.tempo, 120.0);
    assert_eq!(settings.boot_retries, 1);
}
