use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use capture_module::config::CaptureConfig;
use capture_module::RtpTransport;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAPTURE_CONFIG",
        "RTSP_CAPTURE_VIDEO",
        "RTSP_HOST",
        "RTSP_PORT",
        "RTSP_PATH",
        "RTSP_URL",
        "RTSP_USERNAME",
        "RTSP_PASSWORD",
        "RTSP_TRANSPORT",
        "RTSP_STORAGE_FOLDER_CAPTURE_VIDEO",
        "RTSP_THRESHOLD",
        "RTSP_RETRY_DELAY_SECS",
        "RTSP_MAX_CONNECT_ATTEMPTS",
        "RTSP_IDLE_TIMEOUT_SECS",
        "DEVICE_ID",
        "EDGE_CONN_STR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "capture_enabled": true,
        "stream": {
            "url": "rtsp://camera-1:8554/raw",
            "username": "viewer",
            "password": "secret",
            "transport": "tcp"
        },
        "output_dir": "/var/lib/capture",
        "window": {
            "threshold_secs": 10,
            "retry_delay_secs": 3,
            "max_connect_attempts": 5,
            "idle_timeout_secs": 20
        },
        "upload": {
            "device_id": "cam-from-file",
            "connection_string": "HostName=hub.local"
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("RTSP_THRESHOLD", "4");
    std::env::set_var("DEVICE_ID", "cam-from-env");

    let cfg = CaptureConfig::load().expect("load config");

    assert!(cfg.capture_enabled);
    assert_eq!(cfg.stream_url, "rtsp://camera-1:8554/raw");
    assert_eq!(cfg.credentials.username, "viewer");
    assert_eq!(cfg.credentials.password, "secret");
    assert_eq!(cfg.transport, RtpTransport::Tcp);
    assert_eq!(cfg.output_dir.to_str(), Some("/var/lib/capture"));
    assert_eq!(cfg.threshold, Duration::from_secs(4));
    assert_eq!(cfg.retry_delay, Duration::from_secs(3));
    assert_eq!(cfg.max_connect_attempts, Some(5));
    assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(20)));
    assert_eq!(cfg.device_id, "cam-from-env");
    assert_eq!(cfg.upload_connection_string.as_deref(), Some("HostName=hub.local"));

    clear_env();
}

#[test]
fn builds_stream_address_from_host_port_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RTSP_HOST", "192.168.0.33");
    std::env::set_var("RTSP_PORT", "8554");
    std::env::set_var("RTSP_PATH", "raw");
    std::env::set_var("RTSP_CAPTURE_VIDEO", "false");
    std::env::set_var("RTSP_STORAGE_FOLDER_CAPTURE_VIDEO", "/tmp/capture");
    std::env::set_var("EDGE_CONN_STR", "HostName=hub;DeviceId=test");

    let cfg = CaptureConfig::load().expect("load config");

    assert!(!cfg.capture_enabled);
    assert_eq!(cfg.stream_url, "rtsp://192.168.0.33:8554/raw");
    let params = cfg.connection_parameters().expect("params");
    assert_eq!(params.uri.host_str(), Some("192.168.0.33"));
    assert_eq!(params.uri.port(), Some(8554));
    assert_eq!(cfg.output_dir.to_str(), Some("/tmp/capture"));
    assert_eq!(
        cfg.upload_connection_string.as_deref(),
        Some("HostName=hub;DeviceId=test")
    );

    clear_env();
}

#[test]
fn zero_budget_and_idle_disable_limits() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RTSP_MAX_CONNECT_ATTEMPTS", "0");
    std::env::set_var("RTSP_IDLE_TIMEOUT_SECS", "0");

    let cfg = CaptureConfig::load().expect("load config");
    assert_eq!(cfg.max_connect_attempts, None);
    assert_eq!(cfg.idle_timeout, None);

    let settings = cfg.window_settings();
    assert_eq!(settings.retry.max_attempts, None);
    assert_eq!(settings.idle_timeout, None);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();

    for (key, value) in [
        ("RTSP_THRESHOLD", "0"),
        ("RTSP_THRESHOLD", "two"),
        ("RTSP_RETRY_DELAY_SECS", "0"),
        ("RTSP_TRANSPORT", "sctp"),
        ("RTSP_CAPTURE_VIDEO", "sometimes"),
        ("RTSP_URL", "ftp://camera/stream"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(
            CaptureConfig::load().is_err(),
            "{}={} should be rejected",
            key,
            value
        );
    }

    clear_env();
}

#[test]
fn rejects_unknown_transport_in_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"stream": {"transport": "sctp"}}"#)
        .expect("write config");

    let err = CaptureConfig::load_from(Some(file.path())).unwrap_err();
    assert!(format!("{:#}", err).contains("sctp"), "unexpected error: {:#}", err);

    clear_env();
}
