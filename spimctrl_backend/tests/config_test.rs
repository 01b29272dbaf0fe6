use std::io::Write;
use std::path::PathBuf;

use spimcompiler_backend::*;
use spimctrl_backend::*;

const BASE: &str = r#"
channels = ["488"]

[device]
name = "Dev1"
output_task = "waveforms"

[timing]
sampling_frequency_hz = 10000.0
period_time_ms = 544.0
rest_time_ms = 150.0
trigger_port = "PFI0"

[clock]
counter = "ctr0"
frequency_hz = 1.4
output_port = "PFI0"
"#;

fn with_ports(ports: &str) -> String {
    format!("{BASE}\n{ports}")
}

const LASER: &str = r#"
[ports.laser]
line = "ao4"
waveform = "square_wave"
device_min_volts = 0.0
device_max_volts = 5.0

[ports.laser.channels.488]
start_time_ms = 15.0
end_time_ms = 549.0
max_volts = 5.0
min_volts = 0.0
"#;

#[test]
fn shipped_config_builds() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/acquisition.toml");
    let plan = AcquisitionConfig::from_file(path).unwrap().build().unwrap();
    let names: Vec<&str> = plan.registry.iter().map(|p| p.name()).collect();
    assert_eq!(names, vec!["etl", "galvo", "laser_488", "laser_561"]);
    assert_eq!(plan.timing.num_samples(), 6940);
    assert_eq!(plan.clock.output_port, plan.timing.trigger_port);
    assert!(plan.device.simulated);
    let buffer = plan.registry.compile("561", &plan.timing).unwrap();
    assert_eq!(buffer.dim(), (4, 6940));
}

#[test]
fn loads_from_file_with_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(with_ports(LASER).as_bytes()).unwrap();
    let config = AcquisitionConfig::from_file(file.path()).unwrap();
    assert_eq!(config.device.output_task, "waveforms");
    assert_eq!(config.device.clock_task, "co_task");
    assert_eq!(config.clock.duty_cycle, ClockSpec::DEFAULT_DUTY_CYCLE);

    let plan = config.build().unwrap();
    assert!(plan.timing.retriggerable);
    assert_eq!(plan.timing.trigger_polarity, TriggerPolarity::Rising);
    assert_eq!(plan.timing.trigger_port, PhysicalLine::Digital { port: 1, line: 0 });
    let laser = plan.registry.get("laser").unwrap();
    assert_eq!(laser.line(), PhysicalLine::AnalogOut(4));
    assert_eq!(
        laser.params("488").unwrap(),
        &ChannelParams::square_wave(15., 549., 5., 0.)
    );
}

#[test]
fn port_order_follows_the_file() {
    let ports = ["zeta", "alpha", "mid"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            format!(
                "[ports.{name}]\nline = \"ao{i}\"\nwaveform = \"square_wave\"\ndevice_min_volts = 0.0\ndevice_max_volts = 5.0\n\n[ports.{name}.channels.488]\nstart_time_ms = 0.0\nend_time_ms = 10.0\nmax_volts = 5.0\nmin_volts = 0.0\n\n"
            )
        })
        .collect::<String>();
    let plan = AcquisitionConfig::from_toml_str(&with_ports(&ports))
        .unwrap()
        .build()
        .unwrap();
    let names: Vec<&str> = plan.registry.iter().map(|p| p.name()).collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
}

#[test]
fn missing_file_reports_path() {
    match AcquisitionConfig::from_file("/nonexistent/acquisition.toml") {
        Err(ConfigError::Io { path, .. }) => assert_eq!(path, PathBuf::from("/nonexistent/acquisition.toml")),
        other => panic!("expected Io, got {:?}", other),
    }
}

#[test]
fn unknown_key_is_a_parse_error() {
    let text = with_ports(&LASER.replace("end_time_ms = 549.0\n", "end_time_ms = 549.0\nphase = 1.0\n"));
    assert!(matches!(
        AcquisitionConfig::from_toml_str(&text),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn missing_amplitude_is_pinpointed() {
    let etl = r#"
[ports.etl]
line = "ao0"
waveform = "sawtooth"
device_min_volts = 0.0
device_max_volts = 5.0

[ports.etl.channels.488]
start_time_ms = 15.0
end_time_ms = 549.0
offset_volts = 2.5
cutoff_frequency_hz = 200.0
"#;
    let config = AcquisitionConfig::from_toml_str(&with_ports(etl)).unwrap();
    match config.build() {
        Err(ConfigError::MissingParameter { port, channel, field }) => {
            assert_eq!(port, "etl");
            assert_eq!(channel, "488");
            assert_eq!(field, "amplitude_volts");
        }
        other => panic!("expected MissingParameter, got {:?}", other),
    }
}

#[test]
fn sawtooth_field_on_square_port() {
    let text = with_ports(&LASER.replace("end_time_ms = 549.0\n", "end_time_ms = 549.0\ncutoff_frequency_hz = 5.0\n"));
    let config = AcquisitionConfig::from_toml_str(&text).unwrap();
    assert!(matches!(
        config.build(),
        Err(ConfigError::UnknownParameter {
            field: "cutoff_frequency_hz",
            ..
        })
    ));
}

#[test]
fn model_errors_surface_as_invalid() {
    // The declared channel 561 has no parameters on the laser port
    let text = with_ports(LASER).replace(r#"channels = ["488"]"#, r#"channels = ["488", "561"]"#);
    let config = AcquisitionConfig::from_toml_str(&text).unwrap();
    assert!(matches!(
        config.build(),
        Err(ConfigError::Invalid(CompileError::ChannelMismatch { .. }))
    ));

    let text = with_ports(LASER).replace(r#"output_port = "PFI0""#, r#"output_port = "PFI3""#);
    let config = AcquisitionConfig::from_toml_str(&text).unwrap();
    assert!(matches!(
        config.build(),
        Err(ConfigError::Invalid(CompileError::InvalidTiming(_)))
    ));

    let text = with_ports(&LASER.replace("ao4", "ao4x"));
    let config = AcquisitionConfig::from_toml_str(&text).unwrap();
    assert!(matches!(
        config.build(),
        Err(ConfigError::Invalid(CompileError::InvalidLine { .. }))
    ));
}
