//! The configuration files shipped in `config/` load, validate and run
//! against simulated instruments.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use transport_daq::config::AppConfig;
use transport_daq::data::MemorySink;
use transport_daq::hardware::registry::{Capability, DeviceRegistry, DriverType};
use transport_daq::procedures::{
    execute_procedure_safely, run_sequence, CancelHandle, EmergencyStopFlag, ProcedureConfig,
    ProcedureContext, ProcedureRegistry, SequenceConfig,
};

fn config_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config")
}

fn procedure_files() -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(config_dir().join("procedures"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "toml"))
        .filter(|p| ProcedureConfig::from_file(p).is_ok())
        .collect();
    files.sort();
    files
}

async fn simulated_bench(config: &AppConfig) -> Arc<RwLock<DeviceRegistry>> {
    Arc::new(RwLock::new(
        DeviceRegistry::from_definitions(&config.device_configs(), true).await,
    ))
}

#[test]
fn application_config_validates() {
    let config = AppConfig::load_from(config_dir().join("transport_daq.toml")).unwrap();
    config.validate().unwrap();

    let ids: Vec<_> = config.instruments.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, ["gate_psu", "hall_smu", "kepco"]);
    assert!(matches!(
        config.instruments[1].driver,
        DriverType::Keithley24xx { ref settings, .. } if settings.four_wire
    ));
    assert!(matches!(
        config.instruments[2].driver,
        DriverType::KepcoBop { ref settings, .. } if settings.max_current_a == 29.0
    ));
}

#[test]
fn every_procedure_file_configures() {
    let procedures = ProcedureRegistry::new(Arc::new(RwLock::new(DeviceRegistry::new())));
    let files = procedure_files();
    assert_eq!(files.len(), 4);

    for path in files {
        let config = ProcedureConfig::from_file(&path).unwrap();
        let procedure = procedures
            .create_from_config(&config)
            .unwrap_or_else(|e| panic!("{}: {:#}", path.display(), e));
        assert!(procedure.estimate().unwrap().duration > Duration::ZERO, "{}", path.display());
        assert!(!procedure.preview().is_empty());
    }
}

#[tokio::test]
async fn simulate_flag_replaces_every_instrument() {
    let config = AppConfig::load_from(config_dir().join("transport_daq.toml")).unwrap();
    let devices = simulated_bench(&config).await;
    let registry = devices.read().await;

    assert_eq!(registry.len(), 3);
    for info in registry.list_devices() {
        assert!(info.driver_type.starts_with("simulated"), "{:?}", info);
    }
    assert!(registry.has_capability("kepco", Capability::CurrentMeter));
    assert!(registry.has_capability("gate_psu", Capability::VoltageSource));
}

#[tokio::test(start_paused = true)]
async fn field_hold_runs_on_simulated_config() {
    let config = AppConfig::load_from(config_dir().join("transport_daq.toml")).unwrap();
    let devices = simulated_bench(&config).await;
    let procedure_config =
        ProcedureConfig::from_file(&config_dir().join("procedures/field_hold.toml"))
            .unwrap()
            .with_param("duration_s", 4i32);

    let procedures = ProcedureRegistry::new(devices.clone());
    let mut procedure = procedures.create_from_config(&procedure_config).unwrap();
    let sink = MemorySink::new();
    let (ctx, _progress) = ProcedureContext::new(
        "hold",
        procedure_config.get_assignments(),
        devices.clone(),
        Box::new(sink.clone()),
    );

    let result = execute_procedure_safely(procedure.as_mut(), ctx, EmergencyStopFlag::new())
        .await
        .unwrap();
    assert!(result.is_success());
    let rows = sink.snapshot().rows;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].get("FieldCurrent (A)"), Some(5.0));
}

#[tokio::test(start_paused = true)]
async fn dwell_series_sequence_runs_each_step() {
    let config = AppConfig::load_from(config_dir().join("transport_daq.toml")).unwrap();
    let devices = simulated_bench(&config).await;
    let sequence = SequenceConfig::from_file(&config_dir().join("procedures/dwell_series.toml"))
        .unwrap();
    assert_eq!(sequence.name, "Dwell series");
    assert_eq!(sequence.steps.len(), 3);

    let procedures = ProcedureRegistry::new(devices);
    let mut sinks = Vec::new();
    let report = run_sequence(
        &sequence,
        &procedures,
        CancelHandle::new(),
        EmergencyStopFlag::new(),
        |step, procedure| {
            assert_eq!(procedure.procedure_type, "gate_sweep");
            let sink = MemorySink::new();
            sinks.push((step, sink.clone()));
            Ok(Box::new(sink))
        },
    )
    .await
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.results.len(), 3);
    assert_eq!(sinks.iter().map(|(s, _)| *s).collect::<Vec<_>>(), [1, 2, 3]);

    // Dwell rows grow with the step's dwell_time_s: 11, 61 and 301 samples.
    let rows: Vec<usize> = sinks.iter().map(|(_, s)| s.snapshot().rows.len()).collect();
    assert_eq!(rows[1] - rows[0], 50);
    assert_eq!(rows[2] - rows[1], 240);
    assert_eq!(
        sinks[2].1.snapshot().headers[0].procedure,
        "gate_sweep"
    );
}
