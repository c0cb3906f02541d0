//! End-to-end procedure runs on the simulated bench, writing real CSV files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use transport_daq::data::{CsvResultWriter, FanOut, MemorySink};
use transport_daq::hardware::registry::{DeviceHandles, DeviceRegistry};
use transport_daq::hardware::simulated::{SimulatedFieldSupply, SimulatedSample, SimulatedSourceMeter};
use transport_daq::procedures::{
    execute_procedure_safely, EmergencyStopFlag, ProcedureConfig, ProcedureContext,
    ProcedureRegistry, ProcedureState,
};

struct Bench {
    registry: Arc<RwLock<DeviceRegistry>>,
    smu: Arc<SimulatedSourceMeter>,
    gate: Arc<SimulatedSourceMeter>,
    coil: Arc<SimulatedFieldSupply>,
}

fn bench() -> Bench {
    let sample = Arc::new(SimulatedSample::default());
    let smu = Arc::new(SimulatedSourceMeter::new(sample.clone()));
    let gate = Arc::new(SimulatedSourceMeter::new(sample.clone()));
    let coil = Arc::new(SimulatedFieldSupply::new(sample.clone()));

    let mut registry = DeviceRegistry::with_sample(sample);
    registry
        .insert("hall_smu", "Sim 2400", "simulated_source_meter", DeviceHandles::source_meter(smu.clone()))
        .unwrap();
    registry
        .insert("gate_psu", "Sim 2200", "simulated_source_meter", DeviceHandles::source_meter(gate.clone()))
        .unwrap();
    registry
        .insert("kepco", "Sim BOP", "simulated_field_supply", DeviceHandles::current_supply(coil.clone()))
        .unwrap();

    Bench {
        registry: Arc::new(RwLock::new(registry)),
        smu,
        gate,
        coil,
    }
}

fn procedure_file(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("config/procedures")
        .join(name)
}

fn only_csv(dir: &Path) -> String {
    let files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "csv"))
        .collect();
    assert_eq!(files.len(), 1, "{:?}", files);
    std::fs::read_to_string(&files[0]).unwrap()
}

fn data_lines(csv: &str) -> Vec<&str> {
    csv.lines().filter(|l| !l.starts_with('#')).skip(1).collect()
}

#[tokio::test(start_paused = true)]
async fn gate_sweep_writes_csv_with_preamble() {
    let bench = bench();
    let out = tempfile::tempdir().unwrap();
    let config = ProcedureConfig::from_file(&procedure_file("gate_sweep.toml"))
        .unwrap()
        .with_param("delay_ms", 1i32)
        .with_param("dwell_time_s", 3i32);

    let procedures = ProcedureRegistry::new(bench.registry.clone());
    let mut procedure = procedures.create_from_config(&config).unwrap();
    let expected_rows: usize = procedure.preview().iter().map(|l| l.values.len()).sum();

    let sink = FanOut::new().with(CsvResultWriter::new(out.path().join("runs"), "B3"));
    let (ctx, progress) = ProcedureContext::new(
        "gate-run",
        config.get_assignments(),
        bench.registry.clone(),
        Box::new(sink),
    );

    let result = execute_procedure_safely(procedure.as_mut(), ctx, EmergencyStopFlag::new())
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.rows, expected_rows);
    assert_eq!(progress.borrow().overall_progress, 100.0);

    let csv = only_csv(&out.path().join("runs"));
    assert!(csv.starts_with("#Procedure: gate_sweep\n#Parameters:\n"));
    assert!(csv.contains("#\tmax_voltage_mv: 2000 mV\n"));
    assert!(csv.contains("#\tdwell_time_s: 3 s\n"));
    assert!(csv.contains("#Data:\nVoltage (V),Current (A),Resistance (ohm)\n"));

    let rows = data_lines(&csv);
    assert_eq!(rows.len(), expected_rows);
    // The channel carries no current at 0 V.
    assert!(rows.iter().any(|r| r.starts_with("0,0,nan")));

    assert!(!bench.gate.is_output_enabled());
    assert_eq!(bench.gate.level(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn gate_then_hall_shares_one_file() {
    let bench = bench();
    let out = tempfile::tempdir().unwrap();
    let config = ProcedureConfig::from_file(&procedure_file("gate_then_hall.toml"))
        .unwrap()
        .with_param("voltage_step_mv", 500i32)
        .with_param("dwell_time_s", 1i32)
        .with_param("field_current_a", 2.0f64)
        .with_param("field_step_a", 0.5f64);

    let procedures = ProcedureRegistry::new(bench.registry.clone());
    let mut procedure = procedures.create_from_config(&config).unwrap();
    let (ctx, _progress) = ProcedureContext::new(
        "combined",
        config.get_assignments(),
        bench.registry.clone(),
        Box::new(CsvResultWriter::new(out.path(), "gate_then_hall")),
    );

    let result = execute_procedure_safely(procedure.as_mut(), ctx, EmergencyStopFlag::new())
        .await
        .unwrap();
    assert!(result.is_success());

    let csv = only_csv(out.path());
    assert!(csv.contains(
        "Voltage (V),Current (A),Resistance (ohm),FieldCurrent (A),Hall Voltage (V)\n"
    ));
    let rows = data_lines(&csv);
    let gate_rows = rows.iter().filter(|r| r.ends_with(",,")).count();
    let hall_rows = rows.iter().filter(|r| r.starts_with(",,,")).count();
    assert_eq!(gate_rows + hall_rows, rows.len());
    assert_eq!(hall_rows, 21);
    assert!(gate_rows > 0);

    for output_enabled in [
        bench.gate.is_output_enabled(),
        bench.smu.is_output_enabled(),
        bench.coil.is_output_enabled(),
    ] {
        assert!(!output_enabled);
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_hall_loop_leaves_sources_off() {
    let bench = bench();
    let config = ProcedureConfig::from_file(&procedure_file("hall_sweep.toml"))
        .unwrap()
        .with_param("waiting_time_s", 1.0f64);

    let procedures = ProcedureRegistry::new(bench.registry.clone());
    let mut procedure = procedures.create_from_config(&config).unwrap();
    let sink = MemorySink::new();
    let (ctx, _progress) = ProcedureContext::new(
        "cancel",
        config.get_assignments(),
        bench.registry.clone(),
        Box::new(sink.clone()),
    );
    let handle = ctx.cancel_handle();

    let run = tokio::spawn(async move {
        let result =
            execute_procedure_safely(procedure.as_mut(), ctx, EmergencyStopFlag::new()).await;
        (result, procedure.state())
    });
    tokio::time::sleep(Duration::from_secs(30)).await;
    handle.cancel();

    let (result, state) = run.await.unwrap();
    let result = result.unwrap();
    assert!(result.is_cancelled());
    assert_eq!(state, ProcedureState::Cancelled);

    let recorded = sink.snapshot();
    assert!(recorded.rows.len() < 201);
    assert!(recorded.progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(recorded.finished, 1);

    assert_eq!(bench.coil.level(), 0.0);
    assert!(!bench.coil.is_output_enabled());
    assert!(!bench.smu.is_output_enabled());
    assert_eq!(bench.coil.beep_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unconnected_role_fails_before_output() {
    let bench = bench();
    let out = tempfile::tempdir().unwrap();
    let config = ProcedureConfig::from_file(&procedure_file("field_hold.toml"))
        .unwrap()
        .with_role("field_supply", "second_kepco");

    let procedures = ProcedureRegistry::new(bench.registry.clone());
    let mut procedure = procedures.create_from_config(&config).unwrap();
    let (ctx, _progress) = ProcedureContext::new(
        "missing",
        config.get_assignments(),
        bench.registry.clone(),
        Box::new(CsvResultWriter::new(out.path(), "field_hold")),
    );

    let err = execute_procedure_safely(procedure.as_mut(), ctx, EmergencyStopFlag::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("second_kepco"));
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    assert!(bench.coil.setpoints().is_empty());
}
