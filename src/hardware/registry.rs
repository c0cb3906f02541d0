//! Device Registry for Runtime Hardware Management
//!
//! Central hub that turns instrument definitions from the configuration file
//! into connected drivers and hands them out by capability:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      DeviceRegistry                             │
//! │   gate_smu (2400)   gate_psu (2200)   coil (Kepco BOP)   ...    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Capability Traits                            │
//! │  OutputControl | VoltageSource | CurrentSource | *Meter         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Drivers over ScpiTransport                   │
//! │  Keithley24xx | Keithley2200 | KepcoBop | Simulated*            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use transport_daq::hardware::registry::{DeviceRegistry, DeviceConfig, DriverType};
//!
//! let mut registry = DeviceRegistry::new();
//! registry.register(DeviceConfig {
//!     id: "coil".into(),
//!     name: "Kepco BOP 36-12".into(),
//!     driver: DriverType::SimulatedFieldSupply { max_current_a: None },
//! }).await?;
//!
//! let coil = registry.get_current_source("coil").unwrap();
//! coil.set_current(1.0).await?;
//! ```

use crate::hardware::capabilities::{
    CurrentMeter, CurrentSource, OutputControl, VoltageMeter, VoltageSource,
};
use crate::hardware::keithley2200::Keithley2200;
use crate::hardware::keithley24xx::{Keithley24xx, Keithley24xxConfig};
use crate::hardware::kepco_bop::{KepcoBop, KepcoBopConfig};
use crate::hardware::simulated::{SimulatedFieldSupply, SimulatedSample, SimulatedSourceMeter};
use crate::hardware::transport::{self, TransportConfig};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Device Identification
// =============================================================================

/// Unique identifier for a registered device (e.g. "gate_smu", "coil")
pub type DeviceId = String;

/// Capabilities a device can have (for introspection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Output can be switched on and off
    OutputControl,
    /// Forces a voltage
    VoltageSource,
    /// Forces a current
    CurrentSource,
    /// Measures voltage
    VoltageMeter,
    /// Measures current
    CurrentMeter,
}

// =============================================================================
// Driver Types (Configuration)
// =============================================================================

/// Driver configuration for instantiating hardware
///
/// Each variant corresponds to a driver with its required configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverType {
    /// Keithley 2400-series SourceMeter
    Keithley24xx {
        /// Bus address
        transport: TransportConfig,
        /// Sense, terminals, integration time
        #[serde(default)]
        settings: Keithley24xxConfig,
    },

    /// Keithley 2200-series DC supply
    Keithley2200 {
        /// Bus address
        transport: TransportConfig,
    },

    /// Kepco BOP coil supply in current mode
    KepcoBop {
        /// Bus address
        transport: TransportConfig,
        /// Voltage compliance and current limit
        #[serde(default)]
        settings: KepcoBopConfig,
    },

    /// Simulated SMU on the shared sample (always available)
    SimulatedSourceMeter,

    /// Simulated coil supply on the shared sample (always available)
    SimulatedFieldSupply {
        /// Coil-current limit (defaults to the Kepco limit)
        #[serde(default)]
        max_current_a: Option<f64>,
    },
}

impl DriverType {
    /// Get the capabilities this driver type provides
    pub fn capabilities(&self) -> Vec<Capability> {
        use Capability::*;
        match self {
            DriverType::Keithley24xx { .. } | DriverType::SimulatedSourceMeter => vec![
                OutputControl,
                VoltageSource,
                CurrentSource,
                VoltageMeter,
                CurrentMeter,
            ],
            DriverType::Keithley2200 { .. } => {
                vec![OutputControl, VoltageSource, VoltageMeter, CurrentMeter]
            }
            DriverType::KepcoBop { .. } | DriverType::SimulatedFieldSupply { .. } => {
                vec![OutputControl, CurrentSource, CurrentMeter]
            }
        }
    }

    /// Get human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::Keithley24xx { .. } => "keithley24xx",
            DriverType::Keithley2200 { .. } => "keithley2200",
            DriverType::KepcoBop { .. } => "kepco_bop",
            DriverType::SimulatedSourceMeter => "simulated_source_meter",
            DriverType::SimulatedFieldSupply { .. } => "simulated_field_supply",
        }
    }

    /// Simulated stand-in with the same role in a measurement.
    pub fn simulated(&self) -> DriverType {
        match self {
            DriverType::Keithley24xx { .. }
            | DriverType::Keithley2200 { .. }
            | DriverType::SimulatedSourceMeter => DriverType::SimulatedSourceMeter,
            DriverType::KepcoBop { settings, .. } => DriverType::SimulatedFieldSupply {
                max_current_a: Some(settings.max_current_a),
            },
            DriverType::SimulatedFieldSupply { max_current_a } => {
                DriverType::SimulatedFieldSupply {
                    max_current_a: *max_current_a,
                }
            }
        }
    }

    /// Bus endpoint, if the driver talks to real hardware.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            DriverType::Keithley24xx { transport, .. }
            | DriverType::Keithley2200 { transport }
            | DriverType::KepcoBop { transport, .. } => Some(transport.endpoint()),
            _ => None,
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for registering a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier (e.g., "gate_smu", "coil")
    pub id: DeviceId,
    /// Human-readable name (e.g., "Keithley 2450")
    pub name: String,
    /// Driver type and configuration
    pub driver: DriverType,
}

/// Information about a registered device (returned by list operations)
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Unique identifier
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type name (e.g., "keithley24xx")
    pub driver_type: String,
    /// Capabilities this device supports
    pub capabilities: Vec<Capability>,
}

// =============================================================================
// Capability Handles
// =============================================================================

/// Trait objects through which a device is reached.
///
/// A driver fills in one handle per capability it implements; all handles of
/// one device point at the same instance.
#[derive(Clone, Default)]
pub struct DeviceHandles {
    output: Option<Arc<dyn OutputControl>>,
    voltage_source: Option<Arc<dyn VoltageSource>>,
    current_source: Option<Arc<dyn CurrentSource>>,
    voltage_meter: Option<Arc<dyn VoltageMeter>>,
    current_meter: Option<Arc<dyn CurrentMeter>>,
}

impl DeviceHandles {
    /// SMU: sources and measures both quantities.
    pub fn source_meter<T>(device: Arc<T>) -> Self
    where
        T: VoltageSource + CurrentSource + VoltageMeter + CurrentMeter + 'static,
    {
        Self {
            output: Some(device.clone()),
            voltage_source: Some(device.clone()),
            current_source: Some(device.clone()),
            voltage_meter: Some(device.clone()),
            current_meter: Some(device),
        }
    }

    /// Voltage supply with readback.
    pub fn voltage_supply<T>(device: Arc<T>) -> Self
    where
        T: VoltageSource + VoltageMeter + CurrentMeter + 'static,
    {
        Self {
            output: Some(device.clone()),
            voltage_source: Some(device.clone()),
            current_source: None,
            voltage_meter: Some(device.clone()),
            current_meter: Some(device),
        }
    }

    /// Current supply with current readback.
    pub fn current_supply<T>(device: Arc<T>) -> Self
    where
        T: CurrentSource + CurrentMeter + 'static,
    {
        Self {
            output: Some(device.clone()),
            voltage_source: None,
            current_source: Some(device.clone()),
            voltage_meter: None,
            current_meter: Some(device),
        }
    }

    /// Capabilities covered by these handles.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.output.is_some() {
            caps.push(Capability::OutputControl);
        }
        if self.voltage_source.is_some() {
            caps.push(Capability::VoltageSource);
        }
        if self.current_source.is_some() {
            caps.push(Capability::CurrentSource);
        }
        if self.voltage_meter.is_some() {
            caps.push(Capability::VoltageMeter);
        }
        if self.current_meter.is_some() {
            caps.push(Capability::CurrentMeter);
        }
        caps
    }
}

/// A registered device with its driver instance and metadata
struct RegisteredDevice {
    id: DeviceId,
    name: String,
    driver_type: String,
    handles: DeviceHandles,
}

// =============================================================================
// Device Registry
// =============================================================================

/// Central registry for hardware device management
pub struct DeviceRegistry {
    /// Registered devices by ID
    devices: HashMap<DeviceId, RegisteredDevice>,
    /// Sample shared by every simulated device
    sample: Arc<SimulatedSample>,
}

impl DeviceRegistry {
    /// Create a new empty device registry
    pub fn new() -> Self {
        Self::with_sample(Arc::new(SimulatedSample::default()))
    }

    /// Empty registry whose simulated devices act on `sample`.
    pub fn with_sample(sample: Arc<SimulatedSample>) -> Self {
        Self {
            devices: HashMap::new(),
            sample,
        }
    }

    /// Connect every enabled definition.
    ///
    /// A device that fails to connect is logged and left out; procedures
    /// needing it then fail validation for the missing role. With
    /// `simulate` set, every driver is replaced by its simulated stand-in.
    pub async fn from_definitions(definitions: &[DeviceConfig], simulate: bool) -> Self {
        let mut registry = Self::new();
        for def in definitions {
            let mut config = def.clone();
            if simulate {
                config.driver = config.driver.simulated();
            }
            let id = config.id.clone();
            let endpoint = def.driver.endpoint().unwrap_or("-").to_string();
            match registry.register(config).await {
                Ok(()) => info!(device = %id, endpoint = %endpoint, "Device registered"),
                Err(e) => warn!(
                    device = %id,
                    endpoint = %endpoint,
                    "Device unavailable, continuing without it: {:#}",
                    e
                ),
            }
        }
        registry
    }

    /// Register a device from configuration
    ///
    /// This opens the transport, initializes the driver and registers it.
    ///
    /// # Errors
    /// Returns error if:
    /// - Device ID is already registered
    /// - The transport cannot be opened or the driver fails to initialize
    pub async fn register(&mut self, config: DeviceConfig) -> Result<()> {
        if self.devices.contains_key(&config.id) {
            return Err(anyhow!("Device '{}' is already registered", config.id));
        }
        let handles = self.instantiate(&config.driver).await?;
        self.devices.insert(
            config.id.clone(),
            RegisteredDevice {
                id: config.id,
                name: config.name,
                driver_type: config.driver.driver_name().to_string(),
                handles,
            },
        );
        Ok(())
    }

    /// Register an already constructed driver.
    pub fn insert(
        &mut self,
        id: &str,
        name: &str,
        driver_type: &str,
        handles: DeviceHandles,
    ) -> Result<()> {
        if self.devices.contains_key(id) {
            return Err(anyhow!("Device '{}' is already registered", id));
        }
        self.devices.insert(
            id.to_string(),
            RegisteredDevice {
                id: id.to_string(),
                name: name.to_string(),
                driver_type: driver_type.to_string(),
                handles,
            },
        );
        Ok(())
    }

    /// List all registered devices, sorted by ID
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut list: Vec<DeviceInfo> = self.devices.values().map(Self::info).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn info(d: &RegisteredDevice) -> DeviceInfo {
        DeviceInfo {
            id: d.id.clone(),
            name: d.name.clone(),
            driver_type: d.driver_type.clone(),
            capabilities: d.handles.capabilities(),
        }
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Whether device `id` supports `capability`.
    pub fn has_capability(&self, id: &str, capability: Capability) -> bool {
        self.devices
            .get(id)
            .map(|d| d.handles.capabilities().contains(&capability))
            .unwrap_or(false)
    }

    /// Sample shared by simulated devices.
    pub fn sample(&self) -> Arc<SimulatedSample> {
        Arc::clone(&self.sample)
    }

    // =========================================================================
    // Capability Access
    // =========================================================================

    /// Get a device's output switch
    pub fn get_output(&self, id: &str) -> Option<Arc<dyn OutputControl>> {
        self.devices.get(id).and_then(|d| d.handles.output.clone())
    }

    /// Get a device as VoltageSource (if it supports this capability)
    pub fn get_voltage_source(&self, id: &str) -> Option<Arc<dyn VoltageSource>> {
        self.devices
            .get(id)
            .and_then(|d| d.handles.voltage_source.clone())
    }

    /// Get a device as CurrentSource (if it supports this capability)
    pub fn get_current_source(&self, id: &str) -> Option<Arc<dyn CurrentSource>> {
        self.devices
            .get(id)
            .and_then(|d| d.handles.current_source.clone())
    }

    /// Get a device as VoltageMeter (if it supports this capability)
    pub fn get_voltage_meter(&self, id: &str) -> Option<Arc<dyn VoltageMeter>> {
        self.devices
            .get(id)
            .and_then(|d| d.handles.voltage_meter.clone())
    }

    /// Get a device as CurrentMeter (if it supports this capability)
    pub fn get_current_meter(&self, id: &str) -> Option<Arc<dyn CurrentMeter>> {
        self.devices
            .get(id)
            .and_then(|d| d.handles.current_meter.clone())
    }

    /// Zero and disable every output. Errors are logged, not returned.
    pub async fn shutdown_all(&self) {
        for device in self.devices.values() {
            if let Some(output) = &device.handles.output {
                if let Err(e) = output.shutdown().await {
                    warn!(device = %device.id, "Shutdown failed: {:#}", e);
                }
            }
        }
    }

    // =========================================================================
    // Device Instantiation (Private)
    // =========================================================================

    async fn instantiate(&self, driver: &DriverType) -> Result<DeviceHandles> {
        match driver {
            DriverType::Keithley24xx {
                transport,
                settings,
            } => {
                let bus = transport::open(transport).await?;
                let smu = Arc::new(Keithley24xx::new(bus, settings.clone()));
                log_identity(smu.identify().await, transport);
                smu.initialize().await?;
                Ok(DeviceHandles::source_meter(smu))
            }
            DriverType::Keithley2200 { transport } => {
                let bus = transport::open(transport).await?;
                let psu = Arc::new(Keithley2200::new(bus));
                log_identity(psu.identify().await, transport);
                psu.initialize().await?;
                Ok(DeviceHandles::voltage_supply(psu))
            }
            DriverType::KepcoBop {
                transport,
                settings,
            } => {
                let bus = transport::open(transport).await?;
                let bop = Arc::new(KepcoBop::new(bus, settings.clone()));
                log_identity(bop.identify().await, transport);
                bop.initialize().await?;
                Ok(DeviceHandles::current_supply(bop))
            }
            DriverType::SimulatedSourceMeter => Ok(DeviceHandles::source_meter(Arc::new(
                SimulatedSourceMeter::new(self.sample()),
            ))),
            DriverType::SimulatedFieldSupply { max_current_a } => {
                let mut coil = SimulatedFieldSupply::new(self.sample());
                if let Some(limit) = max_current_a {
                    coil = coil.with_max_current(*limit);
                }
                Ok(DeviceHandles::current_supply(Arc::new(coil)))
            }
        }
    }
}

fn log_identity(identity: Result<crate::hardware::scpi::Identity>, transport: &TransportConfig) {
    match identity {
        Ok(id) => info!("{} answers as {}", transport.endpoint(), id),
        Err(e) => warn!("{} did not identify: {:#}", transport.endpoint(), e),
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with one simulated SMU (`smu`), one simulated gate supply
/// (`gate`) and one simulated coil supply (`coil`) on a shared sample.
pub async fn create_simulated_registry() -> Result<DeviceRegistry> {
    let mut registry = DeviceRegistry::new();
    for (id, name, driver) in [
        ("smu", "Simulated SourceMeter", DriverType::SimulatedSourceMeter),
        ("gate", "Simulated Gate Supply", DriverType::SimulatedSourceMeter),
        (
            "coil",
            "Simulated Coil Supply",
            DriverType::SimulatedFieldSupply {
                max_current_a: None,
            },
        ),
    ] {
        registry
            .register(DeviceConfig {
                id: id.into(),
                name: name.into(),
                driver,
            })
            .await?;
    }
    Ok(registry)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_simulated_devices() {
        let registry = create_simulated_registry().await.unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("smu"));
        assert!(registry.contains("coil"));
    }

    #[tokio::test]
    async fn test_list_devices_sorted() {
        let registry = create_simulated_registry().await.unwrap();
        let devices = registry.list_devices();
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["coil", "gate", "smu"]);

        let coil = &devices[0];
        assert_eq!(coil.driver_type, "simulated_field_supply");
        assert!(coil.capabilities.contains(&Capability::CurrentSource));
        assert!(!coil.capabilities.contains(&Capability::VoltageSource));
    }

    #[tokio::test]
    async fn test_capability_lookup() {
        let registry = create_simulated_registry().await.unwrap();
        assert!(registry.get_voltage_source("smu").is_some());
        assert!(registry.get_voltage_source("coil").is_none());
        assert!(registry.get_current_meter("coil").is_some());
        assert!(registry.has_capability("smu", Capability::VoltageMeter));
        assert!(!registry.has_capability("missing", Capability::VoltageMeter));
        assert!(registry.has_capability("gate", Capability::VoltageSource));
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let mut registry = DeviceRegistry::new();
        let cfg = DeviceConfig {
            id: "smu".into(),
            name: "SMU".into(),
            driver: DriverType::SimulatedSourceMeter,
        };
        registry.register(cfg.clone()).await.unwrap();
        assert!(registry.register(cfg).await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_device_is_skipped() {
        let defs = vec![
            DeviceConfig {
                id: "coil".into(),
                name: "Kepco".into(),
                driver: DriverType::KepcoBop {
                    transport: TransportConfig::Tcp {
                        // Port 9 on localhost: connection refused
                        address: "127.0.0.1:9".into(),
                        timeout_ms: 200,
                    },
                    settings: KepcoBopConfig::default(),
                },
            },
            DeviceConfig {
                id: "smu".into(),
                name: "SMU".into(),
                driver: DriverType::SimulatedSourceMeter,
            },
        ];
        let registry = DeviceRegistry::from_definitions(&defs, false).await;
        assert!(!registry.contains("coil"));
        assert!(registry.contains("smu"));
    }

    #[tokio::test]
    async fn test_simulate_replaces_real_drivers() {
        let defs = vec![DeviceConfig {
            id: "coil".into(),
            name: "Kepco".into(),
            driver: DriverType::KepcoBop {
                transport: TransportConfig::Visa {
                    resource: "GPIB0::4::INSTR".into(),
                    timeout_ms: 1000,
                },
                settings: KepcoBopConfig::default(),
            },
        }];
        let registry = DeviceRegistry::from_definitions(&defs, true).await;
        let info = registry.list_devices().remove(0);
        assert_eq!(info.driver_type, "simulated_field_supply");
        let coil = registry.get_current_source("coil").unwrap();
        assert!(coil.set_current(29.5).await.is_err());
    }

    #[test]
    fn test_driver_from_toml() {
        let driver: DriverType = toml::from_str(
            r#"
            type = "keithley24xx"
            [transport]
            kind = "visa"
            resource = "GPIB0::24::INSTR"
            [settings]
            four_wire = true
            "#,
        )
        .unwrap();
        match &driver {
            DriverType::Keithley24xx { settings, .. } => {
                assert!(settings.four_wire);
                assert_eq!(settings.nplc, 1.0);
            }
            other => panic!("unexpected driver {:?}", other),
        }
        assert_eq!(driver.endpoint(), Some("GPIB0::24::INSTR"));
    }

    #[tokio::test]
    async fn test_shutdown_all_zeroes_simulated_outputs() {
        let mut registry = DeviceRegistry::new();
        let smu = Arc::new(SimulatedSourceMeter::new(registry.sample()));
        registry
            .insert("smu", "SMU", "simulated_source_meter", DeviceHandles::source_meter(smu.clone()))
            .unwrap();
        smu.enable_output().await.unwrap();
        smu.set_voltage(1.0).await.unwrap();
        registry.shutdown_all().await;
        assert!(!smu.is_output_enabled());
        assert_eq!(smu.level(), 0.0);
    }
}
