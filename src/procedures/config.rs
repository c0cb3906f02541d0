//! Procedure Configuration
//!
//! A procedure run is described by a small TOML file:
//!
//! ```toml
//! [procedure]
//! type = "gate_sweep"
//! name = "Gate sweep, sample B3"
//!
//! [params]
//! max_voltage_mv = 2000
//! min_voltage_mv = -2000
//! voltage_step_mv = 20
//!
//! [roles.source]
//! device_id = "gate_psu"
//!
//! [roles.meter]
//! device_id = "gate_psu"
//! ```
//!
//! Parameters not given fall back to the defaults declared by the procedure
//! type. Runtime overrides (`--set params.dwell_time_s=10` on the command
//! line, or the steps of a sequence file) are applied on top.

use super::ProcedureTypeInfo;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

// =============================================================================
// ConfigValue
// =============================================================================

/// A parameter value as written in TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Float value
    Float(f64),
    /// String value
    String(String),
    /// Array of values
    Array(Vec<ConfigValue>),
}

impl ConfigValue {
    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get as float (integers are widened)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Parse a command-line literal: `true`, `42`, `0.5`, anything else is a string.
    pub fn parse_literal(text: &str) -> Self {
        let text = text.trim();
        if let Ok(b) = text.parse::<bool>() {
            ConfigValue::Bool(b)
        } else if let Ok(i) = text.parse::<i64>() {
            ConfigValue::Integer(i)
        } else if let Ok(f) = text.parse::<f64>() {
            ConfigValue::Float(f)
        } else {
            ConfigValue::String(text.trim_matches('"').to_string())
        }
    }

    pub(crate) fn from_toml(value: toml::Value) -> Result<Self> {
        Ok(match value {
            toml::Value::Boolean(v) => ConfigValue::Bool(v),
            toml::Value::Integer(v) => ConfigValue::Integer(v),
            toml::Value::Float(v) => ConfigValue::Float(v),
            toml::Value::String(v) => ConfigValue::String(v),
            toml::Value::Array(arr) => ConfigValue::Array(
                arr.into_iter()
                    .map(ConfigValue::from_toml)
                    .collect::<Result<_>>()?,
            ),
            toml::Value::Datetime(dt) => ConfigValue::String(dt.to_string()),
            toml::Value::Table(_) => bail!("Nested tables are not valid parameter values"),
        })
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{}", v),
            ConfigValue::Integer(v) => write!(f, "{}", v),
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::String(v) => write!(f, "{}", v),
            ConfigValue::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Integer(v)
    }
}

impl From<i32> for ConfigValue {
    fn from(v: i32) -> Self {
        ConfigValue::Integer(v as i64)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::String(v)
    }
}

// =============================================================================
// ProcedureConfig
// =============================================================================

/// Device role assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Device ID from the instrument list
    pub device_id: String,
}

/// Runtime configuration override
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    /// Dot-separated path (`params.dwell_time_s`, `roles.meter`, or a bare parameter name)
    pub path: String,
    /// New value
    pub value: ConfigValue,
}

impl ConfigOverride {
    /// Parse `path=value`.
    pub fn parse(text: &str) -> Result<Self> {
        let (path, value) = text
            .split_once('=')
            .ok_or_else(|| anyhow!("Override '{}' is not of the form path=value", text))?;
        let path = path.trim();
        if path.is_empty() {
            bail!("Override '{}' has an empty path", text);
        }
        Ok(Self {
            path: path.to_string(),
            value: ConfigValue::parse_literal(value),
        })
    }
}

/// Complete configuration for one procedure run
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureConfig {
    /// Procedure type identifier (e.g. "gate_sweep")
    pub procedure_type: String,
    /// Instance name (human-readable)
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Parameters given explicitly
    pub params: HashMap<String, ConfigValue>,
    /// Device role assignments
    pub roles: HashMap<String, RoleAssignment>,
    /// Overrides applied so far, in order
    pub overrides: Vec<ConfigOverride>,
}

#[derive(Debug, Deserialize)]
struct RawProcedureConfig {
    procedure: ProcedureSection,
    #[serde(default)]
    params: HashMap<String, toml::Value>,
    #[serde(default)]
    roles: HashMap<String, RoleAssignment>,
}

#[derive(Debug, Deserialize)]
struct ProcedureSection {
    #[serde(rename = "type")]
    procedure_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
}

impl ProcedureConfig {
    /// Empty configuration for a procedure type
    pub fn new(procedure_type: impl Into<String>) -> Self {
        Self {
            procedure_type: procedure_type.into(),
            name: String::new(),
            description: None,
            params: HashMap::new(),
            roles: HashMap::new(),
            overrides: Vec::new(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read procedure file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid procedure file {}", path.display()))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawProcedureConfig =
            toml::from_str(content).map_err(|e| anyhow!("Failed to parse procedure: {}", e))?;

        let params = raw
            .params
            .into_iter()
            .map(|(k, v)| {
                ConfigValue::from_toml(v)
                    .with_context(|| format!("Parameter '{}'", k))
                    .map(|v| (k, v))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            procedure_type: raw.procedure.procedure_type,
            name: raw.procedure.name,
            description: raw.procedure.description,
            params,
            roles: raw.roles,
            overrides: Vec::new(),
        })
    }

    /// Required numeric parameter, falling back to `default`.
    ///
    /// A value of the wrong type is an error rather than silently defaulted.
    pub fn f64_or(&self, name: &str, default: f64) -> Result<f64> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v
                .as_f64()
                .ok_or_else(|| anyhow!("Parameter '{}' must be a number, got '{}'", name, v)),
        }
    }

    /// Boolean parameter, falling back to `default`.
    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| anyhow!("Parameter '{}' must be true or false, got '{}'", name, v)),
        }
    }

    /// Assign a device to a role
    pub fn assign_role(&mut self, role_id: impl Into<String>, device_id: impl Into<String>) {
        self.roles.insert(
            role_id.into(),
            RoleAssignment {
                device_id: device_id.into(),
            },
        );
    }

    /// Get device ID for a role
    pub fn get_role_device(&self, role_id: &str) -> Option<&str> {
        self.roles.get(role_id).map(|r| r.device_id.as_str())
    }

    /// All role assignments as role -> device
    pub fn get_assignments(&self) -> HashMap<String, String> {
        self.roles
            .iter()
            .map(|(k, v)| (k.clone(), v.device_id.clone()))
            .collect()
    }

    /// Apply a runtime override
    pub fn apply_override(&mut self, path: &str, value: impl Into<ConfigValue>) -> Result<()> {
        let value = value.into();
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            [name] | ["params", name] => {
                self.params.insert((*name).to_string(), value.clone());
            }
            ["roles", role] | ["roles", role, "device_id"] => {
                let device = value
                    .as_str()
                    .ok_or_else(|| anyhow!("Role override '{}' needs a device id", path))?;
                self.assign_role(*role, device);
            }
            ["procedure", "name"] => {
                self.name = value.to_string();
            }
            _ => bail!("Unsupported override path '{}'", path),
        }
        self.overrides.push(ConfigOverride {
            path: path.to_string(),
            value,
        });
        Ok(())
    }

    /// Apply several overrides in order.
    pub fn apply_overrides(&mut self, overrides: &[ConfigOverride]) -> Result<()> {
        for o in overrides {
            self.apply_override(&o.path, o.value.clone())?;
        }
        Ok(())
    }

    /// Validate against a procedure type: required roles, unknown names, numeric bounds.
    ///
    /// Returns warnings for names the procedure does not know about.
    pub fn validate(&self, type_info: &ProcedureTypeInfo) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.procedure_type != type_info.type_id {
            bail!(
                "Configuration is for '{}', not '{}'",
                self.procedure_type,
                type_info.type_id
            );
        }

        for role in &type_info.roles {
            if !role.optional && !self.roles.contains_key(&role.role_id) {
                bail!("Missing required role assignment: {}", role.role_id);
            }
        }
        for role_id in self.roles.keys() {
            if !type_info.roles.iter().any(|r| &r.role_id == role_id) {
                warnings.push(format!("Unknown role '{}' - will be ignored", role_id));
            }
        }
        for name in self.params.keys() {
            if !type_info.parameters.iter().any(|p| &p.name == name) {
                warnings.push(format!("Unknown parameter '{}' - will be ignored", name));
            }
        }

        for def in &type_info.parameters {
            let Some(value) = self.params.get(&def.name) else {
                if def.default.is_none() {
                    bail!("Missing required parameter: {}", def.name);
                }
                continue;
            };
            if value.as_f64().is_some_and(|v| !v.is_finite()) {
                bail!("Parameter '{}' must be a finite number, got {}", def.name, value);
            }
            let Some(constraints) = &def.constraints else {
                continue;
            };
            if let Some(v) = value.as_f64() {
                if let Some(min) = constraints.min {
                    if v < min {
                        bail!("Parameter '{}' value {} is below minimum {}", def.name, v, min);
                    }
                }
                if let Some(max) = constraints.max {
                    if v > max {
                        bail!("Parameter '{}' value {} is above maximum {}", def.name, v, max);
                    }
                }
            }
        }

        Ok(warnings)
    }

    /// Every declared parameter with its effective value, in declaration order.
    pub fn effective_parameters(&self, type_info: &ProcedureTypeInfo) -> Vec<(String, String)> {
        type_info
            .parameters
            .iter()
            .map(|def| {
                let value = self
                    .params
                    .get(&def.name)
                    .map(ToString::to_string)
                    .or_else(|| def.default.clone())
                    .unwrap_or_default();
                let rendered = match &def.units {
                    Some(units) => format!("{} {}", value, units),
                    None => value,
                };
                (def.name.clone(), rendered)
            })
            .collect()
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

impl ProcedureConfig {
    /// Set a parameter
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Assign a device to a role
    pub fn with_role(mut self, role_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        self.assign_role(role_id, device_id);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedures::{ParameterConstraints, ParameterDef, RoleRequirement};

    fn info() -> ProcedureTypeInfo {
        ProcedureTypeInfo {
            type_id: "gate_sweep".into(),
            name: "Gate sweep".into(),
            description: String::new(),
            category: "transport".into(),
            roles: vec![RoleRequirement {
                role_id: "source".into(),
                capability: "VoltageSource".into(),
                optional: false,
                description: String::new(),
            }],
            parameters: vec![
                ParameterDef {
                    name: "voltage_step_mv".into(),
                    param_type: "f64".into(),
                    default: Some("20".into()),
                    units: Some("mV".into()),
                    description: String::new(),
                    constraints: Some(ParameterConstraints {
                        min: Some(0.001),
                        max: None,
                    }),
                },
                ParameterDef {
                    name: "dwell_time_s".into(),
                    param_type: "f64".into(),
                    default: Some("30".into()),
                    units: Some("s".into()),
                    description: String::new(),
                    constraints: None,
                },
            ],
            version: "1.0".into(),
        }
    }

    #[test]
    fn test_config_builder() {
        let config = ProcedureConfig::new("gate_sweep")
            .with_param("dwell_time_s", 5i32)
            .with_param("voltage_step_mv", 0.5f64)
            .with_role("source", "smu");

        assert_eq!(config.f64_or("dwell_time_s", f64::NAN).unwrap(), 5.0);
        assert_eq!(config.f64_or("missing", 7.0).unwrap(), 7.0);
        assert_eq!(config.get_role_device("source"), Some("smu"));
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [procedure]
            type = "hall_sweep"
            name = "AHE 4 A"

            [params]
            field_current_a = 4
            four_wire = true

            [roles.field_supply]
            device_id = "coil"
        "#;

        let config = ProcedureConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.procedure_type, "hall_sweep");
        assert_eq!(config.f64_or("field_current_a", f64::NAN).unwrap(), 4.0);
        assert!(config.bool_or("four_wire", false).unwrap());
        assert_eq!(config.get_role_device("field_supply"), Some("coil"));
    }

    #[test]
    fn test_wrong_type_is_error() {
        let config = ProcedureConfig::new("x").with_param("delay_ms", "fast");
        assert!(config.f64_or("delay_ms", 100.0).is_err());
        assert!(config.bool_or("delay_ms", true).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = ProcedureConfig::new("gate_sweep").with_param("dwell_time_s", 10i32);
        config.apply_override("dwell_time_s", 20i32).unwrap();
        assert_eq!(config.f64_or("dwell_time_s", f64::NAN).unwrap(), 20.0);

        let parsed = ConfigOverride::parse("params.voltage_step_mv=12.5").unwrap();
        config.apply_overrides(&[parsed]).unwrap();
        assert_eq!(config.f64_or("voltage_step_mv", f64::NAN).unwrap(), 12.5);

        config.apply_override("roles.source", "gate_psu").unwrap();
        assert_eq!(config.get_role_device("source"), Some("gate_psu"));

        assert!(config.apply_override("roles.source", 3i32).is_err());
        assert!(config.apply_override("a.b.c.d", 1i32).is_err());
        assert!(ConfigOverride::parse("no_equals").is_err());
        assert_eq!(config.overrides.len(), 3);
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(ConfigValue::parse_literal("true"), ConfigValue::Bool(true));
        assert_eq!(ConfigValue::parse_literal("-20"), ConfigValue::Integer(-20));
        assert_eq!(ConfigValue::parse_literal("0.2"), ConfigValue::Float(0.2));
        assert_eq!(
            ConfigValue::parse_literal("\"coil\""),
            ConfigValue::String("coil".into())
        );
    }

    #[test]
    fn test_validate() {
        let ok = ProcedureConfig::new("gate_sweep")
            .with_role("source", "smu")
            .with_param("bogus", 1i32);
        let warnings = ok.validate(&info()).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("bogus"));

        let missing_role = ProcedureConfig::new("gate_sweep");
        assert!(missing_role.validate(&info()).is_err());

        let below_min = ProcedureConfig::new("gate_sweep")
            .with_role("source", "smu")
            .with_param("voltage_step_mv", 0i32);
        assert!(below_min.validate(&info()).is_err());

        let infinite = ProcedureConfig::new("gate_sweep")
            .with_role("source", "smu")
            .with_param("dwell_time_s", f64::INFINITY);
        assert!(infinite.validate(&info()).is_err());
        let nan = ProcedureConfig::new("gate_sweep")
            .with_role("source", "smu")
            .with_param("voltage_step_mv", ConfigValue::parse_literal("NaN"));
        assert!(nan.validate(&info()).is_err());

        let wrong_type = ProcedureConfig::new("hall_sweep").with_role("source", "smu");
        assert!(wrong_type.validate(&info()).is_err());
    }

    #[test]
    fn test_effective_parameters_render_units() {
        let config = ProcedureConfig::new("gate_sweep").with_param("dwell_time_s", 2.5f64);
        let params = config.effective_parameters(&info());
        assert_eq!(
            params,
            vec![
                ("voltage_step_mv".to_string(), "20 mV".to_string()),
                ("dwell_time_s".to_string(), "2.5 s".to_string()),
            ]
        );
    }
}
