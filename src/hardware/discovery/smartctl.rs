//! smartctl Discovery
//!
//! Device enumeration and SMART probing through smartctl's JSON output.
//! smartctl encodes warnings in its exit status bitmask, so results are
//! judged from the JSON document rather than the exit code.

use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::crd::{SmartAttribute, SmartCheck};
use crate::error::{Error, Result};
use crate::exec::{ExecParams, Executor};

/// One entry of `smartctl --scan --json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScannedDevice {
    pub name: String,
    #[serde(default)]
    pub info_name: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub protocol: String,
}

impl ScannedDevice {
    /// RAID member addressed through its controller, e.g. `megaraid,0`
    pub fn is_raid_member(&self) -> bool {
        self.r#type.contains(',')
    }
}

#[derive(Debug, Deserialize)]
struct ScanOutput {
    #[serde(default)]
    devices: Vec<ScannedDevice>,
}

/// Identity and health of one device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmartReport {
    pub device_path: String,
    pub device_type: String,
    pub serial_number: String,
    pub vendor: String,
    pub product: String,
    pub model_name: String,
    pub rotation_rate: i64,
    pub protocol: String,
    pub form_factor: String,
    pub capacity: i64,
    pub smart_support: bool,
    pub check: SmartCheck,
}

impl SmartReport {
    /// Parse a `smartctl -x --json` document
    pub fn from_json(device_path: &str, device_type: &str, json: &serde_json::Value) -> Self {
        let text = |v: &serde_json::Value| v.as_str().unwrap_or_default().trim().to_string();

        let attributes = json["ata_smart_attributes"]["table"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| SmartAttribute {
                        id: row["id"].as_i64().unwrap_or_default(),
                        name: text(&row["name"]),
                        value: row["value"].as_i64().unwrap_or_default(),
                        worst: row["worst"].as_i64().unwrap_or_default(),
                        thresh: row["thresh"].as_i64().unwrap_or_default(),
                        raw: row["raw"]["value"].as_i64().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let nvme_health = json["nvme_smart_health_information_log"]
            .as_object()
            .map(|log| {
                log.iter()
                    .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n)))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        let passed = json["smart_status"]["passed"].as_bool().unwrap_or(true);
        let smart_support = json["smart_support"]["available"]
            .as_bool()
            .unwrap_or(json["smart_status"]["passed"].is_boolean());

        Self {
            device_path: device_path.to_string(),
            device_type: device_type.to_string(),
            serial_number: text(&json["serial_number"]),
            vendor: text(&json["vendor"]),
            product: text(&json["product"]),
            model_name: text(&json["model_name"]),
            rotation_rate: json["rotation_rate"].as_i64().unwrap_or_default(),
            protocol: text(&json["device"]["protocol"]),
            form_factor: text(&json["form_factor"]["name"]),
            capacity: json["user_capacity"]["bytes"].as_i64().unwrap_or_default(),
            smart_support,
            check: SmartCheck {
                passed,
                temperature: json["temperature"]["current"].as_i64(),
                power_on_hours: json["power_on_time"]["hours"].as_i64(),
                attributes,
                nvme_health,
                last_time: Some(Utc::now()),
            },
        }
    }
}

/// smartctl driver
pub struct SmartctlClient {
    exec: Arc<dyn Executor>,
}

impl SmartctlClient {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    async fn json(&self, params: ExecParams) -> Result<serde_json::Value> {
        let command = params.command_line();
        let res = self.exec.run(params).await;
        if res.error.is_some() || res.stdout.trim().is_empty() {
            res.check(&command)?;
            return Err(Error::CommandOutputParse {
                command,
                reason: "empty output".into(),
            });
        }
        Ok(serde_json::from_str(&res.stdout)?)
    }

    /// Devices reported by `smartctl --scan`
    pub async fn scan(&self) -> Result<Vec<ScannedDevice>> {
        let json = self
            .json(ExecParams::new("smartctl").args(["--scan", "--json"]))
            .await?;
        let out: ScanOutput = serde_json::from_value(json)?;
        Ok(out.devices)
    }

    /// Devices worth probing: PCI disks and RAID members
    pub async fn health_targets(&self, pci_names: &BTreeSet<String>) -> Result<Vec<ScannedDevice>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|d| {
                let base = d.name.rsplit('/').next().unwrap_or_default();
                d.is_raid_member() || pci_names.contains(base)
            })
            .collect())
    }

    /// Full SMART probe of one device
    pub async fn probe(&self, device: &ScannedDevice) -> Result<SmartReport> {
        let mut params = ExecParams::new("smartctl").args(["-x", device.name.as_str(), "--json"]);
        if device.is_raid_member() {
            params = params.args(["-d", device.r#type.as_str()]);
        }
        let json = self.json(params).await?;
        debug!("Probed SMART data of {} ({})", device.name, device.r#type);
        Ok(SmartReport::from_json(&device.name, &device.r#type, &json))
    }
}
