//! Discovery of cloud hosts through the provisioning tool's dynamic
//! inventory.

use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use super::ProviderError;
use crate::remote::{CommandRunner, Vars, run_blocking};

/// Prefix every orchestrator-managed instance name carries.
const INSTANCE_PREFIX: &str = "monkey-";

/// One host reported by the inventory.
#[derive(Clone, Debug, PartialEq)]
pub struct InventoryHost {
    /// Inventory hostname, equal to the instance name.
    pub name: String,
    /// Public address, when the inventory reports one.
    pub address: Option<IpAddr>,
    /// Availability zone, or an empty string.
    pub location: String,
    /// Raw host variables.
    pub vars: Vars,
}

fn address_of(name: &str, vars: &Vars) -> Option<IpAddr> {
    ["ansible_host", "public_ip_address"]
        .iter()
        .filter_map(|key| vars.get(*key).and_then(Value::as_str))
        .chain(std::iter::once(name))
        .find_map(|candidate| candidate.parse().ok())
}

fn location_of(vars: &Vars) -> String {
    vars.get("placement")
        .and_then(|placement| placement.get("availability_zone"))
        .or_else(|| vars.get("zone"))
        .and_then(Value::as_str)
        .map(|zone| zone.rsplit('/').next().unwrap_or(zone).to_owned())
        .unwrap_or_default()
}

/// Parses `ansible-inventory --list` output, keeping only hosts named with
/// the orchestrator's prefix.
///
/// # Errors
///
/// Returns [`ProviderError::Inventory`] when the document is not JSON or has
/// no `_meta.hostvars` table.
pub fn parse_inventory(document: &str) -> Result<Vec<InventoryHost>, ProviderError> {
    let value: Value = serde_json::from_str(document)
        .map_err(|err| ProviderError::Inventory(format!("invalid inventory JSON: {err}")))?;
    let hostvars = value
        .get("_meta")
        .and_then(|meta| meta.get("hostvars"))
        .and_then(Value::as_object)
        .ok_or_else(|| ProviderError::Inventory(String::from("missing _meta.hostvars")))?;

    let hosts = hostvars
        .iter()
        .filter(|(name, _)| name.starts_with(INSTANCE_PREFIX))
        .map(|(name, vars)| {
            let vars = vars.as_object().cloned().unwrap_or_default();
            InventoryHost {
                name: name.clone(),
                address: address_of(name, &vars),
                location: location_of(&vars),
                vars,
            }
        })
        .collect();
    Ok(hosts)
}

/// Runs `ansible-inventory --list` against a provider's inventory source.
#[derive(Clone, Debug)]
pub struct InventoryClient {
    runner: Arc<dyn CommandRunner>,
    inventory_bin: String,
    source: Utf8PathBuf,
}

impl InventoryClient {
    /// Creates a client for the inventory at `source`.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        inventory_bin: impl Into<String>,
        source: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            runner,
            inventory_bin: inventory_bin.into(),
            source: source.into(),
        }
    }

    /// Inventory source passed with `-i`.
    #[must_use]
    pub fn source(&self) -> &Utf8Path {
        &self.source
    }

    /// Lists the orchestrator's hosts.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Inventory`] when the command cannot start,
    /// exits non-zero or prints an unparseable document.
    pub async fn list(&self) -> Result<Vec<InventoryHost>, ProviderError> {
        let program = self.inventory_bin.clone();
        let args = vec![
            OsString::from("-i"),
            OsString::from(self.source.as_str()),
            OsString::from("--list"),
        ];
        let output = run_blocking(&self.runner, program, args)
            .await
            .map_err(|err| ProviderError::Inventory(err.to_string()))?;
        if !output.is_success() {
            return Err(ProviderError::Inventory(
                output.failure_summary(&self.inventory_bin),
            ));
        }
        parse_inventory(&output.stdout)
    }
}
