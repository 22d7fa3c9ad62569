// ⚙️ Configuration - JSON file + environment overrides
//
// Lookup order: defaults → file named by PAYREF_CONFIG → PAYREF_* variables.

use crate::epc::Creditor;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "PAYREF_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Address the HTTP server binds to
    pub bind_address: String,

    /// Default tracing filter (RUST_LOG wins when set)
    pub log_level: String,

    /// Beneficiary printed in EPC QR payloads
    pub creditor: Creditor,

    /// Accepted difference between requested and received amount
    pub amount_tolerance_cents: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("payref.db"),
            bind_address: "127.0.0.1:3000".to_string(),
            log_level: "info".to_string(),
            creditor: Creditor {
                name: "Payee".to_string(),
                iban: "BE68539007547034".to_string(),
                bic: None,
            },
            amount_tolerance_cents: 0,
        }
    }
}

impl Config {
    /// Load config from a JSON file; missing keys fall back to defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        Ok(config)
    }

    /// Defaults or PAYREF_CONFIG file, then PAYREF_* overrides from the process env
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("PAYREF_"))
            .collect();
        Self::load_from(&vars)
    }

    /// Same as [`Config::load`] with an explicit variable map
    pub fn load_from(vars: &HashMap<String, String>) -> Result<Self> {
        let mut config = match vars.get(CONFIG_ENV) {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_overrides(vars);
        config.validate()?;

        Ok(config)
    }

    fn apply_overrides(&mut self, vars: &HashMap<String, String>) {
        if let Some(v) = vars.get("PAYREF_DATABASE") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = vars.get("PAYREF_BIND") {
            self.bind_address = v.clone();
        }
        if let Some(v) = vars.get("PAYREF_LOG") {
            self.log_level = v.clone();
        }
        if let Some(v) = vars.get("PAYREF_CREDITOR_NAME") {
            self.creditor.name = v.clone();
        }
        if let Some(v) = vars.get("PAYREF_CREDITOR_IBAN") {
            self.creditor.iban = v.clone();
        }
        if let Some(v) = vars.get("PAYREF_CREDITOR_BIC") {
            self.creditor.bic = if v.trim().is_empty() { None } else { Some(v.clone()) };
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.creditor
            .validate()
            .context("Invalid creditor configuration")?;

        anyhow::ensure!(
            self.amount_tolerance_cents >= 0,
            "amount_tolerance_cents must not be negative"
        );

        Ok(())
    }
}
