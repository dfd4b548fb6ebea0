//! Canonical pricing record and provider vocabulary for VM Finder.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vmfinder-core";

/// Fixed hours-per-month used to derive monthly cost from an hourly rate.
pub const HOURS_PER_MONTH: f64 = 730.0;

pub const DEFAULT_CURRENCY: &str = "USD";

/// Providers the dataset may carry records for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    Aws,
    Gcp,
    Azure,
    DigitalOcean,
    Linode,
    Vultr,
    PhoenixNap,
    EquinixMetal,
    HetznerCloud,
    HetznerBareMetal,
    OvhCloud,
    Scaleway,
}

impl Provider {
    pub const ALL: [Provider; 12] = [
        Provider::Aws,
        Provider::Gcp,
        Provider::Azure,
        Provider::DigitalOcean,
        Provider::Linode,
        Provider::Vultr,
        Provider::PhoenixNap,
        Provider::EquinixMetal,
        Provider::HetznerCloud,
        Provider::HetznerBareMetal,
        Provider::OvhCloud,
        Provider::Scaleway,
    ];

    /// Label stored in `VmInstance::provider`.
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Aws => "AWS",
            Provider::Gcp => "GCP",
            Provider::Azure => "Azure",
            Provider::DigitalOcean => "DigitalOcean",
            Provider::Linode => "Linode",
            Provider::Vultr => "Vultr",
            Provider::PhoenixNap => "PhoenixNAP",
            Provider::EquinixMetal => "Equinix Metal",
            Provider::HetznerCloud => "Hetzner Cloud",
            Provider::HetznerBareMetal => "Hetzner Bare Metal",
            Provider::OvhCloud => "OVHcloud",
            Provider::Scaleway => "Scaleway",
        }
    }

    /// Short identifier used in config files and on the command line.
    pub fn slug(self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
            Provider::DigitalOcean => "digitalocean",
            Provider::Linode => "linode",
            Provider::Vultr => "vultr",
            Provider::PhoenixNap => "phoenixnap",
            Provider::EquinixMetal => "equinix-metal",
            Provider::HetznerCloud => "hetzner-cloud",
            Provider::HetznerBareMetal => "hetzner-bare-metal",
            Provider::OvhCloud => "ovhcloud",
            Provider::Scaleway => "scaleway",
        }
    }

    /// Accepts either the slug or the display name, case-insensitively.
    pub fn parse(input: &str) -> Option<Provider> {
        let needle = input.trim();
        Provider::ALL.into_iter().find(|p| {
            p.slug().eq_ignore_ascii_case(needle) || p.display_name().eq_ignore_ascii_case(needle)
        })
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Storage medium recognised in vendor prose, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Nvme,
    Ssd,
    Hdd,
    Sata,
    Unknown,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Nvme => "NVMe",
            StorageKind::Ssd => "SSD",
            StorageKind::Hdd => "HDD",
            StorageKind::Sata => "SATA",
            StorageKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One SKU / location / price point, normalized across providers.
///
/// `vcpus == 0` and `storage_gb == 0` mean "not parseable from the vendor data",
/// not a confirmed zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInstance {
    pub instance_name: String,
    pub provider: String,
    pub region: String,
    pub vcpus: u32,
    pub memory_gb: Option<f64>,
    pub storage_gb: u64,
    pub storage_type: String,
    pub hourly_cost: Option<f64>,
    pub monthly_cost: Option<f64>,
    pub spot_price: Option<f64>,
    pub currency: String,
    pub instance_family: String,
    pub network_performance: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Identity used when replacing a provider's records. Not unique within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub provider: String,
    pub instance_name: String,
    pub region: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("record field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("record field `{field}` must be a non-negative number, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("currency `{0}` is not a 3-letter code")]
    Currency(String),
}

impl VmInstance {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            provider: self.provider.clone(),
            instance_name: self.instance_name.clone(),
            region: self.region.clone(),
        }
    }

    /// Checks the structural invariants every stored record must satisfy.
    ///
    /// Hourly and monthly cost are deliberately not cross-checked; vendors round
    /// their own way.
    pub fn validate(&self) -> Result<(), RecordError> {
        for (name, value) in [
            ("instance_name", &self.instance_name),
            ("provider", &self.provider),
            ("region", &self.region),
        ] {
            if value.trim().is_empty() {
                return Err(RecordError::EmptyField(name));
            }
        }

        for (field, value) in [
            ("memory_gb", self.memory_gb),
            ("hourly_cost", self.hourly_cost),
            ("monthly_cost", self.monthly_cost),
            ("spot_price", self.spot_price),
        ] {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(RecordError::Negative { field, value });
                }
            }
        }

        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(RecordError::Currency(self.currency.clone()));
        }

        Ok(())
    }

    /// Same record with `last_updated` zeroed, for comparisons across fetches.
    pub fn without_timestamp(&self) -> VmInstance {
        VmInstance {
            last_updated: DateTime::<Utc>::default(),
            ..self.clone()
        }
    }
}

/// Leading alphabetic run of an instance name (`cx22` -> `cx`), or `fallback`.
pub fn instance_family_of(instance_name: &str, fallback: &str) -> String {
    let family: String = instance_name
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if family.is_empty() {
        fallback.to_string()
    } else {
        family
    }
}
