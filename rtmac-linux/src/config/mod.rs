use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddrV4},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use arrayvec::ArrayVec;
use rtmac::{
    config::{
        StationAddr, StationKind, TdmaConfig, MAX_MASTER_SLOTS, MAX_MTU, MAX_STATIONS, MIN_MTU,
    },
    time::Duration,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::{fs::read_to_string, io};
use tracing::warn;

use crate::tracing::LogLevel;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rtmac/rtmac.toml";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub loglevel: LogLevel,
    pub station_address: StationAddr,
    #[serde(default)]
    pub role: StartupRole,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub tdma: TdmaSection,
    #[serde(default, rename = "station")]
    pub stations: Vec<StationConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// The role the instance takes right after it is attached
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StartupRole {
    Master,
    Client,
    /// Stay down until told otherwise over the control socket
    #[default]
    None,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NetworkConfig {
    /// Multicast group emulating the Ethernet segment
    pub group: SocketAddrV4,
    /// Address of the local interface to join the group on
    pub interface: Ipv4Addr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            group: SocketAddrV4::new(Ipv4Addr::new(239, 255, 90, 49), 9031),
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct TdmaSection {
    pub cycle_period_us: u64,
    pub master_wait_cycles: u32,
    pub admission_timeout_ms: u64,
    pub max_admission_attempts: u8,
    pub retry_backoff_ms: u64,
    pub calibration_rounds: u16,
    pub max_missed_cycles: u32,
    pub grace_window_us: Option<u64>,
    pub mtu: u16,
    pub nrt_offset_us: Option<u64>,
    pub master_slots_us: Vec<u64>,
}

impl Default for TdmaSection {
    fn default() -> Self {
        TdmaSection {
            cycle_period_us: 5000,
            master_wait_cycles: 3,
            admission_timeout_ms: 100,
            max_admission_attempts: 3,
            retry_backoff_ms: 250,
            calibration_rounds: 100,
            max_missed_cycles: 8,
            grace_window_us: None,
            mtu: MAX_MTU,
            nrt_offset_us: None,
            master_slots_us: vec![0],
        }
    }
}

/// A station the master admits as soon as it runs
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StationConfig {
    pub address: StationAddr,
    pub kind: StationKind,
    #[serde(default)]
    pub offset_us: u64,
}

impl StationConfig {
    pub fn offset(&self) -> Duration {
        micros(self.offset_us)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub control_path: Option<PathBuf>,
    #[serde(default = "default_control_permissions")]
    pub control_permissions: u32,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            control_path: None,
            control_permissions: default_control_permissions(),
        }
    }
}

const fn default_control_permissions() -> u32 {
    0o666
}

fn micros(us: u64) -> Duration {
    Duration::from_micros(i64::try_from(us).unwrap_or(i64::MAX))
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(i64::try_from(ms).unwrap_or(i64::MAX))
}

impl Config {
    /// Parse config from file
    pub async fn from_file(file: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let meta = std::fs::metadata(&file)?;
        let perm = meta.permissions();

        if perm.mode() as libc::mode_t & libc::S_IWOTH != 0 {
            warn!("Unrestricted config file permissions: Others can write.");
        }

        let contents = read_to_string(file).await?;
        Ok(toml::de::from_str(&contents)?)
    }

    /// The configuration of the TDMA instance
    pub fn tdma_config(&self) -> TdmaConfig {
        let tdma = &self.tdma;
        let mut master_slots = ArrayVec::new();
        for slot in tdma.master_slots_us.iter().take(MAX_MASTER_SLOTS) {
            master_slots.push(micros(*slot));
        }

        TdmaConfig {
            station_address: self.station_address,
            cycle_period: micros(tdma.cycle_period_us),
            master_wait_cycles: tdma.master_wait_cycles,
            admission_timeout: millis(tdma.admission_timeout_ms),
            max_admission_attempts: tdma.max_admission_attempts,
            retry_backoff: millis(tdma.retry_backoff_ms),
            calibration_rounds: tdma.calibration_rounds,
            max_missed_cycles: tdma.max_missed_cycles,
            grace_window: tdma.grace_window_us.map(micros),
            mtu: tdma.mtu,
            nrt_offset: tdma.nrt_offset_us.map(micros),
            master_slots,
        }
    }

    /// Check that the config is reasonable
    pub fn check(&self) -> bool {
        let mut ok = true;
        let tdma = &self.tdma;

        // Offsets travel as 32 bit nanosecond counts
        if tdma.cycle_period_us == 0 || tdma.cycle_period_us > u64::from(u32::MAX) / 1000 {
            warn!("The cycle period must lie between 1us and 4.29s.");
            return false;
        }
        let period = tdma.cycle_period_us;

        if self.station_address.is_broadcast() {
            warn!("The broadcast address cannot be used as station address.");
            ok = false;
        }

        if !(MIN_MTU..=MAX_MTU).contains(&tdma.mtu) {
            warn!("The mtu must lie between {} and {}.", MIN_MTU, MAX_MTU);
            ok = false;
        }

        if tdma.max_admission_attempts == 0 {
            warn!("At least one admission attempt is needed.");
            ok = false;
        }

        if tdma.max_missed_cycles == 0 {
            warn!("max-missed-cycles must be at least 1.");
            ok = false;
        }

        if tdma.grace_window_us.is_some_and(|grace| grace >= period) {
            warn!("The grace window must be shorter than the cycle period.");
            ok = false;
        }

        let nrt_offset = tdma.nrt_offset_us.unwrap_or(period * 3 / 4);
        if nrt_offset >= period {
            warn!("The non-real-time window must start within the cycle.");
            ok = false;
        }

        if tdma.master_slots_us.is_empty() {
            warn!("The master needs at least one transmit slot.");
            ok = false;
        }

        if tdma.master_slots_us.len() > MAX_MASTER_SLOTS {
            warn!("Too many master slots are configured.");
            ok = false;
        }

        for slot in &tdma.master_slots_us {
            if *slot >= nrt_offset {
                warn!("Master slot at {}us lies outside the real-time window.", slot);
                ok = false;
            }
        }

        if self.stations.len() > MAX_STATIONS {
            warn!("Too many stations are configured.");
            ok = false;
        }

        let mut seen = HashSet::new();
        for station in &self.stations {
            if station.address == self.station_address || station.address.is_broadcast() {
                warn!("Station {} cannot be admitted.", station.address);
                ok = false;
            }

            if !seen.insert(station.address) {
                warn!("Station {} is configured twice.", station.address);
                ok = false;
            }

            if station.kind == StationKind::Rt {
                if station.offset_us >= nrt_offset {
                    warn!(
                        "Station {} at {}us lies outside the real-time window.",
                        station.address, station.offset_us
                    );
                    ok = false;
                }

                if tdma.master_slots_us.contains(&station.offset_us) {
                    warn!(
                        "Station {} would transmit in a master slot.",
                        station.address
                    );
                    ok = false;
                }
            }
        }

        ok
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error while reading config: {0}")]
    Io(#[from] io::Error),
    #[error("config toml parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}
