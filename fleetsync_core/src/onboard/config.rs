use crate::{Error, Result};
use std::time::Duration;

pub const DEFAULT_PARTITION_CAPACITY: u32 = 1000;
pub const DEFAULT_JOB_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_MONGO_COLLECTION: &str = "tblvehiclerecentupdates";
pub const DEFAULT_SPATIAL_EXCLUDED_SOURCES: &str = "27";
pub const DEFAULT_WATERMARK_FAILURE_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedisMode {
    Single,
    Cluster,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// `host:port`, comma-separated in cluster mode.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub mode: RedisMode,
}

impl RedisConfig {
    pub fn nodes(&self) -> Vec<String> {
        self.endpoint
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| format!("redis://{n}"))
            .collect()
    }
}

/// Key/value names shared with the routing tier and the source registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConfig {
    pub servers: String,
    pub onboarded_servers: String,
    pub registered_devices: String,
    pub test_devices: String,
    pub communication_groups: String,
    pub crypto_secret: String,
    pub crypto_secret_field: String,
    pub device_command_channel: String,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub db_name: String,
    pub auth_db: String,
    pub collection: String,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Comma-separated host list.
    pub hosts: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub db_name: String,
}

impl PostgresConfig {
    pub fn host_list(&self) -> Vec<String> {
        self.hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub partition_capacity: u32,
    pub interval: Duration,
    /// Sources that never run the spatial fetch.
    pub spatial_excluded_sources: Vec<String>,
    pub watermark_failure_threshold: u32,
}

/// Full process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub redis: RedisConfig,
    pub keys: KeyConfig,
    pub mongo: MongoConfig,
    pub postgres: PostgresConfig,
    pub sync: SyncConfig,
}

fn required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::InvalidInput(format!("{name} is required"))),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl AgentConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let mode = match required("CONNECTASREDISCLUSTERMODE")?.trim() {
            "1" => RedisMode::Cluster,
            _ => RedisMode::Single,
        };
        let redis = RedisConfig {
            endpoint: required("CONFIGSERVERENDPOINT")?,
            username: required("CONFIGSERVERUSERNAME")?,
            password: required("CONFIGSERVERPASSWORD")?,
            mode,
        };

        let keys = KeyConfig {
            servers: required("REDISKEYFORSERVERS")?,
            onboarded_servers: required("REDISKEYFORONBOARDEDSERVERS")?,
            registered_devices: required("REDISKEYFORREGISTEREDDEVICE")?,
            test_devices: required("REDISKEYFORTESTDEVICE")?,
            communication_groups: required("REDISKEYFORCOMMUNICATIONGROUP")?,
            crypto_secret: required("REDISKEYFORCRYPTOSECRET")?,
            crypto_secret_field: required("REDISHASHFIELDFORCRYPTOSECRET")?,
            device_command_channel: required("REDISDEVICECOMMANDCHANNEL")?,
        };

        let mongo = MongoConfig {
            endpoint: required("MONGOENDPOINT")?,
            username: required("MONGOUSERNAME")?,
            password: required("MONGOPASSWORD")?,
            db_name: required("MONGODBNAME")?,
            auth_db: required("MONGOAUTHDB")?,
            collection: optional("MONGOCOLLECTION")
                .unwrap_or_else(|| DEFAULT_MONGO_COLLECTION.to_string()),
        };

        let port = required("PGSPORT")?;
        let postgres = PostgresConfig {
            hosts: required("PGSHOSTS")?,
            port: port
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::InvalidInput(format!("PGSPORT '{port}' is not a port")))?,
            username: required("PGSUSERNAME")?,
            password: required("PGSPASSWORD")?,
            db_name: required("PGSDBNAME")?,
        };

        let sync = SyncConfig {
            partition_capacity: optional("DEVICECOUNTPERPARTITION")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(DEFAULT_PARTITION_CAPACITY),
            interval: Duration::from_secs(
                optional("JOBINTERVALINSEC")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .unwrap_or(DEFAULT_JOB_INTERVAL_SECS),
            ),
            spatial_excluded_sources: parse_list(
                optional("SPATIALEXCLUDEDSOURCES")
                    .as_deref()
                    .unwrap_or(DEFAULT_SPATIAL_EXCLUDED_SOURCES),
            ),
            watermark_failure_threshold: optional("WATERMARKFAILURETHRESHOLD")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(DEFAULT_WATERMARK_FAILURE_THRESHOLD),
        };

        let cfg = Self {
            redis,
            keys,
            mongo,
            postgres,
            sync,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        if self.redis.nodes().is_empty() {
            return Err(Error::InvalidInput(
                "CONFIGSERVERENDPOINT has no usable address".to_string(),
            ));
        }
        if self.postgres.host_list().is_empty() {
            return Err(Error::InvalidInput(
                "PGSHOSTS has no usable host".to_string(),
            ));
        }
        Ok(())
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partition_capacity == 0 {
            return Err(Error::InvalidInput(
                "DEVICECOUNTPERPARTITION must be > 0".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(Error::InvalidInput(
                "JOBINTERVALINSEC must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_spatial_authority(&self, source_id: &str) -> bool {
        !self.spatial_excluded_sources.iter().any(|s| s == source_id)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            partition_capacity: DEFAULT_PARTITION_CAPACITY,
            interval: Duration::from_secs(DEFAULT_JOB_INTERVAL_SECS),
            spatial_excluded_sources: parse_list(DEFAULT_SPATIAL_EXCLUDED_SOURCES),
            watermark_failure_threshold: DEFAULT_WATERMARK_FAILURE_THRESHOLD,
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sync_config_excludes_source_27() {
        let cfg = SyncConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(!cfg.is_spatial_authority("27"));
        assert!(cfg.is_spatial_authority("3"));
        assert_eq!(cfg.partition_capacity, 1000);
        assert_eq!(cfg.interval, Duration::from_secs(15));
        assert_eq!(cfg.watermark_failure_threshold, 10);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let cfg = SyncConfig {
            partition_capacity: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn redis_nodes_split_on_commas() {
        let cfg = RedisConfig {
            endpoint: "a:7000, b:7001,,".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            mode: RedisMode::Cluster,
        };
        assert_eq!(
            cfg.nodes(),
            vec!["redis://a:7000".to_string(), "redis://b:7001".to_string()]
        );
    }

    #[test]
    fn list_parsing_trims_entries() {
        assert_eq!(parse_list(" 27, 31 ,"), vec!["27", "31"]);
    }
}
