use crate::models::{DeviceFetch, SpatialBatch};
use crate::sources::rows;
use crate::sources::traits::SourceDb;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tiberius::{AuthMethod, Client, Config, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

const DEFAULT_PORT: u16 = 1433;

const DEVICE_QUERY: &str = "\
DECLARE @DataFetchedOn DATETIME2 = SYSUTCDATETIME();
EXEC GetIOTRegisteredDeviceData @ApplicationMainPageID = @P1, @DataFetchedOn = @DataFetchedOn OUTPUT;
SELECT @DataFetchedOn AS datafetchedon;";

const SPATIAL_QUERY: &str = "\
DECLARE @DataFetchedOn DATETIME2 = SYSUTCDATETIME();
EXEC GetIOTSpatialData @DataFetchedOn = @DataFetchedOn OUTPUT;
SELECT @DataFetchedOn AS datafetchedon;";

const WATERMARK_QUERY: &str = "\
DECLARE @Status BIT = 0;
EXEC UpdIOTDataSyncFetchDate @CanUpdateDeviceDate = @P1, @DeviceDate = @P2, \
@CanUpdateSpatialDate = @P3, @SpatialDate = @P4, @Status = @Status OUTPUT;
SELECT @Status AS status;";

/// Decrypted connection descriptor stored per onboarded source.
#[derive(Clone, Deserialize)]
pub struct SourceCredential {
    /// `host` or `host:port`.
    pub hostname: String,
    pub dbname: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub mainpageid: String,
}

impl std::fmt::Debug for SourceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCredential")
            .field("hostname", &self.hostname)
            .field("dbname", &self.dbname)
            .field("username", &self.username)
            .field("mainpageid", &self.mainpageid)
            .finish()
    }
}

impl SourceCredential {
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::InvalidInput("source hostname is empty".to_string()));
        }
        if self.dbname.trim().is_empty() {
            return Err(Error::InvalidInput("source dbname is empty".to_string()));
        }
        Ok(())
    }

    fn host_port(&self) -> (String, u16) {
        let raw = self.hostname.trim();
        match raw.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (raw.to_string(), DEFAULT_PORT),
            },
            None => (raw.to_string(), DEFAULT_PORT),
        }
    }
}

/// SQL Server source. Each call opens its own connection, so device and spatial
/// fetches for one source can run concurrently.
pub struct MssqlSource {
    source_id: String,
    config: Config,
}

impl MssqlSource {
    pub fn new(source_id: impl Into<String>, cred: &SourceCredential) -> Result<Self> {
        cred.validate()?;
        let (host, port) = cred.host_port();
        let mut config = Config::new();
        config.host(host);
        config.port(port);
        config.database(cred.dbname.clone());
        config.authentication(AuthMethod::sql_server(
            cred.username.clone(),
            cred.password.clone(),
        ));
        config.trust_cert();
        Ok(Self {
            source_id: source_id.into(),
            config,
        })
    }

    #[tracing::instrument(level = "debug", skip(self), fields(source_id = %self.source_id))]
    async fn connect(&self) -> Result<Client<Compat<TcpStream>>> {
        let tcp = TcpStream::connect(self.config.get_addr())
            .await
            .map_err(|e| Error::backend("mssql tcp connect", e))?;
        tcp.set_nodelay(true)
            .map_err(|e| Error::backend("mssql tcp nodelay", e))?;
        Client::connect(self.config.clone(), tcp.compat_write())
            .await
            .map_err(|e| Error::backend("mssql connect", e))
    }

    fn fetched_at(result_sets: &mut Vec<Vec<Row>>) -> DateTime<Utc> {
        result_sets
            .pop()
            .and_then(|set| set.into_iter().next())
            .and_then(|row| rows::timestamp(&row, "datafetchedon"))
            .unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl SourceDb for MssqlSource {
    #[tracing::instrument(level = "debug", skip(self, main_page_ids), fields(source_id = %self.source_id))]
    async fn fetch_devices(&self, main_page_ids: &str) -> Result<DeviceFetch> {
        let mut client = self.connect().await?;
        let mut sets = client
            .query(DEVICE_QUERY, &[&main_page_ids])
            .await
            .map_err(|e| Error::backend("GetIOTRegisteredDeviceData", e))?
            .into_results()
            .await
            .map_err(|e| Error::backend("GetIOTRegisteredDeviceData results", e))?;

        let fetched_at = Self::fetched_at(&mut sets);
        let mut devices = Vec::new();
        for row in sets.into_iter().next().unwrap_or_default() {
            match rows::device(&row) {
                Some(device) => devices.push(device),
                None => tracing::warn!(source_id = %self.source_id, "skipping device row without deviceid"),
            }
        }
        tracing::debug!(source_id = %self.source_id, devices = devices.len(), "device fetch done");
        Ok(DeviceFetch {
            devices,
            fetched_at,
        })
    }

    #[tracing::instrument(level = "debug", skip(self), fields(source_id = %self.source_id))]
    async fn fetch_spatial(&self) -> Result<SpatialBatch> {
        let mut client = self.connect().await?;
        let mut sets = client
            .query(SPATIAL_QUERY, &[])
            .await
            .map_err(|e| Error::backend("GetIOTSpatialData", e))?
            .into_results()
            .await
            .map_err(|e| Error::backend("GetIOTSpatialData results", e))?;

        let fetched_at = Self::fetched_at(&mut sets);
        let mut batch = SpatialBatch::empty(fetched_at);
        let mut sets = sets.into_iter();
        if let Some(set) = sets.next() {
            batch.geofences = set
                .iter()
                .filter_map(|r| rows::geofence(r, fetched_at))
                .collect();
        }
        if let Some(set) = sets.next() {
            batch.areas = set
                .iter()
                .filter_map(|r| rows::spatial_entity(r, "areauid", fetched_at))
                .collect();
        }
        if let Some(set) = sets.next() {
            batch.zones = set
                .iter()
                .filter_map(|r| rows::spatial_entity(r, "zoneuid", fetched_at))
                .collect();
        }
        if let Some(set) = sets.next() {
            batch.no_go_areas = set
                .iter()
                .filter_map(|r| rows::spatial_entity(r, "nogoareageofenceuid", fetched_at))
                .collect();
        }
        Ok(batch)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(source_id = %self.source_id))]
    async fn update_watermark(
        &self,
        devices: Option<DateTime<Utc>>,
        spatial: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = Utc::now();
        let device_date = devices.unwrap_or(now).naive_utc();
        let spatial_date = spatial.unwrap_or(now).naive_utc();
        let mut client = self.connect().await?;
        let mut sets = client
            .query(
                WATERMARK_QUERY,
                &[
                    &devices.is_some(),
                    &device_date,
                    &spatial.is_some(),
                    &spatial_date,
                ],
            )
            .await
            .map_err(|e| Error::backend("UpdIOTDataSyncFetchDate", e))?
            .into_results()
            .await
            .map_err(|e| Error::backend("UpdIOTDataSyncFetchDate status", e))?;
        let status = sets
            .pop()
            .and_then(|set| set.into_iter().next())
            .map(|row| rows::int(&row, "status", 0) != 0)
            .unwrap_or(false);
        Ok(status)
    }
}
