use crate::onboard::config::PostgresConfig;
use crate::onboard::traits::{GeoCategory, GeoOp, GeoStatement, GeoStore, GeoTarget};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};

const MAX_CONNECTIONS: u32 = 4;

/// PostGIS master tables for geofences, areas, zones and no-go areas.
#[derive(Clone)]
pub struct PgGeoStore {
    pool: PgPool,
}

impl PgGeoStore {
    /// Connect to the first reachable host of the configured list.
    #[tracing::instrument(level = "debug", skip(cfg), fields(db = %cfg.db_name))]
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let mut last_err = None;
        for host in cfg.host_list() {
            let options = PgConnectOptions::new()
                .host(&host)
                .port(cfg.port)
                .username(&cfg.username)
                .password(&cfg.password)
                .database(&cfg.db_name);
            match PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .connect_with(options)
                .await
            {
                Ok(pool) => {
                    tracing::info!(%host, "postgres connected");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    tracing::warn!(%host, error = %e, "postgres host unreachable");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => Error::backend("connect postgres", e),
            None => Error::InvalidInput("PGSHOSTS has no usable host".to_string()),
        })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn upsert_sql(category: GeoCategory) -> String {
    let table = category.table();
    let uid = category.uid_column();
    match category {
        GeoCategory::Geofence => format!(
            "INSERT INTO {table} (tenantuid, tenantgroupuid, {uid}, geofencenameen, geofencenameol, \
             geofencetypeid, isapproved, active, lastmodifieddate, ogr_geometry, ogr_geography, createdon) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, ST_GeomFromText($10, 4326), ST_GeographyFromText($10), $11) \
             ON CONFLICT ON CONSTRAINT {table}_pkey DO UPDATE SET \
             geofencenameen = excluded.geofencenameen, geofencenameol = excluded.geofencenameol, \
             geofencetypeid = excluded.geofencetypeid, isapproved = excluded.isapproved, \
             active = excluded.active, lastmodifieddate = excluded.lastmodifieddate, \
             ogr_geometry = excluded.ogr_geometry, ogr_geography = excluded.ogr_geography, \
             modifiedon = excluded.createdon"
        ),
        _ => format!(
            "INSERT INTO {table} (tenantuid, tenantgroupuid, {uid}, active, lastmodifieddate, \
             ogr_geometry, ogr_geography, createdon) \
             VALUES ($1, $2, $3, $4, $5, ST_GeomFromText($6, 4326), ST_GeographyFromText($6), $7) \
             ON CONFLICT ON CONSTRAINT {table}_pkey DO UPDATE SET \
             active = excluded.active, lastmodifieddate = excluded.lastmodifieddate, \
             ogr_geometry = excluded.ogr_geometry, ogr_geography = excluded.ogr_geography, \
             modifiedon = excluded.createdon"
        ),
    }
}

fn clear_sql(category: GeoCategory) -> String {
    format!(
        "UPDATE {table} SET active = $1, lastmodifieddate = $2, ogr_geometry = NULL, \
         ogr_geography = NULL, modifiedon = $6 \
         WHERE tenantuid = $3 AND tenantgroupuid = $4 AND {uid} = $5",
        table = category.table(),
        uid = category.uid_column(),
    )
}

fn bind<'q>(sql: &'q str, stmt: &'q GeoStatement, now: DateTime<Utc>) -> Query<'q, Postgres, PgArguments> {
    let e = stmt.target.entity();
    let geometry = e.geometry.as_deref().map(str::trim).unwrap_or_default();
    match (stmt.op, &stmt.target) {
        (GeoOp::Clear, _) => sqlx::query(sql)
            .bind(e.active)
            .bind(e.last_modified)
            .bind(&e.tenant_uid)
            .bind(&e.tenant_group_uid)
            .bind(&e.entity_uid)
            .bind(now),
        (GeoOp::Upsert, GeoTarget::Geofence(g)) => sqlx::query(sql)
            .bind(&e.tenant_uid)
            .bind(&e.tenant_group_uid)
            .bind(&e.entity_uid)
            .bind(&g.name_en)
            .bind(&g.name_ol)
            .bind(g.type_id)
            .bind(g.is_approved)
            .bind(e.active)
            .bind(e.last_modified)
            .bind(geometry)
            .bind(now),
        (GeoOp::Upsert, _) => sqlx::query(sql)
            .bind(&e.tenant_uid)
            .bind(&e.tenant_group_uid)
            .bind(&e.entity_uid)
            .bind(e.active)
            .bind(e.last_modified)
            .bind(geometry)
            .bind(now),
    }
}

#[async_trait]
impl GeoStore for PgGeoStore {
    #[tracing::instrument(level = "debug", skip(self, statements), fields(statements = statements.len()))]
    async fn apply(&self, statements: Vec<GeoStatement>) -> Result<u64> {
        if statements.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend("begin geo transaction", e))?;

        let mut affected = 0u64;
        for (idx, stmt) in statements.iter().enumerate() {
            let category = stmt.target.category();
            let sql = match stmt.op {
                GeoOp::Upsert => upsert_sql(category),
                GeoOp::Clear => clear_sql(category),
            };
            match bind(&sql, stmt, now).execute(&mut *tx).await {
                Ok(res) => affected += res.rows_affected(),
                Err(e) => {
                    tracing::error!(
                        index = idx,
                        ?category,
                        uid = %stmt.target.entity().entity_uid,
                        error = %e,
                        "geo statement failed, rolling back"
                    );
                    if let Err(rb) = tx.rollback().await {
                        tracing::error!(error = %rb, "geo rollback failed");
                    }
                    return Err(Error::backend("geo statement", e));
                }
            }
        }

        if affected > 0 {
            tx.commit()
                .await
                .map_err(|e| Error::backend("commit geo transaction", e))?;
        } else {
            tx.rollback()
                .await
                .map_err(|e| Error::backend("rollback empty geo transaction", e))?;
        }
        Ok(affected)
    }
}
