use crate::models::SpatialBatch;
use crate::onboard::traits::{GeoStatement, GeoStore, GeoTarget};

/// Queue one statement per entity: geofences, then areas, zones and no-go areas.
pub fn build_statements(batch: SpatialBatch) -> Vec<GeoStatement> {
    let mut out = Vec::with_capacity(batch.len());
    out.extend(
        batch
            .geofences
            .into_iter()
            .map(|g| GeoStatement::for_target(GeoTarget::Geofence(g))),
    );
    out.extend(
        batch
            .areas
            .into_iter()
            .map(|e| GeoStatement::for_target(GeoTarget::Area(e))),
    );
    out.extend(
        batch
            .zones
            .into_iter()
            .map(|e| GeoStatement::for_target(GeoTarget::Zone(e))),
    );
    out.extend(
        batch
            .no_go_areas
            .into_iter()
            .map(|e| GeoStatement::for_target(GeoTarget::NoGoArea(e))),
    );
    out
}

/// Commit the geospatial batch. Returns true when there was nothing to write or the
/// transaction succeeded.
#[tracing::instrument(level = "info", skip_all, fields(entities = batch.len()))]
pub async fn commit_spatial(geo: &dyn GeoStore, batch: SpatialBatch) -> bool {
    if batch.is_empty() {
        return true;
    }
    match geo.apply(build_statements(batch)).await {
        Ok(affected) => {
            tracing::info!(affected, "spatial batch committed");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "spatial batch rolled back");
            false
        }
    }
}
