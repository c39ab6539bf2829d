// ABOUTME: Seeds the local cache with recently completed jobs from the server.
// ABOUTME: Rate-limited by the hydration interval; deduplicated by job id and server id.

use std::collections::{BTreeSet, HashMap, HashSet};

use fieldlog_sync::{job_from_server, recent_jobs};
use serde::Serialize;

use crate::engine::{Engine, EngineState};
use crate::error::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HydrateReport {
    /// Jobs in the server response.
    pub fetched: usize,
    pub cached: usize,
    pub duplicates: usize,
    /// Entries without a usable id or field id.
    pub invalid: usize,
    /// No fetch happened: rate-limited or no fields to ask about.
    pub skipped: bool,
}

impl Engine {
    /// Pull recent server jobs for `field_ids` into the cache. An empty list
    /// means every field the engine knows about. Unless `force` is set, runs
    /// at most once per hydration interval.
    pub async fn hydrate(&self, field_ids: &[String], force: bool) -> Result<HydrateReport, EngineError> {
        let fields = {
            let state = self.inner.state.lock().await;
            state.ensure_initialized()?;
            let now = self.now_ms();
            if !force
                && let Some(last) = state.meta.last_hydration
                && now.saturating_sub(last) < self.inner.config.hydration_interval_ms()
            {
                tracing::debug!(last_hydration = last, "hydration ran recently, skipping");
                return Ok(HydrateReport {
                    skipped: true,
                    ..HydrateReport::default()
                });
            }
            if field_ids.is_empty() {
                known_fields(&state)
            } else {
                field_ids.to_vec()
            }
        };
        if fields.is_empty() {
            tracing::debug!("no fields to hydrate");
            return Ok(HydrateReport {
                skipped: true,
                ..HydrateReport::default()
            });
        }

        let response = self.inner.transport.fetch_recent(&fields).await?;
        if !response.is_success() {
            tracing::warn!(status = response.status, "hydration request rejected");
            return Err(EngineError::Hydration {
                status: response.status,
            });
        }

        let now = self.now_ms();
        let ttl = self.inner.config.cache_ttl_ms();
        let incoming = recent_jobs(&response.body);
        let mut report = HydrateReport {
            fetched: incoming.len(),
            ..HydrateReport::default()
        };

        let mut state = self.inner.state.lock().await;
        let mut server_ids: HashMap<String, HashSet<String>> = HashMap::new();
        for value in incoming {
            let Some(job) = job_from_server(value, now, ttl) else {
                report.invalid += 1;
                continue;
            };
            if state.index.contains(job.id()) {
                report.duplicates += 1;
                continue;
            }
            if !server_ids.contains_key(job.field_id()) {
                let known = self.server_ids_for(&state, job.field_id()).await?;
                server_ids.insert(job.field_id().to_string(), known);
            }
            if server_ids
                .get(job.field_id())
                .is_some_and(|known| known.contains(job.id()))
            {
                report.duplicates += 1;
                continue;
            }
            self.cache_job_locked(&mut state, &job).await?;
            report.cached += 1;
        }

        state.meta.last_hydration = Some(now);
        self.persist_meta(&state).await?;
        self.sweep_expired(&mut state).await?;

        tracing::info!(
            fields = fields.len(),
            fetched = report.fetched,
            cached = report.cached,
            duplicates = report.duplicates,
            invalid = report.invalid,
            "hydration finished"
        );
        Ok(report)
    }

    /// Server ids of jobs already cached for `field_id`.
    async fn server_ids_for(
        &self,
        state: &EngineState,
        field_id: &str,
    ) -> Result<HashSet<String>, EngineError> {
        let jobs = self.load_jobs(state.index.for_field(field_id)).await?;
        Ok(jobs
            .into_iter()
            .filter_map(|job| job.cache.server_job_id)
            .collect())
    }
}

fn known_fields(state: &EngineState) -> Vec<String> {
    let mut fields: BTreeSet<String> = state.index.field_ids().into_iter().collect();
    fields.extend(state.active.keys().cloned());
    fields.into_iter().collect()
}
