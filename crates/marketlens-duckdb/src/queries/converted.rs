use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use marketlens_core::attribution::{AnalyzeType, AttributionQuery, ConversionInfo, KpiInfo};
use marketlens_core::collaborators::KpiExecutor;
use marketlens_core::config::EngineConfig;
use marketlens_core::query::QueryEventWithProperties;

use crate::backend::DuckDbBackend;
use crate::fragment::SqlFragment;
use crate::queries::filters::{compile_property_filters, PropertySource};

/// Look up the id of an event name for a project.
pub async fn get_event_name_id(
    db: &DuckDbBackend,
    project_id: &str,
    name: &str,
    config: &EngineConfig,
    request_id: &str,
) -> Result<Option<i64>> {
    let mut frag = SqlFragment::new();
    frag.push("SELECT id FROM event_names WHERE project_id = ");
    frag.push_bind(project_id);
    frag.push(" AND name = ");
    frag.push_bind(name);
    let ids = db
        .run_select(&frag, &config.app_tag, request_id, |row| row.get::<_, i64>(0))
        .await?;
    Ok(ids.into_iter().next())
}

/// First-occurrence timestamps per linked funnel event, keyed by
/// coalesced user id.
#[derive(Debug, Clone)]
pub struct LinkedEventConversions {
    pub name: String,
    pub conversions: HashMap<String, i64>,
}

/// Output of conversion resolution, shaped by the analyze mode.
#[derive(Debug, Clone)]
pub enum ResolvedConversions {
    Users {
        /// Earliest conversion per coalesced user id.
        conversions: HashMap<String, ConversionInfo>,
        /// Conversions of the comparison goal event, when configured.
        compare_conversions: Option<HashMap<String, ConversionInfo>>,
        user_to_coal: HashMap<String, String>,
        /// Every raw user that must have sessions pulled.
        raw_users: Vec<String>,
        linked: Vec<LinkedEventConversions>,
    },
    Kpi {
        kpis: Vec<KpiInfo>,
        user_to_coal: HashMap<String, String>,
        raw_users: Vec<String>,
    },
}

/// First-occurrence timestamp per raw user for one event under its own
/// filters.
async fn first_occurrences(
    db: &DuckDbBackend,
    project_id: &str,
    event: &QueryEventWithProperties,
    event_name_id: i64,
    from: i64,
    to: i64,
    config: &EngineConfig,
    request_id: &str,
) -> Result<HashMap<String, i64>> {
    let mut frag = SqlFragment::new();
    frag.push("SELECT events.user_id, MIN(events.timestamp) FROM events WHERE events.project_id = ");
    frag.push_bind(project_id);
    frag.push(" AND events.event_name_id = ");
    frag.push_bind(event_name_id);
    frag.push(" AND events.timestamp BETWEEN ");
    frag.push_bind(from);
    frag.push(" AND ");
    frag.push_bind(to);
    if !event.properties.is_empty() {
        let filters = compile_property_filters(&event.properties, &PropertySource::default())?;
        frag.push(" AND ");
        frag.append(filters);
    }
    frag.push(" GROUP BY events.user_id");

    let rows = db
        .run_select(&frag, &config.app_tag, request_id, |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .await?;
    Ok(rows.into_iter().collect())
}

/// Map raw user ids onto their coalesced (customer) ids, preferring the
/// customer id over the raw id. Chunked to the IN-clause batch size;
/// users absent from the users table keep their raw id.
pub async fn coalesce_user_ids(
    db: &DuckDbBackend,
    project_id: &str,
    users: &[String],
    config: &EngineConfig,
    request_id: &str,
) -> Result<HashMap<String, String>> {
    let mut mapping: HashMap<String, String> = HashMap::new();
    for chunk in users.chunks(config.user_batch_size.max(1)) {
        let mut frag = SqlFragment::new();
        frag.push(
            "SELECT id, COALESCE(NULLIF(customer_user_id, ''), id) FROM users WHERE project_id = ",
        );
        frag.push_bind(project_id);
        frag.push(" AND id IN ");
        frag.push_bind_list(chunk.iter().cloned());
        let rows = db
            .run_select(&frag, &config.app_tag, request_id, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .await?;
        mapping.extend(rows);
    }
    for user in users {
        mapping
            .entry(user.clone())
            .or_insert_with(|| user.clone());
    }
    Ok(mapping)
}

fn earliest_by_coal(
    raw: &HashMap<String, i64>,
    user_to_coal: &HashMap<String, String>,
) -> HashMap<String, i64> {
    let mut out: HashMap<String, i64> = HashMap::new();
    for (user, &ts) in raw {
        let coal = user_to_coal.get(user).cloned().unwrap_or_else(|| user.clone());
        out.entry(coal)
            .and_modify(|existing| *existing = (*existing).min(ts))
            .or_insert(ts);
    }
    out
}

async fn resolve_event_conversions(
    db: &DuckDbBackend,
    project_id: &str,
    event: &QueryEventWithProperties,
    from: i64,
    to: i64,
    config: &EngineConfig,
    request_id: &str,
) -> Result<HashMap<String, i64>> {
    let event_name_id = get_event_name_id(db, project_id, &event.name, config, request_id)
        .await?
        .ok_or_else(|| anyhow!("event {} not found", event.name))?;
    first_occurrences(
        db, project_id, event, event_name_id, from, to, config, request_id,
    )
    .await
}

/// Resolve who converted, per the query's analyze mode.
///
/// Users mode resolves the conversion goal and every linked funnel event
/// (each independently filtered), unions their users, and re-keys
/// everything onto coalesced ids. KPI modes delegate to the external KPI
/// executor and derive the user set from the KPI-carried user ids.
pub async fn resolve_converted_users(
    db: &Arc<DuckDbBackend>,
    kpi_executor: &dyn KpiExecutor,
    project_id: &str,
    query: &AttributionQuery,
    config: &EngineConfig,
    request_id: &str,
) -> Result<ResolvedConversions> {
    match query.analyze_type {
        AnalyzeType::Users => {
            let raw_conversions = resolve_event_conversions(
                db,
                project_id,
                &query.conversion_event,
                query.from,
                query.to,
                config,
                request_id,
            )
            .await?;

            let raw_compare = match &query.compare_event {
                Some(event) => Some(
                    resolve_event_conversions(
                        db, project_id, event, query.from, query.to, config, request_id,
                    )
                    .await?,
                ),
                None => None,
            };

            let mut raw_linked: Vec<(String, HashMap<String, i64>)> = Vec::new();
            for event in &query.linked_events {
                let occurrences = resolve_event_conversions(
                    db, project_id, event, query.from, query.to, config, request_id,
                )
                .await?;
                raw_linked.push((event.name.clone(), occurrences));
            }

            let mut all_users: HashSet<String> = raw_conversions.keys().cloned().collect();
            if let Some(compare) = &raw_compare {
                all_users.extend(compare.keys().cloned());
            }
            for (_, occurrences) in &raw_linked {
                all_users.extend(occurrences.keys().cloned());
            }
            let raw_users: Vec<String> = all_users.into_iter().collect();

            let user_to_coal =
                coalesce_user_ids(db, project_id, &raw_users, config, request_id).await?;

            let conversions = earliest_by_coal(&raw_conversions, &user_to_coal)
                .into_iter()
                .map(|(coal, ts)| (coal, ConversionInfo::at(ts)))
                .collect();
            let compare_conversions = raw_compare.map(|raw| {
                earliest_by_coal(&raw, &user_to_coal)
                    .into_iter()
                    .map(|(coal, ts)| (coal, ConversionInfo::at(ts)))
                    .collect()
            });
            let linked = raw_linked
                .into_iter()
                .map(|(name, occurrences)| LinkedEventConversions {
                    name,
                    conversions: earliest_by_coal(&occurrences, &user_to_coal),
                })
                .collect();

            info!(project_id, users = raw_users.len(), "resolved converted users");
            Ok(ResolvedConversions::Users {
                conversions,
                compare_conversions,
                user_to_coal,
                raw_users,
                linked,
            })
        }
        AnalyzeType::UserKpi | AnalyzeType::CrmKpi => {
            let kpis = match query.analyze_type {
                AnalyzeType::UserKpi => kpi_executor.execute_user_kpi(project_id, query).await?,
                _ => kpi_executor.execute_crm_kpi(project_id, query).await?,
            };
            let mut all_users: HashSet<String> = HashSet::new();
            for kpi in &kpis {
                all_users.extend(kpi.user_ids.iter().cloned());
            }
            let raw_users: Vec<String> = all_users.into_iter().collect();
            let user_to_coal =
                coalesce_user_ids(db, project_id, &raw_users, config, request_id).await?;
            info!(
                project_id,
                kpis = kpis.len(),
                users = raw_users.len(),
                "resolved KPI conversions"
            );
            Ok(ResolvedConversions::Kpi {
                kpis,
                user_to_coal,
                raw_users,
            })
        }
    }
}
