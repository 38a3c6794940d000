use anyhow::{anyhow, Result};

use marketlens_core::query::QueryProperty;

use crate::fragment::SqlFragment;
use crate::queries::filters::{compile_property_filters, PropertySource};

/// A named query step, reusable by later steps in the same statement.
#[derive(Debug, Clone)]
pub struct QueryStep {
    pub name: String,
    pub fragment: SqlFragment,
}

/// Accumulates named steps and renders them as one `WITH ... SELECT`
/// statement. Step names are generated internally and never carry user
/// input.
#[derive(Debug, Default)]
pub struct StepBuilder {
    steps: Vec<QueryStep>,
}

impl StepBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_step(&mut self, name: &str, fragment: SqlFragment) {
        self.steps.push(QueryStep {
            name: name.to_string(),
            fragment,
        });
    }

    pub fn has_steps(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Render `WITH s1 AS (...), s2 AS (...) <final_select>`.
    pub fn build(self, final_select: SqlFragment) -> SqlFragment {
        let mut out = SqlFragment::new();
        if !self.steps.is_empty() {
            out.push("WITH ");
            for (i, step) in self.steps.into_iter().enumerate() {
                if i > 0 {
                    out.push(", ");
                }
                out.push(&step.name);
                out.push(" AS (");
                out.append(step.fragment);
                out.push(")");
            }
            out.push(" ");
        }
        out.append(final_select);
        out
    }
}

/// How the step narrows to its event: by resolving names in a lookup
/// step, or by a direct id list when the caller already knows the ids and
/// wants to skip the join.
#[derive(Debug, Clone)]
pub enum EventNameResolution {
    ByName(String),
    ByIds(Vec<i64>),
}

/// Feature toggles for the denormalized JSON projections. Each toggle
/// holds the timestamp its projection is backfilled from; queries that
/// start earlier must keep reading the legacy columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionToggles {
    pub events_optimized_from: Option<i64>,
    pub users_optimized_from: Option<i64>,
}

impl ProjectionToggles {
    pub fn events_active(&self, query_from: i64) -> bool {
        matches!(self.events_optimized_from, Some(cutoff) if query_from >= cutoff)
    }

    pub fn users_active(&self, query_from: i64) -> bool {
        matches!(self.users_optimized_from, Some(cutoff) if query_from >= cutoff)
    }
}

/// Inputs for one event query step.
#[derive(Debug, Clone)]
pub struct EventStepParams {
    pub step_name: String,
    /// Rendered select list (aliases are internal identifiers).
    pub select: String,
    pub project_id: String,
    pub from: i64,
    pub to: i64,
    pub resolution: EventNameResolution,
    pub event_filters: Vec<QueryProperty>,
    /// Cross-event user filters, appended with AND after the event
    /// filters.
    pub global_user_filters: Vec<QueryProperty>,
    pub toggles: ProjectionToggles,
    pub group_by: Option<String>,
    pub order_by: Option<String>,
}

/// Compose one query step over the events table:
/// `SELECT <select> FROM events [joins] WHERE project AND time range AND
/// event-name AND filters [GROUP BY] [ORDER BY]`.
pub fn build_event_step(params: &EventStepParams) -> Result<(String, SqlFragment)> {
    if params.from <= 0 || params.to <= 0 || params.from > params.to {
        return Err(anyhow!("invalid timerange on events filter"));
    }
    if params.select.trim().is_empty() {
        return Err(anyhow!("invalid select on events filter"));
    }

    let events_opt = params.toggles.events_active(params.from);
    let users_opt = params.toggles.users_active(params.from);
    let source = PropertySource {
        event_properties: if events_opt {
            "ep.properties"
        } else {
            "events.properties"
        },
        user_properties: if users_opt {
            "up.properties"
        } else {
            "events.user_properties"
        },
    };

    let mut frag = SqlFragment::new();
    frag.push("SELECT ");
    frag.push(&params.select);
    frag.push(" FROM events");
    if events_opt {
        frag.push(
            " JOIN event_properties ep ON ep.event_id = events.id \
             AND ep.user_id = events.user_id AND ep.project_id = events.project_id",
        );
    }
    if users_opt {
        frag.push(" JOIN user_properties_snapshots up ON up.event_id = events.id");
    }

    frag.push(" WHERE events.project_id = ");
    frag.push_bind(params.project_id.clone());
    frag.push(" AND events.timestamp BETWEEN ");
    frag.push_bind(params.from);
    frag.push(" AND ");
    frag.push_bind(params.to);

    match &params.resolution {
        EventNameResolution::ByName(name) => {
            // Resolved through the name-lookup step added by the caller.
            frag.push(&format!(
                " AND events.event_name_id IN (SELECT id FROM {}_names)",
                params.step_name
            ));
            debug_assert!(!name.is_empty());
        }
        EventNameResolution::ByIds(ids) => {
            frag.push(" AND events.event_name_id IN ");
            frag.push_bind_list(ids.iter().copied());
        }
    }

    if !params.event_filters.is_empty() {
        let filters = compile_property_filters(&params.event_filters, &source)?;
        frag.push(" AND ");
        frag.append(filters);
    }
    if !params.global_user_filters.is_empty() {
        let filters = compile_property_filters(&params.global_user_filters, &source)?;
        frag.push(" AND ");
        frag.append(filters);
    }

    if let Some(group_by) = &params.group_by {
        frag.push(" GROUP BY ");
        frag.push(group_by);
    }
    if let Some(order_by) = &params.order_by {
        frag.push(" ORDER BY ");
        frag.push(order_by);
    }

    Ok((params.step_name.clone(), frag))
}

/// The name-lookup step paired with [`EventNameResolution::ByName`]:
/// `<step>_names AS (SELECT id FROM event_names WHERE project AND name)`.
pub fn build_name_lookup_step(step_name: &str, project_id: &str, event_name: &str) -> (String, SqlFragment) {
    let mut frag = SqlFragment::new();
    frag.push("SELECT id FROM event_names WHERE project_id = ");
    frag.push_bind(project_id);
    frag.push(" AND name = ");
    frag.push_bind(event_name);
    (format!("{step_name}_names"), frag)
}
