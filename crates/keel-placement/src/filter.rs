//! Scheduling filters.
//!
//! Each filter is a pure predicate over (offer resources, host attributes,
//! task, context). A veto names the filter and says why. The chain accepts a
//! task only if no filter vetoes, so the decision does not depend on order.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use keel_core::{ConstraintKind, HostAttributes, Resources, Task};

/// Why a filter rejected a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Veto {
    pub filter: &'static str,
    pub reason: String,
}

impl Veto {
    fn new(filter: &'static str, reason: impl Into<String>) -> Self {
        Self {
            filter,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Veto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.filter, self.reason)
    }
}

/// Cluster facts a filter may need beyond the offer itself.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    /// Attributes of the host under each active task of the candidate's job,
    /// one entry per task.
    pub job_placements: Vec<Arc<HostAttributes>>,
}

impl FilterContext {
    /// Active tasks of the job on hosts whose `attribute` includes `value`.
    pub fn count_with(&self, attribute: &str, value: &str) -> u32 {
        self.job_placements
            .iter()
            .filter(|host| host.values(attribute).contains(value))
            .count() as u32
    }
}

pub trait PlacementFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(
        &self,
        offer: &Resources,
        host: &HostAttributes,
        task: &Task,
        ctx: &FilterContext,
    ) -> Result<(), Veto>;
}

// ── Filters ────────────────────────────────────────────────────────

/// The offer must cover the task's resource request.
pub struct ResourceFilter;

impl PlacementFilter for ResourceFilter {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn check(&self, offer: &Resources, _host: &HostAttributes, task: &Task, _ctx: &FilterContext) -> Result<(), Veto> {
        let want = &task.config.resources;
        if offer.cpus < want.cpus {
            return Err(Veto::new(self.name(), format!("insufficient cpus: {} < {}", offer.cpus, want.cpus)));
        }
        if offer.ram_mb < want.ram_mb {
            return Err(Veto::new(self.name(), format!("insufficient ram: {} < {} MB", offer.ram_mb, want.ram_mb)));
        }
        if offer.disk_mb < want.disk_mb {
            return Err(Veto::new(self.name(), format!("insufficient disk: {} < {} MB", offer.disk_mb, want.disk_mb)));
        }
        if offer.ports < want.ports {
            return Err(Veto::new(self.name(), format!("insufficient ports: {} < {}", offer.ports, want.ports)));
        }
        Ok(())
    }
}

/// Value and limit constraints against host attributes.
pub struct ConstraintFilter;

impl PlacementFilter for ConstraintFilter {
    fn name(&self) -> &'static str {
        "constraints"
    }

    fn check(&self, _offer: &Resources, host: &HostAttributes, task: &Task, ctx: &FilterContext) -> Result<(), Veto> {
        for constraint in &task.config.constraints {
            let host_values = host.values(&constraint.attribute);
            match &constraint.kind {
                ConstraintKind::Value { negated, values } => {
                    let matched = host_values.iter().any(|v| values.contains(v));
                    if matched == *negated {
                        let verb = if *negated { "must not be" } else { "must be" };
                        return Err(Veto::new(
                            self.name(),
                            format!("{} {verb} one of {values:?}", constraint.attribute),
                        ));
                    }
                }
                ConstraintKind::Limit { limit } => {
                    if host_values.is_empty() {
                        return Err(Veto::new(
                            self.name(),
                            format!("host has no {} attribute", constraint.attribute),
                        ));
                    }
                    for value in &host_values {
                        let count = ctx.count_with(&constraint.attribute, value);
                        if count >= *limit {
                            return Err(Veto::new(
                                self.name(),
                                format!("limit {limit} reached for {}={value}", constraint.attribute),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Hosts that are draining or drained take no new work.
pub struct MaintenanceFilter;

impl PlacementFilter for MaintenanceFilter {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    fn check(&self, _offer: &Resources, host: &HostAttributes, _task: &Task, _ctx: &FilterContext) -> Result<(), Veto> {
        if host.mode.blocks_scheduling() {
            return Err(Veto::new(self.name(), format!("host is {}", host.mode)));
        }
        Ok(())
    }
}

// ── Chain ──────────────────────────────────────────────────────────

pub struct SchedulingFilter {
    filters: Vec<Box<dyn PlacementFilter>>,
}

impl SchedulingFilter {
    pub fn new(filters: Vec<Box<dyn PlacementFilter>>) -> Self {
        Self { filters }
    }

    /// Maintenance, resources, then constraints. Cheap checks first.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(MaintenanceFilter),
            Box::new(ResourceFilter),
            Box::new(ConstraintFilter),
        ])
    }

    /// First veto, if any.
    pub fn filter(
        &self,
        offer: &Resources,
        host: &HostAttributes,
        task: &Task,
        ctx: &FilterContext,
    ) -> Result<(), Veto> {
        for f in &self.filters {
            f.check(offer, host, task, ctx)?;
        }
        Ok(())
    }

    /// Every veto, for diagnostics.
    pub fn vetoes(&self, offer: &Resources, host: &HostAttributes, task: &Task, ctx: &FilterContext) -> Vec<Veto> {
        self.filters
            .iter()
            .filter_map(|f| f.check(offer, host, task, ctx).err())
            .collect()
    }
}

impl Default for SchedulingFilter {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Constraint, JobKey, MaintenanceMode, TaskConfig, TaskState};

    fn task_with(resources: Resources, constraints: Vec<Constraint>) -> Task {
        let mut config = TaskConfig::new(resources);
        config.constraints = constraints;
        Task {
            id: "t1".into(),
            job: JobKey::new("www", "prod", "api"),
            instance: 0,
            state: TaskState::Pending,
            assigned_host: None,
            config,
            failure_count: 0,
            history: Vec::new(),
            version: 1,
            retain_until: None,
        }
    }

    fn small() -> Resources {
        Resources::new(1.0, 512, 512, 1)
    }

    fn offer() -> Resources {
        Resources::new(4.0, 4096, 10_000, 4)
    }

    #[test]
    fn accepts_fitting_task() {
        let host = HostAttributes::new("host-a");
        let task = task_with(small(), vec![]);
        assert!(SchedulingFilter::standard()
            .filter(&offer(), &host, &task, &FilterContext::default())
            .is_ok());
    }

    #[test]
    fn resource_veto_names_dimension() {
        let host = HostAttributes::new("host-a");
        let task = task_with(Resources::new(1.0, 8192, 1, 0), vec![]);
        let veto = SchedulingFilter::standard()
            .filter(&offer(), &host, &task, &FilterContext::default())
            .unwrap_err();
        assert_eq!(veto.filter, "resources");
        assert!(veto.reason.contains("ram"));
    }

    #[test]
    fn value_constraint_and_negation() {
        let host = HostAttributes::new("host-a").with_attribute("zone", "east");
        let ctx = FilterContext::default();

        let want_east = task_with(small(), vec![Constraint::value("zone", &["east", "north"])]);
        let want_west = task_with(small(), vec![Constraint::value("zone", &["west"])]);
        let avoid_east = task_with(small(), vec![Constraint::not_value("zone", &["east"])]);
        let on_host = task_with(small(), vec![Constraint::value("host", &["host-a"])]);

        assert!(ConstraintFilter.check(&offer(), &host, &want_east, &ctx).is_ok());
        assert!(ConstraintFilter.check(&offer(), &host, &want_west, &ctx).is_err());
        assert!(ConstraintFilter.check(&offer(), &host, &avoid_east, &ctx).is_err());
        assert!(ConstraintFilter.check(&offer(), &host, &on_host, &ctx).is_ok());
    }

    #[test]
    fn limit_constraint_counts_job_placements() {
        let rack1 = Arc::new(HostAttributes::new("host-a").with_attribute("rack", "r1"));
        let rack2 = Arc::new(HostAttributes::new("host-b").with_attribute("rack", "r2"));
        let task = task_with(small(), vec![Constraint::limit("rack", 1)]);
        let ctx = FilterContext {
            job_placements: vec![rack1.clone()],
        };

        let veto = ConstraintFilter.check(&offer(), &rack1, &task, &ctx).unwrap_err();
        assert!(veto.reason.contains("r1"));
        assert!(ConstraintFilter.check(&offer(), &rack2, &task, &ctx).is_ok());

        // A host without the attribute cannot satisfy a limit on it.
        let bare = HostAttributes::new("host-c");
        assert!(ConstraintFilter.check(&offer(), &bare, &task, &ctx).is_err());
    }

    #[test]
    fn draining_and_drained_hosts_are_vetoed() {
        let task = task_with(small(), vec![]);
        for (mode, vetoed) in [
            (MaintenanceMode::None, false),
            (MaintenanceMode::Scheduled, false),
            (MaintenanceMode::Draining, true),
            (MaintenanceMode::Drained, true),
        ] {
            let mut host = HostAttributes::new("host-a");
            host.mode = mode;
            let result = SchedulingFilter::standard().filter(&offer(), &host, &task, &FilterContext::default());
            assert_eq!(result.is_err(), vetoed, "{mode}");
        }
    }

    #[test]
    fn decision_is_order_independent() {
        let mut host = HostAttributes::new("host-a").with_attribute("zone", "east");
        host.mode = MaintenanceMode::Draining;
        let task = task_with(Resources::new(64.0, 1, 1, 0), vec![Constraint::value("zone", &["west"])]);
        let ctx = FilterContext::default();

        let forward = SchedulingFilter::standard();
        let reverse = SchedulingFilter::new(vec![
            Box::new(ConstraintFilter),
            Box::new(ResourceFilter),
            Box::new(MaintenanceFilter),
        ]);
        assert!(forward.filter(&offer(), &host, &task, &ctx).is_err());
        assert!(reverse.filter(&offer(), &host, &task, &ctx).is_err());

        let all = forward.vetoes(&offer(), &host, &task, &ctx);
        let names: Vec<_> = all.iter().map(|v| v.filter).collect();
        assert_eq!(names, vec!["maintenance", "resources", "constraints"]);
        assert_eq!(reverse.vetoes(&offer(), &host, &task, &ctx).len(), 3);
    }

    #[test]
    fn veto_serializes() {
        let veto = Veto::new("maintenance", "host is DRAINING");
        let json = serde_json::to_value(&veto).unwrap();
        assert_eq!(json["filter"], "maintenance");
        assert_eq!(veto.to_string(), "maintenance: host is DRAINING");
    }
}
