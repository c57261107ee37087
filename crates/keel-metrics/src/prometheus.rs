//! Prometheus text exposition format.
//!
//! Renders a [`TaskVarsSnapshot`] and per-role quota usage for scraping by
//! a Prometheus server or compatible agent.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::quota::RoleUsage;
use crate::task_vars::TaskVarsSnapshot;

/// Render task lifecycle counters into Prometheus text format.
pub fn render_prometheus(snapshot: &TaskVarsSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP keel_scheduler_leader Whether this replica is the active scheduler.\n");
    out.push_str("# TYPE keel_scheduler_leader gauge\n");
    let _ = writeln!(out, "keel_scheduler_leader {}", u8::from(snapshot.leader));

    out.push_str("# HELP keel_tasks Tasks in the live table by state.\n");
    out.push_str("# TYPE keel_tasks gauge\n");
    for (state, count) in &snapshot.tasks_by_state {
        let _ = writeln!(out, "keel_tasks{{state=\"{state}\"}} {count}");
    }

    out.push_str("# HELP keel_tasks_lost_total Tasks lost per host.\n");
    out.push_str("# TYPE keel_tasks_lost_total counter\n");
    for (host, count) in &snapshot.lost_by_host {
        let _ = writeln!(out, "keel_tasks_lost_total{{host=\"{}\"}} {count}", escape(host));
    }

    out.push_str("# HELP keel_task_transitions_total Committed task transitions.\n");
    out.push_str("# TYPE keel_task_transitions_total counter\n");
    let _ = writeln!(out, "keel_task_transitions_total {}", snapshot.transitions_total);

    out.push_str("# HELP keel_host_maintenance Hosts in maintenance by mode.\n");
    out.push_str("# TYPE keel_host_maintenance gauge\n");
    for (host, mode) in &snapshot.host_modes {
        let _ = writeln!(out, "keel_host_maintenance{{host=\"{}\",mode=\"{mode}\"}} 1", escape(host));
    }

    out
}

/// Render per-role resources held by active tasks.
pub fn render_quota(usage: &BTreeMap<String, RoleUsage>) -> String {
    let mut out = String::new();

    out.push_str("# HELP keel_quota_tasks Active tasks per role.\n");
    out.push_str("# TYPE keel_quota_tasks gauge\n");
    for (role, u) in usage {
        let _ = writeln!(out, "keel_quota_tasks{{role=\"{}\"}} {}", escape(role), u.tasks);
    }

    out.push_str("# HELP keel_quota_cpus CPUs held by active tasks per role.\n");
    out.push_str("# TYPE keel_quota_cpus gauge\n");
    for (role, u) in usage {
        let _ = writeln!(out, "keel_quota_cpus{{role=\"{}\"}} {}", escape(role), u.resources.cpus);
    }

    out.push_str("# HELP keel_quota_ram_mb RAM held by active tasks per role.\n");
    out.push_str("# TYPE keel_quota_ram_mb gauge\n");
    for (role, u) in usage {
        let _ = writeln!(out, "keel_quota_ram_mb{{role=\"{}\"}} {}", escape(role), u.resources.ram_mb);
    }

    out.push_str("# HELP keel_quota_disk_mb Disk held by active tasks per role.\n");
    out.push_str("# TYPE keel_quota_disk_mb gauge\n");
    for (role, u) in usage {
        let _ = writeln!(out, "keel_quota_disk_mb{{role=\"{}\"}} {}", escape(role), u.resources.disk_mb);
    }

    out
}

/// Label values escape backslash, double quote, and newline.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
