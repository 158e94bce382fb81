//! Per-command service ordering.

use crate::service::ServicePlatformInfo;
use crate::types::{Command, ServiceName};

/// Least critical first, so user-facing services come back before the data
/// they sit on is touched.
pub const RESTORE_ORDER: [ServiceName; 6] = [
    ServiceName::Frontend,
    ServiceName::Agent,
    ServiceName::Mcp,
    ServiceName::Backend,
    ServiceName::Filesystem,
    ServiceName::Database,
];

/// Fixed order for `command`, or `None` when it runs in resolution order.
pub fn order_for(command: Command) -> Option<Vec<ServiceName>> {
    match command {
        Command::Restore => Some(RESTORE_ORDER.to_vec()),
        Command::Stop | Command::Backup => Some(RESTORE_ORDER.iter().rev().copied().collect()),
        _ => None,
    }
}

/// Reorder resolved services for `command`. Commands with a fixed order
/// walk that order and pick matching services, so a name outside it is
/// dropped rather than run.
pub fn apply(command: Command, services: Vec<ServicePlatformInfo>) -> Vec<ServicePlatformInfo> {
    let Some(order) = order_for(command) else {
        return services;
    };
    for dropped in services
        .iter()
        .filter(|s| !order.iter().any(|n| n.as_str() == s.name))
    {
        tracing::debug!(%command, service = %dropped.name, "not in command order; skipped");
    }
    order
        .iter()
        .filter_map(|name| services.iter().find(|s| s.name == name.as_str()).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;

    fn infos(names: &[&str]) -> Vec<ServicePlatformInfo> {
        names
            .iter()
            .map(|n| ServicePlatformInfo {
                name: n.to_string(),
                platform: Platform::Mock,
                config: serde_json::json!({}),
            })
            .collect()
    }

    fn names(infos: &[ServicePlatformInfo]) -> Vec<&str> {
        infos.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn restore_runs_least_critical_first() {
        let ordered = apply(Command::Restore, infos(&["database", "backend", "frontend"]));
        assert_eq!(names(&ordered), vec!["frontend", "backend", "database"]);
    }

    #[test]
    fn stop_and_backup_run_in_reverse() {
        let ordered = apply(Command::Stop, infos(&["frontend", "database", "backend"]));
        assert_eq!(names(&ordered), vec!["database", "backend", "frontend"]);
        let ordered = apply(Command::Backup, infos(&["filesystem", "database"]));
        assert_eq!(names(&ordered), vec!["database", "filesystem"]);
    }

    #[test]
    fn unordered_commands_keep_resolution_order() {
        let ordered = apply(Command::Start, infos(&["database", "worker", "backend"]));
        assert_eq!(names(&ordered), vec!["database", "worker", "backend"]);
    }

    #[test]
    fn ordered_commands_drop_unknown_names() {
        let ordered = apply(Command::Restore, infos(&["worker", "database"]));
        assert_eq!(names(&ordered), vec!["database"]);
    }
}
