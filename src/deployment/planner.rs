//! Desired vs. actual deployment unit planning.
//!
//! The planner sorts the current units of a service group into bad,
//! incomplete and unhealthy sets, and decides which units to start and
//! which surplus units to drop to reach each service's scale.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashSet;
use tracing::debug;

use super::unit::DeploymentUnit;
use crate::config::ConfigHasher;
use crate::state::Service;

/// Units the start phase acts on.
#[derive(Debug, Default)]
pub struct DeployPlan {
    /// Units to create or start, existing units first.
    pub start: Vec<DeploymentUnit>,
    /// Surplus units to remove.
    pub remove: Vec<DeploymentUnit>,
}

/// Plans a reconciliation pass for a service group.
#[derive(Debug)]
pub struct ServiceDeploymentPlanner {
    services: Vec<Service>,
    healthy: Vec<DeploymentUnit>,
    bad: Vec<DeploymentUnit>,
    incomplete: Vec<DeploymentUnit>,
    unhealthy: Vec<DeploymentUnit>,
    initializing: bool,
}

impl ServiceDeploymentPlanner {
    /// Classifies the units of `services` as of `now`.
    #[must_use]
    pub fn new(
        services: Vec<Service>,
        units: Vec<DeploymentUnit>,
        hasher: &ConfigHasher,
        now: DateTime<Utc>,
        default_grace_secs: u64,
    ) -> Self {
        let mut planner = Self {
            services,
            healthy: Vec::new(),
            bad: Vec::new(),
            incomplete: Vec::new(),
            unhealthy: Vec::new(),
            initializing: false,
        };

        for unit in units {
            planner.initializing |= unit.is_health_check_initializing(now, default_grace_secs);

            if unit.is_bad(hasher) {
                planner.bad.push(unit);
                continue;
            }
            if unit.is_incomplete() {
                planner.incomplete.push(unit.clone());
            }
            if unit.is_unhealthy(now, default_grace_secs) {
                planner.unhealthy.push(unit.clone());
            }
            planner.healthy.push(unit);
        }

        debug!(
            "Planned {} unit(s): {} bad, {} incomplete, {} unhealthy",
            planner.healthy.len() + planner.bad.len(),
            planner.bad.len(),
            planner.incomplete.len(),
            planner.unhealthy.len()
        );
        planner
    }

    /// Services being planned.
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Units that no longer match any desired shape.
    #[must_use]
    pub fn bad_units(&self) -> &[DeploymentUnit] {
        &self.bad
    }

    /// Units missing members.
    #[must_use]
    pub fn incomplete_units(&self) -> &[DeploymentUnit] {
        &self.incomplete
    }

    /// Units failing health checks past their grace window.
    #[must_use]
    pub fn unhealthy_units(&self) -> &[DeploymentUnit] {
        &self.unhealthy
    }

    /// Returns true if any unit is still inside its health check grace
    /// window.
    #[must_use]
    pub const fn is_health_check_initializing(&self) -> bool {
        self.initializing
    }

    /// Returns true if structure, health or scale has drifted.
    #[must_use]
    pub fn need_to_reconcile_deployment(&self) -> bool {
        if !self.bad.is_empty() || !self.incomplete.is_empty() || !self.unhealthy.is_empty() {
            return true;
        }
        if self.healthy.iter().any(|u| !u.is_started()) {
            return true;
        }
        self.services.iter().any(|service| {
            let count = self.healthy.iter().filter(|u| u.service_id() == service.id).count();
            count != service.scale as usize
        })
    }

    /// Brings every service to its scale.
    ///
    /// Missing units are added as empty units. Surplus units are dropped
    /// unhealthy first, then not fully started, then highest ordinal.
    pub fn deploy(&mut self) -> DeployPlan {
        let unhealthy: HashSet<String> = self.unhealthy.iter().map(|u| u.uuid().to_string()).collect();
        let mut plan = DeployPlan::default();
        let mut created = Vec::new();

        for service in &self.services {
            let scale = service.scale as usize;
            let (mut own, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.healthy)
                .into_iter()
                .partition(|u| u.service_id() == service.id);
            self.healthy = rest;

            if own.len() > scale {
                own.sort_by_key(|u| {
                    (
                        Reverse(unhealthy.contains(u.uuid())),
                        Reverse(!u.is_started()),
                        Reverse(u.ordinal().unwrap_or(0)),
                    )
                });
                let surplus = own.len() - scale;
                plan.remove.extend(own.drain(..surplus));
                debug!("Scaling {} down by {surplus}", service.name);
            }

            for _ in own.len()..scale {
                created.push(DeploymentUnit::new(service));
            }
            if own.len() < scale {
                debug!("Scaling {} up by {}", service.name, scale - own.len());
            }

            self.healthy.extend(own);
        }

        let removed: HashSet<&str> = plan.remove.iter().map(DeploymentUnit::uuid).collect();
        self.unhealthy.retain(|u| !removed.contains(u.uuid()));

        plan.start = self
            .healthy
            .iter()
            .filter(|u| !u.is_started())
            .cloned()
            .chain(created.iter().cloned())
            .collect();
        self.healthy.extend(created);
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::PRIMARY_LAUNCH_CONFIG_NAME;
    use crate::state::{HealthState, InstanceState};
    use crate::testing::{service_fixture, unit_member};
    use chrono::Duration;

    fn unit(service: &Service, index: u32) -> DeploymentUnit {
        let uuid = format!("u{index}");
        let member = unit_member(service, PRIMARY_LAUNCH_CONFIG_NAME, index, &uuid);
        DeploymentUnit::from_members(service, uuid, vec![member])
    }

    fn planner(services: Vec<Service>, units: Vec<DeploymentUnit>) -> ServiceDeploymentPlanner {
        ServiceDeploymentPlanner::new(services, units, &ConfigHasher::new(), Utc::now(), 60)
    }

    #[test]
    fn test_converged_group_needs_nothing() {
        let service = service_fixture(1, "web");
        let mut planner = planner(vec![service.clone()], vec![unit(&service, 1)]);

        assert!(!planner.need_to_reconcile_deployment());
        let plan = planner.deploy();
        assert!(plan.start.is_empty());
        assert!(plan.remove.is_empty());
    }

    #[test]
    fn test_scale_up_adds_empty_units() {
        let mut service = service_fixture(1, "web");
        service.scale = 3;
        let mut planner = planner(vec![service.clone()], vec![unit(&service, 1)]);

        assert!(planner.need_to_reconcile_deployment());
        let plan = planner.deploy();
        assert_eq!(plan.start.len(), 2);
        assert!(plan.start.iter().all(|u| u.members().is_empty()));
    }

    #[test]
    fn test_scale_down_prefers_unhealthy_then_unstarted_then_highest() {
        let mut service = service_fixture(1, "web");
        service.scale = 1;

        let mut sick = unit(&service, 1);
        let mut member = sick.members()[0].clone();
        member.health_state = Some(HealthState::Unhealthy);
        member.started_at = Some(Utc::now() - Duration::hours(1));
        sick = DeploymentUnit::from_members(&service, sick.uuid(), vec![member]);

        let mut stopped = unit(&service, 2);
        let mut member = stopped.members()[0].clone();
        member.state = InstanceState::Stopped;
        stopped = DeploymentUnit::from_members(&service, stopped.uuid(), vec![member]);

        let units = vec![sick, stopped, unit(&service, 3), unit(&service, 4)];
        let mut planner = planner(vec![service], units);
        assert_eq!(planner.unhealthy_units().len(), 1);

        let plan = planner.deploy();
        let removed: Vec<&str> = plan.remove.iter().map(DeploymentUnit::uuid).collect();
        assert_eq!(removed, vec!["u1", "u2", "u4"]);
        assert!(plan.start.is_empty());
        assert!(planner.unhealthy_units().is_empty());
    }

    #[test]
    fn test_bad_units_do_not_count_toward_scale() {
        let service = service_fixture(1, "web");
        let mut stale = unit(&service, 1);
        let mut member = stale.members()[0].clone();
        member
            .labels
            .insert(crate::labels::LABEL_SERVICE_HASH.to_string(), String::from("stale"));
        stale = DeploymentUnit::from_members(&service, stale.uuid(), vec![member]);

        let mut planner = planner(vec![service], vec![stale]);
        assert_eq!(planner.bad_units().len(), 1);
        assert_eq!(planner.deploy().start.len(), 1);
    }
}
