//! Default-deny network authorization model.
//!
//! A namespace's rules form a [`NetworkPolicySet`]. Traffic between two
//! workloads is permitted only when an allow rule matches and no deny rule
//! matches; any pair without an explicit allow is blocked. Sets are compared
//! with [`NetworkPolicySet::diff`] so that the full change is known before
//! anything is sent to the cluster.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::error::{DrydockError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// One authorization rule between a source and a destination workload selector.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkPolicyRule {
    /// Source workload selector (the workload's `app` label).
    pub from: String,
    /// Destination workload selector.
    pub to: String,
    /// Destination port; `None` matches every port.
    #[serde(default)]
    pub port: Option<u16>,
    pub action: PolicyAction,
}

impl NetworkPolicyRule {
    pub fn allow(from: &str, to: &str, port: Option<u16>) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            port,
            action: PolicyAction::Allow,
        }
    }

    pub fn deny(from: &str, to: &str, port: Option<u16>) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            port,
            action: PolicyAction::Deny,
        }
    }

    pub fn matches(&self, from: &str, to: &str, port: u16) -> bool {
        self.from == from && self.to == to && self.port.map_or(true, |p| p == port)
    }

    /// Same pair with intersecting port ranges.
    fn overlaps(&self, other: &Self) -> bool {
        self.from == other.from
            && self.to == other.to
            && match (self.port, other.port) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl std::fmt::Display for NetworkPolicyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action = match self.action {
            PolicyAction::Allow => "allow",
            PolicyAction::Deny => "deny",
        };
        match self.port {
            Some(p) => write!(f, "{action} {} -> {}:{p}", self.from, self.to),
            None => write!(f, "{action} {} -> {}:*", self.from, self.to),
        }
    }
}

/// Added/removed rules between two sets of the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDiff {
    pub added: Vec<NetworkPolicyRule>,
    pub removed: Vec<NetworkPolicyRule>,
}

impl PolicyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The complete rule set of one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicySet {
    namespace: String,
    pub(crate) rules: BTreeSet<NetworkPolicyRule>,
}

impl NetworkPolicySet {
    /// Empty set: everything denied.
    pub fn empty(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            rules: BTreeSet::new(),
        }
    }

    /// Build a validated set. An allow and a deny covering the same pair and
    /// port are contradictory and rejected.
    pub fn from_rules<I>(namespace: impl Into<String>, rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = NetworkPolicyRule>,
    {
        let namespace = namespace.into();
        let rules: BTreeSet<NetworkPolicyRule> = rules.into_iter().collect();

        for rule in &rules {
            if rule.from.trim().is_empty() || rule.to.trim().is_empty() {
                return Err(DrydockError::config(format!(
                    "network policy rule in namespace '{namespace}' has an empty selector"
                )));
            }
        }

        let (allows, denies): (Vec<_>, Vec<_>) = rules
            .iter()
            .partition(|r| r.action == PolicyAction::Allow);
        for deny in &denies {
            if let Some(allow) = allows.iter().find(|a| a.overlaps(deny)) {
                return Err(DrydockError::config(format!(
                    "conflicting network policy rules in namespace '{namespace}': '{allow}' and '{deny}'"
                )));
            }
        }

        Ok(Self { namespace, rules })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn rules(&self) -> impl Iterator<Item = &NetworkPolicyRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains(&self, rule: &NetworkPolicyRule) -> bool {
        self.rules.contains(rule)
    }

    /// Default-deny check.
    pub fn permits(&self, from: &str, to: &str, port: u16) -> bool {
        let mut allowed = false;
        for rule in self.rules.iter().filter(|r| r.matches(from, to, port)) {
            match rule.action {
                PolicyAction::Deny => return false,
                PolicyAction::Allow => allowed = true,
            }
        }
        allowed
    }

    /// Every selector must name a declared workload.
    pub fn validate_selectors(&self, workloads: &BTreeSet<String>) -> Result<()> {
        for rule in &self.rules {
            for selector in [&rule.from, &rule.to] {
                if !workloads.contains(selector) {
                    return Err(DrydockError::config(format!(
                        "network policy rule '{rule}' references unknown workload '{selector}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rules to add and remove to turn `self` into `desired`.
    pub fn diff(&self, desired: &NetworkPolicySet) -> PolicyDiff {
        PolicyDiff {
            added: desired.rules.difference(&self.rules).cloned().collect(),
            removed: self.rules.difference(&desired.rules).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voting_set() -> NetworkPolicySet {
        NetworkPolicySet::from_rules(
            "vote",
            vec![
                NetworkPolicyRule::allow("vote", "redis", Some(6379)),
                NetworkPolicyRule::allow("worker", "redis", Some(6379)),
                NetworkPolicyRule::allow("worker", "db", Some(5432)),
                NetworkPolicyRule::allow("result", "db", None),
                NetworkPolicyRule::deny("vote", "db", None),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_default_deny() {
        let set = voting_set();
        assert!(set.permits("vote", "redis", 6379));
        assert!(!set.permits("vote", "redis", 80));
        assert!(!set.permits("redis", "vote", 6379));
        assert!(!set.permits("vote", "db", 5432));
        assert!(set.permits("result", "db", 5432));
        assert!(!NetworkPolicySet::empty("vote").permits("vote", "redis", 6379));
    }

    #[test]
    fn test_conflicting_rules_rejected() {
        let err = NetworkPolicySet::from_rules(
            "vote",
            vec![
                NetworkPolicyRule::allow("vote", "db", Some(5432)),
                NetworkPolicyRule::deny("vote", "db", None),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("conflicting"));

        // Different ports do not conflict.
        assert!(NetworkPolicySet::from_rules(
            "vote",
            vec![
                NetworkPolicyRule::allow("vote", "db", Some(5432)),
                NetworkPolicyRule::deny("vote", "db", Some(22)),
            ],
        )
        .is_ok());
    }

    #[test]
    fn test_empty_selector_rejected() {
        assert!(NetworkPolicySet::from_rules(
            "vote",
            vec![NetworkPolicyRule::allow("", "db", None)]
        )
        .is_err());
    }

    #[test]
    fn test_diff() {
        let current = voting_set();
        let desired = NetworkPolicySet::from_rules(
            "vote",
            vec![
                NetworkPolicyRule::allow("vote", "redis", Some(6379)),
                NetworkPolicyRule::allow("worker", "redis", Some(6379)),
                NetworkPolicyRule::allow("worker", "db", Some(5432)),
                NetworkPolicyRule::allow("result", "db", Some(5432)),
            ],
        )
        .unwrap();

        let diff = current.diff(&desired);
        assert_eq!(
            diff.added,
            vec![NetworkPolicyRule::allow("result", "db", Some(5432))]
        );
        assert_eq!(diff.removed.len(), 2);
        assert!(current.diff(&current).is_empty());
    }

    #[test]
    fn test_validate_selectors() {
        let set = voting_set();
        let known: BTreeSet<String> = ["vote", "redis", "worker", "db", "result"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(set.validate_selectors(&known).is_ok());

        let partial: BTreeSet<String> = ["vote", "redis"].iter().map(|s| s.to_string()).collect();
        assert!(set.validate_selectors(&partial).is_err());
    }
}
