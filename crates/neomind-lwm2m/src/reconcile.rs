//! Profile reconciliation.
//!
//! [`ProfileDelta::compute`] diffs two immutable profile snapshots;
//! [`ProfileReconciler`] turns the delta into downlink operations for every
//! session bound to the profile.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::dispatcher::{DownlinkCommand, DownlinkDispatcher, Operation, Payload};
use crate::path::VersionedPath;
use crate::profile::{ProfileConfig, WriteAttributes};
use crate::session::ClientSession;

/// Added and removed members of a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T: Ord> {
    pub added: BTreeSet<T>,
    pub removed: BTreeSet<T>,
}

impl<T: Ord> Default for SetDiff<T> {
    fn default() -> Self {
        Self {
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<T: Ord> SetDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `added = new \ old`, `removed = old \ new`.
pub fn diff_sets<T: Ord + Clone>(old: &BTreeSet<T>, new: &BTreeSet<T>) -> SetDiff<T> {
    SetDiff {
        added: new.difference(old).cloned().collect(),
        removed: old.difference(new).cloned().collect(),
    }
}

/// Work needed to move devices from one profile snapshot to the next.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileDelta {
    pub attributes: SetDiff<VersionedPath>,
    pub telemetry: SetDiff<VersionedPath>,
    /// Paths whose key name is new or changed
    pub renamed: BTreeSet<VersionedPath>,
    /// Paths to read once and publish
    pub read: BTreeSet<VersionedPath>,
    /// Paths no longer published and not re-added
    pub removed: BTreeSet<VersionedPath>,
    pub observe: SetDiff<VersionedPath>,
    /// Added or changed notification attributes
    pub write_attributes: BTreeMap<VersionedPath, WriteAttributes>,
    /// Dropped notification attributes with their previous parameters
    pub reset_attributes: BTreeMap<VersionedPath, WriteAttributes>,
}

impl ProfileDelta {
    pub fn compute(old: &ProfileConfig, new: &ProfileConfig) -> Self {
        let attributes = diff_sets(&old.attributes, &new.attributes);
        let telemetry = diff_sets(&old.telemetry, &new.telemetry);

        let renamed: BTreeSet<VersionedPath> = new
            .key_names
            .iter()
            .filter(|(path, name)| old.key_names.get(*path) != Some(*name))
            .map(|(path, _)| path.clone())
            .collect();

        let read: BTreeSet<VersionedPath> = attributes
            .added
            .iter()
            .chain(&telemetry.added)
            .chain(&renamed)
            .cloned()
            .collect();
        let removed = attributes
            .removed
            .iter()
            .chain(&telemetry.removed)
            .filter(|path| !read.contains(*path))
            .cloned()
            .collect();

        let observe = diff_sets(&old.observe_eligible(), &new.observe_eligible());

        let write_attributes = new
            .write_attributes
            .iter()
            .filter(|(path, params)| old.write_attributes.get(*path) != Some(*params))
            .map(|(path, params)| (path.clone(), params.clone()))
            .collect();
        let reset_attributes = old
            .write_attributes
            .iter()
            .filter(|(path, _)| !new.write_attributes.contains_key(*path))
            .map(|(path, params)| (path.clone(), params.clone()))
            .collect();

        Self {
            attributes,
            telemetry,
            renamed,
            read,
            removed,
            observe,
            write_attributes,
            reset_attributes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
            && self.removed.is_empty()
            && self.observe.is_empty()
            && self.write_attributes.is_empty()
            && self.reset_attributes.is_empty()
    }
}

pub struct ProfileReconciler {
    dispatcher: Arc<DownlinkDispatcher>,
}

impl ProfileReconciler {
    pub fn new(dispatcher: Arc<DownlinkDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Diff `old` against `new` and apply the delta to every session.
    pub async fn reconcile(
        &self,
        old: &ProfileConfig,
        new: &ProfileConfig,
        sessions: &[Arc<ClientSession>],
    ) -> ProfileDelta {
        let delta = ProfileDelta::compute(old, new);
        if delta.is_empty() {
            debug!(profile_id = %new.profile_id, "Profile update needs no device operations");
            return delta;
        }
        info!(
            profile_id = %new.profile_id,
            sessions = sessions.len(),
            read = delta.read.len(),
            observe = delta.observe.added.len(),
            cancel = delta.observe.removed.len(),
            "Reconciling profile"
        );
        join_all(sessions.iter().map(|session| self.apply(session, &delta))).await;
        delta
    }

    /// Issue the delta's operations to one device. A failing path does not
    /// stop its siblings.
    pub async fn apply(&self, session: &Arc<ClientSession>, delta: &ProfileDelta) -> usize {
        let mut commands = Vec::new();
        for path in &delta.read {
            commands.push(DownlinkCommand::at(Operation::Read, path.clone()));
        }
        for path in &delta.observe.added {
            commands.push(DownlinkCommand::at(Operation::Observe, path.clone()));
        }
        for path in &delta.observe.removed {
            commands.push(DownlinkCommand::at(Operation::ObserveCancel, path.clone()));
        }
        for (path, params) in &delta.write_attributes {
            commands.push(
                DownlinkCommand::at(Operation::WriteAttributes, path.clone())
                    .with_payload(Payload::Attributes(params.to_query())),
            );
        }
        for (path, params) in &delta.reset_attributes {
            let query = params.reset_query();
            if query.is_empty() {
                continue;
            }
            commands.push(
                DownlinkCommand::at(Operation::WriteAttributes, path.clone())
                    .with_payload(Payload::Attributes(query)),
            );
        }
        if !delta.removed.is_empty() {
            debug!(endpoint = %session.endpoint(), removed = ?delta.removed, "Paths no longer published");
        }

        let mut issued = 0;
        for command in commands {
            let Some(path) = command.path.as_ref() else {
                continue;
            };
            if !session.supports_object(path.object_id()) {
                continue;
            }
            let label = format!("{} {}", command.operation, path);
            match self.dispatcher.send(session, command).await {
                Ok(()) => issued += 1,
                Err(e) => warn!(endpoint = %session.endpoint(), op = %label, error = %e, "Reconcile operation failed"),
            }
        }
        issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> BTreeSet<VersionedPath> {
        items.iter().map(|p| p.parse().unwrap()).collect()
    }

    fn profile(attr: &[&str], tel: &[&str], observe: &[&str]) -> ProfileConfig {
        ProfileConfig {
            attributes: paths(attr),
            telemetry: paths(tel),
            observe: paths(observe),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_diff_laws() {
        let cases = [
            (vec![], vec!["/3/0/9"]),
            (vec!["/3/0/9", "/3/0/0"], vec!["/3/0/0", "/3/0/1"]),
            (vec!["/3/0/9"], vec![]),
            (vec!["/3/0/9", "/3/0/0"], vec!["/3/0/9", "/3/0/0"]),
        ];
        for (old, new) in cases {
            let (old, new) = (paths(&old), paths(&new));
            let diff = diff_sets(&old, &new);
            assert_eq!(diff.added, new.difference(&old).cloned().collect::<BTreeSet<_>>());
            assert_eq!(diff.removed, old.difference(&new).cloned().collect::<BTreeSet<_>>());
            assert!(diff.added.is_disjoint(&diff.removed));
            assert!(diff_sets(&new, &new).is_empty());
        }
    }

    #[test]
    fn test_renamed_key_is_read_and_not_removed() {
        let mut old = profile(&["/3/0/9"], &[], &[]);
        old.key_names.insert("/3/0/9".parse().unwrap(), "battery".into());
        let mut new = profile(&[], &["/3/0/9"], &[]);
        new.key_names.insert("/3/0/9".parse().unwrap(), "batteryLevel".into());

        let delta = ProfileDelta::compute(&old, &new);
        assert_eq!(delta.renamed, paths(&["/3/0/9"]));
        assert_eq!(delta.read, paths(&["/3/0/9"]));
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn test_observe_eligibility() {
        // /3/0/13 is observed but not published, so it is never eligible.
        let old = profile(&["/3/0/9"], &[], &["/3/0/9", "/3/0/13"]);
        let new = profile(&["/3/0/0"], &["/3/0/13"], &["/3/0/0", "/3/0/13"]);

        let delta = ProfileDelta::compute(&old, &new);
        assert_eq!(delta.observe.added, paths(&["/3/0/0", "/3/0/13"]));
        assert_eq!(delta.observe.removed, paths(&["/3/0/9"]));
        for path in &delta.observe.added {
            assert!(new.observe.contains(path));
            assert!(new.published_paths().contains(path));
            assert!(!old.observe_eligible().contains(path));
        }
    }

    #[test]
    fn test_write_attribute_changes() {
        let p = |s: &str| -> VersionedPath { s.parse().unwrap() };
        let attrs = |pmin| WriteAttributes {
            pmin: Some(pmin),
            ..Default::default()
        };
        let mut old = ProfileConfig::default();
        old.write_attributes.insert(p("/3/0/9"), attrs(10));
        old.write_attributes.insert(p("/3/0/0"), attrs(5));
        let mut new = ProfileConfig::default();
        new.write_attributes.insert(p("/3/0/9"), attrs(30));
        new.write_attributes.insert(p("/3/0/1"), attrs(1));

        let delta = ProfileDelta::compute(&old, &new);
        assert_eq!(
            delta.write_attributes.keys().cloned().collect::<BTreeSet<_>>(),
            paths(&["/3/0/1", "/3/0/9"])
        );
        assert_eq!(delta.reset_attributes.get(&p("/3/0/0")), Some(&attrs(5)));
    }

    #[test]
    fn test_identical_profiles_are_noop() {
        let config = profile(&["/3/0/9"], &["/3/0/13"], &["/3/0/9"]);
        assert!(ProfileDelta::compute(&config, &config).is_empty());
    }
}
