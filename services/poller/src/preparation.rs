//! Accumulator for an in-progress, zone-scoped check-set update.
//!
//! A preparation is born from a `poller.prepare` manifest, fattened by
//! `poller.prepare.block` definitions, and validated for completeness when
//! `poller.prepare.end` arrives with the `prepare` directive.

use std::collections::HashMap;
use zp_protocol::{CheckDefinition, ManifestEntry, PrepareAction};

/// Capability the session uses to hand committed preparations to the
/// scheduling side.  Implemented by the connection stream (fan-out) and by
/// each zone scheduler.
pub trait ChecksReconciler: Send + Sync {
    /// Cheap pre-acceptance validation: every `restart`/`continue` manifest
    /// entry must name a currently-live check.
    fn validate_checks(&self, cp: &ChecksPreparation) -> Result<(), ValidationError>;

    /// Hand over a committed preparation for asynchronous reconciliation.
    fn reconcile_checks(&self, cp: ChecksPreparation);
}

/// Pre-validation failure, naming the offending check.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("told to restart a check that does not exist: {0}")]
    RestartUnknown(String),
    #[error("told to continue a check that does not exist: {0}")]
    ContinueUnknown(String),
    #[error("no scheduler serves zone: {0}")]
    UnknownZone(String),
}

/// An in-progress check-set update for one zone and version.
#[derive(Debug, Clone)]
pub struct ChecksPreparation {
    zone_id: String,
    version: u64,
    manifest: Vec<ManifestEntry>,
    definitions: HashMap<String, CheckDefinition>,
}

impl ChecksPreparation {
    /// Build a preparation from a manifest.  Duplicate check ids are
    /// rejected outright.
    pub fn new(
        zone_id: &str,
        version: u64,
        manifest: Vec<ManifestEntry>,
    ) -> Result<ChecksPreparation, PreparationError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &manifest {
            if !seen.insert(entry.check_id.clone()) {
                return Err(PreparationError::DuplicateManifestEntry(
                    entry.check_id.clone(),
                ));
            }
        }
        Ok(ChecksPreparation {
            zone_id: zone_id.to_owned(),
            version,
            manifest,
            definitions: HashMap::new(),
        })
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True when a frame carrying `version` belongs to this preparation.
    pub fn version_applies(&self, version: u64) -> bool {
        self.version == version
    }

    /// Absorb a block of full check definitions.
    pub fn add_definitions(&mut self, block: Vec<CheckDefinition>) {
        for def in block {
            self.definitions.insert(def.check_id.clone(), def);
        }
    }

    /// Manifest entries that demand reconciler action.  `end` entries are
    /// excluded so their ids fall into the implicit-removal remainder.
    pub fn actionable_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.manifest
            .iter()
            .filter(|e| e.action != PrepareAction::End)
    }

    /// The received definition for a manifest entry, if any.
    pub fn definition_for(&self, check_id: &str) -> Option<&CheckDefinition> {
        self.definitions.get(check_id)
    }

    /// Commit-time completeness check.
    ///
    /// Valid iff the version matches, every `start`/`restart` entry has a
    /// matching definition, and every received definition was declared in
    /// the manifest.
    pub fn validate(&self, version: u64) -> Result<(), PreparationError> {
        if !self.version_applies(version) {
            return Err(PreparationError::VersionMismatch {
                expected: self.version,
                got: version,
            });
        }
        for entry in &self.manifest {
            match entry.action {
                PrepareAction::Start | PrepareAction::Restart => {
                    if !self.definitions.contains_key(&entry.check_id) {
                        return Err(PreparationError::MissingDefinition(entry.check_id.clone()));
                    }
                }
                PrepareAction::Continue | PrepareAction::End => {}
            }
        }
        for check_id in self.definitions.keys() {
            let declared = self.manifest.iter().any(|e| {
                &e.check_id == check_id
                    && matches!(e.action, PrepareAction::Start | PrepareAction::Restart)
            });
            if !declared {
                return Err(PreparationError::UndeclaredDefinition(check_id.clone()));
            }
        }
        Ok(())
    }
}

/// Failure while building or validating a preparation.
#[derive(Debug, thiserror::Error)]
pub enum PreparationError {
    #[error("manifest names check {0} more than once")]
    DuplicateManifestEntry(String),
    #[error("version {got} does not apply to preparation of version {expected}")]
    VersionMismatch { expected: u64, got: u64 },
    #[error("manifest entry {0} has no matching definition")]
    MissingDefinition(String),
    #[error("received definition for undeclared check {0}")]
    UndeclaredDefinition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: PrepareAction, check_id: &str, entity_id: &str) -> ManifestEntry {
        ManifestEntry {
            action,
            zone_id: "zn1".to_owned(),
            entity_id: entity_id.to_owned(),
            check_id: check_id.to_owned(),
            check_type: "remote.tcp".to_owned(),
        }
    }

    fn definition(check_id: &str, entity_id: &str) -> CheckDefinition {
        CheckDefinition {
            check_id: check_id.to_owned(),
            entity_id: entity_id.to_owned(),
            zone_id: "zn1".to_owned(),
            check_type: "remote.tcp".to_owned(),
            period: 60,
            timeout: 15,
            disabled: false,
            details: serde_json::json!({ "host": "127.0.0.1", "port": 80 }),
        }
    }

    #[test]
    fn version_applies_only_to_its_own_version() {
        let cp = ChecksPreparation::new("zn1", 1, vec![]).expect("new");
        assert!(cp.version_applies(1));
        assert!(!cp.version_applies(3));
    }

    #[test]
    fn complete_preparation_validates() {
        let manifest = vec![
            entry(PrepareAction::Start, "ch1", "en1"),
            entry(PrepareAction::Restart, "ch2", "en2"),
            entry(PrepareAction::Continue, "ch3", "en2"),
        ];
        let mut cp = ChecksPreparation::new("zn1", 1, manifest).expect("new");

        // Definitions arrive across two blocks, out of manifest order.
        cp.add_definitions(vec![definition("ch2", "en2")]);
        cp.add_definitions(vec![definition("ch1", "en1")]);

        cp.validate(1).expect("complete preparation must validate");
    }

    #[test]
    fn missing_definition_fails_validation() {
        let manifest = vec![
            entry(PrepareAction::Start, "ch1", "en1"),
            entry(PrepareAction::Restart, "ch2", "en2"),
            entry(PrepareAction::Continue, "ch3", "en2"),
        ];
        let mut cp = ChecksPreparation::new("zn1", 1, manifest).expect("new");
        cp.add_definitions(vec![definition("ch2", "en2")]);

        match cp.validate(1) {
            Err(PreparationError::MissingDefinition(id)) => assert_eq!(id, "ch1"),
            other => panic!("expected MissingDefinition, got {:?}", other),
        }
    }

    #[test]
    fn undeclared_definition_fails_validation() {
        let manifest = vec![entry(PrepareAction::Continue, "ch3", "en2")];
        let mut cp = ChecksPreparation::new("zn1", 1, manifest).expect("new");
        cp.add_definitions(vec![definition("ch2", "en2")]);

        match cp.validate(1) {
            Err(PreparationError::UndeclaredDefinition(id)) => assert_eq!(id, "ch2"),
            other => panic!("expected UndeclaredDefinition, got {:?}", other),
        }
    }

    #[test]
    fn wrong_version_fails_validation() {
        let manifest = vec![entry(PrepareAction::Restart, "ch2", "en2")];
        let mut cp = ChecksPreparation::new("zn1", 1, manifest).expect("new");
        cp.add_definitions(vec![definition("ch2", "en2")]);

        assert!(matches!(
            cp.validate(2),
            Err(PreparationError::VersionMismatch { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn duplicate_manifest_ids_are_rejected() {
        let manifest = vec![
            entry(PrepareAction::Start, "ch1", "en1"),
            entry(PrepareAction::Restart, "ch1", "en1"),
        ];
        assert!(matches!(
            ChecksPreparation::new("zn1", 1, manifest),
            Err(PreparationError::DuplicateManifestEntry(_))
        ));
    }

    #[test]
    fn end_entries_are_not_actionable() {
        let manifest = vec![
            entry(PrepareAction::Continue, "ch1", "en1"),
            entry(PrepareAction::End, "ch2", "en2"),
        ];
        let cp = ChecksPreparation::new("zn1", 1, manifest).expect("new");
        let actionable: Vec<_> = cp.actionable_entries().map(|e| e.check_id.clone()).collect();
        assert_eq!(actionable, vec!["ch1".to_owned()]);
    }
}
