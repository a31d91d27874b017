//! Raw change to domain event classification.
//!
//! Classification is a pure function of the rule table and the change's
//! path and type: no clock, no state. The directory layout is the contract
//! external consumers rely on; renaming a directory without updating its
//! rule silently reroutes its events to the generic `file:*` family.

use serde::{Deserialize, Serialize};

use vaultsync_common::VaultPath;

use crate::changelog::{ChangeType, FileChange};
use crate::events::{Action, Domain, EventData, EventType, VaultEvent};

/// Maps a directory prefix to an event family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Vault-relative directory, e.g. `tasks/pending/`.
    pub prefix: String,
    pub domain: Domain,
    /// Action reported when a document arrives (create, or rename into).
    pub on_create: Action,
}

impl ClassificationRule {
    pub fn new(prefix: impl Into<String>, domain: Domain, on_create: Action) -> Self {
        Self {
            prefix: prefix.into(),
            domain,
            on_create,
        }
    }

    fn depth(&self) -> usize {
        VaultPath::parse(&self.prefix)
            .map(|p| p.components().len())
            .unwrap_or(0)
    }

    fn directory(&self) -> String {
        VaultPath::parse(&self.prefix)
            .map(|p| p.as_string())
            .unwrap_or_else(|_| self.prefix.clone())
    }
}

/// The built-in directory convention.
pub fn default_rules() -> Vec<ClassificationRule> {
    use Action::*;
    use Domain::*;
    vec![
        ClassificationRule::new("jobs/pending/", Job, Created),
        ClassificationRule::new("jobs/running/", Job, Claimed),
        ClassificationRule::new("jobs/completed/", Job, Completed),
        ClassificationRule::new("jobs/failed/", Job, Failed),
        ClassificationRule::new("jobs/", Job, Created),
        ClassificationRule::new("tasks/pending/", Task, Created),
        ClassificationRule::new("tasks/active/", Task, Claimed),
        ClassificationRule::new("tasks/done/", Task, Completed),
        ClassificationRule::new("tasks/", Task, Created),
        ClassificationRule::new("approvals/pending/", Approval, Requested),
        ClassificationRule::new("approvals/resolved/", Approval, Resolved),
        ClassificationRule::new("approvals/", Approval, Created),
        ClassificationRule::new("notes/", Note, Created),
        ClassificationRule::new("system/", System, Created),
    ]
}

/// Longest-prefix rule matcher.
#[derive(Debug, Clone)]
pub struct Classifier {
    /// Sorted deepest prefix first.
    rules: Vec<ClassificationRule>,
}

impl Classifier {
    pub fn new(mut rules: Vec<ClassificationRule>) -> Self {
        rules.sort_by_key(|r| std::cmp::Reverse(r.depth()));
        Self { rules }
    }

    /// The most specific rule whose directory contains `path`.
    pub fn rule_for(&self, path: &VaultPath) -> Option<&ClassificationRule> {
        self.rules.iter().find(|r| path.is_under(&r.prefix))
    }

    /// Derive the domain event for a raw change.
    pub fn classify(&self, change: &FileChange) -> VaultEvent {
        let rule = self.rule_for(&change.path);
        let domain = rule.map(|r| r.domain).unwrap_or(Domain::File);
        let arrival = rule.map(|r| r.on_create).unwrap_or(Action::Created);
        let id = change.path.file_stem().unwrap_or_default().to_string();
        let directory = rule.map(ClassificationRule::directory);

        let (action, data) = match change.change_type {
            ChangeType::Create => (arrival, document_data(id, directory)),
            ChangeType::Modify => (Action::Modified, document_data(id, directory)),
            ChangeType::Delete => (Action::Deleted, document_data(id, directory)),
            ChangeType::Rename => {
                let old_rule = change
                    .old_path
                    .as_ref()
                    .and_then(|old| self.rule_for(old))
                    .map(|r| r.prefix.as_str());
                let same_directory = old_rule == rule.map(|r| r.prefix.as_str());
                let action = if same_directory {
                    Action::Renamed
                } else {
                    arrival
                };
                let data = match &change.old_path {
                    Some(old_path) => EventData::Moved {
                        id,
                        directory,
                        old_path: old_path.clone(),
                    },
                    None => document_data(id, directory),
                };
                (action, data)
            }
        };

        VaultEvent {
            event_type: EventType::new(domain, action),
            path: change.path.clone(),
            timestamp: change.detected_at,
            data,
            change_id: None,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

fn document_data(id: String, directory: Option<String>) -> EventData {
    match directory {
        Some(directory) => EventData::Document { id, directory },
        None => EventData::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeSource;
    use chrono::Utc;
    use proptest::prelude::*;
    use vaultsync_common::DeviceId;

    fn change(path: &str, change_type: ChangeType) -> FileChange {
        let path = VaultPath::parse(path).unwrap();
        let device = DeviceId::new("dev").unwrap();
        match change_type {
            ChangeType::Delete => FileChange::deleted(path, ChangeSource::Watcher, device),
            _ => FileChange::written(
                path,
                change_type,
                "h".to_string(),
                1,
                Utc::now(),
                ChangeSource::Watcher,
                device,
            ),
        }
    }

    fn rename(from: &str, to: &str) -> FileChange {
        FileChange::renamed(
            VaultPath::parse(from).unwrap(),
            VaultPath::parse(to).unwrap(),
            "h".to_string(),
            1,
            Utc::now(),
            ChangeSource::Watcher,
            DeviceId::new("dev").unwrap(),
        )
    }

    fn kind(path: &str, change_type: ChangeType) -> String {
        Classifier::default()
            .classify(&change(path, change_type))
            .event_type
            .to_string()
    }

    #[test]
    fn test_pending_task_create() {
        let event = Classifier::default().classify(&change("tasks/pending/t1.md", ChangeType::Create));
        assert_eq!(event.event_type.to_string(), "task:created");
        assert_eq!(
            event.data,
            EventData::Document {
                id: "t1".to_string(),
                directory: "tasks/pending".to_string()
            }
        );
    }

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(kind("jobs/running/42.md", ChangeType::Create), "job:claimed");
        assert_eq!(kind("jobs/archive/42.md", ChangeType::Create), "job:created");
        assert_eq!(kind("jobs/running/42.md", ChangeType::Modify), "job:modified");
        assert_eq!(kind("tasks/done/t.md", ChangeType::Create), "task:completed");
        assert_eq!(kind("approvals/pending/a.md", ChangeType::Create), "approval:requested");
    }

    #[test]
    fn test_system_modifications() {
        assert_eq!(kind("system/config.md", ChangeType::Modify), "system:modified");
    }

    #[test]
    fn test_fallback_to_file_events() {
        assert_eq!(kind("README.md", ChangeType::Create), "file:created");
        assert_eq!(kind("misc/a.md", ChangeType::Modify), "file:modified");
        assert_eq!(kind("misc/a.md", ChangeType::Delete), "file:deleted");
        let event = Classifier::default().classify(&change("misc/a.md", ChangeType::Create));
        assert_eq!(event.data, EventData::None);
    }

    #[test]
    fn test_rename_into_directory_is_an_arrival() {
        let event = Classifier::default().classify(&rename("jobs/pending/7.md", "jobs/running/7.md"));
        assert_eq!(event.event_type.to_string(), "job:claimed");
        assert!(matches!(event.data, EventData::Moved { ref old_path, .. }
            if old_path.to_string() == "jobs/pending/7.md"));
    }

    #[test]
    fn test_rename_within_directory() {
        let event = Classifier::default().classify(&rename("notes/a.md", "notes/b.md"));
        assert_eq!(event.event_type.to_string(), "note:renamed");
    }

    #[test]
    fn test_custom_rules() {
        let classifier = Classifier::new(vec![ClassificationRule::new(
            "inbox",
            Domain::Task,
            Action::Requested,
        )]);
        let event = classifier.classify(&change("inbox/x.md", ChangeType::Create));
        assert_eq!(event.event_type.to_string(), "task:requested");
    }

    proptest! {
        #[test]
        fn prop_classification_is_deterministic(
            dir in prop::sample::select(vec!["jobs/running", "tasks/pending", "notes", "system", "misc", ""]),
            name in "[a-z]{1,8}",
            op in 0u8..3,
        ) {
            let change_type = match op {
                0 => ChangeType::Create,
                1 => ChangeType::Modify,
                _ => ChangeType::Delete,
            };
            let path = format!("{}/{}.md", dir, name);
            let classifier = Classifier::default();
            let first = classifier.classify(&change(&path, change_type)).event_type;
            let _ = classifier.classify(&change("tasks/pending/other.md", ChangeType::Create));
            let second = Classifier::default().classify(&change(&path, change_type)).event_type;
            prop_assert_eq!(first, second);
        }
    }
}
