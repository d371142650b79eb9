//! Canonical event topic constants shared by the engine and the CLI.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Acquisition
pub const TOPIC_ACQUIRE_STATE: &str = "models.acquire.state";
pub const TOPIC_ACQUIRE_COMPLETED: &str = "models.acquire.completed";
pub const TOPIC_ACQUIRE_FAILED: &str = "models.acquire.failed";
pub const TOPIC_PROGRESS: &str = "models.download.progress";

// Records
pub const TOPIC_RECORDS_CHANGED: &str = "records.changed";
pub const TOPIC_RECORDS_VERIFIED: &str = "records.verified";

// Service
pub const TOPIC_SERVICE_HEALTH: &str = "service.health";
pub const TOPIC_SERVICE_REGISTERED: &str = "models.registered";

// Migration
pub const TOPIC_MIGRATION_BACKUP: &str = "migration.backup.created";
pub const TOPIC_MIGRATION_COMPLETED: &str = "migration.completed";
pub const TOPIC_MIGRATION_FAILED: &str = "migration.failed";
pub const TOPIC_MIGRATION_ROLLED_BACK: &str = "migration.rolled_back";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_dot_case() {
        for t in [
            TOPIC_ACQUIRE_STATE,
            TOPIC_ACQUIRE_COMPLETED,
            TOPIC_ACQUIRE_FAILED,
            TOPIC_PROGRESS,
            TOPIC_RECORDS_CHANGED,
            TOPIC_RECORDS_VERIFIED,
            TOPIC_SERVICE_HEALTH,
            TOPIC_SERVICE_REGISTERED,
            TOPIC_MIGRATION_BACKUP,
            TOPIC_MIGRATION_COMPLETED,
            TOPIC_MIGRATION_FAILED,
            TOPIC_MIGRATION_ROLLED_BACK,
        ] {
            assert!(t.contains('.'), "{t}");
            assert_eq!(t, t.to_ascii_lowercase());
            assert!(!t.contains(' '));
        }
    }
}
