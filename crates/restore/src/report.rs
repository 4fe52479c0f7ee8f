//! User-facing lines for processed objects.

use std::fmt::Display;

use pit_restore_core::VersionEntry;

#[derive(Debug, Clone, Copy, Default)]
pub struct Reporter {
    pub verbose: bool,
}

impl Reporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn object(&self, entry: &VersionEntry, note: Option<&str>) {
        println!("{}", self.format_object(entry, note));
    }

    /// Failures always carry the full version detail, on stderr.
    pub fn failure(&self, entry: &VersionEntry, err: &dyn Display) {
        eprintln!("{}", format_failure(entry, err));
    }

    pub fn format_object(&self, entry: &VersionEntry, note: Option<&str>) -> String {
        if !self.verbose {
            return entry.key.clone();
        }
        match note {
            Some(note) => format!("{} {note}", detail(entry)),
            None => detail(entry),
        }
    }
}

pub fn format_failure(entry: &VersionEntry, err: &dyn Display) -> String {
    format!("{} \"ERROR: {err}\"", detail(entry))
}

fn detail(entry: &VersionEntry) -> String {
    format!(
        "\"{}\" {} {} {} {}",
        entry.last_modified.format("%Y-%m-%d %H:%M:%S%:z"),
        entry.version_id,
        entry.size,
        entry.storage_class,
        entry.key
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pit_restore_core::StorageClass;

    fn entry() -> VersionEntry {
        VersionEntry {
            key: "photos/cat.jpg".into(),
            version_id: "3sL4kqtJlcpXroDTDmJ".into(),
            last_modified: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap(),
            size: 2048,
            storage_class: StorageClass::Glacier,
            is_latest: false,
        }
    }

    #[test]
    fn quiet_prints_key_only() {
        let r = Reporter::new(false);
        assert_eq!(r.format_object(&entry(), Some("needs restore")), "photos/cat.jpg");
    }

    #[test]
    fn verbose_prints_version_detail() {
        let r = Reporter::new(true);
        assert_eq!(
            r.format_object(&entry(), None),
            "\"2024-03-09 14:05:00+00:00\" 3sL4kqtJlcpXroDTDmJ 2048 GLACIER photos/cat.jpg"
        );
        assert_eq!(
            r.format_object(&entry(), Some("in-progress")),
            "\"2024-03-09 14:05:00+00:00\" 3sL4kqtJlcpXroDTDmJ 2048 GLACIER photos/cat.jpg in-progress"
        );
    }

    #[test]
    fn failure_line_quotes_error() {
        assert_eq!(
            format_failure(&entry(), &"connection reset"),
            "\"2024-03-09 14:05:00+00:00\" 3sL4kqtJlcpXroDTDmJ 2048 GLACIER photos/cat.jpg \"ERROR: connection reset\""
        );
    }
}
