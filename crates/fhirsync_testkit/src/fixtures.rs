//! Record fixtures.
//!
//! Short constructors for the records most tests need, so scenarios read
//! like the clinical situation they model.

use fhirsync_protocol::{Record, RecordKey, ResourceType, Timestamp};

/// Shorthand for a timestamp in milliseconds.
pub fn ts(millis: u64) -> Timestamp {
    Timestamp::from_millis(millis)
}

/// The `Patient` resource type.
pub fn patient_type() -> ResourceType {
    ResourceType::new("Patient")
}

/// The `Observation` resource type.
pub fn observation_type() -> ResourceType {
    ResourceType::new("Observation")
}

/// The `Encounter` resource type.
pub fn encounter_type() -> ResourceType {
    ResourceType::new("Encounter")
}

/// A clean record of any type.
pub fn record(resource_type: &str, id: &str, version: u64, body: &str) -> Record {
    Record::new(resource_type, id, ts(version), body.as_bytes().to_vec())
}

/// A clean `Patient` record.
pub fn patient(id: &str, version: u64, body: &str) -> Record {
    record("Patient", id, version, body)
}

/// A clean `Observation` record.
pub fn observation(id: &str, version: u64, body: &str) -> Record {
    record("Observation", id, version, body)
}

/// A `Patient` record with an unsynced local edit on top of `base_version`.
pub fn dirty_patient(id: &str, base_version: u64, body: &str, edited_at: u64) -> Record {
    patient(id, base_version, "").with_local_edit(body.as_bytes().to_vec(), ts(edited_at))
}

/// Key of a `Patient` record.
pub fn patient_key(id: &str) -> RecordKey {
    RecordKey::new("Patient", id)
}

/// `count` clean records of one type with versions `start, start + 1, ...`.
pub fn record_run(resource_type: &str, count: usize, start: u64) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let version = start + i as u64;
            record(
                resource_type,
                &format!("{}-{}", resource_type.to_lowercase(), i),
                version,
                &format!("v{version}"),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_patient_keeps_base_version() {
        let p = dirty_patient("p1", 4, "local", 9);
        assert!(p.dirty);
        assert_eq!(p.last_modified, ts(4));
        assert_eq!(p.edited_at, Some(ts(9)));
        assert_eq!(p.body, b"local");
    }

    #[test]
    fn record_run_has_increasing_versions() {
        let run = record_run("Observation", 3, 10);
        let versions: Vec<_> = run.iter().map(|r| r.last_modified.as_millis()).collect();
        assert_eq!(versions, vec![10, 11, 12]);
        assert_eq!(run[2].id, "observation-2");
    }
}
