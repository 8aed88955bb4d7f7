//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records and conflicting record pairs.

use fhirsync_protocol::{Record, ResourceType, Timestamp};
use proptest::prelude::*;

/// Strategy for resource type names used across the suites.
pub fn resource_type_strategy() -> impl Strategy<Value = ResourceType> {
    prop_oneof![
        Just(ResourceType::new("Patient")),
        Just(ResourceType::new("Observation")),
        Just(ResourceType::new("Encounter")),
        Just(ResourceType::new("Immunization")),
    ]
}

/// Strategy for record ids.
pub fn record_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{1,12}").expect("Invalid regex")
}

/// Strategy for opaque record bodies.
pub fn body_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for server timestamps.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    (0u64..1_000_000).prop_map(Timestamp::from_millis)
}

/// Strategy for a clean record.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    (
        resource_type_strategy(),
        record_id_strategy(),
        timestamp_strategy(),
        body_strategy(),
    )
        .prop_map(|(resource_type, id, version, body)| {
            Record::new(resource_type, id, version, body)
        })
}

/// Strategy for a (local, remote) pair sharing one identity.
///
/// The local side may or may not carry a dirty edit; the remote side is
/// always clean, as the server sends it.
pub fn conflict_pair_strategy() -> impl Strategy<Value = (Record, Record)> {
    (
        resource_type_strategy(),
        record_id_strategy(),
        timestamp_strategy(),
        timestamp_strategy(),
        body_strategy(),
        body_strategy(),
        prop::option::of(timestamp_strategy()),
    )
        .prop_map(
            |(resource_type, id, local_version, remote_version, local_body, remote_body, edit)| {
                let base = Record::new(resource_type.clone(), id.clone(), local_version, vec![]);
                let local = match edit {
                    Some(edited_at) => base.with_local_edit(local_body, edited_at),
                    None => Record {
                        body: local_body,
                        ..base
                    },
                };
                let remote = Record::new(resource_type, id, remote_version, remote_body);
                (local, remote)
            },
        )
}

/// Strategy for a page size.
pub fn page_size_strategy() -> impl Strategy<Value = u32> {
    1u32..8
}
