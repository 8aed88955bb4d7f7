//! Reset-watermark command implementation.

use super::ensure_state_dir;
use fhirsync_engine::{FileTokenStore, TokenStore};
use fhirsync_protocol::ResourceType;
use std::path::Path;
use tracing::info;

/// Forgets watermarks and returns the types that had one.
pub fn reset(
    path: &Path,
    resource_types: &[String],
    all: bool,
) -> Result<Vec<ResourceType>, Box<dyn std::error::Error>> {
    ensure_state_dir(path)?;
    let tokens = FileTokenStore::open(path)?;

    let targets: Vec<ResourceType> = if all {
        tokens.watermarks()?.into_keys().collect()
    } else {
        resource_types.iter().map(|name| ResourceType::new(name.as_str())).collect()
    };

    let mut cleared = Vec::new();
    for resource_type in targets {
        if tokens.reset(&resource_type)? {
            info!("Reset watermark of {} in {:?}", resource_type, path);
            cleared.push(resource_type);
        }
    }
    Ok(cleared)
}

/// Runs the reset-watermark command.
pub fn run(
    path: &Path,
    resource_types: &[String],
    all: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let cleared = reset(path, resource_types, all)?;
    if cleared.is_empty() {
        println!("No watermarks to reset");
    } else {
        for resource_type in &cleared {
            println!("✓ {} will be downloaded in full on the next pass", resource_type);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_protocol::Timestamp;

    fn seeded() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let tokens = FileTokenStore::open(dir.path()).unwrap();
        for (name, at) in [("Patient", 10), ("Observation", 20)] {
            tokens
                .set_watermark(&ResourceType::new(name), Timestamp::from_millis(at))
                .unwrap();
        }
        dir
    }

    #[test]
    fn resets_named_types() {
        let dir = seeded();
        let cleared = reset(dir.path(), &["Patient".into(), "Encounter".into()], false).unwrap();
        assert_eq!(cleared, vec![ResourceType::new("Patient")]);

        let tokens = FileTokenStore::open(dir.path()).unwrap();
        assert_eq!(tokens.watermarks().unwrap().len(), 1);
    }

    #[test]
    fn resets_everything() {
        let dir = seeded();
        let cleared = reset(dir.path(), &[], true).unwrap();
        assert_eq!(cleared.len(), 2);

        let tokens = FileTokenStore::open(dir.path()).unwrap();
        assert!(tokens.watermarks().unwrap().is_empty());
    }

    #[test]
    fn reset_holds_while_an_engine_has_the_store_open() {
        let dir = seeded();
        let engine_tokens = FileTokenStore::open(dir.path()).unwrap();

        reset(dir.path(), &["Patient".into()], false).unwrap();
        engine_tokens
            .set_watermark(&ResourceType::new("Encounter"), Timestamp::from_millis(3))
            .unwrap();

        let marks = FileTokenStore::open(dir.path()).unwrap().watermarks().unwrap();
        assert!(!marks.contains_key(&ResourceType::new("Patient")));
        assert_eq!(marks.len(), 2);
    }
}
