//! Property tests for patch batch application.

use proptest::prelude::*;
use serde_json::json;
use stator_runtime::{ManualClock, PatchEntity};
use stator_types::{EntityId, EntityRecord, PatchData, PathConstructor};
use std::sync::Arc;

fn entity() -> PatchEntity {
    PatchEntity::from_record(
        EntityRecord::new(EntityId::new("prop")),
        Arc::new(ManualClock::new(42)),
    )
}

fn batch_strategy() -> impl Strategy<Value = Vec<PatchData>> {
    prop::collection::vec(
        (0usize..6, any::<i64>(), any::<bool>()).prop_map(|(key, value, add)| {
            let path = format!("properties.k{}", key);
            if add {
                PatchData::add(format!("{}_list", path), json!(value))
            } else {
                PatchData::replace(path, json!(value))
            }
        }),
        1..20,
    )
}

proptest! {
    #[test]
    fn test_successful_batch_bumps_version_once(batches in prop::collection::vec(batch_strategy(), 1..5)) {
        let mut en = entity();
        for (n, batch) in batches.iter().enumerate() {
            let outcome = en.handle(batch, PathConstructor::Default);
            prop_assert!(outcome.is_ok());
            prop_assert_eq!(en.version(), n as i64 + 1);
        }
    }

    #[test]
    fn test_application_is_deterministic(batch in batch_strategy()) {
        let mut left = entity();
        let mut right = entity();
        let a = left.handle(&batch, PathConstructor::Default);
        let b = right.handle(&batch, PathConstructor::Default);
        prop_assert_eq!(a, b);
        prop_assert_eq!(left.state(), right.state());
    }

    #[test]
    fn test_empty_batch_leaves_state_identical(batch in batch_strategy()) {
        let mut en = entity();
        en.handle(&batch, PathConstructor::Default);
        let before = en.raw();
        let outcome = en.handle(&[], PathConstructor::Default);
        prop_assert!(outcome.changes.is_empty());
        prop_assert_eq!(en.raw(), before);
    }
}
