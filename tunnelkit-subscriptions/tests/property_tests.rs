//! Property-based tests for tunnelkit-subscriptions
//!
//! These tests use proptest to verify invariants across a wide range of inputs.

#[cfg(test)]
mod expiry_properties {
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use tunnelkit_subscriptions::{AccountId, SubscriptionPatch};

    proptest! {
        /// Grant writes never move the expiry backwards, whatever order they arrive in.
        #[test]
        fn extend_writes_are_monotonic(offsets in prop::collection::vec(-400i64..400, 1..30)) {
            let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let mut sub = SubscriptionPatch::new(AccountId(1))
                .username("vpn_1")
                .extend_to(base)
                .apply(None, base)
                .unwrap();

            for offset in offsets {
                let previous = sub.expires_at;
                let target = base + Duration::days(offset);
                sub = SubscriptionPatch::new(AccountId(1))
                    .extend_to(target)
                    .apply(Some(sub), base)
                    .unwrap();
                prop_assert!(sub.expires_at >= previous);
                prop_assert!(sub.expires_at >= target);
            }
        }

        /// The authoritative write is the only one allowed to lower the expiry.
        #[test]
        fn authoritative_write_wins(days in -400i64..400) {
            let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let sub = SubscriptionPatch::new(AccountId(1))
                .username("vpn_1")
                .extend_to(base + Duration::days(30))
                .apply(None, base)
                .unwrap();
            let target = base + Duration::days(days);
            let synced = SubscriptionPatch::new(AccountId(1))
                .authoritative_expiry(target)
                .apply(Some(sub), base)
                .unwrap();
            prop_assert_eq!(synced.expires_at, target);
        }

        /// The first promo code sticks.
        #[test]
        fn promo_code_is_write_once(codes in prop::collection::vec("[A-Z]{3,8}", 1..5)) {
            let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let mut sub = SubscriptionPatch::new(AccountId(1))
                .username("vpn_1")
                .extend_to(base)
                .apply(None, base)
                .unwrap();
            for code in &codes {
                sub = SubscriptionPatch::new(AccountId(1))
                    .promo_code(Some(code.clone()))
                    .apply(Some(sub), base)
                    .unwrap();
            }
            prop_assert_eq!(sub.promo_code.as_deref(), Some(codes[0].as_str()));
        }
    }
}

#[cfg(test)]
mod device_properties {
    use proptest::prelude::*;
    use std::collections::HashSet;
    use tempfile::TempDir;
    use tunnelkit_subscriptions::{AccountId, DeviceRegistry, FileDeviceRegistry, RegisterOutcome};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// No sequence of registrations pushes an account past its limit,
        /// and known devices are never rejected.
        #[test]
        fn device_count_never_exceeds_limit(
            limit in 1usize..5,
            ids in prop::collection::vec(0u8..8, 1..25)
        ) {
            let dir = TempDir::new().unwrap();
            let registry = FileDeviceRegistry::open(dir.path().join("devices.jsonl"), limit, 100).unwrap();

            let mut known = HashSet::new();
            for id in ids {
                let device_id = format!("device-{}", id);
                let outcome = tokio_test::block_on(registry.register(AccountId(1), &device_id, "10.0.0.1")).unwrap();
                match outcome {
                    RegisterOutcome::Accepted => {
                        prop_assert!(known.insert(device_id));
                    }
                    RegisterOutcome::Updated => prop_assert!(known.contains(&device_id)),
                    RegisterOutcome::LimitExceeded(max) => {
                        prop_assert_eq!(max, limit);
                        prop_assert!(!known.contains(&device_id));
                    }
                }
                let count = tokio_test::block_on(registry.list(AccountId(1))).unwrap().len();
                prop_assert!(count <= limit);
                prop_assert_eq!(count, known.len());
            }
        }
    }
}
