use proptest::prelude::*;
use tether_core::{Expirer, ExpirerEvent, ExpirerTarget};

const NOW_MS: u64 = 1_700_000_000_000;

fn target() -> impl Strategy<Value = ExpirerTarget> {
    prop_oneof![
        "[0-9a-f]{8}".prop_map(ExpirerTarget::Topic),
        any::<u64>().prop_map(ExpirerTarget::Id),
    ]
}

fn expired_count(events: &[ExpirerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ExpirerEvent::Expired { .. }))
        .count()
}

proptest! {
    /// Every entry fires exactly once, however many sweeps run after it passed.
    #[test]
    fn each_entry_expires_once(
        entries in prop::collection::hash_map(target(), 1..600u64, 1..20),
        sweeps in 1..5usize,
    ) {
        let mut expirer = Expirer::new("");
        let now_secs = NOW_MS / 1000;
        for (target, ttl) in &entries {
            let events = expirer.set_at(target.clone(), now_secs + ttl, NOW_MS);
            prop_assert_eq!(expired_count(&events), 0);
        }

        let later = NOW_MS + 601 * 1000;
        let mut fired = 0;
        for _ in 0..sweeps {
            fired += expired_count(&expirer.check_expirations_at(later, true));
        }
        prop_assert_eq!(fired, entries.len());
        prop_assert!(expirer.is_empty());
    }

    /// Offline sweeps never fire; the first online sweep catches up.
    #[test]
    fn offline_sweeps_are_deferred(entries in prop::collection::hash_map(target(), 1..60u64, 1..10)) {
        let mut expirer = Expirer::new("");
        for (target, ttl) in &entries {
            expirer.set_at(target.clone(), NOW_MS / 1000 + ttl, NOW_MS);
        }
        let later = NOW_MS + 120 * 1000;
        prop_assert!(expirer.check_expirations_at(later, false).is_empty());
        prop_assert_eq!(expirer.len(), entries.len());
        prop_assert_eq!(expired_count(&expirer.check_expirations_at(later, true)), entries.len());
    }

    /// Targets survive their textual storage form.
    #[test]
    fn target_text_form(target in target()) {
        let parsed: ExpirerTarget = target.to_string().parse().unwrap();
        prop_assert_eq!(parsed, target);
    }
}

#[test]
fn past_expiry_fires_on_set() {
    let mut expirer = Expirer::new("");
    let events = expirer.set_at(ExpirerTarget::Id(1), NOW_MS / 1000 - 1, NOW_MS);
    assert_eq!(expired_count(&events), 1);
    assert!(!expirer.has(&ExpirerTarget::Id(1)));
}

#[test]
fn deleting_a_missing_target_is_silent() {
    let mut expirer = Expirer::new("");
    assert!(expirer.del(&ExpirerTarget::Topic("nope".into())).is_none());
}
