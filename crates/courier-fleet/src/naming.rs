//! Versioned reader process names.
//!
//! A reader name is `{base}--v{version}`. The base is derived from the
//! subscriber key alone, the version from the clock. Every creation yields a
//! distinct name, so a replacement never has to reuse the name of the
//! instance it replaces, while the base still lets the engine find every
//! instance that belongs to one subscriber.
//!
//! ```text
//! orders / billing / dlq  ->  orders--billing--dlq--v1718000000000
//! └─────── key ───────┘       └──────── base ─────┘ └─ version ─┘
//! ```
//!
//! Key parts that are not already lowercase `[a-z0-9-]` words are sanitized
//! and tagged with a short digest of the raw part. `order.created` becomes
//! `order-created_` plus eight hex digits, so keys that sanitize alike still
//! get different bases.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use courier_core::{Clock, ReaderRecord, SubscriberKey};
use sha2::{Digest, Sha256};

const PART_SEPARATOR: &str = "--";
const VERSION_MARKER: &str = "--v";
const DLQ_MARKER: &str = "dlq";
const DIGEST_MARKER: char = '_';
const DIGEST_BYTES: usize = 4;

/// Lowercases and collapses every run of characters outside `[a-z0-9]` into a
/// single `-`, trimming the ends. The result never contains `--`.
fn sanitize(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut pending_dash = false;
    for ch in part.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Name segment for one key part.
///
/// Parts that survive [`sanitize`] unchanged are used as is. Anything else
/// gets `_` and the leading digest bytes of the raw part appended. Sanitized
/// output never contains `_`, so the two forms cannot collide.
fn name_part(part: &str) -> String {
    let mut out = sanitize(part);
    if out == part {
        return out;
    }
    out.push(DIGEST_MARKER);
    let digest = Sha256::digest(part.as_bytes());
    for byte in &digest[..DIGEST_BYTES] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Deterministic, version-free name prefix of a subscriber's readers.
///
/// Distinct keys map to distinct bases unless two lossy parts that sanitize
/// alike also share their 32-bit digest prefix.
pub fn base_name(key: &SubscriberKey) -> String {
    let mut base = format!(
        "{}{PART_SEPARATOR}{}",
        name_part(&key.event_type),
        name_part(&key.subscriber_name)
    );
    if key.dlq {
        base.push_str(PART_SEPARATOR);
        base.push_str(DLQ_MARKER);
    }
    base
}

/// Splits a running process name into base and version.
///
/// Returns `None` for names that were not produced by [`ReaderNamer`].
pub fn parse_reader_name(name: &str) -> Option<ReaderRecord> {
    let (base, version) = name.rsplit_once(VERSION_MARKER)?;
    if base.is_empty() || version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version = version.parse().ok()?;
    Some(ReaderRecord { base_name: base.to_string(), versioned_name: name.to_string(), version })
}

/// Every running instance name that belongs to `key`.
///
/// Callers pass the listing taken before creating a new instance, so every
/// returned name is older than a freshly generated one.
pub fn find_old_names<'a, I>(key: &SubscriberKey, running: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let base = base_name(key);
    running
        .into_iter()
        .filter(|name| parse_reader_name(name).is_some_and(|record| record.base_name == base))
        .cloned()
        .collect()
}

/// Generates collision-free versioned reader names.
///
/// Versions are clock milliseconds, bumped when needed so that they are
/// strictly increasing across calls on the same namer.
#[derive(Debug, Clone)]
pub struct ReaderNamer {
    clock: Arc<dyn Clock>,
    last_version: Arc<AtomicU64>,
}

impl ReaderNamer {
    /// Creates a namer reading versions from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, last_version: Arc::new(AtomicU64::new(0)) }
    }

    /// Returns a new versioned name for `key`.
    pub fn generate_new_name(&self, key: &SubscriberKey) -> String {
        let now = self.clock.unix_millis();
        let mut previous = self.last_version.load(Ordering::Acquire);
        let version = loop {
            let candidate = now.max(previous.saturating_add(1));
            match self.last_version.compare_exchange_weak(
                previous,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break candidate,
                Err(actual) => previous = actual,
            }
        };
        format!("{}{VERSION_MARKER}{version}", base_name(key))
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;
    use proptest::prelude::*;

    use super::*;

    fn namer_at(ms: u64) -> ReaderNamer {
        ReaderNamer::new(Arc::new(TestClock::at_millis(ms)))
    }

    #[test]
    fn clean_parts_are_kept_and_dlq_is_marked() {
        let key = SubscriberKey::new("orders", "billing-team");
        assert_eq!(base_name(&key), "orders--billing-team");
        assert_eq!(base_name(&key.dead_letter()), "orders--billing-team--dlq");
    }

    #[test]
    fn lossy_parts_are_sanitized_and_tagged_with_a_digest() {
        let base = base_name(&SubscriberKey::new("Order.Created", "billing"));

        let (event, subscriber) = base.split_once(PART_SEPARATOR).unwrap();
        let (readable, digest) = event.split_once(DIGEST_MARKER).unwrap();
        assert_eq!(readable, "order-created");
        assert_eq!(digest.len(), DIGEST_BYTES * 2);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(subscriber, "billing");
        assert_eq!(base, base_name(&SubscriberKey::new("Order.Created", "billing")));
    }

    #[test]
    fn keys_that_sanitize_alike_get_distinct_bases() {
        let keys = [
            SubscriberKey::new("order.created", "billing"),
            SubscriberKey::new("order_created", "billing"),
            SubscriberKey::new("Order Created", "billing"),
            SubscriberKey::new("order-created", "billing"),
        ];
        let bases: BTreeSet<String> = keys.iter().map(base_name).collect();
        assert_eq!(bases.len(), keys.len());
    }

    #[test]
    fn find_old_names_ignores_readers_of_similarly_named_keys() {
        let dotted = SubscriberKey::new("order.created", "billing");
        let underscored = SubscriberKey::new("order_created", "billing");
        let namer = namer_at(7);
        let running = vec![namer.generate_new_name(&dotted), namer.generate_new_name(&underscored)];

        assert_eq!(find_old_names(&dotted, &running), BTreeSet::from([running[0].clone()]));
        assert_eq!(find_old_names(&underscored, &running), BTreeSet::from([running[1].clone()]));
    }

    #[test]
    fn generated_names_are_unique_within_one_millisecond() {
        let namer = namer_at(1_000);
        let key = SubscriberKey::new("orders", "billing");

        let first = namer.generate_new_name(&key);
        let second = namer.generate_new_name(&key);

        assert_eq!(first, "orders--billing--v1000");
        assert_eq!(second, "orders--billing--v1001");
    }

    #[test]
    fn parse_round_trips_generated_names() {
        let namer = namer_at(42);
        let key = SubscriberKey::new("order.created", "billing").dead_letter();
        let name = namer.generate_new_name(&key);

        let record = parse_reader_name(&name).unwrap();
        assert_eq!(record.base_name, base_name(&key));
        assert_eq!(record.version, 42);
        assert_eq!(record.versioned_name, name);
    }

    #[test]
    fn foreign_names_are_not_parsed() {
        assert!(parse_reader_name("unrelated-process").is_none());
        assert!(parse_reader_name("a--b--vx1").is_none());
        assert!(parse_reader_name("--v12").is_none());
        assert!(parse_reader_name("a--b--v").is_none());
    }

    #[test]
    fn find_old_names_matches_only_the_subscriber() {
        let a = SubscriberKey::new("a", "consumer");
        let b = SubscriberKey::new("b", "consumer");
        let running = vec![
            "a--consumer--v1".to_string(),
            "a--consumer--v2".to_string(),
            "b--consumer--v1".to_string(),
        ];

        let old = find_old_names(&a, &running);
        assert_eq!(
            old,
            BTreeSet::from(["a--consumer--v1".to_string(), "a--consumer--v2".to_string()])
        );
        assert_eq!(find_old_names(&b, &running).len(), 1);
    }

    #[test]
    fn dlq_reader_is_not_an_old_primary_reader() {
        let key = SubscriberKey::new("a", "consumer");
        let running = vec!["a--consumer--dlq--v1".to_string()];

        assert!(find_old_names(&key, &running).is_empty());
        assert_eq!(find_old_names(&key.dead_letter(), &running).len(), 1);
    }

    proptest! {
        #[test]
        fn distinct_keys_never_share_a_base(
            e1 in "[A-Za-z0-9._ -]{1,12}",
            s1 in "[A-Za-z0-9._ -]{1,12}",
            e2 in "[A-Za-z0-9._ -]{1,12}",
            s2 in "[A-Za-z0-9._ -]{1,12}",
        ) {
            let k1 = SubscriberKey::new(e1, s1);
            let k2 = SubscriberKey::new(e2, s2);
            if k1 != k2 {
                prop_assert_ne!(base_name(&k1), base_name(&k2));
            }
            prop_assert_ne!(base_name(&k1), base_name(&k1.clone().dead_letter()));
        }

        #[test]
        fn generated_names_parse_back_to_their_base(
            event in "[a-z]{1,8}",
            subscriber in "[a-z]{1,8}",
            start in 0u64..1_000_000,
        ) {
            let key = SubscriberKey::new(event, subscriber);
            let name = namer_at(start).generate_new_name(&key);
            let record = parse_reader_name(&name).unwrap();
            prop_assert_eq!(record.base_name, base_name(&key));
        }
    }
}
