//! Property tests for reproducibility invariants.
//!
//! Uses proptest to verify:
//! 1. Canonical form: deeply-equal documents encode to identical bytes
//!    whatever order their keys were inserted in
//! 2. Deterministic gzip: identical input, identical output and hash
//! 3. Artifact hashes: two writers given the same rows publish the same
//!    `{sha256, bytes}`

use proptest::prelude::*;
use serde_json::{Map, Value};

use dataplane_core::artifact::{gunzip, gzip_deterministic, ArtifactWriter};
use dataplane_core::canonical::{canonical_serialize, to_canonical_ndjson};
use dataplane_core::hashing::sha256_hex;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(4, 64, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            proptest::collection::vec(("[a-z]{1,6}", inner), 0..6).prop_map(|pairs| {
                let mut map = Map::new();
                for (k, v) in pairs {
                    map.insert(k, v);
                }
                Value::Object(map)
            }),
        ]
    })
}

/// Rebuild every object with its keys inserted in reverse order.
fn reversed(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().rev() {
                out.insert(k.clone(), reversed(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(reversed).collect()),
        other => other.clone(),
    }
}

// ── 1. Canonical form ────────────────────────────────────────────────

proptest! {
    #[test]
    fn key_order_never_changes_encoding(doc in arb_value()) {
        let other = reversed(&doc);
        prop_assert_eq!(&doc, &other);
        prop_assert_eq!(canonical_serialize(&doc), canonical_serialize(&other));
    }

    #[test]
    fn canonical_form_round_trips(doc in arb_value()) {
        let text = canonical_serialize(&doc);
        let back: Value = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(canonical_serialize(&back), text);
    }
}

// ── 2. Deterministic gzip ────────────────────────────────────────────

proptest! {
    #[test]
    fn gzip_bytes_and_hash_are_stable(rows in proptest::collection::vec(arb_value(), 0..20)) {
        let plain = to_canonical_ndjson(&rows).unwrap();
        let a = gzip_deterministic(&plain).unwrap();
        let b = gzip_deterministic(&plain).unwrap();
        prop_assert_eq!(sha256_hex(&a), sha256_hex(&b));
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(gunzip(&a).unwrap(), plain);
    }
}

// ── 3. Artifact hashes ───────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn independent_writers_publish_identical_artifacts(
        rows in proptest::collection::vec(arb_value(), 1..10)
    ) {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let reordered: Vec<Value> = rows.iter().map(reversed).collect();

        let a = ArtifactWriter::new(d1.path())
            .write_gzip_ndjson("out/rows.ndjson.gz", &rows)
            .unwrap();
        let b = ArtifactWriter::new(d2.path())
            .write_gzip_ndjson("out/rows.ndjson.gz", &reordered)
            .unwrap();
        prop_assert_eq!(a, b);
    }
}
