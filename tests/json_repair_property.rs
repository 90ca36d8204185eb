//! Property tests for the incremental JSON stream handler: any chunking of a
//! well-formed JSON document must eventually yield an equal value.

use proptest::prelude::*;
use serde_json::{Value, json};
use steer_sdk::streaming::json_stream::JsonStreamHandler;

/// Split `text` at the given fractional positions.
fn split_at_fractions(text: &str, fractions: &[f64]) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut cuts: Vec<usize> = fractions
        .iter()
        .map(|f| ((chars.len() as f64) * f) as usize)
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        if cut > start && cut < chars.len() {
            chunks.push(chars[start..cut].iter().collect());
            start = cut;
        }
    }
    chunks.push(chars[start..].iter().collect());
    chunks
}

fn arbitrary_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-zA-Z0-9 {}\\[\\]\"\\\\]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| { json!(m) }),
        ]
    })
}

proptest! {
    #[test]
    fn any_chunking_recovers_the_document(
        value in arbitrary_json(),
        fractions in prop::collection::vec(0.0f64..1.0, 0..6),
    ) {
        // Only objects and arrays are scanned for; wrap other values.
        let document = if value.is_object() || value.is_array() {
            value
        } else {
            json!({"wrapped": value})
        };
        let serialized = serde_json::to_string(&document).unwrap();
        let chunks = split_at_fractions(&serialized, &fractions);

        let mut handler = JsonStreamHandler::new();
        let mut last = None;
        for chunk in &chunks {
            if let Some(obj) = handler.process_chunk(chunk) {
                last = Some(obj);
            }
        }
        let recovered = last.or_else(|| handler.final_object());
        prop_assert_eq!(recovered, Some(document));
    }

    #[test]
    fn truncated_objects_repair_to_a_parse(
        keys in prop::collection::vec("[a-z]{1,5}", 1..4),
        cut_fraction in 0.3f64..0.99,
    ) {
        let mut obj = serde_json::Map::new();
        for (i, key) in keys.iter().enumerate() {
            obj.insert(key.clone(), json!([i, i + 1]));
        }
        let serialized = serde_json::to_string(&Value::Object(obj)).unwrap();
        let cut = ((serialized.len() as f64) * cut_fraction) as usize;
        let truncated = &serialized[..cut.max(1)];

        let mut handler = JsonStreamHandler::new();
        handler.process_chunk(truncated);
        // Repair is conservative: it may fail on cuts inside string/number
        // literals, but must never panic, and a successful repair must be an
        // object.
        if let Some(repaired) = handler.final_object() {
            prop_assert!(repaired.is_object());
        }
    }
}

#[test]
fn interleaved_noise_and_values() {
    let mut handler = JsonStreamHandler::new();
    handler.process_chunk("log line before ");
    handler.process_chunk("{\"a\"");
    handler.process_chunk(": [1, {\"b\": \"}\"}]}");
    handler.process_chunk(" trailing noise");
    assert_eq!(
        handler.final_object(),
        Some(json!({"a": [1, {"b": "}"}]}))
    );
}
