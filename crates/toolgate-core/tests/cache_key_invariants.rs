//! Property tests for the cache-key determinism invariant from the data
//! model (§3): equal params must hash to equal keys regardless of object
//! key order.

use proptest::prelude::*;
use serde_json::{json, Value};
use toolgate_core::cache_key;
use uuid::Uuid;

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{1,8}".prop_map(Value::String),
    ]
}

proptest! {
    #[test]
    fn key_is_stable_under_object_key_reordering(a in arb_scalar(), b in arb_scalar(), c in arb_scalar()) {
        let server_id = Uuid::nil();
        let forward = json!({"a": a.clone(), "b": b.clone(), "c": c.clone()});
        let backward = json!({"c": c, "b": b, "a": a});
        prop_assert_eq!(
            cache_key("tool", server_id, "read", &forward),
            cache_key("tool", server_id, "read", &backward)
        );
    }

    #[test]
    fn equal_scalar_params_produce_equal_keys(n in any::<i64>()) {
        let server_id = Uuid::nil();
        let key1 = cache_key("tool", server_id, "read", &json!({"n": n}));
        let key2 = cache_key("tool", server_id, "read", &json!({"n": n}));
        prop_assert_eq!(key1, key2);
    }

    #[test]
    fn different_server_ids_never_collide(n in any::<i64>()) {
        let a = cache_key("tool", Uuid::nil(), "read", &json!({"n": n}));
        let b = cache_key("tool", Uuid::max(), "read", &json!({"n": n}));
        prop_assert_ne!(a, b);
    }

    #[test]
    fn empty_params_always_hash_to_the_literal_none(_unit in Just(())) {
        let server_id = Uuid::nil();
        let empty_object = json!({});
        prop_assert!(cache_key("tool", server_id, "read", &Value::Null).ends_with(":none"));
        prop_assert!(cache_key("tool", server_id, "read", &empty_object).ends_with(":none"));
    }
}
