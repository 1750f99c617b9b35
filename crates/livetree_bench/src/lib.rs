//! Benchmark utilities.

use livetree_codec::Value;
use livetree_core::Path;
use rand::Rng;
use std::collections::BTreeMap;

/// A map `depth` levels deep with `width` children per level.
pub fn nested_value(depth: usize, width: usize) -> Value {
    if depth == 0 {
        return Value::Text("leaf".into());
    }
    let children: BTreeMap<String, Value> = (0..width)
        .map(|i| (format!("key_{i}"), nested_value(depth - 1, width)))
        .collect();
    Value::Map(children)
}

/// A flat map of `count` random numbers keyed `item_0..`.
pub fn random_scores(count: usize) -> Value {
    let mut rng = rand::thread_rng();
    let children: BTreeMap<String, Value> = (0..count)
        .map(|i| (format!("item_{i}"), Value::Number(rng.gen_range(0..1_000) as f64)))
        .collect();
    Value::Map(children)
}

/// `count` random paths up to `depth` keys deep under `prefix`.
pub fn random_paths(prefix: &str, count: usize, depth: usize) -> Vec<Path> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let len = rng.gen_range(1..=depth);
            let keys: Vec<String> = (0..len)
                .map(|_| format!("k{}", rng.gen_range(0..16)))
                .collect();
            let relative = keys.join("/");
            Path::parse(&format!("{prefix}/{relative}")).expect("generated path is valid")
        })
        .collect()
}
