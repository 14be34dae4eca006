//! Dense per-group ordering.

use std::collections::{BTreeMap, HashMap};

/// Assign `1..=N` within each group, ascending by id.
///
/// Takes `(group, id)` pairs and returns `id -> order`. The result depends
/// only on the set of pairs, never on the order they are presented in.
pub fn dense_order<K, I>(pairs: I) -> HashMap<i64, i64>
where
    K: Ord,
    I: IntoIterator<Item = (K, i64)>,
{
    let mut groups: BTreeMap<K, Vec<i64>> = BTreeMap::new();
    for (group, id) in pairs {
        groups.entry(group).or_default().push(id);
    }

    let mut order = HashMap::new();
    for (_, mut ids) in groups {
        ids.sort_unstable();
        ids.dedup();
        for (position, id) in ids.into_iter().enumerate() {
            order.insert(id, position as i64 + 1);
        }
    }
    order
}
