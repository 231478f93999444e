//! Turns watch events into old/new changes.

use kiln_core::ObjectKey;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use rustc_hash::FxHashMap;

use crate::filter::Change;

/// Remembers the last version seen per key. A relist that no longer
/// contains a remembered object yields a `state_unknown` tombstone, since
/// the delete itself was never observed.
pub struct ChangeTracker<K> {
    seen: FxHashMap<ObjectKey, K>,
}

impl<K> Default for ChangeTracker<K> {
    fn default() -> Self {
        Self { seen: FxHashMap::default() }
    }
}

impl<K: ResourceExt + Clone> ChangeTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn applied(&mut self, obj: K) -> Change<K> {
        match self.seen.insert(ObjectKey::of(&obj), obj.clone()) {
            Some(old) => Change::Updated { old, new: obj },
            None => Change::Added(obj),
        }
    }

    pub fn observe(&mut self, ev: Event<K>) -> Vec<Change<K>> {
        match ev {
            Event::Applied(obj) => vec![self.applied(obj)],
            Event::Deleted(obj) => {
                self.seen.remove(&ObjectKey::of(&obj));
                vec![Change::Deleted { obj, state_unknown: false }]
            }
            Event::Restarted(list) => {
                let mut out = Vec::with_capacity(list.len());
                let mut previous = std::mem::take(&mut self.seen);
                for obj in list {
                    let key = ObjectKey::of(&obj);
                    match previous.remove(&key) {
                        Some(old) => out.push(Change::Updated { old, new: obj.clone() }),
                        None => out.push(Change::Added(obj.clone())),
                    }
                    self.seen.insert(key, obj);
                }
                // sorted for a stable emission order
                let mut vanished: Vec<_> = previous.into_iter().collect();
                vanished.sort_by(|a, b| a.0.cmp(&b.0));
                for (_, obj) in vanished {
                    out.push(Change::Deleted { obj, state_unknown: true });
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Kit, KitSpec};

    fn kit(name: &str, generation: i64) -> Kit {
        let mut k = Kit::new(name, KitSpec::default());
        k.metadata.namespace = Some("ns".into());
        k.metadata.generation = Some(generation);
        k
    }

    #[test]
    fn applied_twice_yields_added_then_updated() {
        let mut t = ChangeTracker::new();
        assert!(matches!(t.observe(Event::Applied(kit("a", 1))).as_slice(), [Change::Added(_)]));
        match t.observe(Event::Applied(kit("a", 2))).as_slice() {
            [Change::Updated { old, new }] => {
                assert_eq!(old.generation(), Some(1));
                assert_eq!(new.generation(), Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn confirmed_delete_forgets_object() {
        let mut t = ChangeTracker::new();
        t.observe(Event::Applied(kit("a", 1)));
        let out = t.observe(Event::Deleted(kit("a", 1)));
        assert!(matches!(out.as_slice(), [Change::Deleted { state_unknown: false, .. }]));
        assert!(t.is_empty());
    }

    #[test]
    fn relist_emits_unknown_tombstones_for_vanished_objects() {
        let mut t = ChangeTracker::new();
        t.observe(Event::Applied(kit("a", 1)));
        t.observe(Event::Applied(kit("b", 1)));
        let out = t.observe(Event::Restarted(vec![kit("a", 1), kit("c", 1)]));
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Change::Updated { .. }));
        assert!(matches!(&out[1], Change::Added(k) if k.name_any() == "c"));
        assert!(matches!(&out[2], Change::Deleted { obj, state_unknown: true } if obj.name_any() == "b"));
        assert_eq!(t.len(), 2);
    }
}
