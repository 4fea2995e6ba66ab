/// In-process registry of the event ids this replica currently holds locked.
///
/// The processor registers claimed ids before touching any of them and
/// removes each id when its delivery reaches a terminal outcome. The
/// shutdown hook snapshots whatever is left and returns those rows to the
/// queue, so a graceful stop loses no in-flight work.
use std::collections::HashSet;
use std::sync::Mutex;

use chime_core::types::EventClass;

#[derive(Debug, Default)]
pub struct LockedEvents {
    cron: Mutex<HashSet<String>>,
    oneoff: Mutex<HashSet<String>>,
}

impl LockedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, class: EventClass) -> &Mutex<HashSet<String>> {
        match class {
            EventClass::Cron => &self.cron,
            EventClass::OneOff => &self.oneoff,
        }
    }

    pub fn insert_many(&self, class: EventClass, ids: impl IntoIterator<Item = String>) {
        let mut set = self.set(class).lock().expect("locked-events mutex poisoned");
        set.extend(ids);
    }

    pub fn remove(&self, class: EventClass, id: &str) {
        let mut set = self.set(class).lock().expect("locked-events mutex poisoned");
        set.remove(id);
    }

    pub fn contains(&self, class: EventClass, id: &str) -> bool {
        let set = self.set(class).lock().expect("locked-events mutex poisoned");
        set.contains(id)
    }

    /// Ids currently held for the given class.
    pub fn snapshot(&self, class: EventClass) -> Vec<String> {
        let set = self.set(class).lock().expect("locked-events mutex poisoned");
        set.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn classes_are_disjoint() {
        let registry = LockedEvents::new();
        registry.insert_many(EventClass::Cron, ["a".to_string()]);
        registry.insert_many(EventClass::OneOff, ["b".to_string()]);

        assert!(registry.contains(EventClass::Cron, "a"));
        assert!(!registry.contains(EventClass::OneOff, "a"));
        assert_eq!(registry.snapshot(EventClass::OneOff), vec!["b".to_string()]);
    }

    #[test]
    fn remove_clears_only_the_given_id() {
        let registry = LockedEvents::new();
        registry.insert_many(EventClass::Cron, ["a".to_string(), "b".to_string()]);
        registry.remove(EventClass::Cron, "a");

        assert!(!registry.contains(EventClass::Cron, "a"));
        assert!(registry.contains(EventClass::Cron, "b"));
    }

    #[tokio::test]
    async fn tolerates_concurrent_mutation() {
        let registry = Arc::new(LockedEvents::new());

        let mut handles = Vec::new();
        for batch in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let ids: Vec<String> = (0..50).map(|i| format!("{batch}-{i}")).collect();
                registry.insert_many(EventClass::Cron, ids.clone());
                for id in &ids[..25] {
                    registry.remove(EventClass::Cron, id);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.snapshot(EventClass::Cron).len(), 8 * 25);
    }
}
