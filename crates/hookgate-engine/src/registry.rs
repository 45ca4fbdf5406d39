//! Hook registry resolution
//!
//! Turns the constructed hooks plus the config's `order` and `disabled`
//! lists into the one dispatch order used for the life of the process.
//! Pure: no I/O, no reliance on hash iteration order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::hooks::Hook;

/// Resolve the active, ordered hook list
///
/// 1. Hooks named in `disabled` are dropped.
/// 2. Hooks named in `order` come first, by their first position there.
/// 3. Everything else follows by ascending priority, ties by id.
pub fn resolve(
    hooks: &[Arc<dyn Hook>],
    order: &[String],
    disabled: &BTreeSet<String>,
) -> Vec<Arc<dyn Hook>> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (idx, id) in order.iter().enumerate() {
        positions.entry(id.as_str()).or_insert(idx);
    }

    let (mut listed, mut unlisted): (Vec<_>, Vec<_>) = hooks
        .iter()
        .filter(|hook| !disabled.contains(hook.id()))
        .cloned()
        .partition(|hook| positions.contains_key(hook.id()));

    listed.sort_by(|a, b| {
        positions[a.id()]
            .cmp(&positions[b.id()])
            .then_with(|| a.id().cmp(b.id()))
    });
    unlisted.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| a.id().cmp(b.id()))
    });

    listed.extend(unlisted);
    listed
}

/// Ids of a resolved order, for logging and the CLI
pub fn resolved_ids(hooks: &[Arc<dyn Hook>]) -> Vec<String> {
    hooks.iter().map(|hook| hook.id().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{FailurePolicy, HookEvent};
    use async_trait::async_trait;
    use hookgate_core::Result;

    struct Named {
        id: String,
        priority: i32,
    }

    #[async_trait]
    impl Hook for Named {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn failure_policy(&self) -> FailurePolicy {
            FailurePolicy::FailOpen
        }

        async fn handle(&self, _event: &mut HookEvent<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn hook(id: &str, priority: i32) -> Arc<dyn Hook> {
        Arc::new(Named {
            id: id.to_string(),
            priority,
        })
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sample_hooks() -> Vec<Arc<dyn Hook>> {
        vec![
            hook("process-pressure-monitor", 60),
            hook("autopilot", 20),
            hook("zeta", 50),
            hook("alpha", 50),
            hook("stop-continuation-guard", 10),
        ]
    }

    #[test]
    fn test_priority_then_id_without_order() {
        let resolved = resolve(&sample_hooks(), &[], &BTreeSet::new());
        assert_eq!(
            resolved_ids(&resolved),
            strings(&[
                "stop-continuation-guard",
                "autopilot",
                "alpha",
                "zeta",
                "process-pressure-monitor",
            ])
        );
    }

    #[test]
    fn test_order_list_wins_over_priority() {
        let order = strings(&["process-pressure-monitor", "zeta", "not-a-hook"]);
        let resolved = resolve(&sample_hooks(), &order, &BTreeSet::new());
        assert_eq!(
            resolved_ids(&resolved),
            strings(&[
                "process-pressure-monitor",
                "zeta",
                "stop-continuation-guard",
                "autopilot",
                "alpha",
            ])
        );
    }

    #[test]
    fn test_disabled_hooks_are_dropped_even_if_ordered() {
        let order = strings(&["autopilot"]);
        let disabled: BTreeSet<String> = strings(&["autopilot", "zeta"]).into_iter().collect();
        let resolved = resolve(&sample_hooks(), &order, &disabled);
        assert_eq!(
            resolved_ids(&resolved),
            strings(&[
                "stop-continuation-guard",
                "alpha",
                "process-pressure-monitor",
            ])
        );
    }

    #[test]
    fn test_duplicate_order_entries_use_first_position() {
        let order = strings(&["alpha", "zeta", "alpha"]);
        let resolved = resolve(&sample_hooks(), &order, &BTreeSet::new());
        assert_eq!(
            resolved_ids(&resolved)[..2],
            strings(&["alpha", "zeta"])[..]
        );
    }

    #[test]
    fn test_resolution_is_pure() {
        let hooks = sample_hooks();
        let order = strings(&["zeta"]);
        let disabled: BTreeSet<String> = strings(&["alpha"]).into_iter().collect();

        let first = resolved_ids(&resolve(&hooks, &order, &disabled));
        let second = resolved_ids(&resolve(&hooks, &order, &disabled));
        assert_eq!(first, second);

        // Input order does not leak into the result
        let mut reversed = hooks.clone();
        reversed.reverse();
        let third = resolved_ids(&resolve(&reversed, &order, &disabled));
        assert_eq!(first, third);
    }

    #[test]
    fn test_empty_input() {
        assert!(resolve(&[], &strings(&["a"]), &BTreeSet::new()).is_empty());
    }
}
