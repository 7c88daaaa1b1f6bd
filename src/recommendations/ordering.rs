use std::collections::{HashMap, HashSet};

use super::types::Recommendation;

/// Batch execution plan derived from in-batch dependencies.
///
/// Every recommendation in a wave depends only on recommendations in earlier
/// waves. Dependencies that are not part of the batch are assumed to be
/// deployed already and do not constrain ordering.
#[derive(Debug, Clone, Default)]
pub struct DependencyPlan {
    pub waves: Vec<Vec<Recommendation>>,
    /// Recommendations that sit on, or depend on, a dependency cycle, with
    /// the unresolved in-batch prerequisites of each.
    pub cyclic: Vec<(Recommendation, Vec<String>)>,
}

impl DependencyPlan {
    pub fn ordered(&self) -> impl Iterator<Item = &Recommendation> {
        self.waves.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(Vec::len).sum::<usize>() + self.cyclic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep at most `max` recommendations, preserving wave order. Cyclic
    /// recommendations are reported too, so they take whatever slots the
    /// waves leave.
    pub fn truncate(&mut self, max: usize) {
        let mut remaining = max;
        for wave in &mut self.waves {
            if wave.len() > remaining {
                wave.truncate(remaining);
            }
            remaining -= wave.len();
        }
        self.waves.retain(|w| !w.is_empty());
        self.cyclic.truncate(remaining);
    }
}

/// Kahn's algorithm over the batch. Within a wave, higher priority first and
/// then input order.
pub fn plan_waves(recommendations: &[Recommendation]) -> DependencyPlan {
    let in_batch: HashSet<&str> = recommendations.iter().map(|r| r.id.as_str()).collect();
    let position: HashMap<&str, usize> = recommendations
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.as_str(), i))
        .collect();

    let mut pending: HashMap<&str, HashSet<&str>> = recommendations
        .iter()
        .map(|r| {
            let deps = r
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|d| in_batch.contains(d))
                .collect();
            (r.id.as_str(), deps)
        })
        .collect();

    let mut plan = DependencyPlan::default();
    let mut done: HashSet<&str> = HashSet::new();

    loop {
        let mut ready: Vec<&Recommendation> = recommendations
            .iter()
            .filter(|r| !done.contains(r.id.as_str()))
            .filter(|r| {
                pending
                    .get(r.id.as_str())
                    .map(|deps| deps.iter().all(|d| done.contains(d)))
                    .unwrap_or(true)
            })
            .collect();

        if ready.is_empty() {
            break;
        }

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| position[a.id.as_str()].cmp(&position[b.id.as_str()]))
        });

        for rec in &ready {
            done.insert(rec.id.as_str());
        }
        plan.waves.push(ready.into_iter().cloned().collect());
    }

    for rec in recommendations {
        if !done.contains(rec.id.as_str()) {
            let unresolved = pending
                .remove(rec.id.as_str())
                .unwrap_or_default()
                .into_iter()
                .filter(|d| !done.contains(d))
                .map(str::to_string)
                .collect::<Vec<_>>();
            let mut unresolved = unresolved;
            unresolved.sort();
            plan.cyclic.push((rec.clone(), unresolved));
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use crate::recommendations::DataRequirements;

    fn rec(id: &str, deps: &[&str]) -> Recommendation {
        Recommendation {
            id: id.into(),
            title: format!("Title {id}"),
            description: "desc".into(),
            category: String::new(),
            priority: Priority::Normal,
            data_requirements: DataRequirements::default(),
            integration_hints: vec![],
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn ids(wave: &[Recommendation]) -> Vec<&str> {
        wave.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_independent_items_form_one_wave() {
        let plan = plan_waves(&[rec("a", &[]), rec("b", &[]), rec("c", &[])]);
        assert_eq!(plan.waves.len(), 1);
        assert_eq!(ids(&plan.waves[0]), vec!["a", "b", "c"]);
        assert!(plan.cyclic.is_empty());
    }

    #[test]
    fn test_dependencies_come_first() {
        let plan = plan_waves(&[rec("c", &["b"]), rec("b", &["a"]), rec("a", &[])]);
        assert_eq!(plan.waves.len(), 3);
        assert_eq!(ids(&plan.waves[0]), vec!["a"]);
        assert_eq!(ids(&plan.waves[1]), vec!["b"]);
        assert_eq!(ids(&plan.waves[2]), vec!["c"]);
    }

    #[test]
    fn test_external_dependencies_are_ignored() {
        let plan = plan_waves(&[rec("a", &["already-shipped"])]);
        assert_eq!(ids(&plan.waves[0]), vec!["a"]);
    }

    #[test]
    fn test_cycles_are_reported() {
        let plan = plan_waves(&[rec("a", &["b"]), rec("b", &["a"]), rec("c", &[]), rec("d", &["a"])]);
        assert_eq!(ids(&plan.waves[0]), vec!["c"]);
        let cyclic: Vec<&str> = plan.cyclic.iter().map(|(r, _)| r.id.as_str()).collect();
        assert_eq!(cyclic, vec!["a", "b", "d"]);
        assert_eq!(plan.cyclic[2].1, vec!["a"]);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn test_priority_orders_within_wave() {
        let mut low = rec("low", &[]);
        low.priority = Priority::Low;
        let mut critical = rec("crit", &[]);
        critical.priority = Priority::Critical;
        let plan = plan_waves(&[low, rec("normal", &[]), critical]);
        assert_eq!(ids(&plan.waves[0]), vec!["crit", "low", "normal"]);
    }

    #[test]
    fn test_truncate_keeps_wave_order() {
        let mut plan = plan_waves(&[rec("a", &[]), rec("b", &["a"]), rec("c", &[])]);
        plan.truncate(2);
        let kept: Vec<&str> = plan.ordered().map(|r| r.id.as_str()).collect();
        assert_eq!(kept, vec!["a", "c"]);
        assert_eq!(plan.waves.len(), 1);
    }

    #[test]
    fn test_truncate_counts_cyclic_recommendations() {
        let mut plan = plan_waves(&[
            rec("a", &["b"]),
            rec("b", &["a"]),
            rec("c", &[]),
            rec("d", &[]),
        ]);
        plan.truncate(3);
        assert_eq!(plan.len(), 3);
        let kept: Vec<&str> = plan.ordered().map(|r| r.id.as_str()).collect();
        assert_eq!(kept, vec!["c", "d"]);
        let cyclic: Vec<&str> = plan.cyclic.iter().map(|(r, _)| r.id.as_str()).collect();
        assert_eq!(cyclic, vec!["a"]);

        plan.truncate(1);
        assert_eq!(plan.len(), 1);
        assert!(plan.cyclic.is_empty());
    }
}
