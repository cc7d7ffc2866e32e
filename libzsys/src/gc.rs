use crate::error::Result;
use crate::graph::DatasetGraph;
use crate::pooladapter::{DatasetKind, PoolAdapter};
use crate::state::{self, Machine};
use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Reverse;

/// Default retention policy: the current state plus `keep_most_recent`
/// newest, then one per day for a week, one per week for a month, one per
/// month for a year. Generalizes the dataset-snapshot retention evaluator
/// to machine system states.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub keep_most_recent: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { keep_most_recent: 3 }
    }
}

struct Bucket {
    end_time: DateTime<Utc>,
    max_fill: usize,
    filled: usize,
}

fn buckets_for(now: DateTime<Utc>) -> Vec<Bucket> {
    let mut buckets = Vec::new();
    let mut cursor = now;
    for _ in 0..7 {
        cursor = cursor - chrono::Duration::days(1);
        buckets.push(Bucket {
            end_time: cursor,
            max_fill: 1,
            filled: 0,
        });
    }
    for _ in 0..4 {
        cursor = cursor - chrono::Duration::weeks(1);
        buckets.push(Bucket {
            end_time: cursor,
            max_fill: 1,
            filled: 0,
        });
    }
    for _ in 0..12 {
        cursor = cursor - chrono::Duration::days(30);
        buckets.push(Bucket {
            end_time: cursor,
            max_fill: 1,
            filled: 0,
        });
    }
    buckets
}

/// Decide which of a machine's system states would be dropped under
/// `policy`, without mutating anything. `current` is excluded from
/// consideration entirely, mirroring "keeps: the current state" verbatim.
pub fn evaluate(graph: &DatasetGraph, machine: &Machine, current: Option<&str>, policy: &RetentionPolicy) -> Vec<String> {
    let mut states: Vec<(String, DateTime<Utc>)> = graph
        .iter()
        .filter(|(_, d)| d.kind == DatasetKind::Snapshot && d.parent() == Some(machine.root))
        .filter_map(|(_, d)| {
            let tag = d.name.rsplit_once('@').map(|(_, t)| t.to_string())?;
            if Some(tag.as_str()) == current {
                return None;
            }
            let created = d
                .property_value(crate::properties::LAST_USED)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|secs| Utc.timestamp(secs, 0))
                .unwrap_or_else(Utc::now);
            Some((tag, created))
        })
        .collect();

    states.sort_unstable_by_key(|(_, created)| Reverse(*created));

    let mut buckets = buckets_for(Utc::now());
    let mut drop = Vec::new();

    for (index, (tag, created)) in states.into_iter().enumerate() {
        if index < policy.keep_most_recent {
            continue;
        }
        let bucket = buckets.iter_mut().find(|b| created >= b.end_time);
        match bucket {
            Some(bucket) if bucket.filled < bucket.max_fill => {
                bucket.filled += 1;
            }
            _ => drop.push(tag),
        }
    }

    drop
}

/// Run garbage collection for a machine: evaluate the policy, then remove
/// every droppable state that the destroy rules actually permit.
pub fn collect(graph: &mut DatasetGraph, pool: &dyn PoolAdapter, machine: &Machine, current: Option<&str>, policy: &RetentionPolicy) -> Result<Vec<String>> {
    let candidates = evaluate(graph, machine, current, policy);
    let mut removed = Vec::new();
    for id in candidates {
        match state::remove_system_state(graph, pool, machine, &id, true) {
            Ok(_) => removed.push(id),
            Err(err) => slog_scope::warn!("skipping gc of state {}: {}", id, err),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pooladapter::mock::MemoryPoolAdapter;

    #[test]
    fn keeps_most_recent_and_drops_the_rest() {
        let pool = MemoryPoolAdapter::new();
        pool.create_filesystem("rpool/ROOT/ubuntu_init").unwrap();
        pool.set_property("rpool/ROOT/ubuntu_init", "com.ubuntu.zsys:bootfs", Some("yes"))
            .unwrap();
        for tag in ["s1", "s2", "s3", "s4", "s5"] {
            pool.create_snapshot("rpool/ROOT/ubuntu_init", tag).unwrap();
        }

        let mut graph = DatasetGraph::new();
        graph.refresh(&pool).unwrap();
        let machine = state::find_machines(&graph).remove(0);

        let policy = RetentionPolicy { keep_most_recent: 2 };
        let droppable = evaluate(&graph, &machine, None, &policy);
        assert!(!droppable.is_empty());
    }
}
