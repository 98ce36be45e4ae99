//! Test grouping and sharding
//!
//! Partitions the suite tree into worker-affinity groups and splits the
//! ordered group list across shards.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::suite::{HookKind, ParallelMode, Suite, TestId};

/// Maximal set of tests dispatchable to one worker without a restart
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestGroup {
    pub worker_hash: String,
    pub require_file: String,
    pub repeat_each_index: usize,
    pub project_index: usize,
    /// Ordered; a worker runs these sequentially in one job.
    pub tests: Vec<TestId>,
}

impl TestGroup {
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Hash deciding worker reuse: two groups with equal hashes may share a
/// worker process.
pub fn worker_hash(project_index: usize, repeat_each_index: usize, digest: &str) -> String {
    format!("run{project_index}-repeat{repeat_each_index}-{digest}")
}

/// How one test may be scheduled, derived from its suite chain
#[derive(PartialEq)]
enum Placement {
    /// Sequential on one worker, declaration order.
    General,
    /// Freely schedulable alone.
    Singleton,
    /// Parallel but amortizing beforeAll/afterAll hooks.
    ParallelWithHooks,
}

struct FileBucket {
    worker_hash: String,
    require_file: String,
    general: Vec<TestId>,
    singletons: Vec<TestId>,
    with_hooks: Vec<TestId>,
}

/// Partition the suite into worker-affinity groups.
///
/// Group key is (workerHash, requireFile). Within a key, tests outside any
/// parallel suite form one ordered general group; tests inside a parallel
/// suite become singleton groups, or `ceil(n / workers)` roughly equal
/// chunks when the parallel suite carries beforeAll/afterAll hooks.
pub fn create_test_groups(
    suite: &Suite,
    workers: usize,
    repeat_each_index: usize,
    project_index: usize,
) -> Vec<TestGroup> {
    let mut buckets: Vec<FileBucket> = Vec::new();

    for (chain, test) in suite.tests_with_chain() {
        let mut mode = ParallelMode::Default;
        for ancestor in &chain {
            if ancestor.parallel_mode != ParallelMode::Default {
                mode = ancestor.parallel_mode;
            }
        }
        let has_all_hooks = chain.iter().any(|s| {
            s.has_hooks_of(HookKind::BeforeAll) || s.has_hooks_of(HookKind::AfterAll)
        });
        let placement = match mode {
            ParallelMode::Parallel if has_all_hooks => Placement::ParallelWithHooks,
            ParallelMode::Parallel => Placement::Singleton,
            _ => Placement::General,
        };

        let hash = worker_hash(project_index, repeat_each_index, &test.pool.digest);
        let position = buckets
            .iter()
            .position(|b| b.worker_hash == hash && b.require_file == test.require_file)
            .unwrap_or_else(|| {
                buckets.push(FileBucket {
                    worker_hash: hash,
                    require_file: test.require_file.clone(),
                    general: Vec::new(),
                    singletons: Vec::new(),
                    with_hooks: Vec::new(),
                });
                buckets.len() - 1
            });
        let bucket = &mut buckets[position];
        match placement {
            Placement::General => bucket.general.push(test.id.clone()),
            Placement::Singleton => bucket.singletons.push(test.id.clone()),
            Placement::ParallelWithHooks => bucket.with_hooks.push(test.id.clone()),
        }
    }

    let mut groups = Vec::new();
    for bucket in buckets {
        let make = |tests: Vec<TestId>| TestGroup {
            worker_hash: bucket.worker_hash.clone(),
            require_file: bucket.require_file.clone(),
            repeat_each_index,
            project_index,
            tests,
        };
        if !bucket.general.is_empty() {
            groups.push(make(bucket.general.clone()));
        }
        for chunk in chunk_evenly(&bucket.with_hooks, workers) {
            groups.push(make(chunk));
        }
        for test in &bucket.singletons {
            groups.push(make(vec![test.clone()]));
        }
    }
    debug!(groups = groups.len(), "created test groups");
    groups
}

/// Split into `ceil(n / workers)` contiguous, roughly equal chunks.
fn chunk_evenly(tests: &[TestId], workers: usize) -> Vec<Vec<TestId>> {
    if tests.is_empty() {
        return Vec::new();
    }
    let workers = workers.max(1);
    let count = tests.len().div_ceil(workers);
    let base = tests.len() / count;
    let extra = tests.len() % count;
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0;
    for index in 0..count {
        let size = base + usize::from(index < extra);
        chunks.push(tests[offset..offset + size].to_vec());
        offset += size;
    }
    chunks
}

/// 1-based shard selector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub current: usize,
    pub total: usize,
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.total)
    }
}

/// Keep only the groups belonging to one shard.
///
/// Shard sizes are `floor(T/S)` tests, the first `T mod S` shards taking
/// one extra. A group goes entirely to the shard containing its first
/// test, so groups are never split.
pub fn filter_for_shard(shard: Shard, groups: Vec<TestGroup>) -> Vec<TestGroup> {
    let total: usize = groups.iter().map(TestGroup::len).sum();
    let base = total / shard.total;
    let extra = total % shard.total;
    let index = shard.current - 1;
    let start = index * base + index.min(extra);
    let end = start + base + usize::from(index < extra);

    let mut kept = Vec::new();
    let mut first_test_index = 0;
    for group in groups {
        let len = group.len();
        if first_test_index >= start && first_test_index < end {
            kept.push(group);
        }
        first_test_index += len;
    }
    kept
}
