//! Call-to-call priorities and the weighted table used to pick the next syscall.

use crate::prog::Prog;
use crate::target::{BufferKind, Target, TypeId, TypeKind};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Upper bound of a normalized priority row.
const PRIO_SCALE: f32 = 1000.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChoiceTableError {
    /// The enabled set is empty, nothing could ever be chosen.
    #[error("no syscalls are enabled")]
    NoEnabledCalls,

    #[error("unknown syscall `{0}`")]
    UnknownSyscall(String),

    /// The priority matrix is not `n x n` for the target's `n` syscalls.
    #[error("priority matrix must be {expected}x{expected}")]
    PrioritiesShape { expected: usize },
}

/// Things a call touches that make it related to other calls touching them.
fn call_uses(target: &Target, id: usize) -> HashMap<String, f32> {
    let call = &target.syscalls[id];
    let mut uses = HashMap::new();
    let mut note = |key: String, weight: f32| {
        let w = uses.entry(key).or_insert(0.0f32);
        *w = w.max(weight);
    };
    let mut seen: HashSet<TypeId> = HashSet::new();
    let mut stack: Vec<TypeId> = call.args.iter().chain(call.ret.iter()).copied().collect();
    while let Some(ty) = stack.pop() {
        if !seen.insert(ty) {
            continue;
        }
        match &target.ty(ty).kind {
            TypeKind::Resource { desc } => {
                let kind = &target.resource(*desc).kind;
                for depth in 1..=kind.len() {
                    let weight = if depth == kind.len() { 1.0 } else { 0.3 };
                    note(format!("res:{}", kind[..depth].join(":")), weight);
                }
            }
            TypeKind::Buffer(BufferKind::Filename) => note("filename".to_string(), 1.0),
            TypeKind::Vma => note("vma".to_string(), 0.5),
            TypeKind::Ptr { elem } | TypeKind::Array { elem, .. } => stack.push(*elem),
            TypeKind::Struct { fields } => stack.extend(fields.iter().copied()),
            TypeKind::Union { options, .. } => stack.extend(options.iter().copied()),
            _ => {}
        }
    }
    uses
}

fn normalize(rows: &mut [Vec<f32>]) {
    for row in rows {
        let max = row.iter().copied().fold(0.0f32, f32::max);
        if max > 0.0 {
            row.iter_mut().for_each(|v| *v = *v / max * PRIO_SCALE);
        }
    }
}

fn static_priorities(target: &Target) -> Vec<Vec<f32>> {
    let n = target.syscalls.len();
    let uses: Vec<HashMap<String, f32>> = (0..n).map(|id| call_uses(target, id)).collect();
    let mut prios = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        for j in 0..n {
            prios[i][j] = uses[i]
                .iter()
                .filter_map(|(key, wi)| uses[j].get(key).map(|wj| wi * wj))
                .sum();
        }
    }
    normalize(&mut prios);
    prios
}

fn dynamic_priorities(target: &Target, corpus: &[Prog]) -> Vec<Vec<f32>> {
    let n = target.syscalls.len();
    let mut prios = vec![vec![0.0f32; n]; n];
    for prog in corpus {
        let ids: HashSet<usize> = prog
            .calls
            .iter()
            .map(|c| c.meta.id)
            .filter(|&id| id < n)
            .collect();
        for &i in &ids {
            for &j in &ids {
                if i != j {
                    prios[i][j] += 1.0;
                }
            }
        }
    }
    normalize(&mut prios);
    prios
}

/// Relatedness of every ordered syscall pair: static type overlap plus
/// co-occurrence in `corpus`. Every entry is at least 1.
pub fn calculate_priorities(target: &Target, corpus: &[Prog]) -> Vec<Vec<u32>> {
    let stat = static_priorities(target);
    let dynamic = dynamic_priorities(target, corpus);
    stat.iter()
        .zip(&dynamic)
        .map(|(s, d)| {
            s.iter()
                .zip(d)
                .map(|(a, b)| ((a + b) as u32).max(1))
                .collect()
        })
        .collect()
}

/// Resolves syscall names into ids for [`ChoiceTable::build`].
pub fn enabled_by_name<S: AsRef<str>>(
    target: &Target,
    names: &[S],
) -> Result<HashSet<usize>, ChoiceTableError> {
    names
        .iter()
        .map(|name| {
            target
                .syscall(name.as_ref())
                .map(|c| c.id)
                .ok_or_else(|| ChoiceTableError::UnknownSyscall(name.as_ref().to_string()))
        })
        .collect()
}

/// Weighted distribution of the next syscall given the previous one.
#[derive(Debug, Clone)]
pub struct ChoiceTable {
    enabled_calls: Vec<usize>,
    enabled: Vec<bool>,
    /// Cumulative weights over `enabled_calls`, one row per previous syscall.
    runs: Vec<Vec<u64>>,
}

impl ChoiceTable {
    pub fn build(
        target: &Target,
        prios: Option<&[Vec<u32>]>,
        enabled: Option<&HashSet<usize>>,
    ) -> Result<Self, ChoiceTableError> {
        let n = target.syscalls.len();
        let mut enabled_calls: Vec<usize> = match enabled {
            Some(set) => {
                if let Some(bad) = set.iter().find(|&&id| id >= n) {
                    return Err(ChoiceTableError::UnknownSyscall(format!("#{}", bad)));
                }
                set.iter().copied().collect()
            }
            None => (0..n).collect(),
        };
        enabled_calls.sort_unstable();
        if enabled_calls.is_empty() {
            return Err(ChoiceTableError::NoEnabledCalls);
        }
        if let Some(prios) = prios {
            if prios.len() != n || prios.iter().any(|row| row.len() != n) {
                return Err(ChoiceTableError::PrioritiesShape { expected: n });
            }
        }

        let mut mask = vec![false; n];
        for &id in &enabled_calls {
            mask[id] = true;
        }
        let runs = (0..n)
            .map(|prev| {
                if !mask[prev] {
                    return Vec::new();
                }
                let mut sum = 0u64;
                enabled_calls
                    .iter()
                    .map(|&next| {
                        sum += prios.map_or(1, |p| u64::from(p[prev][next]));
                        sum
                    })
                    .collect()
            })
            .collect();
        log::debug!(
            "choice table: {} of {} syscalls enabled",
            enabled_calls.len(),
            n
        );
        Ok(Self {
            enabled_calls,
            enabled: mask,
            runs,
        })
    }

    pub fn enabled(&self, id: usize) -> bool {
        self.enabled.get(id).copied().unwrap_or(false)
    }

    pub fn enabled_calls(&self) -> &[usize] {
        &self.enabled_calls
    }

    /// Picks a syscall id, weighted by the row of `prev` when it has one.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R, prev: Option<usize>) -> usize {
        let run = prev
            .and_then(|p| self.runs.get(p))
            .filter(|run| run.last().is_some_and(|&total| total > 0));
        match run {
            Some(run) => {
                let total = run[run.len() - 1];
                let x = rng.random_range(0..total);
                let idx = run.partition_point(|&c| c <= x);
                self.enabled_calls[idx]
            }
            None => self.enabled_calls[rng.random_range(0..self.enabled_calls.len())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::deserialize;
    use crate::targets::get_target;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn build_rejects_bad_inputs() {
        let target = get_target("test", "64").unwrap();
        let n = target.syscalls.len();
        assert_eq!(
            ChoiceTable::build(&target, None, Some(&HashSet::new())).unwrap_err(),
            ChoiceTableError::NoEnabledCalls
        );
        assert!(matches!(
            ChoiceTable::build(&target, None, Some(&HashSet::from([n + 3]))),
            Err(ChoiceTableError::UnknownSyscall(_))
        ));
        let prios = vec![vec![1u32; n]; n - 1];
        assert_eq!(
            ChoiceTable::build(&target, Some(&prios), None).unwrap_err(),
            ChoiceTableError::PrioritiesShape { expected: n }
        );
    }

    #[test]
    fn choose_only_returns_enabled_calls() {
        let target = get_target("test", "64").unwrap();
        let enabled = enabled_by_name(&target, &["mutate0", "mutate4"]).unwrap();
        let ct = ChoiceTable::build(&target, None, Some(&enabled)).unwrap();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        let mut seen = HashSet::new();
        for i in 0..200 {
            let prev = if i % 2 == 0 { None } else { Some(i % target.syscalls.len()) };
            let id = ct.choose(&mut rng, prev);
            assert!(ct.enabled(id), "chose disabled syscall {}", target.syscalls[id].name);
            seen.insert(id);
        }
        assert_eq!(seen, enabled);
        assert!(matches!(
            enabled_by_name(&target, &["nope"]),
            Err(ChoiceTableError::UnknownSyscall(name)) if name == "nope"
        ));
    }

    #[test]
    fn choose_follows_priorities() {
        let target = get_target("test", "64").unwrap();
        let n = target.syscalls.len();
        let favourite = target.syscall("mutate7").unwrap().id;
        let mut prios = vec![vec![1u32; n]; n];
        prios[0][favourite] = 10_000;
        let ct = ChoiceTable::build(&target, Some(&prios), None).unwrap();
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let hits = (0..1000)
            .filter(|_| ct.choose(&mut rng, Some(0)) == favourite)
            .count();
        assert!(hits > 900, "favoured call chosen only {} times", hits);
    }

    #[test]
    fn choose_is_deterministic_per_seed() {
        let target = get_target("linux", "amd64").unwrap();
        let prios = calculate_priorities(&target, &[]);
        let ct = ChoiceTable::build(&target, Some(&prios), None).unwrap();
        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..50).map(|i| ct.choose(&mut rng, Some(i % 5))).collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn static_priorities_relate_resource_users() {
        let target = get_target("linux", "amd64").unwrap();
        let prios = calculate_priorities(&target, &[]);
        let id = |name| target.syscall(name).unwrap().id;
        let pipe2 = id("pipe2");
        assert!(prios[pipe2][id("write")] > prios[pipe2][id("sched_yield")]);
        assert!(prios[id("socket")][id("setsockopt")] > prios[id("socket")][id("getpid")]);
        assert!(prios.iter().flatten().all(|&p| p >= 1));
    }

    #[test]
    fn corpus_co_occurrence_raises_priority() {
        let target = get_target("linux", "amd64").unwrap();
        let prog = deserialize(&target, "sched_yield()\ngetpid()\n").unwrap();
        let before = calculate_priorities(&target, &[]);
        let after = calculate_priorities(&target, &[prog]);
        let (a, b) = (
            target.syscall("sched_yield").unwrap().id,
            target.syscall("getpid").unwrap().id,
        );
        assert!(after[a][b] > before[a][b]);
        assert!(after[b][a] > before[b][a]);
    }
}
