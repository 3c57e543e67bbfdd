//! Oracle-driven program shrinking.
//!
//! Candidates are produced by gluing mappings together, removing calls and
//! simplifying arguments. Each candidate is shown to a caller-supplied predicate; accepted candidates
//! replace the working program. Passes repeat until one accepts nothing.

use crate::generation::{GenState, array_bounds, mmap_range};
use crate::prog::{Arg, ArgPath, Call, Prog, for_each_result_mut};
use crate::size::{reassign_sizes, stale_sizes};
use crate::target::{BufferKind, Dir, Target, TypeKind};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Simplify {
    Data,
    Array,
    Scalar,
    Pointer,
}

/// Shrinks `prog` while `pred` keeps accepting the candidates.
///
/// `call_index` names a call that must survive; the returned index points at
/// the same call after earlier calls were removed. An index past the end is
/// treated as no tracked call. The predicate sees every candidate together
/// with the tracked index as it would be in that candidate, and is never shown
/// an empty program.
///
/// All mmap calls other than the tracked one are first offered glued into a
/// single mapping at the front of the program.
///
/// With `allow_partial_removal`, runs of trailing calls after the tracked one
/// are first dropped in halving chunks before single calls are tried.
///
/// When nothing is accepted the result equals `prog` and `call_index`.
pub fn minimize<P>(
    prog: &Prog,
    call_index: Option<usize>,
    mut pred: P,
    allow_partial_removal: bool,
) -> (Prog, Option<usize>)
where
    P: FnMut(&Prog, Option<usize>) -> bool,
{
    let mut best = prog.clone();
    let mut tracked = call_index.filter(|&i| i < prog.len());
    let mut nargs = 0;
    prog.for_each_arg(|_, _, _| nargs += 1);
    let max_passes = 1 + prog.len() + nargs;

    glue_mmaps(&mut best, &mut tracked, &mut pred);

    for pass in 0..max_passes {
        let mut changed = false;
        if allow_partial_removal {
            changed |= remove_trailing(&mut best, tracked, &mut pred);
        }
        changed |= remove_calls(&mut best, &mut tracked, &mut pred);
        changed |= simplify_args(&mut best, tracked, &mut pred);
        if !changed {
            log::debug!(
                "minimized {} -> {} calls in {} passes",
                prog.len(),
                best.len(),
                pass + 1
            );
            break;
        }
    }
    (best, tracked)
}

fn glue_mmaps<P>(prog: &mut Prog, tracked: &mut Option<usize>, pred: &mut P) -> bool
where
    P: FnMut(&Prog, Option<usize>) -> bool,
{
    let target = Arc::clone(&prog.target);
    let Some(mmap_id) = target.mmap.as_ref().map(|m| m.syscall) else {
        return false;
    };
    let page = target.page_size;
    let mut span: Option<(u64, u64)> = None;
    for call in &prog.calls {
        let Some((addr, size)) = mmap_range(&target, call) else {
            continue;
        };
        let first = addr / page;
        let end = addr
            .saturating_add(size)
            .div_ceil(page)
            .min(target.num_pages);
        if first >= end {
            continue;
        }
        span = Some(match span {
            Some((lo, hi)) => (lo.min(first), hi.max(end)),
            None => (first, end),
        });
    }
    let Some((lo, hi)) = span else {
        return false;
    };

    let mut cand = prog.clone();
    let mut idx = *tracked;
    let mut i = 0;
    while i < cand.len() {
        if Some(i) != idx && cand.calls[i].meta.id == mmap_id {
            cand.remove_call(i);
            idx = idx.map(|t| if t > i { t - 1 } else { t });
        } else {
            i += 1;
        }
    }
    let mut state = GenState::new(&target, None, cand.next_result);
    let Some(mmap) = state.make_mmap(lo * page, (hi - lo) * page) else {
        return false;
    };
    cand.next_result = state.next_result;
    cand.insert_call(0, mmap);
    let idx = idx.map(|t| t + 1);
    if cand.serialize() == prog.serialize() || cand.validate().is_err() {
        return false;
    }
    if pred(&cand, idx) {
        log::trace!("glued mappings into pages {:#x}..{:#x}", lo, hi);
        *prog = cand;
        *tracked = idx;
        return true;
    }
    false
}

fn remove_trailing<P>(prog: &mut Prog, tracked: Option<usize>, pred: &mut P) -> bool
where
    P: FnMut(&Prog, Option<usize>) -> bool,
{
    let floor = tracked.map_or(1, |t| t + 1);
    let mut changed = false;
    let mut step = prog.len().saturating_sub(floor);
    while step > 0 {
        if prog.len() >= floor + step {
            let mut cand = prog.clone();
            let cut = cand.len() - step;
            while cand.len() > cut {
                cand.remove_call(cand.len() - 1);
            }
            if pred(&cand, tracked) {
                log::trace!("dropped {} trailing calls", step);
                *prog = cand;
                changed = true;
                continue;
            }
        }
        step /= 2;
    }
    changed
}

fn remove_calls<P>(prog: &mut Prog, tracked: &mut Option<usize>, pred: &mut P) -> bool
where
    P: FnMut(&Prog, Option<usize>) -> bool,
{
    let mut changed = false;
    for i in (0..prog.len()).rev() {
        if *tracked == Some(i) || prog.len() <= 1 {
            continue;
        }
        let mut cand = prog.clone();
        cand.remove_call(i);
        let shifted = tracked.map(|t| if t > i { t - 1 } else { t });
        if pred(&cand, shifted) {
            log::trace!("removed call #{} ({})", i, prog.calls[i].meta.name);
            *prog = cand;
            *tracked = shifted;
            changed = true;
        }
    }
    changed
}

fn simplify_args<P>(prog: &mut Prog, tracked: Option<usize>, pred: &mut P) -> bool
where
    P: FnMut(&Prog, Option<usize>) -> bool,
{
    let mut changed = false;
    for ci in 0..prog.len() {
        for kind in [
            Simplify::Data,
            Simplify::Array,
            Simplify::Scalar,
            Simplify::Pointer,
        ] {
            let mut tried: HashSet<ArgPath> = HashSet::new();
            loop {
                let next = candidate_paths(&prog.target, &prog.calls[ci], kind)
                    .into_iter()
                    .find(|path| !tried.contains(path));
                let Some(path) = next else { break };
                if try_simplify(prog, tracked, pred, ci, &path, kind) {
                    changed = true;
                }
                tried.insert(path);
            }
        }
    }
    changed
}

fn candidate_paths(target: &Target, call: &Call, kind: Simplify) -> Vec<ArgPath> {
    let mut out = Vec::new();
    call.for_each_arg(|arg, ctx| {
        if simplified(target, arg, kind).is_some_and(|s| s != *arg) {
            out.push(ctx.path.to_vec());
        }
    });
    out
}

/// The simplest form of `arg` for the given kind of edit.
fn simplified(target: &Target, arg: &Arg, kind: Simplify) -> Option<Arg> {
    let t = target.ty(arg.ty());
    match (kind, &t.kind, arg) {
        (Simplify::Data, TypeKind::Buffer(BufferKind::Blob { min, .. }), Arg::Data(d)) => {
            let mut d = d.clone();
            d.data = vec![0; *min as usize];
            Some(Arg::Data(d))
        }
        (Simplify::Data, TypeKind::Buffer(BufferKind::Text { values }), Arg::Data(d)) => {
            let mut d = d.clone();
            d.data = values.first()?.clone();
            Some(Arg::Data(d))
        }
        (Simplify::Array, TypeKind::Array { len, .. }, Arg::Group(g)) => {
            let (lo, _) = array_bounds(len);
            let mut g = g.clone();
            g.inner.truncate(lo as usize);
            Some(Arg::Group(g))
        }
        (
            Simplify::Scalar,
            TypeKind::Int { .. } | TypeKind::Flags { .. } | TypeKind::Proc { .. },
            Arg::Const(c),
        ) if t.dir == Dir::In => {
            let mut c = c.clone();
            c.val = match &t.kind {
                TypeKind::Int {
                    range: Some((lo, _)),
                    ..
                } => *lo,
                _ => 0,
            };
            Some(Arg::Const(c))
        }
        (Simplify::Pointer, TypeKind::Ptr { .. }, Arg::Pointer(p)) if !p.special => {
            let mut p = p.clone();
            p.res = None;
            Some(Arg::Pointer(p))
        }
        _ => None,
    }
}

fn try_simplify<P>(
    prog: &mut Prog,
    tracked: Option<usize>,
    pred: &mut P,
    ci: usize,
    path: &[usize],
    kind: Simplify,
) -> bool
where
    P: FnMut(&Prog, Option<usize>) -> bool,
{
    let target = Arc::clone(&prog.target);
    let before = &prog.calls[ci];
    let Some(old) = before.arg_at(path) else {
        return false;
    };
    let Some(new) = simplified(&target, old, kind) else {
        return false;
    };
    if new == *old {
        return false;
    }

    // Producers referenced elsewhere must not disappear with the subtree.
    let used = prog.used_results();
    let mut lost = false;
    let mut scratch = old.clone();
    for_each_result_mut(&mut scratch, &mut |r| lost |= used.contains(&r.id));
    if lost {
        return false;
    }

    let mut keep = stale_sizes(&target, before);
    keep.retain(|p| !(p.len() > path.len() && p.starts_with(path)));
    let mut cand = prog.clone();
    let call = &mut cand.calls[ci];
    let Some(slot) = call.arg_at_mut(path) else {
        return false;
    };
    *slot = new;
    reassign_sizes(&target, call, &keep);
    cand.repair_results();
    if cand.validate().is_err() {
        return false;
    }
    if pred(&cand, tracked) {
        log::trace!("simplified {:?} of call #{} ({:?})", path, ci, kind);
        *prog = cand;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::deserialize;
    use crate::generation::generate;
    use crate::targets::get_target;
    use rand::Rng;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    const MMAP_YIELD_PIPE: &str = "mmap(&(0x7f0000000000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n\
        sched_yield()\n\
        pipe2(&(0x7f0000000000)={0x0, 0x0}, 0x0)\n";

    #[test]
    fn rejecting_predicate_keeps_the_program() {
        let target = get_target("linux", "amd64").unwrap();
        let prog = deserialize(&target, MMAP_YIELD_PIPE).unwrap();
        let (got, idx) = minimize(
            &prog,
            Some(2),
            |p, ci| {
                assert!(!p.is_empty(), "predicate shown an empty program");
                assert_eq!(p.calls[ci.unwrap()].meta.name, "pipe2");
                false
            },
            false,
        );
        assert_eq!(got.serialize(), prog.serialize());
        assert_eq!(idx, Some(2));
    }

    #[test]
    fn removes_an_unneeded_call() {
        let target = get_target("linux", "amd64").unwrap();
        let prog = deserialize(&target, MMAP_YIELD_PIPE).unwrap();
        let (got, idx) = minimize(
            &prog,
            Some(2),
            |p, _| p.len() == 2 && p.calls[0].meta.name == "mmap" && p.calls[1].meta.name == "pipe2",
            false,
        );
        assert_eq!(
            got.serialize(),
            "mmap(&(0x7f0000000000/0x1000)=nil, 0x1000, 0x0, 0x0, 0xffffffffffffffff, 0x0)\n\
             pipe2(&(0x7f0000000000), 0x0)\n"
        );
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn removes_calls_in_sequence() {
        let target = get_target("linux", "amd64").unwrap();
        let prog = deserialize(&target, MMAP_YIELD_PIPE).unwrap();
        let (got, idx) = minimize(
            &prog,
            Some(1),
            |p, _| match p.summary().as_str() {
                "mmap-sched_yield" | "sched_yield" => true,
                _ => false,
            },
            false,
        );
        assert_eq!(got.serialize(), "sched_yield()\n");
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn shrinks_to_the_tracked_call() {
        let target = get_target("linux", "amd64").unwrap();
        let prog = deserialize(&target, MMAP_YIELD_PIPE).unwrap();
        let (got, idx) = minimize(
            &prog,
            Some(2),
            |p, ci| {
                let names: Vec<&str> = p.calls.iter().map(|c| c.meta.name.as_str()).collect();
                match (names.as_slice(), ci) {
                    (["mmap", "pipe2"], Some(1)) | (["pipe2"], Some(0)) => true,
                    _ => false,
                }
            },
            false,
        );
        assert_eq!(got.summary(), "pipe2");
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn removed_producer_leaves_a_sentinel_and_arguments_shrink() {
        let target = get_target("linux", "amd64").unwrap();
        let text = "mmap(&(0x7f0000000000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n\
            pipe2(&(0x7f0000000000)={<r0=>0x0, <r1=>0x0}, 0x0)\n\
            write(r1, &(0x7f0000000000)=\"1155\", 0x2)\n\
            sched_yield()\n";
        let want = "mmap(&(0x7f0000000000/0x1000)=nil, 0x1000, 0x0, 0x0, 0xffffffffffffffff, 0x0)\n\
            write(0xffffffffffffffff, &(0x7f0000000000), 0x0)\n\
            sched_yield()\n";
        let prog = deserialize(&target, text).unwrap();
        for (tracked, want_idx) in [(Some(3), Some(2)), (None, None)] {
            let (got, idx) = minimize(
                &prog,
                tracked,
                |p, _| p.summary() == "mmap-write-sched_yield",
                false,
            );
            assert_eq!(got.serialize(), want);
            assert_eq!(idx, want_idx);
        }
    }

    #[test]
    fn glues_mappings_into_one_leading_mmap() {
        let target = get_target("linux", "amd64").unwrap();
        let text = "sched_yield()\n\
            mmap(&(0x7f0000010000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n\
            mmap(&(0x7f0000011000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n\
            getpid()\n\
            mmap(&(0x7f0000015000/0x5000)=nil, 0x2000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n";
        let prog = deserialize(&target, text).unwrap();
        let (got, idx) = minimize(
            &prog,
            Some(3),
            |p, _| p.summary() == "mmap-sched_yield-getpid",
            false,
        );
        assert_eq!(
            got.serialize(),
            "mmap(&(0x7f0000010000/0x7000)=nil, 0x7000, 0x0, 0x0, 0xffffffffffffffff, 0x0)\n\
             sched_yield()\n\
             getpid()\n"
        );
        assert_eq!(idx, Some(2));
    }

    #[test]
    fn a_tracked_mmap_is_not_glued_away() {
        let target = get_target("linux", "amd64").unwrap();
        let text = "mmap(&(0x7f0000000000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n\
            sched_yield()\n\
            mmap(&(0x7f0000003000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n";
        let prog = deserialize(&target, text).unwrap();
        let mut first = None;
        let (got, idx) = minimize(
            &prog,
            Some(2),
            |p, idx| {
                let idx = idx.unwrap();
                assert_eq!(p.calls[idx].meta.name, "mmap");
                assert_eq!(p.calls[idx].args[0], prog.calls[2].args[0]);
                first.get_or_insert_with(|| (p.serialize(), idx));
                false
            },
            false,
        );
        assert_eq!(
            first,
            Some((
                "mmap(&(0x7f0000000000/0x4000)=nil, 0x4000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n\
                 sched_yield()\n\
                 mmap(&(0x7f0000003000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n"
                    .to_string(),
                2
            ))
        );
        assert_eq!(got.serialize(), prog.serialize());
        assert_eq!(idx, Some(2));
    }

    #[test]
    fn used_producers_are_not_simplified_away() {
        let target = get_target("linux", "amd64").unwrap();
        let text = "pipe2(&(0x7f0000000000)={<r0=>0x0, <r1=>0x0}, 0x0)\n\
            write(r1, &(0x7f0000001000)=\"1155\", 0x2)\n";
        let prog = deserialize(&target, text).unwrap();
        let (got, idx) = minimize(&prog, Some(1), |p, _| p.used_results().len() == 1, false);
        assert_eq!(
            got.serialize(),
            "pipe2(&(0x7f0000000000)={0x0, <r0=>0x0}, 0x0)\n\
             write(r0, &(0x7f0000001000), 0x0)\n"
        );
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn deliberately_wrong_lengths_survive() {
        let target = get_target("test", "64").unwrap();
        let prog = deserialize(&target, "mutate4(&(0x7f0000000000)=\"11223344\", 0x9)\n").unwrap();
        let (got, _) = minimize(&prog, Some(0), |_, _| true, false);
        assert_eq!(got.serialize(), "mutate4(&(0x7f0000000000), 0x9)\n");
    }

    #[test]
    fn accepting_everything_keeps_only_the_tracked_call() {
        for (os, arch) in crate::targets::supported_targets() {
            let target = get_target(os, arch).unwrap();
            for seed in 0..50u64 {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let prog = generate(&target, &mut rng, 10, None);
                let ci = rng.random_range(0..prog.len());
                let (got, idx) = minimize(&prog, Some(ci), |_, _| true, seed % 2 == 0);
                assert_eq!(got.len(), 1, "seed {}:\n{}", seed, got.serialize());
                assert_eq!(idx, Some(0));
                assert_eq!(got.calls[0].meta.name, prog.calls[ci].meta.name);
                got.validate().unwrap();

                let (untracked, none) = minimize(&prog, None, |_, _| true, false);
                assert_eq!(untracked.len(), 1);
                assert_eq!(none, None);
            }
        }
    }

    #[test]
    fn tracked_index_follows_its_call_under_random_predicates() {
        let target = get_target("linux", "amd64").unwrap();
        for seed in 0..50u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let prog = generate(&target, &mut rng, 10, None);
            let text = prog.serialize();
            let ci = rng.random_range(0..prog.len());
            let name = prog.calls[ci].meta.name.clone();
            let mut oracle = ChaCha8Rng::seed_from_u64(seed + 1000);
            let (got, idx) = minimize(
                &prog,
                Some(ci),
                |p, idx| {
                    assert!(!p.is_empty());
                    assert_eq!(p.calls[idx.unwrap()].meta.name, name);
                    p.validate().unwrap();
                    oracle.random_bool(0.5)
                },
                seed % 3 == 0,
            );
            assert_eq!(got.calls[idx.unwrap()].meta.name, name);
            assert!(got.len() <= prog.len());
            assert_eq!(prog.serialize(), text, "input must not be modified");
            deserialize(&target, &got.serialize()).unwrap();
        }
    }

    #[test]
    fn partial_removal_needs_fewer_oracle_calls() {
        let target = get_target("linux", "amd64").unwrap();
        let text = "sched_yield()\ngetpid()\n".repeat(5);
        let prog = deserialize(&target, &text).unwrap();
        let run = |partial| {
            let mut calls = 0;
            let (got, idx) = minimize(
                &prog,
                Some(0),
                |_, _| {
                    calls += 1;
                    true
                },
                partial,
            );
            assert_eq!(got.serialize(), "sched_yield()\n");
            assert_eq!(idx, Some(0));
            calls
        };
        assert!(run(true) < run(false));
    }
}
