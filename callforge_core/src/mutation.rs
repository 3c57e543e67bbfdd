//! In-place program mutation: splicing, call insertion and removal, and
//! argument edits that keep the program well-formed.

use crate::generation::{GenState, array_bounds, special_pointer};
use crate::prio::ChoiceTable;
use crate::prog::{Arg, ArgPath, Call, Prog};
use crate::random::{
    biased_rand, choose_weighted, interesting_byte, one_of, rand_buf_len, rand_flags, rand_int,
    rand_range,
};
use crate::size::{natural_len, reassign_sizes, stale_sizes};
use crate::target::{BufferKind, Dir, Target, TypeKind, truncate};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Upper bound on mutation attempts in one [`ProgMutator::mutate`] call.
const MAX_MUTATE_ATTEMPTS: usize = 100;

fn default_splice() -> u32 {
    5
}

fn default_insert_call() -> u32 {
    20
}

fn default_mutate_arg() -> u32 {
    60
}

fn default_remove_call() -> u32 {
    15
}

/// Relative weights of the four mutation operations.
///
/// A zero weight disables the operation. When every weight is zero,
/// mutation is a no-op.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutationWeights {
    #[serde(default = "default_splice")]
    pub splice: u32,
    #[serde(default = "default_insert_call")]
    pub insert_call: u32,
    #[serde(default = "default_mutate_arg")]
    pub mutate_arg: u32,
    #[serde(default = "default_remove_call")]
    pub remove_call: u32,
}

impl Default for MutationWeights {
    fn default() -> Self {
        Self {
            splice: default_splice(),
            insert_call: default_insert_call(),
            mutate_arg: default_mutate_arg(),
            remove_call: default_remove_call(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MutationOp {
    Splice,
    InsertCall,
    MutateArg,
    RemoveCall,
}

/// How an argument edit changed the call, which decides how lengths are redone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    /// The value of a leaf changed.
    Scalar,
    /// A length field was set explicitly and must not be recomputed.
    Len,
    /// The subtree under the edited argument was rebuilt or resized.
    Structural,
}

/// Applies randomly chosen mutations to programs.
#[derive(Debug, Clone, Default)]
pub struct ProgMutator {
    pub weights: MutationWeights,
}

impl ProgMutator {
    pub fn new(weights: MutationWeights) -> Self {
        Self { weights }
    }

    /// Mutates `prog` in place.
    ///
    /// Operations are drawn by weight until one succeeds and a 1-in-3 draw
    /// says to stop, so several mutations may stack. The program is never left
    /// longer than `ncalls` and stays valid throughout.
    ///
    /// # Arguments
    /// * `prog`: The program to change.
    /// * `rng`: Source of every random decision; equal seeds give equal results.
    /// * `ncalls`: Length bound for insertion and splicing.
    /// * `ct`: Choice table for picking inserted syscalls; uniform when `None`.
    /// * `corpus`: Programs to splice from. Programs for other targets are ignored.
    ///
    /// # Returns
    /// `true` if at least one operation changed the program.
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        prog: &mut Prog,
        rng: &mut R,
        ncalls: usize,
        ct: Option<&ChoiceTable>,
        corpus: &[Prog],
    ) -> bool {
        let w = &self.weights;
        let weights = [w.splice, w.insert_call, w.mutate_arg, w.remove_call];
        let ops = [
            MutationOp::Splice,
            MutationOp::InsertCall,
            MutationOp::MutateArg,
            MutationOp::RemoveCall,
        ];
        let mut changed = false;
        for _ in 0..MAX_MUTATE_ATTEMPTS {
            let Some(i) = choose_weighted(rng, &weights) else {
                break;
            };
            let op = ops[i];
            let ok = match op {
                MutationOp::Splice => splice(prog, rng, ncalls, corpus),
                MutationOp::InsertCall => insert_call(prog, rng, ncalls, ct),
                MutationOp::MutateArg => mutate_arg(prog, rng, ct),
                MutationOp::RemoveCall => remove_call(prog, rng),
            };
            if ok {
                log::trace!("applied {:?}: {}", op, prog.summary());
            }
            changed |= ok;
            if ok && one_of(rng, 3) {
                break;
            }
        }
        while prog.len() > ncalls {
            prog.remove_call(prog.len() - 1);
        }
        changed
    }
}

impl Prog {
    /// Mutates the program with the default operation weights.
    pub fn mutate<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        ncalls: usize,
        ct: Option<&ChoiceTable>,
        corpus: &[Prog],
    ) -> bool {
        ProgMutator::default().mutate(self, rng, ncalls, ct, corpus)
    }
}

/// Inserts a slice of a corpus program at a random position.
fn splice<R: Rng + ?Sized>(prog: &mut Prog, rng: &mut R, ncalls: usize, corpus: &[Prog]) -> bool {
    let donors: Vec<&Prog> = corpus
        .iter()
        .filter(|p| {
            !p.is_empty() && p.target.os == prog.target.os && p.target.arch == prog.target.arch
        })
        .collect();
    if donors.is_empty() {
        return false;
    }
    let donor = donors[rng.random_range(0..donors.len())];
    let start = rng.random_range(0..donor.len());
    let end = rng.random_range(start + 1..=donor.len());
    let mut calls: Vec<Call> = donor.calls[start..end].to_vec();

    // Ids are renumbered into this program; references leaving the slice are dropped.
    let mut remap = HashMap::new();
    for call in &mut calls {
        call.results_mut(|r| {
            r.source = r.source.and_then(|src| remap.get(&src).copied());
            let fresh = prog.alloc_result_id();
            remap.insert(r.id, fresh);
            r.id = fresh;
        });
    }
    let idx = rng.random_range(0..=prog.len());
    prog.insert_calls(idx, calls);
    while prog.len() > ncalls {
        prog.remove_call(prog.len() - 1);
    }
    true
}

/// Generates one new call, near the end of the program by preference.
fn insert_call<R: Rng + ?Sized>(
    prog: &mut Prog,
    rng: &mut R,
    ncalls: usize,
    ct: Option<&ChoiceTable>,
) -> bool {
    if prog.len() >= ncalls || prog.target.syscalls.is_empty() {
        return false;
    }
    let idx = biased_rand(rng, prog.len() + 1, 5.0);
    let target = Arc::clone(&prog.target);
    let mut state = GenState::analyze(&target, prog, ct, idx);
    let prev = idx.checked_sub(1).map(|i| prog.calls[i].meta.id);
    let id = state.choose_syscall(rng, prev);
    let calls = state.generate_call(rng, id);
    prog.next_result = state.next_result;
    prog.insert_calls(idx, calls);
    true
}

fn remove_call<R: Rng + ?Sized>(prog: &mut Prog, rng: &mut R) -> bool {
    if prog.len() <= 1 {
        return false;
    }
    let idx = rng.random_range(0..prog.len());
    prog.remove_call(idx);
    true
}

fn is_mutable(target: &Target, arg: &Arg) -> bool {
    let t = target.ty(arg.ty());
    match &t.kind {
        TypeKind::Const { .. } | TypeKind::Struct { .. } => false,
        TypeKind::Int { .. }
        | TypeKind::Flags { .. }
        | TypeKind::Proc { .. }
        | TypeKind::Len { .. }
        | TypeKind::Resource { .. } => t.dir == Dir::In,
        TypeKind::Buffer(BufferKind::Text { values }) => values.len() > 1,
        TypeKind::Buffer(_) | TypeKind::Ptr { .. } | TypeKind::Vma => true,
        TypeKind::Array { len, .. } => {
            let (lo, hi) = array_bounds(len);
            lo < hi
        }
        TypeKind::Union { options, .. } => options.len() > 1,
    }
}

fn mutable_paths(target: &Target, call: &Call) -> Vec<ArgPath> {
    let mut out = Vec::new();
    call.for_each_arg(|arg, ctx| {
        if is_mutable(target, arg) {
            out.push(ctx.path.to_vec());
        }
    });
    out
}

fn mutate_arg<R: Rng + ?Sized>(prog: &mut Prog, rng: &mut R, ct: Option<&ChoiceTable>) -> bool {
    let candidates: Vec<usize> = (0..prog.len())
        .filter(|&i| !prog.calls[i].args.is_empty())
        .collect();
    if candidates.is_empty() {
        return false;
    }
    let idx = candidates[rng.random_range(0..candidates.len())];
    let paths = mutable_paths(&prog.target, &prog.calls[idx]);
    if paths.is_empty() {
        return false;
    }
    let path = &paths[rng.random_range(0..paths.len())];
    mutate_arg_at(prog, rng, ct, idx, path)
}

/// The nearest pointer strictly above `path` that has a pointee: its path,
/// address and the pointee's current size.
fn enclosing_region(target: &Target, call: &Call, path: &[usize]) -> Option<(ArgPath, u64, u64)> {
    (1..path.len()).rev().find_map(|k| match call.arg_at(&path[..k]) {
        Some(Arg::Pointer(p)) if !p.special => p
            .res
            .as_deref()
            .map(|res| (path[..k].to_vec(), p.addr, res.byte_size(target))),
        _ => None,
    })
}

/// Edits the argument at `path` of call `call_idx`, then fixes up lengths,
/// mappings and resource references.
pub(crate) fn mutate_arg_at<R: Rng + ?Sized>(
    prog: &mut Prog,
    rng: &mut R,
    ct: Option<&ChoiceTable>,
    call_idx: usize,
    path: &[usize],
) -> bool {
    let target = Arc::clone(&prog.target);
    let Some(before) = prog.calls.get(call_idx).cloned() else {
        return false;
    };
    let mut state = GenState::analyze(&target, prog, ct, call_idx);
    let mut call = before.clone();
    let mut pre = Vec::new();
    let region = enclosing_region(&target, &call, path);
    let Some(edit) = edit_arg(&mut state, rng, &target, &mut call, path, &mut pre) else {
        return false;
    };

    // Pages the pointee grew into are mapped; pages it already covered are not touched.
    if let Some((ptr_path, addr, old_size)) = region {
        if let Some(Arg::Pointer(p)) = call.arg_at(&ptr_path) {
            let new_size = p.res.as_deref().map_or(0, |r| r.byte_size(&target));
            let page = target.page_size;
            let old_end = (addr + old_size.max(1)).div_ceil(page);
            let new_end = (p.addr + new_size.max(1)).div_ceil(page);
            if p.addr == addr && new_end > old_end {
                state.ensure_mapped(old_end * page, (new_end - old_end) * page, &mut pre);
            }
        }
    }

    let mut keep = stale_sizes(&target, &before);
    match edit {
        Edit::Len => {
            keep.insert(path.to_vec());
        }
        Edit::Structural => keep.retain(|p| !(p.len() > path.len() && p.starts_with(path))),
        Edit::Scalar => {}
    }
    reassign_sizes(&target, &mut call, &keep);

    if call == before && pre.is_empty() {
        return false;
    }
    prog.next_result = state.next_result;
    prog.calls[call_idx] = call;
    prog.insert_calls(call_idx, pre);
    true
}

fn edit_arg<R: Rng + ?Sized>(
    state: &mut GenState<'_>,
    rng: &mut R,
    target: &Target,
    call: &mut Call,
    path: &[usize],
    pre: &mut Vec<Call>,
) -> Option<Edit> {
    let natural = natural_len(target, call, path);
    let arg = call.arg_at_mut(path)?;
    let ty = arg.ty();
    let t = target.ty(ty);
    let depth = path.len();
    if matches!(t.kind, TypeKind::Vma) {
        *arg = state.gen_vma(rng, ty);
        return Some(Edit::Structural);
    }
    match (&t.kind, arg) {
        (TypeKind::Len { size, .. }, Arg::Const(c)) => {
            let natural = natural?;
            if c.val != natural && one_of(rng, 2) {
                c.val = natural;
            } else {
                let wrong: Vec<u64> = [natural.wrapping_sub(1), natural.wrapping_add(1), 0, u64::MAX]
                    .into_iter()
                    .map(|v| truncate(v, *size))
                    .filter(|&v| v != natural)
                    .collect();
                if wrong.is_empty() {
                    return None;
                }
                c.val = wrong[rng.random_range(0..wrong.len())];
            }
            Some(Edit::Len)
        }
        (TypeKind::Int { size, range }, Arg::Const(c)) => {
            c.val = mutate_int(rng, c.val, *size, *range);
            Some(Edit::Scalar)
        }
        (TypeKind::Flags { size, vals }, Arg::Const(c)) => {
            let v = match rng.random_range(0..3) {
                0 if !vals.is_empty() => c.val ^ vals[rng.random_range(0..vals.len())],
                1 => c.val ^ (1u64 << rng.random_range(0..(*size).clamp(1, 8) * 8)),
                _ => rand_flags(rng, vals, *size),
            };
            c.val = truncate(v, *size);
            Some(Edit::Scalar)
        }
        (TypeKind::Proc { size, per_proc, .. }, Arg::Const(c)) => {
            c.val = if one_of(rng, 3) {
                truncate(u64::MAX, *size)
            } else {
                rng.random_range(0..(*per_proc).max(1))
            };
            Some(Edit::Scalar)
        }
        (TypeKind::Resource { desc }, Arg::Result(r)) => {
            match state.pick_producer(rng, *desc) {
                Some(src) if r.source != Some(src) && !one_of(rng, 3) => r.source = Some(src),
                _ => {
                    r.source = None;
                    r.val = state.special_resource_value(rng, *desc);
                }
            }
            Some(Edit::Scalar)
        }
        (TypeKind::Buffer(kind), Arg::Data(d)) => {
            d.data = match kind {
                BufferKind::Blob { min, max } if t.dir == Dir::Out => {
                    vec![0; rand_buf_len(rng, *min, *max) as usize]
                }
                BufferKind::Blob { min, max } => mutate_blob(rng, &d.data, *min, *max),
                BufferKind::Filename => {
                    if one_of(rng, 2) {
                        state.fresh_filename()
                    } else {
                        state.gen_filename(rng)
                    }
                }
                BufferKind::Text { values } => {
                    let others: Vec<&Vec<u8>> = values.iter().filter(|v| **v != d.data).collect();
                    if others.is_empty() {
                        return None;
                    }
                    others[rng.random_range(0..others.len())].clone()
                }
            };
            Some(Edit::Scalar)
        }
        (TypeKind::Array { elem, len }, Arg::Group(g)) => {
            let (lo, hi) = array_bounds(len);
            let cur = g.inner.len() as u64;
            let want = if one_of(rng, 2) {
                if cur <= lo || (cur < hi && rng.random_bool(0.5)) {
                    cur + 1
                } else {
                    cur - 1
                }
            } else {
                rand_range(rng, lo, hi)
            };
            while (g.inner.len() as u64) < want {
                g.inner.push(state.gen_arg(rng, *elem, depth, pre));
            }
            g.inner.truncate(want as usize);
            Some(Edit::Structural)
        }
        (TypeKind::Union { options, .. }, Arg::Union(u)) => {
            if options.len() < 2 {
                return None;
            }
            let mut index = rng.random_range(0..options.len() - 1);
            if index >= u.index {
                index += 1;
            }
            u.index = index;
            u.option = Box::new(state.gen_arg(rng, options[index], depth, pre));
            Some(Edit::Structural)
        }
        (TypeKind::Ptr { elem }, Arg::Pointer(p)) => {
            if p.special || p.res.is_none() {
                let res = state.gen_arg(rng, *elem, depth, pre);
                p.addr = state.alloc(res.byte_size(target), pre);
                p.res = Some(Box::new(res));
                p.special = false;
                Some(Edit::Structural)
            } else if !target.special_pointers.is_empty() && one_of(rng, 10) {
                let val = target.special_pointers[rng.random_range(0..target.special_pointers.len())];
                *p = special_pointer(p.ty, val);
                Some(Edit::Structural)
            } else {
                let size = p.res.as_deref().map_or(0, |r| r.byte_size(target));
                p.addr = state.alloc(size, pre);
                Some(Edit::Scalar)
            }
        }
        _ => None,
    }
}

fn mutate_int<R: Rng + ?Sized>(rng: &mut R, val: u64, size: u64, range: Option<(u64, u64)>) -> u64 {
    if let Some((lo, hi)) = range {
        return match rng.random_range(0..3) {
            0 if val < hi => val + 1,
            1 if val > lo => val - 1,
            _ => rand_range(rng, lo, hi),
        };
    }
    let v = match rng.random_range(0..4) {
        0 => val ^ (1u64 << rng.random_range(0..size.clamp(1, 8) * 8)),
        1 => {
            let delta = rng.random_range(1..=4u64);
            if rng.random_bool(0.5) {
                val.wrapping_add(delta)
            } else {
                val.wrapping_sub(delta)
            }
        }
        _ => rand_int(rng, size),
    };
    truncate(v, size)
}

fn rand_byte<R: Rng + ?Sized>(rng: &mut R) -> u8 {
    if one_of(rng, 2) {
        interesting_byte(rng)
    } else {
        rng.random::<u8>()
    }
}

/// Inserts, deletes or overwrites one byte while staying within `min..=max`.
fn mutate_blob<R: Rng + ?Sized>(rng: &mut R, data: &[u8], min: u64, max: u64) -> Vec<u8> {
    let mut data = data.to_vec();
    let len = data.len() as u64;
    let mut ops = Vec::with_capacity(3);
    if len < max {
        ops.push(0);
    }
    if len > min {
        ops.push(1);
    }
    if len > 0 {
        ops.push(2);
    }
    if ops.is_empty() {
        return data;
    }
    match ops[rng.random_range(0..ops.len())] {
        0 => {
            let pos = rng.random_range(0..=data.len());
            data.insert(pos, rand_byte(rng));
        }
        1 => {
            let pos = rng.random_range(0..data.len());
            data.remove(pos);
        }
        _ => {
            let pos = rng.random_range(0..data.len());
            data[pos] = rand_byte(rng);
        }
    }
    data
}
