//! Length fields: computing their natural value from the sibling they describe.
//!
//! A length is in scope of the arguments of its call or the fields of its struct.
//! A length whose value differs from the natural one is "stale"; callers keep
//! stale lengths untouched when they want a deliberately wrong length to stick.

use crate::prog::{Arg, ArgPath, Call, ConstArg};
use crate::target::{LenUnit, Target, TypeKind, truncate};
use std::collections::HashSet;

fn inner_len(target: &Target, arg: &Arg, unit: LenUnit) -> u64 {
    match unit {
        LenUnit::Count => match arg {
            Arg::Group(g) if matches!(target.ty(g.ty).kind, TypeKind::Array { .. }) => {
                g.inner.len() as u64
            }
            _ => arg.byte_size(target),
        },
        LenUnit::Bytes(n) => arg.byte_size(target) / n.max(1),
    }
}

/// Value a length field takes when it describes `arg` exactly.
pub fn len_of(target: &Target, arg: &Arg, unit: LenUnit) -> u64 {
    match arg {
        Arg::Pointer(p) if matches!(target.ty(p.ty).kind, TypeKind::Vma) => p.vma_size,
        Arg::Pointer(p) => p
            .res
            .as_deref()
            .map(|res| inner_len(target, res, unit))
            .unwrap_or(0),
        other => inner_len(target, other, unit),
    }
}

fn scope_naturals(target: &Target, scope: &[Arg]) -> Vec<Option<u64>> {
    scope
        .iter()
        .map(|arg| {
            let Arg::Const(c) = arg else { return None };
            let TypeKind::Len { size, of, unit } = &target.ty(c.ty).kind else {
                return None;
            };
            let sibling = scope.iter().find(|a| target.ty(a.ty()).name == *of)?;
            Some(truncate(len_of(target, sibling, *unit), *size))
        })
        .collect()
}

fn walk_scope<F>(target: &Target, scope: &mut [Arg], path: &mut Vec<usize>, visit: &mut F)
where
    F: FnMut(&[usize], &mut ConstArg, u64),
{
    let naturals = scope_naturals(target, scope);
    for (i, arg) in scope.iter_mut().enumerate() {
        path.push(i);
        match naturals[i] {
            Some(natural) => {
                if let Arg::Const(c) = arg {
                    visit(path.as_slice(), c, natural);
                }
            }
            None => descend(target, arg, path, visit),
        }
        path.pop();
    }
}

fn descend<F>(target: &Target, arg: &mut Arg, path: &mut Vec<usize>, visit: &mut F)
where
    F: FnMut(&[usize], &mut ConstArg, u64),
{
    match arg {
        Arg::Group(g) => {
            if matches!(target.ty(g.ty).kind, TypeKind::Struct { .. }) {
                walk_scope(target, &mut g.inner, path, visit);
            } else {
                for (i, elem) in g.inner.iter_mut().enumerate() {
                    path.push(i);
                    descend(target, elem, path, visit);
                    path.pop();
                }
            }
        }
        Arg::Union(u) => {
            path.push(0);
            descend(target, &mut u.option, path, visit);
            path.pop();
        }
        Arg::Pointer(p) => {
            if let Some(res) = p.res.as_deref_mut() {
                path.push(0);
                descend(target, res, path, visit);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Sets every length field of the call to its natural value.
pub fn assign_sizes_call(target: &Target, call: &mut Call) {
    reassign_sizes(target, call, &HashSet::new());
}

/// Sets length fields to their natural value, except those at `keep`.
pub fn reassign_sizes(target: &Target, call: &mut Call, keep: &HashSet<ArgPath>) {
    let mut path = Vec::new();
    walk_scope(target, &mut call.args, &mut path, &mut |p, c, natural| {
        if !keep.contains(p) {
            c.val = natural;
        }
    });
}

/// Natural value of the length field at `path`, or `None` if there is none there.
pub fn natural_len(target: &Target, call: &Call, path: &[usize]) -> Option<u64> {
    let mut found = None;
    let mut scratch = call.clone();
    walk_scope(target, &mut scratch.args, &mut Vec::new(), &mut |p, _, natural| {
        if p == path {
            found = Some(natural);
        }
    });
    found
}

/// Paths of length fields whose value currently differs from the natural one.
pub fn stale_sizes(target: &Target, call: &Call) -> HashSet<ArgPath> {
    let mut stale = HashSet::new();
    let mut scratch = call.clone();
    let mut path = Vec::new();
    walk_scope(target, &mut scratch.args, &mut path, &mut |p, c, natural| {
        if c.val != natural {
            stale.insert(p.to_vec());
        }
    });
    stale
}
