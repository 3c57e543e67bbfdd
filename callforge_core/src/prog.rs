use crate::target::{ArrayLen, BufferKind, Dir, ResourceId, Syscall, Target, TypeId, TypeKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Program-local identity of a resource-bearing argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultId(pub u64);

/// Position of an argument inside a call: top-level index, then child indices.
pub type ArgPath = Vec<usize>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstArg {
    pub ty: TypeId,
    pub val: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataArg {
    pub ty: TypeId,
    pub data: Vec<u8>,
}

/// Struct fields or array elements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupArg {
    pub ty: TypeId,
    pub inner: Vec<Arg>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnionArg {
    pub ty: TypeId,
    pub index: usize,
    pub option: Box<Arg>,
}

/// A pointer into the data area, a VMA region, or a special literal address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointerArg {
    pub ty: TypeId,
    /// Offset from the target's data area base.
    pub addr: u64,
    /// Non-zero only for VMA regions.
    pub vma_size: u64,
    pub res: Option<Box<Arg>>,
    /// `addr` is a literal from the target's special pointer list.
    pub special: bool,
}

/// A resource value: a producer when its type is an output, a consumer otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultArg {
    pub ty: TypeId,
    pub id: ResultId,
    /// Producer this consumer refers to; `None` means the literal `val` is used.
    pub source: Option<ResultId>,
    pub val: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    Const(ConstArg),
    Data(DataArg),
    Group(GroupArg),
    Union(UnionArg),
    Pointer(PointerArg),
    Result(ResultArg),
}

impl Arg {
    pub fn ty(&self) -> TypeId {
        match self {
            Arg::Const(a) => a.ty,
            Arg::Data(a) => a.ty,
            Arg::Group(a) => a.ty,
            Arg::Union(a) => a.ty,
            Arg::Pointer(a) => a.ty,
            Arg::Result(a) => a.ty,
        }
    }

    pub fn child(&self, idx: usize) -> Option<&Arg> {
        match self {
            Arg::Group(g) => g.inner.get(idx),
            Arg::Union(u) if idx == 0 => Some(&u.option),
            Arg::Pointer(p) if idx == 0 => p.res.as_deref(),
            _ => None,
        }
    }

    pub fn child_mut(&mut self, idx: usize) -> Option<&mut Arg> {
        match self {
            Arg::Group(g) => g.inner.get_mut(idx),
            Arg::Union(u) if idx == 0 => Some(&mut u.option),
            Arg::Pointer(p) if idx == 0 => p.res.as_deref_mut(),
            _ => None,
        }
    }

    /// Bytes the argument occupies when laid out in memory.
    pub fn byte_size(&self, target: &Target) -> u64 {
        match self {
            Arg::Const(a) => target.scalar_size(a.ty),
            Arg::Data(a) => a.data.len() as u64,
            Arg::Group(g) => g.inner.iter().map(|a| a.byte_size(target)).sum(),
            Arg::Union(u) => u.option.byte_size(target),
            Arg::Pointer(_) | Arg::Result(_) => 8,
        }
    }

    pub fn as_result(&self) -> Option<&ResultArg> {
        match self {
            Arg::Result(r) => Some(r),
            _ => None,
        }
    }
}

/// Where an argument sits while walking a call.
pub struct ArgCtx<'a, 'p> {
    pub path: &'p [usize],
    pub parent: Option<&'a Arg>,
    pub depth: usize,
}

fn visit<'a, F>(arg: &'a Arg, parent: Option<&'a Arg>, path: &mut Vec<usize>, f: &mut F)
where
    F: FnMut(&'a Arg, &ArgCtx<'a, '_>),
{
    let depth = path.len() - 1;
    f(
        arg,
        &ArgCtx {
            path: path.as_slice(),
            parent,
            depth,
        },
    );
    match arg {
        Arg::Group(g) => {
            for (i, inner) in g.inner.iter().enumerate() {
                path.push(i);
                visit(inner, Some(arg), path, f);
                path.pop();
            }
        }
        Arg::Union(u) => {
            path.push(0);
            visit(&u.option, Some(arg), path, f);
            path.pop();
        }
        Arg::Pointer(p) => {
            if let Some(res) = &p.res {
                path.push(0);
                visit(res, Some(arg), path, f);
                path.pop();
            }
        }
        _ => {}
    }
}

pub(crate) fn for_each_result_mut(arg: &mut Arg, f: &mut impl FnMut(&mut ResultArg)) {
    match arg {
        Arg::Result(r) => f(r),
        Arg::Group(g) => g.inner.iter_mut().for_each(|a| for_each_result_mut(a, f)),
        Arg::Union(u) => for_each_result_mut(&mut u.option, f),
        Arg::Pointer(p) => {
            if let Some(res) = p.res.as_deref_mut() {
                for_each_result_mut(res, f);
            }
        }
        Arg::Const(_) | Arg::Data(_) => {}
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub meta: Arc<Syscall>,
    pub args: Vec<Arg>,
    pub ret: Option<ResultArg>,
}

impl Call {
    /// Visits every argument depth-first, parents before children.
    pub fn for_each_arg<'a>(&'a self, mut f: impl FnMut(&'a Arg, &ArgCtx<'a, '_>)) {
        let mut path = Vec::with_capacity(8);
        for (i, arg) in self.args.iter().enumerate() {
            path.push(i);
            visit(arg, None, &mut path, &mut f);
            path.pop();
        }
    }

    pub fn arg_at(&self, path: &[usize]) -> Option<&Arg> {
        let (first, rest) = path.split_first()?;
        let mut arg = self.args.get(*first)?;
        for &i in rest {
            arg = arg.child(i)?;
        }
        Some(arg)
    }

    pub fn arg_at_mut(&mut self, path: &[usize]) -> Option<&mut Arg> {
        let (first, rest) = path.split_first()?;
        let mut arg = self.args.get_mut(*first)?;
        for &i in rest {
            arg = arg.child_mut(i)?;
        }
        Some(arg)
    }

    /// Every resource argument of the call, return value first.
    pub fn results(&self) -> Vec<&ResultArg> {
        let mut out: Vec<&ResultArg> = self.ret.iter().collect();
        self.for_each_arg(|arg, _| {
            if let Arg::Result(r) = arg {
                out.push(r);
            }
        });
        out
    }

    /// Resources this call defines, with their resource kinds.
    pub fn producers(&self, target: &Target) -> Vec<(ResultId, ResourceId)> {
        self.results()
            .into_iter()
            .enumerate()
            .filter(|(i, r)| (*i == 0 && self.ret.is_some()) || target.is_producer(r.ty))
            .filter_map(|(_, r)| target.resource_of(r.ty).map(|res| (r.id, res)))
            .collect()
    }

    /// Producers referenced by this call's consumers.
    pub fn uses(&self) -> Vec<ResultId> {
        let mut out = Vec::new();
        self.for_each_arg(|arg, _| {
            if let Arg::Result(r) = arg {
                if let Some(src) = r.source {
                    out.push(src);
                }
            }
        });
        out
    }

    pub(crate) fn results_mut(&mut self, mut f: impl FnMut(&mut ResultArg)) {
        if let Some(ret) = self.ret.as_mut() {
            f(ret);
        }
        for arg in &mut self.args {
            for_each_result_mut(arg, &mut f);
        }
    }
}

/// A problem found by [`Prog::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("call #{call} {name}: expected {expected} args, found {found}")]
    ArgCount {
        call: usize,
        name: String,
        expected: usize,
        found: usize,
    },

    /// An argument does not have the shape its type requires.
    #[error("call #{call} {name}: argument at {path:?}: {msg}")]
    BadArg {
        call: usize,
        name: String,
        path: ArgPath,
        msg: String,
    },

    #[error("call #{call} {name}: return value does not match the syscall")]
    BadReturn { call: usize, name: String },

    /// Result ids must be unique across the program.
    #[error("call #{call}: result id {id} is used twice")]
    DuplicateResult { call: usize, id: u64 },

    /// A consumer refers to a producer that is not defined by an earlier call.
    #[error("call #{call}: reference to undefined result r{id}")]
    DanglingResult { call: usize, id: u64 },

    #[error("call #{call}: result r{id} has an incompatible resource kind")]
    IncompatibleResult { call: usize, id: u64 },
}

/// A sequence of calls against one target.
#[derive(Clone, Debug)]
pub struct Prog {
    pub target: Arc<Target>,
    pub calls: Vec<Call>,
    pub(crate) next_result: u64,
}

impl PartialEq for Prog {
    fn eq(&self, other: &Self) -> bool {
        let same_target = Arc::ptr_eq(&self.target, &other.target)
            || (self.target.os == other.target.os && self.target.arch == other.target.arch);
        same_target && self.calls == other.calls
    }
}

impl Prog {
    pub fn new(target: Arc<Target>) -> Self {
        Self {
            target,
            calls: Vec::new(),
            next_result: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn alloc_result_id(&mut self) -> ResultId {
        let id = ResultId(self.next_result);
        self.next_result += 1;
        id
    }

    /// Call names joined with `-`, e.g. `mmap-write-sched_yield`.
    pub fn summary(&self) -> String {
        self.calls
            .iter()
            .map(|c| c.meta.name.as_str())
            .collect::<Vec<_>>()
            .join("-")
    }

    pub fn for_each_arg<'a>(&'a self, mut f: impl FnMut(usize, &'a Arg, &ArgCtx<'a, '_>)) {
        for (ci, call) in self.calls.iter().enumerate() {
            call.for_each_arg(|arg, ctx| f(ci, arg, ctx));
        }
    }

    /// Producers that at least one consumer refers to.
    pub fn used_results(&self) -> HashSet<ResultId> {
        self.calls.iter().flat_map(|c| c.uses()).collect()
    }

    pub fn insert_call(&mut self, idx: usize, call: Call) {
        self.insert_calls(idx, vec![call]);
    }

    pub fn insert_calls(&mut self, idx: usize, calls: Vec<Call>) {
        let idx = idx.min(self.calls.len());
        self.calls.splice(idx..idx, calls);
        self.repair_results();
    }

    /// Removes a call; consumers of its producers fall back to the sentinel value.
    pub fn remove_call(&mut self, idx: usize) -> Call {
        let call = self.calls.remove(idx);
        self.repair_results();
        call
    }

    /// Swaps the argument at `path` of call `call_idx`, returning the old one.
    pub fn replace_arg(&mut self, call_idx: usize, path: &[usize], arg: Arg) -> Option<Arg> {
        let slot = self.calls.get_mut(call_idx)?.arg_at_mut(path)?;
        let old = std::mem::replace(slot, arg);
        self.repair_results();
        Some(old)
    }

    /// Detaches consumers whose producer is missing or defined later.
    pub(crate) fn repair_results(&mut self) {
        let target = Arc::clone(&self.target);
        let mut defined = HashSet::new();
        for call in &mut self.calls {
            call.results_mut(|r| {
                if target.is_producer(r.ty) {
                    return;
                }
                if let Some(src) = r.source {
                    if !defined.contains(&src) {
                        r.source = None;
                        r.val = target
                            .resource_of(r.ty)
                            .map(|res| target.resource(res).default_value())
                            .unwrap_or(0);
                    }
                }
            });
            defined.extend(call.producers(&target).into_iter().map(|(id, _)| id));
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let target = &self.target;
        let mut defined: HashMap<ResultId, ResourceId> = HashMap::new();
        let mut seen = HashSet::new();
        for (ci, call) in self.calls.iter().enumerate() {
            let name = &call.meta.name;
            if call.args.len() != call.meta.args.len() {
                return Err(ValidationError::ArgCount {
                    call: ci,
                    name: name.clone(),
                    expected: call.meta.args.len(),
                    found: call.args.len(),
                });
            }
            let mut path = Vec::new();
            for (i, (arg, &ty)) in call.args.iter().zip(&call.meta.args).enumerate() {
                path.push(i);
                check_arg(target, ty, arg, &mut path).map_err(|(path, msg)| {
                    ValidationError::BadArg {
                        call: ci,
                        name: name.clone(),
                        path,
                        msg,
                    }
                })?;
                path.pop();
            }
            let ret_ok = match (&call.ret, call.meta.ret) {
                (None, None) => true,
                (Some(r), Some(ty)) => r.ty == ty && r.source.is_none(),
                _ => false,
            };
            if !ret_ok {
                return Err(ValidationError::BadReturn {
                    call: ci,
                    name: name.clone(),
                });
            }
            for r in call.results() {
                if !seen.insert(r.id) {
                    return Err(ValidationError::DuplicateResult {
                        call: ci,
                        id: r.id.0,
                    });
                }
                let Some(src) = r.source else { continue };
                let Some(&produced) = defined.get(&src) else {
                    return Err(ValidationError::DanglingResult {
                        call: ci,
                        id: src.0,
                    });
                };
                let wanted = target.resource_of(r.ty);
                if !wanted.is_some_and(|w| target.is_compatible(w, produced)) {
                    return Err(ValidationError::IncompatibleResult {
                        call: ci,
                        id: src.0,
                    });
                }
            }
            defined.extend(call.producers(target));
        }
        Ok(())
    }
}

fn fail(path: &[usize], msg: &str) -> Result<(), (ArgPath, String)> {
    Err((path.to_vec(), msg.to_string()))
}

fn check_arg(
    target: &Target,
    ty: TypeId,
    arg: &Arg,
    path: &mut Vec<usize>,
) -> Result<(), (ArgPath, String)> {
    if arg.ty() != ty {
        return fail(path, "argument type differs from declaration");
    }
    let t = target.ty(ty);
    match (&t.kind, arg) {
        (TypeKind::Const { val, .. }, Arg::Const(c)) => {
            if c.val != *val {
                return fail(path, "constant value changed");
            }
        }
        (
            TypeKind::Int { .. }
            | TypeKind::Flags { .. }
            | TypeKind::Proc { .. }
            | TypeKind::Len { .. },
            Arg::Const(_),
        ) => {}
        (TypeKind::Buffer(kind), Arg::Data(d)) => {
            if let BufferKind::Blob { max, .. } = kind {
                if t.dir == Dir::In && d.data.len() as u64 > *max {
                    return fail(path, "buffer longer than its maximum");
                }
            }
        }
        (TypeKind::Struct { fields }, Arg::Group(g)) => {
            if fields.len() != g.inner.len() {
                return fail(path, "struct field count mismatch");
            }
            for (i, (&fty, inner)) in fields.iter().zip(&g.inner).enumerate() {
                path.push(i);
                check_arg(target, fty, inner, path)?;
                path.pop();
            }
        }
        (TypeKind::Array { elem, len }, Arg::Group(g)) => {
            // Arrays without a declared range may hold any count.
            if let ArrayLen::Range(lo, hi) = *len {
                let n = g.inner.len() as u64;
                if n < lo || n > hi.max(lo) {
                    return fail(path, "array element count outside its declared range");
                }
            }
            for (i, inner) in g.inner.iter().enumerate() {
                path.push(i);
                check_arg(target, *elem, inner, path)?;
                path.pop();
            }
        }
        (TypeKind::Union { options, .. }, Arg::Union(u)) => {
            let Some(&oty) = options.get(u.index) else {
                return fail(path, "union option index out of range");
            };
            path.push(0);
            check_arg(target, oty, &u.option, path)?;
            path.pop();
        }
        (TypeKind::Ptr { elem }, Arg::Pointer(p)) => {
            if p.vma_size != 0 {
                return fail(path, "data pointer with a vma size");
            }
            match &p.res {
                Some(_) if p.special => return fail(path, "special pointer with a pointee"),
                Some(res) => {
                    path.push(0);
                    check_arg(target, *elem, res, path)?;
                    path.pop();
                }
                None => {}
            }
        }
        (TypeKind::Vma, Arg::Pointer(p)) => {
            if p.res.is_some() {
                return fail(path, "vma pointer with a pointee");
            }
        }
        (TypeKind::Resource { .. }, Arg::Result(r)) => {
            if t.dir == Dir::Out && r.source.is_some() {
                return fail(path, "output resource refers to another result");
            }
        }
        _ => return fail(path, "argument variant does not match its type"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::deserialize;
    use crate::targets::get_target;

    const PIPE_WRITE: &str = "mmap(&(0x7f0000000000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n\
        pipe2(&(0x7f0000000000)={<r0=>0x0, <r1=>0x0}, 0x0)\n\
        write(r1, &(0x7f0000000000)=\"1155\", 0x2)\n\
        close(r0)\n";

    #[test]
    fn summary_joins_call_names() {
        let target = get_target("linux", "amd64").unwrap();
        let prog = deserialize(&target, PIPE_WRITE).unwrap();
        assert_eq!(prog.summary(), "mmap-pipe2-write-close");
        assert_eq!(prog.len(), 4);
    }

    #[test]
    fn remove_producer_detaches_consumers() {
        let target = get_target("linux", "amd64").unwrap();
        let mut prog = deserialize(&target, PIPE_WRITE).unwrap();
        assert_eq!(prog.used_results().len(), 2);
        prog.remove_call(1);
        prog.validate().expect("program must stay valid after removal");
        assert!(prog.used_results().is_empty());
        let write = &prog.calls[1];
        let fd = write.args[0].as_result().unwrap();
        assert_eq!(fd.source, None);
        assert_eq!(fd.val, u64::MAX, "detached consumer must fall back to the sentinel");
    }

    #[test]
    fn paths_address_nested_arguments() {
        let target = get_target("linux", "amd64").unwrap();
        let prog = deserialize(&target, PIPE_WRITE).unwrap();
        let pipe = &prog.calls[1];
        let mut paths = Vec::new();
        pipe.for_each_arg(|_, ctx| paths.push((ctx.path.to_vec(), ctx.depth)));
        assert_eq!(
            paths,
            vec![
                (vec![0], 0),
                (vec![0, 0], 1),
                (vec![0, 0, 0], 2),
                (vec![0, 0, 1], 2),
                (vec![1], 0)
            ]
        );
        let wfd = pipe.arg_at(&[0, 0, 1]).and_then(Arg::as_result).unwrap();
        assert!(target.is_producer(wfd.ty));
        assert!(pipe.arg_at(&[0, 0, 2]).is_none());
    }

    #[test]
    fn validate_rejects_forward_reference() {
        let target = get_target("linux", "amd64").unwrap();
        let mut prog = deserialize(&target, PIPE_WRITE).unwrap();
        let close = prog.calls.remove(3);
        prog.calls.insert(0, close);
        assert!(matches!(
            prog.validate(),
            Err(ValidationError::DanglingResult { call: 0, .. })
        ));
        prog.repair_results();
        assert!(prog.validate().is_ok());
    }

    #[test]
    fn validate_rejects_changed_constant_and_arg_count() {
        let target = get_target("test", "64").unwrap();
        let mut prog = deserialize(&target, "mutate3(&(0x7f0000000000)=[0x1, 0x1], 0x2)\n").unwrap();
        assert!(prog.validate().is_ok());
        if let Some(Arg::Const(c)) = prog.calls[0].arg_at_mut(&[0, 0, 1]) {
            c.val = 2;
        }
        assert!(matches!(prog.validate(), Err(ValidationError::BadArg { .. })));
        prog.calls[0].args.pop();
        assert!(matches!(prog.validate(), Err(ValidationError::ArgCount { .. })));
    }

    #[test]
    fn clone_is_deep_and_equal() {
        let target = get_target("linux", "amd64").unwrap();
        let prog = deserialize(&target, PIPE_WRITE).unwrap();
        let mut copy = prog.clone();
        assert_eq!(prog, copy);
        copy.remove_call(3);
        assert_eq!(prog.len(), 4);
        assert_ne!(prog, copy);
    }
}
