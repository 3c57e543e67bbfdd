//! Random program synthesis driven by the type descriptor.

use crate::prio::ChoiceTable;
use crate::prog::{
    Arg, Call, ConstArg, DataArg, GroupArg, PointerArg, Prog, ResultArg, ResultId, UnionArg,
};
use crate::random::{
    MAX_ARRAY_LEN, choose_weighted, one_of, rand_array_len, rand_buf_len, rand_flags, rand_int,
    rand_range,
};
use crate::size::assign_sizes_call;
use crate::target::{ArrayLen, BufferKind, Dir, ResourceId, Target, TypeId, TypeKind, truncate};
use rand::Rng;
use std::sync::Arc;

/// Nesting depth past which arrays stay minimal and pointers lose their pointee.
pub(crate) const MAX_DEPTH: usize = 8;
/// How many producer calls may be stacked to satisfy one consumer.
const MAX_CTOR_DEPTH: usize = 2;

const SPECIAL_FILES: [&[u8]; 3] = [b".\0", b"/\0", b"/dev/null\0"];

pub(crate) fn const_arg(ty: TypeId, val: u64) -> Arg {
    Arg::Const(ConstArg { ty, val })
}

/// A per-process value, or the all-ones special value.
pub(crate) fn rand_proc<R: Rng + ?Sized>(rng: &mut R, size: u64, per_proc: u64) -> u64 {
    if one_of(rng, 20) {
        truncate(u64::MAX, size)
    } else {
        rng.random_range(0..per_proc.max(1))
    }
}

pub(crate) fn array_bounds(len: &ArrayLen) -> (u64, u64) {
    match *len {
        ArrayLen::Random => (0, MAX_ARRAY_LEN),
        ArrayLen::Range(lo, hi) => (lo, hi.max(lo)),
    }
}

fn rand_array_count<R: Rng + ?Sized>(rng: &mut R, len: &ArrayLen) -> u64 {
    match *len {
        ArrayLen::Random => rand_array_len(rng),
        ArrayLen::Range(lo, hi) => rand_range(rng, lo, hi),
    }
}

/// The simplest well-formed value of a type.
pub(crate) fn default_arg(target: &Target, ty: TypeId, next_result: &mut u64) -> Arg {
    let t = target.ty(ty);
    match &t.kind {
        TypeKind::Const { val, .. } => const_arg(ty, *val),
        TypeKind::Int {
            range: Some((lo, _)),
            ..
        } => const_arg(ty, *lo),
        TypeKind::Int { .. }
        | TypeKind::Flags { .. }
        | TypeKind::Proc { .. }
        | TypeKind::Len { .. } => const_arg(ty, 0),
        TypeKind::Resource { desc } => {
            let id = ResultId(*next_result);
            *next_result += 1;
            let val = match t.dir {
                Dir::Out => 0,
                Dir::In => target.resource(*desc).default_value(),
            };
            Arg::Result(ResultArg {
                ty,
                id,
                source: None,
                val,
            })
        }
        TypeKind::Ptr { .. } => Arg::Pointer(PointerArg {
            ty,
            addr: 0,
            vma_size: 0,
            res: None,
            special: false,
        }),
        TypeKind::Vma => Arg::Pointer(PointerArg {
            ty,
            addr: 0,
            vma_size: target.page_size,
            res: None,
            special: false,
        }),
        TypeKind::Buffer(kind) => {
            let data = match kind {
                BufferKind::Blob { min, .. } => vec![0; *min as usize],
                BufferKind::Filename => Vec::new(),
                BufferKind::Text { values } => values.first().cloned().unwrap_or_default(),
            };
            Arg::Data(DataArg { ty, data })
        }
        TypeKind::Array { elem, len } => {
            let (min, _) = array_bounds(len);
            let inner = (0..min)
                .map(|_| default_arg(target, *elem, next_result))
                .collect();
            Arg::Group(GroupArg { ty, inner })
        }
        TypeKind::Struct { fields } => {
            let inner = fields
                .iter()
                .map(|&f| default_arg(target, f, next_result))
                .collect();
            Arg::Group(GroupArg { ty, inner })
        }
        TypeKind::Union { options, .. } => Arg::Union(UnionArg {
            ty,
            index: 0,
            option: Box::new(default_arg(target, options[0], next_result)),
        }),
    }
}

/// Bump allocator over the data area's pages.
///
/// Regions are rounded up to a power-of-two page count and aligned to it.
/// When the area runs out, allocation restarts from page zero.
#[derive(Debug, Clone)]
pub(crate) struct MemAlloc {
    page_size: u64,
    num_pages: u64,
    next_page: u64,
}

impl MemAlloc {
    pub(crate) fn new(target: &Target) -> Self {
        Self {
            page_size: target.page_size,
            num_pages: target.num_pages,
            next_page: 0,
        }
    }

    /// Returns the offset of a fresh region able to hold `size` bytes.
    pub(crate) fn alloc(&mut self, size: u64) -> u64 {
        let npages = size.div_ceil(self.page_size).max(1);
        let class = npages.next_power_of_two();
        let mut start = self.next_page.next_multiple_of(class);
        if start + npages > self.num_pages {
            start = 0;
        }
        self.next_page = start + npages;
        start * self.page_size
    }

    /// Moves the cursor past byte offset `end`.
    pub(crate) fn reserve(&mut self, end: u64) {
        self.next_page = self.next_page.max(end.div_ceil(self.page_size));
    }
}

/// The offset and byte length mapped by `call` if it is the target's mmap.
/// The length argument wins over the vma size, as it does for the kernel.
pub(crate) fn mmap_range(target: &Target, call: &Call) -> Option<(u64, u64)> {
    if target.mmap.as_ref()?.syscall != call.meta.id {
        return None;
    }
    let mut vma = None;
    let mut len = None;
    for (arg, &ty) in call.args.iter().zip(&call.meta.args) {
        match (&target.ty(ty).kind, arg) {
            (TypeKind::Vma, Arg::Pointer(p)) if !p.special => vma = Some((p.addr, p.vma_size)),
            (TypeKind::Len { .. }, Arg::Const(c)) => len = Some(c.val),
            _ => {}
        }
    }
    let (addr, vma_size) = vma?;
    Some((addr, len.unwrap_or(vma_size)))
}

/// What the generator knows about the program prefix it appends to.
pub(crate) struct GenState<'a> {
    target: &'a Target,
    ct: Option<&'a ChoiceTable>,
    pub(crate) next_result: u64,
    resources: Vec<(ResultId, ResourceId)>,
    files: Vec<Vec<u8>>,
    mem: MemAlloc,
    mapped: Vec<bool>,
    ctor_depth: usize,
}

impl<'a> GenState<'a> {
    pub(crate) fn new(target: &'a Target, ct: Option<&'a ChoiceTable>, next_result: u64) -> Self {
        Self {
            target,
            ct,
            next_result,
            resources: Vec::new(),
            files: Vec::new(),
            mem: MemAlloc::new(target),
            mapped: vec![false; target.num_pages as usize],
            ctor_depth: 0,
        }
    }

    /// State for generating calls to be placed at index `upto` of `prog`.
    pub(crate) fn analyze(
        target: &'a Target,
        prog: &Prog,
        ct: Option<&'a ChoiceTable>,
        upto: usize,
    ) -> Self {
        let mut state = Self::new(target, ct, prog.next_result);
        for call in &prog.calls[..upto.min(prog.calls.len())] {
            state.note_call(call);
        }
        let mut end = 0;
        prog.for_each_arg(|_, arg, _| {
            if let Arg::Pointer(p) = arg {
                if !p.special {
                    let size = match &p.res {
                        Some(res) => res.byte_size(target),
                        None => p.vma_size,
                    };
                    end = end.max(p.addr.saturating_add(size));
                }
            }
        });
        state.mem.reserve(end);
        state
    }

    fn alloc_id(&mut self) -> ResultId {
        let id = ResultId(self.next_result);
        self.next_result += 1;
        id
    }

    fn new_producer(&mut self, ty: TypeId) -> ResultArg {
        ResultArg {
            ty,
            id: self.alloc_id(),
            source: None,
            val: 0,
        }
    }

    pub(crate) fn choose_syscall<R: Rng + ?Sized>(&self, rng: &mut R, prev: Option<usize>) -> usize {
        match self.ct {
            Some(ct) => ct.choose(rng, prev),
            None => rng.random_range(0..self.target.syscalls.len()),
        }
    }

    /// Records the resources, filenames and mappings a call makes available.
    pub(crate) fn note_call(&mut self, call: &Call) {
        let target = self.target;
        self.resources.extend(call.producers(target));
        let files = &mut self.files;
        call.for_each_arg(|arg, _| {
            if let Arg::Data(d) = arg {
                if matches!(target.ty(d.ty).kind, TypeKind::Buffer(BufferKind::Filename))
                    && !files.contains(&d.data)
                {
                    files.push(d.data.clone());
                }
            }
        });
        if let Some((addr, size)) = mmap_range(target, call) {
            if size > 0 {
                self.mark_mapped(addr, size);
            }
        }
    }

    fn page_span(&self, addr: u64, size: u64) -> (u64, u64) {
        let page = self.target.page_size;
        let first = addr / page;
        let end = addr
            .saturating_add(size.max(1))
            .div_ceil(page)
            .min(self.target.num_pages);
        (first, end)
    }

    fn mark_mapped(&mut self, addr: u64, size: u64) {
        let (first, end) = self.page_span(addr, size);
        for p in first..end {
            self.mapped[p as usize] = true;
        }
    }

    /// Allocates a region for `size` bytes and maps it if needed.
    pub(crate) fn alloc(&mut self, size: u64, pre: &mut Vec<Call>) -> u64 {
        let addr = self.mem.alloc(size);
        self.ensure_mapped(addr, size, pre);
        addr
    }

    /// Appends an mmap to `pre` when any page of the region is still unmapped.
    pub(crate) fn ensure_mapped(&mut self, addr: u64, size: u64, pre: &mut Vec<Call>) {
        let (first, end) = self.page_span(addr, size);
        if first >= end || (first..end).all(|p| self.mapped[p as usize]) {
            return;
        }
        let page = self.target.page_size;
        if let Some(call) = self.make_mmap(first * page, (end - first) * page) {
            self.note_call(&call);
            pre.push(call);
        }
    }

    /// An mmap of `size` bytes at offset `addr`, if the target has one.
    pub(crate) fn make_mmap(&mut self, addr: u64, size: u64) -> Option<Call> {
        let target = self.target;
        let spec = target.mmap.as_ref()?;
        let meta = Arc::clone(&target.syscalls[spec.syscall]);
        let mut args = Vec::with_capacity(meta.args.len());
        for &ty in &meta.args {
            let t = target.ty(ty);
            let arg = match &t.kind {
                TypeKind::Vma => Arg::Pointer(PointerArg {
                    ty,
                    addr,
                    vma_size: size,
                    res: None,
                    special: false,
                }),
                TypeKind::Flags { .. } | TypeKind::Int { .. } if t.name == "prot" => {
                    const_arg(ty, spec.prot)
                }
                TypeKind::Flags { .. } | TypeKind::Int { .. } if t.name == "flags" => {
                    const_arg(ty, spec.flags)
                }
                _ => default_arg(target, ty, &mut self.next_result),
            };
            args.push(arg);
        }
        let ret = meta.ret.map(|ty| self.new_producer(ty));
        let mut call = Call { meta, args, ret };
        assign_sizes_call(target, &mut call);
        Some(call)
    }

    /// Synthesizes a call to syscall `id`, preceded by any calls it depends on.
    pub(crate) fn generate_call<R: Rng + ?Sized>(&mut self, rng: &mut R, id: usize) -> Vec<Call> {
        let target = self.target;
        let meta = Arc::clone(&target.syscalls[id]);
        let mut pre = Vec::new();
        let mut args = Vec::with_capacity(meta.args.len());
        for &ty in &meta.args {
            args.push(self.gen_arg(rng, ty, 0, &mut pre));
        }
        let ret = meta.ret.map(|ty| self.new_producer(ty));
        let mut call = Call { meta, args, ret };
        assign_sizes_call(target, &mut call);
        self.note_call(&call);
        pre.push(call);
        pre
    }

    pub(crate) fn gen_arg<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        ty: TypeId,
        depth: usize,
        pre: &mut Vec<Call>,
    ) -> Arg {
        let target = self.target;
        let t = target.ty(ty);
        let out = t.dir == Dir::Out;
        match &t.kind {
            TypeKind::Const { val, .. } => const_arg(ty, *val),
            TypeKind::Len { .. } => const_arg(ty, 0),
            _ if out && t.int_size().is_some() => const_arg(ty, 0),
            TypeKind::Int { size, range } => {
                let val = match range {
                    Some((lo, hi)) => rand_range(rng, *lo, *hi),
                    None => rand_int(rng, *size),
                };
                const_arg(ty, val)
            }
            TypeKind::Flags { size, vals } => const_arg(ty, rand_flags(rng, vals, *size)),
            TypeKind::Proc { size, per_proc, .. } => const_arg(ty, rand_proc(rng, *size, *per_proc)),
            TypeKind::Resource { desc } => {
                if out {
                    Arg::Result(self.new_producer(ty))
                } else {
                    Arg::Result(self.gen_consumer(rng, ty, *desc, pre))
                }
            }
            TypeKind::Ptr { elem } => self.gen_pointer(rng, ty, *elem, t.optional, depth, pre),
            TypeKind::Vma => self.gen_vma(rng, ty),
            TypeKind::Buffer(kind) => Arg::Data(DataArg {
                ty,
                data: self.gen_buffer(rng, kind, out),
            }),
            TypeKind::Array { elem, len } => {
                let count = if depth >= MAX_DEPTH {
                    array_bounds(len).0
                } else {
                    rand_array_count(rng, len)
                };
                let mut inner = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    inner.push(self.gen_arg(rng, *elem, depth + 1, pre));
                }
                Arg::Group(GroupArg { ty, inner })
            }
            TypeKind::Struct { fields } => {
                let mut inner = Vec::with_capacity(fields.len());
                for &field in fields {
                    inner.push(self.gen_arg(rng, field, depth + 1, pre));
                }
                Arg::Group(GroupArg { ty, inner })
            }
            TypeKind::Union { options, weights } => {
                let index = weights
                    .as_deref()
                    .and_then(|w| choose_weighted(rng, w))
                    .unwrap_or_else(|| rng.random_range(0..options.len()));
                let option = self.gen_arg(rng, options[index], depth + 1, pre);
                Arg::Union(UnionArg {
                    ty,
                    index,
                    option: Box::new(option),
                })
            }
        }
    }

    /// A compatible producer from the calls seen so far.
    pub(crate) fn pick_producer<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        desc: ResourceId,
    ) -> Option<ResultId> {
        let compatible: Vec<ResultId> = self
            .resources
            .iter()
            .filter(|(_, res)| self.target.is_compatible(desc, *res))
            .map(|(id, _)| *id)
            .collect();
        if compatible.is_empty() {
            return None;
        }
        Some(compatible[rng.random_range(0..compatible.len())])
    }

    fn pick_ctor<R: Rng + ?Sized>(&self, rng: &mut R, desc: ResourceId) -> Option<usize> {
        let ctors: Vec<usize> = self
            .target
            .resource_ctors(desc)
            .iter()
            .copied()
            .filter(|&id| self.ct.is_none_or(|ct| ct.enabled(id)))
            .collect();
        if ctors.is_empty() {
            return None;
        }
        Some(ctors[rng.random_range(0..ctors.len())])
    }

    /// A literal value for a consumer with no producer.
    pub(crate) fn special_resource_value<R: Rng + ?Sized>(&self, rng: &mut R, desc: ResourceId) -> u64 {
        let values = &self.target.resource(desc).values;
        if values.len() > 1 && one_of(rng, 5) {
            values[rng.random_range(0..values.len())]
        } else {
            self.target.resource(desc).default_value()
        }
    }

    fn gen_consumer<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        ty: TypeId,
        desc: ResourceId,
        pre: &mut Vec<Call>,
    ) -> ResultArg {
        let mut arg = ResultArg {
            ty,
            id: self.alloc_id(),
            source: None,
            val: self.target.resource(desc).default_value(),
        };
        if let Some(src) = self.pick_producer(rng, desc) {
            if !one_of(rng, 10) {
                arg.source = Some(src);
                return arg;
            }
        } else if self.ctor_depth < MAX_CTOR_DEPTH && rng.random_bool(0.5) {
            if let Some(ctor) = self.pick_ctor(rng, desc) {
                self.ctor_depth += 1;
                let calls = self.generate_call(rng, ctor);
                self.ctor_depth -= 1;
                pre.extend(calls);
                arg.source = self.pick_producer(rng, desc);
                if arg.source.is_some() {
                    return arg;
                }
            }
        }
        arg.val = self.special_resource_value(rng, desc);
        arg
    }

    fn gen_pointer<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        ty: TypeId,
        elem: TypeId,
        optional: bool,
        depth: usize,
        pre: &mut Vec<Call>,
    ) -> Arg {
        let target = self.target;
        if optional && one_of(rng, 20) {
            return Arg::Pointer(special_pointer(ty, 0));
        }
        if !target.special_pointers.is_empty() && one_of(rng, 100) {
            let val = target.special_pointers[rng.random_range(0..target.special_pointers.len())];
            return Arg::Pointer(special_pointer(ty, val));
        }
        let res = if depth >= MAX_DEPTH {
            None
        } else {
            Some(Box::new(self.gen_arg(rng, elem, depth + 1, pre)))
        };
        let size = res.as_deref().map_or(0, |r| r.byte_size(target));
        let addr = self.alloc(size, pre);
        Arg::Pointer(PointerArg {
            ty,
            addr,
            vma_size: 0,
            res,
            special: false,
        })
    }

    pub(crate) fn gen_vma<R: Rng + ?Sized>(&mut self, rng: &mut R, ty: TypeId) -> Arg {
        let npages = if one_of(rng, 10) {
            rng.random_range(1..=16)
        } else {
            rng.random_range(1..=4)
        };
        let size = npages * self.target.page_size;
        Arg::Pointer(PointerArg {
            ty,
            addr: self.mem.alloc(size),
            vma_size: size,
            res: None,
            special: false,
        })
    }

    fn gen_buffer<R: Rng + ?Sized>(&mut self, rng: &mut R, kind: &BufferKind, out: bool) -> Vec<u8> {
        match kind {
            BufferKind::Blob { min, max } => {
                let n = rand_buf_len(rng, *min, *max) as usize;
                if out {
                    vec![0; n]
                } else {
                    (0..n).map(|_| rng.random::<u8>()).collect()
                }
            }
            BufferKind::Filename => self.gen_filename(rng),
            BufferKind::Text { values } => {
                if values.is_empty() {
                    Vec::new()
                } else {
                    values[rng.random_range(0..values.len())].clone()
                }
            }
        }
    }

    /// An existing filename, a special path or a fresh one.
    pub(crate) fn gen_filename<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<u8> {
        if !self.files.is_empty() && rng.random_bool(0.7) {
            return self.files[rng.random_range(0..self.files.len())].clone();
        }
        if one_of(rng, 10) {
            return SPECIAL_FILES[rng.random_range(0..SPECIAL_FILES.len())].to_vec();
        }
        self.fresh_filename()
    }

    /// `./fileN` for the smallest `N` not yet used by the program.
    pub(crate) fn fresh_filename(&self) -> Vec<u8> {
        (self.files.len()..)
            .map(|n| format!("./file{}\0", n).into_bytes())
            .find(|name| !self.files.contains(name))
            .unwrap_or_default()
    }
}

pub(crate) fn special_pointer(ty: TypeId, val: u64) -> PointerArg {
    PointerArg {
        ty,
        addr: val,
        vma_size: 0,
        res: None,
        special: true,
    }
}

/// Generates a program of at most `ncalls` calls.
///
/// Calls are picked through `ct` when given, uniformly otherwise. Returns an
/// empty program when `ncalls` is zero or the target has no syscalls.
pub fn generate<R: Rng + ?Sized>(
    target: &Arc<Target>,
    rng: &mut R,
    ncalls: usize,
    ct: Option<&ChoiceTable>,
) -> Prog {
    let mut prog = Prog::new(Arc::clone(target));
    if ncalls == 0 || target.syscalls.is_empty() {
        return prog;
    }
    let mut calls = Vec::new();
    let mut state = GenState::new(target, ct, 0);
    while calls.len() < ncalls {
        let prev = calls.last().map(|c: &Call| c.meta.id);
        let id = state.choose_syscall(rng, prev);
        calls.extend(state.generate_call(rng, id));
        if one_of(rng, (4 * ncalls) as u32) {
            break;
        }
    }
    prog.next_result = state.next_result;
    prog.calls = calls;
    while prog.calls.len() > ncalls {
        prog.remove_call(prog.calls.len() - 1);
    }
    log::trace!("generated {} calls: {}", prog.len(), prog.summary());
    prog
}

impl Prog {
    pub fn generate<R: Rng + ?Sized>(
        target: &Arc<Target>,
        rng: &mut R,
        ncalls: usize,
        ct: Option<&ChoiceTable>,
    ) -> Prog {
        generate(target, rng, ncalls, ct)
    }
}
