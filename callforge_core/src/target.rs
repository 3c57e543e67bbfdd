use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while looking up or assembling a [`Target`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// No descriptor is registered for this OS/architecture pair.
    #[error("unsupported target {os}/{arch}")]
    Unsupported { os: String, arch: String },

    /// A length field names a sibling that does not exist.
    #[error("{owner}: length field `{field}` refers to unknown sibling `{of}`")]
    BadLenRef {
        owner: String,
        field: String,
        of: String,
    },

    /// Two syscalls share the same name.
    #[error("duplicate syscall name `{0}`")]
    DuplicateSyscall(String),

    #[error("union `{0}` has no options")]
    EmptyUnion(String),

    /// The mmap call registered for page mapping was never defined.
    #[error("mmap syscall `{0}` is not defined")]
    MissingMmap(String),
}

/// Index of a [`Type`] inside the target's type arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) usize);

/// Index of a [`ResourceDesc`] inside the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dir {
    In,
    Out,
}

/// How a length field measures its sibling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LenUnit {
    /// Element count for arrays, byte count for everything else.
    Count,
    /// Byte size divided by the given unit.
    Bytes(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayLen {
    Random,
    Range(u64, u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Blob { min: u64, max: u64 },
    Filename,
    Text { values: Vec<Vec<u8>> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Const {
        val: u64,
        size: u64,
    },
    Int {
        size: u64,
        range: Option<(u64, u64)>,
    },
    Flags {
        size: u64,
        vals: Vec<u64>,
    },
    /// Per-process value (ports, ids) drawn from `start..start + per_proc`.
    Proc {
        size: u64,
        start: u64,
        per_proc: u64,
    },
    Len {
        size: u64,
        of: String,
        unit: LenUnit,
    },
    Resource {
        desc: ResourceId,
    },
    Ptr {
        elem: TypeId,
    },
    Vma,
    Buffer(BufferKind),
    Array {
        elem: TypeId,
        len: ArrayLen,
    },
    Struct {
        fields: Vec<TypeId>,
    },
    Union {
        options: Vec<TypeId>,
        weights: Option<Vec<u32>>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Type {
    /// Parameter or field name; also the selector for union options.
    pub name: String,
    pub dir: Dir,
    pub optional: bool,
    pub kind: TypeKind,
}

impl Type {
    /// Width in bytes of integer-like types, `None` for everything else.
    pub fn int_size(&self) -> Option<u64> {
        match &self.kind {
            TypeKind::Const { size, .. }
            | TypeKind::Int { size, .. }
            | TypeKind::Flags { size, .. }
            | TypeKind::Proc { size, .. }
            | TypeKind::Len { size, .. } => Some(*size),
            _ => None,
        }
    }

    /// Buffers whose content is meant to be human readable.
    pub fn is_readable(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Buffer(BufferKind::Filename) | TypeKind::Buffer(BufferKind::Text { .. })
        )
    }

    pub fn is_len(&self) -> bool {
        matches!(self.kind, TypeKind::Len { .. })
    }
}

/// Describes a resource kind such as a file descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    pub name: String,
    /// Kind hierarchy, most general first (`["fd", "fd_pipe"]`).
    pub kind: Vec<String>,
    /// Special literal values; the first one is the invalid-handle sentinel.
    pub values: Vec<u64>,
}

impl ResourceDesc {
    pub fn default_value(&self) -> u64 {
        self.values.first().copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Syscall {
    pub id: usize,
    pub name: String,
    pub args: Vec<TypeId>,
    pub ret: Option<TypeId>,
}

/// Names the call used to map data pages and the constants it is issued with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MmapSpec {
    pub syscall: usize,
    pub prot: u64,
    pub flags: u64,
}

/// The read-only description of every call available on one OS/architecture.
#[derive(Debug)]
pub struct Target {
    pub os: String,
    pub arch: String,
    pub page_size: u64,
    /// Base address that pointer offsets are printed relative to.
    pub data_offset: u64,
    pub num_pages: u64,
    pub syscalls: Vec<Arc<Syscall>>,
    pub special_pointers: Vec<u64>,
    pub mmap: Option<MmapSpec>,
    types: Vec<Type>,
    resources: Vec<ResourceDesc>,
    by_name: HashMap<String, usize>,
    resource_ctors: Vec<Vec<usize>>,
}

/// Truncates `val` to an integer of `size` bytes.
pub fn truncate(val: u64, size: u64) -> u64 {
    if size >= 8 {
        val
    } else {
        val & ((1u64 << (size * 8)) - 1)
    }
}

impl Target {
    pub fn ty(&self, id: TypeId) -> &Type {
        &self.types[id.0]
    }

    pub fn resource(&self, id: ResourceId) -> &ResourceDesc {
        &self.resources[id.0]
    }

    pub fn resources(&self) -> &[ResourceDesc] {
        &self.resources
    }

    pub fn syscall(&self, name: &str) -> Option<&Arc<Syscall>> {
        self.by_name.get(name).map(|&id| &self.syscalls[id])
    }

    /// Syscalls that can produce a resource usable where `res` is expected.
    pub fn resource_ctors(&self, res: ResourceId) -> &[usize] {
        &self.resource_ctors[res.0]
    }

    /// A producer of kind `producer` may be consumed where `consumer` is expected
    /// when the consumer's kind hierarchy is a prefix of the producer's.
    pub fn is_compatible(&self, consumer: ResourceId, producer: ResourceId) -> bool {
        let want = &self.resource(consumer).kind;
        let have = &self.resource(producer).kind;
        want.len() <= have.len() && want.iter().zip(have).all(|(a, b)| a == b)
    }

    /// Resource of a `Resource` type, `None` for other kinds.
    pub fn resource_of(&self, ty: TypeId) -> Option<ResourceId> {
        match self.ty(ty).kind {
            TypeKind::Resource { desc } => Some(desc),
            _ => None,
        }
    }

    /// Whether an argument of this type defines a resource other calls may use.
    pub fn is_producer(&self, ty: TypeId) -> bool {
        let t = self.ty(ty);
        matches!(t.kind, TypeKind::Resource { .. }) && t.dir == Dir::Out
    }

    /// Size in bytes of scalar-like types; variable sized kinds report zero.
    pub fn scalar_size(&self, ty: TypeId) -> u64 {
        let t = self.ty(ty);
        match t.kind {
            TypeKind::Resource { .. } | TypeKind::Ptr { .. } | TypeKind::Vma => 8,
            _ => t.int_size().unwrap_or(0),
        }
    }

    pub fn max_address(&self) -> u64 {
        self.num_pages * self.page_size
    }

    fn produced_resources(&self, call: &Syscall) -> HashSet<ResourceId> {
        let mut out = HashSet::new();
        let mut seen = HashSet::new();
        if let Some(ret) = call.ret {
            if let Some(res) = self.resource_of(ret) {
                out.insert(res);
            }
        }
        let mut stack: Vec<TypeId> = call.args.clone();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let t = self.ty(id);
            match &t.kind {
                TypeKind::Resource { desc } if t.dir == Dir::Out => {
                    out.insert(*desc);
                }
                TypeKind::Ptr { elem } | TypeKind::Array { elem, .. } => stack.push(*elem),
                TypeKind::Struct { fields } => stack.extend(fields.iter().copied()),
                TypeKind::Union { options, .. } => stack.extend(options.iter().copied()),
                _ => {}
            }
        }
        out
    }
}

/// Assembles a [`Target`] from type, resource and syscall declarations.
///
/// Types created inside [`TargetBuilder::out`] default to [`Dir::Out`].
pub struct TargetBuilder {
    os: String,
    arch: String,
    page_size: u64,
    data_offset: u64,
    num_pages: u64,
    special_pointers: Vec<u64>,
    types: Vec<Type>,
    resources: Vec<ResourceDesc>,
    syscalls: Vec<Syscall>,
    mmap: Option<(String, u64, u64)>,
    dir: Dir,
}

impl TargetBuilder {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            page_size: 0x1000,
            data_offset: 0x7f00_0000_0000,
            num_pages: 4096,
            special_pointers: vec![0, 0xffff_ffff_ffff_ffff],
            types: Vec::new(),
            resources: Vec::new(),
            syscalls: Vec::new(),
            mmap: None,
            dir: Dir::In,
        }
    }

    pub fn memory(mut self, page_size: u64, data_offset: u64, num_pages: u64) -> Self {
        self.page_size = page_size;
        self.data_offset = data_offset;
        self.num_pages = num_pages;
        self
    }

    pub fn special_pointers(mut self, values: &[u64]) -> Self {
        self.special_pointers = values.to_vec();
        self
    }

    pub fn resource(&mut self, name: &str, kind: &[&str], values: &[u64]) -> ResourceId {
        self.resources.push(ResourceDesc {
            name: name.to_string(),
            kind: kind.iter().map(|k| k.to_string()).collect(),
            values: values.to_vec(),
        });
        ResourceId(self.resources.len() - 1)
    }

    pub fn add(&mut self, name: &str, kind: TypeKind) -> TypeId {
        self.push(name, false, kind)
    }

    pub fn add_opt(&mut self, name: &str, kind: TypeKind) -> TypeId {
        self.push(name, true, kind)
    }

    fn push(&mut self, name: &str, optional: bool, kind: TypeKind) -> TypeId {
        self.types.push(Type {
            name: name.to_string(),
            dir: self.dir,
            optional,
            kind,
        });
        TypeId(self.types.len() - 1)
    }

    /// Declares the types created by `f` as outputs of the call.
    pub fn out<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let prev = self.dir;
        self.dir = Dir::Out;
        let res = f(self);
        self.dir = prev;
        res
    }

    pub fn int(&mut self, name: &str, size: u64) -> TypeId {
        self.add(name, TypeKind::Int { size, range: None })
    }

    pub fn int_range(&mut self, name: &str, size: u64, lo: u64, hi: u64) -> TypeId {
        self.add(
            name,
            TypeKind::Int {
                size,
                range: Some((lo, hi)),
            },
        )
    }

    pub fn constant(&mut self, name: &str, val: u64, size: u64) -> TypeId {
        self.add(name, TypeKind::Const { val, size })
    }

    pub fn flags(&mut self, name: &str, size: u64, vals: &[u64]) -> TypeId {
        self.add(
            name,
            TypeKind::Flags {
                size,
                vals: vals.to_vec(),
            },
        )
    }

    pub fn proc(&mut self, name: &str, size: u64, start: u64, per_proc: u64) -> TypeId {
        self.add(
            name,
            TypeKind::Proc {
                size,
                start,
                per_proc,
            },
        )
    }

    pub fn len(&mut self, name: &str, of: &str, size: u64) -> TypeId {
        self.add(
            name,
            TypeKind::Len {
                size,
                of: of.to_string(),
                unit: LenUnit::Count,
            },
        )
    }

    pub fn bytesize(&mut self, name: &str, of: &str, size: u64) -> TypeId {
        self.add(
            name,
            TypeKind::Len {
                size,
                of: of.to_string(),
                unit: LenUnit::Bytes(1),
            },
        )
    }

    pub fn res(&mut self, name: &str, desc: ResourceId) -> TypeId {
        self.add(name, TypeKind::Resource { desc })
    }

    pub fn ptr(&mut self, name: &str, elem: TypeId) -> TypeId {
        self.add(name, TypeKind::Ptr { elem })
    }

    pub fn ptr_opt(&mut self, name: &str, elem: TypeId) -> TypeId {
        self.add_opt(name, TypeKind::Ptr { elem })
    }

    pub fn vma(&mut self, name: &str) -> TypeId {
        self.add(name, TypeKind::Vma)
    }

    pub fn blob(&mut self, name: &str, min: u64, max: u64) -> TypeId {
        self.add(name, TypeKind::Buffer(BufferKind::Blob { min, max }))
    }

    pub fn filename(&mut self, name: &str) -> TypeId {
        self.add(name, TypeKind::Buffer(BufferKind::Filename))
    }

    pub fn text(&mut self, name: &str, values: &[&str]) -> TypeId {
        self.add(
            name,
            TypeKind::Buffer(BufferKind::Text {
                values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            }),
        )
    }

    pub fn array(&mut self, name: &str, elem: TypeId, len: ArrayLen) -> TypeId {
        self.add(name, TypeKind::Array { elem, len })
    }

    pub fn structure(&mut self, name: &str, fields: &[TypeId]) -> TypeId {
        self.add(
            name,
            TypeKind::Struct {
                fields: fields.to_vec(),
            },
        )
    }

    pub fn union(&mut self, name: &str, options: &[TypeId]) -> TypeId {
        self.add(
            name,
            TypeKind::Union {
                options: options.to_vec(),
                weights: None,
            },
        )
    }

    pub fn syscall(&mut self, name: &str, args: &[TypeId], ret: Option<TypeId>) {
        let id = self.syscalls.len();
        self.syscalls.push(Syscall {
            id,
            name: name.to_string(),
            args: args.to_vec(),
            ret,
        });
    }

    /// Registers `name` as the call used to map data pages.
    pub fn mmap(&mut self, name: &str, prot: u64, flags: u64) {
        self.mmap = Some((name.to_string(), prot, flags));
    }

    fn check_lens(&self, owner: &str, fields: &[TypeId]) -> Result<(), TargetError> {
        for &field in fields {
            let t = &self.types[field.0];
            if let TypeKind::Len { of, .. } = &t.kind {
                if !fields.iter().any(|f| self.types[f.0].name == *of) {
                    return Err(TargetError::BadLenRef {
                        owner: owner.to_string(),
                        field: t.name.clone(),
                        of: of.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn build(self) -> Result<Target, TargetError> {
        let mut by_name = HashMap::new();
        for call in &self.syscalls {
            if by_name.insert(call.name.clone(), call.id).is_some() {
                return Err(TargetError::DuplicateSyscall(call.name.clone()));
            }
            self.check_lens(&call.name, &call.args)?;
        }
        for t in &self.types {
            match &t.kind {
                TypeKind::Struct { fields } => self.check_lens(&t.name, fields)?,
                TypeKind::Union { options, .. } if options.is_empty() => {
                    return Err(TargetError::EmptyUnion(t.name.clone()));
                }
                _ => {}
            }
        }
        let mmap = match self.mmap {
            Some((name, prot, flags)) => {
                let syscall = *by_name.get(&name).ok_or(TargetError::MissingMmap(name))?;
                Some(MmapSpec {
                    syscall,
                    prot,
                    flags,
                })
            }
            None => None,
        };

        let mut target = Target {
            os: self.os,
            arch: self.arch,
            page_size: self.page_size,
            data_offset: self.data_offset,
            num_pages: self.num_pages,
            syscalls: self.syscalls.into_iter().map(Arc::new).collect(),
            special_pointers: self.special_pointers,
            mmap,
            types: self.types,
            resources: self.resources,
            by_name,
            resource_ctors: Vec::new(),
        };

        let produced: Vec<HashSet<ResourceId>> = target
            .syscalls
            .iter()
            .map(|c| target.produced_resources(c))
            .collect();
        target.resource_ctors = (0..target.resources.len())
            .map(|r| {
                let want = ResourceId(r);
                produced
                    .iter()
                    .enumerate()
                    .filter(|(_, set)| set.iter().any(|&p| target.is_compatible(want, p)))
                    .map(|(id, _)| id)
                    .collect()
            })
            .collect();
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd_target() -> Target {
        let mut b = TargetBuilder::new("unit", "64");
        let fd = b.resource("fd", &["fd"], &[u64::MAX]);
        let pipe = b.resource("fd_pipe", &["fd", "fd_pipe"], &[u64::MAX]);
        let name = b.filename("file");
        let file = b.ptr("file", name);
        let ret = b.out(|b| b.res("ret", fd));
        b.syscall("open", &[file], Some(ret));
        let pipefd = b.out(|b| {
            let rfd = b.res("rfd", pipe);
            let wfd = b.res("wfd", pipe);
            b.structure("pipefd", &[rfd, wfd])
        });
        let pipe_ptr = b.ptr("pipefd", pipefd);
        b.syscall("pipe", &[pipe_ptr], None);
        let use_fd = b.res("fd", fd);
        b.syscall("close", &[use_fd], None);
        b.build().expect("unit target must build")
    }

    #[test]
    fn subkind_producers_are_compatible_with_general_consumers() {
        let target = fd_target();
        let fd = ResourceId(0);
        let pipe = ResourceId(1);
        assert!(target.is_compatible(fd, pipe));
        assert!(!target.is_compatible(pipe, fd));
        assert!(target.is_compatible(pipe, pipe));
    }

    #[test]
    fn resource_ctors_include_out_struct_producers() {
        let target = fd_target();
        let open = target.syscall("open").unwrap().id;
        let pipe = target.syscall("pipe").unwrap().id;
        assert_eq!(target.resource_ctors(ResourceId(0)), &[open, pipe]);
        assert_eq!(target.resource_ctors(ResourceId(1)), &[pipe]);
    }

    #[test]
    fn build_rejects_dangling_len_reference() {
        let mut b = TargetBuilder::new("unit", "64");
        let buf = b.blob("buf", 0, 8);
        let ptr = b.ptr("buf", buf);
        let len = b.len("len", "missing", 8);
        b.syscall("write", &[ptr, len], None);
        match b.build() {
            Err(TargetError::BadLenRef { owner, of, .. }) => {
                assert_eq!(owner, "write");
                assert_eq!(of, "missing");
            }
            other => panic!("expected BadLenRef, got {:?}", other.map(|t| t.os)),
        }
    }

    #[test]
    fn build_rejects_duplicate_names_and_unknown_mmap() {
        let mut b = TargetBuilder::new("unit", "64");
        b.syscall("getpid", &[], None);
        b.syscall("getpid", &[], None);
        assert!(matches!(b.build(), Err(TargetError::DuplicateSyscall(_))));

        let mut b = TargetBuilder::new("unit", "64");
        b.mmap("mmap", 3, 0x32);
        assert!(matches!(b.build(), Err(TargetError::MissingMmap(_))));
    }

    #[test]
    fn truncate_masks_to_width() {
        assert_eq!(truncate(0x1234, 1), 0x34);
        assert_eq!(truncate(u64::MAX, 4), 0xffff_ffff);
        assert_eq!(truncate(u64::MAX, 8), u64::MAX);
    }
}
