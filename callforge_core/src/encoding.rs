//! Textual program format.
//!
//! One call per line, e.g.
//! `r0 = open(&(0x7f0000000000)="2e2f66696c653000", 0x0, 0x0)`.
//! Result bindings are printed only when referenced and are renumbered in
//! text order, so `serialize(deserialize(s))` is a canonical form of `s`.

use crate::prog::{
    Arg, Call, ConstArg, DataArg, GroupArg, PointerArg, Prog, ResultArg, ResultId, UnionArg,
    ValidationError,
};
use crate::target::{Dir, Target, TypeId, TypeKind};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("line {line}, column {col}: {msg}")]
    Syntax { line: usize, col: usize, msg: String },

    #[error("line {line}: unknown syscall `{name}`")]
    UnknownCall { line: usize, name: String },

    #[error("line {line}: {name} takes {expected} args, found {found}")]
    ArgCount {
        line: usize,
        name: String,
        expected: usize,
        found: usize,
    },

    /// The text does not fit the argument type at that position.
    #[error("line {line}: {msg}")]
    TypeMismatch { line: usize, msg: String },

    /// A reference to a result that is not bound by an earlier call.
    #[error("line {line}: undefined result `{name}`")]
    UndefinedResult { line: usize, name: String },

    #[error("line {line}: address {addr:#x} is outside the data area")]
    BadAddress { line: usize, addr: u64 },

    #[error("decoded program is invalid: {0}")]
    Invalid(#[from] ValidationError),
}

fn is_printable_text(data: &[u8]) -> bool {
    data.iter()
        .all(|&b| (0x20..0x7f).contains(&b) && b != b'\'' && b != b'\\')
}

struct Printer<'a> {
    target: &'a Target,
    used: HashSet<ResultId>,
    names: HashMap<ResultId, usize>,
    out: String,
}

impl Printer<'_> {
    fn bind(&mut self, id: ResultId) -> usize {
        let n = self.names.len();
        *self.names.entry(id).or_insert(n)
    }

    fn call(&mut self, call: &Call) {
        if let Some(ret) = &call.ret {
            if self.used.contains(&ret.id) {
                let n = self.bind(ret.id);
                let _ = write!(self.out, "r{} = ", n);
            }
        }
        self.out.push_str(&call.meta.name);
        self.out.push('(');
        for (i, arg) in call.args.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.arg(arg);
        }
        self.out.push_str(")\n");
    }

    fn arg(&mut self, arg: &Arg) {
        let target = self.target;
        match arg {
            Arg::Const(c) => {
                let _ = write!(self.out, "{:#x}", c.val);
            }
            Arg::Result(r) => self.result(r),
            Arg::Data(d) => {
                if target.ty(d.ty).is_readable() && is_printable_text(&d.data) {
                    self.out.push('\'');
                    self.out.extend(d.data.iter().map(|&b| b as char));
                    self.out.push('\'');
                } else {
                    self.out.push('"');
                    for b in &d.data {
                        let _ = write!(self.out, "{:02x}", b);
                    }
                    self.out.push('"');
                }
            }
            Arg::Pointer(p) => {
                if p.special {
                    let _ = write!(self.out, "{:#x}", p.addr);
                } else if p.vma_size > 0 {
                    let _ = write!(
                        self.out,
                        "&({:#x}/{:#x})=nil",
                        target.data_offset + p.addr,
                        p.vma_size
                    );
                } else {
                    let _ = write!(self.out, "&({:#x})", target.data_offset + p.addr);
                    if let Some(res) = &p.res {
                        self.out.push('=');
                        self.arg(res);
                    }
                }
            }
            Arg::Group(g) => {
                let (open, close) = match target.ty(g.ty).kind {
                    TypeKind::Struct { .. } => ('{', '}'),
                    _ => ('[', ']'),
                };
                self.out.push(open);
                for (i, inner) in g.inner.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.arg(inner);
                }
                self.out.push(close);
            }
            Arg::Union(u) => {
                let name = match &target.ty(u.ty).kind {
                    TypeKind::Union { options, .. } => options
                        .get(u.index)
                        .map(|&o| target.ty(o).name.as_str())
                        .unwrap_or("?"),
                    _ => "?",
                };
                let _ = write!(self.out, "@{}=", name);
                self.arg(&u.option);
            }
        }
    }

    fn result(&mut self, r: &ResultArg) {
        if self.target.is_producer(r.ty) {
            if self.used.contains(&r.id) {
                let n = self.bind(r.id);
                let _ = write!(self.out, "<r{}=>", n);
            }
            let _ = write!(self.out, "{:#x}", r.val);
            return;
        }
        match r.source.and_then(|src| self.names.get(&src).copied()) {
            Some(n) => {
                let _ = write!(self.out, "r{}", n);
            }
            None => {
                let _ = write!(self.out, "{:#x}", r.val);
            }
        }
    }
}

impl Prog {
    /// Renders the program in the textual format, one call per line.
    pub fn serialize(&self) -> String {
        let mut printer = Printer {
            target: &self.target,
            used: self.used_results(),
            names: HashMap::new(),
            out: String::new(),
        };
        for call in &self.calls {
            printer.call(call);
        }
        printer.out
    }

    pub fn deserialize(target: &Arc<Target>, text: &str) -> Result<Prog, DecodeError> {
        deserialize(target, text)
    }
}

struct Parser<'s> {
    s: &'s [u8],
    pos: usize,
    line: usize,
}

impl<'s> Parser<'s> {
    fn new(s: &'s str, line: usize) -> Self {
        Self {
            s: s.as_bytes(),
            pos: 0,
            line,
        }
    }

    fn syntax(&self, msg: impl Into<String>) -> DecodeError {
        DecodeError::Syntax {
            line: self.line,
            col: self.pos + 1,
            msg: msg.into(),
        }
    }

    fn ws(&mut self) {
        while self.pos < self.s.len() && matches!(self.s[self.pos], b' ' | b'\t') {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.ws();
        self.s.get(self.pos).copied()
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: u8) -> Result<(), DecodeError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected `{}`", c as char)))
        }
    }

    fn expect_str(&mut self, lit: &str) -> Result<(), DecodeError> {
        self.ws();
        if self.s[self.pos..].starts_with(lit.as_bytes()) {
            self.pos += lit.len();
            Ok(())
        } else {
            Err(self.syntax(format!("expected `{}`", lit)))
        }
    }

    fn ident(&mut self) -> Result<&'s str, DecodeError> {
        self.ws();
        let start = self.pos;
        while self.pos < self.s.len()
            && (self.s[self.pos].is_ascii_alphanumeric() || matches!(self.s[self.pos], b'_' | b'$'))
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.syntax("expected identifier"));
        }
        std::str::from_utf8(&self.s[start..self.pos]).map_err(|_| self.syntax("bad identifier"))
    }

    fn number(&mut self) -> Result<u64, DecodeError> {
        self.ws();
        let (radix, start) = if self.s[self.pos..].starts_with(b"0x") {
            (16, self.pos + 2)
        } else {
            (10, self.pos)
        };
        let mut end = start;
        while end < self.s.len() && self.s[end].is_ascii_hexdigit() {
            end += 1;
        }
        let digits = std::str::from_utf8(&self.s[start..end]).unwrap_or("");
        let val = u64::from_str_radix(digits, radix).map_err(|_| self.syntax("expected number"))?;
        self.pos = end;
        Ok(val)
    }

    fn data(&mut self) -> Result<Vec<u8>, DecodeError> {
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Err(self.syntax("expected buffer")),
        };
        self.pos += 1;
        let start = self.pos;
        let len = self.s[start..]
            .iter()
            .position(|&c| c == quote)
            .ok_or_else(|| self.syntax("unterminated buffer"))?;
        let body = &self.s[start..start + len];
        self.pos = start + len + 1;
        if quote == b'\'' {
            return Ok(body.to_vec());
        }
        if body.len() % 2 != 0 {
            return Err(self.syntax("odd number of hex digits"));
        }
        body.chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| self.syntax("bad hex byte"))
            })
            .collect()
    }

    /// Counts the top-level arguments up to the closing paren of the call.
    fn count_args(&self) -> Option<usize> {
        let mut depth = 0usize;
        let mut quote: Option<u8> = None;
        let mut count = 0;
        let mut seen = false;
        for &c in &self.s[self.pos..] {
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                b'"' | b'\'' => {
                    quote = Some(c);
                    seen = true;
                }
                b'(' | b'[' | b'{' => {
                    depth += 1;
                    seen = true;
                }
                b')' | b']' | b'}' => {
                    if depth == 0 {
                        return (c == b')').then_some(if seen { count + 1 } else { 0 });
                    }
                    depth -= 1;
                }
                b',' if depth == 0 => count += 1,
                b' ' | b'\t' => {}
                _ => seen = true,
            }
        }
        None
    }
}

struct Decoder<'t> {
    target: &'t Target,
    names: HashMap<String, ResultId>,
    pending: Vec<(String, ResultId)>,
    next_result: u64,
}

impl Decoder<'_> {
    fn alloc_id(&mut self) -> ResultId {
        let id = ResultId(self.next_result);
        self.next_result += 1;
        id
    }

    fn call(&mut self, p: &mut Parser<'_>) -> Result<Call, DecodeError> {
        let line = p.line;
        let mut binding = None;
        let first = p.ident()?;
        let name = if p.peek() == Some(b'=') {
            p.pos += 1;
            binding = Some(first.to_string());
            p.ident()?
        } else {
            first
        };
        let meta = self
            .target
            .syscall(name)
            .cloned()
            .ok_or_else(|| DecodeError::UnknownCall {
                line,
                name: name.to_string(),
            })?;
        p.expect(b'(')?;
        let found = p.count_args().ok_or_else(|| p.syntax("unbalanced argument list"))?;
        if found != meta.args.len() {
            return Err(DecodeError::ArgCount {
                line,
                name: meta.name.clone(),
                expected: meta.args.len(),
                found,
            });
        }
        self.pending.clear();
        let mut args = Vec::with_capacity(meta.args.len());
        for (i, &ty) in meta.args.iter().enumerate() {
            if i > 0 {
                p.expect(b',')?;
            }
            args.push(self.arg(p, ty)?);
        }
        p.expect(b')')?;
        if p.peek().is_some() {
            return Err(p.syntax("trailing characters after call"));
        }

        let ret = match meta.ret {
            Some(ty) => Some(ResultArg {
                ty,
                id: self.alloc_id(),
                source: None,
                val: 0,
            }),
            None => None,
        };
        if let Some(binding) = binding {
            let Some(ret) = &ret else {
                return Err(DecodeError::TypeMismatch {
                    line,
                    msg: format!("{} has no return value to bind to {}", meta.name, binding),
                });
            };
            self.names.insert(binding, ret.id);
        }
        for (name, id) in self.pending.drain(..) {
            self.names.insert(name, id);
        }
        Ok(Call { meta, args, ret })
    }

    fn mismatch(&self, p: &Parser<'_>, ty: TypeId, what: &str) -> DecodeError {
        DecodeError::TypeMismatch {
            line: p.line,
            msg: format!("`{}` cannot be {}", self.target.ty(ty).name, what),
        }
    }

    fn address(&self, p: &mut Parser<'_>) -> Result<u64, DecodeError> {
        let addr = p.number()?;
        let target = self.target;
        if addr < target.data_offset || addr >= target.data_offset + target.max_address() {
            return Err(DecodeError::BadAddress { line: p.line, addr });
        }
        Ok(addr - target.data_offset)
    }

    fn arg(&mut self, p: &mut Parser<'_>, ty: TypeId) -> Result<Arg, DecodeError> {
        let target = self.target;
        let t = target.ty(ty);
        match &t.kind {
            TypeKind::Const { .. }
            | TypeKind::Int { .. }
            | TypeKind::Flags { .. }
            | TypeKind::Proc { .. }
            | TypeKind::Len { .. } => Ok(Arg::Const(ConstArg {
                ty,
                val: p.number()?,
            })),
            TypeKind::Resource { desc } => {
                let id = self.alloc_id();
                match p.peek() {
                    Some(b'<') => {
                        if t.dir != Dir::Out {
                            return Err(self.mismatch(p, ty, "bound to a result"));
                        }
                        p.pos += 1;
                        let name = p.ident()?.to_string();
                        p.expect_str("=>")?;
                        let val = p.number()?;
                        self.pending.push((name, id));
                        Ok(Arg::Result(ResultArg {
                            ty,
                            id,
                            source: None,
                            val,
                        }))
                    }
                    Some(b'r') => {
                        if t.dir == Dir::Out {
                            return Err(self.mismatch(p, ty, "a reference to another result"));
                        }
                        let name = p.ident()?;
                        let src = *self.names.get(name).ok_or_else(|| {
                            DecodeError::UndefinedResult {
                                line: p.line,
                                name: name.to_string(),
                            }
                        })?;
                        Ok(Arg::Result(ResultArg {
                            ty,
                            id,
                            source: Some(src),
                            val: target.resource(*desc).default_value(),
                        }))
                    }
                    _ => Ok(Arg::Result(ResultArg {
                        ty,
                        id,
                        source: None,
                        val: p.number()?,
                    })),
                }
            }
            TypeKind::Ptr { elem } => {
                if !p.eat(b'&') {
                    return Ok(Arg::Pointer(PointerArg {
                        ty,
                        addr: p.number()?,
                        vma_size: 0,
                        res: None,
                        special: true,
                    }));
                }
                p.expect(b'(')?;
                let addr = self.address(p)?;
                if p.peek() == Some(b'/') {
                    return Err(self.mismatch(p, ty, "a vma range"));
                }
                p.expect(b')')?;
                let res = if p.eat(b'=') {
                    Some(Box::new(self.arg(p, *elem)?))
                } else {
                    None
                };
                Ok(Arg::Pointer(PointerArg {
                    ty,
                    addr,
                    vma_size: 0,
                    res,
                    special: false,
                }))
            }
            TypeKind::Vma => {
                if !p.eat(b'&') {
                    return Ok(Arg::Pointer(PointerArg {
                        ty,
                        addr: p.number()?,
                        vma_size: 0,
                        res: None,
                        special: true,
                    }));
                }
                p.expect(b'(')?;
                let addr = self.address(p)?;
                p.expect(b'/')?;
                let vma_size = p.number()?;
                if vma_size == 0 {
                    return Err(self.mismatch(p, ty, "an empty vma"));
                }
                if vma_size % target.page_size != 0 {
                    return Err(self.mismatch(p, ty, "a vma that is not whole pages"));
                }
                if addr
                    .checked_add(vma_size)
                    .is_none_or(|end| end > target.max_address())
                {
                    return Err(DecodeError::BadAddress {
                        line: p.line,
                        addr: addr.wrapping_add(target.data_offset),
                    });
                }
                p.expect(b')')?;
                p.expect_str("=nil")?;
                Ok(Arg::Pointer(PointerArg {
                    ty,
                    addr,
                    vma_size,
                    res: None,
                    special: false,
                }))
            }
            TypeKind::Buffer(_) => Ok(Arg::Data(DataArg { ty, data: p.data()? })),
            TypeKind::Array { elem, .. } => {
                p.expect(b'[')?;
                let mut inner = Vec::new();
                if !p.eat(b']') {
                    loop {
                        inner.push(self.arg(p, *elem)?);
                        if p.eat(b']') {
                            break;
                        }
                        p.expect(b',')?;
                    }
                }
                Ok(Arg::Group(GroupArg { ty, inner }))
            }
            TypeKind::Struct { fields } => {
                let line = p.line;
                let field_count = || DecodeError::TypeMismatch {
                    line,
                    msg: format!("struct `{}` has {} fields", t.name, fields.len()),
                };
                p.expect(b'{')?;
                let mut inner = Vec::with_capacity(fields.len());
                for (i, &field) in fields.iter().enumerate() {
                    if i > 0 {
                        if p.peek() == Some(b'}') {
                            return Err(field_count());
                        }
                        p.expect(b',')?;
                    }
                    inner.push(self.arg(p, field)?);
                }
                if !p.eat(b'}') {
                    return Err(field_count());
                }
                Ok(Arg::Group(GroupArg { ty, inner }))
            }
            TypeKind::Union { options, .. } => {
                p.expect(b'@')?;
                let name = p.ident()?;
                let Some(index) = options.iter().position(|&o| target.ty(o).name == name) else {
                    return Err(DecodeError::TypeMismatch {
                        line: p.line,
                        msg: format!("union `{}` has no option `{}`", t.name, name),
                    });
                };
                p.expect(b'=')?;
                let option = self.arg(p, options[index])?;
                Ok(Arg::Union(UnionArg {
                    ty,
                    index,
                    option: Box::new(option),
                }))
            }
        }
    }
}

/// Parses a program for `target`. Blank lines and `#` comments are skipped.
pub fn deserialize(target: &Arc<Target>, text: &str) -> Result<Prog, DecodeError> {
    let mut decoder = Decoder {
        target,
        names: HashMap::new(),
        pending: Vec::new(),
        next_result: 0,
    };
    let mut calls = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parser = Parser::new(line, idx + 1);
        calls.push(decoder.call(&mut parser)?);
    }
    let mut prog = Prog::new(Arc::clone(target));
    prog.calls = calls;
    prog.next_result = decoder.next_result;
    prog.validate()?;
    Ok(prog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::generate;
    use crate::targets::{get_target, supported_targets};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn roundtrip(os: &str, arch: &str, text: &str) -> String {
        let target = get_target(os, arch).unwrap();
        deserialize(&target, text)
            .unwrap_or_else(|e| panic!("failed to decode:\n{}\nerror: {}", text, e))
            .serialize()
    }

    #[test]
    fn canonical_programs_are_reproduced_exactly() {
        let linux = [
            "mmap(&(0x7f0000000000/0x1000)=nil, 0x1000, 0x3, 0x32, 0xffffffffffffffff, 0x0)\n",
            "pipe2(&(0x7f0000000000)={<r0=>0x0, 0x0}, 0x0)\nwrite(r0, &(0x7f0000001000)=\"1155\", 0x2)\n",
            "r0 = open(&(0x7f0000000000)=\"2e2f66696c653000\", 0x0, 0x0)\nclose(r0)\n",
            "r0 = socket(0x2, 0x1, 0x0)\nsetsockopt(r0, 0x1, 0xd, &(0x7f0000000000)=@linger={0x1, 0x5}, 0x8)\n",
            "setsockopt(0xffffffffffffffff, 0x0, 0x2, &(0x7f0000000000)=@raw=\"\", 0x0)\n",
            "writev(0xffffffffffffffff, &(0x7f0000000000)=[{&(0x7f0000001000)=\"aa\", 0x1}, {0x0, 0x0}], 0x2)\n",
            "read(0xffffffffffffffff, &(0x7f0000000000), 0x0)\n",
        ];
        for text in linux {
            assert_eq!(roundtrip("linux", "amd64", text), text);
        }
        let test = [
            "mutate7(&(0x7f0000000000)='123', 0x3)\n",
            "mutate8(0xffffffffffffffff)\n",
            "mutate3(&(0x7f0000000000)=[], 0x0)\n",
        ];
        for text in test {
            assert_eq!(roundtrip("test", "64", text), text);
        }
    }

    #[test]
    fn bindings_are_renumbered_and_unused_ones_dropped() {
        let text = "r7=open(&(0x7f0000000000)=\"2e2f66696c653000\", 0x0, 0x0)\n\
                    r3 = dup(0xffffffffffffffff)\n\
                    write(r7, &(0x7f0000001000)=\"00\", 0x1)\n";
        assert_eq!(
            roundtrip("linux", "amd64", text),
            "r0 = open(&(0x7f0000000000)=\"2e2f66696c653000\", 0x0, 0x0)\n\
             dup(0xffffffffffffffff)\n\
             write(r0, &(0x7f0000001000)=\"00\", 0x1)\n"
        );
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "# a crash reproducer\n\n  sched_yield()  \n\n# trailing\ngetpid()\n";
        assert_eq!(roundtrip("linux", "amd64", text), "sched_yield()\ngetpid()\n");
    }

    #[test]
    fn readable_buffers_fall_back_to_hex() {
        assert_eq!(
            roundtrip("test", "64", "mutate7(&(0x7f0000000000)=\"27ff\", 0x2)\n"),
            "mutate7(&(0x7f0000000000)=\"27ff\", 0x2)\n"
        );
        assert_eq!(
            roundtrip("test", "64", "mutate7(&(0x7f0000000000)=\"616263\", 0x3)\n"),
            "mutate7(&(0x7f0000000000)='abc', 0x3)\n"
        );
    }

    #[test]
    fn decode_errors_are_descriptive() {
        let target = get_target("linux", "amd64").unwrap();
        let cases: Vec<(&str, fn(&DecodeError) -> bool)> = vec![
            ("frobnicate()\n", |e| {
                matches!(e, DecodeError::UnknownCall { line: 1, name } if name == "frobnicate")
            }),
            ("sched_yield()\nclose(0x1, 0x2)\n", |e| {
                matches!(
                    e,
                    DecodeError::ArgCount {
                        line: 2,
                        expected: 1,
                        found: 2,
                        ..
                    }
                )
            }),
            ("close(r0)\n", |e| {
                matches!(e, DecodeError::UndefinedResult { line: 1, .. })
            }),
            ("close(r0)\nr0 = dup(0x0)\n", |e| {
                matches!(e, DecodeError::UndefinedResult { line: 1, .. })
            }),
            ("r0 = dup(r0)\n", |e| {
                matches!(e, DecodeError::UndefinedResult { line: 1, .. })
            }),
            ("r0 = sched_yield()\n", |e| {
                matches!(e, DecodeError::TypeMismatch { line: 1, .. })
            }),
            ("close(<r0=>0x0)\n", |e| {
                matches!(e, DecodeError::TypeMismatch { line: 1, .. })
            }),
            ("write(0x0, &(0x1000)=\"00\", 0x1)\n", |e| {
                matches!(e, DecodeError::BadAddress { line: 1, addr: 0x1000 })
            }),
            ("munmap(&(0x7f0000000000/0x0)=nil, 0x0)\n", |e| {
                matches!(e, DecodeError::TypeMismatch { line: 1, .. })
            }),
            ("munmap(&(0x7f0000000000/0x800)=nil, 0x800)\n", |e| {
                matches!(e, DecodeError::TypeMismatch { line: 1, .. })
            }),
            ("mmap(&(0x7f0000001000/0xfffffffffffff000)=nil, 0xfffffffffffff000, 0x0, 0x0, 0x0, 0x0)\n", |e| {
                matches!(e, DecodeError::BadAddress { line: 1, addr: 0x7f0000001000 })
            }),
            ("munmap(&(0x7f0000fff000/0x2000)=nil, 0x2000)\n", |e| {
                matches!(e, DecodeError::BadAddress { line: 1, .. })
            }),
            ("\n\nwrite(0x0, &(0x7f0000000000)=\"0\", 0x1)\n", |e| {
                matches!(e, DecodeError::Syntax { line: 3, .. })
            }),
            ("getpid(\n", |e| matches!(e, DecodeError::Syntax { line: 1, .. })),
            ("setsockopt(0x0, 0x0, 0x0, &(0x7f0000000000)=@bogus=0x1, 0x4)\n", |e| {
                matches!(e, DecodeError::TypeMismatch { line: 1, .. })
            }),
            ("pipe2(&(0x7f0000000000)={0x0}, 0x0)\n", |e| {
                matches!(e, DecodeError::TypeMismatch { line: 1, .. })
            }),
        ];
        for (text, check) in cases {
            match deserialize(&target, text) {
                Ok(prog) => panic!("expected failure for {:?}, got {}", text, prog.serialize()),
                Err(e) => assert!(check(&e), "unexpected error for {:?}: {:?}", text, e),
            }
        }
    }

    #[test]
    fn changed_constants_fail_validation() {
        let target = get_target("test", "64").unwrap();
        assert!(matches!(
            deserialize(&target, "mutate3(&(0x7f0000000000)=[0x2], 0x1)\n"),
            Err(DecodeError::Invalid(ValidationError::BadArg { .. }))
        ));
    }

    #[test]
    fn array_counts_respect_declared_ranges() {
        let target = get_target("linux", "amd64").unwrap();
        let iovecs = |n: usize| {
            let elems = vec!["{0x0, 0x0}"; n].join(", ");
            format!("writev(0xffffffffffffffff, &(0x7f0000000000)=[{}], {:#x})\n", elems, n)
        };
        assert_eq!(roundtrip("linux", "amd64", &iovecs(8)), iovecs(8));
        assert!(matches!(
            deserialize(&target, &iovecs(9)),
            Err(DecodeError::Invalid(ValidationError::BadArg { .. }))
        ));
        assert!(matches!(
            deserialize(&target, &iovecs(20)),
            Err(DecodeError::Invalid(ValidationError::BadArg { .. }))
        ));

        let test = get_target("test", "64").unwrap();
        let many = vec!["0x1"; 40].join(", ");
        deserialize(&test, &format!("mutate3(&(0x7f0000000000)=[{}], 0x28)\n", many)).unwrap();
    }

    #[test]
    fn generated_programs_survive_serialization() {
        for (os, arch) in supported_targets() {
            let target = get_target(os, arch).unwrap();
            for seed in 0..100u64 {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let prog = generate(&target, &mut rng, 10, None);
                let text = prog.serialize();
                let decoded = deserialize(&target, &text)
                    .unwrap_or_else(|e| panic!("seed {}: {}\n{}", seed, e, text));
                assert_eq!(decoded.serialize(), text, "seed {}", seed);
                assert_eq!(prog.clone().serialize(), text, "clone must serialize identically");
            }
        }
    }
}
