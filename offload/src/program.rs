//! Program loading: read kernel code from disk, build it for the resolved
//! device and resolve named entry points into kernel handles.

use std::path::{Path, PathBuf};

use offload_types::{Dialect, KernelSpec, LoadMode, ProgramSource, WorkShape};
use tracing::{debug, info};

use crate::backend::{Backend, SlotKind};
use crate::device::AcceleratorContext;
use crate::{Error, Result};

/// Kernel code as read from disk, before building.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    pub dialect: Dialect,
    pub mode: LoadMode,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub build_options: String,
}

impl ProgramImage {
    pub fn read(source: &ProgramSource) -> Result<Self> {
        let bytes = std::fs::read(&source.path).map_err(|e| Error::Io {
            path: source.path.clone(),
            source: e,
        })?;
        debug!(path = %source.path.display(), bytes = bytes.len(), "read program image");
        Ok(Self {
            dialect: source.dialect,
            mode: source.mode,
            path: source.path.clone(),
            bytes,
            build_options: source.build_options.clone(),
        })
    }

    /// Source text; non-UTF-8 source fails to compile.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.bytes).map_err(|e| {
            Error::BuildFailed(format!("{} is not UTF-8 source: {e}", self.path.display()))
        })
    }
}

pub struct Program<B: Backend> {
    raw: B::Program,
    entry_points: Vec<String>,
    dialect: Dialect,
    path: PathBuf,
}

impl<B: Backend> Program<B> {
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw(&self) -> &B::Program {
        &self.raw
    }

    /// Resolve `spec.name` into a kernel handle with the given slot layout.
    pub fn kernel(
        &self,
        backend: &B,
        context: &AcceleratorContext<B>,
        spec: &KernelSpec,
        slots: Vec<SlotKind>,
    ) -> Result<KernelHandle<B>> {
        if !self.entry_points.iter().any(|e| e == &spec.name) {
            return Err(Error::UnresolvedKernel(spec.name.clone()));
        }
        let raw = backend.create_kernel(context.raw(), &self.raw, &spec.name, &slots)?;
        debug!(kernel = %spec.name, slots = slots.len(), "kernel created");
        Ok(KernelHandle {
            name: spec.name.clone(),
            slots,
            work: spec.work.clone(),
            raw,
        })
    }
}

/// A named entry point with its ordered parameter slots.
pub struct KernelHandle<B: Backend> {
    name: String,
    slots: Vec<SlotKind>,
    work: WorkShape,
    pub(crate) raw: B::Kernel,
}

impl<B: Backend> KernelHandle<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> &[SlotKind] {
        &self.slots
    }

    pub fn work(&self) -> &WorkShape {
        &self.work
    }
}

/// First source whose dialect the backend can build.
pub fn select_source<'a, B: Backend>(backend: &B, sources: &'a [ProgramSource]) -> Result<&'a ProgramSource> {
    sources.iter().find(|s| backend.accepts(s.dialect)).ok_or_else(|| {
        let offered: Vec<String> = sources.iter().map(|s| format!("{:?}", s.dialect)).collect();
        Error::InvalidConfig(format!(
            "the {} backend accepts none of the program dialects [{}]",
            backend.name(),
            offered.join(", ")
        ))
    })
}

pub fn load_program<B: Backend>(
    backend: &B,
    context: &AcceleratorContext<B>,
    sources: &[ProgramSource],
) -> Result<Program<B>> {
    let source = select_source(backend, sources)?;
    if source.mode != source.dialect.load_mode() {
        return Err(Error::InvalidConfig(format!(
            "{:?} programs cannot be loaded in {:?} mode",
            source.dialect, source.mode
        )));
    }
    let image = ProgramImage::read(source)?;
    let raw = backend.build_program(context.raw(), &image)?;
    let entry_points = backend.entry_points(&raw);
    info!(
        path = %image.path.display(),
        dialect = ?image.dialect,
        entry_points = ?entry_points,
        "program built"
    );
    Ok(Program {
        raw,
        entry_points,
        dialect: image.dialect,
        path: image.path,
    })
}

// Source scanning shared by backends that cannot ask the driver for kernel
// names.

fn strip_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' && chars.peek() == Some(&'/') {
            for c in chars.by_ref() {
                if c == '\n' {
                    out.push('\n');
                    break;
                }
            }
        } else if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut prev = ' ';
            for c in chars.by_ref() {
                if prev == '*' && c == '/' {
                    break;
                }
                prev = c;
            }
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

fn tokens(src: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut ident = String::new();
    for c in src.chars() {
        if c.is_alphanumeric() || c == '_' {
            ident.push(c);
            continue;
        }
        if !ident.is_empty() {
            out.push(std::mem::take(&mut ident));
        }
        if !c.is_whitespace() {
            out.push(c.to_string());
        }
    }
    if !ident.is_empty() {
        out.push(ident);
    }
    out
}

fn is_ident(tok: &str) -> bool {
    tok.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
}

/// Names of `@compute` functions in WGSL source.
pub fn wgsl_entry_points(src: &str) -> Vec<String> {
    let toks = tokens(&strip_comments(src));
    let mut names = Vec::new();
    let mut pending = false;
    let mut i = 0;
    while i < toks.len() {
        if toks[i] == "@" && toks.get(i + 1).map(String::as_str) == Some("compute") {
            pending = true;
            i += 2;
            continue;
        }
        if pending && toks[i] == "fn" {
            if let Some(name) = toks.get(i + 1).filter(|t| is_ident(t)) {
                names.push(name.clone());
            }
            pending = false;
        }
        i += 1;
    }
    names
}

/// Names of `__kernel` / `kernel` functions in OpenCL C source.
pub fn opencl_entry_points(src: &str) -> Vec<String> {
    let toks = tokens(&strip_comments(src));
    let mut names = Vec::new();
    let mut pending = false;
    let mut i = 0;
    while i < toks.len() {
        let tok = toks[i].as_str();
        if tok == "__kernel" || tok == "kernel" {
            pending = true;
        } else if pending && tok == "__attribute__" {
            // skip the balanced attribute argument list
            let mut depth = 0usize;
            i += 1;
            while i < toks.len() {
                match toks[i].as_str() {
                    "(" => depth += 1,
                    ")" => {
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
        } else if pending && tok == "(" {
            if let Some(name) = i.checked_sub(1).map(|p| &toks[p]).filter(|t| is_ident(t)) {
                names.push(name.clone());
            }
            pending = false;
        }
        i += 1;
    }
    names
}

/// Reject source whose brackets do not pair up.
pub fn check_delimiters(src: &str) -> Result<()> {
    let mut stack = Vec::new();
    for (line_no, line) in strip_comments(src).lines().enumerate() {
        for c in line.chars() {
            match c {
                '(' | '[' | '{' => stack.push((c, line_no + 1)),
                ')' | ']' | '}' => {
                    let want = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == want => {}
                        Some((open, at)) => {
                            return Err(Error::BuildFailed(format!(
                                "line {}: `{c}` closes `{open}` opened on line {at}",
                                line_no + 1
                            )))
                        }
                        None => {
                            return Err(Error::BuildFailed(format!(
                                "line {}: unmatched `{c}`",
                                line_no + 1
                            )))
                        }
                    }
                }
                _ => {}
            }
        }
    }
    match stack.pop() {
        Some((open, at)) => Err(Error::BuildFailed(format!("`{open}` opened on line {at} is never closed"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wgsl_entry_points_skip_helpers_and_comments() {
        let src = r#"
            // @compute fn commented_out() {}
            fn helper(x: f32) -> f32 { return x; }
            @compute @workgroup_size(64)
            fn vector_add(@builtin(global_invocation_id) id: vec3<u32>) {}
            /* @compute fn hidden() {} */
            @compute @workgroup_size(8, 8, 1) fn step() {}
        "#;
        assert_eq!(wgsl_entry_points(src), vec!["vector_add", "step"]);
    }

    #[test]
    fn test_opencl_entry_points_handle_attributes() {
        let src = r#"
            float helper(float x) { return x; }
            __kernel void vector_add(__global const float* a, __global float* c) {}
            kernel __attribute__((reqd_work_group_size(64, 1, 1))) void scaled(global float* x) {}
        "#;
        assert_eq!(opencl_entry_points(src), vec!["vector_add", "scaled"]);
    }

    #[test]
    fn test_check_delimiters() {
        assert!(check_delimiters("fn a() { let x = b[0]; }").is_ok());
        assert!(matches!(check_delimiters("fn a() { "), Err(Error::BuildFailed(_))));
        assert!(matches!(check_delimiters("fn a( ]"), Err(Error::BuildFailed(_))));
        assert!(matches!(check_delimiters("}"), Err(Error::BuildFailed(_))));
        assert!(check_delimiters("fn a() {} // stray }").is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let source = ProgramSource {
            dialect: Dialect::Wgsl,
            mode: LoadMode::Source,
            path: PathBuf::from("/definitely/not/here.wgsl"),
            build_options: String::new(),
        };
        match ProgramImage::read(&source) {
            Err(Error::Io { path, .. }) => assert_eq!(path, source.path),
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
