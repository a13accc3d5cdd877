//! Build-script helpers shared by the applications.
//!
//! An application keeps its kernel descriptor as JSON next to its kernels.
//! `compile_descriptor` checks the JSON against the descriptor schema, makes
//! every program path absolute and writes a bincode image into `OUT_DIR`
//! for the binary to embed with `include_bytes!`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use offload_types::KernelDescriptor;

/// Parse `json`, resolving relative program paths against `base`.
pub fn parse_descriptor(json: &str, base: &Path) -> Result<KernelDescriptor, serde_json::Error> {
    let mut descriptor: KernelDescriptor = serde_json::from_str(json)?;
    for source in &mut descriptor.program {
        if source.path.is_relative() {
            source.path = base.join(&source.path);
        }
    }
    Ok(descriptor)
}

/// Compile `descriptor_path` (relative to the crate root) into
/// `$OUT_DIR/<output_name>.bin`. Panics on any failure, which fails the build.
pub fn compile_descriptor(descriptor_path: &str, output_name: &str) -> PathBuf {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    println!("cargo:rerun-if-changed={}", descriptor_path);

    let json_path = manifest_dir.join(descriptor_path);
    let json_str = fs::read_to_string(&json_path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", json_path.display(), e));

    let base = json_path.parent().unwrap_or(&manifest_dir).to_path_buf();
    let descriptor = parse_descriptor(&json_str, &base).unwrap_or_else(|e| {
        panic!(
            "BUILD FAILED: {} does not match the KernelDescriptor structure: {}",
            descriptor_path, e
        )
    });

    for source in &descriptor.program {
        println!("cargo:rerun-if-changed={}", source.path.display());
        if !source.path.exists() {
            println!(
                "cargo:warning=kernel file {} does not exist",
                source.path.display()
            );
        }
    }

    fs::write(out_dir.join(format!("{}.json", output_name)), &json_str)
        .expect("Failed to write debug JSON");

    let binary = bincode::serialize(&descriptor).expect("Failed to serialize descriptor to bincode");
    let bin_path = out_dir.join(format!("{}.bin", output_name));
    fs::write(&bin_path, binary).expect("Failed to write binary descriptor");
    bin_path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_against_base() {
        let json = r#"{
            "name": "t",
            "program": [
                { "dialect": "wgsl", "mode": "source", "path": "kernels/t.wgsl" },
                { "dialect": "open_cl_c", "mode": "source", "path": "/abs/t.cl" }
            ],
            "kernels": [],
            "buffers": []
        }"#;
        let desc = parse_descriptor(json, Path::new("/crate")).unwrap();
        assert_eq!(desc.program[0].path, Path::new("/crate/kernels/t.wgsl"));
        assert_eq!(desc.program[1].path, Path::new("/abs/t.cl"));
    }

    #[test]
    fn test_schema_mismatch_is_an_error() {
        let json = r#"{ "name": "t", "program": "not a list", "kernels": [], "buffers": [] }"#;
        assert!(parse_descriptor(json, Path::new("/")).is_err());
    }
}
