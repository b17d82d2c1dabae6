//! ELF detection and `readelf`-based dependency helpers.
//!
//! `readelf -d` reads the dynamic section without executing anything, so it
//! works on a tree built for another machine where `ldd` would not.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// First four bytes of every ELF object.
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Library directories searched inside a root, most specific first.
pub const LIBRARY_DIRS: &[&str] = &["usr/lib64", "usr/lib", "lib64", "lib"];

/// True if the file content starts with the ELF signature.
///
/// Unreadable or short files are not ELF.
pub fn is_elf(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => magic == ELF_MAGIC,
        Err(_) => false,
    }
}

/// Extract NEEDED entries from an ELF file with `readelf -d`.
///
/// Files readelf rejects have no dependencies.
pub fn readelf_needed(path: &Path) -> Result<Vec<String>> {
    let result = Cmd::new("readelf")
        .arg("-d")
        .arg_path(path)
        .allow_fail()
        .run()
        .context("Failed to run readelf - is binutils installed?")?;

    if !result.success() {
        return Ok(Vec::new());
    }

    Ok(parse_readelf_output(&result.stdout))
}

/// Parse readelf -d output to extract NEEDED library names.
///
/// Example readelf output:
/// ```text
/// Dynamic section at offset 0x2d0e0 contains 28 entries:
///   Tag        Type                         Name/Value
///  0x0000000000000001 (NEEDED)             Shared library: [libtinfo.so.6]
///  0x0000000000000001 (NEEDED)             Shared library: [libc.so.6]
/// ```
pub fn parse_readelf_output(output: &str) -> Vec<String> {
    let mut libs = Vec::new();

    for line in output.lines() {
        if line.contains("(NEEDED)") && line.contains("Shared library:") {
            if let (Some(start), Some(end)) = (line.find('['), line.rfind(']')) {
                if start < end {
                    libs.push(line[start + 1..end].to_string());
                }
            }
        }
    }

    libs
}

/// Find a library by file name in the standard directories of a root.
///
/// Returns the in-root path (e.g. `/root/usr/lib/libc.so.6`) even when the
/// entry is a symlink; callers resolve it themselves.
pub fn find_library(root: &Path, lib_name: &str) -> Option<PathBuf> {
    LIBRARY_DIRS
        .iter()
        .map(|dir| root.join(dir).join(lib_name))
        .find(|p| p.exists() || p.is_symlink())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_readelf_output() {
        let output = r#"
Dynamic section at offset 0x2d0e0 contains 28 entries:
  Tag        Type                         Name/Value
 0x0000000000000001 (NEEDED)             Shared library: [libtinfo.so.6]
 0x0000000000000001 (NEEDED)             Shared library: [libc.so.6]
 0x000000000000000c (INIT)               0x5000
"#;
        let libs = parse_readelf_output(output);
        assert_eq!(libs, vec!["libtinfo.so.6", "libc.so.6"]);
    }

    #[test]
    fn test_parse_readelf_empty() {
        assert!(parse_readelf_output("not an ELF file").is_empty());
    }

    #[test]
    fn test_is_elf() {
        let temp = TempDir::new().unwrap();
        let elf = temp.path().join("prog");
        let script = temp.path().join("script");
        let tiny = temp.path().join("tiny");
        std::fs::write(&elf, b"\x7fELF\x02\x01\x01\0rest").unwrap();
        std::fs::write(&script, b"#!/bin/sh\necho hi\n").unwrap();
        std::fs::write(&tiny, b"\x7fE").unwrap();

        assert!(is_elf(&elf));
        assert!(!is_elf(&script));
        assert!(!is_elf(&tiny));
        assert!(!is_elf(&temp.path().join("missing")));
    }

    #[test]
    fn test_find_library_prefers_usr() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("usr/lib")).unwrap();
        std::fs::create_dir_all(root.join("lib")).unwrap();
        std::fs::write(root.join("usr/lib/libz.so.1"), "a").unwrap();
        std::fs::write(root.join("lib/libz.so.1"), "b").unwrap();

        assert_eq!(
            find_library(root, "libz.so.1"),
            Some(root.join("usr/lib/libz.so.1"))
        );
        assert!(find_library(root, "libmissing.so").is_none());
    }
}
