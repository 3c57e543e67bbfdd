//! Built-in syscall descriptors.

use crate::target::{Target, TargetError};
use std::sync::Arc;

mod linux;

/// OS/architecture pairs that [`get_target`] knows about.
pub fn supported_targets() -> &'static [(&'static str, &'static str)] {
    &[("linux", "amd64"), ("test", "64")]
}

/// Builds the descriptor for `os`/`arch`.
pub fn get_target(os: &str, arch: &str) -> Result<Arc<Target>, TargetError> {
    let target = match (os, arch) {
        ("linux", "amd64") => linux::build()?,
        ("test", "64") => test::build()?,
        _ => {
            return Err(TargetError::Unsupported {
                os: os.to_string(),
                arch: arch.to_string(),
            });
        }
    };
    log::debug!(
        "built target {}/{} with {} syscalls",
        target.os,
        target.arch,
        target.syscalls.len()
    );
    Ok(Arc::new(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_target_builds() {
        for (os, arch) in supported_targets() {
            let target = get_target(os, arch)
                .unwrap_or_else(|e| panic!("target {}/{} failed to build: {}", os, arch, e));
            assert!(!target.syscalls.is_empty());
            assert!(target.mmap.is_some(), "{}/{} must know how to map pages", os, arch);
        }
    }

    #[test]
    fn unknown_target_is_rejected() {
        match get_target("plan9", "mips") {
            Err(TargetError::Unsupported { os, arch }) => {
                assert_eq!((os.as_str(), arch.as_str()), ("plan9", "mips"));
            }
            other => panic!("expected Unsupported, got {:?}", other.map(|t| t.os.clone())),
        }
    }
}
