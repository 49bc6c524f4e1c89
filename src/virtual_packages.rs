use std::str::FromStr;

use rattler_conda_types::{GenericVirtualPackage, PackageName, ParseVersionError, Platform, Version};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VirtualPackageError {
    #[error("invalid virtual package `{0}`: expected NAME=VERSION[=BUILD]")]
    Format(String),
    #[error("invalid version in virtual package `{0}`")]
    Version(String, #[source] ParseVersionError),
}

/// Parses a virtual package in the `NAME=VERSION[=BUILD]` form, e.g. `__glibc=2.28=0`
pub fn parse_virtual_package(spec: &str) -> Result<GenericVirtualPackage, VirtualPackageError> {
    let mut split = spec.splitn(3, '=');

    // `splitn` always returns at least one element
    let name = split.next().unwrap_or_default().trim();
    if !name.starts_with("__") || name.len() <= 2 {
        return Err(VirtualPackageError::Format(spec.to_string()));
    }
    let version = split.next().unwrap_or("0");
    let build_string = split.next().unwrap_or("0");

    Ok(GenericVirtualPackage {
        name: PackageName::new_unchecked(name),
        version: Version::from_str(version)
            .map_err(|e| VirtualPackageError::Version(spec.to_string(), e))?,
        build_string: build_string.to_string(),
    })
}

/// The virtual packages a machine of the target `platform` is assumed to provide, with the
/// `overrides` replacing defaults of the same name
pub fn virtual_packages_for(
    platform: Platform,
    overrides: &[GenericVirtualPackage],
) -> Vec<GenericVirtualPackage> {
    if platform == Platform::NoArch {
        return overrides.to_vec();
    }

    let mut defaults = Vec::new();
    if platform.is_unix() {
        defaults.push(("__unix", "0", "0".to_string()));
    }
    if platform.is_linux() {
        defaults.push(("__linux", "0", "0".to_string()));
        defaults.push(("__glibc", "2.17", "0".to_string()));
    }
    if platform.is_osx() {
        let version = if platform == Platform::OsxArm64 {
            "11.0"
        } else {
            "10.15"
        };
        defaults.push(("__osx", version, "0".to_string()));
    }
    if platform.is_windows() {
        defaults.push(("__win", "0", "0".to_string()));
    }
    if let Some(arch) = platform.arch() {
        defaults.push(("__archspec", "1", arch.to_string()));
    }

    let mut packages: Vec<GenericVirtualPackage> = defaults
        .into_iter()
        .filter(|(name, _, _)| overrides.iter().all(|o| o.name.as_normalized() != *name))
        .filter_map(|(name, version, build_string)| {
            Some(GenericVirtualPackage {
                name: PackageName::new_unchecked(name),
                version: Version::from_str(version).ok()?,
                build_string,
            })
        })
        .collect();
    packages.extend(overrides.iter().cloned());
    packages
}
