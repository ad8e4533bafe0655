//! Supported distro targets

use crate::error::{DalecError, DalecResult};
use crate::llb::{CacheSharing, RunOption, State};
use std::fmt;

/// Package format family of a distro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistroFamily {
    Rpm,
    Deb,
}

impl fmt::Display for DistroFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpm => write!(f, "rpm"),
            Self::Deb => write!(f, "deb"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Tdnf,
    Dnf,
    Apt,
}

impl PackageManager {
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Tdnf => "tdnf",
            Self::Dnf => "dnf",
            Self::Apt => "apt-get",
        }
    }

    /// Directory holding the package manager's download cache
    pub fn cache_dir(&self) -> &'static str {
        match self {
            Self::Tdnf => "/var/cache/tdnf",
            Self::Dnf => "/var/cache/dnf",
            Self::Apt => "/var/cache/apt",
        }
    }
}

/// Where a distro expects repository configs and their keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoPlatform {
    pub config_root: &'static str,
    pub key_root: &'static str,
    pub config_ext: &'static str,
}

const RPM_REPO_PLATFORM: RepoPlatform = RepoPlatform {
    config_root: "/etc/yum.repos.d",
    key_root: "/etc/pki/rpm-gpg",
    config_ext: ".repo",
};

const DEB_REPO_PLATFORM: RepoPlatform = RepoPlatform {
    config_root: "/etc/apt/sources.list.d",
    key_root: "/usr/share/keyrings",
    config_ext: ".list",
};

/// A build target distro
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distro {
    /// Target key, also used to namespace caches
    pub key: &'static str,
    pub family: DistroFamily,
    pub package_manager: PackageManager,
    pub worker_image: &'static str,
    /// Identifier embedded in package release strings
    pub version_id: &'static str,
    pub release_ver: &'static str,
}

const fn rpm(
    key: &'static str,
    package_manager: PackageManager,
    worker_image: &'static str,
    version_id: &'static str,
    release_ver: &'static str,
) -> Distro {
    Distro {
        key,
        family: DistroFamily::Rpm,
        package_manager,
        worker_image,
        version_id,
        release_ver,
    }
}

const fn deb(key: &'static str, worker_image: &'static str, version_id: &'static str) -> Distro {
    Distro {
        key,
        family: DistroFamily::Deb,
        package_manager: PackageManager::Apt,
        worker_image,
        version_id,
        release_ver: "",
    }
}

static DISTROS: &[Distro] = &[
    rpm("azlinux3", PackageManager::Tdnf, "mcr.microsoft.com/azurelinux/base/core:3.0", "azl3", "3.0"),
    rpm("mariner2", PackageManager::Tdnf, "mcr.microsoft.com/cbl-mariner/base/core:2.0", "cm2", "2.0"),
    rpm("almalinux8", PackageManager::Dnf, "docker.io/library/almalinux:8", "el8", "8"),
    rpm("almalinux9", PackageManager::Dnf, "docker.io/library/almalinux:9", "el9", "9"),
    rpm("rockylinux8", PackageManager::Dnf, "docker.io/library/rockylinux:8", "el8", "8"),
    rpm("rockylinux9", PackageManager::Dnf, "docker.io/library/rockylinux:9", "el9", "9"),
    deb("bionic", "docker.io/library/ubuntu:bionic", "ubuntu18.04"),
    deb("focal", "docker.io/library/ubuntu:focal", "ubuntu20.04"),
    deb("jammy", "docker.io/library/ubuntu:jammy", "ubuntu22.04"),
    deb("noble", "docker.io/library/ubuntu:noble", "ubuntu24.04"),
    deb("bullseye", "docker.io/library/debian:bullseye", "debian11"),
    deb("bookworm", "docker.io/library/debian:bookworm", "debian12"),
];

/// All supported targets
pub fn all() -> &'static [Distro] {
    DISTROS
}

/// Find a target by key
pub fn lookup(key: &str) -> DalecResult<&'static Distro> {
    DISTROS
        .iter()
        .find(|d| d.key == key)
        .ok_or_else(|| DalecError::UnknownTarget(key.to_string()))
}

impl Distro {
    /// Worker image state, optionally overridden by configuration
    pub fn worker(&self, image_override: Option<&str>) -> State {
        State::image(image_override.unwrap_or(self.worker_image))
    }

    pub fn repo_platform(&self) -> RepoPlatform {
        match self.family {
            DistroFamily::Rpm => RPM_REPO_PLATFORM,
            DistroFamily::Deb => DEB_REPO_PLATFORM,
        }
    }

    /// Locked persistent cache for the package manager's downloads
    pub fn package_cache(&self) -> RunOption {
        RunOption::cache_mount(
            self.package_manager.cache_dir(),
            format!("{}-{}-cache", self.key, self.package_manager.binary()),
            CacheSharing::Locked,
        )
    }

    /// Release-qualified version used for exact dependency pins
    pub fn format_dep_equal(&self, version: &str, revision: &str) -> String {
        match self.family {
            DistroFamily::Deb => format!("{}-{}u{}", version, self.version_id, revision),
            DistroFamily::Rpm => format!("{}-{}.{}", version, revision, self.version_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_and_unknown() {
        assert_eq!(lookup("jammy").unwrap().family, DistroFamily::Deb);
        assert_eq!(lookup("azlinux3").unwrap().package_manager, PackageManager::Tdnf);
        assert!(matches!(lookup("windows"), Err(DalecError::UnknownTarget(_))));
    }

    #[test]
    fn keys_are_unique() {
        let mut keys: Vec<_> = all().iter().map(|d| d.key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), all().len());
    }

    #[test]
    fn dep_equal_formats() {
        let jammy = lookup("jammy").unwrap();
        assert_eq!(jammy.format_dep_equal("1.2.3", "1"), "1.2.3-ubuntu22.04u1");
        let azl = lookup("azlinux3").unwrap();
        assert_eq!(azl.format_dep_equal("1.2.3", "1"), "1.2.3-1.azl3");
    }

    #[test]
    fn repo_platform_per_family() {
        assert_eq!(lookup("noble").unwrap().repo_platform().config_ext, ".list");
        assert_eq!(
            lookup("almalinux9").unwrap().repo_platform().config_root,
            "/etc/yum.repos.d"
        );
    }
}
