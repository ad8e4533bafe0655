//! Distro targets, package constraints and repositories
//!
//! - `distro`: the supported targets and their package tooling
//! - `version` / `constraint`: version ordering and native constraint syntax
//! - `install`: package installation with extra repositories
//! - `create`: local repositories and repository signing

pub mod constraint;
pub mod create;
pub mod distro;
pub mod install;
pub mod version;

pub use constraint::{format_dependency, parse_all, select_version, ConstraintOp, VersionConstraint};
pub use create::{create_repo, sign_repo, StateTransform};
pub use distro::{Distro, DistroFamily, PackageManager, RepoPlatform};
pub use install::{install_build_deps, install_packages, install_tools, prepare_worker};
pub use version::compare_versions;
