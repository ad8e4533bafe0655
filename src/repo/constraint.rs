//! Package version constraints
//!
//! Specs write constraints with any family's operator spelling
//! (`<`, `<<`, `=`, `==`, ...). They are parsed into a neutral form and
//! rendered back in the syntax the target's package manager expects.

use crate::error::{DalecError, DalecResult};
use crate::repo::distro::DistroFamily;
use crate::repo::version::compare_versions;
use crate::spec::PackageConstraints;
use std::cmp::Ordering;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ConstraintOp {
    /// Native operator spelling for a distro family
    pub fn symbol(&self, family: DistroFamily) -> &'static str {
        match (family, self) {
            (DistroFamily::Rpm, Self::Eq) => "==",
            (DistroFamily::Rpm, Self::Gt) => ">",
            (DistroFamily::Rpm, Self::Lt) => "<",
            (DistroFamily::Deb, Self::Eq) => "=",
            (DistroFamily::Deb, Self::Gt) => ">>",
            (DistroFamily::Deb, Self::Lt) => "<<",
            (_, Self::Gte) => ">=",
            (_, Self::Lte) => "<=",
        }
    }

    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Gt => ord == Ordering::Greater,
            Self::Gte => ord != Ordering::Less,
            Self::Lt => ord == Ordering::Less,
            Self::Lte => ord != Ordering::Greater,
        }
    }
}

// Longest spellings first so `<=` is not read as `<`
const SPELLINGS: &[(&str, ConstraintOp)] = &[
    (">=", ConstraintOp::Gte),
    ("<=", ConstraintOp::Lte),
    ("==", ConstraintOp::Eq),
    (">>", ConstraintOp::Gt),
    ("<<", ConstraintOp::Lt),
    ("=", ConstraintOp::Eq),
    (">", ConstraintOp::Gt),
    ("<", ConstraintOp::Lt),
];

/// `{operator, version}` pin, independent of distro family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    pub op: ConstraintOp,
    pub version: String,
}

impl FromStr for VersionConstraint {
    type Err = DalecError;

    fn from_str(s: &str) -> DalecResult<Self> {
        let trimmed = s.trim();
        let (op, rest) = SPELLINGS
            .iter()
            .find_map(|(sym, op)| trimmed.strip_prefix(sym).map(|rest| (*op, rest)))
            .unwrap_or((ConstraintOp::Eq, trimmed));

        let version = rest.trim();
        if version.is_empty() || version.contains(char::is_whitespace) {
            return Err(DalecError::InvalidConstraint(s.to_string()));
        }
        if version.starts_with(['<', '>', '=']) {
            return Err(DalecError::InvalidConstraint(s.to_string()));
        }

        Ok(Self {
            op,
            version: version.to_string(),
        })
    }
}

impl VersionConstraint {
    /// Render as `OP VERSION` in the family's syntax
    pub fn format(&self, family: DistroFamily) -> String {
        format!("{} {}", self.op.symbol(family), self.version)
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.op.accepts(compare_versions(candidate, &self.version))
    }
}

/// Parse every constraint of a package
pub fn parse_all(constraints: &PackageConstraints) -> DalecResult<Vec<VersionConstraint>> {
    constraints.version.iter().map(|v| v.parse()).collect()
}

/// Render a dependency for the family's installer
///
/// rpm yields one `name OP ver` argument per constraint (all must hold);
/// deb yields a single relation list `name (OP ver), name (OP ver)` with an
/// optional architecture qualifier.
pub fn format_dependency(
    family: DistroFamily,
    name: &str,
    constraints: &PackageConstraints,
) -> DalecResult<Vec<String>> {
    let parsed = parse_all(constraints)?;
    match family {
        DistroFamily::Rpm => {
            if parsed.is_empty() {
                return Ok(vec![name.to_string()]);
            }
            Ok(parsed
                .iter()
                .map(|c| format!("{} {}", name, c.format(family)))
                .collect())
        }
        DistroFamily::Deb => {
            let arch = if constraints.arch.is_empty() {
                String::new()
            } else {
                format!(" [{}]", constraints.arch.join(" "))
            };
            let relations: Vec<String> = if parsed.is_empty() {
                vec![format!("{}{}", name, arch)]
            } else {
                parsed
                    .iter()
                    .map(|c| format!("{} ({}){}", name, c.format(family), arch))
                    .collect()
            };
            Ok(vec![relations.join(", ")])
        }
    }
}

/// Highest available version satisfying every constraint
pub fn select_version<'a, S: AsRef<str>>(
    available: &'a [S],
    constraints: &[VersionConstraint],
) -> Option<&'a str> {
    available
        .iter()
        .map(AsRef::as_ref)
        .filter(|v| constraints.iter().all(|c| c.matches(v)))
        .max_by(|a, b| compare_versions(a, b))
}
