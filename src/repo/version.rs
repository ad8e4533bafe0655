//! Package version ordering

use std::cmp::Ordering;

/// Order two package versions
///
/// Plain `major.minor.patch` versions compare as semver. Anything else,
/// including a `-release` suffix, uses rpm/dpkg style segment comparison:
/// optional `epoch:`, numeric segments compared as numbers, alpha segments
/// lexically, numbers newer than letters, and `~` sorting before everything
/// including the end of the string.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if let (Ok(va), Ok(vb)) = (semver::Version::parse(a), semver::Version::parse(b)) {
        // A semver pre-release looks like a distro release suffix
        if va.pre.is_empty() && vb.pre.is_empty() {
            return va.cmp(&vb);
        }
    }

    let (epoch_a, rest_a) = split_epoch(a);
    let (epoch_b, rest_b) = split_epoch(b);
    epoch_a
        .cmp(&epoch_b)
        .then_with(|| compare_segments(rest_a, rest_b))
}

fn split_epoch(v: &str) -> (u64, &str) {
    match v.split_once(':') {
        Some((epoch, rest)) if !epoch.is_empty() && epoch.chars().all(|c| c.is_ascii_digit()) => {
            (epoch.parse().unwrap_or(0), rest)
        }
        _ => (0, v),
    }
}

fn is_separator(c: char) -> bool {
    !c.is_ascii_alphanumeric() && c != '~'
}

fn take_while(s: &str, pred: impl Fn(char) -> bool) -> (&str, &str) {
    let end = s.find(|c: char| !pred(c)).unwrap_or(s.len());
    s.split_at(end)
}

fn compare_segments(mut a: &str, mut b: &str) -> Ordering {
    loop {
        a = a.trim_start_matches(is_separator);
        b = b.trim_start_matches(is_separator);

        match (a.starts_with('~'), b.starts_with('~')) {
            (true, true) => {
                a = &a[1..];
                b = &b[1..];
                continue;
            }
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        if a.is_empty() || b.is_empty() {
            return match (a.is_empty(), b.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                _ => Ordering::Greater,
            };
        }

        let numeric = a.starts_with(|c: char| c.is_ascii_digit());
        let pred = |c: char| {
            if numeric {
                c.is_ascii_digit()
            } else {
                c.is_ascii_alphabetic()
            }
        };
        let (seg_a, rest_a) = take_while(a, pred);
        let (seg_b, rest_b) = take_while(b, pred);

        if seg_b.is_empty() {
            // Segment kinds differ: numbers are newer than letters
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if numeric {
            let na = seg_a.trim_start_matches('0');
            let nb = seg_b.trim_start_matches('0');
            na.len().cmp(&nb.len()).then_with(|| na.cmp(nb))
        } else {
            seg_a.cmp(seg_b)
        };
        if ord != Ordering::Equal {
            return ord;
        }

        a = rest_a;
        b = rest_b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Ordering::*;

    #[test]
    fn semver_versions() {
        assert_eq!(compare_versions("1.2.0", "1.3.0"), Less);
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Greater);
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Equal);
    }

    #[test]
    fn distro_versions() {
        assert_eq!(compare_versions("1.2.0-1.azl3", "1.2.0-2.azl3"), Less);
        assert_eq!(compare_versions("1.2.0-1", "1.2.0"), Greater);
        assert_eq!(compare_versions("1.2.0-ubuntu22.04u1", "1.2.0-ubuntu22.04u1"), Equal);
        assert_eq!(compare_versions("1:0.1", "2.0"), Greater);
        assert_eq!(compare_versions("1.22", "1.9"), Greater);
        assert_eq!(compare_versions("1.0007", "1.7"), Equal);
    }

    #[test]
    fn tilde_sorts_first() {
        assert_eq!(compare_versions("1.0~rc1", "1.0"), Less);
        assert_eq!(compare_versions("1.0~rc1", "1.0~rc2"), Less);
    }

    #[test]
    fn numbers_newer_than_letters() {
        assert_eq!(compare_versions("1.0.1", "1.0.a"), Greater);
        assert_eq!(compare_versions("1.0a", "1.0"), Greater);
    }
}
