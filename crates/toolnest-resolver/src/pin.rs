use semver::{Version, VersionReq};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDirection {
    Upgrade,
    Downgrade,
    Unordered,
}

/// Whether a catalog version satisfies a user supplied pin.
///
/// Exact string equality always matches. Otherwise the pin is read as a
/// semver requirement (`2`, `^2.1`, `=2.1.0`, `>=1.4, <2`) and the candidate
/// as a version, padding `major` / `major.minor` forms with zeros.
pub fn version_satisfies_pin(candidate: &str, pin: &str) -> bool {
    let pin = pin.trim();
    if candidate.trim() == pin {
        return true;
    }

    let Ok(requirement) = VersionReq::parse(pin.trim_start_matches('v')) else {
        return false;
    };
    parse_lenient(candidate).is_some_and(|version| requirement.matches(&version))
}

/// Ordering between two opaque versions, when both read as semver.
pub fn version_direction(from: &str, to: &str) -> VersionDirection {
    match (parse_lenient(from), parse_lenient(to)) {
        (Some(from), Some(to)) if to > from => VersionDirection::Upgrade,
        (Some(from), Some(to)) if to < from => VersionDirection::Downgrade,
        _ => VersionDirection::Unordered,
    }
}

pub(crate) fn parse_lenient(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let parts = trimmed.split('.').collect::<Vec<_>>();
    if parts.is_empty()
        || parts.len() > 2
        || parts
            .iter()
            .any(|part| part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()))
    {
        return None;
    }

    let padded = match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        _ => format!("{}.{}.0", parts[0], parts[1]),
    };
    Version::parse(&padded).ok()
}
