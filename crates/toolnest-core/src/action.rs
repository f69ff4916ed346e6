use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Install {
        name: String,
        version: String,
    },
    Upgrade {
        name: String,
        from_version: String,
        to_version: String,
    },
    Remove {
        name: String,
        version: String,
    },
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Self::Install { name, .. } | Self::Upgrade { name, .. } | Self::Remove { name, .. } => {
                name
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Upgrade { .. } => "upgrade",
            Self::Remove { .. } => "remove",
        }
    }

    /// Version the package ends up at, `None` for removals.
    pub fn target_version(&self) -> Option<&str> {
        match self {
            Self::Install { version, .. } => Some(version),
            Self::Upgrade { to_version, .. } => Some(to_version),
            Self::Remove { .. } => None,
        }
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, Self::Remove { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install { name, version } => write!(f, "install {name} v{version}"),
            Self::Upgrade {
                name,
                from_version,
                to_version,
            } => write!(f, "upgrade {name} from v{from_version} to v{to_version}"),
            Self::Remove { name, version } => write!(f, "remove {name} v{version}"),
        }
    }
}
