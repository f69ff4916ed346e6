#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
    TarGz,
    Tar,
    Gz,
    Msi,
    Exe,
}

/// Installer family an artifact is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFamily {
    Archive,
    Native,
}

impl ArchiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
            Self::Tar => "tar",
            Self::Gz => "gz",
            Self::Msi => "msi",
            Self::Exe => "exe",
        }
    }

    pub fn family(self) -> ArtifactFamily {
        match self {
            Self::Zip | Self::TarGz | Self::Tar | Self::Gz => ArtifactFamily::Archive,
            Self::Msi | Self::Exe => ArtifactFamily::Native,
        }
    }

    /// Infers the type from a file name or URL, ignoring any query string
    /// or fragment. `None` means unsupported.
    pub fn infer_from_file_name(name: &str) -> Option<Self> {
        const SUFFIXES: &[(&str, ArchiveType)] = &[
            (".zip", ArchiveType::Zip),
            (".tar.gz", ArchiveType::TarGz),
            (".tgz", ArchiveType::TarGz),
            (".tar", ArchiveType::Tar),
            (".gz", ArchiveType::Gz),
            (".msi", ArchiveType::Msi),
            (".exe", ArchiveType::Exe),
        ];

        let lower = name.to_ascii_lowercase();
        let path = lower.split(['?', '#']).next().unwrap_or_default();
        SUFFIXES
            .iter()
            .find(|(suffix, _)| path.ends_with(suffix))
            .map(|(_, archive_type)| *archive_type)
    }
}

impl ArtifactFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Native => "native",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "archive" => Some(Self::Archive),
            "native" => Some(Self::Native),
            _ => None,
        }
    }
}
