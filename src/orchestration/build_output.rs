//! Build output classification
//!
//! Extracts the resulting image id from the terminal output of `build`.
//! Every build tool generation prints the id differently, so each known
//! format is an independent [`OutputFormat`] matcher; the overall answer is
//! the last candidate found by any of them, since builders echo cached and
//! intermediate digests before the final one.

use regex::Regex;
use std::sync::OnceLock;

/// Known shapes of `build` output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Classic builder: `Successfully built 3b5e5f7a1c2d`
    LegacyBanner,
    /// BuildKit: `#8 writing image sha256:<id> done` or, in newer releases,
    /// `=> => writing image sha256:<id>`
    BuildKitWritingImage,
    /// containerd image store: `#9 naming to moby-dangling@sha256:<id> done`
    ContainerdNaming,
    /// Podman/buildah: the full image id alone on the last line after `COMMIT`
    PodmanCommit,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::LegacyBanner,
        OutputFormat::BuildKitWritingImage,
        OutputFormat::ContainerdNaming,
        OutputFormat::PodmanCommit,
    ];

    fn regex(&self) -> &'static Regex {
        static LEGACY: OnceLock<Regex> = OnceLock::new();
        static WRITING: OnceLock<Regex> = OnceLock::new();
        static NAMING: OnceLock<Regex> = OnceLock::new();
        static COMMIT: OnceLock<Regex> = OnceLock::new();

        match self {
            Self::LegacyBanner => LEGACY
                .get_or_init(|| Regex::new(r"Successfully built ([0-9a-f]+)").expect("static regex")),
            Self::BuildKitWritingImage => WRITING.get_or_init(|| {
                Regex::new(r"writing image sha256:([0-9a-f]{64})").expect("static regex")
            }),
            Self::ContainerdNaming => NAMING.get_or_init(|| {
                Regex::new(r"naming to \S*@sha256:([0-9a-f]{64})").expect("static regex")
            }),
            Self::PodmanCommit => COMMIT
                .get_or_init(|| Regex::new(r"(?m)^([0-9a-f]{64})\r?$").expect("static regex")),
        }
    }

    /// Every `(byte offset, id)` this format finds in `output`
    pub fn candidates(&self, output: &str) -> Vec<(usize, String)> {
        self.regex()
            .captures_iter(output)
            .filter_map(|c| c.get(1))
            .map(|m| (m.start(), m.as_str().to_string()))
            .collect()
    }
}

/// Image id produced by a build, taken from the last candidate in the text
pub fn image_id(output: &str) -> Option<String> {
    OutputFormat::ALL
        .iter()
        .flat_map(|format| format.candidates(output))
        .max_by_key(|(offset, _)| *offset)
        .map(|(_, id)| id)
}
