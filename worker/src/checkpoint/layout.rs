/// Suffix of artifacts that are still being written.
pub const TMP_SUFFIX: &str = ".tmp";

/// The three files that make up one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Artifact {
    Model,
    Optimizer,
    /// Written last; its presence commits the step.
    Meta,
}

impl Artifact {
    pub const ALL: [Artifact; 3] = [Artifact::Model, Artifact::Optimizer, Artifact::Meta];

    fn parts(self) -> (&'static str, &'static str) {
        match self {
            Artifact::Model => ("model_", ".safetensors"),
            Artifact::Optimizer => ("optim_", ".safetensors"),
            Artifact::Meta => ("meta_", ".json"),
        }
    }

    pub fn file_name(self, step: u64) -> String {
        let (prefix, ext) = self.parts();
        format!("{prefix}{step:06}{ext}")
    }

    /// Recognises a committed artifact name.
    pub fn parse(name: &str) -> Option<(Artifact, u64)> {
        Self::ALL.into_iter().find_map(|artifact| {
            let (prefix, ext) = artifact.parts();
            let digits = name.strip_prefix(prefix)?.strip_suffix(ext)?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok().map(|step| (artifact, step))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_zero_padded_and_parse_back() {
        assert_eq!(Artifact::Model.file_name(100), "model_000100.safetensors");
        assert_eq!(Artifact::Meta.file_name(1_234_567), "meta_1234567.json");

        for artifact in Artifact::ALL {
            let name = artifact.file_name(42);
            assert_eq!(Artifact::parse(&name), Some((artifact, 42)));
        }
    }

    #[test]
    fn foreign_and_partial_names_are_ignored() {
        assert_eq!(Artifact::parse("meta_000100.json.tmp"), None);
        assert_eq!(Artifact::parse("model_.safetensors"), None);
        assert_eq!(Artifact::parse("model_+12.safetensors"), None);
        assert_eq!(Artifact::parse("notes.txt"), None);
    }
}
