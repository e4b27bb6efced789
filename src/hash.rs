use std::fmt::Display;

/// BLAKE3 digest of a file's contents.
///
/// The bundler session keeps one per input file, so that an event which did
/// not actually change a file does not cause a rebundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Digest(blake3::Hash);

impl Digest {
    pub(crate) fn of(buffer: impl AsRef<[u8]>) -> Self {
        Self(blake3::hash(buffer.as_ref()))
    }

    #[cfg_attr(not(feature = "live"), allow(dead_code))]
    pub(crate) fn of_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(Self(blake3::Hasher::new().update_mmap(path)?.finalize()))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_tracks_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.js");

        std::fs::write(&path, "main.js").unwrap();
        let before = Digest::of_file(&path).unwrap();
        assert_eq!(before, Digest::of(b"main.js"));
        assert_eq!(before.to_string().len(), 64);

        std::fs::write(&path, "main.jsx").unwrap();
        assert_ne!(Digest::of_file(&path).unwrap(), before);
    }
}
