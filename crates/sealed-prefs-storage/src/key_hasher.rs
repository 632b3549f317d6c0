use tracing::warn;

/// Digest used for storage keys unless another is requested.
pub const DEFAULT_ALGORITHM: &str = "MD5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Digest {
    Md5,
    Unhashed,
}

/// Maps logical preference names to storage keys.
///
/// The mapping is unsalted so the same name always finds the same entry across
/// restarts. With an unsupported algorithm the hasher passes names through
/// unchanged, which leaves key names readable on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHasher {
    digest: Digest,
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self {
            digest: Digest::Md5,
        }
    }
}

impl KeyHasher {
    pub fn with_algorithm(name: &str) -> Self {
        if name.eq_ignore_ascii_case(DEFAULT_ALGORITHM) {
            return Self::default();
        }
        warn!(
            algorithm = name,
            "key digest unavailable, storage keys will not be hashed"
        );
        Self {
            digest: Digest::Unhashed,
        }
    }

    pub fn is_hashing(&self) -> bool {
        self.digest != Digest::Unhashed
    }

    /// 32 lowercase hex chars for MD5; the key itself when unhashed.
    pub fn hash(&self, key: &str) -> String {
        match self.digest {
            Digest::Md5 => format!("{:x}", md5::compute(key.as_bytes())),
            Digest::Unhashed => key.to_string(),
        }
    }
}
