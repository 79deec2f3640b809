//! Canonical (digested) container image references.
//!
//! OS images are pinned by manifest digest; two references point at the
//! same image exactly when their digests are equal, regardless of the
//! repository tags involved.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageReference {
    /// Repository part, e.g. `registry.example.com/os`
    pub(crate) name: String,
    /// Canonical digest, e.g. `sha256:<64 hex>`
    pub(crate) digest: String,
}

impl FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((name, digest)) = s.rsplit_once('@') else {
            bail!("image reference {:?} is not in canonical digested form", s);
        };
        if name.is_empty() {
            bail!("image reference {:?} has an empty repository", s);
        }
        let Some(hex) = digest.strip_prefix("sha256:") else {
            bail!("image reference {:?} has unsupported digest {:?}", s, digest);
        };
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("image reference {:?} has malformed digest {:?}", s, digest);
        }
        Ok(Self {
            name: name.to_string(),
            digest: digest.to_string(),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.digest)
    }
}

/// Whether two image URLs refer to the same image: literal equality first,
/// then canonical digest equality. Both must parse as digested references
/// for the digest comparison; failure to parse is an error for the caller
/// to surface.
pub(crate) fn same_image(a: &str, b: &str) -> Result<bool> {
    if a == b {
        return Ok(true);
    }
    let a: ImageReference = a.parse()?;
    let b: ImageReference = b.parse()?;
    Ok(a.digest == b.digest)
}
