//! The trust list: publishers whose content gets replicated.

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::address::Address;

/// Default trust list file name.
pub const DEFAULT_FILE: &str = "friends.txt";

/// Template written by [`write_sample`].
pub const SAMPLE: &str = "\
# DiscoBall Friends List
# Add one Ethereum address per line
# Lines starting with # are comments

# Example addresses (replace with real friends):
# 0x1234567890123456789012345678901234567890
# 0xabcdefabcdefabcdefabcdefabcdefabcdefabcdef

# Add your trusted publishers here:
";

/// Errors loading or creating a trust list.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// The file does not exist.
    #[error("trust list {} not found", .0.display())]
    NotFound(PathBuf),
    /// Refusing to overwrite an existing file.
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
    /// Any other io error.
    #[error("failed to access trust list {}: {source}", .path.display())]
    Io {
        /// The trust list file.
        path: PathBuf,
        /// The io error.
        #[source]
        source: io::Error,
    },
}

/// Ordered, duplicate free set of trusted publishers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustSet {
    publishers: Vec<Address>,
}

impl TrustSet {
    /// Parse a trust list.
    ///
    /// One address per line. Blank lines and lines starting with `#` are ignored. Lines that
    /// are not a valid address are logged and dropped, duplicates are collapsed keeping the
    /// first occurrence.
    pub fn parse(text: &str) -> Self {
        let mut publishers: Vec<Address> = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<Address>() {
                Ok(address) if publishers.contains(&address) => {
                    debug!(line = i + 1, %address, "duplicate publisher");
                }
                Ok(address) => publishers.push(address),
                Err(err) => warn!(line = i + 1, "ignoring invalid address {line:?}: {err}"),
            }
        }
        Self { publishers }
    }

    /// Read and parse the trust list at `path`.
    pub async fn load(path: &Path) -> Result<Self, TrustError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(TrustError::NotFound(path.to_path_buf()))
            }
            Err(source) => Err(TrustError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Whether `address` is trusted.
    pub fn contains(&self, address: &Address) -> bool {
        self.publishers.contains(address)
    }

    /// Number of publishers.
    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    /// Whether there is nothing to replicate.
    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// Publishers in file order.
    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.publishers.iter()
    }
}

impl FromIterator<Address> for TrustSet {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        let mut publishers = Vec::new();
        for address in iter {
            if !publishers.contains(&address) {
                publishers.push(address);
            }
        }
        Self { publishers }
    }
}

/// Write [`SAMPLE`] to `path`. Fails if the file exists.
pub async fn write_sample(path: &Path) -> Result<(), TrustError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    let mut file = match file {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(TrustError::AlreadyExists(path.to_path_buf()))
        }
        Err(source) => {
            return Err(TrustError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    tokio::io::AsyncWriteExt::write_all(&mut file, SAMPLE.as_bytes())
        .await
        .map_err(|source| TrustError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn malformed_lines_are_dropped() {
        let text = "\
# friends
0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed

0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359
not-an-address
0X1Ca0eb599d249e1930BD6DE0A55E39Adc1C132b5
";
        let trust = TrustSet::parse(text);
        assert_eq!(trust.len(), 2);
        assert!(!trust.contains(&"0x1Ca0eb599d249e1930BD6DE0A55E39Adc1C132b5".parse().unwrap()));
        assert!(logs_contain("ignoring invalid address"));
    }

    #[test]
    fn duplicates_collapse_in_order() {
        let text = "\
0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359
0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed
0xFB6916095CA1DF60BB79CE92CE3EA74C37C5D359
";
        let trust = TrustSet::parse(text);
        let got: Vec<String> = trust.iter().map(|a| a.to_string()).collect();
        assert_eq!(
            got,
            [
                "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
                "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
            ]
        );
    }

    #[test]
    fn sample_has_no_publishers() {
        assert!(TrustSet::parse(SAMPLE).is_empty());
    }

    #[tokio::test]
    async fn sample_is_not_overwritten() {
        let dir = testdir::testdir!();
        let path = dir.join(DEFAULT_FILE);
        write_sample(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SAMPLE);
        assert!(matches!(
            write_sample(&path).await,
            Err(TrustError::AlreadyExists(_))
        ));
        assert!(matches!(
            TrustSet::load(&dir.join("missing.txt")).await,
            Err(TrustError::NotFound(_))
        ));
    }
}
