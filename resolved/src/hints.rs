//! Loading the root hints file: a single JSON object mapping root
//! server hostname to IPv4 address, e.g.
//! `{"a.root-servers.net": "198.41.0.4", ...}`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use dns_types::protocol::types::DomainName;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// A key in the file is not a valid domain name.
    BadName(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
            Error::BadName(name) => write!(f, "'{name}' is not a valid domain name"),
        }
    }
}

impl std::error::Error for Error {}

/// Reads the root hints file, returning a map keyed by the already
/// lower-cased, dot-terminated `DomainName`.
pub fn load(path: &Path) -> Result<HashMap<DomainName, Ipv4Addr>, Error> {
    let contents = std::fs::read_to_string(path).map_err(Error::Io)?;
    let raw: HashMap<String, Ipv4Addr> = serde_json::from_str(&contents).map_err(Error::Json)?;

    let mut hints = HashMap::with_capacity(raw.len());
    for (name, address) in raw {
        let domain = DomainName::from_dotted_string(&format!("{}.", name.trim_end_matches('.')))
            .ok_or_else(|| Error::BadName(name.clone()))?;
        hints.insert(domain, address);
    }
    Ok(hints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    struct TempPath(std::path::PathBuf);

    impl TempPath {
        fn with_contents(contents: &str) -> Self {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path =
                std::env::temp_dir().join(format!("resolved-hints-test-{}-{n}", std::process::id()));
            std::fs::write(&path, contents).unwrap();
            Self(path)
        }
    }

    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn loads_well_formed_hints() {
        let file = TempPath::with_contents(
            r#"{"a.root-servers.net": "198.41.0.4", "b.root-servers.net": "199.9.14.201"}"#,
        );
        let hints = load(&file.0).unwrap();
        assert_eq!(hints.len(), 2);
        assert_eq!(
            hints[&DomainName::from_dotted_string("a.root-servers.net.").unwrap()],
            Ipv4Addr::new(198, 41, 0, 4)
        );
    }

    #[test]
    fn rejects_invalid_domain_name() {
        let file = TempPath::with_contents(r#"{"..": "198.41.0.4"}"#);
        assert!(matches!(load(&file.0), Err(Error::BadName(_))));
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("resolved-hints-test-does-not-exist");
        assert!(matches!(load(&path), Err(Error::Io(_))));
    }
}
