//! GeoIP lookups from a local JSON database.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;

use super::{GeoIpRecord, GeoIpResolver};
use crate::error::{Error, Result};

/// [`GeoIpResolver`] backed by a JSON array of [`GeoIpRecord`]s loaded at
/// startup.
#[derive(Debug, Clone, Default)]
pub struct FileGeoIpResolver {
    records: HashMap<IpAddr, GeoIpRecord>,
}

impl FileGeoIpResolver {
    /// Loads the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            Error::configuration(format!("failed to read geoip database {}: {e}", path.display()))
        })?;
        let records: Vec<GeoIpRecord> = serde_json::from_slice(&bytes).map_err(|e| {
            Error::configuration(format!("invalid geoip database {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), records = records.len(), "loaded geoip database");
        Ok(Self::from_records(records))
    }

    /// Builds a resolver from in-memory records; later duplicates win.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = GeoIpRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.ip, r)).collect(),
        }
    }

    /// Number of known addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the database is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl GeoIpResolver for FileGeoIpResolver {
    async fn resolve(&self, ip: IpAddr) -> Result<Option<GeoIpRecord>> {
        Ok(self.records.get(&ip).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_records_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"ip":"10.0.0.1","country_code":"DE","country":"Germany","region":null,
                "city":"Frankfurt","latitude":50.1,"longitude":8.7,"asn":24940,"org":"Hetzner"}}]"#
        )
        .unwrap();

        let resolver = FileGeoIpResolver::from_path(file.path()).unwrap();
        assert_eq!(resolver.len(), 1);

        let hit = resolver.resolve("10.0.0.1".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(hit.city.as_deref(), Some("Frankfurt"));
        assert_eq!(hit.asn, Some(24940));
        assert!(resolver.resolve("10.0.0.2".parse().unwrap()).await.unwrap().is_none());
    }

    #[test]
    fn unreadable_database_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            FileGeoIpResolver::from_path(missing),
            Err(Error::Configuration { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(FileGeoIpResolver::from_path(file.path()).is_err());
    }
}
