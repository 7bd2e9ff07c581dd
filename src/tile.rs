use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use chrono::NaiveDateTime;
use futures_util::TryStreamExt;
use human_bytes::human_bytes;
use md5::{Digest, Md5};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::PEPS_BASE_URL;

/// Timestamp format used by the catalog, e.g. `2021-06-01T10:15:30.000000Z`.
const CATALOG_DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Default rendering of the acquisition time.
pub const DEFAULT_DATETIME_FMT: &str = "%Y-%m-%d %H:%M";

/// Block size used when hashing a downloaded file.
pub const DEFAULT_BLOCK_SIZE: usize = 65536;

/// Metadata of one catalog entry. The documented fields are typed; anything
/// else the catalog returns lands in `extra`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TileProperties {
    pub platform: Option<String>,
    pub processing_level: Option<String>,
    pub mgrs: Option<String>,
    pub start_date: Option<String>,
    #[serde(deserialize_with = "f64_or_string")]
    pub cloud_cover: Option<f64>,
    #[serde(deserialize_with = "u64_or_string")]
    pub resource_size: Option<u64>,
    pub resource_checksum: Option<String>,
    pub product_identifier: Option<String>,
    pub title: Option<String>,
    pub storage: Option<Storage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Storage {
    pub mode: Option<String>,
}

/// The catalog serves numeric fields either as numbers or as quoted strings.
fn f64_or_string<'de, D>(de: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(de)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number or string, got {other}"
        ))),
    }
}

fn u64_or_string<'de, D>(de: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(de)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_u64()),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number or string, got {other}"
        ))),
    }
}

/// One image record from a PEPS search.
#[derive(Debug, Clone)]
pub struct ImageTile {
    id: String,
    properties: TileProperties,
}

impl ImageTile {
    pub fn new(id: impl Into<String>, mut properties: TileProperties) -> Self {
        // The catalog pads features with explicit nulls; drop them so a
        // missing key and a null key read the same.
        properties.extra.retain(|_, v| !v.is_null());
        Self {
            id: id.into(),
            properties,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn properties(&self) -> &TileProperties {
        &self.properties
    }

    /// Catalog property without a typed field of its own.
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.properties.extra.get(key)
    }

    /// Acquisition start time. `Ok(None)` when the catalog omitted it,
    /// `MalformedTimestamp` when it is present but unparseable.
    pub fn acquired(&self) -> Result<Option<NaiveDateTime>> {
        match &self.properties.start_date {
            None => Ok(None),
            Some(value) => NaiveDateTime::parse_from_str(value, CATALOG_DATETIME_FMT)
                .map(Some)
                .map_err(|source| Error::MalformedTimestamp {
                    value: value.clone(),
                    source,
                }),
        }
    }

    pub fn acquired_fmt(&self, fmt: &str) -> Result<Option<String>> {
        Ok(self.acquired()?.map(|dt| dt.format(fmt).to_string()))
    }

    pub fn cloud_cover(&self) -> Option<f64> {
        self.properties.cloud_cover
    }

    pub fn storage_mode(&self) -> Option<&str> {
        self.properties.storage.as_ref()?.mode.as_deref()
    }

    pub fn resource_size(&self) -> Option<u64> {
        self.properties.resource_size
    }

    pub fn checksum(&self) -> Option<&str> {
        self.properties.resource_checksum.as_deref()
    }

    /// Ascending cloud cover; records without a measurement sort first.
    /// Pass to a stable sort so ties keep their input order.
    pub fn cmp_cloud_cover(&self, other: &Self) -> Ordering {
        match (self.cloud_cover(), other.cloud_cover()) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.total_cmp(&b),
        }
    }

    /// Local file name for the downloaded archive, without the `.zip` suffix.
    fn download_name(&self) -> &str {
        self.properties
            .product_identifier
            .as_deref()
            .or(self.properties.title.as_deref())
            .unwrap_or(&self.id)
    }

    /// Download the product archive to `<temp dir>/<name>.zip`, overwriting
    /// any previous copy, and return the local path.
    pub async fn download(&self, client: &Client, user: &str, password: &str) -> Result<PathBuf> {
        self.download_from(client, PEPS_BASE_URL, user, password)
            .await
    }

    /// As [`download`](Self::download), against an explicit host.
    pub async fn download_from(
        &self,
        client: &Client,
        base_url: &str,
        user: &str,
        password: &str,
    ) -> Result<PathBuf> {
        let url = format!("{base_url}/resto/collections/S2ST/{}/download", self.id);
        let response = client
            .get(&url)
            .basic_auth(user, Some(password))
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(Error::DownloadFailed {
                status: response.status(),
                body: response.text().await?,
            });
        }

        let path = std::env::temp_dir().join(format!("{}.zip", self.download_name()));
        let mut file = File::create(&path)?;
        // Write chunk by chunk; the archive never lives in memory whole.
        let mut body = response.bytes_stream();
        while let Some(bytes) = body.try_next().await? {
            file.write_all(&bytes)?;
        }

        Ok(path)
    }

    /// Compare the MD5 digest of the file at `path` against the catalog's
    /// `resourceChecksum`. `Ok(false)` when the catalog gave no checksum.
    pub fn verify(&self, path: &std::path::Path) -> Result<bool> {
        self.verify_with_block_size(path, DEFAULT_BLOCK_SIZE)
    }

    pub fn verify_with_block_size(
        &self,
        path: &std::path::Path,
        block_size: usize,
    ) -> Result<bool> {
        let Some(expected) = self.checksum() else {
            return Ok(false);
        };

        let mut file = File::open(path)?;
        let mut hasher = Md5::new();
        let mut block = vec![0u8; block_size];
        loop {
            let n = file.read(&mut block)?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
        }

        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect();
        Ok(digest == expected)
    }
}

impl fmt::Display for ImageTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_none(value: Option<&str>) -> &str {
            value.unwrap_or("None")
        }

        let cloud = match self.cloud_cover() {
            Some(c) => format!("{c:.1}%"),
            None => "None".to_string(),
        };
        // A malformed timestamp renders like a missing one; Display cannot
        // propagate the parse error.
        let acquired = self
            .acquired_fmt(DEFAULT_DATETIME_FMT)
            .ok()
            .flatten()
            .unwrap_or_else(|| "None".to_string());
        let size = human_bytes(self.resource_size().unwrap_or(0) as f64);

        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            or_none(self.properties.platform.as_deref()),
            or_none(self.properties.processing_level.as_deref()),
            or_none(self.properties.mgrs.as_deref()),
            cloud,
            acquired,
            or_none(self.storage_mode()),
            size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tile(properties: TileProperties) -> ImageTile {
        ImageTile::new("S2A_TEST_TILE", properties)
    }

    #[test]
    fn test_acquired_round_trip() {
        let t = tile(TileProperties {
            start_date: Some("2021-06-01T10:15:30.000000Z".to_string()),
            ..Default::default()
        });
        assert_eq!(
            t.acquired_fmt(DEFAULT_DATETIME_FMT).unwrap(),
            Some("2021-06-01 10:15".to_string())
        );
    }

    #[test]
    fn test_acquired_missing_is_none() {
        let t = tile(TileProperties::default());
        assert_eq!(t.acquired().unwrap(), None);
    }

    #[test]
    fn test_acquired_malformed() {
        let t = tile(TileProperties {
            start_date: Some("June 1st 2021".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            t.acquired(),
            Err(Error::MalformedTimestamp { .. })
        ));
    }

    #[test]
    fn test_numeric_properties_from_strings() {
        let properties: TileProperties = serde_json::from_value(json!({
            "cloudCover": "12.5",
            "resourceSize": "104857600"
        }))
        .unwrap();
        let t = tile(properties);
        assert_eq!(t.cloud_cover(), Some(12.5));
        assert_eq!(t.resource_size(), Some(104857600));
    }

    #[test]
    fn test_display_line() {
        let properties: TileProperties = serde_json::from_value(json!({
            "platform": "S2A",
            "processingLevel": "LEVEL1C",
            "mgrs": "22JBM",
            "cloudCover": "12.5",
            "resourceSize": "104857600",
            "startDate": "2021-06-01T10:15:30.000000Z",
            "storage": { "mode": "disk" }
        }))
        .unwrap();
        let line = tile(properties).to_string();
        assert_eq!(
            line,
            "S2A\tLEVEL1C\t22JBM\t12.5%\t2021-06-01 10:15\tdisk\t100 MB"
        );
    }

    #[test]
    fn test_display_missing_fields() {
        let line = tile(TileProperties::default()).to_string();
        assert_eq!(line, "None\tNone\tNone\tNone\tNone\tNone\t0 B");
    }

    #[test]
    fn test_comparator_missing_cloud_cover_sorts_first() {
        let cloudy = tile(TileProperties {
            cloud_cover: Some(80.0),
            ..Default::default()
        });
        let clear = tile(TileProperties {
            cloud_cover: Some(3.5),
            ..Default::default()
        });
        let unknown = tile(TileProperties::default());

        let mut tiles = vec![cloudy, clear, unknown];
        tiles.sort_by(|a, b| a.cmp_cloud_cover(b));
        let covers: Vec<_> = tiles.iter().map(ImageTile::cloud_cover).collect();
        assert_eq!(covers, vec![None, Some(3.5), Some(80.0)]);
    }

    #[test]
    fn test_download_name_precedence() {
        let both = tile(TileProperties {
            product_identifier: Some("PRODUCT".to_string()),
            title: Some("TITLE".to_string()),
            ..Default::default()
        });
        assert_eq!(both.download_name(), "PRODUCT");

        let title_only = tile(TileProperties {
            title: Some("TITLE".to_string()),
            ..Default::default()
        });
        assert_eq!(title_only.download_name(), "TITLE");

        assert_eq!(tile(TileProperties::default()).download_name(), "S2A_TEST_TILE");
    }

    #[test]
    fn test_null_extras_dropped() {
        let properties: TileProperties = serde_json::from_value(json!({
            "orbitNumber": 42,
            "snowCover": null
        }))
        .unwrap();
        let t = tile(properties);
        assert_eq!(t.extra("orbitNumber"), Some(&json!(42)));
        assert_eq!(t.extra("snowCover"), None);
    }

    mod verify {
        use super::*;
        use std::io::Write;

        // md5("hello world")
        const HELLO_WORLD_MD5: &str = "5EB63BBBE01EEED093CB22BB8F5ACDC3";

        fn checksum_tile(checksum: Option<&str>) -> ImageTile {
            tile(TileProperties {
                resource_checksum: checksum.map(str::to_string),
                ..Default::default()
            })
        }

        fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            f.write_all(content).unwrap();
            f
        }

        #[test]
        fn test_matching_digest() {
            let f = write_temp(b"hello world");
            let t = checksum_tile(Some(HELLO_WORLD_MD5));
            assert!(t.verify(f.path()).unwrap());
        }

        #[test]
        fn test_single_byte_mutation() {
            let f = write_temp(b"hello worle");
            let t = checksum_tile(Some(HELLO_WORLD_MD5));
            assert!(!t.verify(f.path()).unwrap());
        }

        #[test]
        fn test_missing_checksum_property() {
            let f = write_temp(b"hello world");
            let t = checksum_tile(None);
            assert!(!t.verify(f.path()).unwrap());
        }

        #[test]
        fn test_small_block_size() {
            let f = write_temp(b"hello world");
            let t = checksum_tile(Some(HELLO_WORLD_MD5));
            assert!(t.verify_with_block_size(f.path(), 4).unwrap());
        }

        #[test]
        fn test_missing_file_is_io_error() {
            let t = checksum_tile(Some(HELLO_WORLD_MD5));
            let result = t.verify(std::path::Path::new("/nonexistent/archive.zip"));
            assert!(matches!(result, Err(Error::Io(_))));
        }
    }
}
