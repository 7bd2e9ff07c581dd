use std::sync::OnceLock;

use regex::Regex;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tile::{ImageTile, TileProperties};
use crate::PEPS_BASE_URL;

const SEARCH_PATH: &str = "/resto/api/collections/S2ST/search.json";

/// Date pattern accepted by the catalog (RFC-3339, time part optional).
fn date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[0-9]{4}-[0-9]{2}-[0-9]{2}(T[0-9]{2}:[0-9]{2}:[0-9]{2}(\.[0-9]+)?(Z|[+\-][0-9]{2}:[0-9]{2})?)?$",
        )
        .expect("valid date pattern")
    })
}

/// One search's worth of parameters. Query selection takes the first of
/// `identifier`, `tileid`, point in that order; an identifier query ignores
/// every other filter.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub lat: f64,
    pub lon: f64,
    /// Search radius around the point, in meters.
    pub radius: u32,
    pub identifier: Option<String>,
    pub tileid: Option<String>,
    pub start_date: Option<String>,
    pub completion_date: Option<String>,
    /// Cloud cover ceiling in percent; 100 leaves the search unrestricted.
    pub max_cloud: u8,
    /// Results per page, 1 to 500. The service default applies when unset.
    pub max_records: Option<u32>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            radius: 1000,
            identifier: None,
            tileid: None,
            start_date: None,
            completion_date: None,
            max_cloud: 100,
            max_records: None,
        }
    }
}

impl SearchParams {
    pub fn point(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            ..Default::default()
        }
    }

    pub fn identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Default::default()
        }
    }

    pub fn tile(tileid: impl Into<String>) -> Self {
        Self {
            tileid: Some(tileid.into()),
            ..Default::default()
        }
    }

    pub fn with_radius(mut self, meters: u32) -> Self {
        self.radius = meters;
        self
    }

    pub fn with_start_date(mut self, date: impl Into<String>) -> Self {
        self.start_date = Some(date.into());
        self
    }

    pub fn with_completion_date(mut self, date: impl Into<String>) -> Self {
        self.completion_date = Some(date.into());
        self
    }

    pub fn with_max_cloud(mut self, percent: u8) -> Self {
        self.max_cloud = percent;
        self
    }

    pub fn with_max_records(mut self, count: u32) -> Self {
        self.max_records = Some(count);
        self
    }

    fn validate(&self) -> Result<()> {
        // An identifier query sends nothing else, so nothing else is checked.
        if self.identifier.is_some() {
            return Ok(());
        }
        if self.tileid.is_none() {
            if !(-90.0..=90.0).contains(&self.lat) {
                return Err(Error::InvalidParameter(format!(
                    "latitude {} outside [-90, 90]",
                    self.lat
                )));
            }
            if !(-180.0..=180.0).contains(&self.lon) {
                return Err(Error::InvalidParameter(format!(
                    "longitude {} outside [-180, 180]",
                    self.lon
                )));
            }
            if self.radius < 1 {
                return Err(Error::InvalidParameter(
                    "radius must be at least 1 meter".to_string(),
                ));
            }
        }
        if self.max_cloud > 100 {
            return Err(Error::InvalidParameter(format!(
                "cloud cover ceiling {} outside [0, 100]",
                self.max_cloud
            )));
        }
        if let Some(count) = self.max_records {
            if !(1..=500).contains(&count) {
                return Err(Error::InvalidParameter(format!(
                    "max records {count} outside [1, 500]"
                )));
            }
        }
        for date in [&self.start_date, &self.completion_date].into_iter().flatten() {
            if !date_pattern().is_match(date) {
                return Err(Error::InvalidParameter(format!(
                    "date '{date}' does not match RFC-3339"
                )));
            }
        }
        Ok(())
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        if let Some(identifier) = &self.identifier {
            return vec![("identifier", identifier.clone())];
        }

        let mut pairs = match &self.tileid {
            Some(tileid) => vec![("tileid", tileid.clone())],
            None => vec![
                ("lat", self.lat.to_string()),
                ("lon", self.lon.to_string()),
                ("radius", self.radius.to_string()),
            ],
        };
        if let Some(date) = &self.start_date {
            pairs.push(("startDate", date.clone()));
        }
        if let Some(date) = &self.completion_date {
            pairs.push(("completionDate", date.clone()));
        }
        pairs.push(("cloudCover", format!("[0,{}]", self.max_cloud)));
        if let Some(count) = self.max_records {
            pairs.push(("maxRecords", count.to_string()));
        }
        pairs
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    properties: ResponseSummary,
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Deserialize, Default)]
struct ResponseSummary {
    #[serde(rename = "totalResults")]
    total_results: Option<u64>,
}

#[derive(Deserialize)]
struct Feature {
    id: String,
    #[serde(default)]
    properties: TileProperties,
}

/// Parse a catalog response body into the reported total and the records,
/// sorted ascending by cloud cover (missing measurements first). A missing
/// or zero total yields an empty catalog, not an error.
pub fn parse_catalog(body: &str) -> Result<(u64, Vec<ImageTile>)> {
    let response: SearchResponse = serde_json::from_str(body)?;
    let total = response.properties.total_results.unwrap_or(0);
    if total == 0 {
        return Ok((0, Vec::new()));
    }

    let mut catalog: Vec<ImageTile> = response
        .features
        .into_iter()
        .map(|feature| ImageTile::new(feature.id, feature.properties))
        .collect();
    // sort_by is stable, so equal cloud covers keep their response order.
    catalog.sort_by(|a, b| a.cmp_cloud_cover(b));
    Ok((total, catalog))
}

/// Search the S2ST collection of PEPS.
pub async fn search_s2st(client: &Client, params: &SearchParams) -> Result<Vec<ImageTile>> {
    search_s2st_at(client, PEPS_BASE_URL, params).await
}

/// As [`search_s2st`], against an explicit host.
pub async fn search_s2st_at(
    client: &Client,
    base_url: &str,
    params: &SearchParams,
) -> Result<Vec<ImageTile>> {
    params.validate()?;

    let url = format!("{base_url}{SEARCH_PATH}");
    let request = client.get(&url).query(&params.query_pairs()).build()?;
    println!("{}", request.url());

    let response = client.execute(request).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpRequestFailed { status });
    }

    let body = response.text().await?;
    let (total, catalog) = parse_catalog(&body)?;

    if total > 0 {
        println!("Images found: {total}");
        println!();
        for tile in &catalog {
            println!("{tile}");
        }
    } else {
        println!("No images found");
    }

    Ok(catalog)
}
