pub mod error;
pub mod search;
pub mod tile;

pub use error::{Error, Result};
pub use search::{search_s2st, search_s2st_at, SearchParams};
pub use tile::ImageTile;

/// Host serving both the search and download endpoints.
pub const PEPS_BASE_URL: &str = "https://peps.cnes.fr";
