use anyhow::Result;

extern crate peps_s2;
use peps_s2::{search_s2st, SearchParams};

#[tokio::main]
async fn main() -> Result<()> {
    let client = reqwest::Client::new();

    let params = SearchParams::point(-25.627752647341822, -51.09637134324484)
        .with_start_date("2017-04-01")
        .with_completion_date("2017-06-11")
        .with_max_cloud(80);

    let catalog = search_s2st(&client, &params).await?;

    if let Some(best) = catalog.first() {
        println!("least cloudy result: {best}");
    }

    Ok(())
}
