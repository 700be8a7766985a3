use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use soilmesh::config::ConfigStore;
use soilmesh::controller;
use soilmesh::sim;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let data_dir = std::env::var("SOILMESH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));
    tracing::info!(dir = %data_dir.display(), "virtual device starting");

    let store = ConfigStore::new(&data_dir);
    let board = sim::host_board(&data_dir);
    controller::run(store, board).await
}
