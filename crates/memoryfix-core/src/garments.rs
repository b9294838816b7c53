//! Garment reference catalog.
//!
//! Maps each [`Garment`] to the statically hosted asset the synthesis
//! provider composites onto the person image. Catalog files are embedded at
//! compile time from `contrib/garments/*.toml`; the mapping is configuration,
//! never user input.

use crate::types::Garment;
use serde::Deserialize;
use std::sync::OnceLock;

const GARMENT_SUIT: &str = include_str!("../../../contrib/garments/suit.toml");
const GARMENT_HANBOK: &str = include_str!("../../../contrib/garments/hanbok.toml");

static CATALOG: OnceLock<Vec<GarmentFile>> = OnceLock::new();

/// Top-level catalog file structure (one per `contrib/garments/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct GarmentFile {
    pub garment: GarmentAsset,
}

/// The `[garment]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct GarmentAsset {
    pub kind: Garment,
    /// Path below the garment asset base URL, starting with `/`.
    pub asset_path: String,
    /// Free-text description passed to the synthesis model.
    pub description: String,
}

impl GarmentAsset {
    /// Absolute asset URL under `base_url`.
    pub fn url(&self, base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.asset_path)
    }
}

fn catalog() -> &'static Vec<GarmentFile> {
    CATALOG.get_or_init(|| {
        let mut db = Vec::new();
        for src in [GARMENT_SUIT, GARMENT_HANBOK] {
            match toml::from_str::<GarmentFile>(src) {
                Ok(g) => db.push(g),
                Err(e) => tracing::error!(error = %e, "bad garment catalog TOML"),
            }
        }
        db
    })
}

/// Look up the reference asset for a garment.
pub fn lookup(garment: Garment) -> Option<&'static GarmentAsset> {
    catalog()
        .iter()
        .map(|f| &f.garment)
        .find(|g| g.kind == garment)
}

/// List all catalog entries.
pub fn list() -> impl Iterator<Item = &'static GarmentAsset> {
    catalog().iter().map(|f| &f.garment)
}
