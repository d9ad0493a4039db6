//! Region registry: the fixed list of Italian regions and their areas.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::info;

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Area {
    #[serde(rename = "Nord-ovest")]
    NordOvest,
    #[serde(rename = "Nord-est")]
    NordEst,
    Centro,
    Sud,
    Isole,
}

impl Area {
    pub fn label(self) -> &'static str {
        match self {
            Area::NordOvest => "Nord-ovest",
            Area::NordEst => "Nord-est",
            Area::Centro => "Centro",
            Area::Sud => "Sud",
            Area::Isole => "Isole",
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Area {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Nord-ovest" => Ok(Area::NordOvest),
            "Nord-est" => Ok(Area::NordEst),
            "Centro" => Ok(Area::Centro),
            "Sud" => Ok(Area::Sud),
            "Isole" => Ok(Area::Isole),
            other => Err(StoreError::schema_mismatch(format!(
                "unknown geographic area '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub id: i64,
    pub name: String,
    pub area: Area,
}

/// Seed list. Ids are the 1-based position in this list and never change.
pub const REGIONS: &[(&str, Area)] = &[
    ("Valle d'Aosta", Area::NordOvest),
    ("Piemonte", Area::NordOvest),
    ("Liguria", Area::NordOvest),
    ("Lombardia", Area::NordOvest),
    ("Trentino-Alto Adige", Area::NordEst),
    ("Veneto", Area::NordEst),
    ("Friuli-Venezia Giulia", Area::NordEst),
    ("Emilia-Romagna", Area::NordEst),
    ("Toscana", Area::Centro),
    ("Umbria", Area::Centro),
    ("Marche", Area::Centro),
    ("Lazio", Area::Centro),
    ("Abruzzo", Area::Centro),
    ("Molise", Area::Sud),
    ("Campania", Area::Sud),
    ("Puglia", Area::Sud),
    ("Basilicata", Area::Sud),
    ("Calabria", Area::Sud),
    ("Sicilia", Area::Isole),
    ("Sardegna", Area::Isole),
];

/// Insert the seed list. Existing regions are left alone, so running this on
/// every bootstrap never duplicates a row. Returns the number of new rows.
pub async fn seed_regions(conn: &mut SqliteConnection) -> StoreResult<u64> {
    let mut inserted = 0;
    for (idx, (name, area)) in REGIONS.iter().enumerate() {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO regioni (id, nome, area_geografica) VALUES (?, ?, ?)",
        )
        .bind(idx as i64 + 1)
        .bind(*name)
        .bind(area.label())
        .execute(&mut *conn)
        .await?;
        inserted += result.rows_affected();
    }

    if inserted > 0 {
        info!(inserted, "region registry seeded");
    }
    Ok(inserted)
}

/// Lower-case, with every run of non-alphanumeric characters collapsed into
/// one space. "Valle d'Aosta" and "valle d aosta" share a key.
pub fn region_key(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// In-memory snapshot of `regioni`, loaded once per pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RegionRegistry {
    regions: Vec<Region>,
    by_key: HashMap<String, usize>,
}

impl RegionRegistry {
    pub fn new(regions: Vec<Region>) -> Self {
        let by_key = regions
            .iter()
            .enumerate()
            .map(|(idx, region)| (region_key(&region.name), idx))
            .collect();
        Self { regions, by_key }
    }

    pub async fn load(conn: &mut SqliteConnection) -> StoreResult<Self> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, nome, area_geografica FROM regioni ORDER BY id")
                .fetch_all(&mut *conn)
                .await?;

        let regions = rows
            .into_iter()
            .map(|(id, name, area)| {
                Ok(Region {
                    id,
                    name,
                    area: area.parse()?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Self::new(regions))
    }

    /// Region id for `name`: exact match first, then the normalized key.
    pub fn resolve(&self, name: &str) -> StoreResult<i64> {
        self.find(name)
            .map(|region| region.id)
            .ok_or_else(|| StoreError::UnresolvedRegion {
                name: name.to_string(),
            })
    }

    pub fn find(&self, name: &str) -> Option<&Region> {
        let trimmed = name.trim();
        self.regions
            .iter()
            .find(|region| region.name == trimmed)
            .or_else(|| {
                self.by_key
                    .get(&region_key(trimmed))
                    .map(|&idx| &self.regions[idx])
            })
    }

    pub fn get(&self, id: i64) -> Option<&Region> {
        self.regions.iter().find(|region| region.id == id)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
