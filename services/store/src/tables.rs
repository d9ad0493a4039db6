//! Allow-list of every table the pipeline and the API may touch.
//!
//! Table and column identifiers used in SQL text come only from here; caller
//! input is matched against these names and never spliced into a query.

use serde::Deserialize;

use crate::error::{StoreError, StoreResult};

/// Which SQLite database a table lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Regional statistics: registry, raw metrics and derived series.
    Pesca,
    /// Species dataset, independent of the region registry.
    Species,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Registry,
    Raw,
    Derived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind }
}

use ColumnKind::{Integer, Real, Text};

const REGIONI_COLUMNS: &[Column] = &[
    col("id", Integer),
    col("nome", Text),
    col("area_geografica", Text),
];
const OCCUPAZIONE_COLUMNS: &[Column] = &[
    col("id", Integer),
    col("anno", Integer),
    col("regione_id", Integer),
    col("occupazione", Real),
];
const PRODUTTIVITA_COLUMNS: &[Column] = &[
    col("id", Integer),
    col("anno", Integer),
    col("regione_id", Integer),
    col("produttivita", Real),
];
const ECONOMIA_COLUMNS: &[Column] = &[
    col("id", Integer),
    col("anno", Integer),
    col("regione_id", Integer),
    col("importanza_economica", Real),
];
const PROD_AREE_COLUMNS: &[Column] = &[
    col("anno", Integer),
    col("area_geografica", Text),
    col("produttivita_totale", Real),
];
const PROD_NAZIONALE_COLUMNS: &[Column] = &[
    col("anno", Integer),
    col("produttivita_totale", Real),
];
const VALORE_AGGIUNTO_AREE_COLUMNS: &[Column] = &[
    col("anno", Integer),
    col("area_geografica", Text),
    col("media_valore_aggiunto", Real),
];
const OCCUPAZIONE_NAZIONALE_COLUMNS: &[Column] = &[
    col("anno", Integer),
    col("media_variazione_occupazione", Real),
];
const OCCUPAZIONE_AREE_COLUMNS: &[Column] = &[
    col("anno", Integer),
    col("area_geografica", Text),
    col("media_variazione_occupazione", Real),
];
const SPECIE_COLUMNS: &[Column] = &[
    col("id", Integer),
    col("region_code", Text),
    col("time_period", Integer),
    col("observed_value", Real),
    col("species", Text),
];
const MEDIA_SPECIE_COLUMNS: &[Column] = &[
    col("species", Text),
    col("time_period", Integer),
    col("media_observed_value", Real),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Regioni,
    Occupazione,
    Produttivita,
    Economia,
    ProduttivitaTotaleAree,
    ProduttivitaTotaleNazionale,
    MediaValoreAggiuntoAree,
    MediaVariazioneOccupazioneNazionale,
    MediaVariazioneOccupazioneAree,
    Specie,
    MediaSpecie,
}

impl Table {
    pub const ALL: [Table; 11] = [
        Table::Regioni,
        Table::Occupazione,
        Table::Produttivita,
        Table::Economia,
        Table::ProduttivitaTotaleAree,
        Table::ProduttivitaTotaleNazionale,
        Table::MediaValoreAggiuntoAree,
        Table::MediaVariazioneOccupazioneNazionale,
        Table::MediaVariazioneOccupazioneAree,
        Table::Specie,
        Table::MediaSpecie,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Regioni => "regioni",
            Table::Occupazione => "occupazione",
            Table::Produttivita => "produttivita",
            Table::Economia => "economia",
            Table::ProduttivitaTotaleAree => "produttivita_totale_aree",
            Table::ProduttivitaTotaleNazionale => "produttivita_totale_nazionale",
            Table::MediaValoreAggiuntoAree => "media_valore_aggiunto_aree",
            Table::MediaVariazioneOccupazioneNazionale => "media_variazione_occupazione_nazionale",
            Table::MediaVariazioneOccupazioneAree => "media_variazione_occupazione_aree",
            Table::Specie => "specie",
            Table::MediaSpecie => "media_specie",
        }
    }

    /// Look a caller-supplied table name up in the allow-list.
    pub fn from_name(name: &str) -> StoreResult<Table> {
        Table::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| StoreError::schema_mismatch(format!("unknown table '{}'", name)))
    }

    pub fn store(self) -> StoreKind {
        match self {
            Table::Specie | Table::MediaSpecie => StoreKind::Species,
            _ => StoreKind::Pesca,
        }
    }

    pub fn kind(self) -> TableKind {
        match self {
            Table::Regioni => TableKind::Registry,
            Table::Occupazione | Table::Produttivita | Table::Economia | Table::Specie => {
                TableKind::Raw
            }
            _ => TableKind::Derived,
        }
    }

    pub fn columns(self) -> &'static [Column] {
        match self {
            Table::Regioni => REGIONI_COLUMNS,
            Table::Occupazione => OCCUPAZIONE_COLUMNS,
            Table::Produttivita => PRODUTTIVITA_COLUMNS,
            Table::Economia => ECONOMIA_COLUMNS,
            Table::ProduttivitaTotaleAree => PROD_AREE_COLUMNS,
            Table::ProduttivitaTotaleNazionale => PROD_NAZIONALE_COLUMNS,
            Table::MediaValoreAggiuntoAree => VALORE_AGGIUNTO_AREE_COLUMNS,
            Table::MediaVariazioneOccupazioneNazionale => OCCUPAZIONE_NAZIONALE_COLUMNS,
            Table::MediaVariazioneOccupazioneAree => OCCUPAZIONE_AREE_COLUMNS,
            Table::Specie => SPECIE_COLUMNS,
            Table::MediaSpecie => MEDIA_SPECIE_COLUMNS,
        }
    }

    pub fn column(self, name: &str) -> StoreResult<Column> {
        self.columns()
            .iter()
            .copied()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                StoreError::schema_mismatch(format!(
                    "table '{}' has no column '{}'",
                    self.name(),
                    name
                ))
            })
    }

    pub fn year_column(self) -> Option<&'static str> {
        match self {
            Table::Regioni => None,
            Table::Specie | Table::MediaSpecie => Some("time_period"),
            _ => Some("anno"),
        }
    }

    /// The measured value of a raw table.
    pub fn value_column(self) -> Option<&'static str> {
        match self {
            Table::Occupazione => Some("occupazione"),
            Table::Produttivita => Some("produttivita"),
            Table::Economia => Some("importanza_economica"),
            Table::Specie => Some("observed_value"),
            _ => None,
        }
    }

    /// Deterministic traversal order for interpolation. Rowid breaks ties.
    pub fn sort_key(self) -> &'static [&'static str] {
        match self {
            Table::Occupazione | Table::Produttivita | Table::Economia => {
                &["anno", "regione_id", "id"]
            }
            Table::Specie => &["time_period", "species", "region_code", "id"],
            Table::Regioni => &["id"],
            Table::MediaSpecie => &["species", "time_period"],
            Table::ProduttivitaTotaleAree
            | Table::MediaValoreAggiuntoAree
            | Table::MediaVariazioneOccupazioneAree => &["anno", "area_geografica"],
            Table::ProduttivitaTotaleNazionale | Table::MediaVariazioneOccupazioneNazionale => {
                &["anno"]
            }
        }
    }

    /// DDL for this table's layout under `name`. Staging copies reuse it.
    pub fn create_sql(self, name: &str) -> String {
        match self {
            Table::Regioni => format!(
                r#"CREATE TABLE IF NOT EXISTS "{name}" (
                    id INTEGER PRIMARY KEY,
                    nome TEXT NOT NULL UNIQUE,
                    area_geografica TEXT NOT NULL
                )"#
            ),
            Table::Occupazione | Table::Produttivita | Table::Economia => {
                let value = self.value_column().unwrap_or_default();
                format!(
                    r#"CREATE TABLE IF NOT EXISTS "{name}" (
                        id INTEGER PRIMARY KEY,
                        anno INTEGER NOT NULL,
                        regione_id INTEGER NOT NULL REFERENCES regioni(id),
                        "{value}" REAL
                    )"#
                )
            }
            Table::Specie => format!(
                r#"CREATE TABLE IF NOT EXISTS "{name}" (
                    id INTEGER PRIMARY KEY,
                    region_code TEXT NOT NULL,
                    time_period INTEGER NOT NULL,
                    observed_value REAL,
                    species TEXT NOT NULL
                )"#
            ),
            _ => {
                let columns = self.columns();
                let defs: Vec<String> = columns
                    .iter()
                    .map(|c| match c.kind {
                        Integer => format!(r#""{}" INTEGER NOT NULL"#, c.name),
                        Text => format!(r#""{}" TEXT NOT NULL"#, c.name),
                        Real => format!(r#""{}" REAL"#, c.name),
                    })
                    .collect();
                let key: Vec<&str> = columns
                    .iter()
                    .filter(|c| c.kind != Real)
                    .map(|c| c.name)
                    .collect();
                format!(
                    r#"CREATE TABLE IF NOT EXISTS "{name}" ({}, PRIMARY KEY ({}))"#,
                    defs.join(", "),
                    key.join(", ")
                )
            }
        }
    }
}

/// The three regional metrics, each backed by one raw table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Occupazione,
    Produttivita,
    Economia,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Occupazione, Metric::Produttivita, Metric::Economia];

    pub fn table(self) -> Table {
        match self {
            Metric::Occupazione => Table::Occupazione,
            Metric::Produttivita => Table::Produttivita,
            Metric::Economia => Table::Economia,
        }
    }

    pub fn value_column(self) -> &'static str {
        match self {
            Metric::Occupazione => "occupazione",
            Metric::Produttivita => "produttivita",
            Metric::Economia => "importanza_economica",
        }
    }
}

/// Quote an allow-listed identifier for SQL text.
pub(crate) fn quoted(ident: &str) -> String {
    format!("\"{}\"", ident)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_name_rejects_unknown_and_injected_names() {
        assert_eq!(Table::from_name("economia").unwrap(), Table::Economia);
        assert!(Table::from_name("import_runs").is_err());
        let err = Table::from_name("economia; DROP TABLE regioni").unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn every_table_round_trips_through_its_name() {
        for table in Table::ALL {
            assert_eq!(Table::from_name(table.name()).unwrap(), table);
        }
    }

    #[test]
    fn derived_tables_key_on_their_group_columns() {
        let ddl = Table::ProduttivitaTotaleAree.create_sql("t");
        assert!(ddl.contains("PRIMARY KEY (anno, area_geografica)"));
        let ddl = Table::MediaSpecie.create_sql("t");
        assert!(ddl.contains("PRIMARY KEY (species, time_period)"));
    }

    #[test]
    fn metric_tables_expose_their_value_column() {
        for metric in Metric::ALL {
            assert_eq!(metric.table().value_column(), Some(metric.value_column()));
            assert_eq!(metric.table().kind(), TableKind::Raw);
        }
    }

    #[test]
    fn year_column_follows_the_store() {
        assert_eq!(Table::Regioni.year_column(), None);
        assert_eq!(Table::Specie.year_column(), Some("time_period"));
        assert_eq!(Table::Economia.year_column(), Some("anno"));
    }
}
