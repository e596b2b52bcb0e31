//! Catalog of known datasets

use crate::error::{Error, Result};
use crate::settings::Settings;

pub const REGION_BUDGETS: &str = "region_budgets";
pub const COMMUNES: &str = "communes";
pub const CHOMAGE_REGIONAL: &str = "chomage_regional";

/// Declared type a cleaned field is coerced to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticType {
    Integer,
    Decimal,
    Text,
    Date,
}

/// What to do when a source field is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    /// drop the whole row
    Reject,
    /// substitute a typed zero
    Zero,
    /// store an explicit null
    Null,
}

/// How duplicate natural keys are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// the occurrence with the highest input index wins
    KeepLast,
    /// every occurrence of a duplicated key is dropped
    RejectDuplicates,
}

/// How often the upstream source publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Yearly,
    Monthly,
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    /// canonical name after cleaning
    pub name: &'static str,
    /// source header spellings this column is recognized under,
    /// compared after header normalization
    pub aliases: &'static [&'static str],
    pub semantic: SemanticType,
    pub required: bool,
    pub missing: MissingPolicy,
}

#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub id: &'static str,
    pub name: &'static str,
    /// data.gouv.fr dataset slug, resolved to a CSV resource at fetch time
    pub slug: &'static str,
    /// direct CSV url override (from settings); skips slug resolution
    pub url: Option<String>,
    pub delimiter: u8,
    pub columns: Vec<ColumnSpec>,
    pub natural_key: &'static [&'static str],
    pub dedup: DedupPolicy,
    pub target_table: &'static str,
    pub cadence: Cadence,
}

pub struct Registry {
    specs: Vec<DatasetSpec>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            specs: builtin_specs(),
        }
    }

    /// Registry with per-dataset source overrides applied
    pub fn from_settings(settings: &Settings) -> Registry {
        let mut registry = Registry::new();
        for spec in &mut registry.specs {
            if let Some(url) = settings.dataset_url_override(spec.id) {
                spec.url = Some(url);
            }
        }
        registry
    }

    pub fn list_datasets(&self) -> &[DatasetSpec] {
        &self.specs
    }

    pub fn get(&self, id: &str) -> Result<&DatasetSpec> {
        self.specs
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::UnknownDataset(id.to_string()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

fn builtin_specs() -> Vec<DatasetSpec> {
    vec![
        DatasetSpec {
            id: REGION_BUDGETS,
            name: "Comptes individuels des regions",
            slug: "comptes-individuels-des-regions-fichier-global-a-compter-de-2008",
            url: None,
            delimiter: b';',
            columns: vec![
                ColumnSpec {
                    name: "year",
                    aliases: &["exer", "exercice", "annee"],
                    semantic: SemanticType::Integer,
                    required: true,
                    missing: MissingPolicy::Reject,
                },
                ColumnSpec {
                    name: "region_code",
                    aliases: &["reg", "code_region", "reg_code"],
                    semantic: SemanticType::Text,
                    required: true,
                    missing: MissingPolicy::Reject,
                },
                ColumnSpec {
                    name: "region_name",
                    aliases: &["lbudg", "nom_region", "reg_nom"],
                    semantic: SemanticType::Text,
                    required: false,
                    missing: MissingPolicy::Null,
                },
                ColumnSpec {
                    name: "recettes",
                    aliases: &["rec_totales", "rec_totales_f", "recettes_totales"],
                    semantic: SemanticType::Decimal,
                    required: false,
                    missing: MissingPolicy::Zero,
                },
                ColumnSpec {
                    name: "depenses",
                    aliases: &["dep_totales", "dep_totales_f", "depenses_totales"],
                    semantic: SemanticType::Decimal,
                    required: false,
                    missing: MissingPolicy::Zero,
                },
                ColumnSpec {
                    name: "dette",
                    aliases: &["encours_de_dette", "dette_totale"],
                    semantic: SemanticType::Decimal,
                    required: false,
                    missing: MissingPolicy::Null,
                },
            ],
            natural_key: &["year", "region_code"],
            dedup: DedupPolicy::KeepLast,
            target_table: "region_budgets",
            cadence: Cadence::Yearly,
        },
        DatasetSpec {
            id: COMMUNES,
            name: "Communes et villes de France",
            slug: "communes-et-villes-de-france-en-csv-excel-json-parquet-et-feather",
            url: None,
            delimiter: b',',
            columns: vec![
                ColumnSpec {
                    name: "code_insee",
                    aliases: &["code_commune_insee", "insee"],
                    semantic: SemanticType::Text,
                    required: true,
                    missing: MissingPolicy::Reject,
                },
                ColumnSpec {
                    name: "name",
                    aliases: &["nom_standard", "nom_commune", "nom"],
                    semantic: SemanticType::Text,
                    required: false,
                    missing: MissingPolicy::Null,
                },
                ColumnSpec {
                    name: "region_code",
                    aliases: &["reg_code", "code_region"],
                    semantic: SemanticType::Text,
                    required: false,
                    missing: MissingPolicy::Null,
                },
                ColumnSpec {
                    name: "region_name",
                    aliases: &["reg_nom", "nom_region"],
                    semantic: SemanticType::Text,
                    required: false,
                    missing: MissingPolicy::Null,
                },
                ColumnSpec {
                    name: "population",
                    aliases: &["pop", "population_municipale"],
                    semantic: SemanticType::Integer,
                    required: false,
                    missing: MissingPolicy::Zero,
                },
                ColumnSpec {
                    name: "area_km2",
                    aliases: &["superficie_km2", "superficie"],
                    semantic: SemanticType::Decimal,
                    required: false,
                    missing: MissingPolicy::Null,
                },
                ColumnSpec {
                    name: "density",
                    aliases: &["densite"],
                    semantic: SemanticType::Decimal,
                    required: false,
                    missing: MissingPolicy::Null,
                },
            ],
            natural_key: &["code_insee"],
            dedup: DedupPolicy::KeepLast,
            target_table: "communes",
            cadence: Cadence::Yearly,
        },
        DatasetSpec {
            id: CHOMAGE_REGIONAL,
            name: "Masse salariale et chomage partiel par region",
            slug: "masse-salariale-et-assiette-chomage-partiel-mensuelles-du-secteur-prive-par-region",
            url: None,
            delimiter: b';',
            columns: vec![
                ColumnSpec {
                    name: "month",
                    aliases: &["mois", "periode"],
                    semantic: SemanticType::Date,
                    required: true,
                    missing: MissingPolicy::Reject,
                },
                ColumnSpec {
                    name: "region_code",
                    aliases: &["reg", "code_region", "reg_code"],
                    semantic: SemanticType::Text,
                    required: true,
                    missing: MissingPolicy::Reject,
                },
                ColumnSpec {
                    name: "region_name",
                    aliases: &["libelle_region", "nom_region"],
                    semantic: SemanticType::Text,
                    required: false,
                    missing: MissingPolicy::Null,
                },
                ColumnSpec {
                    name: "masse_salariale",
                    aliases: &["masse_salariale_brute"],
                    semantic: SemanticType::Decimal,
                    required: false,
                    missing: MissingPolicy::Null,
                },
                ColumnSpec {
                    name: "chomage_partiel",
                    aliases: &["assiette_chomage_partiel", "chomage_partiel_base"],
                    semantic: SemanticType::Decimal,
                    required: false,
                    missing: MissingPolicy::Null,
                },
            ],
            natural_key: &["region_code", "month"],
            dedup: DedupPolicy::KeepLast,
            target_table: "region_employment",
            cadence: Cadence::Monthly,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{DatasetOverride, Settings};
    use std::collections::HashMap;

    #[test]
    fn settings_override_replaces_source_url() {
        let mut datasets = HashMap::new();
        datasets.insert(
            COMMUNES.to_string(),
            DatasetOverride {
                url: Some("https://example.org/communes.csv".to_string()),
            },
        );
        let settings = Settings {
            refresh_interval_seconds: None,
            fetch_timeout_seconds: None,
            fetch_max_retries: None,
            cache_ttl_seconds: None,
            data_gouv_base_url: None,
            datasets: Some(datasets),
        };
        let registry = Registry::from_settings(&settings);
        assert_eq!(
            registry.get(COMMUNES).unwrap().url.as_deref(),
            Some("https://example.org/communes.csv")
        );
        assert_eq!(registry.get(REGION_BUDGETS).unwrap().url, None);
    }

    #[test]
    fn listing_is_ordered_and_complete() {
        let registry = Registry::new();
        let ids: Vec<&str> = registry.list_datasets().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![REGION_BUDGETS, COMMUNES, CHOMAGE_REGIONAL]);
    }

    #[test]
    fn get_unknown_id_fails() {
        let registry = Registry::new();
        match registry.get("nope") {
            Err(Error::UnknownDataset(id)) => assert_eq!(id, "nope"),
            other => panic!("expected UnknownDataset, got {:?}", other.map(|s| s.id)),
        }
    }

    #[test]
    fn natural_keys_reference_declared_columns() {
        for spec in Registry::new().list_datasets() {
            for part in spec.natural_key {
                assert!(
                    spec.columns.iter().any(|c| c.name == *part),
                    "{}: key column {} not declared",
                    spec.id,
                    part
                );
            }
        }
    }
}
