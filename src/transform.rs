//! Cross-dataset aggregation into per-region derived records

use std::collections::{BTreeSet, HashMap};

use chrono::Datelike;
use serde::Serialize;

use crate::clean::{CleanRecord, Row, Value};

/// Target table of the derived records
pub const REGION_STATS_TABLE: &str = "region_stats";

/// One derived fact row per (region, year). A `None` means the
/// contributing dataset had no data for that region and period.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionStat {
    pub region_code: String,
    pub region_name: Option<String>,
    pub year: i64,
    pub population: Option<i64>,
    pub communes: Option<i64>,
    pub recettes: Option<f64>,
    pub depenses: Option<f64>,
    pub dette: Option<f64>,
    pub recette_per_capita: Option<f64>,
    pub depense_per_capita: Option<f64>,
    pub masse_salariale: Option<f64>,
    pub chomage_partiel: Option<f64>,
}

impl RegionStat {
    pub fn into_row(self) -> Row {
        fn opt_i(v: Option<i64>) -> Value {
            v.map(Value::Int).unwrap_or(Value::Null)
        }
        fn opt_f(v: Option<f64>) -> Value {
            v.map(Value::Float).unwrap_or(Value::Null)
        }
        vec![
            ("year".into(), Value::Int(self.year)),
            ("region_code".into(), Value::Text(self.region_code)),
            (
                "region_name".into(),
                self.region_name.map(Value::Text).unwrap_or(Value::Null),
            ),
            ("population".into(), opt_i(self.population)),
            ("communes".into(), opt_i(self.communes)),
            ("recettes".into(), opt_f(self.recettes)),
            ("depenses".into(), opt_f(self.depenses)),
            ("dette".into(), opt_f(self.dette)),
            ("recette_per_capita".into(), opt_f(self.recette_per_capita)),
            ("depense_per_capita".into(), opt_f(self.depense_per_capita)),
            ("masse_salariale".into(), opt_f(self.masse_salariale)),
            ("chomage_partiel".into(), opt_f(self.chomage_partiel)),
        ]
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TransformReport {
    pub regions: u64,
    /// communes excluded from regional aggregates for lack of a region code
    pub unmapped_communes: u64,
}

#[derive(Default)]
struct CommuneAgg {
    population: i64,
    communes: i64,
    name: Option<String>,
}

#[derive(Default)]
struct BudgetAgg {
    recettes: Option<f64>,
    depenses: Option<f64>,
    dette: Option<f64>,
    name: Option<String>,
}

#[derive(Default)]
struct EmploymentAgg {
    masse_salariale: Option<f64>,
    chomage_partiel: Option<f64>,
}

/// Join the cleaned datasets on region code and derive per-region facts.
///
/// Each input is optional: a dataset that failed this run simply leaves
/// its derived fields null. Aggregation is sums and counts only, so the
/// output is independent of input order up to its deterministic sort.
pub fn transform(
    budgets: Option<&[CleanRecord]>,
    communes: Option<&[CleanRecord]>,
    employment: Option<&[CleanRecord]>,
) -> (Vec<RegionStat>, TransformReport) {
    let mut report = TransformReport::default();

    let mut commune_aggs: HashMap<String, CommuneAgg> = HashMap::new();
    for rec in communes.unwrap_or_default() {
        let code = text(rec, "region_code")
            .map(normalize_region_code)
            .filter(|c| !c.is_empty());
        let Some(code) = code else {
            report.unmapped_communes += 1;
            continue;
        };
        let agg = commune_aggs.entry(code).or_default();
        agg.population += int(rec, "population").unwrap_or(0);
        agg.communes += 1;
        if agg.name.is_none() {
            agg.name = text(rec, "region_name").map(tidy_region_name);
        }
    }

    let mut budget_aggs: HashMap<(String, i64), BudgetAgg> = HashMap::new();
    for rec in budgets.unwrap_or_default() {
        let (Some(code), Some(year)) = (
            text(rec, "region_code").map(normalize_region_code),
            int(rec, "year"),
        ) else {
            continue;
        };
        let agg = budget_aggs.entry((code, year)).or_default();
        accumulate(&mut agg.recettes, float(rec, "recettes"));
        accumulate(&mut agg.depenses, float(rec, "depenses"));
        accumulate(&mut agg.dette, float(rec, "dette"));
        if agg.name.is_none() {
            agg.name = text(rec, "region_name").map(tidy_region_name);
        }
    }

    let mut employment_aggs: HashMap<(String, i64), EmploymentAgg> = HashMap::new();
    for rec in employment.unwrap_or_default() {
        let (Some(code), Some(year)) = (
            text(rec, "region_code").map(normalize_region_code),
            date_year(rec, "month"),
        ) else {
            continue;
        };
        let agg = employment_aggs.entry((code, year)).or_default();
        accumulate(&mut agg.masse_salariale, float(rec, "masse_salariale"));
        accumulate(&mut agg.chomage_partiel, float(rec, "chomage_partiel"));
    }

    // a derived row exists for every period-bearing (region, year)
    let keys: BTreeSet<(String, i64)> = budget_aggs
        .keys()
        .chain(employment_aggs.keys())
        .cloned()
        .collect();

    let mut stats = Vec::with_capacity(keys.len());
    for (region_code, year) in keys {
        let b = budget_aggs.get(&(region_code.clone(), year));
        let e = employment_aggs.get(&(region_code.clone(), year));
        let c = commune_aggs.get(&region_code);

        let population = c.map(|c| c.population);
        let recettes = b.and_then(|b| b.recettes);
        let depenses = b.and_then(|b| b.depenses);
        let region_name = b
            .and_then(|b| b.name.clone())
            .or_else(|| c.and_then(|c| c.name.clone()));

        stats.push(RegionStat {
            recette_per_capita: per_capita(recettes, population),
            depense_per_capita: per_capita(depenses, population),
            region_code,
            region_name,
            year,
            population,
            communes: c.map(|c| c.communes),
            recettes,
            depenses,
            dette: b.and_then(|b| b.dette),
            masse_salariale: e.and_then(|e| e.masse_salariale),
            chomage_partiel: e.and_then(|e| e.chomage_partiel),
        });
    }
    report.regions = stats.len() as u64;
    (stats, report)
}

/// Null-preserving sum: all-null input stays null instead of becoming zero
fn accumulate(acc: &mut Option<f64>, v: Option<f64>) {
    if let Some(x) = v {
        *acc = Some(acc.unwrap_or(0.0) + x);
    }
}

fn per_capita(total: Option<f64>, population: Option<i64>) -> Option<f64> {
    match (total, population) {
        (Some(t), Some(p)) if p > 0 => Some(round2(t / p as f64)),
        _ => None,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Budget files use zero-padded 3-digit region codes, commune files
/// 2-digit ones; strip leading zeros so both sides join
pub fn normalize_region_code(code: &str) -> String {
    let trimmed = code.trim();
    let stripped = trimmed.trim_start_matches('0');
    if stripped.is_empty() {
        if trimmed.is_empty() {
            String::new()
        } else {
            "0".to_string()
        }
    } else {
        stripped.to_string()
    }
}

/// Budget labels look like "REG ILE-DE-FRANCE"; strip the prefix and
/// title-case the words
fn tidy_region_name(raw: &str) -> String {
    let stripped = raw.strip_prefix("REG ").unwrap_or(raw).trim();
    let mut out = String::with_capacity(stripped.len());
    let mut word_start = true;
    for ch in stripped.chars() {
        if ch.is_alphabetic() {
            if word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            word_start = false;
        } else {
            out.push(ch);
            word_start = true;
        }
    }
    out
}

fn text<'a>(rec: &'a CleanRecord, column: &str) -> Option<&'a str> {
    match rec.get(column) {
        Some(Value::Text(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn int(rec: &CleanRecord, column: &str) -> Option<i64> {
    match rec.get(column) {
        Some(Value::Int(x)) => Some(*x),
        _ => None,
    }
}

fn float(rec: &CleanRecord, column: &str) -> Option<f64> {
    match rec.get(column) {
        Some(Value::Float(x)) => Some(*x),
        Some(Value::Int(x)) => Some(*x as f64),
        _ => None,
    }
}

fn date_year(rec: &CleanRecord, column: &str) -> Option<i64> {
    match rec.get(column) {
        Some(Value::Date(d)) => Some(i64::from(d.year())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::clean;
    use crate::ingest::decode_csv;
    use crate::registry::{Registry, CHOMAGE_REGIONAL, COMMUNES, REGION_BUDGETS};

    fn cleaned(dataset: &str, csv: &str) -> Vec<CleanRecord> {
        let spec = Registry::new().get(dataset).unwrap().clone();
        let raw = decode_csv(csv, spec.delimiter).unwrap();
        clean(&spec, &raw).unwrap().0
    }

    fn budget_fixture() -> Vec<CleanRecord> {
        cleaned(
            REGION_BUDGETS,
            "year;region_code;region_name;recettes;depenses;dette\n\
             2023;011;REG ILE-DE-FRANCE;1000;800;2000\n\
             2023;024;REG CENTRE-VAL DE LOIRE;500;400;800\n",
        )
    }

    fn commune_fixture() -> Vec<CleanRecord> {
        cleaned(
            COMMUNES,
            "code_insee,nom,reg_code,reg_nom,population\n\
             75056,Paris,11,Ile-de-France,400\n\
             75001,Paris 1er,11,Ile-de-France,100\n\
             45234,Orleans,24,Centre-Val de Loire,200\n",
        )
    }

    #[test]
    fn population_sums_per_region_without_double_counting() {
        let (stats, _) = transform(Some(&budget_fixture()), Some(&commune_fixture()), None);
        let idf = stats.iter().find(|s| s.region_code == "11").unwrap();
        assert_eq!(idf.population, Some(500));
        assert_eq!(idf.communes, Some(2));
        let cvl = stats.iter().find(|s| s.region_code == "24").unwrap();
        assert_eq!(cvl.population, Some(200));
    }

    #[test]
    fn per_capita_is_total_over_population() {
        let (stats, _) = transform(Some(&budget_fixture()), Some(&commune_fixture()), None);
        let idf = stats.iter().find(|s| s.region_code == "11").unwrap();
        assert_eq!(idf.recette_per_capita, Some(2.0));
        assert_eq!(idf.depense_per_capita, Some(1.6));
    }

    #[test]
    fn unmapped_commune_is_excluded_and_counted() {
        let communes = cleaned(
            COMMUNES,
            "code_insee,nom,reg_code,population\n\
             75056,Paris,11,400\n\
             97123,Adrift,,999\n",
        );
        let (stats, report) = transform(Some(&budget_fixture()), Some(&communes), None);
        assert_eq!(report.unmapped_communes, 1);
        let idf = stats.iter().find(|s| s.region_code == "11").unwrap();
        assert_eq!(idf.population, Some(400));
        assert!(!stats.iter().any(|s| s.population == Some(999)));
    }

    #[test]
    fn missing_datasets_leave_explicit_nulls() {
        let (stats, _) = transform(Some(&budget_fixture()), None, None);
        let idf = stats.iter().find(|s| s.region_code == "11").unwrap();
        assert_eq!(idf.population, None);
        assert_eq!(idf.recette_per_capita, None);
        assert_eq!(idf.masse_salariale, None);
        assert_eq!(idf.recettes, Some(1000.0));
    }

    #[test]
    fn zero_population_yields_null_per_capita() {
        let communes = cleaned(
            COMMUNES,
            "code_insee,nom,reg_code,population\n75056,Paris,11,0\n",
        );
        let (stats, _) = transform(Some(&budget_fixture()), Some(&communes), None);
        let idf = stats.iter().find(|s| s.region_code == "11").unwrap();
        assert_eq!(idf.population, Some(0));
        assert_eq!(idf.recette_per_capita, None);
    }

    #[test]
    fn employment_months_aggregate_into_their_year() {
        let employment = cleaned(
            CHOMAGE_REGIONAL,
            "mois;reg;masse_salariale_brute;assiette_chomage_partiel\n\
             2023-01;11;100,5;10\n\
             2023-02;11;200,5;20\n\
             2022-12;11;999;99\n",
        );
        let (stats, _) = transform(None, None, Some(&employment));
        let y2023 = stats
            .iter()
            .find(|s| s.region_code == "11" && s.year == 2023)
            .unwrap();
        assert_eq!(y2023.masse_salariale, Some(301.0));
        assert_eq!(y2023.chomage_partiel, Some(30.0));
        let y2022 = stats
            .iter()
            .find(|s| s.region_code == "11" && s.year == 2022)
            .unwrap();
        assert_eq!(y2022.masse_salariale, Some(999.0));
    }

    #[test]
    fn region_names_are_tidied() {
        let (stats, _) = transform(Some(&budget_fixture()), None, None);
        let idf = stats.iter().find(|s| s.region_code == "11").unwrap();
        assert_eq!(idf.region_name.as_deref(), Some("Ile-De-France"));
    }

    #[test]
    fn output_is_sorted_by_region_and_year() {
        let (stats, _) = transform(Some(&budget_fixture()), None, None);
        let keys: Vec<(&str, i64)> = stats
            .iter()
            .map(|s| (s.region_code.as_str(), s.year))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn region_code_normalization_strips_leading_zeros() {
        assert_eq!(normalize_region_code("011"), "11");
        assert_eq!(normalize_region_code(" 24 "), "24");
        assert_eq!(normalize_region_code("00"), "0");
        assert_eq!(normalize_region_code(""), "");
    }
}
