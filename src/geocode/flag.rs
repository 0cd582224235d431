use anyhow::Result;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::info;

use super::{clean_zip, ROW_ID};
use crate::table::CsvTable;

pub const GEOCODED: &str = "Geocoded";
pub const IMPRECISE: &str = "Imprecise Geocode";

const MISSING_SENTINELS: &[&str] = &["nan", "na", "n/a", "none", "null", ""];

fn is_blank(v: &str) -> bool {
    MISSING_SENTINELS.contains(&v.trim().to_lowercase().as_str())
}

/// True only for finite coordinates inside geographic limits.
pub fn has_coordinates(lat: &str, lon: &str) -> bool {
    match (lat.trim().parse::<f64>(), lon.trim().parse::<f64>()) {
        (Ok(lat), Ok(lon)) => {
            lat.is_finite()
                && lon.is_finite()
                && (-90.0..=90.0).contains(&lat)
                && (-180.0..=180.0).contains(&lon)
        }
        _ => false,
    }
}

/// Street, city, state and zip of the pre-geocoding row.
#[derive(Debug, Clone, Default)]
struct AddressParts {
    street: String,
    city: String,
    state: String,
    zip: String,
}

impl AddressParts {
    fn full(&self) -> String {
        [
            self.street.trim().to_lowercase(),
            self.city.trim().to_lowercase(),
            self.state.trim().to_lowercase(),
            clean_zip(&self.zip.to_lowercase()),
        ]
        .join(" ")
        .trim()
        .to_string()
    }
}

fn reason(
    geocoded: bool,
    parts: Option<&AddressParts>,
    single_address: Option<&str>,
    hospitals: &HashSet<String>,
) -> &'static str {
    if geocoded {
        let full = match (parts, single_address) {
            (Some(p), _) => p.full(),
            (None, Some(a)) => a.trim().to_lowercase(),
            (None, None) => return "",
        };
        return if hospitals.contains(&full) {
            "Hospital address given"
        } else {
            ""
        };
    }
    let Some(p) = parts else {
        return "";
    };
    if [&p.street, &p.city, &p.state, &p.zip].iter().all(|v| is_blank(v)) {
        "Blank/Incomplete address"
    } else if is_blank(&p.zip) {
        "Zip missing"
    } else if is_blank(&p.street) {
        "Street missing"
    } else {
        ""
    }
}

/// Recompute `geocode_result` from the coordinates and add a `reason`
/// column, using the original address pieces from `original` (matched on
/// the row id). `street_column` names the street field of `original`.
pub fn flag_geocode_results(
    geocoded: &mut CsvTable,
    original: &CsvTable,
    street_column: &str,
    hospitals: &HashSet<String>,
) -> Result<()> {
    let lat = geocoded.require_column("lat")?;
    let lon = geocoded.require_column("lon")?;
    let rid = geocoded.column_index(ROW_ID);
    let address = geocoded.column_index("address");

    let parts: HashMap<String, AddressParts> = match original.column_index(ROW_ID) {
        Some(orig_rid) if original.has_column(street_column) || original.has_column("city") => {
            let col = |name: &str| original.column_index(name);
            let (s, c, st, z) = (col(street_column), col("city"), col("state"), col("zip"));
            let pick = |row: &[String], idx: Option<usize>| idx.map(|i| row[i].clone()).unwrap_or_default();
            original
                .rows
                .iter()
                .map(|row| {
                    (
                        row[orig_rid].clone(),
                        AddressParts {
                            street: pick(row.as_slice(), s),
                            city: pick(row.as_slice(), c),
                            state: pick(row.as_slice(), st),
                            zip: pick(row.as_slice(), z),
                        },
                    )
                })
                .collect()
        }
        _ => HashMap::new(),
    };

    let flags: Vec<(String, String)> = geocoded
        .rows
        .par_iter()
        .map(|row| {
            let ok = has_coordinates(&row[lat], &row[lon]);
            let p = rid.and_then(|i| parts.get(&row[i]));
            let single = address.map(|i| row[i].as_str());
            let why = reason(ok, p, single, hospitals);
            let result = if ok { GEOCODED } else { IMPRECISE };
            (result.to_string(), why.to_string())
        })
        .collect();

    let (results, reasons): (Vec<String>, Vec<String>) = flags.into_iter().unzip();
    geocoded.set_column("geocode_result", results)?;
    geocoded.set_column("reason", reasons)?;
    info!(rows = geocoded.len(), "geocode_result / reason recomputed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_validation() {
        assert!(has_coordinates("33.7", "-84.3"));
        assert!(!has_coordinates("", "-84.3"));
        assert!(!has_coordinates("91", "0"));
        assert!(!has_coordinates("NaN", "0"));
    }

    #[test]
    fn reasons_follow_address_parts() -> Result<()> {
        let original = CsvTable::from_rows(
            &["_rid", "address_1", "city", "state", "zip"],
            &[
                &["0", "1000 Peachtree Park Dr NE", "Atlanta", "GA", "30309.0"],
                &["1", "", "", "nan", ""],
                &["2", "5 Elm St", "Macon", "GA", ""],
                &["3", "n/a", "Macon", "GA", "31201"],
                &["4", "9 Pine St", "Macon", "GA", "31201"],
            ],
        );
        let mut geocoded = CsvTable::from_rows(
            &["address", "lat", "lon", "geocode_result", "_rid"],
            &[
                &["x", "33.79", "-84.39", "geocoded", "0"],
                &["x", "", "", "imprecise_geocode", "1"],
                &["x", "", "", "imprecise_geocode", "2"],
                &["x", "", "", "imprecise_geocode", "3"],
                &["x", "32.8", "-83.6", "geocoded", "4"],
            ],
        );
        let hospitals: HashSet<String> =
            ["1000 peachtree park dr ne atlanta ga 30309".to_string()].into();

        flag_geocode_results(&mut geocoded, &original, "address_1", &hospitals)?;

        let result = geocoded.require_column("geocode_result")?;
        let reason = geocoded.require_column("reason")?;
        let got: Vec<(&str, &str)> = geocoded
            .rows
            .iter()
            .map(|r| (r[result].as_str(), r[reason].as_str()))
            .collect();
        assert_eq!(
            got,
            vec![
                (GEOCODED, "Hospital address given"),
                (IMPRECISE, "Blank/Incomplete address"),
                (IMPRECISE, "Zip missing"),
                (IMPRECISE, "Street missing"),
                (GEOCODED, ""),
            ]
        );
        Ok(())
    }

    #[test]
    fn single_column_addresses_use_address_text() -> Result<()> {
        let original = CsvTable::from_rows(&["_rid", "full"], &[&["0", "240 NW 25th St Miami FL 33127"]]);
        let mut geocoded = CsvTable::from_rows(
            &["address", "lat", "lon", "_rid"],
            &[&["240 Nw 25Th St Miami Fl 33127", "25.8", "-80.2", "0"]],
        );
        let hospitals: HashSet<String> = ["240 nw 25th st miami fl 33127".to_string()].into();
        flag_geocode_results(&mut geocoded, &original, "full", &hospitals)?;
        assert_eq!(geocoded.get(0, "reason"), Some("Hospital address given"));
        Ok(())
    }
}
