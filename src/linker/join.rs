use anyhow::Result;
use std::collections::{HashMap, HashSet};

use crate::table::CsvTable;

/// Left join `left` to `right` on `left_key = right_key`, shaped like a
/// pandas `merge(how="left")`.
///
/// Left rows keep their order and repeat once per matching right row, in
/// right order. Unmatched rows get empty right cells. Non-key columns
/// present on both sides are suffixed `_x` (left) and `_y` (right). When
/// both keys share a name the key appears once.
pub fn left_join(left: &CsvTable, right: &CsvTable, left_key: &str, right_key: &str) -> Result<CsvTable> {
    let lk = left.require_column(left_key)?;
    let rk = right.require_column(right_key)?;
    let shared_key = left_key == right_key;

    let right_cols: Vec<usize> = (0..right.headers.len())
        .filter(|&i| !(shared_key && i == rk))
        .collect();

    let left_names: HashSet<&str> = left.headers.iter().map(String::as_str).collect();
    let right_names: HashSet<&str> = right_cols.iter().map(|&i| right.headers[i].as_str()).collect();

    let mut headers: Vec<String> = left
        .headers
        .iter()
        .map(|h| {
            if right_names.contains(h.as_str()) && !(shared_key && h == left_key) {
                format!("{}_x", h)
            } else {
                h.clone()
            }
        })
        .collect();
    headers.extend(right_cols.iter().map(|&i| {
        let h = &right.headers[i];
        if left_names.contains(h.as_str()) {
            format!("{}_y", h)
        } else {
            h.clone()
        }
    }));

    let mut matches: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, row) in right.rows.iter().enumerate() {
        matches.entry(row[rk].as_str()).or_default().push(i);
    }

    let mut out = CsvTable::new(headers);
    for row in &left.rows {
        match matches.get(row[lk].as_str()) {
            Some(hits) => {
                for &r in hits {
                    let mut joined = row.clone();
                    joined.extend(right_cols.iter().map(|&i| right.rows[r][i].clone()));
                    out.push_row(joined);
                }
            }
            None => {
                let mut joined = row.clone();
                joined.resize(row.len() + right_cols.len(), String::new());
                out.push_row(joined);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_left_order_and_multiplies_matches() -> Result<()> {
        let left = CsvTable::from_rows(&["id", "FIPS"], &[&["1", "A"], &["2", "B"], &["3", "A"]]);
        let right = CsvTable::from_rows(&["geocode", "v"], &[&["A", "a1"], &["A", "a2"]]);
        let out = left_join(&left, &right, "FIPS", "geocode")?;
        assert_eq!(out.headers, vec!["id", "FIPS", "geocode", "v"]);
        let rows: Vec<Vec<&str>> = out.rows.iter().map(|r| r.iter().map(String::as_str).collect()).collect();
        assert_eq!(
            rows,
            vec![
                vec!["1", "A", "A", "a1"],
                vec!["1", "A", "A", "a2"],
                vec!["2", "B", "", ""],
                vec!["3", "A", "A", "a1"],
                vec!["3", "A", "A", "a2"],
            ]
        );
        Ok(())
    }

    #[test]
    fn collisions_get_suffixes() -> Result<()> {
        let left = CsvTable::from_rows(&["FIPS", "pov"], &[&["A", "0.1"]]);
        let right = CsvTable::from_rows(&["geocode", "pov"], &[&["A", "0.2"]]);
        let out = left_join(&left, &right, "FIPS", "geocode")?;
        assert_eq!(out.headers, vec!["FIPS", "pov_x", "geocode", "pov_y"]);

        let shared = left_join(&left, &CsvTable::from_rows(&["FIPS", "w"], &[&["A", "1"]]), "FIPS", "FIPS")?;
        assert_eq!(shared.headers, vec!["FIPS", "pov", "w"]);
        Ok(())
    }
}
