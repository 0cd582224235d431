use super::Category;

/// Values treated as "no value" in free-text CDM columns.
const BLANK_SENTINELS: &str = "'', 'na', 'null', 'none', 'nan', '0', '0.0', 'n/a'";

fn blank(column: &str) -> String {
    format!(
        "lower(trim(coalesce(CAST({} AS VARCHAR), ''))) IN ({})",
        column, BLANK_SENTINELS
    )
}

fn category_predicate(category: Category) -> String {
    let lat = blank("a.latitude");
    let lon = blank("a.longitude");
    let addr = blank("a.address_1");
    match category {
        Category::Latlong => format!("NOT ({}) AND NOT ({})", lat, lon),
        Category::Invalid => format!("({}) AND ({}) AND ({})", lat, lon, addr),
        Category::Address => format!("({}) AND ({}) AND NOT ({})", lat, lon, addr),
    }
}

/// Visits joined to the address that was current for the whole visit,
/// restricted to one category.
pub fn category_query(schema: &str, category: Category) -> String {
    format!(
        r#"WITH patient AS (
    SELECT p.person_id, v.visit_occurrence_id, v.visit_start_date, v.visit_end_date
    FROM {schema}.person p
    LEFT JOIN {schema}.visit_occurrence v ON p.person_id = v.person_id
),
address AS (
    SELECT lh.entity_id, l.location_id, l.address_1, l.address_2, l.city, l.state, l.zip,
           l.county, l.location_source_value, l.country_concept_id, l.country_source_value,
           l.latitude, l.longitude, lh.start_date, lh.end_date
    FROM {schema}.location l
    LEFT JOIN {schema}.location_history lh ON l.location_id = lh.location_id
)
SELECT p.person_id, p.visit_occurrence_id, year(p.visit_start_date) AS year, p.visit_start_date,
       a.location_id, a.address_1, a.address_2, a.city, a.state, a.zip, a.county,
       a.location_source_value, a.country_concept_id, a.country_source_value,
       a.latitude, a.longitude
FROM patient p
LEFT JOIN address a ON p.person_id = a.entity_id
WHERE p.visit_start_date BETWEEN a.start_date AND a.end_date
  AND p.visit_end_date BETWEEN a.start_date AND a.end_date
  AND p.visit_start_date >= DATE '2012-01-01'
  AND {predicate}"#,
        schema = schema,
        predicate = category_predicate(category),
    )
}

/// One page of `base`. `visit_occurrence_id` breaks ties so that pages never
/// overlap; `base` must expose it.
pub fn paged(base: &str, limit: usize, offset: usize) -> String {
    format!(
        "SELECT * FROM ({}) AS batch ORDER BY person_id, visit_start_date, visit_occurrence_id LIMIT {} OFFSET {}",
        base.trim().trim_end_matches(';'),
        limit,
        offset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_differ_per_category() {
        let latlong = category_query("cdm", Category::Latlong);
        let invalid = category_query("cdm", Category::Invalid);
        assert!(latlong.contains("FROM cdm.person p"));
        assert!(latlong.contains("NOT (lower(trim(coalesce(CAST(a.latitude"));
        assert!(invalid.contains("AND (lower(trim(coalesce(CAST(a.address_1"));
    }

    #[test]
    fn paging_strips_trailing_semicolon() {
        let q = paged("SELECT 1 AS person_id;", 10, 20);
        assert_eq!(
            q,
            "SELECT * FROM (SELECT 1 AS person_id) AS batch ORDER BY person_id, visit_start_date, visit_occurrence_id LIMIT 10 OFFSET 20"
        );
    }
}
