//! Metadata enrichment of inventory items by resource ARN

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};
use vaultshift_types::{Error, Item, Result};

/// Header naming the resource column of a CSV metadata file
pub const RESOURCE_ARN_COLUMN: &str = "resourceArn";

/// Attributes keyed by resource ARN
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTable {
    entries: HashMap<String, BTreeMap<String, String>>,
}

/// Outcome of an enrichment pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentStats {
    /// Items looked at
    pub total_count: usize,
    /// Items that received attributes
    pub enriched_count: usize,
    /// Items whose resource had no metadata
    pub missing_count: usize,
}

impl MetadataTable {
    /// Build a table from `(resource_arn, attributes)` pairs
    pub fn new(entries: impl IntoIterator<Item = (String, BTreeMap<String, String>)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Load metadata from a file, JSON when the extension says so and CSV otherwise
    pub fn from_file(path: &Path) -> Result<Self> {
        let table = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&std::fs::read_to_string(path)?),
            _ => Self::from_csv_reader(std::fs::File::open(path)?),
        }
        .map_err(|e| match e {
            Error::Config { message } => {
                Error::config(format!("Invalid metadata file {}: {message}", path.display()))
            }
            other => other,
        })?;
        debug!(path = %path.display(), resources = table.len(), "Metadata loaded");
        Ok(table)
    }

    /// Parse a JSON object of the form `{"<resourceArn>": {"KEY": "VALUE"}}`
    pub fn from_json(content: &str) -> Result<Self> {
        let entries = serde_json::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        Ok(Self { entries })
    }

    /// Parse CSV rows keyed by their `resourceArn` column
    ///
    /// Every other non-empty column becomes an attribute. Rows without a
    /// resource ARN are skipped.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|e| Error::config(e.to_string()))?
            .clone();
        let arn_column = headers
            .iter()
            .position(|name| name.trim() == RESOURCE_ARN_COLUMN)
            .ok_or_else(|| {
                Error::config(format!(
                    "missing '{RESOURCE_ARN_COLUMN}' column, found: {}",
                    headers.iter().collect::<Vec<_>>().join(", ")
                ))
            })?;

        let mut entries = HashMap::new();
        let mut skipped = 0usize;
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| Error::config(format!("row {}: {e}", index + 2)))?;
            let arn = record.get(arn_column).unwrap_or_default().trim();
            if arn.is_empty() {
                skipped += 1;
                continue;
            }
            let attributes = headers
                .iter()
                .zip(record.iter())
                .filter(|(name, value)| name.trim() != RESOURCE_ARN_COLUMN && !value.is_empty())
                .map(|(name, value)| (name.trim().to_string(), value.to_string()))
                .collect();
            entries.insert(arn.to_string(), attributes);
        }
        if skipped > 0 {
            debug!(skipped, "Metadata rows without a resource ARN skipped");
        }
        Ok(Self { entries })
    }

    /// Number of resources with metadata
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attributes of one resource
    pub fn get(&self, resource_arn: &str) -> Option<&BTreeMap<String, String>> {
        self.entries.get(resource_arn)
    }

    /// Merge attributes into every item whose resource is known
    ///
    /// Existing attributes on an item win over table values.
    pub fn enrich(&self, items: &mut [Item]) -> EnrichmentStats {
        let mut stats = EnrichmentStats {
            total_count: items.len(),
            ..EnrichmentStats::default()
        };
        for item in items.iter_mut() {
            match self.entries.get(&item.resource_arn) {
                Some(attributes) => {
                    for (key, value) in attributes {
                        item.attributes
                            .entry(key.clone())
                            .or_insert_with(|| value.clone());
                    }
                    stats.enriched_count += 1;
                }
                None => {
                    warn!(
                        resource = %item.resource_arn,
                        item = %item.id,
                        "No metadata found for resource"
                    );
                    stats.missing_count += 1;
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_enrich_by_resource() {
        let table = MetadataTable::new([(
            "arn:vol:1".to_string(),
            BTreeMap::from([("APMID".to_string(), "APM0001".to_string())]),
        )]);
        let mut items = vec![Item::new("arn:rp:1", "arn:vol:1"), Item::new("arn:rp:2", "arn:vol:2")];

        let stats = table.enrich(&mut items);

        assert_eq!(stats.enriched_count, 1);
        assert_eq!(stats.missing_count, 1);
        assert_eq!(items[0].attribute("APMID"), Some("APM0001"));
        assert!(items[1].attributes.is_empty());
    }

    #[test]
    fn test_existing_attributes_are_kept() {
        let table = MetadataTable::new([(
            "arn:vol:1".to_string(),
            BTreeMap::from([("OWNER".to_string(), "ops".to_string())]),
        )]);
        let mut item = Item::new("arn:rp:1", "arn:vol:1");
        item.attributes.insert("OWNER".to_string(), "dba".to_string());

        table.enrich(std::slice::from_mut(&mut item));
        assert_eq!(item.attribute("OWNER"), Some("dba"));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"arn:vol:9": {{"APMID": "APM0009"}}}}"#).unwrap();

        let table = MetadataTable::from_file(file.path()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("arn:vol:9").unwrap()["APMID"], "APM0009");
    }

    #[test]
    fn test_from_csv_file() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "resourceArn,APMID,Owner").unwrap();
        writeln!(file, "arn:vol:1,APM0001,ops").unwrap();
        writeln!(file, "arn:vol:2,APM0002,").unwrap();

        let table = MetadataTable::from_file(file.path()).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("arn:vol:1").unwrap()["Owner"], "ops");
        let second = table.get("arn:vol:2").unwrap();
        assert_eq!(second["APMID"], "APM0002");
        assert!(!second.contains_key("Owner"));
        assert!(!second.contains_key(RESOURCE_ARN_COLUMN));
    }

    #[test]
    fn test_csv_rows_without_arn_are_skipped() {
        let csv = "APMID,resourceArn\nAPM0001,\nAPM0002,arn:vol:2\n";

        let table = MetadataTable::from_csv_reader(csv.as_bytes()).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("arn:vol:2").unwrap()["APMID"], "APM0002");
    }

    #[test]
    fn test_csv_without_arn_column_is_rejected() {
        let csv = "arn,APMID\narn:vol:1,APM0001\n";

        let err = MetadataTable::from_csv_reader(csv.as_bytes()).unwrap_err();

        assert!(err.is_fatal());
        assert!(err.to_string().contains("resourceArn"));
    }

    #[test]
    fn test_from_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "not json").unwrap();
        assert!(MetadataTable::from_file(file.path()).unwrap_err().is_fatal());
    }
}
