// 🔍 Registry Resolver - deduplicated operator index
//
// The regulator publishes two feeds (active and cancelled operators). The
// same registry id can appear several times across them. Resolution rules,
// applied in order per registry id:
//
//   1. no entry                          → NOT_FOUND
//   2. exactly one entry (any status)    → RESOLVED(entry)
//   3. several entries, exactly 1 ACTIVE → RESOLVED(active entry)
//   4. several entries, 0 or 2+ ACTIVE   → DUPLICATE_CONFLICT
//
// Unresolved filings are annotated with sentinels, never dropped.

use crate::filing::FilingRecord;
use crate::reader::DecodedTable;
use crate::validation::{check_tax_id, ReasonCode, ValidationIssue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

pub const NOT_FOUND_SENTINEL: &str = "N/A";
pub const CONFLICT_SENTINEL: &str = "CONFLICT";

pub const FEED_REGISTRY_ID_COLUMNS: &[&str] = &["REGISTRO_OPERADORA", "REG_ANS", "REGISTRO_ANS"];
pub const FEED_TAX_ID_COLUMNS: &[&str] = &["CNPJ"];
pub const FEED_NAME_COLUMNS: &[&str] = &["RAZAO_SOCIAL", "NOME_FANTASIA"];
pub const FEED_CATEGORY_COLUMNS: &[&str] = &["MODALIDADE"];
pub const FEED_REGION_COLUMNS: &[&str] = &["UF"];

// ============================================================================
// OPERATOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatorStatus {
    Active,
    Cancelled,
}

impl OperatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorStatus::Active => "ACTIVE",
            OperatorStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub registry_id: String,
    pub tax_id: String,
    pub name: String,
    pub category: String,
    pub region: String,
    pub status: OperatorStatus,
}

/// Trim and drop a float suffix left by spreadsheet exports ("123456.0")
pub fn normalize_registry_id(raw: &str) -> String {
    let id = raw.trim();
    match id.strip_suffix(".0") {
        Some(stem) if !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()) => stem.to_string(),
        _ => id.to_string(),
    }
}

/// Read one registry feed table. Every entry gets the feed's status.
pub fn parse_registry_feed(
    table: &DecodedTable,
    status: OperatorStatus,
    source_name: &str,
) -> (Vec<Operator>, Vec<ValidationIssue>) {
    let id_col = table.column(FEED_REGISTRY_ID_COLUMNS);
    let tax_col = table.column(FEED_TAX_ID_COLUMNS);
    let name_col = table.column(FEED_NAME_COLUMNS);
    let category_col = table.column(FEED_CATEGORY_COLUMNS);
    let region_col = table.column(FEED_REGION_COLUMNS);

    let mut operators = Vec::with_capacity(table.len());
    let mut issues = Vec::new();

    if id_col.is_none() {
        warn!(feed = source_name, "Registry feed has no registry id column");
        issues.push(
            ValidationIssue::new(source_name, ReasonCode::MissingRequiredField, "no registry id column")
                .with_fields(&["registry_id"]),
        );
        return (operators, issues);
    }

    for row in &table.rows {
        let registry_id = normalize_registry_id(table.cell(row, id_col));
        if registry_id.is_empty() {
            issues.push(
                ValidationIssue::new(source_name, ReasonCode::MissingRequiredField, "registry entry without id")
                    .at_line(row.line)
                    .with_fields(&["registry_id"]),
            );
            continue;
        }

        let raw_tax_id = table.cell(row, tax_col);
        let check = check_tax_id(raw_tax_id);
        if !check.is_valid() {
            issues.push(
                ValidationIssue::new(
                    source_name,
                    ReasonCode::InvalidTaxId,
                    format!("tax id '{}' failed validation", raw_tax_id),
                )
                .at_line(row.line)
                .with_fields(&["tax_id"]),
            );
        }

        operators.push(Operator {
            tax_id: check.normalized.unwrap_or_else(|| raw_tax_id.to_string()),
            registry_id,
            name: table.cell(row, name_col).to_string(),
            category: table.cell(row, category_col).to_string(),
            region: table.cell(row, region_col).to_uppercase(),
            status,
        });
    }

    info!(feed = source_name, status = status.as_str(), entries = operators.len(), "Registry feed parsed");
    (operators, issues)
}

// ============================================================================
// RESOLUTION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Operator),
    NotFound,
    DuplicateConflict,
}

/// Resolution tag carried on annotated filings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionKind {
    Resolved,
    NotFound,
    DuplicateConflict,
}

impl Resolution {
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Resolution::Resolved(_) => ResolutionKind::Resolved,
            Resolution::NotFound => ResolutionKind::NotFound,
            Resolution::DuplicateConflict => ResolutionKind::DuplicateConflict,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryIndex {
    groups: HashMap<String, Vec<Operator>>,
}

impl RegistryIndex {
    pub fn build(operators: Vec<Operator>) -> Self {
        let mut groups: HashMap<String, Vec<Operator>> = HashMap::new();
        for op in operators {
            groups
                .entry(normalize_registry_id(&op.registry_id))
                .or_default()
                .push(op);
        }
        RegistryIndex { groups }
    }

    /// Index with no entries; every lookup is NOT_FOUND
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn entries(&self, registry_id: &str) -> &[Operator] {
        self.groups
            .get(&normalize_registry_id(registry_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn resolve(&self, registry_id: &str) -> Resolution {
        let entries = self.entries(registry_id);
        match entries {
            [] => Resolution::NotFound,
            [only] => Resolution::Resolved(only.clone()),
            many => {
                let mut active = many.iter().filter(|op| op.status == OperatorStatus::Active);
                match (active.next(), active.next()) {
                    (Some(op), None) => Resolution::Resolved(op.clone()),
                    _ => Resolution::DuplicateConflict,
                }
            }
        }
    }

    /// Registry ids whose entries cannot be disambiguated
    pub fn conflicting_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .groups
            .keys()
            .filter(|id| self.resolve(id) == Resolution::DuplicateConflict)
            .map(String::as_str)
            .collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// ANNOTATION
// ============================================================================

/// Filing record joined with its operator's attributes
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFiling {
    pub record: FilingRecord,
    pub resolution: ResolutionKind,
    pub tax_id: String,
    pub name: String,
    pub category: String,
    pub region: String,
}

impl ResolvedFiling {
    pub fn new(record: FilingRecord, resolution: &Resolution) -> Self {
        let (tax_id, name, category, region) = match resolution {
            Resolution::Resolved(op) => (
                op.tax_id.clone(),
                op.name.clone(),
                op.category.clone(),
                op.region.clone(),
            ),
            Resolution::NotFound => sentinel_fields(NOT_FOUND_SENTINEL),
            Resolution::DuplicateConflict => sentinel_fields(CONFLICT_SENTINEL),
        };
        ResolvedFiling {
            record,
            resolution: resolution.kind(),
            tax_id,
            name,
            category,
            region,
        }
    }
}

fn sentinel_fields(value: &str) -> (String, String, String, String) {
    (
        value.to_string(),
        value.to_string(),
        value.to_string(),
        value.to_string(),
    )
}

/// Annotate every record. One issue per unresolved registry id.
pub fn annotate(records: Vec<FilingRecord>, index: &RegistryIndex) -> (Vec<ResolvedFiling>, Vec<ValidationIssue>) {
    let mut cache: HashMap<String, Resolution> = HashMap::new();
    let mut unresolved: BTreeMap<String, (ResolutionKind, usize, String)> = BTreeMap::new();
    let mut annotated = Vec::with_capacity(records.len());

    for record in records {
        let resolution = cache
            .entry(record.registry_id.clone())
            .or_insert_with(|| index.resolve(&record.registry_id))
            .clone();

        if resolution.kind() != ResolutionKind::Resolved {
            let entry = unresolved
                .entry(record.registry_id.clone())
                .or_insert_with(|| (resolution.kind(), 0, record.source_file.clone()));
            entry.1 += 1;
        }

        annotated.push(ResolvedFiling::new(record, &resolution));
    }

    let issues = unresolved
        .into_iter()
        .map(|(registry_id, (kind, count, source_file))| {
            let (reason, detail) = match kind {
                ResolutionKind::DuplicateConflict => (
                    ReasonCode::OperatorConflict,
                    format!("{} registry entries, no unique active one; {} filings marked {}", index.entries(&registry_id).len(), count, CONFLICT_SENTINEL),
                ),
                _ => (
                    ReasonCode::OperatorNotFound,
                    format!("not in registry; {} filings marked {}", count, NOT_FOUND_SENTINEL),
                ),
            };
            let mut issue = ValidationIssue::new(&source_file, reason, detail).with_fields(&["registry_id"]);
            issue.registry_id = Some(registry_id);
            issue
        })
        .collect::<Vec<_>>();

    if !issues.is_empty() {
        warn!(unresolved = issues.len(), "Some registry ids could not be resolved");
    }

    (annotated, issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filing::tests::filing;
    use crate::period::Period;
    use crate::reader::read_table;

    fn op(id: &str, name: &str, status: OperatorStatus) -> Operator {
        Operator {
            registry_id: id.to_string(),
            tax_id: "11222333000181".to_string(),
            name: name.to_string(),
            category: "Medicina de Grupo".to_string(),
            region: "SP".to_string(),
            status,
        }
    }

    #[test]
    fn test_zero_entries_not_found() {
        let index = RegistryIndex::build(vec![op("111111", "A", OperatorStatus::Active)]);
        assert_eq!(index.resolve("999999"), Resolution::NotFound);
    }

    #[test]
    fn test_single_entry_resolves_regardless_of_status() {
        let index = RegistryIndex::build(vec![op("111111", "Old", OperatorStatus::Cancelled)]);
        match index.resolve("111111") {
            Resolution::Resolved(o) => assert_eq!(o.name, "Old"),
            other => panic!("expected resolved, got {:?}", other),
        }
    }

    #[test]
    fn test_one_active_among_duplicates_wins() {
        let index = RegistryIndex::build(vec![
            op("111111", "Cancelled", OperatorStatus::Cancelled),
            op("111111", "Current", OperatorStatus::Active),
        ]);
        match index.resolve("111111") {
            Resolution::Resolved(o) => assert_eq!(o.name, "Current"),
            other => panic!("expected resolved, got {:?}", other),
        }
    }

    #[test]
    fn test_two_active_is_conflict() {
        let index = RegistryIndex::build(vec![
            op("111111", "A", OperatorStatus::Active),
            op("111111", "B", OperatorStatus::Active),
            op("222222", "C", OperatorStatus::Cancelled),
            op("222222", "D", OperatorStatus::Cancelled),
        ]);
        assert_eq!(index.resolve("111111"), Resolution::DuplicateConflict);
        assert_eq!(index.resolve("222222"), Resolution::DuplicateConflict);
        assert_eq!(index.conflicting_ids(), vec!["111111", "222222"]);
    }

    #[test]
    fn test_annotate_marks_sentinels_and_keeps_records() {
        let q = Period::new(2025, 1).unwrap();
        let index = RegistryIndex::build(vec![
            op("111111", "Resolved Co", OperatorStatus::Active),
            op("222222", "A", OperatorStatus::Active),
            op("222222", "B", OperatorStatus::Active),
        ]);
        let records = vec![
            filing("111111", "411111111", "X", 0.0, 10.0, q),
            filing("222222", "411111111", "X", 0.0, 20.0, q),
            filing("333333", "411111111", "X", 0.0, 30.0, q),
            filing("333333", "411111112", "X", 0.0, 40.0, q),
        ];

        let (annotated, issues) = annotate(records, &index);
        assert_eq!(annotated.len(), 4);
        assert_eq!(annotated[0].name, "Resolved Co");
        assert_eq!(annotated[1].name, CONFLICT_SENTINEL);
        assert_eq!(annotated[1].region, CONFLICT_SENTINEL);
        assert_eq!(annotated[2].tax_id, NOT_FOUND_SENTINEL);
        assert_eq!(annotated[3].resolution, ResolutionKind::NotFound);

        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].reason, ReasonCode::OperatorConflict);
        assert_eq!(issues[1].reason, ReasonCode::OperatorNotFound);
        assert!(issues[1].detail.contains("2 filings"));
    }

    #[test]
    fn test_parse_registry_feed_with_aliases() {
        let text = "Registro_Operadora;CNPJ;Razao_Social;Modalidade;UF\n\
                    123456;11.222.333/0001-81;Saúde Exemplo;Cooperativa Médica;sp\n\
                    ;00000000000000;Sem Registro;X;RJ\n\
                    654321.0;123;Outra;Autogestão;MG\n";
        let table = read_table(text.as_bytes(), b';', "Relatorio_cadop.csv").unwrap();

        let (ops, issues) = parse_registry_feed(&table, OperatorStatus::Active, "Relatorio_cadop.csv");
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].tax_id, "11222333000181");
        assert_eq!(ops[0].region, "SP");
        assert_eq!(ops[1].registry_id, "654321");
        assert!(issues.iter().any(|i| i.reason == ReasonCode::MissingRequiredField));
        assert!(issues.iter().any(|i| i.reason == ReasonCode::InvalidTaxId));
    }
}
