// 📊 Aggregator - grouped sums and per-operator statistics
//
// Step 1 sums classified values per (operator, region, period).
// Step 2 groups those sums per (operator, region) across periods: total,
// mean and sample standard deviation (n-1) of the per-period sums, plus
// distinct period and year counts.

use crate::period::Period;
use crate::registry::ResolvedFiling;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSum {
    pub registry_id: String,
    pub tax_id: String,
    pub name: String,
    pub region: String,
    pub period: Period,
    pub total: f64,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorSummary {
    pub registry_id: String,
    pub tax_id: String,
    pub name: String,
    pub region: String,
    pub total: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub records: usize,
    pub periods: usize,
    pub years: usize,
}

// ============================================================================
// STATISTICS
// ============================================================================

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; 0.0 for fewer than two values
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Sum values per (operator, region, period), ordered by (period, registry id)
pub fn sum_by_period(rows: &[ResolvedFiling]) -> Vec<PeriodSum> {
    let mut groups: BTreeMap<(Period, String, String), PeriodSum> = BTreeMap::new();

    for row in rows {
        let Some(value) = row.record.delta() else { continue };
        let key = (row.record.period, row.record.registry_id.clone(), row.region.clone());
        let entry = groups.entry(key).or_insert_with(|| PeriodSum {
            registry_id: row.record.registry_id.clone(),
            tax_id: row.tax_id.clone(),
            name: row.name.clone(),
            region: row.region.clone(),
            period: row.record.period,
            total: 0.0,
            records: 0,
        });
        entry.total += value;
        entry.records += 1;
    }

    groups.into_values().collect()
}

/// Per (operator, region) statistics over per-period sums, ordered by
/// (registry id, region)
pub fn summarize(period_sums: &[PeriodSum]) -> Vec<OperatorSummary> {
    let mut groups: BTreeMap<(String, String), Vec<&PeriodSum>> = BTreeMap::new();
    for ps in period_sums {
        groups
            .entry((ps.registry_id.clone(), ps.region.clone()))
            .or_default()
            .push(ps);
    }

    groups
        .into_iter()
        .map(|((registry_id, region), sums)| {
            let values: Vec<f64> = sums.iter().map(|s| s.total).collect();
            let periods: BTreeSet<Period> = sums.iter().map(|s| s.period).collect();
            let years: BTreeSet<i32> = periods.iter().map(|p| p.year).collect();
            OperatorSummary {
                tax_id: sums[0].tax_id.clone(),
                name: sums[0].name.clone(),
                registry_id,
                region,
                total: values.iter().sum(),
                mean: mean(&values),
                std_dev: sample_std_dev(&values),
                records: sums.iter().map(|s| s.records).sum(),
                periods: periods.len(),
                years: years.len(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filing::tests::filing;
    use crate::registry::{Operator, OperatorStatus, Resolution};

    fn resolved(registry_id: &str, value: f64, period: Period) -> ResolvedFiling {
        let op = Operator {
            registry_id: registry_id.to_string(),
            tax_id: "11222333000181".to_string(),
            name: "Operadora O".to_string(),
            category: "Medicina de Grupo".to_string(),
            region: "R".to_string(),
            status: OperatorStatus::Active,
        };
        ResolvedFiling::new(
            filing(registry_id, "411111111", "Despesas com Eventos / Sinistros", 0.0, value, period),
            &Resolution::Resolved(op),
        )
    }

    #[test]
    fn test_mean_and_sample_std_over_period_sums() {
        let rows = vec![
            resolved("111111", 100.0, Period::new(2024, 3).unwrap()),
            resolved("111111", 150.0, Period::new(2024, 4).unwrap()),
            resolved("111111", 50.0, Period::new(2024, 4).unwrap()),
            resolved("111111", 300.0, Period::new(2025, 1).unwrap()),
        ];

        let sums = sum_by_period(&rows);
        let totals: Vec<f64> = sums.iter().map(|s| s.total).collect();
        assert_eq!(totals, vec![100.0, 200.0, 300.0]);

        let summary = summarize(&sums);
        assert_eq!(summary.len(), 1);
        let s = &summary[0];
        assert_eq!(s.mean, 200.0);
        assert!((s.std_dev - 100.0).abs() < 1e-9);
        assert_eq!(s.periods, 3);
        assert_eq!(s.years, 2);
        assert_eq!(s.records, 4);
        assert_eq!(s.total, 600.0);
        println!("✅ mean={} std={} periods={}", s.mean, s.std_dev, s.periods);
    }

    #[test]
    fn test_single_period_has_zero_std() {
        assert_eq!(sample_std_dev(&[42.0]), 0.0);
        assert_eq!(sample_std_dev(&[]), 0.0);
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_groups_ordered_by_period_then_operator() {
        let q1 = Period::new(2025, 1).unwrap();
        let q2 = Period::new(2025, 2).unwrap();
        let rows = vec![
            resolved("222222", 1.0, q1),
            resolved("111111", 1.0, q2),
            resolved("111111", 1.0, q1),
        ];
        let sums = sum_by_period(&rows);
        let keys: Vec<(String, String)> = sums
            .iter()
            .map(|s| (s.period.marker(), s.registry_id.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("1T2025".to_string(), "111111".to_string()),
                ("1T2025".to_string(), "222222".to_string()),
                ("2T2025".to_string(), "111111".to_string()),
            ]
        );
        let summary = summarize(&sums);
        assert_eq!(summary[0].registry_id, "111111");
        assert_eq!(summary[0].periods, 2);
    }
}
