//! Transaction loading and per-customer feature aggregation using Polars

use crate::error::SegmentError;
use ndarray::Array2;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use tracing::debug;

/// Raw transaction columns
pub const CUSTOMER_ID: &str = "User_Id";
pub const TRX_AGE: &str = "Trx_Age";
pub const TRX_RANK: &str = "Trx_Rank";
pub const TRX_VALUE: &str = "Trx_Vlu";
pub const CATEGORY: &str = "Category In English";
pub const POINTS: &str = "Points";
pub const CUSTOMER_AGE: &str = "Customer_Age";

/// Aggregated feature columns
pub const RECENCY: &str = "Recency";
pub const FREQUENCY: &str = "Frequency";
pub const CUSTOMER_TENURE: &str = "Customer_Tenure";
pub const CATEGORY_DIVERSITY: &str = "Category_Diversity";
pub const MONETARY_TOTAL: &str = "Monetary_Total";
pub const MONETARY_MAX: &str = "Monetary_Max";
pub const TOTAL_POINTS: &str = "Total_Points";

/// Features fed to the model, in training order
pub const FEATURE_COLUMNS: [&str; 7] = [
    RECENCY,
    FREQUENCY,
    CUSTOMER_TENURE,
    CATEGORY_DIVERSITY,
    MONETARY_TOTAL,
    MONETARY_MAX,
    TOTAL_POINTS,
];

/// Columns an already-aggregated table must carry to be scored
pub const REQUIRED_FEATURES: [&str; 3] = [RECENCY, FREQUENCY, MONETARY_TOTAL];

#[derive(Debug, Clone, Copy)]
enum Reduction {
    Min,
    Max,
    Sum,
    Distinct,
}

impl Reduction {
    fn expr(self, source: &str) -> Expr {
        match self {
            Reduction::Min => col(source).min(),
            Reduction::Max => col(source).max(),
            Reduction::Sum => col(source).sum(),
            Reduction::Distinct => col(source).drop_nulls().n_unique(),
        }
    }
}

/// (source column, reduction, output feature)
const AGGREGATIONS: [(&str, Reduction, &str); 7] = [
    (TRX_AGE, Reduction::Min, RECENCY),
    (TRX_RANK, Reduction::Max, FREQUENCY),
    (CUSTOMER_AGE, Reduction::Max, CUSTOMER_TENURE),
    (CATEGORY, Reduction::Distinct, CATEGORY_DIVERSITY),
    (TRX_VALUE, Reduction::Sum, MONETARY_TOTAL),
    (TRX_VALUE, Reduction::Max, MONETARY_MAX),
    (POINTS, Reduction::Sum, TOTAL_POINTS),
];

/// Shape of an input table, decided from its columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// One row per purchase event; needs aggregation before scoring
    RawTransactions,
    /// One row per customer with feature columns already computed
    CustomerFeatures,
}

pub(crate) fn has_column(df: &DataFrame, name: &str) -> bool {
    df.column(name).is_ok()
}

/// Load a CSV file into a data frame
pub fn load_csv(path: impl AsRef<Path>) -> crate::Result<DataFrame> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SegmentError::resource(format!(
            "data file not found at {}",
            path.display()
        )));
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .and_then(|reader| reader.finish())
        .map_err(|e| {
            SegmentError::resource(format!("failed to read {}: {e}", path.display()))
        })?;

    debug!(rows = df.height(), path = %path.display(), "loaded csv");
    Ok(df)
}

/// Write a data frame to CSV with a header row
pub fn write_csv(df: &mut DataFrame, path: impl AsRef<Path>) -> crate::Result<()> {
    let mut file = File::create(path.as_ref())?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

/// Reduce raw transactions to one feature row per customer
///
/// The output holds the customer identifier followed by [`FEATURE_COLUMNS`],
/// ordered by first appearance of each customer. Absent source columns give
/// 0, except the category count which falls back to 1.
pub fn aggregate(transactions: &DataFrame) -> crate::Result<DataFrame> {
    if !has_column(transactions, CUSTOMER_ID) {
        return Err(SegmentError::schema(format!(
            "missing customer identifier column `{CUSTOMER_ID}`"
        )));
    }

    // Numeric sources must hold numbers (or numeric text) before reduction
    let mut prepared = transactions.clone();
    for (source, reduction, _) in AGGREGATIONS {
        if matches!(reduction, Reduction::Distinct) {
            continue;
        }
        if let Ok(series) = transactions.column(source) {
            let values = series.strict_cast(&DataType::Float64).map_err(|_| {
                SegmentError::data(format!("column `{source}` holds non-numeric values"))
            })?;
            prepared.with_column(values)?;
        }
    }

    let mut aggregations = Vec::with_capacity(AGGREGATIONS.len());
    let mut constants = Vec::new();
    for (source, reduction, feature) in AGGREGATIONS {
        if has_column(transactions, source) {
            aggregations.push(reduction.expr(source).alias(feature));
        } else if feature == CATEGORY_DIVERSITY {
            constants.push(lit(1.0).alias(feature));
        } else {
            debug!(column = source, "source column absent, filling {feature} with 0");
            constants.push(lit(0.0).alias(feature));
        }
    }

    let mut selection = vec![col(CUSTOMER_ID)];
    selection.extend(
        FEATURE_COLUMNS
            .iter()
            .map(|&name| col(name).cast(DataType::Float64).fill_null(lit(0.0))),
    );

    let mut grouped = prepared
        .lazy()
        .filter(col(CUSTOMER_ID).is_not_null())
        .group_by_stable([col(CUSTOMER_ID)])
        .agg(aggregations);
    if !constants.is_empty() {
        grouped = grouped.with_columns(constants);
    }

    let customers = grouped
        .select(selection)
        .collect()
        .map_err(|e| SegmentError::data(format!("failed to aggregate transactions: {e}")))?;

    debug!(
        transactions = transactions.height(),
        customers = customers.height(),
        "aggregated customer features"
    );
    Ok(customers)
}

/// Decide whether a table holds raw transactions or customer features
pub fn classify(df: &DataFrame) -> crate::Result<TableKind> {
    let transaction_level = has_column(df, TRX_AGE) || has_column(df, TRX_RANK);
    if has_column(df, CUSTOMER_ID) && has_column(df, TRX_VALUE) && transaction_level {
        return Ok(TableKind::RawTransactions);
    }

    let missing: Vec<&str> = REQUIRED_FEATURES
        .iter()
        .copied()
        .filter(|name| !has_column(df, name))
        .collect();
    if missing.is_empty() {
        Ok(TableKind::CustomerFeatures)
    } else {
        Err(SegmentError::schema(format!(
            "table is neither raw transactions (needs `{CUSTOMER_ID}`, `{TRX_VALUE}` and \
             `{TRX_AGE}` or `{TRX_RANK}`) nor customer features (missing {})",
            missing.join(", ")
        )))
    }
}

/// Extract the named feature columns as a dense matrix, in the given order
///
/// Absent columns and null cells become 0. Values must be finite and
/// non-negative.
pub fn feature_matrix(df: &DataFrame, columns: &[String]) -> crate::Result<Array2<f64>> {
    let mut matrix = Array2::zeros((df.height(), columns.len()));

    for (j, name) in columns.iter().enumerate() {
        let Ok(series) = df.column(name) else {
            debug!(column = %name, "feature column absent, filling with 0");
            continue;
        };

        let values = series
            .strict_cast(&DataType::Float64)
            .map_err(|_| SegmentError::data(format!("column `{name}` is not numeric")))?;

        for (i, value) in values.f64()?.into_iter().enumerate() {
            let value = value.unwrap_or(0.0);
            if !value.is_finite() || value < 0.0 {
                return Err(SegmentError::data(format!(
                    "column `{name}` row {i} has out-of-domain value {value}"
                )));
            }
            matrix[[i, j]] = value;
        }
    }

    Ok(matrix)
}

/// Canonical feature list as owned strings
pub fn feature_names() -> Vec<String> {
    FEATURE_COLUMNS.iter().map(|name| name.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_transactions() -> DataFrame {
        df!(
            CUSTOMER_ID => &[1i64, 1, 1, 2],
            TRX_AGE => &[5i64, 10, 20, 3],
            TRX_RANK => &[1i64, 2, 3, 1],
            TRX_VALUE => &[10.0, 20.0, 30.0, 5000.0],
            CATEGORY => &["Food", "Toys", "Food", "Travel"],
            POINTS => &[1i64, 2, 3, 50],
            CUSTOMER_AGE => &[100i64, 110, 120, 30]
        )
        .unwrap()
    }

    fn value(df: &DataFrame, column: &str, row: usize) -> f64 {
        df.column(column).unwrap().f64().unwrap().get(row).unwrap()
    }

    #[test]
    fn test_aggregate_reductions() {
        let customers = aggregate(&sample_transactions()).unwrap();

        assert_eq!(customers.height(), 2);
        assert_eq!(value(&customers, RECENCY, 0), 5.0);
        assert_eq!(value(&customers, FREQUENCY, 0), 3.0);
        assert_eq!(value(&customers, CUSTOMER_TENURE, 0), 120.0);
        assert_eq!(value(&customers, CATEGORY_DIVERSITY, 0), 2.0);
        assert_eq!(value(&customers, MONETARY_TOTAL, 0), 60.0);
        assert_eq!(value(&customers, MONETARY_MAX, 0), 30.0);
        assert_eq!(value(&customers, TOTAL_POINTS, 0), 6.0);
        assert_eq!(value(&customers, MONETARY_TOTAL, 1), 5000.0);
    }

    #[test]
    fn test_aggregate_column_order() {
        let customers = aggregate(&sample_transactions()).unwrap();
        let names: Vec<String> = customers
            .get_columns()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        let mut expected = vec![CUSTOMER_ID.to_string()];
        expected.extend(feature_names());
        assert_eq!(names, expected);
    }

    #[test]
    fn test_aggregate_one_row_per_customer() {
        let df = df!(
            CUSTOMER_ID => &[7i64, 3, 7, 9, 3, 7],
            TRX_VALUE => &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        )
        .unwrap();

        let customers = aggregate(&df).unwrap();
        assert_eq!(customers.height(), 3);

        let ids: Vec<i64> = customers
            .column(CUSTOMER_ID)
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(ids, vec![7, 3, 9]);
    }

    #[test]
    fn test_aggregate_keeps_duplicates() {
        let df = df!(
            CUSTOMER_ID => &[1i64, 1],
            TRX_AGE => &[4i64, 4],
            TRX_RANK => &[1i64, 1],
            TRX_VALUE => &[25.0, 25.0]
        )
        .unwrap();

        let customers = aggregate(&df).unwrap();
        assert_eq!(customers.height(), 1);
        assert_eq!(value(&customers, MONETARY_TOTAL, 0), 50.0);
        assert_eq!(value(&customers, MONETARY_MAX, 0), 25.0);
    }

    #[test]
    fn test_aggregate_missing_optional_columns() {
        let df = df!(
            CUSTOMER_ID => &[1i64, 2],
            TRX_VALUE => &[10.0, 20.0]
        )
        .unwrap();

        let customers = aggregate(&df).unwrap();
        assert_eq!(value(&customers, CATEGORY_DIVERSITY, 0), 1.0);
        assert_eq!(value(&customers, CATEGORY_DIVERSITY, 1), 1.0);
        assert_eq!(value(&customers, RECENCY, 0), 0.0);
        assert_eq!(value(&customers, TOTAL_POINTS, 1), 0.0);
        assert_eq!(value(&customers, MONETARY_TOTAL, 1), 20.0);
    }

    #[test]
    fn test_aggregate_requires_customer_id() {
        let df = df!(TRX_VALUE => &[10.0, 20.0]).unwrap();
        let err = aggregate(&df).unwrap_err();
        assert!(matches!(err, SegmentError::Schema(_)));
    }

    #[test]
    fn test_aggregate_rejects_text_columns() {
        let df = df!(
            CUSTOMER_ID => &[1i64, 1, 2],
            TRX_AGE => &["abc", "def", "ghi"],
            TRX_RANK => &[1i64, 2, 1],
            TRX_VALUE => &[10.0, 20.0, 30.0]
        )
        .unwrap();

        let err = aggregate(&df).unwrap_err();
        assert!(matches!(err, SegmentError::Data(_)));
    }

    #[test]
    fn test_aggregate_parses_numeric_text() {
        let df = df!(
            CUSTOMER_ID => &[1i64, 1],
            TRX_AGE => &["10", "5"],
            TRX_VALUE => &["10.5", "20"]
        )
        .unwrap();

        let customers = aggregate(&df).unwrap();
        assert_eq!(value(&customers, RECENCY, 0), 5.0);
        assert_eq!(value(&customers, MONETARY_TOTAL, 0), 30.5);
        assert_eq!(value(&customers, MONETARY_MAX, 0), 20.0);
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&sample_transactions()).unwrap(),
            TableKind::RawTransactions
        );

        let customers = aggregate(&sample_transactions()).unwrap();
        assert_eq!(classify(&customers).unwrap(), TableKind::CustomerFeatures);

        let neither = df!(CUSTOMER_ID => &[1i64], RECENCY => &[3.0]).unwrap();
        assert!(matches!(classify(&neither), Err(SegmentError::Schema(_))));
    }

    #[test]
    fn test_feature_matrix_zero_fills_and_orders() {
        let df = df!(
            MONETARY_TOTAL => &[100.0, 200.0],
            RECENCY => &[Some(3.0), None]
        )
        .unwrap();
        let columns = vec![
            RECENCY.to_string(),
            FREQUENCY.to_string(),
            MONETARY_TOTAL.to_string(),
        ];

        let matrix = feature_matrix(&df, &columns).unwrap();
        assert_eq!(matrix.shape(), &[2, 3]);
        assert_eq!(matrix[[0, 0]], 3.0);
        assert_eq!(matrix[[1, 0]], 0.0);
        assert_eq!(matrix[[0, 1]], 0.0);
        assert_eq!(matrix[[1, 2]], 200.0);
    }

    #[test]
    fn test_feature_matrix_rejects_negative_values() {
        let df = df!(MONETARY_TOTAL => &[100.0, -5.0]).unwrap();
        let err = feature_matrix(&df, &[MONETARY_TOTAL.to_string()]).unwrap_err();
        assert!(matches!(err, SegmentError::Data(_)));
    }

    #[test]
    fn test_feature_matrix_rejects_text() {
        let df = df!(MONETARY_TOTAL => &["lots", "more"]).unwrap();
        let err = feature_matrix(&df, &[MONETARY_TOTAL.to_string()]).unwrap_err();
        assert!(matches!(err, SegmentError::Data(_)));
    }

    #[test]
    fn test_load_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "User_Id,Trx_Age,Trx_Rank,Trx_Vlu").unwrap();
        writeln!(file, "1,5,1,10.5").unwrap();
        writeln!(file, "2,8,1,99.0").unwrap();

        let df = load_csv(file.path()).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(classify(&df).unwrap(), TableKind::RawTransactions);
    }

    #[test]
    fn test_load_csv_missing_file() {
        let err = load_csv("/definitely/not/here.csv").unwrap_err();
        assert!(matches!(err, SegmentError::Resource(_)));
    }
}
