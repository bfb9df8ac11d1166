//! Derived reports recomputed by full replace after every load.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{CellValue, Row};
use crate::entity::{Column, ColumnType};

pub const USER_SUMMARY_COLUMNS: [Column; 7] = [
    Column::required("user_id", ColumnType::Integer),
    Column::required("first_name", ColumnType::Text),
    Column::required("total_spent", ColumnType::Float),
    Column::required("total_items", ColumnType::Integer),
    Column::required("age", ColumnType::Integer),
    Column::required("city", ColumnType::Text),
    Column::required("last_updated", ColumnType::Timestamp),
];

pub const CATEGORY_SUMMARY_COLUMNS: [Column; 4] = [
    Column::required("category", ColumnType::Text),
    Column::required("total_sales", ColumnType::Float),
    Column::required("total_items_sold", ColumnType::Integer),
    Column::required("last_updated", ColumnType::Timestamp),
];

pub const CART_DETAILS_COLUMNS: [Column; 6] = [
    Column::required("cart_id", ColumnType::Integer),
    Column::required("user_id", ColumnType::Integer),
    Column::required("product_id", ColumnType::Integer),
    Column::required("quantity", ColumnType::Integer),
    Column::required("price", ColumnType::Float),
    Column::required("total_cart_value", ColumnType::Float),
];

/// Row counts of the rebuilt report tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCounts {
    pub user_summary: u64,
    pub category_summary: u64,
    pub cart_details: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reports {
    pub user_summary: Vec<Row>,
    pub category_summary: Vec<Row>,
    pub cart_details: Vec<Row>,
}

impl Reports {
    pub fn counts(&self) -> ReportCounts {
        ReportCounts {
            user_summary: self.user_summary.len() as u64,
            category_summary: self.category_summary.len() as u64,
            cart_details: self.cart_details.len() as u64,
        }
    }
}

fn int(row: &Row, idx: usize) -> i64 {
    row.get(idx).and_then(CellValue::as_i64).unwrap_or_default()
}

fn float(row: &Row, idx: usize) -> f64 {
    row.get(idx).and_then(CellValue::as_f64).unwrap_or_default()
}

fn cell(row: &Row, idx: usize) -> CellValue {
    row.get(idx).cloned().unwrap_or(CellValue::Null)
}

/// Compute all reports from target-table rows in users/products/carts column order.
pub fn build_reports(
    users: &[Row],
    products: &[Row],
    carts: &[Row],
    now: DateTime<Utc>,
) -> Reports {
    Reports {
        user_summary: user_summary(users, carts),
        category_summary: category_summary(products, carts, now),
        cart_details: cart_details(carts),
    }
}

/// Per-user spend and item totals, highest spenders first.
pub fn user_summary(users: &[Row], carts: &[Row]) -> Vec<Row> {
    let mut totals: BTreeMap<i64, (f64, i64)> = BTreeMap::new();
    for cart in carts {
        let entry = totals.entry(int(cart, 1)).or_default();
        entry.0 += float(cart, 5);
        entry.1 += int(cart, 3);
    }

    let mut rows: Vec<(f64, Row)> = users
        .iter()
        .map(|u| {
            let (spent, items) = totals.get(&int(u, 0)).copied().unwrap_or_default();
            let row = Row(vec![
                cell(u, 0),
                cell(u, 1),
                CellValue::Float(spent),
                CellValue::Integer(items),
                cell(u, 4),
                cell(u, 6),
                cell(u, 8),
            ]);
            (spent, row)
        })
        .collect();

    rows.sort_by(|a, b| b.0.total_cmp(&a.0));
    rows.into_iter().map(|(_, row)| row).collect()
}

/// Sales per product category, joining cart lines to products on product id.
pub fn category_summary(products: &[Row], carts: &[Row], now: DateTime<Utc>) -> Vec<Row> {
    let categories: BTreeMap<i64, String> = products
        .iter()
        .filter_map(|p| {
            p.get(2)
                .and_then(CellValue::as_str)
                .map(|c| (int(p, 0), c.to_string()))
        })
        .collect();

    let mut totals: BTreeMap<&str, (f64, i64)> = BTreeMap::new();
    for cart in carts {
        if let Some(category) = categories.get(&int(cart, 2)) {
            let entry = totals.entry(category.as_str()).or_default();
            entry.0 += float(cart, 5);
            entry.1 += int(cart, 3);
        }
    }

    let mut rows: Vec<(f64, Row)> = totals
        .into_iter()
        .map(|(category, (sales, items))| {
            let row = Row(vec![
                CellValue::Text(category.to_string()),
                CellValue::Float(sales),
                CellValue::Integer(items),
                CellValue::Timestamp(now),
            ]);
            (sales, row)
        })
        .collect();

    rows.sort_by(|a, b| b.0.total_cmp(&a.0));
    rows.into_iter().map(|(_, row)| row).collect()
}

/// Cart line items without the load timestamp, ordered by cart then product.
pub fn cart_details(carts: &[Row]) -> Vec<Row> {
    let mut rows: Vec<Row> = carts
        .iter()
        .map(|c| Row((0..6).map(|i| cell(c, i)).collect()))
        .collect();
    rows.sort_by_key(|r| (int(r, 0), int(r, 2)));
    rows
}
