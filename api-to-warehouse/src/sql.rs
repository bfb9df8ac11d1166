use crate::config::TableNames;
use crate::entity::{Column, ColumnType, EntitySchema};

/// Quote an identifier for embedding into PostgreSQL statements.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"dataset"."table"`.
pub fn qualified(dataset: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(dataset), quote_ident(table))
}

fn column_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn column_sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Text => "TEXT",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

pub fn create_schema_sql(dataset: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(dataset))
}

pub fn create_table_sql(qualified_table: &str, columns: &[Column], primary_key: &[&str]) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_ident(c.name), column_sql_type(c.ty), null)
        })
        .collect();

    if !primary_key.is_empty() {
        defs.push(format!("PRIMARY KEY ({})", column_list(primary_key)));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_table,
        defs.join(", ")
    )
}

/// Multi-row parameterised INSERT with `$n` placeholders, row-major.
pub fn insert_sql(qualified_table: &str, columns: &[&str], row_count: usize) -> String {
    let width = columns.len();
    let tuples: Vec<String> = (0..row_count)
        .map(|r| {
            let params: Vec<String> = (1..=width).map(|c| format!("${}", r * width + c)).collect();
            format!("({})", params.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified_table,
        column_list(columns),
        tuples.join(", ")
    )
}

/// Set-based upsert from staging into target keyed on the schema's merge key.
///
/// Returns one row per affected target row with a boolean `inserted` column.
pub fn merge_sql(qualified_target: &str, qualified_staging: &str, schema: &EntitySchema) -> String {
    let columns = column_list(&schema.column_names());
    let keys = column_list(&schema.merge_key_columns());
    let updates: Vec<String> = schema
        .update_columns()
        .iter()
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();

    format!(
        "INSERT INTO {target} AS t ({columns}) \
         SELECT {columns} FROM {staging} \
         ON CONFLICT ({keys}) DO UPDATE SET {updates} \
         RETURNING (xmax = 0) AS inserted",
        target = qualified_target,
        staging = qualified_staging,
        columns = columns,
        keys = keys,
        updates = updates.join(", "),
    )
}

pub fn count_sql(qualified_table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", qualified_table)
}

pub fn max_sql(qualified_table: &str, column: &str) -> String {
    format!("SELECT MAX({}) FROM {}", quote_ident(column), qualified_table)
}

pub fn last_ledger_run_sql(qualified_ledger: &str) -> String {
    format!(
        "SELECT MAX(\"last_run_timestamp\") FROM {} WHERE \"data_type\" = $1 AND \"status\" = $2",
        qualified_ledger
    )
}

/// `(table, DROP + CREATE AS statement)` for each derived report.
pub fn report_statements(dataset: &str, tables: &TableNames) -> Vec<(String, String)> {
    let users = qualified(dataset, &tables.users.target);
    let products = qualified(dataset, &tables.products.target);
    let carts = qualified(dataset, &tables.carts.target);

    let user_summary = qualified(dataset, &tables.user_summary);
    let category_summary = qualified(dataset, &tables.category_summary);
    let cart_details = qualified(dataset, &tables.cart_details);

    vec![
        (
            user_summary.clone(),
            format!(
                "CREATE TABLE {user_summary} AS \
                 WITH cart_totals AS ( \
                     SELECT user_id, SUM(total_cart_value) AS total_spent, \
                            SUM(quantity) AS total_items \
                     FROM {carts} GROUP BY user_id \
                 ) \
                 SELECT u.user_id, u.first_name, \
                        COALESCE(ct.total_spent, 0) AS total_spent, \
                        COALESCE(ct.total_items, 0) AS total_items, \
                        u.age, u.city, u.load_timestamp AS last_updated \
                 FROM {users} u LEFT JOIN cart_totals ct ON u.user_id = ct.user_id \
                 ORDER BY total_spent DESC"
            ),
        ),
        (
            category_summary.clone(),
            format!(
                "CREATE TABLE {category_summary} AS \
                 SELECT p.category, SUM(c.total_cart_value) AS total_sales, \
                        SUM(c.quantity) AS total_items_sold, NOW() AS last_updated \
                 FROM {products} p JOIN {carts} c ON p.product_id = c.product_id \
                 GROUP BY p.category \
                 ORDER BY total_sales DESC"
            ),
        ),
        (
            cart_details.clone(),
            format!(
                "CREATE TABLE {cart_details} AS \
                 SELECT c.cart_id, c.user_id, c.product_id, c.quantity, c.price, \
                        c.total_cart_value \
                 FROM {carts} c \
                 ORDER BY c.cart_id, c.product_id"
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("users_table"), "\"users_table\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("analytics", "users"), "\"analytics\".\"users\"");
    }

    #[test]
    fn insert_placeholders_are_row_major() {
        let sql = insert_sql("\"d\".\"t\"", &["a", "b"], 2);
        assert_eq!(
            sql,
            "INSERT INTO \"d\".\"t\" (\"a\", \"b\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn create_table_declares_primary_key_and_nullability() {
        let schema = Entity::Carts.schema();
        let sql = create_table_sql("\"d\".\"carts\"", schema.columns, &schema.merge_key_columns());
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"d\".\"carts\""));
        assert!(sql.contains("\"price\" DOUBLE PRECISION NOT NULL"));
        assert!(sql.contains("\"load_timestamp\" TIMESTAMPTZ NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (\"cart_id\", \"product_id\")"));

        let staging = create_table_sql("\"d\".\"s\"", schema.columns, &[]);
        assert!(!staging.contains("PRIMARY KEY"));
    }

    #[test]
    fn merge_updates_every_non_key_column() {
        let sql = merge_sql(
            "\"d\".\"users_table\"",
            "\"d\".\"staging_users\"",
            Entity::Users.schema(),
        );
        assert!(sql.contains("ON CONFLICT (\"user_id\")"));
        assert!(sql.contains("\"first_name\" = EXCLUDED.\"first_name\""));
        assert!(sql.contains("\"load_timestamp\" = EXCLUDED.\"load_timestamp\""));
        assert!(!sql.contains("\"user_id\" = EXCLUDED"));
        assert!(sql.contains("FROM \"d\".\"staging_users\""));
    }

    #[test]
    fn report_statements_target_configured_tables() {
        let tables = TableNames::default();
        let statements = report_statements("analytics", &tables);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].0, "\"analytics\".\"user_summary\"");
        assert!(statements[0].1.contains("LEFT JOIN"));
        assert!(statements[1].1.contains("GROUP BY p.category"));
        assert!(statements[2].1.contains("ORDER BY c.cart_id, c.product_id"));
    }
}
