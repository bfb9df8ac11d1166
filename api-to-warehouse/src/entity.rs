use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the record collections the pipeline ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Users,
    Products,
    Carts,
}

impl Entity {
    pub const ALL: [Entity; 3] = [Entity::Users, Entity::Products, Entity::Carts];

    /// Name used for the API payload field, snapshot prefix and ledger rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Users => "users",
            Entity::Products => "products",
            Entity::Carts => "carts",
        }
    }

    pub fn schema(&self) -> &'static EntitySchema {
        match self {
            Entity::Users => &USERS_SCHEMA,
            Entity::Products => &PRODUCTS_SCHEMA,
            Entity::Carts => &CARTS_SCHEMA,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
        }
    }

    pub const fn nullable(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
        }
    }
}

/// Per-entity table layout: ordered columns, the watermark column and the merge key.
///
/// Update and insert column lists for the merge are derived from this descriptor;
/// nothing is selected by matching on table names.
#[derive(Debug)]
pub struct EntitySchema {
    pub columns: &'static [Column],
    /// Index of the integer column whose maximum is the entity's watermark.
    pub watermark: usize,
    /// Indices of the columns that uniquely identify a target row.
    pub merge_key: &'static [usize],
}

impl EntitySchema {
    pub fn watermark_column(&self) -> &'static str {
        self.columns[self.watermark].name
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn merge_key_columns(&self) -> Vec<&'static str> {
        self.merge_key.iter().map(|&i| self.columns[i].name).collect()
    }

    /// Columns overwritten when a staged row matches an existing target row.
    pub fn update_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.merge_key.contains(i))
            .map(|(_, c)| c.name)
            .collect()
    }
}

use ColumnType::{Float, Integer, Text, Timestamp};

const USERS_COLUMNS: [Column; 9] = [
    Column::required("user_id", Integer),
    Column::required("first_name", Text),
    Column::required("last_name", Text),
    Column::required("gender", Text),
    Column::required("age", Integer),
    Column::required("street", Text),
    Column::required("city", Text),
    Column::required("postal_code", Text),
    Column::required("load_timestamp", Timestamp),
];

const PRODUCTS_COLUMNS: [Column; 6] = [
    Column::required("product_id", Integer),
    Column::required("name", Text),
    Column::required("category", Text),
    Column::required("brand", Text),
    Column::required("price", Float),
    Column::required("load_timestamp", Timestamp),
];

const CARTS_COLUMNS: [Column; 7] = [
    Column::required("cart_id", Integer),
    Column::required("user_id", Integer),
    Column::required("product_id", Integer),
    Column::required("quantity", Integer),
    Column::required("price", Float),
    Column::required("total_cart_value", Float),
    Column::required("load_timestamp", Timestamp),
];

static USERS_SCHEMA: EntitySchema = EntitySchema {
    columns: &USERS_COLUMNS,
    watermark: 0,
    merge_key: &[0],
};

static PRODUCTS_SCHEMA: EntitySchema = EntitySchema {
    columns: &PRODUCTS_COLUMNS,
    watermark: 0,
    merge_key: &[0],
};

// Carts are exploded to one row per product line, so a cart id alone does not
// identify a row.
static CARTS_SCHEMA: EntitySchema = EntitySchema {
    columns: &CARTS_COLUMNS,
    watermark: 0,
    merge_key: &[0, 2],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_point_at_integer_key_columns() {
        for entity in Entity::ALL {
            let schema = entity.schema();
            assert_eq!(schema.columns[schema.watermark].ty, ColumnType::Integer);
            for &idx in schema.merge_key {
                assert_eq!(schema.columns[idx].ty, ColumnType::Integer);
            }
        }
    }

    #[test]
    fn watermark_columns_match_target_primary_keys() {
        assert_eq!(Entity::Users.schema().watermark_column(), "user_id");
        assert_eq!(Entity::Products.schema().watermark_column(), "product_id");
        assert_eq!(Entity::Carts.schema().watermark_column(), "cart_id");
        assert_eq!(
            Entity::Carts.schema().merge_key_columns(),
            vec!["cart_id", "product_id"]
        );
    }

    #[test]
    fn update_columns_exclude_merge_key() {
        let products = Entity::Products.schema().update_columns();
        assert_eq!(
            products,
            vec!["name", "category", "brand", "price", "load_timestamp"]
        );

        let carts = Entity::Carts.schema().update_columns();
        assert!(!carts.contains(&"cart_id"));
        assert!(!carts.contains(&"product_id"));
        assert!(carts.contains(&"total_cart_value"));
    }
}
