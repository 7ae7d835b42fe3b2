use super::{Change, ChangeType};
use crate::error::Error;
use crate::sql::{quote_ident, quote_list};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A column in `createTable` or `addColumn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub data_type: String,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    /// SQL expression used as the column default, e.g. `0`, `'n/a'` or `CURRENT_TIMESTAMP`.
    #[serde(
        default,
        deserialize_with = "crate::parser::optional_scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_value: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            unique: false,
            primary_key: false,
            default_value: None,
        }
    }

    fn render(&self, inline_primary_key: bool) -> String {
        let mut sql = quote_ident(&self.name);
        if !self.data_type.is_empty() {
            sql.push(' ');
            sql.push_str(&self.data_type);
        }
        if inline_primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default_value {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// A table-level foreign key in `createTable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ForeignKeyDef {
    pub columns: Vec<String>,
    pub referenced_table: String,
    /// Empty means the referenced table's primary key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_columns: Vec<String>,
}

/// `createTable`
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateTableParams {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    /// Table-level primary key, for composite keys or an explicit key order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl ChangeType for CreateTable {
    type Params = CreateTableParams;
    const NAME: &'static str = "createTable";

    fn check(&self, params: &Self::Params) -> Result<(), String> {
        if params.columns.is_empty() {
            return Err(format!("table '{}' must declare at least one column", params.table_name));
        }
        let flagged = params.columns.iter().any(|c| c.primary_key);
        if flagged && !params.primary_key.is_empty() {
            return Err("declare the primary key either on columns or as primaryKey, not both".to_string());
        }
        for name in params
            .primary_key
            .iter()
            .chain(params.foreign_keys.iter().flat_map(|fk| fk.columns.iter()))
        {
            if !params.columns.iter().any(|c| &c.name == name) {
                return Err(format!("column '{}' is not declared in table '{}'", name, params.table_name));
            }
        }
        Ok(())
    }

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        let flagged: Vec<String> = params
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        let inline = params.primary_key.is_empty() && flagged.len() == 1;

        let mut parts: Vec<String> = params
            .columns
            .iter()
            .map(|c| c.render(inline && c.primary_key))
            .collect();

        let table_key = if params.primary_key.is_empty() && !inline {
            flagged
        } else {
            params.primary_key.clone()
        };
        if !table_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", quote_list(&table_key)));
        }
        for fk in &params.foreign_keys {
            let mut clause = format!(
                "FOREIGN KEY ({}) REFERENCES {}",
                quote_list(&fk.columns),
                quote_ident(&fk.referenced_table)
            );
            if !fk.referenced_columns.is_empty() {
                clause.push_str(&format!(" ({})", quote_list(&fk.referenced_columns)));
            }
            parts.push(clause);
        }

        vec![format!(
            "CREATE TABLE {} ({})",
            quote_ident(&params.table_name),
            parts.join(", ")
        )]
    }

    fn inverse(&self, params: &Self::Params) -> Result<Option<Vec<Change>>, Error> {
        Ok(Some(vec![Change::of::<DropTable>(&DropTableParams {
            table_name: params.table_name.clone(),
            if_exists: false,
        })?]))
    }

    fn describe(&self, params: &Self::Params) -> String {
        format!("createTable {}", params.table_name)
    }
}

/// `dropTable`
#[derive(Debug, Clone, Copy, Default)]
pub struct DropTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DropTableParams {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub if_exists: bool,
}

impl ChangeType for DropTable {
    type Params = DropTableParams;
    const NAME: &'static str = "dropTable";

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        let if_exists = if params.if_exists { "IF EXISTS " } else { "" };
        vec![format!("DROP TABLE {}{}", if_exists, quote_ident(&params.table_name))]
    }

    fn describe(&self, params: &Self::Params) -> String {
        format!("dropTable {}", params.table_name)
    }
}

/// `renameTable`
#[derive(Debug, Clone, Copy, Default)]
pub struct RenameTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenameTableParams {
    pub old_table_name: String,
    pub new_table_name: String,
}

impl ChangeType for RenameTable {
    type Params = RenameTableParams;
    const NAME: &'static str = "renameTable";

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&params.old_table_name),
            quote_ident(&params.new_table_name)
        )]
    }

    fn inverse(&self, params: &Self::Params) -> Result<Option<Vec<Change>>, Error> {
        Ok(Some(vec![Change::of::<RenameTable>(&RenameTableParams {
            old_table_name: params.new_table_name.clone(),
            new_table_name: params.old_table_name.clone(),
        })?]))
    }

    fn describe(&self, params: &Self::Params) -> String {
        format!("renameTable {} to {}", params.old_table_name, params.new_table_name)
    }
}

/// `addColumn`
#[derive(Debug, Clone, Copy, Default)]
pub struct AddColumn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddColumnParams {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
}

impl ChangeType for AddColumn {
    type Params = AddColumnParams;
    const NAME: &'static str = "addColumn";

    fn check(&self, params: &Self::Params) -> Result<(), String> {
        if params.columns.is_empty() {
            return Err("addColumn needs at least one column".to_string());
        }
        // SQLite cannot add key or unique columns in place
        if let Some(column) = params.columns.iter().find(|c| c.primary_key || c.unique) {
            return Err(format!(
                "column '{}' cannot be added as PRIMARY KEY or UNIQUE; create an index instead",
                column.name
            ));
        }
        Ok(())
    }

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        params
            .columns
            .iter()
            .map(|column| {
                format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(&params.table_name),
                    column.render(false)
                )
            })
            .collect()
    }

    fn inverse(&self, params: &Self::Params) -> Result<Option<Vec<Change>>, Error> {
        Ok(Some(
            params
                .columns
                .iter()
                .rev()
                .map(|column| {
                    Change::of::<DropColumn>(&DropColumnParams {
                        table_name: params.table_name.clone(),
                        column_name: column.name.clone(),
                    })
                })
                .collect::<Result<_, _>>()?,
        ))
    }

    fn describe(&self, params: &Self::Params) -> String {
        let names: Vec<&str> = params.columns.iter().map(|c| c.name.as_str()).collect();
        format!("addColumn {}({})", params.table_name, names.join(", "))
    }
}

/// `dropColumn`
#[derive(Debug, Clone, Copy, Default)]
pub struct DropColumn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DropColumnParams {
    pub table_name: String,
    pub column_name: String,
}

impl ChangeType for DropColumn {
    type Params = DropColumnParams;
    const NAME: &'static str = "dropColumn";

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(&params.table_name),
            quote_ident(&params.column_name)
        )]
    }

    fn describe(&self, params: &Self::Params) -> String {
        format!("dropColumn {}.{}", params.table_name, params.column_name)
    }
}

/// `renameColumn`
#[derive(Debug, Clone, Copy, Default)]
pub struct RenameColumn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenameColumnParams {
    pub table_name: String,
    pub old_column_name: String,
    pub new_column_name: String,
}

impl ChangeType for RenameColumn {
    type Params = RenameColumnParams;
    const NAME: &'static str = "renameColumn";

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote_ident(&params.table_name),
            quote_ident(&params.old_column_name),
            quote_ident(&params.new_column_name)
        )]
    }

    fn inverse(&self, params: &Self::Params) -> Result<Option<Vec<Change>>, Error> {
        Ok(Some(vec![Change::of::<RenameColumn>(&RenameColumnParams {
            table_name: params.table_name.clone(),
            old_column_name: params.new_column_name.clone(),
            new_column_name: params.old_column_name.clone(),
        })?]))
    }

    fn describe(&self, params: &Self::Params) -> String {
        format!(
            "renameColumn {}.{} to {}",
            params.table_name, params.old_column_name, params.new_column_name
        )
    }
}

/// `createIndex`
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateIndex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateIndexParams {
    pub index_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

impl ChangeType for CreateIndex {
    type Params = CreateIndexParams;
    const NAME: &'static str = "createIndex";

    fn check(&self, params: &Self::Params) -> Result<(), String> {
        if params.columns.is_empty() {
            return Err(format!("index '{}' must cover at least one column", params.index_name));
        }
        Ok(())
    }

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        let unique = if params.unique { "UNIQUE " } else { "" };
        vec![format!(
            "CREATE {}INDEX {} ON {} ({})",
            unique,
            quote_ident(&params.index_name),
            quote_ident(&params.table_name),
            quote_list(&params.columns)
        )]
    }

    fn inverse(&self, params: &Self::Params) -> Result<Option<Vec<Change>>, Error> {
        Ok(Some(vec![Change::of::<DropIndex>(&DropIndexParams {
            index_name: params.index_name.clone(),
        })?]))
    }

    fn describe(&self, params: &Self::Params) -> String {
        format!("createIndex {} on {}", params.index_name, params.table_name)
    }
}

/// `dropIndex`
#[derive(Debug, Clone, Copy, Default)]
pub struct DropIndex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DropIndexParams {
    pub index_name: String,
}

impl ChangeType for DropIndex {
    type Params = DropIndexParams;
    const NAME: &'static str = "dropIndex";

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        vec![format!("DROP INDEX {}", quote_ident(&params.index_name))]
    }

    fn describe(&self, params: &Self::Params) -> String {
        format!("dropIndex {}", params.index_name)
    }
}

/// `sql`: raw SQL, run as one batch. Never reversible automatically.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sql;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SqlParams {
    pub sql: String,
}

impl ChangeType for Sql {
    type Params = SqlParams;
    const NAME: &'static str = "sql";

    fn check(&self, params: &Self::Params) -> Result<(), String> {
        if params.sql.trim().is_empty() {
            return Err("sql must not be empty".to_string());
        }
        Ok(())
    }

    fn statements(&self, params: &Self::Params) -> Vec<String> {
        vec![params.sql.clone()]
    }

    fn describe(&self, _params: &Self::Params) -> String {
        "sql".to_string()
    }
}
