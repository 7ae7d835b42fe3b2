//! Change operations and the registry mapping change-type names to their handlers.
//!
//! Every change in a change set is stored as its type name plus a JSON parameter object.
//! The [ChangeRegistry] is populated explicitly at startup ([ChangeRegistry::builtin])
//! and resolves a name to the [ChangeHandler] that validates the parameters, generates
//! SQLite statements and, when possible, derives the inverse changes used for rollback.

mod builtin;

pub use builtin::{
    AddColumn, AddColumnParams, ColumnDef, CreateIndex, CreateIndexParams, CreateTable,
    CreateTableParams, DropColumn, DropColumnParams, DropIndex, DropIndexParams, DropTable,
    DropTableParams, ForeignKeyDef, RenameColumn, RenameColumnParams, RenameTable,
    RenameTableParams, Sql, SqlParams,
};

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A single schema change: a change-type name and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: String,
    pub params: Value,
}

impl Change {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    /// Build a change from typed parameters of a registered change type.
    pub fn of<T: ChangeType>(params: &T::Params) -> Result<Self, Error>
    where
        T::Params: Serialize,
    {
        Ok(Self::new(T::NAME, serde_json::to_value(params)?))
    }
}

// A change serializes as a single-entry map, `{ createTable: { ... } }`, matching the document format.
impl Serialize for Change {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.kind, &self.params)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Change {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = std::collections::BTreeMap::<String, Value>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(serde::de::Error::custom(format!(
                "a change must have exactly one change type, found {}",
                map.len()
            )));
        }
        let (kind, params) = map
            .into_iter()
            .next()
            .ok_or_else(|| serde::de::Error::custom("empty change"))?;
        Ok(Self { kind, params })
    }
}

/// Object-safe handler stored in the registry.
pub trait ChangeHandler: Send + Sync {
    /// Check the parameters without generating anything.
    fn validate(&self, params: &Value) -> Result<(), String>;

    /// SQLite statements implementing the change, in execution order.
    fn statements(&self, params: &Value) -> Result<Vec<String>, String>;

    /// Changes that undo this one, or `None` when the change cannot be reversed automatically.
    fn inverse(&self, params: &Value) -> Result<Option<Vec<Change>>, String>;

    /// Short human-readable summary, stored in the tracker's description column.
    fn describe(&self, params: &Value) -> String;
}

/// Typed definition of a change type. Implementing this is the usual way to add a handler;
/// parameters are deserialized from the change's JSON object.
pub trait ChangeType: Send + Sync + 'static {
    type Params: DeserializeOwned;

    /// The name used in change-log documents, e.g. `createTable`.
    const NAME: &'static str;

    fn statements(&self, params: &Self::Params) -> Vec<String>;

    fn inverse(&self, _params: &Self::Params) -> Result<Option<Vec<Change>>, Error> {
        Ok(None)
    }

    fn describe(&self, _params: &Self::Params) -> String {
        Self::NAME.to_string()
    }

    /// Extra semantic checks beyond deserialization.
    fn check(&self, _params: &Self::Params) -> Result<(), String> {
        Ok(())
    }
}

fn decode<P: DeserializeOwned>(params: &Value) -> Result<P, String> {
    serde_json::from_value(params.clone()).map_err(|e| e.to_string())
}

impl<T: ChangeType> ChangeHandler for T {
    fn validate(&self, params: &Value) -> Result<(), String> {
        let params = decode::<T::Params>(params)?;
        self.check(&params)
    }

    fn statements(&self, params: &Value) -> Result<Vec<String>, String> {
        Ok(ChangeType::statements(self, &decode::<T::Params>(params)?))
    }

    fn inverse(&self, params: &Value) -> Result<Option<Vec<Change>>, String> {
        ChangeType::inverse(self, &decode::<T::Params>(params)?).map_err(|e| e.to_string())
    }

    fn describe(&self, params: &Value) -> String {
        match decode::<T::Params>(params) {
            Ok(params) => ChangeType::describe(self, &params),
            Err(_) => T::NAME.to_string(),
        }
    }
}

/// Capability table from change-type name to handler.
#[derive(Clone, Default)]
pub struct ChangeRegistry {
    handlers: HashMap<String, Arc<dyn ChangeHandler>>,
}

impl std::fmt::Debug for ChangeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.names();
        names.sort();
        f.debug_struct("ChangeRegistry")
            .field("handlers", &names)
            .finish()
    }
}

impl ChangeRegistry {
    /// An empty registry. Most callers want [ChangeRegistry::builtin].
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding every built-in change type.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry
            .register_type(CreateTable)
            .register_type(DropTable)
            .register_type(RenameTable)
            .register_type(AddColumn)
            .register_type(DropColumn)
            .register_type(RenameColumn)
            .register_type(CreateIndex)
            .register_type(DropIndex)
            .register_type(Sql);
        registry
    }

    /// Register a typed change under its [ChangeType::NAME]. Replaces any previous handler.
    pub fn register_type<T: ChangeType>(&mut self, change_type: T) -> &mut Self {
        self.register(T::NAME, Arc::new(change_type))
    }

    /// Register a handler under an arbitrary name. Replaces any previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ChangeHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ChangeHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    fn handler(&self, change: &Change) -> Result<&Arc<dyn ChangeHandler>, String> {
        self.get(&change.kind)
            .ok_or_else(|| format!("unknown change type '{}'", change.kind))
    }

    pub fn validate(&self, change: &Change) -> Result<(), String> {
        self.handler(change)?.validate(&change.params)
    }

    pub fn statements(&self, change: &Change) -> Result<Vec<String>, String> {
        self.handler(change)?.statements(&change.params)
    }

    pub fn inverse(&self, change: &Change) -> Result<Option<Vec<Change>>, String> {
        self.handler(change)?.inverse(&change.params)
    }

    pub fn describe(&self, change: &Change) -> String {
        match self.get(&change.kind) {
            Some(handler) => handler.describe(&change.params),
            None => change.kind.clone(),
        }
    }

    /// Inverse of a whole list of changes: each change's inverse, in reverse order.
    /// Returns `None` as soon as one change has no automatic inverse.
    pub fn invert_all(&self, changes: &[Change]) -> Result<Option<Vec<Change>>, String> {
        let mut reversed = Vec::new();
        for change in changes.iter().rev() {
            match self.inverse(change)? {
                Some(inverse) => reversed.extend(inverse),
                None => return Ok(None),
            }
        }
        Ok(Some(reversed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_round_trips_as_single_entry_map() {
        let change: Change =
            serde_yaml::from_str("createTable:\n  tableName: users\n  columns: []\n").unwrap();
        assert_eq!(change.kind, "createTable");
        assert_eq!(change.params, json!({"tableName": "users", "columns": []}));

        let yaml = serde_yaml::to_string(&change).unwrap();
        assert!(yaml.starts_with("createTable:"));
    }

    #[test]
    fn change_with_two_types_is_rejected() {
        let result: Result<Change, _> =
            serde_yaml::from_str("dropTable: {tableName: a}\ndropIndex: {indexName: b}\n");
        assert!(result.is_err());
    }

    #[test]
    fn custom_handlers_can_be_registered() {
        struct Vacuum;
        #[derive(Deserialize)]
        struct NoParams {}
        impl ChangeType for Vacuum {
            type Params = NoParams;
            const NAME: &'static str = "vacuum";
            fn statements(&self, _params: &NoParams) -> Vec<String> {
                vec!["VACUUM".to_string()]
            }
        }

        let mut registry = ChangeRegistry::builtin();
        assert!(!registry.contains("vacuum"));
        registry.register_type(Vacuum);
        let change = Change::new("vacuum", json!({}));
        assert_eq!(registry.statements(&change).unwrap(), vec!["VACUUM"]);
        assert_eq!(registry.inverse(&change).unwrap(), None);
    }

    #[test]
    fn unserializable_params_are_an_error() {
        struct Opaque;
        #[derive(Deserialize)]
        struct Handle {}
        impl Serialize for Handle {
            fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("handles cannot be serialized"))
            }
        }
        impl ChangeType for Opaque {
            type Params = Handle;
            const NAME: &'static str = "opaque";
            fn statements(&self, _params: &Handle) -> Vec<String> {
                Vec::new()
            }
        }

        match Change::of::<Opaque>(&Handle {}) {
            Err(Error::Serialization(message)) => assert!(message.contains("handles cannot be serialized")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn unknown_change_type_is_an_error() {
        let registry = ChangeRegistry::builtin();
        let change = Change::new("teleportTable", json!({}));
        assert!(registry.validate(&change).is_err());
        assert_eq!(registry.describe(&change), "teleportTable");
    }

    #[test]
    fn invert_all_reverses_order() {
        let registry = ChangeRegistry::builtin();
        let changes = vec![
            Change::new(
                "createTable",
                json!({"tableName": "users", "columns": [{"name": "id", "type": "INTEGER"}]}),
            ),
            Change::new(
                "createIndex",
                json!({"indexName": "idx_users_id", "tableName": "users", "columns": ["id"]}),
            ),
        ];
        let inverse = registry.invert_all(&changes).unwrap().unwrap();
        assert_eq!(inverse[0].kind, "dropIndex");
        assert_eq!(inverse[1].kind, "dropTable");

        let with_sql = vec![Change::new("sql", json!({"sql": "DELETE FROM users"}))];
        assert_eq!(registry.invert_all(&with_sql).unwrap(), None);
    }
}
