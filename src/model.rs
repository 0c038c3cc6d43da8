//! Declarative models.
//!
//! A model is registered explicitly through [`ModelBuilder`]; the result is
//! shared as `Arc<Model>` and attached to every [`Table`] minted from it so
//! columns come out typed.
//!
//! ```ignore
//! let users = Model::builder("users")
//!     .field(Field::integer("id").primary_key())
//!     .field(Field::text("username"))
//!     .build();
//! let tweets = Model::builder("tweets")
//!     .field(Field::integer("id").primary_key())
//!     .foreign_key(Field::integer("user").column_name("user_id"), &users, "id", "tweets")
//!     .build();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ast::field::Field;
use crate::ast::types::{Column, Table};
use crate::ast::value::Value;
use crate::error::Result;
use crate::query::Select;

/// Relationship declared on the model holding the foreign key column.
#[derive(Clone)]
pub struct ForeignKey {
    /// Field name on the declaring model.
    pub field: String,
    /// Related model; `None` points back at the declaring model.
    pub related: Option<Arc<Model>>,
    pub related_field: String,
    /// Attribute the related model exposes for the reverse direction.
    pub backref: String,
}

impl fmt::Debug for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignKey")
            .field("field", &self.field)
            .field("related", &self.related.as_ref().map(|m| m.table_name()))
            .field("related_field", &self.related_field)
            .field("backref", &self.backref)
            .finish()
    }
}

impl ForeignKey {
    /// Table name of the model this key points to.
    pub fn related_table<'a>(&'a self, owner: &'a Model) -> &'a str {
        match &self.related {
            Some(model) => model.table_name(),
            None => owner.table_name(),
        }
    }
}

#[derive(Debug)]
pub struct Model {
    table_name: String,
    schema: Option<String>,
    fields: Vec<Arc<Field>>,
    /// Field names and column names → field.
    names: HashMap<String, Arc<Field>>,
    primary_key: Option<Arc<Field>>,
    foreign_keys: Vec<ForeignKey>,
}

impl Model {
    pub fn builder(table_name: &str) -> ModelBuilder {
        ModelBuilder {
            table_name: table_name.to_string(),
            schema: None,
            fields: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[Arc<Field>] {
        &self.fields
    }

    /// Look a field up by field name or column name.
    pub fn field(&self, name: &str) -> Option<&Arc<Field>> {
        self.names.get(name)
    }

    pub fn primary_key(&self) -> Option<&Arc<Field>> {
        self.primary_key.as_ref()
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Foreign key on this model pointing at `table`.
    pub fn foreign_key_to(&self, table: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.related_table(self) == table)
    }

    /// Fields carrying a default value.
    pub fn defaults(&self) -> impl Iterator<Item = (&Arc<Field>, &Value)> {
        self.fields
            .iter()
            .filter_map(|f| f.default.as_ref().map(|d| (f, d)))
    }

    pub fn table(self: &Arc<Self>) -> Table {
        let table = Table::new(&self.table_name).with_model(Arc::clone(self));
        match &self.schema {
            Some(schema) => table.with_schema(schema),
            None => table,
        }
    }

    pub fn c(self: &Arc<Self>, name: &str) -> Column {
        self.table().c(name)
    }

    pub fn column(self: &Arc<Self>, name: &str) -> Result<Column> {
        self.table().column(name)
    }

    /// `SELECT` over this model's table projecting every field.
    pub fn select(self: &Arc<Self>) -> Select {
        let table = self.table();
        let columns: Vec<Column> = self.fields.iter().map(|f| table.c(&f.name)).collect();
        Select::new().from(table).columns(columns)
    }
}

pub struct ModelBuilder {
    table_name: String,
    schema: Option<String>,
    fields: Vec<Field>,
    foreign_keys: Vec<ForeignKey>,
}

impl ModelBuilder {
    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn foreign_key(
        mut self,
        field: Field,
        related: &Arc<Model>,
        related_field: &str,
        backref: &str,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            field: field.name.clone(),
            related: Some(Arc::clone(related)),
            related_field: related_field.to_string(),
            backref: backref.to_string(),
        });
        self.field(field)
    }

    /// Foreign key pointing at the model being built.
    pub fn self_foreign_key(mut self, field: Field, related_field: &str, backref: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            field: field.name.clone(),
            related: None,
            related_field: related_field.to_string(),
            backref: backref.to_string(),
        });
        self.field(field)
    }

    pub fn build(self) -> Arc<Model> {
        let fields: Vec<Arc<Field>> = self
            .fields
            .into_iter()
            .enumerate()
            .map(|(order, mut field)| {
                field.order = order;
                Arc::new(field)
            })
            .collect();

        let mut names = HashMap::new();
        for field in &fields {
            names.insert(field.column_name.clone(), Arc::clone(field));
        }
        // Field names win over column names on collision.
        for field in &fields {
            names.insert(field.name.clone(), Arc::clone(field));
        }

        let primary_key = fields.iter().find(|f| f.primary_key).cloned();

        Arc::new(Model {
            table_name: self.table_name,
            schema: self.schema,
            fields,
            names,
            primary_key,
            foreign_keys: self.foreign_keys,
        })
    }
}
