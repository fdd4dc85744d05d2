//! DML request descriptors.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dml;
use crate::error::{Error, Result};
use crate::uri;
use crate::value::{Attr, Value};

/// Statement kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Query,
    Insert,
    Update,
    Delete,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Query => uri::QUERY_NSS,
            Kind::Insert => uri::INSERT_NSS,
            Kind::Update => uri::UPDATE_NSS,
            Kind::Delete => uri::DELETE_NSS,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to build one statement for a resource.
///
/// Only the payload matching `kind` is used: `values` for inserts, `attrs`
/// and `where_` for updates, `where_` for queries and deletes. The payload is
/// fixed at construction; only `last_error` changes afterwards.
#[derive(Debug)]
pub struct Request {
    kind: Kind,
    uri: String,
    template: String,
    values: Vec<Vec<Value>>,
    attrs: Vec<Attr>,
    where_: Vec<Attr>,
    last_error: Option<Error>,
}

impl Request {
    fn new(kind: Kind, uri: String, template: &str) -> Self {
        Self {
            kind,
            uri,
            template: template.to_string(),
            values: Vec::new(),
            attrs: Vec::new(),
            where_: Vec::new(),
            last_error: None,
        }
    }

    pub fn query(resource: &str, template: &str, where_: Vec<Attr>) -> Self {
        Self {
            where_,
            ..Self::new(Kind::Query, uri::build_query_uri(resource), template)
        }
    }

    /// Query whose predicates come from multi-valued parameters, see
    /// [`dml::build_where`].
    pub fn query_from_values(
        resource: &str,
        template: &str,
        values: &HashMap<String, Vec<String>>,
    ) -> Self {
        Self::query(resource, template, dml::build_where(values))
    }

    pub fn insert(resource: &str, template: &str, values: Vec<Vec<Value>>) -> Self {
        Self {
            values,
            ..Self::new(Kind::Insert, uri::build_insert_uri(resource), template)
        }
    }

    pub fn update(resource: &str, template: &str, attrs: Vec<Attr>, where_: Vec<Attr>) -> Self {
        Self {
            attrs,
            where_,
            ..Self::new(Kind::Update, uri::build_update_uri(resource), template)
        }
    }

    pub fn delete(resource: &str, template: &str, where_: Vec<Attr>) -> Self {
        Self {
            where_,
            ..Self::new(Kind::Delete, uri::build_delete_uri(resource), template)
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Insert rows
    pub fn values(&self) -> &[Vec<Value>] {
        &self.values
    }

    /// Update assignments
    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    /// Predicates, joined with `AND`
    pub fn where_clause(&self) -> &[Attr] {
        &self.where_
    }

    /// Error recorded by the last [`build_sql`](Self::build_sql) call.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub(crate) fn take_last_error(&mut self) -> Option<Error> {
        self.last_error.take()
    }

    pub fn validate(&self) -> Result<()> {
        if self.uri.is_empty() {
            return Err(Error::MissingField { field: "uri" });
        }
        if self.template.is_empty() {
            return Err(Error::MissingField { field: "template" });
        }
        match self.kind {
            Kind::Update if self.attrs.is_empty() => {
                Err(Error::malformed("update set clause is empty"))
            }
            Kind::Update | Kind::Delete if self.where_.is_empty() => Err(Error::malformed(
                format!("{} where clause is empty", self.kind),
            )),
            _ => Ok(()),
        }
    }

    /// Expands the template with the request payload.
    ///
    /// Empty insert values, or an update/delete missing a clause, skip
    /// expansion and return the template as is. Expansion errors are stored
    /// in [`last_error`](Self::last_error) and the template is returned.
    pub fn build_sql(&mut self) -> String {
        let expanded = match self.kind {
            Kind::Query => Some(dml::expand_select(&self.template, &self.where_)),
            Kind::Insert if !self.values.is_empty() => {
                Some(dml::write_insert(&self.template, &self.values))
            }
            Kind::Update if !self.attrs.is_empty() && !self.where_.is_empty() => {
                Some(dml::write_update(&self.template, &self.attrs, &self.where_))
            }
            Kind::Delete if !self.where_.is_empty() => {
                Some(dml::write_delete(&self.template, &self.where_))
            }
            _ => None,
        };

        self.last_error = None;
        match expanded {
            Some(Ok(sql)) => sql,
            Some(Err(err)) => {
                self.last_error = Some(err);
                self.template.clone()
            }
            None => self.template.clone(),
        }
    }

    /// Structured values in placeholder order, ready to pass as execution
    /// arguments.
    pub fn args(&self) -> Vec<Value> {
        match self.kind {
            Kind::Insert => self.values.iter().flatten().cloned().collect(),
            Kind::Update => self
                .attrs
                .iter()
                .chain(self.where_.iter())
                .map(|attr| attr.value.clone())
                .collect(),
            Kind::Query | Kind::Delete => {
                self.where_.iter().map(|attr| attr.value.clone()).collect()
            }
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}
