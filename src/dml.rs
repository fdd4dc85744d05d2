//! SQL expansion.
//!
//! Each function appends a generated clause to a caller-supplied template.
//! Values never appear in the output; every value becomes a `$n` placeholder,
//! numbered from `$1` in the order the values must be bound.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::value::{Attr, Value};

/// Appends `WHERE` predicates to a select template. No predicates means no
/// filter and returns the template unchanged.
pub fn expand_select(template: &str, where_: &[Attr]) -> Result<String> {
    if where_.is_empty() {
        return Ok(template.to_string());
    }
    let mut sql = template.to_string();
    write_where(&mut sql, where_, 1)?;
    Ok(sql)
}

/// Appends a `VALUES` list with one placeholder group per row.
pub fn write_insert(template: &str, rows: &[Vec<Value>]) -> Result<String> {
    let Some(first) = rows.first() else {
        return Err(Error::malformed("insert values are empty"));
    };
    let arity = first.len();
    if arity == 0 {
        return Err(Error::malformed("insert row 0 has no values"));
    }

    let mut sql = template.to_string();
    sql.push_str(" VALUES ");
    let mut n = 1;
    for (i, row) in rows.iter().enumerate() {
        if row.len() != arity {
            return Err(Error::malformed(format!(
                "insert row {} has {} values, expected {}",
                i,
                row.len(),
                arity
            )));
        }
        if i > 0 {
            sql.push(',');
        }
        sql.push('(');
        for j in 0..arity {
            if j > 0 {
                sql.push(',');
            }
            sql.push_str(&format!("${}", n));
            n += 1;
        }
        sql.push(')');
    }
    Ok(sql)
}

/// Appends `SET` assignments followed by `WHERE` predicates. Predicate
/// placeholders continue numbering after the assignments.
pub fn write_update(template: &str, attrs: &[Attr], where_: &[Attr]) -> Result<String> {
    if attrs.is_empty() {
        return Err(Error::malformed("update set clause is empty"));
    }
    if where_.is_empty() {
        return Err(Error::malformed("update where clause is empty"));
    }

    let mut sql = template.to_string();
    sql.push_str(" SET ");
    for (i, attr) in attrs.iter().enumerate() {
        check_identifier(&attr.name)?;
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&format!("{} = ${}", attr.name, i + 1));
    }
    write_where(&mut sql, where_, attrs.len() + 1)?;
    Ok(sql)
}

/// Appends `WHERE` predicates to a delete template.
pub fn write_delete(template: &str, where_: &[Attr]) -> Result<String> {
    if where_.is_empty() {
        return Err(Error::malformed("delete where clause is empty"));
    }
    let mut sql = template.to_string();
    write_where(&mut sql, where_, 1)?;
    Ok(sql)
}

/// Builds equality predicates from multi-valued query parameters, such as a
/// decoded URL query string. Keys are sorted so placeholder numbering is
/// stable; only the first value of each key is used.
pub fn build_where(values: &HashMap<String, Vec<String>>) -> Vec<Attr> {
    let mut keys: Vec<&String> = values.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|key| {
            values[key]
                .first()
                .map(|v| Attr::new(key.clone(), v.as_str()))
        })
        .collect()
}

fn write_where(sql: &mut String, where_: &[Attr], start: usize) -> Result<()> {
    sql.push_str(" WHERE ");
    for (i, attr) in where_.iter().enumerate() {
        check_identifier(&attr.name)?;
        if i > 0 {
            sql.push_str(" AND ");
        }
        sql.push_str(&format!("{} = ${}", attr.name, start + i));
    }
    Ok(())
}

/// Column names are written into the SQL text, so they must be plain
/// identifiers: `[A-Za-z_][A-Za-z0-9_]*`, optionally dot-qualified.
pub fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::malformed(format!("invalid column identifier: {:?}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_without_where_is_unchanged() {
        let sql = expand_select("SELECT * FROM users", &[]).unwrap();
        assert_eq!(sql, "SELECT * FROM users");
    }

    #[test]
    fn test_select_where() {
        let where_ = vec![Attr::new("status", "active"), Attr::new("age", 30)];
        let sql = expand_select("SELECT * FROM users", &where_).unwrap();
        assert_eq!(sql, "SELECT * FROM users WHERE status = $1 AND age = $2");
    }

    #[test]
    fn test_insert_two_rows() {
        let rows = vec![
            vec![Value::from("a"), Value::from(1)],
            vec![Value::from("b"), Value::from(2)],
        ];
        let sql = write_insert("INSERT INTO users (name,age)", &rows).unwrap();
        assert_eq!(sql, "INSERT INTO users (name,age) VALUES ($1,$2),($3,$4)");
    }

    #[test]
    fn test_insert_ragged_rows_fail() {
        let rows = vec![
            vec![Value::from("a"), Value::from(1)],
            vec![Value::from("b")],
        ];
        let err = write_insert("INSERT INTO users (name,age)", &rows).unwrap_err();
        assert!(matches!(err, Error::MalformedRequest { .. }));
    }

    #[test]
    fn test_update_numbering_continues_into_where() {
        let attrs = vec![Attr::new("status", "active")];
        let where_ = vec![Attr::new("id", 42)];
        let sql = write_update("UPDATE users", &attrs, &where_).unwrap();
        assert_eq!(sql, "UPDATE users SET status = $1 WHERE id = $2");

        let attrs = vec![Attr::new("a", 1), Attr::new("b", 2), Attr::new("c", 3)];
        let where_ = vec![Attr::new("x", 4), Attr::new("y", 5)];
        let sql = write_update("UPDATE t", &attrs, &where_).unwrap();
        assert_eq!(
            sql,
            "UPDATE t SET a = $1, b = $2, c = $3 WHERE x = $4 AND y = $5"
        );
    }

    #[test]
    fn test_update_requires_both_clauses() {
        let attrs = vec![Attr::new("a", 1)];
        assert!(write_update("UPDATE t", &attrs, &[]).is_err());
        assert!(write_update("UPDATE t", &[], &attrs).is_err());
    }

    #[test]
    fn test_delete() {
        let sql = write_delete("DELETE FROM users", &[Attr::new("id", 42)]).unwrap();
        assert_eq!(sql, "DELETE FROM users WHERE id = $1");
        assert!(write_delete("DELETE FROM users", &[]).is_err());
    }

    #[test]
    fn test_identifier_rejects_injection() {
        let where_ = vec![Attr::new("id = 1 OR 1", 1)];
        assert!(expand_select("SELECT * FROM t", &where_).is_err());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("1col").is_err());
        assert!(check_identifier("u.").is_err());
        assert!(check_identifier("u.id").is_ok());
        assert!(check_identifier("_created_at").is_ok());
    }

    #[test]
    fn test_build_where_sorted_first_value() {
        let mut values = HashMap::new();
        values.insert("status".to_string(), vec!["active".to_string(), "x".to_string()]);
        values.insert("region".to_string(), vec!["eu".to_string()]);
        values.insert("empty".to_string(), Vec::new());

        let where_ = build_where(&values);
        assert_eq!(
            where_,
            vec![Attr::new("region", "eu"), Attr::new("status", "active")]
        );
    }
}
