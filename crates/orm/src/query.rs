//! Query descriptors
//!
//! Parses caller-supplied where-maps into a bounded condition tree and
//! carries the find/update/remove option axes (limit, skip, orderBy,
//! groupBy, select, associations, auto-fetch depth).

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{OrmError, OrmResult};
use crate::property::PropertySet;

/// Recursive association resolution is bounded by this depth by default,
/// so cyclic model graphs cannot produce unbounded joins.
pub const DEFAULT_AUTO_FETCH_DEPTH: usize = 5;

/// Fixed comparison operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    IsNull,
    IsNotNull,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::Eq => write!(f, "="),
            Comparison::Ne => write!(f, "!="),
            Comparison::Gt => write!(f, ">"),
            Comparison::Gte => write!(f, ">="),
            Comparison::Lt => write!(f, "<"),
            Comparison::Lte => write!(f, "<="),
            Comparison::In => write!(f, "IN"),
            Comparison::NotIn => write!(f, "NOT IN"),
            Comparison::Like => write!(f, "LIKE"),
            Comparison::IsNull => write!(f, "IS NULL"),
            Comparison::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// One column comparison.
#[derive(Debug, Clone)]
pub struct Condition {
    /// Physical column name, already resolved from the property
    pub column: String,
    pub comparison: Comparison,
    pub value: Option<Value>,
    /// Operand list for IN / NOT IN
    pub values: Vec<Value>,
}

/// Parsed where-map: a tree of AND/OR groups over conditions.
#[derive(Debug, Clone)]
pub enum WhereExpr {
    And(Vec<WhereExpr>),
    Or(Vec<WhereExpr>),
    Cond(Condition),
}

impl WhereExpr {
    pub fn is_empty(&self) -> bool {
        match self {
            WhereExpr::And(children) | WhereExpr::Or(children) => {
                children.iter().all(WhereExpr::is_empty)
            }
            WhereExpr::Cond(_) => false,
        }
    }
}

/// Ordering direction; accepts numeric (>0 asc, <0 desc) and symbolic forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Number(n) => {
                if n.as_f64().unwrap_or(0.0) < 0.0 {
                    Ok(OrderDirection::Desc)
                } else {
                    Ok(OrderDirection::Asc)
                }
            }
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "asc" | "ascending" => Ok(OrderDirection::Asc),
                "desc" | "descending" => Ok(OrderDirection::Desc),
                other => Err(OrmError::BadRequest(format!(
                    "unrecognized order direction '{}'",
                    other
                ))),
            },
            other => Err(OrmError::BadRequest(format!(
                "unrecognized order direction {}",
                other
            ))),
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => write!(f, "ASC"),
            OrderDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// Options for find/update/remove operations.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub order_by: Vec<(String, OrderDirection)>,
    pub group_by: Vec<String>,
    /// Property whitelist; dot-paths address into associations, and
    /// `assoc.*` selects every column of an association.
    pub select: Option<Vec<String>>,
    /// Associations to force-fetch regardless of their auto-fetch flag
    pub associations: Vec<String>,
    pub auto_fetch_depth: usize,
    /// Internal queries (authorize, token lookup) see private columns
    pub(crate) include_private: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: None,
            skip: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            select: None,
            associations: Vec::new(),
            auto_fetch_depth: DEFAULT_AUTO_FETCH_DEPTH,
            include_private: false,
        }
    }
}

impl QueryOptions {
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn order_by(mut self, property: &str, direction: OrderDirection) -> Self {
        self.order_by.push((property.to_string(), direction));
        self
    }

    pub fn group_by(mut self, property: &str) -> Self {
        self.group_by.push(property.to_string());
        self
    }

    pub fn select(mut self, paths: &[&str]) -> Self {
        self.select = Some(paths.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn association(mut self, name: &str) -> Self {
        self.associations.push(name.to_string());
        self
    }

    pub fn auto_fetch_depth(mut self, depth: usize) -> Self {
        self.auto_fetch_depth = depth;
        self
    }

    /// Parse an options map (`limit`, `skip`, `orderBy`, `groupBy`,
    /// `select`, `associations`, `autoFetchDepth`) into typed options.
    pub fn from_map(map: &Map<String, Value>) -> OrmResult<Self> {
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "limit" => {
                    options.limit = Some(value.as_i64().ok_or_else(|| {
                        OrmError::BadRequest("limit must be an integer".to_string())
                    })?)
                }
                "skip" => {
                    options.skip = Some(value.as_i64().ok_or_else(|| {
                        OrmError::BadRequest("skip must be an integer".to_string())
                    })?)
                }
                "orderBy" => {
                    let order = value.as_object().ok_or_else(|| {
                        OrmError::BadRequest("orderBy must be a map".to_string())
                    })?;
                    for (property, direction) in order {
                        options
                            .order_by
                            .push((property.clone(), OrderDirection::from_value(direction)?));
                    }
                }
                "groupBy" => match value {
                    Value::String(s) => options.group_by.push(s.clone()),
                    Value::Array(items) => {
                        for item in items {
                            options.group_by.push(
                                item.as_str()
                                    .ok_or_else(|| {
                                        OrmError::BadRequest(
                                            "groupBy entries must be strings".to_string(),
                                        )
                                    })?
                                    .to_string(),
                            );
                        }
                    }
                    _ => {
                        return Err(OrmError::BadRequest(
                            "groupBy must be a string or array".to_string(),
                        ))
                    }
                },
                "select" => {
                    let items = value.as_array().ok_or_else(|| {
                        OrmError::BadRequest("select must be an array".to_string())
                    })?;
                    let mut paths = Vec::new();
                    for item in items {
                        paths.push(
                            item.as_str()
                                .ok_or_else(|| {
                                    OrmError::BadRequest(
                                        "select entries must be strings".to_string(),
                                    )
                                })?
                                .to_string(),
                        );
                    }
                    options.select = Some(paths);
                }
                "associations" => {
                    let items = value.as_array().ok_or_else(|| {
                        OrmError::BadRequest("associations must be an array".to_string())
                    })?;
                    for item in items {
                        options.associations.push(
                            item.as_str()
                                .ok_or_else(|| {
                                    OrmError::BadRequest(
                                        "association entries must be strings".to_string(),
                                    )
                                })?
                                .to_string(),
                        );
                    }
                }
                "autoFetchDepth" => {
                    options.auto_fetch_depth = value.as_u64().ok_or_else(|| {
                        OrmError::BadRequest("autoFetchDepth must be a non-negative integer".to_string())
                    })? as usize;
                }
                other => {
                    return Err(OrmError::BadRequest(format!(
                        "unrecognized query option '{}'",
                        other
                    )))
                }
            }
        }
        Ok(options)
    }
}

/// Extract a bindable value for an association key: accepts a raw id or
/// an instance-shaped object carrying an `id` field.
pub(crate) fn association_operand(value: &Value) -> OrmResult<Value> {
    match value {
        Value::Object(map) => map
            .get("id")
            .cloned()
            .ok_or_else(|| OrmError::BadRequest("association value has no id".to_string())),
        other => Ok(other.clone()),
    }
}

/// Parse a where-map against a property set into a condition tree.
///
/// Non-operator keys must resolve to an existing property. Values may be
/// scalars (equality, `IS NULL` for null) or operator maps using the
/// `$gt/$gte/$lt/$lte/$ne/$in/$nin/$like` sigil keys. The `$or`/`$and`
/// keys take arrays of sub-maps.
pub fn parse_where(properties: &PropertySet, where_map: &Map<String, Value>) -> OrmResult<WhereExpr> {
    let mut children = Vec::new();
    for (key, value) in where_map {
        if key == "$or" || key == "$and" {
            let branches = value.as_array().ok_or_else(|| {
                OrmError::BadRequest(format!("{} expects an array of where-maps", key))
            })?;
            let mut parsed = Vec::new();
            for branch in branches {
                let map = branch.as_object().ok_or_else(|| {
                    OrmError::BadRequest(format!("{} entries must be where-maps", key))
                })?;
                parsed.push(parse_where(properties, map)?);
            }
            children.push(if key == "$or" {
                WhereExpr::Or(parsed)
            } else {
                WhereExpr::And(parsed)
            });
            continue;
        }
        if key.starts_with('$') {
            return Err(OrmError::BadRequest(format!(
                "unrecognized operator '{}'",
                key
            )));
        }

        let property = properties.require(key)?;
        let column = property.column_name().ok_or_else(|| {
            OrmError::BadRequest(format!(
                "property '{}' has no column and cannot appear in a where-map",
                key
            ))
        })?;
        let operand = if property.is_association() {
            match value {
                Value::Object(map) if !map.contains_key("id") => value.clone(),
                _ => association_operand(value)?,
            }
        } else {
            value.clone()
        };

        match &operand {
            Value::Object(operators) => {
                for (sigil, operand) in operators {
                    children.push(WhereExpr::Cond(parse_operator(&column, sigil, operand)?));
                }
            }
            Value::Null => children.push(WhereExpr::Cond(Condition {
                column,
                comparison: Comparison::IsNull,
                value: None,
                values: Vec::new(),
            })),
            other => children.push(WhereExpr::Cond(Condition {
                column,
                comparison: Comparison::Eq,
                value: Some(other.clone()),
                values: Vec::new(),
            })),
        }
    }
    Ok(WhereExpr::And(children))
}

fn parse_operator(column: &str, sigil: &str, operand: &Value) -> OrmResult<Condition> {
    let single = |comparison| {
        Ok(Condition {
            column: column.to_string(),
            comparison,
            value: Some(operand.clone()),
            values: Vec::new(),
        })
    };
    match sigil {
        "$gt" => single(Comparison::Gt),
        "$gte" => single(Comparison::Gte),
        "$lt" => single(Comparison::Lt),
        "$lte" => single(Comparison::Lte),
        "$like" => single(Comparison::Like),
        "$ne" | "$not" => {
            if operand.is_null() {
                Ok(Condition {
                    column: column.to_string(),
                    comparison: Comparison::IsNotNull,
                    value: None,
                    values: Vec::new(),
                })
            } else {
                single(Comparison::Ne)
            }
        }
        "$in" | "$nin" => {
            let items = operand
                .as_array()
                .ok_or_else(|| OrmError::BadRequest(format!("{} expects an array", sigil)))?;
            Ok(Condition {
                column: column.to_string(),
                comparison: if sigil == "$in" {
                    Comparison::In
                } else {
                    Comparison::NotIn
                },
                value: None,
                values: items.clone(),
            })
        }
        other => Err(OrmError::BadRequest(format!(
            "unrecognized operator '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Modifier, Property, PropertyKind};
    use serde_json::json;

    fn props() -> PropertySet {
        PropertySet::from_properties(vec![
            Property::new("name", PropertyKind::Text, vec![]).unwrap(),
            Property::new("age", PropertyKind::Integer, vec![]).unwrap(),
            Property::new("author", PropertyKind::Uuid, vec![Modifier::BelongsTo(
                "user".to_string(),
            )])
            .unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn unknown_property_in_where_fails() {
        let map = json!({ "nope": 1 });
        let err = parse_where(&props(), map.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, OrmError::Schema(_)));
    }

    #[test]
    fn scalar_values_compile_to_equality() {
        let map = json!({ "name": "Aart" });
        let expr = parse_where(&props(), map.as_object().unwrap()).unwrap();
        match expr {
            WhereExpr::And(children) => match &children[0] {
                WhereExpr::Cond(cond) => {
                    assert_eq!(cond.column, "name");
                    assert_eq!(cond.comparison, Comparison::Eq);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn operator_maps_pass_through() {
        let map = json!({ "age": { "$gte": 18, "$lt": 65 } });
        let expr = parse_where(&props(), map.as_object().unwrap()).unwrap();
        let WhereExpr::And(children) = expr else {
            panic!()
        };
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn null_compiles_to_is_null() {
        let map = json!({ "name": null });
        let expr = parse_where(&props(), map.as_object().unwrap()).unwrap();
        let WhereExpr::And(children) = expr else {
            panic!()
        };
        let WhereExpr::Cond(cond) = &children[0] else {
            panic!()
        };
        assert_eq!(cond.comparison, Comparison::IsNull);
    }

    #[test]
    fn association_keys_use_fk_column_and_accept_instances() {
        let map = json!({ "author": { "id": "abc" } });
        let expr = parse_where(&props(), map.as_object().unwrap()).unwrap();
        let WhereExpr::And(children) = expr else {
            panic!()
        };
        let WhereExpr::Cond(cond) = &children[0] else {
            panic!()
        };
        assert_eq!(cond.column, "author_id");
        assert_eq!(cond.value, Some(json!("abc")));
    }

    #[test]
    fn unrecognized_sigil_is_rejected() {
        let map = json!({ "age": { "$regex": "x" } });
        assert!(parse_where(&props(), map.as_object().unwrap()).is_err());
    }

    #[test]
    fn or_groups_parse() {
        let map = json!({ "$or": [{ "name": "a" }, { "name": "b" }] });
        let expr = parse_where(&props(), map.as_object().unwrap()).unwrap();
        let WhereExpr::And(children) = expr else {
            panic!()
        };
        assert!(matches!(children[0], WhereExpr::Or(_)));
    }

    #[test]
    fn options_map_parses_axes() {
        let map = json!({
            "limit": 10,
            "skip": 5,
            "orderBy": { "name": -1 },
            "select": ["name", "author.*"],
            "autoFetchDepth": 2
        });
        let options = QueryOptions::from_map(map.as_object().unwrap()).unwrap();
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.skip, Some(5));
        assert_eq!(options.order_by[0], ("name".to_string(), OrderDirection::Desc));
        assert_eq!(options.auto_fetch_depth, 2);
    }
}
