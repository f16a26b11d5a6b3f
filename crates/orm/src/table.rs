//! Table - physical schema binding and SQL compilation
//!
//! Translates a model's property set plus a query descriptor into one
//! parameterized statement per operation. Values always travel in the
//! params vector and are bound by the driver; identifiers are validated
//! and quoted. Association fetches join one level per property, aliased
//! so the folding pass can regroup the joined columns.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{OrmError, OrmResult};
use crate::instance::ALIAS_SEPARATOR;
use crate::property::{AssociationKind, Property, PropertySet};
use crate::query::{Comparison, QueryOptions, WhereExpr};
use crate::registry::ModelRegistry;
use crate::security::{escape_identifier, escape_qualified};

/// A compiled, parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Binds a model to its physical relation.
#[derive(Debug, Clone)]
pub struct Table {
    model: String,
    relation: String,
}

impl Table {
    pub fn for_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            relation: pluralize(model),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Compile a SELECT. `fetch` lists the association properties to join
    /// in (one level); when any join is present the statement orders by
    /// root id ascending ahead of user ordering, which keeps folding
    /// input grouped even though the fold itself no longer requires it.
    pub fn select(
        &self,
        properties: &PropertySet,
        registry: &ModelRegistry,
        where_expr: &WhereExpr,
        options: &QueryOptions,
        fetch: &[String],
    ) -> OrmResult<Statement> {
        let mut params = Vec::new();
        let selection = Selection::parse(options.select.as_deref());

        let mut columns = Vec::new();
        for property in properties.iter() {
            if !selection.wants_root(property.name()) {
                continue;
            }
            if let Some(expr) = &property.options().select_expr {
                columns.push(format!(
                    "({}) AS {}",
                    expr,
                    escape_identifier(property.name())
                ));
                continue;
            }
            if !property.is_selectable() && !options.include_private {
                continue;
            }
            if let Some(column) = property.column_name() {
                columns.push(format!(
                    "{} AS {}",
                    escape_qualified(&self.relation, &column),
                    escape_identifier(&column)
                ));
            }
        }

        let mut joins = Vec::new();
        for name in fetch {
            let property = properties.require(name)?;
            let association = property.association().ok_or_else(|| {
                OrmError::Schema(format!("property '{}' is not an association", name))
            })?;
            let target = registry.require(&association.model)?;
            let target_props = target.properties();
            let target_table = Table::for_model(&association.model);

            match association.kind {
                AssociationKind::BelongsTo => {
                    joins.push(format!(
                        "LEFT JOIN {} AS {} ON {} = {}",
                        escape_identifier(target_table.relation()),
                        escape_identifier(name),
                        escape_qualified(name, "id"),
                        escape_qualified(&self.relation, &format!("{}_id", name)),
                    ));
                }
                AssociationKind::HasOne | AssociationKind::HasMany => {
                    let fk = inverse_foreign_key(&self.model, &target_props, &association.model)?;
                    joins.push(format!(
                        "LEFT JOIN {} AS {} ON {} = {}",
                        escape_identifier(target_table.relation()),
                        escape_identifier(name),
                        escape_qualified(name, &fk),
                        escape_qualified(&self.relation, "id"),
                    ));
                }
                AssociationKind::ManyToMany => {
                    let through_name = association.through.as_deref().ok_or_else(|| {
                        OrmError::Schema(format!(
                            "many-to-many property '{}' has no through model",
                            name
                        ))
                    })?;
                    let through = registry.require(through_name)?;
                    let through_props = through.properties();
                    let through_table = Table::for_model(through_name);
                    let near = inverse_foreign_key(&self.model, &through_props, through_name)?;
                    let far = inverse_foreign_key(&association.model, &through_props, through_name)?;
                    let junction_alias = format!("{}__through", name);
                    joins.push(format!(
                        "LEFT JOIN {} AS {} ON {} = {}",
                        escape_identifier(through_table.relation()),
                        escape_identifier(&junction_alias),
                        escape_qualified(&junction_alias, &near),
                        escape_qualified(&self.relation, "id"),
                    ));
                    joins.push(format!(
                        "LEFT JOIN {} AS {} ON {} = {}",
                        escape_identifier(target_table.relation()),
                        escape_identifier(name),
                        escape_qualified(name, "id"),
                        escape_qualified(&junction_alias, &far),
                    ));
                }
            }

            // joined columns, aliased for the folding pass
            for target_property in target_props.iter() {
                if !selection.wants_nested(name, target_property.name()) {
                    continue;
                }
                if !target_property.is_selectable() {
                    continue;
                }
                if let Some(column) = target_property.column_name() {
                    columns.push(format!(
                        "{} AS {}",
                        escape_qualified(name, &column),
                        escape_identifier(&format!("{}{}{}", name, ALIAS_SEPARATOR, column)),
                    ));
                }
            }
        }

        if columns.is_empty() {
            return Err(OrmError::Schema(format!(
                "model '{}' has no selectable properties",
                self.model
            )));
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            escape_identifier(&self.relation)
        );
        for join in &joins {
            sql.push(' ');
            sql.push_str(join);
        }

        self.append_where(&mut sql, where_expr, &mut params, Some(&self.relation));

        if !options.group_by.is_empty() {
            let mut groups = Vec::new();
            for name in &options.group_by {
                let property = properties.require(name)?;
                let column = property.column_name().ok_or_else(|| {
                    OrmError::BadRequest(format!("cannot group by association '{}'", name))
                })?;
                groups.push(escape_qualified(&self.relation, &column));
            }
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }

        let mut order = Vec::new();
        if !joins.is_empty() {
            order.push(format!("{} ASC", escape_qualified(&self.relation, "id")));
        }
        for (name, direction) in &options.order_by {
            let property = properties.require(name)?;
            let column = property.column_name().ok_or_else(|| {
                OrmError::BadRequest(format!("cannot order by association '{}'", name))
            })?;
            order.push(format!(
                "{} {}",
                escape_qualified(&self.relation, &column),
                direction
            ));
        }
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        if let Some(limit) = options.limit {
            params.push(Value::from(limit));
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }
        if let Some(skip) = options.skip {
            params.push(Value::from(skip));
            sql.push_str(&format!(" OFFSET ${}", params.len()));
        }

        debug!(model = %self.model, sql = %sql, "compiled select");
        Ok(Statement::new(sql, params))
    }

    /// Compile an INSERT over resolved column values, returning the
    /// selectable columns of the new row.
    pub fn insert(&self, properties: &PropertySet, row: &Map<String, Value>) -> OrmResult<Statement> {
        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        let mut params = Vec::new();
        for property in properties.iter() {
            let Some(column) = property.column_name() else {
                continue;
            };
            if let Some(value) = row.get(&column) {
                params.push(value.clone());
                columns.push(escape_identifier(&column));
                placeholders.push(format!("${}", params.len()));
            }
        }
        if columns.is_empty() {
            return Err(OrmError::BadRequest("nothing to insert".to_string()));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            escape_identifier(&self.relation),
            columns.join(", "),
            placeholders.join(", "),
            self.returning_columns(properties),
        );
        debug!(model = %self.model, sql = %sql, "compiled insert");
        Ok(Statement::new(sql, params))
    }

    /// Compile an UPDATE, returning the selectable columns of the
    /// affected rows.
    pub fn update(
        &self,
        properties: &PropertySet,
        where_expr: &WhereExpr,
        set: &Map<String, Value>,
        options: &QueryOptions,
    ) -> OrmResult<Statement> {
        let mut params = Vec::new();
        let mut assignments = Vec::new();
        for property in properties.iter() {
            let Some(column) = property.column_name() else {
                continue;
            };
            if let Some(value) = set.get(&column) {
                params.push(value.clone());
                assignments.push(format!("{} = ${}", escape_identifier(&column), params.len()));
            }
        }
        if assignments.is_empty() {
            return Err(OrmError::BadRequest("nothing to update".to_string()));
        }
        let mut sql = format!(
            "UPDATE {} SET {}",
            escape_identifier(&self.relation),
            assignments.join(", "),
        );
        if let Some(limit) = options.limit {
            // LIMIT on UPDATE needs a keyed subselect; bind the limit, never splice it
            let mut subselect = format!(
                "SELECT {} FROM {}",
                escape_identifier("id"),
                escape_identifier(&self.relation)
            );
            self.append_where(&mut subselect, where_expr, &mut params, None);
            params.push(Value::from(limit));
            subselect.push_str(&format!(" LIMIT ${}", params.len()));
            sql.push_str(&format!(
                " WHERE {} IN ({})",
                escape_identifier("id"),
                subselect
            ));
        } else {
            self.append_where(&mut sql, where_expr, &mut params, None);
        }
        sql.push_str(&format!(" RETURNING {}", self.returning_columns(properties)));
        debug!(model = %self.model, sql = %sql, "compiled update");
        Ok(Statement::new(sql, params))
    }

    /// Compile a DELETE, returning the removed rows' columns.
    pub fn delete(
        &self,
        properties: &PropertySet,
        where_expr: &WhereExpr,
        options: &QueryOptions,
    ) -> OrmResult<Statement> {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", escape_identifier(&self.relation));
        if let Some(limit) = options.limit {
            let mut subselect = format!(
                "SELECT {} FROM {}",
                escape_identifier("id"),
                escape_identifier(&self.relation)
            );
            self.append_where(&mut subselect, where_expr, &mut params, None);
            params.push(Value::from(limit));
            subselect.push_str(&format!(" LIMIT ${}", params.len()));
            sql.push_str(&format!(
                " WHERE {} IN ({})",
                escape_identifier("id"),
                subselect
            ));
        } else {
            self.append_where(&mut sql, where_expr, &mut params, None);
        }
        sql.push_str(&format!(" RETURNING {}", self.returning_columns(properties)));
        debug!(model = %self.model, sql = %sql, "compiled delete");
        Ok(Statement::new(sql, params))
    }

    /// Compile a COUNT over the where clause.
    pub fn count(&self, where_expr: &WhereExpr) -> Statement {
        let mut params = Vec::new();
        let mut sql = format!(
            "SELECT COUNT(*) AS {} FROM {}",
            escape_identifier("count"),
            escape_identifier(&self.relation)
        );
        self.append_where(&mut sql, where_expr, &mut params, None);
        Statement::new(sql, params)
    }

    /// CREATE TABLE IF NOT EXISTS - idempotent; an existing relation is a
    /// no-op at the datastore.
    pub fn create(&self, properties: &PropertySet, registry: &ModelRegistry) -> OrmResult<Statement> {
        let mut definitions = Vec::new();
        for property in properties.iter() {
            if let Some(definition) = column_definition(property, registry)? {
                definitions.push(definition);
            }
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            escape_identifier(&self.relation),
            definitions.join(", ")
        );
        Ok(Statement::new(sql, Vec::new()))
    }

    /// ALTER TABLE statements for added, removed, and changed columns.
    pub fn alter(
        &self,
        added: &[Property],
        removed: &[String],
        changed: &[Property],
        registry: &ModelRegistry,
    ) -> OrmResult<Vec<Statement>> {
        let mut statements = Vec::new();
        for property in added {
            if let Some(definition) = column_definition(property, registry)? {
                statements.push(Statement::new(
                    format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        escape_identifier(&self.relation),
                        definition
                    ),
                    Vec::new(),
                ));
            }
        }
        for name in removed {
            statements.push(Statement::new(
                format!(
                    "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                    escape_identifier(&self.relation),
                    escape_identifier(name)
                ),
                Vec::new(),
            ));
        }
        for property in changed {
            if let Some(column) = property.column_name() {
                statements.push(Statement::new(
                    format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                        escape_identifier(&self.relation),
                        escape_identifier(&column),
                        property.kind().sql_type()
                    ),
                    Vec::new(),
                ));
            }
        }
        Ok(statements)
    }

    /// DROP TABLE; force cascades through dependent foreign keys, the
    /// non-forced form fails at the datastore when references exist.
    pub fn drop(&self, force: bool) -> Statement {
        let behavior = if force { "CASCADE" } else { "RESTRICT" };
        if force {
            tracing::warn!(model = %self.model, "force-dropping relation");
        }
        Statement::new(
            format!(
                "DROP TABLE IF EXISTS {} {}",
                escape_identifier(&self.relation),
                behavior
            ),
            Vec::new(),
        )
    }

    /// Relation-existence probe.
    pub fn exists(&self) -> Statement {
        Statement::new(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1) AS \"exists\"",
            vec![Value::String(self.relation.clone())],
        )
    }

    fn returning_columns(&self, properties: &PropertySet) -> String {
        let mut columns = Vec::new();
        for property in properties.iter() {
            if !property.is_selectable() && property.name() != "id" {
                continue;
            }
            if let Some(column) = property.column_name() {
                columns.push(escape_identifier(&column));
            }
        }
        columns.join(", ")
    }

    fn append_where(
        &self,
        sql: &mut String,
        where_expr: &WhereExpr,
        params: &mut Vec<Value>,
        qualifier: Option<&str>,
    ) {
        if where_expr.is_empty() {
            return;
        }
        let rendered = render_where(where_expr, params, qualifier);
        if !rendered.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&rendered);
        }
    }
}

fn render_where(expr: &WhereExpr, params: &mut Vec<Value>, qualifier: Option<&str>) -> String {
    match expr {
        WhereExpr::And(children) | WhereExpr::Or(children) => {
            let joiner = if matches!(expr, WhereExpr::And(_)) {
                " AND "
            } else {
                " OR "
            };
            let parts: Vec<String> = children
                .iter()
                .filter(|c| !c.is_empty())
                .map(|c| {
                    let rendered = render_where(c, params, qualifier);
                    match c {
                        WhereExpr::Cond(_) => rendered,
                        _ => format!("({})", rendered),
                    }
                })
                .collect();
            parts.join(joiner)
        }
        WhereExpr::Cond(condition) => {
            let column = match qualifier {
                Some(alias) => escape_qualified(alias, &condition.column),
                None => escape_identifier(&condition.column),
            };
            match condition.comparison {
                Comparison::IsNull => format!("{} IS NULL", column),
                Comparison::IsNotNull => format!("{} IS NOT NULL", column),
                Comparison::In | Comparison::NotIn => {
                    if condition.values.is_empty() {
                        // empty IN never matches; empty NOT IN always does
                        return if condition.comparison == Comparison::In {
                            "FALSE".to_string()
                        } else {
                            "TRUE".to_string()
                        };
                    }
                    let mut placeholders = Vec::new();
                    for value in &condition.values {
                        params.push(value.clone());
                        placeholders.push(format!("${}", params.len()));
                    }
                    format!(
                        "{} {} ({})",
                        column,
                        condition.comparison,
                        placeholders.join(", ")
                    )
                }
                _ => {
                    let value = condition.value.clone().unwrap_or(Value::Null);
                    params.push(value);
                    format!("{} {} ${}", column, condition.comparison, params.len())
                }
            }
        }
    }
}

fn column_definition(property: &Property, registry: &ModelRegistry) -> OrmResult<Option<String>> {
    if property.options().select_expr.is_some() {
        return Ok(None);
    }
    let Some(column) = property.column_name() else {
        return Ok(None);
    };
    let mut definition = format!("{} {}", escape_identifier(&column), property.kind().sql_type());
    if property.name() == "id" {
        definition.push_str(" PRIMARY KEY");
        return Ok(Some(definition));
    }
    if let Some(association) = property.association() {
        if association.kind == AssociationKind::BelongsTo {
            let target = Table::for_model(&association.model);
            // the target must be resolvable at schema-build time
            registry.require(&association.model)?;
            definition = format!(
                "{} UUID REFERENCES {} ({})",
                escape_identifier(&column),
                escape_identifier(target.relation()),
                escape_identifier("id")
            );
        }
    }
    if property.options().required {
        definition.push_str(" NOT NULL");
    }
    if property.options().unique {
        definition.push_str(" UNIQUE");
    }
    Ok(Some(definition))
}

/// The foreign-key column in `holder_props` pointing back at `model`.
fn inverse_foreign_key(
    model: &str,
    holder_props: &PropertySet,
    holder_name: &str,
) -> OrmResult<String> {
    holder_props
        .associations()
        .find(|p| {
            p.association()
                .map(|a| a.kind == AssociationKind::BelongsTo && a.model == model)
                .unwrap_or(false)
        })
        .and_then(|p| p.column_name())
        .ok_or_else(|| {
            OrmError::Schema(format!(
                "model '{}' has no belongs-to property targeting '{}'",
                holder_name, model
            ))
        })
}

/// Naive English pluralization for relation names.
pub fn pluralize(name: &str) -> String {
    if name.ends_with('s')
        || name.ends_with('x')
        || name.ends_with('z')
        || name.ends_with("ch")
        || name.ends_with("sh")
    {
        format!("{}es", name)
    } else if name.ends_with('y')
        && !name
            .chars()
            .rev()
            .nth(1)
            .map(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'))
            .unwrap_or(false)
    {
        format!("{}ies", &name[..name.len() - 1])
    } else {
        format!("{}s", name)
    }
}

/// Which columns a select whitelist admits.
struct Selection {
    root: Option<Vec<String>>,
    nested: Option<Vec<(String, String)>>,
}

impl Selection {
    fn parse(paths: Option<&[String]>) -> Self {
        let Some(paths) = paths else {
            return Self {
                root: None,
                nested: None,
            };
        };
        let mut root = Vec::new();
        let mut nested = Vec::new();
        for path in paths {
            match path.split_once('.') {
                Some((assoc, column)) => nested.push((assoc.to_string(), column.to_string())),
                None => root.push(path.clone()),
            }
        }
        Self {
            root: Some(root),
            nested: Some(nested),
        }
    }

    fn wants_root(&self, name: &str) -> bool {
        match &self.root {
            None => true,
            // id always travels: folding and instance identity need it
            Some(names) => name == "id" || names.iter().any(|n| n == name),
        }
    }

    fn wants_nested(&self, assoc: &str, column: &str) -> bool {
        match &self.nested {
            None => true,
            Some(pairs) => {
                column == "id"
                    || pairs
                        .iter()
                        .any(|(a, c)| a == assoc && (c == "*" || c == column))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Modifier, Property, PropertyKind};
    use crate::query::parse_where;
    use serde_json::json;

    fn registry() -> ModelRegistry {
        let registry = ModelRegistry::new();
        registry
            .define(
                "b",
                vec![
                    Property::new("name", PropertyKind::Text, vec![]).unwrap(),
                    Property::new("a", PropertyKind::Uuid, vec![Modifier::HasOne("a".to_string())])
                        .unwrap(),
                ],
            )
            .unwrap();
        registry
            .define(
                "a",
                vec![
                    Property::new("name", PropertyKind::Text, vec![]).unwrap(),
                    Property::new(
                        "b",
                        PropertyKind::Uuid,
                        vec![
                            Modifier::BelongsTo("b".to_string()),
                            Modifier::AutoFetch,
                            Modifier::Optional,
                        ],
                    )
                    .unwrap(),
                ],
            )
            .unwrap();
        registry
    }

    #[test]
    fn pluralizes_common_shapes() {
        assert_eq!(pluralize("user"), "users");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("day"), "days");
    }

    #[test]
    fn select_without_joins_lists_columns() {
        let registry = registry();
        let model = registry.get("a").unwrap();
        let props = model.properties();
        let table = Table::for_model("a");
        let where_expr = parse_where(&props, json!({ "name": "Aart" }).as_object().unwrap()).unwrap();
        let stmt = table
            .select(&props, &registry, &where_expr, &QueryOptions::default(), &[])
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"as\".\"id\" AS \"id\", \"as\".\"name\" AS \"name\", \"as\".\"b_id\" AS \"b_id\" FROM \"as\" WHERE \"as\".\"name\" = $1"
        );
        assert_eq!(stmt.params, vec![json!("Aart")]);
    }

    #[test]
    fn select_with_belongs_to_join_aliases_and_orders_by_root_id() {
        let registry = registry();
        let model = registry.get("a").unwrap();
        let props = model.properties();
        let table = Table::for_model("a");
        let stmt = table
            .select(
                &props,
                &registry,
                &WhereExpr::And(Vec::new()),
                &QueryOptions::default(),
                &["b".to_string()],
            )
            .unwrap();
        assert!(stmt.sql.contains("LEFT JOIN \"bs\" AS \"b\" ON \"b\".\"id\" = \"as\".\"b_id\""));
        assert!(stmt.sql.contains("\"b\".\"name\" AS \"b$name\""));
        assert!(stmt.sql.ends_with("ORDER BY \"as\".\"id\" ASC"));
    }

    #[test]
    fn select_with_has_one_join_uses_inverse_fk() {
        let registry = registry();
        let model = registry.get("b").unwrap();
        let props = model.properties();
        let table = Table::for_model("b");
        let stmt = table
            .select(
                &props,
                &registry,
                &WhereExpr::And(Vec::new()),
                &QueryOptions::default(),
                &["a".to_string()],
            )
            .unwrap();
        assert!(stmt.sql.contains("LEFT JOIN \"as\" AS \"a\" ON \"a\".\"b_id\" = \"bs\".\"id\""));
    }

    #[test]
    fn limit_and_skip_are_bound_not_spliced() {
        let registry = registry();
        let model = registry.get("a").unwrap();
        let props = model.properties();
        let table = Table::for_model("a");
        let options = QueryOptions::default().limit(10).skip(20);
        let stmt = table
            .select(&props, &registry, &WhereExpr::And(Vec::new()), &options, &[])
            .unwrap();
        assert!(stmt.sql.ends_with("LIMIT $1 OFFSET $2"));
        assert_eq!(stmt.params, vec![json!(10), json!(20)]);
    }

    #[test]
    fn insert_compiles_with_returning() {
        let registry = registry();
        let model = registry.get("a").unwrap();
        let props = model.properties();
        let table = Table::for_model("a");
        let row = json!({ "id": "u1", "name": "Aart" }).as_object().unwrap().clone();
        let stmt = table.insert(&props, &row).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"as\" (\"id\", \"name\") VALUES ($1, $2) RETURNING \"id\", \"name\", \"b_id\""
        );
        assert_eq!(stmt.params, vec![json!("u1"), json!("Aart")]);
    }

    #[test]
    fn delete_requires_where_rendering() {
        let registry = registry();
        let model = registry.get("a").unwrap();
        let props = model.properties();
        let table = Table::for_model("a");
        let where_expr = parse_where(&props, json!({ "name": "x" }).as_object().unwrap()).unwrap();
        let stmt = table
            .delete(&props, &where_expr, &QueryOptions::default())
            .unwrap();
        assert!(stmt.sql.starts_with("DELETE FROM \"as\" WHERE \"name\" = $1"));
    }

    #[test]
    fn create_table_is_idempotent_and_references_targets() {
        let registry = registry();
        let model = registry.get("a").unwrap();
        let props = model.properties();
        let table = Table::for_model("a");
        let stmt = table.create(&props, &registry).unwrap();
        assert!(stmt.sql.starts_with("CREATE TABLE IF NOT EXISTS \"as\""));
        assert!(stmt.sql.contains("\"id\" UUID PRIMARY KEY"));
        assert!(stmt.sql.contains("\"b_id\" UUID REFERENCES \"bs\" (\"id\")"));
    }

    #[test]
    fn drop_force_cascades() {
        let table = Table::for_model("a");
        assert!(table.drop(true).sql.ends_with("CASCADE"));
        assert!(table.drop(false).sql.ends_with("RESTRICT"));
    }

    #[test]
    fn in_operator_binds_every_operand() {
        let registry = registry();
        let model = registry.get("a").unwrap();
        let props = model.properties();
        let table = Table::for_model("a");
        let where_expr =
            parse_where(&props, json!({ "name": { "$in": ["x", "y"] } }).as_object().unwrap())
                .unwrap();
        let stmt = table
            .select(&props, &registry, &where_expr, &QueryOptions::default(), &[])
            .unwrap();
        assert!(stmt.sql.contains("\"as\".\"name\" IN ($1, $2)"));
        assert_eq!(stmt.params, vec![json!("x"), json!("y")]);
    }

    #[test]
    fn select_whitelist_keeps_id() {
        let registry = registry();
        let model = registry.get("a").unwrap();
        let props = model.properties();
        let table = Table::for_model("a");
        let options = QueryOptions::default().select(&["name"]);
        let stmt = table
            .select(&props, &registry, &WhereExpr::And(Vec::new()), &options, &[])
            .unwrap();
        assert!(stmt.sql.contains("\"as\".\"id\" AS \"id\""));
        assert!(stmt.sql.contains("\"as\".\"name\" AS \"name\""));
        assert!(!stmt.sql.contains("b_id"));
    }
}
