//! Resolves client-supplied table references to a canonical table id
//!
//! Accepted forms: a numeric id (`"4"`), a table name (`"Patio 2"`, matched
//! case-insensitively), or the `T<id>` shorthand printed on bill codes.

use sea_orm::{
    sea_query::{Expr, Func},
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};

use crate::entities::{dining_tables, prelude::DiningTables};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRef {
    Id(i32),
    Label(String),
}

/// Classify a raw reference without touching the database
pub fn parse_table_ref(raw: &str) -> CoreResult<TableRef> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CoreError::Validation("table reference is empty".to_string()));
    }
    match raw.parse::<i64>() {
        Ok(id) if id > 0 && id <= i32::MAX as i64 => Ok(TableRef::Id(id as i32)),
        Ok(_) => Err(CoreError::Validation(format!("invalid table id {}", raw))),
        Err(_) => Ok(TableRef::Label(raw.to_string())),
    }
}

/// `T12` / `t12` → 12
fn shorthand_id(label: &str) -> Option<i32> {
    let digits = label.strip_prefix(['T', 't'])?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|id| *id > 0)
}

pub async fn resolve_table<C: ConnectionTrait>(db: &C, raw: &str) -> CoreResult<i32> {
    match parse_table_ref(raw)? {
        TableRef::Id(id) => DiningTables::find_by_id(id)
            .one(db)
            .await?
            .map(|t| t.id)
            .ok_or_else(|| CoreError::not_found("table", id)),
        TableRef::Label(label) => {
            let by_name = DiningTables::find()
                .filter(
                    Expr::expr(Func::lower(Expr::col(dining_tables::Column::Name)))
                        .eq(label.to_lowercase()),
                )
                .one(db)
                .await?;
            if let Some(table) = by_name {
                return Ok(table.id);
            }

            match shorthand_id(&label) {
                Some(id) => DiningTables::find()
                    .filter(dining_tables::Column::Id.eq(id))
                    .one(db)
                    .await?
                    .map(|t| t.id)
                    .ok_or_else(|| CoreError::not_found("table", label)),
                None => Err(CoreError::not_found("table", label)),
            }
        }
    }
}
