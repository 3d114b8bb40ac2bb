//! # Validation Module
//!
//! Descriptor validation for the entity catalog.
//!
//! Table and column names are interpolated into SQL text (sqlx can only
//! bind values, not identifiers), so every name that reaches a statement
//! is checked here first.
//!
//! ## Usage
//! ```rust
//! use mirror_core::catalog;
//! use mirror_core::validation::validate_catalog;
//!
//! validate_catalog(&catalog::all()).unwrap();
//! ```

use std::collections::HashSet;

use crate::entity::{ChangeDetection, EntityType, IncrementalStrategy};
use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest identifier we accept.
const MAX_IDENTIFIER_LEN: usize = 64;

// =============================================================================
// Identifiers
// =============================================================================

/// Validates a table or column name.
///
/// ## Rules
/// - `[a-z_][a-z0-9_]*`
/// - At most 64 characters
///
/// ## Example
/// ```rust
/// use mirror_core::validation::validate_identifier;
///
/// assert!(validate_identifier("invoice_items").is_ok());
/// assert!(validate_identifier("items; DROP TABLE x").is_err());
/// assert!(validate_identifier("2fast").is_err());
/// ```
pub fn validate_identifier(name: &str) -> ValidationResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);

    if !valid_start
        || name.len() > MAX_IDENTIFIER_LEN
        || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ValidationError::InvalidIdentifier(name.to_string()));
    }

    Ok(())
}

// =============================================================================
// Descriptors
// =============================================================================

/// Validates a single descriptor and its children.
pub fn validate_entity(entity: &EntityType) -> ValidationResult<()> {
    validate_identifier(&entity.table)?;
    if let Some(tombstone) = &entity.tombstone_table {
        validate_identifier(tombstone)?;
    }

    let mut seen = HashSet::new();
    for name in entity.column_names() {
        validate_identifier(name)?;
        if name == "id" {
            return Err(ValidationError::ReservedColumn(entity.name.clone()));
        }
        if !seen.insert(name) {
            return Err(ValidationError::DuplicateColumn {
                entity: entity.name.clone(),
                column: name.to_string(),
            });
        }
    }

    if entity.change_detection == ChangeDetection::UpdatedAt && !entity.has_updated_at() {
        return Err(ValidationError::MissingUpdatedAt {
            entity: entity.name.clone(),
            reason: "updated_at change detection".to_string(),
        });
    }

    if matches!(
        entity.strategy,
        IncrementalStrategy::BackwardScan | IncrementalStrategy::ForwardScan
    ) && !entity.has_updated_at()
    {
        return Err(ValidationError::MissingUpdatedAt {
            entity: entity.name.clone(),
            reason: format!("{} strategy", entity.strategy),
        });
    }

    if !entity.paged && entity.strategy != IncrementalStrategy::Exhaustive {
        return Err(ValidationError::InvalidShape {
            entity: entity.name.clone(),
            reason: format!("unpaged with {} strategy", entity.strategy),
        });
    }
    if let Some(fields) = &entity.positional_fields {
        if !fields.iter().any(|f| f == "id") {
            return Err(ValidationError::InvalidShape {
                entity: entity.name.clone(),
                reason: "positional fields without id".to_string(),
            });
        }
    }

    for child in &entity.children {
        validate_entity(&child.entity)?;
        if !child.entity.columns.iter().any(|c| c.name == child.parent_column) {
            return Err(ValidationError::MissingParentColumn {
                child: child.entity.name.clone(),
                column: child.parent_column.clone(),
            });
        }
    }

    Ok(())
}

/// Validates every descriptor and checks that no two share a table.
pub fn validate_catalog(entities: &[EntityType]) -> ValidationResult<()> {
    let mut tables = HashSet::new();

    for entity in entities {
        validate_entity(entity)?;

        let owned = std::iter::once(entity)
            .chain(entity.children.iter().map(|c| &c.entity))
            .flat_map(|e| std::iter::once(&e.table).chain(e.tombstone_table.as_ref()));
        for table in owned {
            if !tables.insert(table.as_str()) {
                return Err(ValidationError::DuplicateTable(table.clone()));
            }
        }
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
