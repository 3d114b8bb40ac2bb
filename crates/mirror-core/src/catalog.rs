//! # Entity Catalog
//!
//! The descriptors of every collection the mirror knows how to sync.
//!
//! ## Entities
//! ```text
//! ┌───────────────┬──────────────────┬───────────────┬──────────┬─────────┐
//! │ entity        │ table            │ strategy      │ detection│ lookback│
//! ├───────────────┼──────────────────┼───────────────┼──────────┼─────────┤
//! │ tickets       │ tickets          │ since_filter  │ updated  │ 14 days │
//! │  └ comments   │ comments         │ (child)       │ updated  │    -    │
//! │ invoices      │ invoices         │ since_filter  │ updated  │  7 days │
//! │ invoice_lines │ invoice_items    │ backward_scan │ updated  │    -    │
//! │ estimates     │ estimates        │ forward_scan  │ updated  │  7 days │
//! │ payments      │ payments         │ forward_scan  │ updated  │  7 days │
//! │ contacts      │ contacts         │ exhaustive    │ updated  │    -    │
//! │ customers     │ customers        │ exhaustive    │ updated  │    -    │
//! │ products      │ products         │ exhaustive    │ hash     │    -    │
//! └───────────────┴──────────────────┴───────────────┴──────────┴─────────┘
//! ```
//!
//! Each live table `x` is archived into `deleted_x`.

use crate::entity::{
    ChangeDetection, ChildSpec, ColumnKind, ColumnSpec, EntityType, IncrementalStrategy,
};
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::transform::{self, SqlValue};

/// Every top-level entity, in the order a full sync runs them.
pub fn all() -> Vec<EntityType> {
    vec![
        contacts(),
        customers(),
        tickets(),
        invoices(),
        invoice_lines(),
        estimates(),
        payments(),
        products(),
        users(),
    ]
}

/// Looks up a top-level entity by name.
pub fn by_name(name: &str) -> CoreResult<EntityType> {
    all()
        .into_iter()
        .find(|e| e.name == name)
        .ok_or_else(|| CoreError::UnknownEntity(name.to_string()))
}

/// Names of all top-level entities.
pub fn names() -> Vec<String> {
    all().into_iter().map(|e| e.name).collect()
}

// =============================================================================
// Descriptors
// =============================================================================

pub fn contacts() -> EntityType {
    EntityType::new("contacts")
        .columns([
            ColumnSpec::text("name"),
            ColumnSpec::text("address1"),
            ColumnSpec::text("address2"),
            ColumnSpec::text("city"),
            ColumnSpec::text("state"),
            ColumnSpec::text("zip"),
            ColumnSpec::text("email"),
            ColumnSpec::text("phone"),
            ColumnSpec::text("mobile"),
            ColumnSpec::real("latitude"),
            ColumnSpec::real("longitude"),
            ColumnSpec::integer("customer_id"),
            ColumnSpec::integer("account_id"),
            ColumnSpec::text("notes"),
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::timestamp("updated_at"),
            ColumnSpec::integer("vendor_id"),
            ColumnSpec::text("title"),
            ColumnSpec::boolean("opt_out").with_default(false),
            ColumnSpec::text("extension"),
            ColumnSpec::text("processed_phone"),
            ColumnSpec::text("processed_mobile"),
            ColumnSpec::text("ticket_matching_emails"),
        ])
        .strategy(IncrementalStrategy::Exhaustive)
}

pub fn customers() -> EntityType {
    EntityType::new("customers")
        .columns([
            ColumnSpec::text("firstname"),
            ColumnSpec::text("lastname"),
            ColumnSpec::text("fullname"),
            ColumnSpec::text("business_name"),
            ColumnSpec::text("email"),
            ColumnSpec::text("phone"),
            ColumnSpec::text("mobile"),
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::timestamp("updated_at"),
            ColumnSpec::text("pdf_url"),
            ColumnSpec::text("address"),
            ColumnSpec::text("address_2"),
            ColumnSpec::text("city"),
            ColumnSpec::text("state"),
            ColumnSpec::text("zip"),
            ColumnSpec::real("latitude"),
            ColumnSpec::real("longitude"),
            ColumnSpec::text("notes"),
            ColumnSpec::boolean("get_sms").with_default(false),
            ColumnSpec::boolean("opt_out").with_default(false),
            ColumnSpec::boolean("disabled").with_default(false),
            ColumnSpec::boolean("no_email").with_default(false),
            ColumnSpec::text("location_name"),
            ColumnSpec::integer("location_id"),
            ColumnSpec::json("properties"),
            ColumnSpec::text("online_profile_url"),
            ColumnSpec::integer("tax_rate_id"),
            ColumnSpec::text("notification_email"),
            ColumnSpec::text("invoice_cc_emails"),
            ColumnSpec::integer("invoice_term_id"),
            ColumnSpec::text("referred_by"),
            ColumnSpec::integer("ref_customer_id"),
            ColumnSpec::text("business_and_full_name"),
            ColumnSpec::text("business_then_name"),
            ColumnSpec::json("contacts"),
        ])
        .strategy(IncrementalStrategy::Exhaustive)
}

pub fn tickets() -> EntityType {
    EntityType::new("tickets")
        .columns([
            ColumnSpec::integer("number"),
            ColumnSpec::text("subject"),
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::integer("customer_id"),
            ColumnSpec::text("customer_business_then_name"),
            ColumnSpec::timestamp("due_date"),
            ColumnSpec::timestamp("resolved_at"),
            ColumnSpec::timestamp("start_at"),
            ColumnSpec::timestamp("end_at"),
            ColumnSpec::integer("location_id"),
            ColumnSpec::text("problem_type"),
            ColumnSpec::text("status"),
            ColumnSpec::integer("ticket_type_id"),
            ColumnSpec::json("properties").with_default("{}"),
            ColumnSpec::integer("user_id"),
            ColumnSpec::timestamp("updated_at"),
            ColumnSpec::text("pdf_url"),
            ColumnSpec::text("priority"),
            ColumnSpec::json("comments").with_default("[]"),
            ColumnSpec::derived("num_devices", ColumnKind::Integer, ticket_devices),
        ])
        .strategy(IncrementalStrategy::SinceFilter)
        .default_lookback_days(14)
        .child(ChildSpec::new("comments", "ticket_id", comments()))
}

/// Ticket comments; only ever reached through their parent ticket.
pub fn comments() -> EntityType {
    EntityType::new("comments")
        .columns([
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::timestamp("updated_at"),
            ColumnSpec::integer("ticket_id"),
            ColumnSpec::text("subject"),
            ColumnSpec::text("body"),
            ColumnSpec::text("tech"),
            ColumnSpec::boolean("hidden").with_default(false),
            ColumnSpec::integer("user_id"),
        ])
        .supports_full(false)
}

pub fn invoices() -> EntityType {
    EntityType::new("invoices")
        .columns([
            ColumnSpec::integer("customer_id"),
            ColumnSpec::text("customer_business_then_name"),
            ColumnSpec::text("number"),
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::timestamp("updated_at"),
            ColumnSpec::date("date"),
            ColumnSpec::date("due_date"),
            ColumnSpec::real("subtotal"),
            ColumnSpec::real("total"),
            ColumnSpec::real("tax"),
            ColumnSpec::boolean("verified_paid").with_default(false),
            ColumnSpec::boolean("tech_marked_paid").with_default(false),
            ColumnSpec::integer("ticket_id"),
            ColumnSpec::integer("user_id"),
            ColumnSpec::text("pdf_url"),
            ColumnSpec::boolean("is_paid").with_default(false),
            ColumnSpec::integer("location_id"),
            ColumnSpec::text("po_number"),
            ColumnSpec::integer("contact_id"),
            ColumnSpec::text("note"),
            ColumnSpec::real("hardwarecost").with_default(0.0),
        ])
        .strategy(IncrementalStrategy::SinceFilter)
        .default_lookback_days(7)
}

pub fn invoice_lines() -> EntityType {
    EntityType::new("invoice_lines")
        .endpoint("line_items")
        .collection("line_items")
        .table("invoice_items")
        .columns([
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::timestamp("updated_at"),
            ColumnSpec::integer("invoice_id"),
            ColumnSpec::text("item"),
            ColumnSpec::text("name"),
            ColumnSpec::real("cost"),
            ColumnSpec::real("price"),
            ColumnSpec::real("quantity"),
            ColumnSpec::integer("product_id"),
            ColumnSpec::boolean("taxable").with_default(false),
            ColumnSpec::real("discount_percent"),
            ColumnSpec::integer("position"),
            ColumnSpec::integer("invoice_bundle_id"),
            ColumnSpec::real("discount_dollars"),
            ColumnSpec::text("product_category"),
        ])
        .strategy(IncrementalStrategy::BackwardScan)
}

pub fn estimates() -> EntityType {
    EntityType::new("estimates")
        .columns([
            ColumnSpec::integer("customer_id"),
            ColumnSpec::text("customer_business_then_name"),
            ColumnSpec::text("number"),
            ColumnSpec::text("status"),
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::timestamp("updated_at"),
            ColumnSpec::timestamp("date"),
            ColumnSpec::real("subtotal"),
            ColumnSpec::real("total"),
            ColumnSpec::real("tax"),
            ColumnSpec::integer("ticket_id"),
            ColumnSpec::text("pdf_url"),
            ColumnSpec::integer("location_id"),
            ColumnSpec::integer("invoice_id"),
            ColumnSpec::text("employee"),
        ])
        .strategy(IncrementalStrategy::ForwardScan)
        .default_lookback_days(7)
}

pub fn payments() -> EntityType {
    EntityType::new("payments")
        .columns([
            ColumnSpec::timestamp("created_at"),
            ColumnSpec::timestamp("updated_at"),
            ColumnSpec::boolean("success"),
            ColumnSpec::real("payment_amount"),
            ColumnSpec::json("invoice_ids").with_default("[]"),
            ColumnSpec::text("ref_num"),
            ColumnSpec::date("applied_at"),
            ColumnSpec::text("payment_method"),
            ColumnSpec::text("transaction_response"),
            ColumnSpec::date("signature_date"),
            ColumnSpec::json("customer"),
            ColumnSpec::integer("customer_id").from_path("customer.id"),
            ColumnSpec::text("business_and_full_name").from_path("customer.business_and_full_name"),
        ])
        .strategy(IncrementalStrategy::ForwardScan)
        .default_lookback_days(7)
}

/// Products carry no `updated_at`; changes are found by content digest.
pub fn products() -> EntityType {
    EntityType::new("products")
        .columns([
            ColumnSpec::real("price_cost"),
            ColumnSpec::real("price_retail"),
            ColumnSpec::text("condition"),
            ColumnSpec::text("description"),
            ColumnSpec::boolean("maintain_stock"),
            ColumnSpec::text("name"),
            ColumnSpec::integer("quantity"),
            ColumnSpec::text("warranty"),
            ColumnSpec::integer("sort_order"),
            ColumnSpec::integer("reorder_at"),
            ColumnSpec::boolean("disabled").with_default(false),
            ColumnSpec::boolean("taxable"),
            ColumnSpec::text("product_category"),
            ColumnSpec::text("category_path"),
            ColumnSpec::text("upc_code"),
            ColumnSpec::real("discount_percent"),
            ColumnSpec::integer("warranty_template_id"),
            ColumnSpec::integer("qb_item_id"),
            ColumnSpec::integer("desired_stock_level"),
            ColumnSpec::real("price_wholesale"),
            ColumnSpec::text("notes"),
            ColumnSpec::integer("tax_rate_id"),
            ColumnSpec::text("physical_location"),
            ColumnSpec::boolean("serialized"),
            ColumnSpec::json("vendor_ids"),
            ColumnSpec::text("long_description"),
            ColumnSpec::json("location_quantities"),
            ColumnSpec::json("photos"),
        ])
        .strategy(IncrementalStrategy::Exhaustive)
        .change_detection(ChangeDetection::ContentHash)
}

/// Staff accounts. The endpoint returns every user at once as `[id, name]`
/// pairs; existing rows are never rewritten and nothing is archived.
pub fn users() -> EntityType {
    EntityType::new("users")
        .column(ColumnSpec::text("name"))
        .positional(&["id", "name"])
        .unpaged()
        .strategy(IncrementalStrategy::Exhaustive)
        .change_detection(ChangeDetection::InsertOnly)
        .without_tombstone()
}

// =============================================================================
// Derived Columns
// =============================================================================

fn ticket_devices(record: &Record) -> SqlValue {
    let subject = record.get("subject").and_then(|v| v.as_str()).unwrap_or("");
    SqlValue::Integer(transform::extract_devices(subject))
}

// =============================================================================
// Unit Tests
// =============================================================================
