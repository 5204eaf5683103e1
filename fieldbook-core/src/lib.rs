mod action;
mod client;

pub use action::{ActionKind, UnknownActionKind};
pub use client::{ApiErrorClass, FieldbookClient, FieldbookError, IDEMPOTENCY_HEADER};
