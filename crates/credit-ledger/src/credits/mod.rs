//! Credit system for tracking allocations, reservations and pricing.

mod pricing;
mod service;

pub use pricing::{estimate_tokens, normalize_model_key, PricingCalculator};
pub use service::CreditService;

pub(crate) use service::{allocate_in, reserve_in};
