pub mod payments;
pub mod reconciliation;
pub mod risk;
pub mod verification;
