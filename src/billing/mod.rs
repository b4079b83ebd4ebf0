pub mod ledger;
pub mod payer;
pub mod retry;
pub mod rules;
pub mod settlement;
