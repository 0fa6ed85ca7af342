pub mod database;
pub mod extraction;
pub mod ledger;
pub mod metrics;
pub mod storage;
pub mod sync_provider;
