pub mod config;
pub mod contracts;
pub mod db;
pub mod pg_store;
pub mod redis_bus;

pub use config::{ServiceConfig, program_policy_from_env};
pub use contracts::{
    AdjustmentRequest, AdjustmentResponse, ApprovePayoutRequest, CONVERSIONS_CHANNEL,
    ConversionEvent, ErrorBody, LedgerResponse, MATURED_CHANNEL, MaturationSweptEvent,
    PAYOUTS_CHANNEL, PayoutEvent, PayoutQueueQuery, RecordClickRequest, RecordClickResponse,
    RecordConversionRequest, RecordConversionResponse, RejectPayoutRequest,
    ReverseConversionRequest,
};
pub use db::{connect_database, ensure_schema};
pub use pg_store::PgStore;
pub use redis_bus::RedisBus;
