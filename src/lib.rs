// src/lib.rs

pub mod entities {
    pub mod prelude;
    pub mod transactions;
}

pub mod services {
    pub mod amount_converter;
    pub mod finality_client;
    pub mod notification_sink;
    pub mod polling_scheduler;
    pub mod transaction_service;
    pub mod transaction_store;
}

pub mod models {
    pub mod settlement;
    pub mod transaction;
}

pub mod config;
pub mod jobs;
pub mod pipeline;
