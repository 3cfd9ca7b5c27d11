//! SeaORM Entity for the transactions table
//!
//! One row per submitted on-chain deposit/withdrawal call, keyed by the chain tx id.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    /// Chain transaction id (0x-prefixed hex)
    #[sea_orm(primary_key, auto_increment = false)]
    pub tx_id: String,
    pub user_id: String,
    /// Stacks principal that signed the transaction
    pub user_address: String,
    /// 'deposit' or 'withdrawal'
    pub tx_type: String,
    /// 'pending', 'success', 'failed' or 'timeout'
    pub status: String,
    /// Amounts in micro-units (10^-6 STX / PLMD)
    pub stx_amount: Option<i64>,
    pub plmd_amount: Option<i64>,
    pub nav: Option<i64>,
    pub fee: Option<i64>,
    pub net_amount: Option<i64>,
    pub block_height: Option<i64>,
    pub retry_count: i32,
    pub last_polled_at: Option<DateTimeWithTimeZone>,
    pub confirmed_at: Option<DateTimeWithTimeZone>,
    /// Polling deadline, fixed at creation
    pub timeout_at: DateTimeWithTimeZone,
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
