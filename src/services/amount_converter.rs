//! NAV-based share/amount conversion
//!
//! Mirrors the pool contract's integer math exactly: every division floors,
//! intermediate products are computed in 128 bits.

use serde::{Deserialize, Serialize};

/// NAV precision: micro-STX per whole share
pub const NAV_PRECISION: i128 = 1_000_000;

/// Fee rates are expressed in parts per 1000
pub const FEE_RATE_DENOMINATOR: i128 = 1_000;

/// Error types for amount conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    NavNotPositive(i64),
    InvalidAmount(i64),
    InvalidFeeRate(i64),
    Overflow,
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionError::NavNotPositive(nav) => write!(f, "NAV must be positive, got {}", nav),
            ConversionError::InvalidAmount(amount) => {
                write!(f, "Amount must be positive, got {}", amount)
            }
            ConversionError::InvalidFeeRate(rate) => {
                write!(f, "Fee rate must be within 0..=1000, got {}", rate)
            }
            ConversionError::Overflow => write!(f, "Conversion result does not fit in 64 bits"),
        }
    }
}

impl std::error::Error for ConversionError {}

/// Contract state needed to price shares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavSnapshot {
    pub nav: i64,
    pub entry_fee_rate_bp: i64,
    pub exit_fee_rate_bp: i64,
}

/// Full breakdown of a deposit quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositQuote {
    pub gross_stx: i64,
    pub fee: i64,
    pub net_stx: i64,
    pub shares: i64,
    pub nav: i64,
}

/// Full breakdown of a withdrawal quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalQuote {
    pub shares: i64,
    pub gross_stx: i64,
    pub fee: i64,
    pub net_stx: i64,
    pub nav: i64,
}

/// A bad NAV is reported ahead of a bad amount
fn check_inputs(principal: i64, nav: i64, fee_rate_bp: i64) -> Result<(), ConversionError> {
    if nav <= 0 {
        return Err(ConversionError::NavNotPositive(nav));
    }
    if principal <= 0 {
        return Err(ConversionError::InvalidAmount(principal));
    }
    if !(0..=FEE_RATE_DENOMINATOR as i64).contains(&fee_rate_bp) {
        return Err(ConversionError::InvalidFeeRate(fee_rate_bp));
    }
    Ok(())
}

fn to_i64(value: i128) -> Result<i64, ConversionError> {
    i64::try_from(value).map_err(|_| ConversionError::Overflow)
}

/// `floor(amount * rate / 1000)`
fn fee_for(amount: i128, fee_rate_bp: i64) -> i128 {
    amount * fee_rate_bp as i128 / FEE_RATE_DENOMINATOR
}

/// Quote a deposit of `gross_stx` micro-STX
pub fn deposit_breakdown(
    gross_stx: i64,
    nav: i64,
    entry_fee_rate_bp: i64,
) -> Result<DepositQuote, ConversionError> {
    check_inputs(gross_stx, nav, entry_fee_rate_bp)?;

    let gross = gross_stx as i128;
    let fee = fee_for(gross, entry_fee_rate_bp);
    let net = gross - fee;
    let shares = net * NAV_PRECISION / nav as i128;

    Ok(DepositQuote {
        gross_stx,
        fee: to_i64(fee)?,
        net_stx: to_i64(net)?,
        shares: to_i64(shares)?,
        nav,
    })
}

/// Quote a withdrawal of `shares` PLMD micro-shares
pub fn withdrawal_breakdown(
    shares: i64,
    nav: i64,
    exit_fee_rate_bp: i64,
) -> Result<WithdrawalQuote, ConversionError> {
    check_inputs(shares, nav, exit_fee_rate_bp)?;

    let gross = shares as i128 * nav as i128 / NAV_PRECISION;
    let fee = fee_for(gross, exit_fee_rate_bp);
    let net = gross - fee;

    Ok(WithdrawalQuote {
        shares,
        gross_stx: to_i64(gross)?,
        fee: to_i64(fee)?,
        net_stx: to_i64(net)?,
        nav,
    })
}

/// Shares minted for a deposit of `gross_stx`, after the entry fee
pub fn shares_for_deposit(
    gross_stx: i64,
    nav: i64,
    entry_fee_rate_bp: i64,
) -> Result<i64, ConversionError> {
    deposit_breakdown(gross_stx, nav, entry_fee_rate_bp).map(|q| q.shares)
}

/// Net micro-STX paid out for burning `shares`, after the exit fee
pub fn stx_for_withdrawal(
    shares: i64,
    nav: i64,
    exit_fee_rate_bp: i64,
) -> Result<i64, ConversionError> {
    withdrawal_breakdown(shares, nav, exit_fee_rate_bp).map(|q| q.net_stx)
}
