//! Amounts, coin-hour accrual and droplet precision
//!
//! Coins are counted in droplets, the smallest indivisible unit. Every
//! arithmetic helper here is overflow-checked and fails closed.

use crate::error::VerificationError;

/// Number of decimal places in one coin.
pub const DROPLET_DECIMALS: u8 = 6;

/// Droplets in one whole coin.
pub const DROPLETS_PER_COIN: u64 = 1_000_000;

/// Seconds in one coin-hour accrual step.
pub const SECONDS_PER_HOUR: u64 = 3600;

/// Checked addition that names the quantity that overflowed.
pub fn add(a: u64, b: u64, what: &'static str) -> Result<u64, VerificationError> {
    a.checked_add(b).ok_or(VerificationError::Overflow(what))
}

/// Sums an iterator of amounts, failing on overflow.
pub fn sum<I>(values: I, what: &'static str) -> Result<u64, VerificationError>
where
    I: IntoIterator<Item = u64>,
{
    values.into_iter().try_fold(0u64, |acc, v| add(acc, v, what))
}

/// Coin hours earned by `coins` droplets held from `head_time` until
/// `current_time`, counting whole elapsed hours only.
///
/// A `current_time` earlier than `head_time` earns nothing.
pub fn accrued_hours(coins: u64, head_time: u64, current_time: u64) -> Result<u64, VerificationError> {
    let elapsed_hours = current_time.saturating_sub(head_time) / SECONDS_PER_HOUR;
    let accrued = (coins as u128) * (elapsed_hours as u128) / (DROPLETS_PER_COIN as u128);
    u64::try_from(accrued).map_err(|_| VerificationError::Overflow("coin hours"))
}

/// Total coin hours of an output at `current_time`: the balance it was
/// created with plus whatever it has accrued since.
pub fn coin_hours_at(
    coins: u64,
    hours: u64,
    head_time: u64,
    current_time: u64,
) -> Result<u64, VerificationError> {
    add(hours, accrued_hours(coins, head_time, current_time)?, "coin hours")
}

/// Hours that must be destroyed when spending `input_hours`.
pub fn required_burn(input_hours: u64, burn_factor: u64) -> u64 {
    if burn_factor == 0 {
        return 0;
    }
    input_hours / burn_factor
}

/// Whether `coins` uses no more than `max_decimals` decimal places of a coin.
pub fn has_valid_precision(coins: u64, max_decimals: u8) -> bool {
    if max_decimals >= DROPLET_DECIMALS {
        return true;
    }
    let step = 10u64.pow(u32::from(DROPLET_DECIMALS - max_decimals));
    coins % step == 0
}

/// Renders droplets as a decimal coin string, e.g. `1500000` -> `"1.5"`.
pub fn droplets_to_string(droplets: u64) -> String {
    let whole = droplets / DROPLETS_PER_COIN;
    let frac = droplets % DROPLETS_PER_COIN;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:06}", frac);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
