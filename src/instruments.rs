//! Logical instrument identifiers for the upstream feed.
//!
//! The feed collaborator accepts logical ids and resolves them to live
//! contracts itself: the spot index is `NIFTY_SPOT`, option legs are
//! `NIFTY_<strike>_<CE|PE>_<WEEKLY|MONTHLY>`. Leg ids carry the tenor rather
//! than a date, so an expiry rollover re-subscribes the same ids and the
//! upstream re-resolves them to the next contract.

pub const SPOT_INSTRUMENT: &str = "NIFTY_SPOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSide {
    Call,
    Put,
}

impl OptionSide {
    pub fn code(&self) -> &'static str {
        match self {
            OptionSide::Call => "CE",
            OptionSide::Put => "PE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tenor {
    Weekly,
    Monthly,
}

impl Tenor {
    pub fn code(&self) -> &'static str {
        match self {
            Tenor::Weekly => "WEEKLY",
            Tenor::Monthly => "MONTHLY",
        }
    }
}

pub fn option_leg(strike: f64, side: OptionSide, tenor: Tenor) -> String {
    format!("NIFTY_{}_{}_{}", strike as i64, side.code(), tenor.code())
}

/// The four option legs tracked for a given ATM strike.
pub fn legs_for_strike(strike: f64) -> [String; 4] {
    [
        option_leg(strike, OptionSide::Call, Tenor::Weekly),
        option_leg(strike, OptionSide::Put, Tenor::Weekly),
        option_leg(strike, OptionSide::Call, Tenor::Monthly),
        option_leg(strike, OptionSide::Put, Tenor::Monthly),
    ]
}
