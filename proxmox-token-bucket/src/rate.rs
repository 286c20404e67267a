use crate::Error;

/// Time unit of a [`Rate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Microsecond,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    /// 30 days
    Month,
    /// 365 days
    Year,
}

impl TimeUnit {
    /// Length of the unit in microseconds.
    pub const fn micros(self) -> u64 {
        const SECOND: u64 = 1_000_000;
        const DAY: u64 = 86_400 * SECOND;
        match self {
            TimeUnit::Microsecond => 1,
            TimeUnit::Millisecond => 1_000,
            TimeUnit::Second => SECOND,
            TimeUnit::Minute => 60 * SECOND,
            TimeUnit::Hour => 3_600 * SECOND,
            TimeUnit::Day => DAY,
            TimeUnit::Week => 7 * DAY,
            TimeUnit::Month => 30 * DAY,
            TimeUnit::Year => 365 * DAY,
        }
    }
}

/// Token production rate: `tokens` per period.
///
/// Internally the rate is kept as a fraction, so rates which do not divide
/// a microsecond evenly (for example 100 KiB/s of byte tokens) stay exact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rate {
    tokens: u64,
    period_micros: u64,
}

impl Rate {
    pub fn new(tokens: u64, unit: TimeUnit) -> Result<Self, Error> {
        if tokens == 0 {
            return Err(Error::InvalidConfiguration(
                "rate must produce at least one token".to_string(),
            ));
        }
        Ok(Self {
            tokens,
            period_micros: unit.micros(),
        })
    }

    pub fn per_second(tokens: u64) -> Result<Self, Error> {
        Self::new(tokens, TimeUnit::Second)
    }

    /// One token every `refill_micros` microseconds.
    pub fn from_refill_micros(refill_micros: u64) -> Result<Self, Error> {
        if refill_micros == 0 {
            return Err(Error::InvalidConfiguration(
                "refill interval must be at least one microsecond".to_string(),
            ));
        }
        Ok(Self {
            tokens: 1,
            period_micros: refill_micros,
        })
    }

    /// Tokens produced per period.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Length of the period in microseconds.
    pub fn period_micros(&self) -> u64 {
        self.period_micros
    }

    /// Exact (possibly fractional) microseconds needed to produce one token.
    pub fn micros_per_token(&self) -> f64 {
        self.period_micros as f64 / self.tokens as f64
    }

    /// Microseconds per token, rounded to an integer (at least 1).
    pub fn refill_micros(&self) -> u64 {
        (self.micros_per_token().round() as u64).max(1)
    }

    pub fn tokens_per_second(&self) -> f64 {
        1_000_000.0 / self.micros_per_token()
    }
}
