//! Supported account currencies
//!
//! Accounts store the currency as its ISO-4217-like code. The caller layer
//! parses codes through [`Currency`] so only whitelisted codes reach the store.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unsupported currency: '{0}'")]
pub struct UnsupportedCurrency(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Currency {
    Usd,
    Eur,
    Inr,
    Cad,
    Bdt,
    Brl,
    Fjd,
    Jpy,
}

impl Currency {
    pub const ALL: [Currency; 8] = [
        Currency::Usd,
        Currency::Eur,
        Currency::Inr,
        Currency::Cad,
        Currency::Bdt,
        Currency::Brl,
        Currency::Fjd,
        Currency::Jpy,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Inr => "INR",
            Currency::Cad => "CAD",
            Currency::Bdt => "BDT",
            Currency::Brl => "BRL",
            Currency::Fjd => "FJD",
            Currency::Jpy => "JPY",
        }
    }

    /// Check a raw code without allocating an error
    pub fn is_supported(code: &str) -> bool {
        code.parse::<Currency>().is_ok()
    }
}

impl FromStr for Currency {
    type Err = UnsupportedCurrency;

    /// Codes are matched exactly: `"usd"` is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::ALL
            .into_iter()
            .find(|c| c.code() == s)
            .ok_or_else(|| UnsupportedCurrency(s.to_string()))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_supported_codes() {
        for currency in Currency::ALL {
            assert_eq!(currency.code().parse::<Currency>(), Ok(currency));
        }
    }

    #[test]
    fn test_reject_unknown_and_lowercase() {
        assert_eq!(
            "XYZ".parse::<Currency>(),
            Err(UnsupportedCurrency("XYZ".to_string()))
        );
        assert!(!Currency::is_supported("usd"));
        assert!(!Currency::is_supported(""));
    }

    #[test]
    fn test_display_is_code() {
        assert_eq!(Currency::Eur.to_string(), "EUR");
    }
}
