use std::fmt;

use serde::{Deserialize, Serialize};

/// Ukrainian mobile number in the 12-digit `380XXXXXXXXX` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Msisdn(String);

impl Msisdn {
    /// Strips formatting and coerces the common local notations to `380XXXXXXXXX`.
    pub fn parse(raw: &str) -> Result<Self, MsisdnError> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

        let normalized = match digits.len() {
            12 if digits.starts_with("380") => digits,
            11 if digits.starts_with("80") => format!("3{digits}"),
            10 if digits.starts_with('0') => format!("38{digits}"),
            9 => format!("380{digits}"),
            _ => return Err(MsisdnError::Unrecognized(raw.to_string())),
        };

        if normalized.as_bytes()[3] == b'0' {
            return Err(MsisdnError::Unrecognized(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-digit operator code following the country prefix.
    pub fn operator_code(&self) -> &str {
        &self.0[3..5]
    }

    pub fn operator(&self) -> Option<MobileOperator> {
        match self.operator_code() {
            "39" | "67" | "68" | "96" | "97" | "98" => Some(MobileOperator::Kyivstar),
            "50" | "66" | "95" | "99" => Some(MobileOperator::Vodafone),
            "63" | "73" | "93" => Some(MobileOperator::Lifecell),
            _ => None,
        }
    }

    /// Country and operator prefix plus the last two digits, for logs.
    pub fn masked(&self) -> String {
        format!("{}*****{}", &self.0[..5], &self.0[10..])
    }
}

impl fmt::Display for Msisdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MsisdnError {
    #[error("not a Ukrainian mobile number: {0:?}")]
    Unrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobileOperator {
    Kyivstar,
    Vodafone,
    Lifecell,
}

/// Provider payee ids per mobile operator, with a fallback for unknown prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayeeDirectory {
    pub default: Option<String>,
    pub kyivstar: Option<String>,
    pub vodafone: Option<String>,
    pub lifecell: Option<String>,
}

impl PayeeDirectory {
    pub fn payee_for(&self, msisdn: &Msisdn) -> Option<String> {
        let specific = match msisdn.operator() {
            Some(MobileOperator::Kyivstar) => self.kyivstar.as_ref(),
            Some(MobileOperator::Vodafone) => self.vodafone.as_ref(),
            Some(MobileOperator::Lifecell) => self.lifecell.as_ref(),
            None => None,
        };
        specific.or(self.default.as_ref()).cloned()
    }
}
