//! Symbol normalization
//!
//! Exchanges name the same market differently: Binance and Bybit use the
//! undelimited `BTCUSDT`, OKX uses `BTC-USDT` (and `BTC-USDT-SWAP` for
//! perpetuals), users write `BTC/USDT`. Internally every market is the
//! upper-case concatenation of base and quote.

use std::fmt;

use thiserror::Error;

/// Quote assets recognized in undelimited notation.
pub const KNOWN_QUOTES: [&str; 9] = [
    "USDT", "USDC", "BUSD", "USD", "BTC", "ETH", "BNB", "DAI", "TUSD",
];

const DELIMITERS: [char; 3] = ['/', '-', '_'];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SymbolError {
    #[error("empty symbol")]
    Empty,

    #[error("symbol '{0}' has an empty base or quote component")]
    EmptyComponent(String),

    #[error("symbol '{input}' contains invalid character '{ch}'")]
    InvalidCharacter { input: String, ch: char },

    #[error("symbol '{0}' does not end with a known quote asset (expected one of USDT, USDC, BUSD, USD, BTC, ETH, BNB, DAI, TUSD)")]
    UnknownQuote(String),

    #[error("symbol '{input}' reads back as '{reads_as}' once the delimiter is dropped")]
    Ambiguous { input: String, reads_as: String },
}

/// A trading pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    pub fn new(base: &str, quote: &str) -> Result<Self, SymbolError> {
        if base.is_empty() || quote.is_empty() {
            return Err(SymbolError::EmptyComponent(format!("{base}/{quote}")));
        }
        let input = format!("{base}/{quote}");
        check_chars(&input, base)?;
        check_chars(&input, quote)?;
        Ok(Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Internal (undelimited) representation, e.g. `BTCUSDT`.
    pub fn internal(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// `BASE{sep}QUOTE`
    pub fn delimited(&self, sep: char) -> String {
        format!("{}{}{}", self.base, sep, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

impl std::str::FromStr for Symbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_symbol(s)
    }
}

/// Parse a symbol in delimited or native undelimited notation.
///
/// Delimited input is split on the first delimiter; a trailing instrument
/// type segment (`BTC-USDT-SWAP`) is ignored. Undelimited input is matched
/// against [`KNOWN_QUOTES`] by longest suffix that leaves a non-empty base.
pub fn parse_symbol(raw: &str) -> Result<Symbol, SymbolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SymbolError::Empty);
    }

    if trimmed.contains(DELIMITERS) {
        let mut parts = trimmed.split(DELIMITERS);
        let base = parts.next().unwrap_or_default();
        let quote = parts.next().unwrap_or_default();
        if base.is_empty() || quote.is_empty() {
            return Err(SymbolError::EmptyComponent(trimmed.to_string()));
        }
        check_chars(trimmed, base)?;
        check_chars(trimmed, quote)?;
        return Ok(Symbol {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        });
    }

    check_chars(trimmed, trimmed)?;
    let upper = trimmed.to_ascii_uppercase();

    KNOWN_QUOTES
        .iter()
        .filter(|quote| upper.len() > quote.len() && upper.ends_with(*quote))
        .max_by_key(|quote| quote.len())
        .map(|quote| Symbol {
            base: upper[..upper.len() - quote.len()].to_string(),
            quote: quote.to_string(),
        })
        .ok_or(SymbolError::UnknownQuote(trimmed.to_string()))
}

/// Canonical internal form (`BTCUSDT`) of any accepted notation.
///
/// The internal form carries no delimiter, so it is only produced when it
/// parses back to the same pair: the quote must be known and no longer
/// known quote may swallow the end of the base.
pub fn normalize(raw: &str) -> Result<String, SymbolError> {
    let symbol = parse_symbol(raw)?;
    if !KNOWN_QUOTES.contains(&symbol.quote()) {
        return Err(SymbolError::UnknownQuote(raw.trim().to_string()));
    }
    let internal = symbol.internal();
    match parse_symbol(&internal) {
        Ok(back) if back == symbol => Ok(internal),
        Ok(back) => Err(SymbolError::Ambiguous {
            input: raw.trim().to_string(),
            reads_as: back.delimited('/'),
        }),
        Err(_) => Err(SymbolError::UnknownQuote(raw.trim().to_string())),
    }
}

/// Slash-delimited form (`BTC/USDT`) of any accepted notation.
pub fn to_delimited(raw: &str) -> Result<String, SymbolError> {
    parse_symbol(raw).map(|s| s.delimited('/'))
}

fn check_chars(input: &str, part: &str) -> Result<(), SymbolError> {
    match part.chars().find(|c| !c.is_ascii_alphanumeric()) {
        Some(ch) => Err(SymbolError::InvalidCharacter {
            input: input.to_string(),
            ch,
        }),
        None => Ok(()),
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn quote() -> impl Strategy<Value = &'static str> {
        prop::sample::select(KNOWN_QUOTES.to_vec())
    }

    proptest! {
        #[test]
        fn prop_delimited_round_trip(base in "[A-Z0-9]{1,10}", quote in "[A-Z]{2,5}") {
            let raw = format!("{base}/{quote}");
            prop_assert_eq!(to_delimited(&raw).unwrap(), raw.clone());
            match normalize(&raw) {
                Ok(once) => {
                    let twice = normalize(&to_delimited(&once).unwrap()).unwrap();
                    prop_assert_eq!(twice, once);
                }
                Err(SymbolError::UnknownQuote(_)) => {
                    prop_assert!(!KNOWN_QUOTES.contains(&quote.as_str()));
                }
                Err(SymbolError::Ambiguous { .. }) => {
                    prop_assert!(KNOWN_QUOTES.contains(&quote.as_str()));
                }
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }

        #[test]
        fn prop_normalize_is_stable(base in "[A-Z]{1,8}", quote in quote()) {
            let raw = format!("{base}{quote}");
            let once = normalize(&raw).unwrap();
            let twice = normalize(&to_delimited(&once).unwrap()).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_undelimited_parses_exact_pair(base in "[A-Z]{1,8}", quote in quote()) {
            let raw = format!("{base}{quote}");
            // skip concatenations where a longer known quote also matches
            // (e.g. "XT" + "USD" reads as "X" + "TUSD")
            prop_assume!(!KNOWN_QUOTES.iter().any(|other| {
                other.len() > quote.len() && raw.len() > other.len() && raw.ends_with(other)
            }));
            let parsed = parse_symbol(&raw).unwrap();
            prop_assert_eq!(parsed.base(), base.as_str());
            prop_assert_eq!(parsed.quote(), quote);
        }

        #[test]
        fn prop_unknown_suffix_fails(raw in "[A-Z]{0,8}QQ") {
            prop_assert!(matches!(parse_symbol(&raw), Err(SymbolError::UnknownQuote(_))));
        }
    }
}
