use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::meta::read_u32;
use crate::{Error, KeyHasher, Result};

/// Width of the zero-padded underlying field in the fixed binary form.
const UNDERLYING_BYTES: usize = 8;

/// Kind of option contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Single-letter code used by the OCC text form.
    pub fn code(self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            b'C' => Some(OptionType::Call),
            b'P' => Some(OptionType::Put),
            _ => None,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Call => f.write_str("CALL"),
            OptionType::Put => f.write_str("PUT"),
        }
    }
}

/// Composite identifier of a listed option contract.
///
/// The canonical text form is the OCC layout: underlying ticker, expiration as
/// `yyMMdd`, `C` or `P`, and the strike multiplied by 1000 and zero-padded to
/// eight digits.
///
/// ```
/// use chrono::NaiveDate;
/// use optmap::{OptionSymbol, OptionType};
///
/// # fn main() -> optmap::Result<()> {
/// let expiration = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
/// let symbol = OptionSymbol::new("AAPL", OptionType::Call, expiration, 650_000)?;
/// assert_eq!(symbol.to_string(), "AAPL240621C00650000");
/// assert_eq!("AAPL240621C00650000".parse::<OptionSymbol>()?, symbol);
/// # Ok(())
/// # }
/// ```
///
/// Construction validates every component, so formatting never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptionSymbol {
    underlying: [u8; UNDERLYING_BYTES],
    option_type: OptionType,
    expiration: NaiveDate,
    strike_millis: u32,
}

impl OptionSymbol {
    /// Longest accepted underlying ticker.
    pub const MAX_UNDERLYING_LEN: usize = 6;
    /// Size of [`encode_fixed`](Self::encode_fixed) output.
    pub const FIXED_SIZE: usize = UNDERLYING_BYTES + 1 + 4 + 4;
    /// Largest strike, in thousandths, that fits the eight-digit text field.
    pub const MAX_STRIKE_MILLIS: u32 = 99_999_999;
    /// Shortest string [`FromStr`] will consider.
    pub const MIN_TEXT_LEN: usize = 15;

    /// Builds a symbol from a strike already expressed in thousandths.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the underlying is not 1-6
    /// uppercase ASCII letters, the expiration year falls outside 2000-2099,
    /// or the strike does not fit eight digits.
    pub fn new(
        underlying: &str,
        option_type: OptionType,
        expiration: NaiveDate,
        strike_millis: u32,
    ) -> Result<Self> {
        let underlying = Self::pack_underlying(underlying)?;
        if !(2000..=2099).contains(&expiration.year()) {
            return Err(Error::InvalidArgument(format!(
                "expiration year {} cannot be encoded as yy",
                expiration.year()
            )));
        }
        if strike_millis > Self::MAX_STRIKE_MILLIS {
            return Err(Error::InvalidArgument(format!(
                "strike {strike_millis} overflows 8 digits"
            )));
        }
        Ok(Self {
            underlying,
            option_type,
            expiration,
            strike_millis,
        })
    }

    /// Builds a symbol from a decimal strike, rounded to three places.
    pub fn with_strike(
        underlying: &str,
        option_type: OptionType,
        expiration: NaiveDate,
        strike: f64,
    ) -> Result<Self> {
        if !strike.is_finite() || strike < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "strike {strike} must be a non-negative number"
            )));
        }
        let millis = (strike * 1000.0).round();
        if millis > Self::MAX_STRIKE_MILLIS as f64 {
            return Err(Error::InvalidArgument(format!(
                "strike {strike} overflows 8 digits"
            )));
        }
        Self::new(underlying, option_type, expiration, millis as u32)
    }

    pub fn underlying(&self) -> &str {
        let len = self
            .underlying
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(UNDERLYING_BYTES);
        // Only uppercase ASCII is ever stored.
        std::str::from_utf8(&self.underlying[..len]).unwrap_or_default()
    }

    pub fn option_type(&self) -> OptionType {
        self.option_type
    }

    pub fn expiration(&self) -> NaiveDate {
        self.expiration
    }

    /// Strike price in thousandths of the quote currency.
    pub fn strike_millis(&self) -> u32 {
        self.strike_millis
    }

    pub fn strike(&self) -> f64 {
        self.strike_millis as f64 / 1000.0
    }

    /// Seeded 64-bit hash over all four components.
    pub fn hash64(&self) -> u64 {
        KeyHasher::default().hash(&self.encode_fixed())
    }

    /// Human readable rendering, e.g. `AAPL 2024-06-21 $650.00 CALL`.
    pub fn describe(&self) -> String {
        format!(
            "{} {} ${:.2} {}",
            self.underlying(),
            self.expiration.format("%Y-%m-%d"),
            self.strike(),
            self.option_type
        )
    }

    /// Serializes into the 17-byte storage layout.
    ///
    /// Layout: underlying padded with zeros to 8 bytes, the type code byte,
    /// the date packed as `(year - 2000) * 10000 + month * 100 + day` and the
    /// strike in thousandths, both as little-endian `u32`.
    pub fn encode_fixed(&self) -> [u8; Self::FIXED_SIZE] {
        let mut buf = [0u8; Self::FIXED_SIZE];
        buf[..8].copy_from_slice(&self.underlying);
        buf[8] = self.option_type.code() as u8;
        buf[9..13].copy_from_slice(&self.packed_date().to_le_bytes());
        buf[13..17].copy_from_slice(&self.strike_millis.to_le_bytes());
        buf
    }

    /// Inverse of [`encode_fixed`](Self::encode_fixed).
    pub fn decode_fixed(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::FIXED_SIZE {
            return Err(Error::InvalidArgument(format!(
                "fixed symbol must be {} bytes, got {}",
                Self::FIXED_SIZE,
                buf.len()
            )));
        }
        let len = buf[..8].iter().position(|&b| b == 0).unwrap_or(8);
        if buf[len..8].iter().any(|&b| b != 0) {
            return Err(Error::InvalidArgument(
                "underlying padding is not zeroed".to_string(),
            ));
        }
        let underlying = std::str::from_utf8(&buf[..len])
            .map_err(|_| Error::InvalidArgument("underlying is not ascii".to_string()))?;
        let option_type = OptionType::from_code(buf[8]).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown option type code {:#04x}", buf[8]))
        })?;
        let packed = read_u32(buf, 9);
        let year = 2000 + (packed / 10_000) as i32;
        let expiration = NaiveDate::from_ymd_opt(year, (packed / 100) % 100, packed % 100)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid packed date {packed}")))?;
        let strike_millis = read_u32(buf, 13);
        Self::new(underlying, option_type, expiration, strike_millis)
    }

    fn packed_date(&self) -> u32 {
        (self.expiration.year() - 2000) as u32 * 10_000
            + self.expiration.month() * 100
            + self.expiration.day()
    }

    fn pack_underlying(underlying: &str) -> Result<[u8; UNDERLYING_BYTES]> {
        let bytes = underlying.as_bytes();
        if bytes.is_empty()
            || bytes.len() > Self::MAX_UNDERLYING_LEN
            || !bytes.iter().all(u8::is_ascii_uppercase)
        {
            return Err(Error::InvalidArgument(format!(
                "underlying {underlying:?} must be 1-{} uppercase letters",
                Self::MAX_UNDERLYING_LEN
            )));
        }
        let mut packed = [0u8; UNDERLYING_BYTES];
        packed[..bytes.len()].copy_from_slice(bytes);
        Ok(packed)
    }
}

impl fmt::Display for OptionSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:02}{:02}{:02}{}{:08}",
            self.underlying(),
            self.expiration.year() - 2000,
            self.expiration.month(),
            self.expiration.day(),
            self.option_type.code(),
            self.strike_millis
        )
    }
}

impl FromStr for OptionSymbol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() < Self::MIN_TEXT_LEN {
            return Err(Error::Parse(format!(
                "{s:?} is shorter than {} characters",
                Self::MIN_TEXT_LEN
            )));
        }

        let ticker_len = bytes.iter().take_while(|b| b.is_ascii_uppercase()).count();
        if ticker_len == 0 || ticker_len > Self::MAX_UNDERLYING_LEN {
            return Err(Error::Parse(format!(
                "{s:?} must start with 1-{} uppercase letters",
                Self::MAX_UNDERLYING_LEN
            )));
        }

        let rest = &bytes[ticker_len..];
        if rest.len() < 8 {
            return Err(Error::Parse(format!("{s:?} is missing date or type")));
        }
        let (date, rest) = rest.split_at(6);
        if !date.iter().all(u8::is_ascii_digit) {
            return Err(Error::Parse(format!("{s:?} has a non-digit date")));
        }
        let digits = |d: &[u8]| d.iter().fold(0u32, |acc, b| acc * 10 + (b - b'0') as u32);
        let expiration = NaiveDate::from_ymd_opt(
            2000 + digits(&date[..2]) as i32,
            digits(&date[2..4]),
            digits(&date[4..6]),
        )
        .ok_or_else(|| Error::Parse(format!("{s:?} has an invalid date")))?;

        let option_type = OptionType::from_code(rest[0])
            .ok_or_else(|| Error::Parse(format!("{s:?} has a type other than C or P")))?;

        let strike = &rest[1..];
        if strike.is_empty() || strike.len() > 8 || !strike.iter().all(u8::is_ascii_digit) {
            return Err(Error::Parse(format!(
                "{s:?} must end with 1-8 strike digits"
            )));
        }

        Self::new(
            &s[..ticker_len],
            option_type,
            expiration,
            digits(strike),
        )
        .map_err(|e| Error::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_occ_text() {
        let symbol = OptionSymbol::with_strike("AAPL", OptionType::Call, date(2024, 6, 21), 650.0)
            .unwrap();
        assert_eq!(symbol.to_string(), "AAPL240621C00650000");
        assert_eq!(symbol.strike_millis(), 650_000);

        let parsed: OptionSymbol = "AAPL240621C00650000".parse().unwrap();
        assert_eq!(parsed, symbol);
        assert_eq!(parsed.underlying(), "AAPL");
        assert_eq!(parsed.option_type(), OptionType::Call);
        assert_eq!(parsed.expiration(), date(2024, 6, 21));
        assert_eq!(parsed.strike(), 650.0);

        let put = OptionSymbol::with_strike("V", OptionType::Put, date(2031, 1, 3), 12.25).unwrap();
        assert_eq!(put.to_string(), "V310103P00012250");
        assert_eq!(put.to_string().parse::<OptionSymbol>().unwrap(), put);
    }

    #[test]
    fn test_describe() {
        let symbol = OptionSymbol::new("AAPL", OptionType::Call, date(2024, 6, 21), 650_000)
            .unwrap();
        assert_eq!(symbol.describe(), "AAPL 2024-06-21 $650.00 CALL");
    }

    #[test]
    fn test_invalid_components() {
        let d = date(2025, 1, 17);
        OptionSymbol::with_strike("AAPL", OptionType::Call, d, -1.0).unwrap_err();
        OptionSymbol::with_strike("AAPL", OptionType::Call, d, f64::NAN).unwrap_err();
        OptionSymbol::with_strike("AAPL", OptionType::Call, d, 100_000.0).unwrap_err();
        OptionSymbol::with_strike("AAPL", OptionType::Call, d, 99_999.999).unwrap();
        OptionSymbol::new("AAPL", OptionType::Call, d, 100_000_000).unwrap_err();
        OptionSymbol::new("", OptionType::Call, d, 1).unwrap_err();
        OptionSymbol::new("GOOGLEX", OptionType::Call, d, 1).unwrap_err();
        OptionSymbol::new("aapl", OptionType::Call, d, 1).unwrap_err();
        OptionSymbol::new("BRK1", OptionType::Call, d, 1).unwrap_err();
        OptionSymbol::new("AAPL", OptionType::Call, date(1999, 12, 31), 1).unwrap_err();
        OptionSymbol::new("AAPL", OptionType::Call, date(2100, 1, 1), 1).unwrap_err();
    }

    #[test]
    fn test_parse_errors() {
        let cases = [
            "AAPL240621C006",        // too short
            "AAPL24O621C00650000",   // non-digit date
            "AAPL240621X00650000",   // bad type
            "AAPL241321C00650000",   // month 13
            "AAPL240621C00650000 ",  // trailing whitespace
            "AAPL240621C006500001",  // strike too long
            "240621C0065000000",     // no ticker
            "ABCDEFG240621C00650000", // ticker too long
            "aapl240621C00650000",   // lowercase
        ];
        for case in cases {
            match case.parse::<OptionSymbol>() {
                Err(Error::Parse(_)) => {}
                other => panic!("{case:?} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn test_fixed_layout() {
        let symbol = OptionSymbol::new("MSFT", OptionType::Put, date(2025, 1, 17), 100_000)
            .unwrap();
        let buf = symbol.encode_fixed();
        assert_eq!(buf.len(), 17);
        assert_eq!(&buf[..8], b"MSFT\0\0\0\0");
        assert_eq!(buf[8], b'P');
        assert_eq!(u32::from_le_bytes(buf[9..13].try_into().unwrap()), 250_117);
        assert_eq!(u32::from_le_bytes(buf[13..17].try_into().unwrap()), 100_000);
        assert_eq!(OptionSymbol::decode_fixed(&buf).unwrap(), symbol);

        OptionSymbol::decode_fixed(&buf[..16]).unwrap_err();
        let mut bad = buf;
        bad[8] = b'X';
        OptionSymbol::decode_fixed(&bad).unwrap_err();
        let mut bad = buf;
        bad[9..13].copy_from_slice(&251_301u32.to_le_bytes());
        OptionSymbol::decode_fixed(&bad).unwrap_err();
        let mut bad = buf;
        bad[6] = b'Z';
        OptionSymbol::decode_fixed(&bad).unwrap_err();
    }

    #[test]
    fn test_equality_and_hash() {
        let d = date(2025, 1, 17);
        let a = OptionSymbol::new("AAPL", OptionType::Call, d, 100_000).unwrap();
        let b = OptionSymbol::with_strike("AAPL", OptionType::Call, d, 100.0).unwrap();
        let c = OptionSymbol::new("AAPL", OptionType::Put, d, 100_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash64(), b.hash64());
        assert_ne!(a, c);
        assert_ne!(a.hash64(), c.hash64());
    }

    #[test]
    fn test_random_round_trip() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let tickers = ["AAPL", "MSFT", "GOOGL", "V", "NVDA", "BRKB"];
        for _ in 0..1000 {
            let ticker = tickers[rng.gen_range(0..tickers.len())];
            let option_type = if rng.r#gen() { OptionType::Call } else { OptionType::Put };
            let expiration = date(2024, 1, 1) + chrono::Days::new(rng.gen_range(0..3000));
            let strike = rng.gen_range(0..=OptionSymbol::MAX_STRIKE_MILLIS);
            let symbol = OptionSymbol::new(ticker, option_type, expiration, strike).unwrap();

            assert_eq!(symbol.to_string().parse::<OptionSymbol>().unwrap(), symbol);
            assert_eq!(OptionSymbol::decode_fixed(&symbol.encode_fixed()).unwrap(), symbol);
        }
    }
}
