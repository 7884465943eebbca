// =============================================================================
// Canonical trading symbol — `BASE/QUOTE` plus exchange-native forms
// =============================================================================
//
// The canonical form travels on every bus message. Exchange-native spellings
// (`BTC-USDT` on OKX, `BTCUSDT` on Binance/Bybit) are derived at the Soldier
// boundary and never stored: the concatenated form is one-way, so the
// canonical symbol must be carried alongside any exchange-native use.
// =============================================================================

use serde::{Deserialize, Serialize};

/// A spot trading pair in canonical `BASE/QUOTE` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Parse the canonical `BASE/QUOTE` form. Both sides must be non-empty;
    /// the result is uppercased.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("symbol '{s}' is not in BASE/QUOTE form"))?;
        if base.is_empty() || quote.is_empty() {
            anyhow::bail!("symbol '{s}' has an empty base or quote");
        }
        if quote.contains('/') {
            anyhow::bail!("symbol '{s}' has more than one separator");
        }
        Ok(Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        })
    }

    /// Parse an OKX instrument id (`BTC-USDT`) back to canonical form.
    pub fn from_okx(inst_id: &str) -> anyhow::Result<Self> {
        let (base, quote) = inst_id
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("instId '{inst_id}' is not in BASE-QUOTE form"))?;
        Self::parse(&format!("{base}/{quote}"))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// OKX native form: `BTC-USDT`. Round-trips via [`Symbol::from_okx`].
    pub fn to_okx(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }

    /// Binance native form: `BTCUSDT`. One-way.
    pub fn to_binance(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Bybit native form: `BTCUSDT`. One-way.
    pub fn to_bybit(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl TryFrom<String> for Symbol {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> Self {
        s.to_string()
    }
}
