//! Symbol translation between canonical and exchange wire forms.

use std::sync::Arc;

use super::market::MarketDirectory;
use super::symbol::Symbol;

/// Letter case used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    /// `BTC`
    Upper,
    /// `btc`
    Lower,
}

impl Case {
    fn apply(self, text: &str) -> String {
        match self {
            Self::Upper => text.to_ascii_uppercase(),
            Self::Lower => text.to_ascii_lowercase(),
        }
    }
}

/// How an exchange spells a symbol when no directory entry overrides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireStyle {
    /// Legs joined by a separator, e.g. `BTC:USD` or `btc-eur`.
    Delimited {
        /// Separator between base and quote.
        separator: char,
        /// Letter case.
        case: Case,
    },
    /// Legs concatenated, e.g. `btceur`. Decoding needs a directory.
    Concatenated {
        /// Letter case.
        case: Case,
    },
}

/// Maps canonical symbols to an exchange's wire identifiers and back.
///
/// Directory entries take precedence over the style rule in both
/// directions. The codec holds no mutable state.
#[derive(Debug, Clone)]
pub struct SymbolCodec {
    style: WireStyle,
    directory: Option<Arc<MarketDirectory>>,
}

impl SymbolCodec {
    /// Creates a codec using only the style rule.
    #[must_use]
    pub fn new(style: WireStyle) -> Self {
        Self {
            style,
            directory: None,
        }
    }

    /// Attaches a market directory.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<MarketDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Returns the wire style.
    #[must_use]
    pub const fn style(&self) -> WireStyle {
        self.style
    }

    /// Translates a canonical symbol into the exchange identifier.
    #[must_use]
    pub fn encode(&self, symbol: &Symbol) -> String {
        if let Some(id) = self.directory.as_ref().and_then(|d| d.id(symbol)) {
            return id.to_string();
        }

        match self.style {
            WireStyle::Delimited { separator, case } => format!(
                "{}{}{}",
                case.apply(symbol.base()),
                separator,
                case.apply(symbol.quote())
            ),
            WireStyle::Concatenated { case } => {
                format!("{}{}", case.apply(symbol.base()), case.apply(symbol.quote()))
            }
        }
    }

    /// Translates an exchange identifier into the canonical symbol.
    ///
    /// Returns `None` when the identifier is neither in the directory nor
    /// decodable by the style rule.
    #[must_use]
    pub fn decode(&self, wire: &str) -> Option<Symbol> {
        if let Some(symbol) = self.directory.as_ref().and_then(|d| d.symbol(wire)) {
            return Some(symbol.clone());
        }

        match self.style {
            WireStyle::Delimited { separator, .. } => {
                let (base, quote) = wire.split_once(separator)?;
                Symbol::new(base, quote).ok()
            }
            WireStyle::Concatenated { .. } => None,
        }
    }
}
