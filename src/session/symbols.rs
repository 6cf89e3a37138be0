use crate::alerts::binance::fetch_spot_symbols;
use crate::config::{normalize_symbols, AlertsConfig, FALLBACK_SUPPORTED_SYMBOLS};
use reqwest::Client;
use std::collections::HashSet;
use tracing::{info, warn};

/// Lower-cased symbols a client may subscribe to.
#[derive(Debug, Clone, Default)]
pub struct SupportedSymbols {
    symbols: HashSet<String>,
}

impl SupportedSymbols {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            symbols: normalize_symbols(symbols).into_iter().collect(),
        }
    }

    pub fn fallback() -> Self {
        Self::new(FALLBACK_SUPPORTED_SYMBOLS)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(&symbol.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Configured list first, then the exchange's trading spot symbols, then the built-in list.
pub async fn resolve_supported_symbols(config: &AlertsConfig, client: &Client) -> SupportedSymbols {
    if let Some(configured) = &config.supported_symbols {
        info!(count = configured.len(), "using configured symbol list");
        return SupportedSymbols::new(configured);
    }

    match fetch_spot_symbols(client, &config.exchange_rest_url).await {
        Ok(symbols) => {
            info!(count = symbols.len(), "loaded spot symbols from exchange");
            SupportedSymbols::new(symbols)
        }
        Err(error) => {
            warn!(%error, "exchange symbol list unavailable, using built-in list");
            SupportedSymbols::fallback()
        }
    }
}
