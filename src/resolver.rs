//! Symbol → token id resolution

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::info;

use crate::db::{Mention, TokenReference};
use crate::extractor::MentionCounts;

/// In-memory multimap from upper-cased symbol to every token id carrying it.
/// Built once per run from the token reference table.
#[derive(Debug, Default, Clone)]
pub struct SymbolResolver {
    by_symbol: HashMap<String, Vec<i64>>,
}

impl SymbolResolver {
    pub fn from_tokens(tokens: &[TokenReference]) -> Self {
        let mut by_symbol: HashMap<String, Vec<i64>> = HashMap::new();
        for token in tokens {
            by_symbol
                .entry(token.symbol.trim().to_uppercase())
                .or_default()
                .push(token.id);
        }
        for ids in by_symbol.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }
        Self { by_symbol }
    }

    pub fn token_ids(&self, symbol: &str) -> &[i64] {
        self.by_symbol
            .get(&symbol.to_uppercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn symbol_count(&self) -> usize {
        self.by_symbol.len()
    }

    /// One mention row per (symbol, token id). Unknown symbols are dropped:
    /// slang and unlisted tickers are expected, not errors.
    pub fn resolve(
        &self,
        content_id: &str,
        counts: &MentionCounts,
        mention_at: DateTime<Utc>,
    ) -> Vec<Mention> {
        let mut mentions = Vec::new();
        for (symbol, count) in counts {
            let ids = self.token_ids(symbol);
            if ids.is_empty() {
                info!(content_id, symbol = %symbol, "Token not found for symbol");
                continue;
            }
            mentions.extend(ids.iter().map(|&token_id| Mention {
                content_id: content_id.to_string(),
                token_id,
                count: *count,
                mention_at,
            }));
        }
        mentions
    }
}
