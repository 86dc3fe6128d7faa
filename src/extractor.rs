//! Token mention extraction from comment and message text

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Symbol → number of occurrences, summed over every text of one item
pub type MentionCounts = BTreeMap<String, i64>;

// $SYMBOL: a letter followed by 1-9 letters/digits
static CASHTAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\$([a-z][a-z0-9]{1,9})\b").expect("valid cashtag regex"));

/// Which tokens in free text count as a symbol mention
#[derive(Debug, Clone)]
pub enum SymbolVocabulary {
    /// Any `$SYMBOL` cashtag
    Cashtags,
    /// Whole-word matches of a fixed keyword list
    Keywords(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct MentionParser {
    matchers: Matchers,
}

#[derive(Debug, Clone)]
enum Matchers {
    Cashtags,
    Keywords(Vec<(String, Regex)>),
}

impl MentionParser {
    pub fn new(vocabulary: SymbolVocabulary) -> Self {
        let matchers = match vocabulary {
            SymbolVocabulary::Cashtags => Matchers::Cashtags,
            SymbolVocabulary::Keywords(keywords) => Matchers::Keywords(
                keywords
                    .iter()
                    .filter_map(|k| keyword_matcher(k))
                    .collect(),
            ),
        };
        Self { matchers }
    }

    pub fn cashtags() -> Self {
        Self::new(SymbolVocabulary::Cashtags)
    }

    /// Count every symbol occurrence in one text
    pub fn parse(&self, text: &str) -> MentionCounts {
        let mut counts = MentionCounts::new();
        self.accumulate(text, &mut counts);
        counts
    }

    /// Count symbol occurrences across all texts of one content item
    pub fn parse_all<'a, I>(&self, texts: I) -> MentionCounts
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts = MentionCounts::new();
        for text in texts {
            self.accumulate(text, &mut counts);
        }
        counts
    }

    fn accumulate(&self, text: &str, counts: &mut MentionCounts) {
        match &self.matchers {
            Matchers::Cashtags => {
                for cap in CASHTAG_PATTERN.captures_iter(text) {
                    *counts.entry(cap[1].to_uppercase()).or_insert(0) += 1;
                }
            }
            Matchers::Keywords(keywords) => {
                for (symbol, pattern) in keywords {
                    let n = pattern.find_iter(text).count() as i64;
                    if n > 0 {
                        *counts.entry(symbol.clone()).or_insert(0) += n;
                    }
                }
            }
        }
    }
}

fn keyword_matcher(keyword: &str) -> Option<(String, Regex)> {
    let bare = keyword.trim().trim_start_matches(['$', '#']);
    if bare.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i)\b{}\b", regex::escape(bare));
    Regex::new(&pattern).ok().map(|re| (bare.to_uppercase(), re))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cashtag_counts_every_occurrence() {
        let counts = MentionParser::cashtags().parse("this $BONK is mooning, $BONK to the moon");
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["BONK"], 2);
    }

    #[test]
    fn test_cashtag_case_insensitive() {
        let counts = MentionParser::cashtags().parse("$wif $WIF $Wif and $sol");
        assert_eq!(counts["WIF"], 3);
        assert_eq!(counts["SOL"], 1);
    }

    #[test]
    fn test_dollar_amounts_ignored() {
        let counts = MentionParser::cashtags().parse("bought $100 worth at $0.002");
        assert!(counts.is_empty());
    }

    #[test]
    fn test_parse_all_sums_across_comments() {
        let parser = MentionParser::cashtags();
        let comments = ["$BONK!", "aping $bonk and $WIF", "nothing here"];
        let counts = parser.parse_all(comments.iter().copied());
        assert_eq!(counts["BONK"], 2);
        assert_eq!(counts["WIF"], 1);
    }

    #[test]
    fn test_empty_text_yields_empty_map() {
        assert!(MentionParser::cashtags().parse("").is_empty());
        let parser = MentionParser::new(SymbolVocabulary::Keywords(vec!["bonk".into()]));
        assert!(parser.parse_all(Vec::<&str>::new()).is_empty());
    }

    #[test]
    fn test_keyword_vocabulary() {
        let parser = MentionParser::new(SymbolVocabulary::Keywords(vec![
            "bonk".into(),
            "$WIF".into(),
            "#popcat".into(),
        ]));
        let counts = parser.parse("BONK bonk $bonk bonkers wif #POPCAT");
        assert_eq!(counts["BONK"], 3);
        assert_eq!(counts["WIF"], 1);
        assert_eq!(counts["POPCAT"], 1);
    }

    #[test]
    fn test_blank_keywords_skipped() {
        let parser = MentionParser::new(SymbolVocabulary::Keywords(vec!["  ".into(), "$".into()]));
        assert!(parser.parse("$ anything").is_empty());
    }
}
