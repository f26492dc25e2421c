mod cache;
mod distance;
mod normalizer;

pub use cache::{CatalogCache, CatalogError, CatalogSource, StaticCatalogSource};
pub(crate) use normalizer::{normalize_text, transliterate};

use serde::{Deserialize, Serialize};

use super::domain::{CatalogEntry, LineItem, SkuCode};
use distance::bounded_levenshtein;

/// Tuning for catalog matching and the confidence blend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub ocr_weight: f64,
    pub match_weight: f64,
    /// Hard ceiling on edits tolerated for any alias.
    pub max_edit_distance: usize,
    /// One edit is allowed per this many alias characters (0 disables the scaling).
    pub chars_per_edit: usize,
    /// Unit prices above this (minor units) are treated as OCR garbage and zeroed.
    pub max_unit_price: i64,
    /// Match quality credited to a manufacturer keyword hit when no alias matched.
    pub keyword_match_quality: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            ocr_weight: 0.6,
            match_weight: 0.4,
            max_edit_distance: 2,
            chars_per_edit: 4,
            max_unit_price: 100_000_000,
            keyword_match_quality: 0.9,
        }
    }
}

impl MatcherConfig {
    fn allowed_edits(&self, alias_len: usize) -> usize {
        if self.chars_per_edit == 0 {
            return self.max_edit_distance;
        }
        (alias_len / self.chars_per_edit).min(self.max_edit_distance)
    }

    fn blend(&self, ocr_confidence: f64, match_quality: f64) -> f64 {
        let total = self.ocr_weight + self.match_weight;
        if total <= 0.0 {
            return ocr_confidence.clamp(0.0, 1.0);
        }
        let blended = (self.ocr_weight * ocr_confidence + self.match_weight * match_quality) / total;
        blended.clamp(0.0, 1.0)
    }
}

/// A line candidate after intake validation; OCR clustering already happened upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct LineCandidate {
    pub raw_text: String,
    pub quantity: u32,
    pub unit_price: i64,
    pub ocr_confidence: f64,
}

/// Normalised text with its word count, in one script.
#[derive(Debug, Clone)]
struct Form {
    chars: Vec<char>,
    words: usize,
}

impl Form {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            words: text.split(' ').filter(|word| !word.is_empty()).count(),
        }
    }
}

#[derive(Debug, Clone)]
struct IndexedAlias {
    sku: SkuCode,
    native: Form,
    latin: Form,
}

#[derive(Debug, Clone)]
struct IndexedKeyword {
    sku: SkuCode,
    native: String,
    latin: String,
}

/// Immutable, pre-normalised view of the active catalog shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    aliases: Vec<IndexedAlias>,
    keywords: Vec<IndexedKeyword>,
    entries: usize,
}

impl CatalogSnapshot {
    pub fn new(entries: &[CatalogEntry]) -> Self {
        let mut aliases = Vec::new();
        let mut keywords = Vec::new();
        let mut active = 0;
        for entry in entries.iter().filter(|entry| entry.active) {
            active += 1;
            for alias in &entry.aliases {
                let normalized = normalize_text(alias);
                if normalized.is_empty() {
                    continue;
                }
                aliases.push(IndexedAlias {
                    sku: entry.sku.clone(),
                    latin: Form::new(&transliterate(&normalized)),
                    native: Form::new(&normalized),
                });
            }
            for keyword in &entry.keywords {
                let normalized = normalize_text(keyword);
                if normalized.is_empty() || normalized.contains(' ') {
                    continue;
                }
                keywords.push(IndexedKeyword {
                    sku: entry.sku.clone(),
                    latin: transliterate(&normalized),
                    native: normalized,
                });
            }
        }

        Self {
            aliases,
            keywords,
            entries: active,
        }
    }

    pub fn active_entries(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty() && self.keywords.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct AliasHit<'a> {
    alias: &'a IndexedAlias,
    distance: usize,
}

impl AliasHit<'_> {
    /// Lower distance wins; ties prefer the longer (more specific) alias, then the SKU code.
    fn beats(&self, other: &AliasHit<'_>) -> bool {
        let rank = |hit: &AliasHit<'_>| {
            (
                hit.distance,
                std::cmp::Reverse(hit.alias.native.chars.len()),
                hit.alias.sku.clone(),
            )
        };
        rank(self) < rank(other)
    }

    fn quality(&self) -> f64 {
        let len = self.alias.native.chars.len().max(1) as f64;
        (1.0 - (self.distance as f64 / len)).max(0.0)
    }
}

/// Pure mapping from OCR line candidates to catalog-coded line items.
#[derive(Debug, Clone)]
pub struct CatalogMatcher {
    config: MatcherConfig,
}

impl CatalogMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn match_lines(
        &self,
        candidates: &[LineCandidate],
        snapshot: &CatalogSnapshot,
    ) -> Vec<LineItem> {
        candidates
            .iter()
            .map(|candidate| self.match_line(candidate, snapshot))
            .collect()
    }

    pub fn match_line(&self, candidate: &LineCandidate, snapshot: &CatalogSnapshot) -> LineItem {
        let ocr_confidence = candidate.ocr_confidence.clamp(0.0, 1.0);
        let unit_price = if candidate.unit_price > self.config.max_unit_price {
            0
        } else {
            candidate.unit_price
        };

        let native = normalize_text(&candidate.raw_text);
        let latin = transliterate(&native);
        let line = LineText {
            native: LineForm::new(&native),
            latin: LineForm::new(&latin),
        };

        let best = snapshot
            .aliases
            .iter()
            .filter_map(|alias| self.score_alias(alias, &line))
            .fold(None::<AliasHit<'_>>, |best, hit| match best {
                Some(current) if !hit.beats(&current) => Some(current),
                _ => Some(hit),
            });

        let matched = match best {
            Some(hit) => Some((hit.alias.sku.clone(), hit.quality())),
            None => snapshot
                .keywords
                .iter()
                .find(|keyword| {
                    has_word_part(&native, &keyword.native)
                        || has_word_part(&latin, &keyword.latin)
                })
                .map(|keyword| (keyword.sku.clone(), self.config.keyword_match_quality)),
        };

        match matched {
            Some((sku, quality)) => LineItem {
                sku: Some(sku),
                raw_text: candidate.raw_text.clone(),
                quantity: candidate.quantity,
                unit_price,
                confidence: self.config.blend(ocr_confidence, quality),
            },
            None => LineItem {
                sku: None,
                raw_text: candidate.raw_text.clone(),
                quantity: candidate.quantity,
                unit_price,
                confidence: ocr_confidence,
            },
        }
    }

    /// Smallest distance between the alias and the line, comparing native script with native
    /// script and Latin with Latin.
    fn score_alias<'a>(
        &self,
        alias: &'a IndexedAlias,
        line: &LineText<'_>,
    ) -> Option<AliasHit<'a>> {
        let native = self.form_distance(&alias.native, &line.native);
        let latin = match native {
            Some(0) => None,
            _ => self.form_distance(&alias.latin, &line.latin),
        };
        let distance = match (native, latin) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }?;
        Some(AliasHit { alias, distance })
    }

    /// Distance to the whole line or to any run of words of the alias' word count, within the
    /// alias' edit allowance.
    fn form_distance(&self, alias: &Form, line: &LineForm<'_>) -> Option<usize> {
        let bound = self.config.allowed_edits(alias.chars.len());
        let mut best = bounded_levenshtein(&alias.chars, &line.chars, bound);

        if alias.words > 0 && line.words.len() > alias.words {
            for window in line.words.windows(alias.words) {
                let joined: Vec<char> = window.join(" ").chars().collect();
                if let Some(distance) = bounded_levenshtein(&alias.chars, &joined, bound) {
                    best = Some(best.map_or(distance, |current| current.min(distance)));
                    if distance == 0 {
                        break;
                    }
                }
            }
        }

        best
    }
}

struct LineForm<'a> {
    chars: Vec<char>,
    words: Vec<&'a str>,
}

impl<'a> LineForm<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().collect(),
            words: text.split(' ').filter(|word| !word.is_empty()).collect(),
        }
    }
}

struct LineText<'a> {
    native: LineForm<'a>,
    latin: LineForm<'a>,
}

/// Whether `keyword` appears as a manufacturer marker in normalised `text`: the first word of
/// the line, the tail of a hyphenated compound, after a product code or `№`, or after a long
/// Cyrillic product name. "Pharma Darnitsa" style mid-line mentions do not count.
fn has_word_part(text: &str, keyword: &str) -> bool {
    let words: Vec<&str> = text.split(' ').filter(|word| !word.is_empty()).collect();
    words.iter().enumerate().any(|(index, word)| {
        word.split('-').enumerate().any(|(part_index, part)| {
            if part != keyword {
                return false;
            }
            if index == 0 || part_index > 0 {
                return true;
            }
            let previous = words[index - 1];
            previous.ends_with(|ch: char| ch.is_ascii_digit() || ch == '-')
                || previous == "no"
                || (previous.chars().count() > 4 && previous.chars().any(is_cyrillic))
        })
    })
}

fn is_cyrillic(ch: char) -> bool {
    ('\u{0400}'..='\u{04FF}').contains(&ch)
}
